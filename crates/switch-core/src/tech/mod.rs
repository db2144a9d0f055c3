//! Channel technology interface
//!
//! Every kind of endpoint (trunk hardware, network protocol, internal
//! virtual endpoint) plugs into the core by implementing [`ChannelTech`].
//! The channel owns an opaque technology-private state handle ([`TechPvt`])
//! that masquerade moves together with the technology.
//!
//! Technology callbacks are invoked without the channel lock held, except
//! [`ChannelTech::fixup`] which runs inside a masquerade and must not call
//! back into the registry's allocation, masquerade or hang-up paths.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rvoip_media_core::{ControlKind, DtmfDigit, Frame, FormatSet, FrameList};

use crate::channel::Channel;
use crate::error::{Result, SwitchError};
use crate::registry::ChannelRegistry;

pub mod holding;
pub mod mock;

/// Opaque technology-private state
pub type TechPvt = Arc<dyn Any + Send + Sync>;

/// The channel and the private state a technology callback operates on
///
/// Both are captured together so a masquerade racing with the callback can
/// never hand a technology another technology's private state.
#[derive(Clone)]
pub struct TechCall {
    channel: Arc<Channel>,
    pvt: Option<TechPvt>,
}

impl TechCall {
    pub(crate) fn new(channel: Arc<Channel>, pvt: Option<TechPvt>) -> Self {
        Self { channel, pvt }
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Downcast the private state to the technology's own type
    pub fn pvt<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.pvt.clone()?.downcast::<T>().ok()
    }
}

impl fmt::Debug for TechCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TechCall")
            .field("channel", &self.channel.name())
            .field("has_pvt", &self.pvt.is_some())
            .finish()
    }
}

/// Static properties of a technology
#[derive(Debug, Clone, Copy, Default)]
pub struct TechProperties {
    /// Received voice arrives at a steady rate, so reads pace generators
    /// instead of a core timer
    pub paced_by_voice: bool,
    /// Writes from the application interrupt an active generator
    pub write_interrupts_generator: bool,
    /// Smooth received audio through the configured jitter buffer
    pub jitter_buffer: bool,
}

/// Result of a technology read
#[derive(Debug)]
pub enum TechRead {
    /// One or more frames, in order
    Frames(FrameList),
    /// Nothing available; the driver will queue or signal later
    Pending,
    /// The endpoint is gone
    Hangup,
}

/// Whether a technology signalled a digit itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigitHandling {
    /// Signalled out of band by the technology
    Native,
    /// The core must play the tone in band
    Unsupported,
}

/// Options a technology may expose
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOption {
    /// In-band DTMF detection on received audio
    InbandDtmf(bool),
    /// Echo cancellation
    EchoCancel(bool),
    /// Receive gain in dB
    RxGain(i8),
    /// Transmit gain in dB
    TxGain(i8),
    /// Technology specific key/value option
    Custom(String, String),
}

/// Keys for [`ChannelTech::get_option`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionKey {
    InbandDtmf,
    EchoCancel,
    RxGain,
    TxGain,
    Custom(String),
}

/// Capability set every channel technology implements
pub trait ChannelTech: Send + Sync + 'static {
    /// Technology name, the prefix of channel names ("DAHDI", "Local")
    fn type_name(&self) -> &'static str;

    fn description(&self) -> &'static str {
        ""
    }

    /// Formats the technology can carry
    fn capabilities(&self) -> FormatSet;

    fn properties(&self) -> TechProperties {
        TechProperties::default()
    }

    /// Place an outgoing call to `destination`
    fn call(&self, call: &TechCall, destination: &str, timeout: Duration) -> Result<()> {
        let _ = (call, destination, timeout);
        Err(SwitchError::unsupported(self.type_name(), "call"))
    }

    /// Tear down the endpoint
    fn hangup(&self, call: &TechCall) -> Result<()>;

    fn answer(&self, call: &TechCall) -> Result<()> {
        let _ = call;
        Ok(())
    }

    /// Pull frames from the endpoint when the channel queue is empty
    fn read(&self, call: &TechCall) -> TechRead {
        let _ = call;
        TechRead::Pending
    }

    /// Send a voice, video or text frame to the endpoint
    fn write(&self, call: &TechCall, frame: &Frame) -> Result<()>;

    fn send_text(&self, call: &TechCall, text: &str) -> Result<()> {
        let _ = (call, text);
        Err(SwitchError::unsupported(self.type_name(), "send_text"))
    }

    /// Indicate a condition to the endpoint. Returning an error for
    /// ringing, busy or congestion makes the core play the tone in band.
    fn indicate(&self, call: &TechCall, condition: ControlKind, data: &[u8]) -> Result<()> {
        let _ = (call, condition, data);
        Err(SwitchError::unsupported(self.type_name(), "indicate"))
    }

    /// The technology's state moved from `old` to `new` during a masquerade
    fn fixup(&self, old: &Arc<Channel>, new: &Arc<Channel>, pvt: Option<&TechPvt>) -> Result<()> {
        let _ = (old, new, pvt);
        Ok(())
    }

    fn send_digit_begin(&self, call: &TechCall, digit: DtmfDigit) -> Result<DigitHandling> {
        let _ = (call, digit);
        Ok(DigitHandling::Unsupported)
    }

    fn send_digit_end(&self, call: &TechCall, digit: DtmfDigit, duration_ms: u32) -> Result<DigitHandling> {
        let _ = (call, digit, duration_ms);
        Ok(DigitHandling::Unsupported)
    }

    fn set_option(&self, call: &TechCall, option: &ChannelOption) -> Result<()> {
        let _ = (call, option);
        Err(SwitchError::unsupported(self.type_name(), "set_option"))
    }

    fn get_option(&self, call: &TechCall, key: &OptionKey) -> Result<ChannelOption> {
        let _ = (call, key);
        Err(SwitchError::unsupported(self.type_name(), "get_option"))
    }
}

/// Factory for outgoing channels of one technology
pub trait ChannelDriver: Send + Sync + 'static {
    fn type_name(&self) -> &'static str;

    /// Create a channel for `data` (technology specific dial string)
    fn request(self: Arc<Self>, registry: &Arc<ChannelRegistry>, data: &str, formats: FormatSet) -> Result<Arc<Channel>>;
}
