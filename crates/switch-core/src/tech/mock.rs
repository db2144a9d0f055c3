//! In-memory channel technology
//!
//! `MockTech` records everything the core sends to an endpoint and lets
//! callers feed frames back, which makes it the technology of choice for
//! tests and the demo binary. Each channel gets its own [`MockEndpoint`] as
//! technology-private state, so an endpoint follows its channel's identity
//! through a masquerade.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rvoip_media_core::{ControlKind, DtmfDigit, Format, FormatSet, Frame};
use tracing::debug;

use super::{ChannelDriver, ChannelTech, DigitHandling, TechCall, TechProperties, TechRead};
use crate::channel::{Channel, ChannelState};
use crate::error::{Result, SwitchError};
use crate::registry::ChannelRegistry;

/// What an endpoint has been sent
#[derive(Debug, Clone, Default)]
pub struct MockLog {
    pub written: Vec<Frame>,
    pub indications: Vec<ControlKind>,
    pub digits_begun: Vec<DtmfDigit>,
    pub digits_ended: Vec<(DtmfDigit, u32)>,
    pub texts: Vec<String>,
    pub calls: Vec<String>,
    pub answers: usize,
    pub hangups: usize,
    pub fixups: usize,
}

/// One simulated endpoint
#[derive(Debug)]
pub struct MockEndpoint {
    label: String,
    log: Mutex<MockLog>,
    inbound: Mutex<VecDeque<Frame>>,
}

impl MockEndpoint {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            log: Mutex::new(MockLog::default()),
            inbound: Mutex::new(VecDeque::new()),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn log(&self) -> MockLog {
        self.log.lock().clone()
    }

    pub fn written(&self) -> Vec<Frame> {
        self.log.lock().written.clone()
    }

    pub fn indications(&self) -> Vec<ControlKind> {
        self.log.lock().indications.clone()
    }

    pub fn hangups(&self) -> usize {
        self.log.lock().hangups
    }

    pub fn clear(&self) {
        *self.log.lock() = MockLog::default();
    }

    /// Frame the technology hands up on its next read
    pub fn push_inbound(&self, frame: Frame) {
        self.inbound.lock().push_back(frame);
    }
}

/// Recording channel technology
pub struct MockTech {
    type_name: &'static str,
    capabilities: FormatSet,
    properties: TechProperties,
    native_digits: bool,
    native_indications: bool,
    fail_writes: AtomicBool,
    fail_fixups: AtomicBool,
    endpoints: DashMap<String, Arc<MockEndpoint>>,
    next_request: AtomicU64,
}

impl MockTech {
    /// Technology carrying G.711 u-law and signed linear audio
    pub fn new(type_name: &'static str) -> Self {
        Self {
            type_name,
            capabilities: FormatSet::from_formats(&[Format::Ulaw, Format::Slin8]),
            properties: TechProperties::default(),
            native_digits: false,
            native_indications: true,
            fail_writes: AtomicBool::new(false),
            fail_fixups: AtomicBool::new(false),
            endpoints: DashMap::new(),
            next_request: AtomicU64::new(1),
        }
    }

    pub fn with_capabilities(mut self, capabilities: FormatSet) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_properties(mut self, properties: TechProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Signal digits out of band instead of having the core play tones
    pub fn with_native_digits(mut self, native: bool) -> Self {
        self.native_digits = native;
        self
    }

    /// Accept indications; when false the core falls back to in-band tones
    pub fn with_native_indications(mut self, native: bool) -> Self {
        self.native_indications = native;
        self
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make masquerade fixups fail
    pub fn set_fail_fixups(&self, fail: bool) {
        self.fail_fixups.store(fail, Ordering::SeqCst);
    }

    /// Create a registered channel with a fresh endpoint
    pub fn create(
        self: &Arc<Self>,
        registry: &Arc<ChannelRegistry>,
        name: &str,
    ) -> Result<(Arc<Channel>, Arc<MockEndpoint>)> {
        let endpoint = MockEndpoint::new(name);
        let channel = registry
            .channel(self.clone(), name)
            .pvt(endpoint.clone())
            .state(ChannelState::Up)
            .build()?;
        self.endpoints.insert(channel.name(), endpoint.clone());
        Ok((channel, endpoint))
    }

    /// Endpoint created for the channel originally named `name`
    pub fn endpoint(&self, name: &str) -> Option<Arc<MockEndpoint>> {
        self.endpoints.get(name).map(|e| e.value().clone())
    }

    fn endpoint_of(&self, call: &TechCall) -> Result<Arc<MockEndpoint>> {
        call.pvt::<MockEndpoint>()
            .ok_or_else(|| SwitchError::technology(call.channel().name(), "no endpoint attached"))
    }
}

impl ChannelTech for MockTech {
    fn type_name(&self) -> &'static str {
        self.type_name
    }

    fn description(&self) -> &'static str {
        "In-memory recording technology"
    }

    fn capabilities(&self) -> FormatSet {
        self.capabilities
    }

    fn properties(&self) -> TechProperties {
        self.properties
    }

    fn call(&self, call: &TechCall, destination: &str, _timeout: Duration) -> Result<()> {
        self.endpoint_of(call)?.log.lock().calls.push(destination.to_string());
        call.channel().set_state(ChannelState::Ringing);
        Ok(())
    }

    fn hangup(&self, call: &TechCall) -> Result<()> {
        if let Some(endpoint) = call.pvt::<MockEndpoint>() {
            endpoint.log.lock().hangups += 1;
            debug!("Mock endpoint {} hung up", endpoint.label);
        }
        Ok(())
    }

    fn answer(&self, call: &TechCall) -> Result<()> {
        self.endpoint_of(call)?.log.lock().answers += 1;
        Ok(())
    }

    fn read(&self, call: &TechCall) -> TechRead {
        let Some(endpoint) = call.pvt::<MockEndpoint>() else {
            return TechRead::Hangup;
        };
        let frame = endpoint.inbound.lock().pop_front();
        match frame {
            Some(frame) => TechRead::Frames(vec![frame]),
            None => TechRead::Pending,
        }
    }

    fn write(&self, call: &TechCall, frame: &Frame) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SwitchError::technology(call.channel().name(), "write failed"));
        }
        self.endpoint_of(call)?.log.lock().written.push(frame.clone());
        Ok(())
    }

    fn send_text(&self, call: &TechCall, text: &str) -> Result<()> {
        self.endpoint_of(call)?.log.lock().texts.push(text.to_string());
        Ok(())
    }

    fn indicate(&self, call: &TechCall, condition: ControlKind, _data: &[u8]) -> Result<()> {
        if !self.native_indications {
            return Err(SwitchError::unsupported(self.type_name, "indicate"));
        }
        self.endpoint_of(call)?.log.lock().indications.push(condition);
        Ok(())
    }

    fn fixup(&self, _old: &Arc<Channel>, new: &Arc<Channel>, pvt: Option<&super::TechPvt>) -> Result<()> {
        if self.fail_fixups.load(Ordering::SeqCst) {
            return Err(SwitchError::technology(new.name(), "fixup failed"));
        }
        if let Some(endpoint) = pvt.and_then(|p| p.clone().downcast::<MockEndpoint>().ok()) {
            endpoint.log.lock().fixups += 1;
        }
        Ok(())
    }

    fn send_digit_begin(&self, call: &TechCall, digit: DtmfDigit) -> Result<DigitHandling> {
        if !self.native_digits {
            return Ok(DigitHandling::Unsupported);
        }
        self.endpoint_of(call)?.log.lock().digits_begun.push(digit);
        Ok(DigitHandling::Native)
    }

    fn send_digit_end(&self, call: &TechCall, digit: DtmfDigit, duration_ms: u32) -> Result<DigitHandling> {
        if !self.native_digits {
            return Ok(DigitHandling::Unsupported);
        }
        self.endpoint_of(call)?.log.lock().digits_ended.push((digit, duration_ms));
        Ok(DigitHandling::Native)
    }
}

impl ChannelDriver for MockTech {
    fn type_name(&self) -> &'static str {
        self.type_name
    }

    fn request(self: Arc<Self>, registry: &Arc<ChannelRegistry>, data: &str, formats: FormatSet) -> Result<Arc<Channel>> {
        let seq = self.next_request.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}/{}-{:04x}", self.type_name, data, seq);
        let formats = match formats.intersection(&self.capabilities) {
            common if common.is_empty() => self.capabilities,
            common => common,
        };
        let endpoint = MockEndpoint::new(name.clone());
        let channel = registry
            .channel(self.clone(), name.clone())
            .pvt(endpoint.clone())
            .formats(formats)
            .outgoing(true)
            .build()?;
        self.endpoints.insert(name, endpoint);
        Ok(channel)
    }
}

