//! Channels
//!
//! A [`Channel`] is the core's handle for one leg of a call, whatever
//! technology carries it. It owns a frame queue fed by its technology and
//! by other parts of the core, a read pipeline that turns queued and
//! technology frames into what applications see (DTMF emulation, format
//! translation, generator pacing), and a write pipeline towards the
//! technology.
//!
//! Channels are shared as `Arc<Channel>`. All mutable state lives behind
//! one lock; technology callbacks are made without it. When two channels
//! must be locked together they are locked in ascending [`Channel::order`]
//! after the registry gate, see [`crate::masquerade`].

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rvoip_media_core::dtmf::{DEFAULT_EMULATE_DTMF_DURATION_MS, MIN_DTMF_DURATION_MS, MIN_DTMF_GAP_MS};
use rvoip_media_core::prelude::*;
use rvoip_media_core::translate::can_translate;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SwitchConfig;
use crate::error::{Result, SwitchError};
use crate::generator::{self, ActiveGenerator};
use crate::masquerade;
use crate::registry::ChannelRegistry;
use crate::tech::{ChannelOption, ChannelTech, OptionKey, TechCall, TechPvt};

pub mod datastore;
pub mod framehook;
pub mod party;
mod queue;
mod read;
pub mod snapshot;
pub mod wait;
mod write;

pub use datastore::Datastore;
pub use framehook::{FrameHook, FrameHookEvent};
pub use party::{PartyId, Redirecting};
pub use snapshot::ChannelSnapshot;
pub use wait::wait_for_any;

use framehook::FrameHookList;

/// Hang-up cause codes (Q.850)
pub mod cause {
    pub const UNALLOCATED: u32 = 1;
    pub const NORMAL_CLEARING: u32 = 16;
    pub const USER_BUSY: u32 = 17;
    pub const NO_USER_RESPONSE: u32 = 18;
    pub const NO_ANSWER: u32 = 19;
    pub const CALL_REJECTED: u32 = 21;
    pub const CONGESTION: u32 = 34;
    pub const FAILURE: u32 = 38;
}

/// Channel call state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelState {
    /// Channel is down and available
    Down,
    /// Channel is down, but reserved
    Reserved,
    /// Channel is off hook
    OffHook,
    /// Digits (or equivalent) have been dialed
    Dialing,
    /// Line is ringing
    Ring,
    /// Remote end is ringing
    Ringing,
    /// Line is up
    Up,
    /// Line is busy
    Busy,
    /// Digits have been dialed while offhook
    DialingOffHook,
    /// Channel has detected an incoming call and is waiting for ring
    PreRing,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Down => "Down",
            ChannelState::Reserved => "Rsrvd",
            ChannelState::OffHook => "OffHook",
            ChannelState::Dialing => "Dialing",
            ChannelState::Ring => "Ring",
            ChannelState::Ringing => "Ringing",
            ChannelState::Up => "Up",
            ChannelState::Busy => "Busy",
            ChannelState::DialingOffHook => "Dialing Offhook",
            ChannelState::PreRing => "Pre-ring",
        };
        f.write_str(s)
    }
}

/// Reasons a channel has been asked to hang up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftHangup(u32);

impl SoftHangup {
    /// The technology or the queue reported the far end is gone
    pub const DEV: SoftHangup = SoftHangup(0x01);
    /// Leave the current application and continue elsewhere
    pub const ASYNC_GOTO: SoftHangup = SoftHangup(0x02);
    pub const SHUTDOWN: SoftHangup = SoftHangup(0x04);
    /// A time limit expired
    pub const TIMEOUT: SoftHangup = SoftHangup(0x08);
    pub const APP_UNLOAD: SoftHangup = SoftHangup(0x10);
    /// Requested by an application or a feature
    pub const EXPLICIT: SoftHangup = SoftHangup(0x20);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_set(self) -> bool {
        self.0 != 0
    }

    pub fn contains(self, other: SoftHangup) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: SoftHangup) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: SoftHangup) {
        self.0 &= !other.0;
    }
}

/// Runtime options shared by every channel of a registry
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub queue_max_frames: usize,
    pub queue_max_voice_frames: usize,
    pub queue_prune_frames: usize,
    pub generator_cadence: Duration,
    pub dtmf_min_duration_ms: u32,
    pub dtmf_min_gap_ms: u32,
    pub dtmf_default_duration_ms: u32,
    pub inband_dtmf: bool,
    pub default_context: String,
    pub jitter: JitterBufferConfig,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            queue_max_frames: 128,
            queue_max_voice_frames: 96,
            queue_prune_frames: 64,
            generator_cadence: Duration::from_millis(20),
            dtmf_min_duration_ms: MIN_DTMF_DURATION_MS,
            dtmf_min_gap_ms: MIN_DTMF_GAP_MS,
            dtmf_default_duration_ms: DEFAULT_EMULATE_DTMF_DURATION_MS,
            inband_dtmf: false,
            default_context: "default".to_string(),
            jitter: JitterBufferConfig::default(),
        }
    }
}

impl From<&SwitchConfig> for ChannelOptions {
    fn from(config: &SwitchConfig) -> Self {
        Self {
            queue_max_frames: config.general.queue_max_frames,
            queue_max_voice_frames: config.general.queue_max_voice_frames,
            queue_prune_frames: config.general.queue_prune_frames,
            generator_cadence: Duration::from_millis(config.general.generator_cadence_ms),
            dtmf_min_duration_ms: config.dtmf.min_duration_ms,
            dtmf_min_gap_ms: config.dtmf.min_gap_ms,
            dtmf_default_duration_ms: config.dtmf.default_duration_ms,
            inband_dtmf: config.dtmf.inband_detection,
            default_context: config.general.default_context.clone(),
            jitter: config.jitter,
        }
    }
}

/// A tone the core is playing because the technology cannot send a digit
#[derive(Debug, Clone, Copy)]
pub(crate) struct SentTone {
    pub digit: DtmfDigit,
    pub started: Instant,
    pub generator_id: u64,
    /// Set once the digit's end was written; the tone stops after this long
    pub end_ms: Option<u32>,
}

/// A digit written while an in-band digit was still sounding
#[derive(Debug, Clone, Copy)]
pub(crate) struct QueuedTone {
    pub digit: DtmfDigit,
    /// Unknown until the digit's end is written
    pub duration_ms: Option<u32>,
}

/// DTMF bookkeeping of the read and write pipelines
#[derive(Debug, Default)]
pub(crate) struct DtmfState {
    /// A DTMF begin was passed up and its end has not been seen
    pub in_dtmf: bool,
    /// An end-only digit is being turned into a begin/end pair
    pub emulating: bool,
    pub emulate_digit: Option<DtmfDigit>,
    /// How long after `last` the emulated end is due; zero when already sent
    pub emulate_duration_ms: u32,
    /// When the last digit began or ended
    pub last: Option<Instant>,
    /// Application asked for digits to be held back
    pub defer: bool,
    /// Only end frames are passed up
    pub end_only: bool,
    pub sent_tone: Option<SentTone>,
    pub tone_queue: VecDeque<QueuedTone>,
}

impl DtmfState {
    pub fn elapsed_ms(&self, now: Instant) -> u32 {
        self.last
            .map(|t| now.saturating_duration_since(t).as_millis().min(u32::MAX as u128) as u32)
            .unwrap_or(u32::MAX)
    }

    pub fn within_gap(&self, now: Instant, gap_ms: u32) -> bool {
        self.last.is_some() && self.elapsed_ms(now) < gap_ms
    }

    /// DTMF frames must stay queued for now
    pub fn holds_digits(&self, now: Instant, gap_ms: u32) -> bool {
        self.defer || self.emulating || self.within_gap(now, gap_ms)
    }
}

#[derive(Debug, Default)]
pub(crate) struct ChannelFlags {
    pub outgoing: bool,
    pub zombie: bool,
    pub write_interrupts_generator: bool,
    /// The technology signalled it has something to read
    pub tech_readable: bool,
    /// Hang up as soon as the pending masquerade this channel is the source of completes
    pub hangup_after_masquerade: bool,
}

/// Role in a masquerade that has been planned but not executed
#[derive(Debug)]
pub(crate) enum MasqRole {
    /// This channel takes over the source
    Destination(Arc<Channel>),
    /// This channel is consumed into the destination
    Source(Weak<Channel>),
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ChannelCounters {
    pub frames_in: u64,
    pub frames_out: u64,
    pub dropped_frames: u64,
}

/// Where a channel sits in the dialplan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialplanLocation {
    pub context: String,
    pub exten: String,
    pub priority: u32,
}

pub(crate) struct ChannelInner {
    pub name: String,
    pub unique_id: String,
    pub state: ChannelState,
    pub tech: Arc<dyn ChannelTech>,
    pub pvt: Option<TechPvt>,

    pub native_formats: FormatSet,
    pub read_format: Format,
    pub write_format: Format,
    pub raw_read_format: Format,
    pub raw_write_format: Format,
    pub read_trans: Option<TranslatorPath>,
    pub write_trans: Option<TranslatorPath>,

    pub readq: VecDeque<Frame>,
    pub flags: ChannelFlags,
    pub softhangup: SoftHangup,
    pub hangup_cause: u32,
    pub dtmf: DtmfState,
    pub dsp: Option<DtmfDetector>,
    pub generator: Option<ActiveGenerator>,
    pub masq: Option<MasqRole>,
    pub bridged: Option<Weak<Channel>>,
    pub visible_indication: Option<ControlKind>,
    pub jitter: Option<Arc<JitterBuffer>>,

    pub datastores: Vec<Datastore>,
    pub framehooks: FrameHookList,

    pub caller: PartyId,
    pub connected: PartyId,
    pub redirecting: Redirecting,
    pub dialed: PartyId,
    pub variables: BTreeMap<String, String>,
    pub location: DialplanLocation,
    pub call_group: u64,
    pub pickup_group: u64,
    pub language: String,
    pub account_code: String,

    pub stats: ChannelCounters,
}

impl ChannelInner {
    /// Pick the native format a path to or from `format` can use
    fn raw_format_for(&self, format: Format) -> Result<Format> {
        if self.native_formats.contains(format) {
            return Ok(format);
        }
        self.native_formats
            .iter()
            .filter(|f| f.is_audio() == format.is_audio())
            .find(|f| can_translate(format, *f) && can_translate(*f, format))
            .ok_or_else(|| {
                SwitchError::Media(rvoip_media_core::Error::NoTranslationPath {
                    from: format.to_string(),
                    to: self.native_formats.to_string(),
                })
            })
    }

    pub fn rebuild_read_path(&mut self, format: Format) -> Result<()> {
        let raw = self.raw_format_for(format)?;
        self.read_trans = if raw == format {
            None
        } else {
            Some(TranslatorPath::build(raw, format)?)
        };
        self.read_format = format;
        self.raw_read_format = raw;
        Ok(())
    }

    pub fn rebuild_write_path(&mut self, format: Format) -> Result<()> {
        let raw = self.raw_format_for(format)?;
        self.write_trans = if raw == format {
            None
        } else {
            Some(TranslatorPath::build(format, raw)?)
        };
        self.write_format = format;
        self.raw_write_format = raw;
        Ok(())
    }

    pub fn is_gone(&self) -> bool {
        self.flags.zombie || self.softhangup.is_set()
    }
}

/// One leg of a call
pub struct Channel {
    order: u64,
    created: DateTime<Utc>,
    options: Arc<ChannelOptions>,
    registry: Weak<ChannelRegistry>,
    wake: Notify,
    pub(crate) inner: Mutex<ChannelInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_lock() {
            Some(inner) => f
                .debug_struct("Channel")
                .field("name", &inner.name)
                .field("state", &inner.state)
                .field("queued", &inner.readq.len())
                .finish(),
            None => f.debug_struct("Channel").field("order", &self.order).finish_non_exhaustive(),
        }
    }
}

/// Builder for a channel registered with a [`ChannelRegistry`]
pub struct ChannelBuilder {
    registry: Arc<ChannelRegistry>,
    tech: Arc<dyn ChannelTech>,
    name: String,
    pvt: Option<TechPvt>,
    state: ChannelState,
    formats: Option<FormatSet>,
    outgoing: bool,
    caller: PartyId,
    location: Option<DialplanLocation>,
    call_group: u64,
    pickup_group: u64,
}

impl ChannelBuilder {
    pub(crate) fn new(registry: Arc<ChannelRegistry>, tech: Arc<dyn ChannelTech>, name: String) -> Self {
        Self {
            registry,
            tech,
            name,
            pvt: None,
            state: ChannelState::Down,
            formats: None,
            outgoing: false,
            caller: PartyId::default(),
            location: None,
            call_group: 0,
            pickup_group: 0,
        }
    }

    pub fn pvt(mut self, pvt: TechPvt) -> Self {
        self.pvt = Some(pvt);
        self
    }

    pub fn state(mut self, state: ChannelState) -> Self {
        self.state = state;
        self
    }

    /// Native formats, defaulting to the technology's capabilities
    pub fn formats(mut self, formats: FormatSet) -> Self {
        self.formats = Some(formats);
        self
    }

    pub fn outgoing(mut self, outgoing: bool) -> Self {
        self.outgoing = outgoing;
        self
    }

    pub fn caller(mut self, caller: PartyId) -> Self {
        self.caller = caller;
        self
    }

    pub fn extension(mut self, context: impl Into<String>, exten: impl Into<String>) -> Self {
        self.location = Some(DialplanLocation {
            context: context.into(),
            exten: exten.into(),
            priority: 1,
        });
        self
    }

    pub fn groups(mut self, call_group: u64, pickup_group: u64) -> Self {
        self.call_group = call_group;
        self.pickup_group = pickup_group;
        self
    }

    /// Create the channel and register it under its name
    pub fn build(self) -> Result<Arc<Channel>> {
        let registry = self.registry;
        let options = registry.options().clone();
        let order = registry.next_order();
        let properties = self.tech.properties();

        let name = if self.name.is_empty() {
            format!("{}/{:08x}", self.tech.type_name(), order)
        } else {
            self.name
        };
        let unique_id = uuid::Uuid::new_v4().to_string();
        let native_formats = self.formats.unwrap_or_else(|| self.tech.capabilities());
        let format = native_formats.best_audio().unwrap_or(Format::Slin8);
        let location = self.location.unwrap_or_else(|| DialplanLocation {
            context: options.default_context.clone(),
            exten: "s".to_string(),
            priority: 1,
        });

        let inner = ChannelInner {
            name: name.clone(),
            unique_id: unique_id.clone(),
            state: self.state,
            tech: self.tech,
            pvt: self.pvt,
            native_formats,
            read_format: format,
            write_format: format,
            raw_read_format: format,
            raw_write_format: format,
            read_trans: None,
            write_trans: None,
            readq: VecDeque::new(),
            flags: ChannelFlags {
                outgoing: self.outgoing,
                write_interrupts_generator: properties.write_interrupts_generator,
                ..Default::default()
            },
            softhangup: SoftHangup::default(),
            hangup_cause: 0,
            dtmf: DtmfState::default(),
            dsp: options.inband_dtmf.then(DtmfDetector::new),
            generator: None,
            masq: None,
            bridged: None,
            visible_indication: None,
            jitter: properties
                .jitter_buffer
                .then(|| Arc::new(JitterBuffer::new(options.jitter))),
            datastores: Vec::new(),
            framehooks: FrameHookList::default(),
            caller: self.caller,
            connected: PartyId::default(),
            redirecting: Redirecting::default(),
            dialed: PartyId::default(),
            variables: BTreeMap::new(),
            location,
            call_group: self.call_group,
            pickup_group: self.pickup_group,
            language: "en".to_string(),
            account_code: String::new(),
            stats: ChannelCounters::default(),
        };

        let channel = Arc::new(Channel {
            order,
            created: Utc::now(),
            options,
            registry: Arc::downgrade(&registry),
            wake: Notify::new(),
            inner: Mutex::new(inner),
        });

        registry.register(&channel, &name, &unique_id)?;
        info!("📞 Created channel {} ({})", name, unique_id);
        Ok(channel)
    }
}

/// Lock two distinct channels in ascending order
pub(crate) fn lock_pair<'a>(
    a: &'a Channel,
    b: &'a Channel,
) -> (MutexGuard<'a, ChannelInner>, MutexGuard<'a, ChannelInner>) {
    if a.order <= b.order {
        let ga = a.inner.lock();
        let gb = b.inner.lock();
        (ga, gb)
    } else {
        let gb = b.inner.lock();
        let ga = a.inner.lock();
        (ga, gb)
    }
}

impl Channel {
    /// Lock-order key, unique within the process
    pub fn order(&self) -> u64 {
        self.order
    }

    pub fn name(&self) -> String {
        self.inner.lock().name.clone()
    }

    pub fn unique_id(&self) -> String {
        self.inner.lock().unique_id.clone()
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    pub fn registry(&self) -> Option<Arc<ChannelRegistry>> {
        self.registry.upgrade()
    }

    pub fn tech_type(&self) -> &'static str {
        self.inner.lock().tech.type_name()
    }

    pub fn tech_pvt(&self) -> Option<TechPvt> {
        self.inner.lock().pvt.clone()
    }

    pub(crate) fn tech_call(self: &Arc<Self>) -> (Arc<dyn ChannelTech>, TechCall) {
        let inner = self.inner.lock();
        (inner.tech.clone(), TechCall::new(self.clone(), inner.pvt.clone()))
    }

    fn live_tech_call(self: &Arc<Self>) -> Result<(Arc<dyn ChannelTech>, TechCall)> {
        let inner = self.inner.lock();
        if inner.is_gone() {
            return Err(SwitchError::ChannelGone(inner.name.clone()));
        }
        Ok((inner.tech.clone(), TechCall::new(self.clone(), inner.pvt.clone())))
    }

    pub fn state(&self) -> ChannelState {
        self.inner.lock().state
    }

    pub fn set_state(&self, state: ChannelState) {
        let mut inner = self.inner.lock();
        if inner.state != state {
            debug!("{} state {} -> {}", inner.name, inner.state, state);
            inner.state = state;
        }
    }

    pub fn is_outgoing(&self) -> bool {
        self.inner.lock().flags.outgoing
    }

    pub fn is_zombie(&self) -> bool {
        self.inner.lock().flags.zombie
    }

    /// Whether the channel has been asked to hang up or is already dead
    pub fn check_hangup(&self) -> bool {
        self.inner.lock().is_gone()
    }

    /// Ask whoever is servicing the channel to hang it up
    pub fn softhangup(&self, reason: SoftHangup) {
        {
            let mut inner = self.inner.lock();
            inner.softhangup.insert(reason);
            debug!("Soft hangup of {} ({:#x})", inner.name, inner.softhangup.bits());
        }
        self.wake();
    }

    pub fn softhangup_reasons(&self) -> SoftHangup {
        self.inner.lock().softhangup
    }

    pub fn clear_softhangup(&self, reason: SoftHangup) {
        self.inner.lock().softhangup.remove(reason);
    }

    pub fn hangup_cause(&self) -> u32 {
        self.inner.lock().hangup_cause
    }

    pub fn set_hangup_cause(&self, cause: u32) {
        self.inner.lock().hangup_cause = cause;
    }

    pub fn native_formats(&self) -> FormatSet {
        self.inner.lock().native_formats
    }

    /// Replace the native formats after a renegotiation and rebuild both paths
    pub fn set_native_formats(&self, formats: FormatSet) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.native_formats = formats;
        let (read, write) = (inner.read_format, inner.write_format);
        inner.rebuild_read_path(read)?;
        inner.rebuild_write_path(write)
    }

    pub fn read_format(&self) -> Format {
        self.inner.lock().read_format
    }

    pub fn write_format(&self) -> Format {
        self.inner.lock().write_format
    }

    /// Format frames are delivered to readers in
    pub fn set_read_format(&self, format: Format) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.rebuild_read_path(format)?;
        debug!("Set read format of {} to {} (raw {})", inner.name, format, inner.raw_read_format);
        Ok(())
    }

    /// Format writers hand frames in
    pub fn set_write_format(self: &Arc<Self>, format: Format) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            inner.rebuild_write_path(format)?;
            debug!("Set write format of {} to {} (raw {})", inner.name, format, inner.raw_write_format);
        }
        self.notify_generator_format_change();
        Ok(())
    }

    pub fn caller(&self) -> PartyId {
        self.inner.lock().caller.clone()
    }

    pub fn set_caller(&self, caller: PartyId) {
        self.inner.lock().caller = caller;
    }

    pub fn connected(&self) -> PartyId {
        self.inner.lock().connected.clone()
    }

    pub fn set_connected(&self, connected: PartyId) {
        self.inner.lock().connected = connected;
    }

    pub fn redirecting(&self) -> Redirecting {
        self.inner.lock().redirecting.clone()
    }

    pub fn set_redirecting(&self, redirecting: Redirecting) {
        self.inner.lock().redirecting = redirecting;
    }

    pub fn dialed(&self) -> PartyId {
        self.inner.lock().dialed.clone()
    }

    pub fn variable(&self, name: &str) -> Option<String> {
        self.inner.lock().variables.get(name).cloned()
    }

    pub fn set_variable(&self, name: impl Into<String>, value: impl Into<String>) {
        self.inner.lock().variables.insert(name.into(), value.into());
    }

    pub fn variables(&self) -> Vec<(String, String)> {
        self.inner
            .lock()
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn location(&self) -> DialplanLocation {
        self.inner.lock().location.clone()
    }

    pub fn set_location(&self, context: impl Into<String>, exten: impl Into<String>, priority: u32) {
        self.inner.lock().location = DialplanLocation {
            context: context.into(),
            exten: exten.into(),
            priority,
        };
    }

    pub fn call_group(&self) -> u64 {
        self.inner.lock().call_group
    }

    pub fn pickup_group(&self) -> u64 {
        self.inner.lock().pickup_group
    }

    pub fn set_groups(&self, call_group: u64, pickup_group: u64) {
        let mut inner = self.inner.lock();
        inner.call_group = call_group;
        inner.pickup_group = pickup_group;
    }

    pub fn language(&self) -> String {
        self.inner.lock().language.clone()
    }

    pub fn set_language(&self, language: impl Into<String>) {
        self.inner.lock().language = language.into();
    }

    pub fn account_code(&self) -> String {
        self.inner.lock().account_code.clone()
    }

    pub fn set_account_code(&self, code: impl Into<String>) {
        self.inner.lock().account_code = code.into();
    }

    /// The channel this one is bridged to, if any
    pub fn bridged_peer(&self) -> Option<Arc<Channel>> {
        self.inner.lock().bridged.as_ref()?.upgrade()
    }

    pub(crate) fn set_bridged(&self, peer: Option<&Arc<Channel>>) {
        self.inner.lock().bridged = peer.map(Arc::downgrade);
    }

    /// Last indication that stays audible (ringing, hold, busy...)
    pub fn visible_indication(&self) -> Option<ControlKind> {
        self.inner.lock().visible_indication
    }

    /// Hold back received digits until [`Channel::undefer_dtmf`]. Returns the previous setting.
    pub fn defer_dtmf(&self) -> bool {
        let mut inner = self.inner.lock();
        std::mem::replace(&mut inner.dtmf.defer, true)
    }

    pub fn undefer_dtmf(&self) {
        self.inner.lock().dtmf.defer = false;
        self.wake();
    }

    /// Pass up only DTMF end frames
    pub fn set_end_dtmf_only(&self, on: bool) {
        self.inner.lock().dtmf.end_only = on;
    }

    /// Run the core's detector on received audio
    pub fn set_inband_dtmf(&self, on: bool) {
        let mut inner = self.inner.lock();
        match (on, inner.dsp.is_some()) {
            (true, false) => inner.dsp = Some(DtmfDetector::new()),
            (false, true) => inner.dsp = None,
            _ => {}
        }
    }

    pub fn jitter_buffer(&self) -> Option<Arc<JitterBuffer>> {
        self.inner.lock().jitter.clone()
    }

    /// Count frames or audio the technology had to discard
    pub fn note_dropped(&self, frames: u64) {
        self.inner.lock().stats.dropped_frames += frames;
    }

    /// Wake everything waiting on this channel
    pub fn wake(&self) {
        self.wake.notify_waiters();
    }

    /// Technology hint that a read would now return data
    pub fn notify_readable(&self) {
        self.inner.lock().flags.tech_readable = true;
        self.wake();
    }

    pub(crate) fn notify(&self) -> &Notify {
        &self.wake
    }

    pub(crate) fn masquerade_pending(&self) -> bool {
        matches!(self.inner.lock().masq, Some(MasqRole::Destination(_)))
    }

    /// Answer an inbound call
    pub fn answer(self: &Arc<Self>) -> Result<()> {
        let (tech, call) = self.live_tech_call()?;
        match self.state() {
            ChannelState::Up => return Ok(()),
            ChannelState::Ring | ChannelState::Ringing | ChannelState::Down | ChannelState::PreRing => {}
            other => debug!("Answering {} from state {}", self.name(), other),
        }
        tech.answer(&call)?;
        self.set_state(ChannelState::Up);
        info!("✅ Answered {}", self.name());
        Ok(())
    }

    /// Place an outgoing call through the technology
    pub fn call(self: &Arc<Self>, destination: &str, timeout: Duration) -> Result<()> {
        let (tech, call) = self.live_tech_call()?;
        tech.call(&call, destination, timeout)?;
        let mut inner = self.inner.lock();
        inner.flags.outgoing = true;
        inner.dialed = PartyId::number(destination);
        info!("📤 Calling {} on {}", destination, inner.name);
        Ok(())
    }

    pub fn indicate(self: &Arc<Self>, condition: ControlKind) -> Result<()> {
        self.indicate_data(condition, &[])
    }

    /// Indicate a condition to the endpoint, playing tones in band when the
    /// technology cannot signal it
    pub fn indicate_data(self: &Arc<Self>, condition: ControlKind, data: &[u8]) -> Result<()> {
        let (tech, call) = {
            let mut inner = self.inner.lock();
            if inner.is_gone() {
                return Err(SwitchError::ChannelGone(inner.name.clone()));
            }
            if condition.is_visible_indication() {
                inner.visible_indication = Some(condition);
            } else if matches!(condition, ControlKind::Unhold | ControlKind::Answer) {
                inner.visible_indication = None;
            }
            (inner.tech.clone(), TechCall::new(self.clone(), inner.pvt.clone()))
        };

        let result = tech.indicate(&call, condition, data);
        let name = call.channel().name();

        if matches!(
            condition,
            ControlKind::Answer | ControlKind::Unhold | ControlKind::Progress | ControlKind::Proceeding
        ) {
            self.stop_indication_tones();
        }

        match result {
            Ok(()) => {
                debug!("Indicated {:?} on {}", condition, name);
                Ok(())
            }
            Err(e) => match generator::indication_tones(condition) {
                Some(tones) => {
                    debug!("Playing {:?} in band on {}", condition, name);
                    self.play_indication(tones)?;
                    Ok(())
                }
                None if !matches!(e, SwitchError::Unsupported { .. }) => Err(e),
                None => match condition {
                    ControlKind::Hold
                    | ControlKind::Unhold
                    | ControlKind::Answer
                    | ControlKind::Progress
                    | ControlKind::Proceeding
                    | ControlKind::VidUpdate
                    | ControlKind::SrcUpdate
                    | ControlKind::SrcChange => Ok(()),
                    _ => {
                        debug!("{} cannot indicate {:?}", name, condition);
                        Err(e)
                    }
                },
            },
        }
    }

    pub fn send_text(self: &Arc<Self>, text: &str) -> Result<()> {
        let (tech, call) = self.live_tech_call()?;
        tech.send_text(&call, text)
    }

    /// Set a technology option; in-band DTMF falls back to the core's detector
    pub fn set_option(self: &Arc<Self>, option: ChannelOption) -> Result<()> {
        let (tech, call) = self.live_tech_call()?;
        match tech.set_option(&call, &option) {
            Err(e @ SwitchError::Unsupported { .. }) => match option {
                ChannelOption::InbandDtmf(on) => {
                    self.set_inband_dtmf(on);
                    Ok(())
                }
                _ => Err(e),
            },
            other => other,
        }
    }

    pub fn get_option(self: &Arc<Self>, key: OptionKey) -> Result<ChannelOption> {
        let (tech, call) = self.live_tech_call()?;
        match tech.get_option(&call, &key) {
            Err(SwitchError::Unsupported { .. }) if key == OptionKey::InbandDtmf => {
                Ok(ChannelOption::InbandDtmf(self.inner.lock().dsp.is_some()))
            }
            other => other,
        }
    }

    /// Hang up and unregister the channel
    ///
    /// A pending masquerade this channel is the destination of is completed
    /// first. If the channel is the source of one, the hang-up happens when
    /// the masquerade does.
    pub fn hangup(self: &Arc<Self>) -> Result<()> {
        if self.masquerade_pending() {
            if let Err(e) = masquerade::execute(self) {
                warn!("Masquerade on {} failed during hangup: {}", self.name(), e);
            }
        }

        let (tech, call, was_zombie, active, datastores, name, hangup_cause) = {
            let mut inner = self.inner.lock();
            if matches!(inner.masq, Some(MasqRole::Source(_))) {
                debug!("{} is being masqueraded, hanging up afterwards", inner.name);
                inner.flags.hangup_after_masquerade = true;
                return Ok(());
            }
            let was_zombie = std::mem::replace(&mut inner.flags.zombie, true);
            inner.softhangup.insert(SoftHangup::EXPLICIT);
            inner.readq.clear();
            inner.bridged = None;
            inner.masq = None;
            inner.dsp = None;
            let pvt = inner.pvt.take();
            (
                inner.tech.clone(),
                TechCall::new(self.clone(), pvt),
                was_zombie,
                inner.generator.take(),
                std::mem::take(&mut inner.datastores),
                inner.name.clone(),
                inner.hangup_cause,
            )
        };

        self.release_generator(active);
        drop(datastores);

        if !was_zombie {
            if let Err(e) = tech.hangup(&call) {
                warn!("{} hangup failed on {}: {}", tech.type_name(), name, e);
            }
        }

        if let Some(registry) = self.registry() {
            registry.unregister(self);
        }
        self.wake();
        info!("📴 Hung up {} (cause {})", name, hangup_cause);
        Ok(())
    }
}
