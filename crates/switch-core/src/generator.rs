//! Generators
//!
//! A [`Generator`] produces outbound audio on a channel (tones, silence,
//! in-band digits). At most one is active per channel. It is paced either
//! by a core timer task ticking at the configured cadence, or, for
//! technologies that deliver voice at a steady rate, by the channel's own
//! reads.
//!
//! While a generate call runs, the generator instance is checked out of
//! the channel so the call can write to the channel without holding its
//! lock. Frames written from anywhere else are swallowed while a
//! generator is active, unless the technology lets writes interrupt it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use rvoip_media_core::{ControlKind, Format, Frame, ToneList};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::channel::Channel;
use crate::error::{Result, SwitchError};

/// US ringback, busy and congestion cadences
const RINGBACK_TONES: &str = "440+480/2000,0/4000";
const BUSY_TONES: &str = "480+620/500,0/500";
const CONGESTION_TONES: &str = "480+620/250,0/250";

const INDICATION_GENERATOR: &str = "indication";
const PLAYTONES_GENERATOR: &str = "playtones";

static NEXT_GENERATOR_ID: AtomicU64 = AtomicU64::new(1);

/// Tones the core plays for an indication the technology cannot signal
pub(crate) fn indication_tones(condition: ControlKind) -> Option<&'static str> {
    match condition {
        ControlKind::Ringing => Some(RINGBACK_TONES),
        ControlKind::Busy => Some(BUSY_TONES),
        ControlKind::Congestion => Some(CONGESTION_TONES),
        _ => None,
    }
}

/// Whether a generator wants to keep running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerateStatus {
    Continue,
    Finished,
}

/// Produces audio on a channel
pub trait Generator: Send + 'static {
    fn name(&self) -> &'static str;

    /// Called once before the generator is installed
    fn alloc(&mut self, channel: &Arc<Channel>) -> Result<()> {
        let _ = channel;
        Ok(())
    }

    /// Called once after the generator is removed
    fn release(&mut self, channel: &Arc<Channel>) {
        let _ = channel;
    }

    /// Write about `samples` samples (`len` bytes in the write format) to the channel
    fn generate(&mut self, channel: &Arc<Channel>, len: usize, samples: usize) -> GenerateStatus;

    fn write_format_changed(&mut self, channel: &Arc<Channel>) {
        let _ = channel;
    }
}

pub(crate) struct ActiveGenerator {
    pub id: u64,
    pub name: &'static str,
    /// `None` while a generate call has it checked out
    pub instance: Option<Box<dyn Generator>>,
    pub pacing: Option<JoinHandle<()>>,
    /// Next inline generate when no voice paces it
    pub next_due: Instant,
}

impl ActiveGenerator {
    /// Paced by the channel's reads rather than a timer task
    pub fn is_inline(&self) -> bool {
        self.pacing.is_none() && self.instance.is_some()
    }

    /// Installed and not currently generating
    pub fn is_idle(&self) -> bool {
        self.instance.is_some()
    }
}

impl fmt::Debug for ActiveGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveGenerator")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("paced", &self.pacing.is_some())
            .finish()
    }
}

async fn pace(channel: Weak<Channel>, id: u64, cadence: Duration) {
    let mut interval = tokio::time::interval(cadence);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(channel) = channel.upgrade() else {
            break;
        };
        let format = channel.write_format();
        let samples = (format.sample_rate() as u128 * cadence.as_millis() / 1000) as usize;
        let len = format.bytes_for_samples(samples).unwrap_or(0);
        if !channel.run_generator(Some(id), len, samples) {
            break;
        }
    }
    trace!("Pacing task for generator {} finished", id);
}

impl Channel {
    /// Install a generator, replacing any active one. Returns its id.
    pub fn activate_generator(self: &Arc<Self>, mut generator: Box<dyn Generator>) -> Result<u64> {
        let previous = self.inner.lock().generator.take();
        self.release_generator(previous);

        generator.alloc(self)?;
        let id = NEXT_GENERATOR_ID.fetch_add(1, Ordering::Relaxed);
        let name = generator.name();

        let paced_by_reads = {
            let mut inner = self.inner.lock();
            if inner.is_gone() {
                let channel = inner.name.clone();
                drop(inner);
                generator.release(self);
                return Err(SwitchError::ChannelGone(channel));
            }
            inner.generator = Some(ActiveGenerator {
                id,
                name,
                instance: Some(generator),
                pacing: None,
                next_due: Instant::now(),
            });
            inner.tech.properties().paced_by_voice
        };

        if !paced_by_reads {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let task = handle.spawn(pace(Arc::downgrade(self), id, self.options().generator_cadence));
                let mut inner = self.inner.lock();
                match inner.generator.as_mut() {
                    Some(active) if active.id == id => active.pacing = Some(task),
                    _ => task.abort(),
                }
            }
        }

        self.wake();
        debug!("Activated generator {} ({}) on {}", name, id, self.name());
        Ok(id)
    }

    /// Stop the active generator, if any
    pub fn deactivate_generator(self: &Arc<Self>) {
        let active = self.inner.lock().generator.take();
        self.release_generator(active);
    }

    /// Stop the generator only if it is still the one with `id`
    pub(crate) fn deactivate_generator_id(self: &Arc<Self>, id: u64) {
        let active = {
            let mut inner = self.inner.lock();
            let current = inner.generator.as_ref().is_some_and(|g| g.id == id);
            if current {
                inner.generator.take()
            } else {
                None
            }
        };
        self.release_generator(active);
    }

    fn deactivate_generator_named(self: &Arc<Self>, names: &[&str]) {
        let active = {
            let mut inner = self.inner.lock();
            let named = inner.generator.as_ref().is_some_and(|g| names.contains(&g.name));
            if named {
                inner.generator.take()
            } else {
                None
            }
        };
        self.release_generator(active);
    }

    pub fn has_generator(&self) -> bool {
        self.inner.lock().generator.is_some()
    }

    pub fn generator_name(&self) -> Option<&'static str> {
        self.inner.lock().generator.as_ref().map(|g| g.name)
    }

    pub(crate) fn release_generator(self: &Arc<Self>, active: Option<ActiveGenerator>) {
        let Some(mut active) = active else {
            return;
        };
        if let Some(task) = active.pacing.take() {
            task.abort();
        }
        // a checked out instance is released by the generate call holding it
        if let Some(mut instance) = active.instance.take() {
            instance.release(self);
        }
        debug!("Released generator {} on {}", active.name, self.name());
        self.wake();
    }

    /// Run one generate call. Returns false once the generator is gone or finished.
    pub(crate) fn run_generator(self: &Arc<Self>, expected: Option<u64>, len: usize, samples: usize) -> bool {
        let (id, mut instance) = {
            let mut inner = self.inner.lock();
            let Some(active) = inner.generator.as_mut() else {
                return false;
            };
            if expected.is_some_and(|id| id != active.id) {
                return false;
            }
            let Some(instance) = active.instance.take() else {
                return true;
            };
            (active.id, instance)
        };

        let status = instance.generate(self, len, samples);

        let mut inner = self.inner.lock();
        let current = inner.generator.as_ref().is_some_and(|g| g.id == id);
        match (status, current) {
            (GenerateStatus::Continue, true) => {
                if let Some(active) = inner.generator.as_mut() {
                    active.instance = Some(instance);
                }
                true
            }
            (GenerateStatus::Finished, true) => {
                let active = inner.generator.take();
                drop(inner);
                if let Some(task) = active.and_then(|mut a| a.pacing.take()) {
                    task.abort();
                }
                instance.release(self);
                debug!("Generator {} finished on {}", id, self.name());
                self.wake();
                false
            }
            (_, false) => {
                drop(inner);
                instance.release(self);
                false
            }
        }
    }

    pub(crate) fn generate_inline(self: &Arc<Self>, len: usize, samples: usize) {
        self.run_generator(None, len, samples);
    }

    pub(crate) fn notify_generator_format_change(self: &Arc<Self>) {
        let checked_out = {
            let mut inner = self.inner.lock();
            inner
                .generator
                .as_mut()
                .and_then(|active| Some((active.id, active.instance.take()?)))
        };
        let Some((id, mut instance)) = checked_out else {
            return;
        };

        instance.write_format_changed(self);

        let mut inner = self.inner.lock();
        match inner.generator.as_mut() {
            Some(active) if active.id == id => active.instance = Some(instance),
            _ => {
                drop(inner);
                instance.release(self);
            }
        }
    }

    /// Play a tone list until it finishes or is stopped
    pub fn play_tones(self: &Arc<Self>, tones: &str) -> Result<u64> {
        let tones = ToneList::parse(tones, 8000)?;
        self.activate_generator(Box::new(ToneGenerator::new(PLAYTONES_GENERATOR, tones)))
    }

    /// Stop tones started by [`Channel::play_tones`] or an in-band indication
    pub fn stop_tones(self: &Arc<Self>) {
        self.deactivate_generator_named(&[PLAYTONES_GENERATOR, INDICATION_GENERATOR]);
    }

    pub(crate) fn play_indication(self: &Arc<Self>, tones: &str) -> Result<u64> {
        let tones = ToneList::parse(tones, 8000)?;
        self.activate_generator(Box::new(ToneGenerator::new(INDICATION_GENERATOR, tones)))
    }

    pub(crate) fn stop_indication_tones(self: &Arc<Self>) {
        self.deactivate_generator_named(&[INDICATION_GENERATOR]);
    }
}

/// Plays a [`ToneList`]
pub struct ToneGenerator {
    name: &'static str,
    tones: ToneList,
}

impl ToneGenerator {
    pub fn new(name: &'static str, tones: ToneList) -> Self {
        Self { name, tones }
    }
}

impl Generator for ToneGenerator {
    fn name(&self) -> &'static str {
        self.name
    }

    fn generate(&mut self, channel: &Arc<Channel>, _len: usize, samples: usize) -> GenerateStatus {
        let write_rate = channel.write_format().sample_rate().max(1) as usize;
        let tone_rate = self.tones.sample_rate() as usize;
        let wanted = (samples * tone_rate / write_rate).max(1);

        let pcm = self.tones.generate(wanted);
        if pcm.is_empty() {
            return GenerateStatus::Finished;
        }
        let format = if tone_rate == 16000 { Format::Slin16 } else { Format::Slin8 };
        if let Err(e) = channel.write(Frame::from_slin(format, &pcm).with_src(self.name)) {
            debug!("Tone generator {} stopping: {}", self.name, e);
            return GenerateStatus::Finished;
        }

        if self.tones.is_finished() {
            GenerateStatus::Finished
        } else {
            GenerateStatus::Continue
        }
    }
}

/// Writes silence until stopped
#[derive(Debug, Default)]
pub struct SilenceGenerator;

impl Generator for SilenceGenerator {
    fn name(&self) -> &'static str {
        "silence"
    }

    fn generate(&mut self, channel: &Arc<Channel>, _len: usize, samples: usize) -> GenerateStatus {
        let rate = channel.write_format().sample_rate().max(1) as usize;
        let samples = (samples * 8000 / rate).max(1);
        match channel.write(Frame::from_slin(Format::Slin8, &vec![0i16; samples]).with_src("silence")) {
            Ok(()) => GenerateStatus::Continue,
            Err(_) => GenerateStatus::Finished,
        }
    }
}
