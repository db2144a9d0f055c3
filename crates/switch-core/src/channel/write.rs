//! The write pipeline and digit sending

use std::sync::Arc;
use std::time::Duration;

use rvoip_media_core::{DtmfDigit, Format, Frame, FrameKind, ToneList};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::framehook::FrameHookEvent;
use super::{Channel, QueuedTone, SentTone, SoftHangup};
use crate::error::{Result, SwitchError};
use crate::generator::ToneGenerator;
use crate::masquerade;
use crate::tech::{DigitHandling, TechCall};

impl Channel {
    /// Write a frame towards the technology
    ///
    /// While a generator is active, frames are swallowed unless the
    /// technology lets writes interrupt it. Digits written while an in-band
    /// digit is sounding are queued and played after it. A technology failure marks the
    /// channel for hang-up.
    pub fn write(self: &Arc<Self>, frame: Frame) -> Result<()> {
        if self.masquerade_pending() {
            masquerade::execute(self)?;
        }

        let mut inner = self.inner.lock();
        if inner.is_gone() {
            return Err(SwitchError::ChannelGone(inner.name.clone()));
        }

        // digits written while an in-band digit sounds wait their turn
        if inner.dtmf.sent_tone.is_some() {
            match frame.kind {
                FrameKind::DtmfBegin(digit) => {
                    inner.dtmf.tone_queue.push_back(QueuedTone { digit, duration_ms: None });
                    debug!("Queued in-band digit {} on {}", digit, inner.name);
                    return Ok(());
                }
                FrameKind::DtmfEnd(digit) => {
                    let duration_ms = self.digit_duration(frame.duration_ms);
                    if let Some(open) = inner.dtmf.tone_queue.back_mut().filter(|q| q.duration_ms.is_none()) {
                        open.duration_ms = Some(duration_ms);
                        return Ok(());
                    }
                    if inner.dtmf.sent_tone.is_some_and(|sent| sent.end_ms.is_some()) {
                        inner.dtmf.tone_queue.push_back(QueuedTone {
                            digit,
                            duration_ms: Some(duration_ms),
                        });
                        debug!("Queued in-band digit {} on {}", digit, inner.name);
                        return Ok(());
                    }
                    drop(inner);
                    return self.send_digit_end(digit, duration_ms);
                }
                _ => {}
            }
        }

        // the generator's own writes happen while its instance is checked out
        let generating = inner.generator.as_ref().is_some_and(|g| g.is_idle());
        if generating && !frame.is_prod() {
            if inner.flags.write_interrupts_generator {
                debug!("Write interrupts generator on {}", inner.name);
                let active = inner.generator.take();
                drop(inner);
                self.release_generator(active);
                inner = self.inner.lock();
            } else {
                return Ok(());
            }
        }

        let Some(frame) = inner.framehooks.run(FrameHookEvent::Write, frame) else {
            return Ok(());
        };
        let tech = inner.tech.clone();
        let call = TechCall::new(self.clone(), inner.pvt.clone());
        let name = inner.name.clone();

        let (result, written) = match frame.kind {
            FrameKind::Null => return Ok(()),
            FrameKind::DtmfBegin(digit) => {
                drop(inner);
                (self.send_digit_begin(digit), 0)
            }
            FrameKind::DtmfEnd(digit) => {
                drop(inner);
                (self.send_digit_end(digit, frame.duration_ms), 0)
            }
            FrameKind::Control(kind) => {
                drop(inner);
                (self.indicate_data(kind, &frame.data), 0)
            }
            FrameKind::Text => {
                drop(inner);
                (tech.send_text(&call, &String::from_utf8_lossy(&frame.data)), 0)
            }
            FrameKind::Video(_) => {
                drop(inner);
                (tech.write(&call, &frame), 1)
            }
            FrameKind::Voice(format) => {
                if !inner.native_formats.contains(format) && inner.write_format != format {
                    debug!("Switching write format of {} to {}", name, format);
                    inner.rebuild_write_path(format)?;
                }
                let frames = match inner.write_trans.as_mut() {
                    Some(path) if path.source() == format => path.translate(frame)?,
                    _ => vec![frame],
                };
                drop(inner);

                let mut written = 0;
                let mut result = Ok(());
                for f in &frames {
                    if let Err(e) = tech.write(&call, f) {
                        result = Err(e);
                        break;
                    }
                    written += 1;
                }
                (result, written)
            }
        };

        match result {
            Ok(()) => {
                self.inner.lock().stats.frames_out += written;
                Ok(())
            }
            Err(e @ SwitchError::Unsupported { .. }) => Err(e),
            Err(e) => {
                warn!("Write to {} failed: {}", name, e);
                self.softhangup(SoftHangup::DEV);
                Err(e)
            }
        }
    }

    /// Start sending a digit, playing it in band when the technology cannot
    pub fn send_digit_begin(self: &Arc<Self>, digit: DtmfDigit) -> Result<()> {
        let (tech, call) = self.live_tech_call()?;
        match tech.send_digit_begin(&call, digit)? {
            DigitHandling::Native => {
                debug!("{} sent digit {} on {}", tech.type_name(), digit, self.name());
                Ok(())
            }
            DigitHandling::Unsupported => {
                let tones = ToneList::parse(&digit.tone_spec(), 8000)?;
                let id = self.activate_generator(Box::new(ToneGenerator::new("dtmf", tones)))?;
                self.inner.lock().dtmf.sent_tone = Some(SentTone {
                    digit,
                    started: Instant::now(),
                    generator_id: id,
                    end_ms: None,
                });
                debug!("Playing digit {} in band on {}", digit, self.name());
                Ok(())
            }
        }
    }

    /// Finish sending a digit
    ///
    /// An in-band tone is stopped once it has sounded for `duration_ms`.
    pub fn send_digit_end(self: &Arc<Self>, digit: DtmfDigit, duration_ms: u32) -> Result<()> {
        let sent = {
            let mut inner = self.inner.lock();
            match inner.dtmf.sent_tone.as_mut() {
                Some(sent) if sent.end_ms.is_none() => {
                    sent.end_ms = Some(duration_ms);
                    Some(*sent)
                }
                _ => None,
            }
        };
        if let Some(sent) = sent {
            if sent.digit != digit {
                debug!("Digit end {} closes in-band tone {} on {}", digit, sent.digit, self.name());
            }
            self.stop_digit_tone(sent, duration_ms);
            return Ok(());
        }

        let (tech, call) = self.live_tech_call()?;
        tech.send_digit_end(&call, digit, duration_ms)?;
        Ok(())
    }

    /// Silence an in-band digit after `duration_ms`, then hold the line
    /// quiet for the minimum gap before the next queued digit
    fn stop_digit_tone(self: &Arc<Self>, sent: SentTone, duration_ms: u32) {
        let remaining = Duration::from_millis(duration_ms as u64).saturating_sub(sent.started.elapsed());
        let gap = Duration::from_millis(self.options.dtmf_min_gap_ms as u64);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let channel = Arc::downgrade(self);
                handle.spawn(async move {
                    tokio::time::sleep(remaining).await;
                    match channel.upgrade() {
                        Some(channel) => channel.deactivate_generator_id(sent.generator_id),
                        None => return,
                    }
                    tokio::time::sleep(gap).await;
                    if let Some(channel) = channel.upgrade() {
                        channel.next_digit_tone(sent.generator_id);
                    }
                });
            }
            Err(_) => {
                self.deactivate_generator_id(sent.generator_id);
                self.next_digit_tone(sent.generator_id);
            }
        }
    }

    /// Play the digits queued behind the in-band tone `generator_id`
    fn next_digit_tone(self: &Arc<Self>, generator_id: u64) {
        {
            let mut inner = self.inner.lock();
            if !inner.dtmf.sent_tone.is_some_and(|sent| sent.generator_id == generator_id) {
                return;
            }
            inner.dtmf.sent_tone = None;
        }
        loop {
            let next = self.inner.lock().dtmf.tone_queue.pop_front();
            let Some(next) = next else { return };
            let sent = self.send_digit_begin(next.digit).and_then(|_| match next.duration_ms {
                Some(ms) => self.send_digit_end(next.digit, ms),
                None => Ok(()),
            });
            if let Err(e) = sent {
                debug!("Dropping queued digits on {}: {}", self.name(), e);
                self.inner.lock().dtmf.tone_queue.clear();
                return;
            }
            // an in-band tone now owns the queue; native digits went out whole
            if self.inner.lock().dtmf.sent_tone.is_some() {
                return;
            }
        }
    }

    fn digit_duration(&self, duration_ms: u32) -> u32 {
        if duration_ms == 0 {
            self.options.dtmf_default_duration_ms
        } else {
            duration_ms
        }
    }

    /// Send one digit of `duration_ms`
    pub async fn send_digit(self: &Arc<Self>, digit: DtmfDigit, duration_ms: u32) -> Result<()> {
        let duration_ms = self.digit_duration(duration_ms);
        self.send_digit_begin(digit)?;
        tokio::time::sleep(Duration::from_millis(duration_ms as u64)).await;
        self.send_digit_end(digit, duration_ms)
    }

    /// Send a digit string, pausing `between_ms` between digits.
    /// `w` in the string waits half a second.
    pub async fn send_digits(self: &Arc<Self>, digits: &str, between_ms: u32, duration_ms: u32) -> Result<()> {
        let between_ms = if between_ms == 0 { 100 } else { between_ms };
        let between = Duration::from_millis(between_ms as u64);
        for c in digits.chars() {
            if c == 'w' {
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
            let digit = DtmfDigit::parse(c)?;
            self.send_digit(digit, duration_ms).await?;
            tokio::time::sleep(between).await;
        }
        Ok(())
    }

    /// Write a silent frame that an active generator does not swallow
    pub fn prod(self: &Arc<Self>) -> Result<()> {
        let format = self.write_format();
        let samples = format.sample_rate() / 50;
        let bytes = format.bytes_for_samples(samples as usize).unwrap_or(0);
        let silence = match format {
            Format::Ulaw => vec![0xffu8; bytes],
            Format::Alaw => vec![0xd5u8; bytes],
            _ => vec![0u8; bytes],
        };
        self.write(Frame::prod(format, silence, samples))
    }
}
