//! The read pipeline
//!
//! Frames come from the channel queue first and from the technology when
//! the queue is empty. On the way up they pass through frame hooks,
//! in-band DTMF detection, DTMF timing enforcement and read translation.
//!
//! DTMF timing: a digit is never reported shorter than the minimum
//! duration, and digits never start within the minimum gap after the last
//! one. End-only digits are turned into a begin now and an end once the
//! duration has elapsed. Digits that cannot be delivered yet stay queued
//! in order.

use std::sync::Arc;
use std::time::Duration;

use rvoip_media_core::translate::decode_to_slin;
use rvoip_media_core::{ControlKind, DtmfDigit, DtmfEvent, Frame, FrameKind, FrameList};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::framehook::FrameHookEvent;
use super::queue::{enqueue, QueuePosition};
use super::{Channel, ChannelInner, ChannelState, SoftHangup};
use crate::masquerade;
use crate::tech::{TechCall, TechRead};

/// Outcome of one pass over the pipeline
enum ReadStep {
    Frame(Frame),
    Gone,
    /// Nothing to deliver; wait for a wake-up or the deadline
    Wait(Option<Instant>),
}

/// Generator work to do once the channel is unlocked: (bytes, samples)
type GenerateRequest = Option<(usize, usize)>;

impl Channel {
    /// Read the next frame
    ///
    /// Returns `None` once the channel has hung up. Waits for the
    /// technology or the queue when nothing is ready. Cancelling the future
    /// loses no frames.
    pub async fn read(self: &Arc<Self>) -> Option<Frame> {
        self.read_frame(false).await
    }

    /// Read like [`Channel::read`] but replace voice with no-op frames
    pub async fn read_noaudio(self: &Arc<Self>) -> Option<Frame> {
        self.read_frame(true).await
    }

    async fn read_frame(self: &Arc<Self>, drop_audio: bool) -> Option<Frame> {
        let mut timer_fired = false;
        loop {
            let notified = self.notify().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.read_step(drop_audio, timer_fired) {
                ReadStep::Frame(frame) => return Some(frame),
                ReadStep::Gone => return None,
                ReadStep::Wait(None) => {
                    notified.await;
                    timer_fired = false;
                }
                ReadStep::Wait(Some(deadline)) => {
                    timer_fired = tokio::select! {
                        _ = notified => false,
                        _ = tokio::time::sleep_until(deadline) => true,
                    };
                }
            }
        }
    }

    fn read_step(self: &Arc<Self>, drop_audio: bool, timer_fired: bool) -> ReadStep {
        if self.masquerade_pending() {
            return match masquerade::execute(self) {
                Ok(()) => ReadStep::Frame(Frame::null()),
                Err(e) => {
                    warn!("Failed to perform masquerade on {}: {}", self.name(), e);
                    ReadStep::Gone
                }
            };
        }

        let now = Instant::now();
        let mut inner = self.inner.lock();
        if inner.is_gone() {
            return self.read_gone(inner);
        }

        let mut synthetic = false;
        let tail_len;
        let frame = if !inner.readq.is_empty() {
            let holds_digits = inner.dtmf.holds_digits(now, self.options.dtmf_min_gap_ms);
            let index = inner
                .readq
                .iter()
                .position(|f| !(holds_digits && f.digit().is_some()));
            match index.and_then(|i| inner.readq.remove(i)) {
                Some(frame) if frame.control_kind() == Some(ControlKind::Hangup) => {
                    inner.readq.clear();
                    inner.readq.push_back(Frame::control(ControlKind::EndOfQueue));
                    inner.softhangup.insert(SoftHangup::DEV);
                    if let Some(cause) = frame.hangup_cause() {
                        inner.hangup_cause = cause;
                    }
                    debug!("Hangup frame read on {} (cause {})", inner.name, inner.hangup_cause);
                    return self.read_gone(inner);
                }
                Some(frame) => {
                    tail_len = inner.readq.len();
                    frame
                }
                None => {
                    synthetic = true;
                    tail_len = inner.readq.len();
                    Frame::null()
                }
            }
        } else if timer_fired {
            synthetic = true;
            tail_len = 0;
            Frame::null()
        } else {
            let tech = inner.tech.clone();
            let call = TechCall::new(self.clone(), inner.pvt.clone());
            inner.flags.tech_readable = false;
            drop(inner);

            let result = tech.read(&call);

            inner = self.inner.lock();
            match result {
                TechRead::Pending => return ReadStep::Wait(self.next_deadline(&inner, now)),
                TechRead::Hangup => {
                    inner.softhangup.insert(SoftHangup::DEV);
                    debug!("{} reported hangup on read of {}", tech.type_name(), inner.name);
                    return self.read_gone(inner);
                }
                TechRead::Frames(frames) => {
                    let mut frames = frames.into_iter();
                    let Some(first) = frames.next() else {
                        return ReadStep::Wait(self.next_deadline(&inner, now));
                    };
                    tail_len = inner.readq.len();
                    let rest: FrameList = frames.collect();
                    if !rest.is_empty() {
                        enqueue(&mut inner, &self.options, rest, QueuePosition::Tail);
                    }
                    first
                }
            }
        };

        let frame = if synthetic {
            frame
        } else {
            inner
                .framehooks
                .run(FrameHookEvent::Read, frame)
                .unwrap_or_else(Frame::null)
        };

        let (frame, mut generate) = self.process_read(&mut inner, frame, drop_audio, now, tail_len);

        if synthetic && generate.is_none() {
            generate = self.generator_due(&mut inner, now);
        }
        if !frame.is_null() {
            inner.stats.frames_in += 1;
        }
        let wait = (synthetic && frame.is_null()).then(|| self.next_deadline(&inner, now));
        drop(inner);

        if let Some((len, samples)) = generate {
            self.generate_inline(len, samples);
        }

        match wait {
            Some(deadline) => ReadStep::Wait(deadline),
            None => ReadStep::Frame(frame),
        }
    }

    fn read_gone(self: &Arc<Self>, mut inner: parking_lot::MutexGuard<'_, ChannelInner>) -> ReadStep {
        let active = inner.generator.take();
        drop(inner);
        self.release_generator(active);
        ReadStep::Gone
    }

    /// When the reader must look again even if nothing wakes it
    pub(crate) fn next_deadline(&self, inner: &ChannelInner, now: Instant) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        let mut consider = |at: Instant| next = Some(next.map_or(at, |n| n.min(at)));

        let dtmf = &inner.dtmf;
        if dtmf.emulating {
            match dtmf.last {
                Some(last) if dtmf.emulate_duration_ms > 0 => {
                    consider(last + Duration::from_millis(dtmf.emulate_duration_ms as u64))
                }
                _ => consider(now),
            }
        }
        if !dtmf.defer && inner.readq.iter().any(|f| f.digit().is_some()) {
            if let Some(last) = dtmf.last {
                consider(last + Duration::from_millis(self.options.dtmf_min_gap_ms as u64));
            }
        }
        if let Some(active) = &inner.generator {
            if active.is_inline() {
                consider(active.next_due);
            }
        }
        next
    }

    /// Inline generator work owed on a pass with no voice
    fn generator_due(&self, inner: &mut ChannelInner, now: Instant) -> GenerateRequest {
        let cadence = self.options.generator_cadence;
        let active = inner.generator.as_mut().filter(|g| g.is_inline())?;
        if now < active.next_due {
            return None;
        }
        active.next_due = now + cadence;
        let samples = inner.write_format.sample_rate() as u128 * cadence.as_millis() / 1000;
        let bytes = inner.write_format.bytes_for_samples(samples as usize).unwrap_or(0);
        Some((bytes, samples as usize))
    }

    /// Inline generator work paced by a received voice frame
    fn generator_for_voice(&self, inner: &mut ChannelInner, frame: &Frame, now: Instant) -> GenerateRequest {
        let write_rate = inner.write_format.sample_rate() as u64;
        let cadence = self.options.generator_cadence;
        let active = inner.generator.as_mut().filter(|g| g.is_inline())?;
        active.next_due = now + cadence;
        let read_rate = frame.format().map(|f| f.sample_rate() as u64).unwrap_or(0);
        let samples = if read_rate > 0 && read_rate != write_rate {
            frame.samples as u64 * write_rate / read_rate
        } else {
            frame.samples as u64
        };
        Some((frame.data.len(), samples as usize))
    }

    fn process_read(
        &self,
        inner: &mut ChannelInner,
        frame: Frame,
        drop_audio: bool,
        now: Instant,
        tail_len: usize,
    ) -> (Frame, GenerateRequest) {
        let mut frame = self.detect_inband(inner, frame, tail_len);

        match frame.kind {
            FrameKind::Control(ControlKind::Answer) => {
                if !inner.flags.outgoing {
                    debug!("Ignoring answer on inbound channel {}", inner.name);
                    frame = Frame::null();
                } else if inner.state == ChannelState::Up && inner.bridged.is_some() {
                    debug!("Dropping duplicate answer on {}", inner.name);
                    frame = Frame::null();
                } else {
                    inner.state = ChannelState::Up;
                }
            }
            FrameKind::DtmfEnd(digit) => {
                frame = self.read_dtmf_end(inner, frame, digit, now);
            }
            FrameKind::DtmfBegin(digit) => {
                let gap = self.options.dtmf_min_gap_ms;
                if inner.dtmf.holds_digits(now, gap) || inner.dtmf.end_only {
                    debug!("Dropping DTMF begin {} on {}", digit, inner.name);
                    frame = Frame::null();
                } else {
                    inner.dtmf.in_dtmf = true;
                    inner.dtmf.last = Some(now);
                    debug!("DTMF begin {} passed up on {}", digit, inner.name);
                }
            }
            FrameKind::Null => {
                let dtmf = &mut inner.dtmf;
                if dtmf.emulating {
                    if dtmf.emulate_duration_ms == 0 {
                        dtmf.emulating = false;
                        dtmf.emulate_digit = None;
                    } else if dtmf.elapsed_ms(now) >= dtmf.emulate_duration_ms {
                        if let Some(digit) = dtmf.emulate_digit {
                            frame = Frame::dtmf_end(digit, dtmf.elapsed_ms(now));
                        }
                        dtmf.emulate_duration_ms = 0;
                        dtmf.last = Some(now);
                        dtmf.emulating = false;
                        dtmf.emulate_digit = None;
                    }
                }
            }
            FrameKind::Voice(format) => {
                if inner.dtmf.emulating && inner.dtmf.emulate_duration_ms == 0 {
                    inner.dtmf.emulating = false;
                    inner.dtmf.emulate_digit = None;
                }

                if drop_audio || inner.dtmf.in_dtmf {
                    let generate = if drop_audio {
                        self.generator_for_voice(inner, &frame, now)
                    } else {
                        None
                    };
                    return (Frame::null(), generate);
                }

                if inner.dtmf.emulating {
                    let elapsed = inner.dtmf.elapsed_ms(now);
                    let dtmf = &mut inner.dtmf;
                    return match dtmf.emulate_digit {
                        Some(digit) if elapsed >= dtmf.emulate_duration_ms => {
                            dtmf.emulate_duration_ms = 0;
                            dtmf.last = Some(now);
                            (Frame::dtmf_end(digit, elapsed), None)
                        }
                        _ => (Frame::null(), None),
                    };
                }

                if !inner.native_formats.is_empty() && !inner.native_formats.contains(format) {
                    debug!(
                        "Dropping incompatible voice frame on {} ({} not in {})",
                        inner.name, format, inner.native_formats
                    );
                    return (Frame::null(), None);
                }

                let generate = self.generator_for_voice(inner, &frame, now);
                return (self.translate_read(inner, frame, tail_len), generate);
            }
            _ => {}
        }
        (frame, None)
    }

    fn read_dtmf_end(&self, inner: &mut ChannelInner, frame: Frame, digit: DtmfDigit, now: Instant) -> Frame {
        let min = self.options.dtmf_min_duration_ms;
        let mut frame = frame;
        let mut len = frame.duration_ms;

        if inner.dtmf.defer || inner.dtmf.emulating {
            debug!("Deferring DTMF end {} on {}", digit, inner.name);
            enqueue(inner, &self.options, vec![frame], QueuePosition::Tail);
            return Frame::null();
        }

        if !inner.dtmf.in_dtmf && !inner.dtmf.end_only {
            if inner.dtmf.within_gap(now, self.options.dtmf_min_gap_ms) {
                debug!("DTMF end {} too close to the last digit on {}, deferring", digit, inner.name);
                enqueue(inner, &self.options, vec![frame], QueuePosition::Tail);
                return Frame::null();
            }
            let dtmf = &mut inner.dtmf;
            dtmf.emulating = true;
            dtmf.emulate_digit = Some(digit);
            dtmf.last = Some(now);
            dtmf.emulate_duration_ms = if len > 0 {
                len.max(min)
            } else {
                self.options.dtmf_default_duration_ms
            };
            debug!(
                "DTMF end {} without begin on {}, emulating {} ms",
                digit, inner.name, inner.dtmf.emulate_duration_ms
            );
            let mut begin = Frame::dtmf_begin(digit);
            begin.src = frame.src;
            return begin;
        }

        let dtmf = &mut inner.dtmf;
        if dtmf.in_dtmf {
            dtmf.in_dtmf = false;
            let actual = dtmf.elapsed_ms(now);
            if len == 0 || actual < min {
                len = actual;
            }
        } else if len == 0 {
            len = min;
        }

        if len < min && !dtmf.end_only {
            // the emulated end is due `min` after the begin that was passed up
            dtmf.emulating = true;
            dtmf.emulate_digit = Some(digit);
            dtmf.emulate_duration_ms = min;
            debug!("DTMF end {} after {} ms on {}, holding until {} ms", digit, len, inner.name, min);
            return Frame::null();
        }

        dtmf.last = Some(now);
        frame.duration_ms = len.max(min);
        frame
    }

    fn detect_inband(&self, inner: &mut ChannelInner, frame: Frame, tail_len: usize) -> Frame {
        if !frame.is_voice() {
            return frame;
        }
        let Some(dsp) = inner.dsp.as_mut() else {
            return frame;
        };
        let Some(pcm) = decode_to_slin(&frame) else {
            return frame;
        };

        let mut digits: FrameList = dsp
            .process(&pcm)
            .into_iter()
            .map(|event| match event {
                DtmfEvent::Begin(d) => Frame::dtmf_begin(d),
                DtmfEvent::End(d, ms) => Frame::dtmf_end(d, ms),
            })
            .collect();
        let sounding = dsp.current().is_some();

        if digits.is_empty() {
            // mute the tone while it sounds
            return if sounding { Frame::null() } else { frame };
        }
        let first = digits.remove(0);
        if !digits.is_empty() {
            enqueue(inner, &self.options, digits, QueuePosition::At(tail_len));
        }
        first
    }

    fn translate_read(&self, inner: &mut ChannelInner, frame: Frame, tail_len: usize) -> Frame {
        let translated = match inner.read_trans.as_mut() {
            Some(path) if frame.format() == Some(path.source()) => path.translate(frame),
            _ => return frame,
        };
        match translated {
            Ok(mut frames) if !frames.is_empty() => {
                let first = frames.remove(0);
                if !frames.is_empty() {
                    enqueue(inner, &self.options, frames, QueuePosition::At(tail_len));
                }
                first
            }
            Ok(_) => Frame::null(),
            Err(e) => {
                warn!("Read translation failed on {}: {}", inner.name, e);
                Frame::null()
            }
        }
    }
}
