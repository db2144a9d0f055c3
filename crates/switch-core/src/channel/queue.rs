//! The channel's inbound frame queue
//!
//! Technologies and the core queue frames for whoever reads the channel.
//! The queue is bounded: once it grows past the configured limits, voice,
//! video and no-op frames are discarded oldest first to make room. The
//! most recent frame always survives, and nothing is queued behind a
//! hang-up.

use rvoip_media_core::{ControlKind, Frame, FrameKind, FrameList};
use tracing::{debug, warn};

use super::{Channel, ChannelInner, ChannelOptions, SoftHangup};

/// Where new frames go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueuePosition {
    Tail,
    Head,
    /// Before the frame currently at this index
    At(usize),
}

fn ends_queue(frame: &Frame) -> bool {
    matches!(
        frame.control_kind(),
        Some(ControlKind::Hangup) | Some(ControlKind::EndOfQueue)
    )
}

/// Queue frames on a locked channel. Returns false when they were refused.
pub(crate) fn enqueue(
    inner: &mut ChannelInner,
    options: &ChannelOptions,
    frames: FrameList,
    position: QueuePosition,
) -> bool {
    if frames.is_empty() {
        return false;
    }
    if inner.readq.iter().any(ends_queue) {
        debug!("Not queuing {} frames behind a hangup on {}", frames.len(), inner.name);
        return false;
    }

    let new_frames = frames.len();
    let new_voice = frames.iter().filter(|f| f.is_voice()).count();
    let queued = inner.readq.len();
    let queued_voice = inner.readq.iter().filter(|f| f.is_voice()).count();

    let too_long = queued + new_frames > options.queue_max_frames;
    if too_long || queued_voice + new_voice > options.queue_max_voice_frames {
        warn!(
            "Exceptionally long {}queue length queuing to {}",
            if too_long { "" } else { "voice " },
            inner.name
        );
        let mut removed = 0usize;
        let mut i = 0;
        while i + 1 < inner.readq.len() && removed < options.queue_prune_frames {
            if inner.readq[i].kind.is_prunable() {
                inner.readq.remove(i);
                removed += 1;
            } else {
                i += 1;
            }
        }
        inner.stats.dropped_frames += removed as u64;
    }

    match position {
        QueuePosition::Tail => inner.readq.extend(frames),
        QueuePosition::Head => {
            for frame in frames.into_iter().rev() {
                inner.readq.push_front(frame);
            }
        }
        QueuePosition::At(index) => {
            let start = index.min(inner.readq.len());
            for (offset, frame) in frames.into_iter().enumerate() {
                inner.readq.insert(start + offset, frame);
            }
        }
    }
    true
}

impl Channel {
    fn queue_at(&self, frames: FrameList, position: QueuePosition) -> bool {
        let queued = {
            let mut inner = self.inner.lock();
            enqueue(&mut inner, &self.options, frames, position)
        };
        if queued {
            self.wake();
        }
        queued
    }

    /// Queue a frame for the channel's reader
    pub fn queue_frame(&self, frame: Frame) -> bool {
        self.queue_at(vec![frame], QueuePosition::Tail)
    }

    /// Queue a frame ahead of everything already queued
    pub fn queue_frame_head(&self, frame: Frame) -> bool {
        self.queue_at(vec![frame], QueuePosition::Head)
    }

    /// Queue several frames, keeping their order
    pub fn queue_frames(&self, frames: FrameList) -> bool {
        self.queue_at(frames, QueuePosition::Tail)
    }

    pub fn queue_control(&self, kind: ControlKind) -> bool {
        self.queue_frame(Frame::control(kind))
    }

    pub fn queue_control_data(&self, kind: ControlKind, data: &[u8]) -> bool {
        self.queue_frame(Frame::control_with_data(kind, data.to_vec()))
    }

    /// Signal that the far end hung up
    pub fn queue_hangup(&self, cause: Option<u32>) -> bool {
        let frame = {
            let mut inner = self.inner.lock();
            if let Some(cause) = cause {
                inner.hangup_cause = cause;
            }
            inner.softhangup.insert(SoftHangup::DEV);
            Frame::hangup(inner.hangup_cause)
        };
        self.queue_frame(frame)
    }

    pub fn queued_frames(&self) -> usize {
        self.inner.lock().readq.len()
    }

    /// Kinds of the queued frames, oldest first
    pub fn queued_kinds(&self) -> Vec<FrameKind> {
        self.inner.lock().readq.iter().map(|f| f.kind).collect()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.inner.lock().stats.dropped_frames
    }
}
