//! The frame model
//!
//! A [`Frame`] is the unit of media or control data passed between channels.
//! Frames are cheap to clone: the payload is a reference counted [`Bytes`].

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::dtmf::DtmfDigit;
use crate::format::Format;

/// Source marker carried by frames that only "prod" a generator
pub const PROD_SOURCE: &str = "prod";

/// Control frame sub-types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlKind {
    /// Other end has hung up
    Hangup,
    /// Local ring
    Ring,
    /// Remote end is ringing
    Ringing,
    /// Remote end has answered
    Answer,
    /// Remote end is busy
    Busy,
    /// Make it go off hook
    TakeOffHook,
    /// Line is off hook
    OffHook,
    /// Congestion (circuits busy)
    Congestion,
    /// Flash hook
    Flash,
    /// Wink
    Wink,
    /// Call progress indication
    Progress,
    /// Call is proceeding
    Proceeding,
    /// Put the party on hold
    Hold,
    /// Take the party off hold
    Unhold,
    /// Video refresh request
    VidUpdate,
    /// Media source changed, sequence continues
    SrcUpdate,
    /// Media source changed, new stream
    SrcChange,
    /// Terminal marker left in a queue once a hang-up has been delivered
    EndOfQueue,
    /// Technology specific condition
    Other(u16),
}

impl ControlKind {
    /// Conditions that stay audible until replaced, and so must survive a masquerade
    pub fn is_visible_indication(self) -> bool {
        matches!(
            self,
            ControlKind::Ringing | ControlKind::Hold | ControlKind::Progress | ControlKind::Busy
                | ControlKind::Congestion
        )
    }

    /// Conditions that end a call
    pub fn is_terminal(self) -> bool {
        matches!(self, ControlKind::Hangup | ControlKind::Busy | ControlKind::Congestion)
    }
}

/// Frame kind, with the data that selects the sub-type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    Voice(Format),
    Video(Format),
    DtmfBegin(DtmfDigit),
    DtmfEnd(DtmfDigit),
    Control(ControlKind),
    Text,
    /// No-op frame, used to wake readers
    Null,
}

impl FrameKind {
    /// Frames the queue may discard when it grows too long
    pub fn is_prunable(&self) -> bool {
        matches!(self, FrameKind::Voice(_) | FrameKind::Video(_) | FrameKind::Null)
    }
}

/// A unit of media or control data
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub data: Bytes,
    /// Number of media samples in `data`
    pub samples: u32,
    /// Duration in ms; for DTMF frames the digit length
    pub duration_ms: u32,
    /// Name of whatever produced the frame
    pub src: Option<&'static str>,
}

/// A short ordered list of frames
pub type FrameList = Vec<Frame>;

impl Frame {
    fn with_kind(kind: FrameKind) -> Self {
        Self {
            kind,
            data: Bytes::new(),
            samples: 0,
            duration_ms: 0,
            src: None,
        }
    }

    pub fn null() -> Self {
        Self::with_kind(FrameKind::Null)
    }

    /// Voice frame; `samples` is the number of samples encoded in `data`
    pub fn voice(format: Format, data: impl Into<Bytes>, samples: u32) -> Self {
        let duration_ms = if format.sample_rate() > 0 {
            samples * 1000 / format.sample_rate()
        } else {
            0
        };
        Self {
            kind: FrameKind::Voice(format),
            data: data.into(),
            samples,
            duration_ms,
            src: None,
        }
    }

    /// Signed linear voice frame built from samples
    pub fn from_slin(format: Format, samples: &[i16]) -> Self {
        let mut buf = BytesMut::with_capacity(samples.len() * 2);
        for s in samples {
            buf.put_i16_le(*s);
        }
        Self::voice(format, buf.freeze(), samples.len() as u32)
    }

    pub fn video(format: Format, data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Self::with_kind(FrameKind::Video(format))
        }
    }

    pub fn dtmf_begin(digit: DtmfDigit) -> Self {
        Self::with_kind(FrameKind::DtmfBegin(digit))
    }

    pub fn dtmf_end(digit: DtmfDigit, duration_ms: u32) -> Self {
        Self {
            duration_ms,
            ..Self::with_kind(FrameKind::DtmfEnd(digit))
        }
    }

    pub fn control(kind: ControlKind) -> Self {
        Self::with_kind(FrameKind::Control(kind))
    }

    pub fn control_with_data(kind: ControlKind, data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Self::with_kind(FrameKind::Control(kind))
        }
    }

    /// Hang-up control frame carrying a cause code
    pub fn hangup(cause: u32) -> Self {
        Self::control_with_data(ControlKind::Hangup, Bytes::copy_from_slice(&cause.to_be_bytes()))
    }

    pub fn text(text: &str) -> Self {
        Self {
            data: Bytes::copy_from_slice(text.as_bytes()),
            ..Self::with_kind(FrameKind::Text)
        }
    }

    /// Marker frame a generator writes to bypass its own interruption check
    pub fn prod(format: Format, data: impl Into<Bytes>, samples: u32) -> Self {
        Self::voice(format, data, samples).with_src(PROD_SOURCE)
    }

    pub fn with_src(mut self, src: &'static str) -> Self {
        self.src = Some(src);
        self
    }

    pub fn is_prod(&self) -> bool {
        self.src == Some(PROD_SOURCE)
    }

    pub fn is_voice(&self) -> bool {
        matches!(self.kind, FrameKind::Voice(_))
    }

    pub fn is_null(&self) -> bool {
        self.kind == FrameKind::Null
    }

    pub fn control_kind(&self) -> Option<ControlKind> {
        match self.kind {
            FrameKind::Control(kind) => Some(kind),
            _ => None,
        }
    }

    /// Format of a voice or video frame
    pub fn format(&self) -> Option<Format> {
        match self.kind {
            FrameKind::Voice(f) | FrameKind::Video(f) => Some(f),
            _ => None,
        }
    }

    /// Digit of a DTMF begin or end frame
    pub fn digit(&self) -> Option<DtmfDigit> {
        match self.kind {
            FrameKind::DtmfBegin(d) | FrameKind::DtmfEnd(d) => Some(d),
            _ => None,
        }
    }

    /// Cause code carried by a hang-up frame
    pub fn hangup_cause(&self) -> Option<u32> {
        if self.control_kind() != Some(ControlKind::Hangup) {
            return None;
        }
        let bytes: [u8; 4] = self.data.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// Decode a signed linear payload
    pub fn slin_samples(&self) -> Option<Vec<i16>> {
        match self.kind {
            FrameKind::Voice(Format::Slin8) | FrameKind::Voice(Format::Slin16) => Some(
                self.data
                    .chunks_exact(2)
                    .map(|c| i16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ),
            _ => None,
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Frame");
        s.field("kind", &self.kind);
        if !self.data.is_empty() {
            s.field("len", &self.data.len());
        }
        if self.samples > 0 {
            s.field("samples", &self.samples);
        }
        if self.duration_ms > 0 {
            s.field("duration_ms", &self.duration_ms);
        }
        if let Some(src) = self.src {
            s.field("src", &src);
        }
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hangup_cause_payload() {
        let f = Frame::hangup(16);
        assert_eq!(f.control_kind(), Some(ControlKind::Hangup));
        assert_eq!(f.hangup_cause(), Some(16));
        assert_eq!(Frame::control(ControlKind::Hangup).hangup_cause(), None);
        assert_eq!(Frame::control(ControlKind::Busy).hangup_cause(), None);
    }

    #[test]
    fn test_voice_duration_and_samples() {
        let f = Frame::from_slin(Format::Slin8, &[1, -1, 300, -300]);
        assert_eq!(f.samples, 4);
        assert_eq!(f.data.len(), 8);
        assert_eq!(f.slin_samples().unwrap(), vec![1, -1, 300, -300]);

        let ulaw = Frame::voice(Format::Ulaw, vec![0xffu8; 160], 160);
        assert_eq!(ulaw.duration_ms, 20);
        assert!(ulaw.slin_samples().is_none());
    }

    #[test]
    fn test_prod_marker() {
        let f = Frame::prod(Format::Slin8, vec![0u8; 320], 160);
        assert!(f.is_prod());
        assert!(f.is_voice());
        assert!(!Frame::null().is_prod());
    }

    #[test]
    fn test_prunable_kinds() {
        assert!(FrameKind::Null.is_prunable());
        assert!(FrameKind::Voice(Format::Ulaw).is_prunable());
        assert!(!FrameKind::Control(ControlKind::Hangup).is_prunable());
        assert!(!FrameKind::DtmfEnd(DtmfDigit::One).is_prunable());
    }
}
