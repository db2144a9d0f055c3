//! # Media Core library for the RVOIP switching core
//!
//! `media-core` holds the media building blocks the channel switching core
//! is made of. Nothing here knows about channels: these types are shared by
//! channel technologies, the read/write pipeline and the bridge.
//!
//! This crate provides:
//!
//! - The [`Frame`] model: voice, video, DTMF, control, text and no-op frames
//! - Media [`Format`]s and capability [`FormatSet`]s
//! - [`TranslatorPath`]s between formats, with G.711 translators
//! - A byte-oriented [`JitterBuffer`] with threshold priming and overflow resync
//! - DTMF digit tables, timing constants and a Goertzel in-band detector
//! - Tone list parsing and synthesis for indication and DTMF generators
//!
//! ## Quick Start
//!
//! ```rust
//! use rvoip_media_core::prelude::*;
//!
//! let jb = JitterBuffer::new(JitterBufferConfig::new(400, 40));
//! jb.fill(&[0u8; 40]).unwrap();
//! let mut out = [0u8; 40];
//! assert_eq!(jb.drain(&mut out), 40);
//!
//! let f = Frame::dtmf_end(DtmfDigit::Star, 120);
//! assert_eq!(f.digit(), Some(DtmfDigit::Star));
//! ```

pub mod dtmf;
pub mod error;
pub mod format;
pub mod frame;
pub mod jitter;
pub mod tones;
pub mod translate;

pub use dtmf::{DtmfDetector, DtmfDigit, DtmfEvent};
pub use error::{Error, Result};
pub use format::{Format, FormatSet};
pub use frame::{ControlKind, Frame, FrameKind, FrameList};
pub use jitter::{JitterBuffer, JitterBufferConfig, JitterBufferStats};
pub use tones::ToneList;
pub use translate::{Translator, TranslatorPath};

/// Media sample type (signed linear audio)
pub type Sample = i16;

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::dtmf::{
        DtmfDetector, DtmfDigit, DtmfEvent, DEFAULT_EMULATE_DTMF_DURATION_MS,
        MIN_DTMF_DURATION_MS, MIN_DTMF_GAP_MS,
    };
    pub use crate::error::{Error, Result};
    pub use crate::format::{Format, FormatSet};
    pub use crate::frame::{ControlKind, Frame, FrameKind, FrameList};
    pub use crate::jitter::{JitterBuffer, JitterBufferConfig};
    pub use crate::tones::ToneList;
    pub use crate::translate::{Translator, TranslatorPath};
}
