//! Media formats and format sets
//!
//! A [`Format`] identifies the encoding of a voice or video frame. A
//! [`FormatSet`] is the capability bitmask a channel technology advertises
//! and the switching core negotiates against.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Media encoding carried by a voice or video frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// G.711 μ-law, 8 kHz
    Ulaw,
    /// G.711 A-law, 8 kHz
    Alaw,
    /// Signed linear 16-bit, 8 kHz
    Slin8,
    /// Signed linear 16-bit, 16 kHz
    Slin16,
    /// G.722, 16 kHz
    G722,
    /// GSM full rate
    Gsm,
    /// H.264 video
    H264,
    /// VP8 video
    Vp8,
}

impl Format {
    /// All formats known to the core, in preference order
    pub const ALL: [Format; 8] = [
        Format::Slin16,
        Format::G722,
        Format::Slin8,
        Format::Ulaw,
        Format::Alaw,
        Format::Gsm,
        Format::H264,
        Format::Vp8,
    ];

    fn bit(self) -> u32 {
        match self {
            Format::Ulaw => 1 << 0,
            Format::Alaw => 1 << 1,
            Format::Slin8 => 1 << 2,
            Format::Slin16 => 1 << 3,
            Format::G722 => 1 << 4,
            Format::Gsm => 1 << 5,
            Format::H264 => 1 << 16,
            Format::Vp8 => 1 << 17,
        }
    }

    /// Sampling rate in Hz (90 kHz clock for video)
    pub fn sample_rate(self) -> u32 {
        match self {
            Format::Ulaw | Format::Alaw | Format::Slin8 | Format::Gsm => 8000,
            Format::Slin16 | Format::G722 => 16000,
            Format::H264 | Format::Vp8 => 90000,
        }
    }

    /// Whether this is an audio format
    pub fn is_audio(self) -> bool {
        !matches!(self, Format::H264 | Format::Vp8)
    }

    /// Bytes needed for `samples` samples, when the encoding has a fixed size
    pub fn bytes_for_samples(self, samples: usize) -> Option<usize> {
        match self {
            Format::Ulaw | Format::Alaw => Some(samples),
            Format::Slin8 | Format::Slin16 => Some(samples * 2),
            Format::G722 => Some(samples / 2),
            _ => None,
        }
    }

    /// Short name used in logs and configuration
    pub fn name(self) -> &'static str {
        match self {
            Format::Ulaw => "ulaw",
            Format::Alaw => "alaw",
            Format::Slin8 => "slin",
            Format::Slin16 => "slin16",
            Format::G722 => "g722",
            Format::Gsm => "gsm",
            Format::H264 => "h264",
            Format::Vp8 => "vp8",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of formats, stored as a bitmask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FormatSet(u32);

impl FormatSet {
    /// The empty set
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Set containing only `format`
    pub fn only(format: Format) -> Self {
        Self(format.bit())
    }

    /// Build a set from a slice of formats
    pub fn from_formats(formats: &[Format]) -> Self {
        formats.iter().fold(Self::empty(), |set, f| set.with(*f))
    }

    /// Return a copy of the set with `format` added
    pub fn with(self, format: Format) -> Self {
        Self(self.0 | format.bit())
    }

    pub fn insert(&mut self, format: Format) {
        self.0 |= format.bit();
    }

    pub fn contains(&self, format: Format) -> bool {
        self.0 & format.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Formats present in both sets
    pub fn intersection(&self, other: &FormatSet) -> FormatSet {
        FormatSet(self.0 & other.0)
    }

    /// Iterate the formats of the set in preference order
    pub fn iter(&self) -> impl Iterator<Item = Format> + '_ {
        Format::ALL.into_iter().filter(move |f| self.contains(*f))
    }

    /// Most preferred audio format in the set
    pub fn best_audio(&self) -> Option<Format> {
        self.iter().find(|f| f.is_audio())
    }
}

impl fmt::Display for FormatSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(Format::name).collect();
        write!(f, "({})", names.join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_set_preference_order() {
        let set = FormatSet::from_formats(&[Format::Ulaw, Format::Slin8, Format::H264]);
        assert_eq!(set.best_audio(), Some(Format::Slin8));
        assert!(set.contains(Format::H264));
        assert!(!set.contains(Format::Alaw));
        assert_eq!(set.to_string(), "(slin|ulaw|h264)");
    }

    #[test]
    fn test_video_only_set_has_no_audio() {
        let set = FormatSet::only(Format::Vp8);
        assert_eq!(set.best_audio(), None);
        assert!(FormatSet::empty().is_empty());
    }
}
