//! Format translation
//!
//! A [`TranslatorPath`] is the chain of [`Translator`]s that converts voice
//! frames between two formats. Only the G.711 companding laws are provided
//! here; other codecs plug in through the [`Translator`] trait.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use once_cell::sync::Lazy;
use tracing::debug;

use crate::error::{Error, Result};
use crate::format::Format;
use crate::frame::{Frame, FrameKind, FrameList};

/// Converts voice frames from one format to another
pub trait Translator: Send {
    fn source(&self) -> Format;
    fn target(&self) -> Format;

    /// Translate one frame. A translator may buffer input and return no
    /// frames, or return several frames for one input.
    fn translate(&mut self, frame: Frame) -> Result<FrameList>;
}

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32635;

fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign = if pcm < 0 { 0x80 } else { 0 };
    if pcm < 0 {
        pcm = -pcm;
    }
    pcm = pcm.min(ULAW_CLIP) + ULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0f;
    !(sign | (exponent << 4) as i32 | mantissa) as u8
}

fn ulaw_to_linear(byte: u8) -> i16 {
    let byte = !byte;
    let sign = byte & 0x80;
    let exponent = ((byte >> 4) & 0x07) as i32;
    let mantissa = (byte & 0x0f) as i32;
    let magnitude = (((mantissa << 3) + ULAW_BIAS) << exponent) - ULAW_BIAS;
    if sign != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

fn linear_to_alaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let mask = if pcm >= 0 {
        0xd5
    } else {
        pcm = -pcm - 1;
        0x55
    };
    pcm = pcm.min(0x7fff);

    let encoded = if pcm < 256 {
        pcm >> 4
    } else {
        let mut exponent = 1;
        let mut shifted = pcm >> 8;
        while shifted > 1 && exponent < 7 {
            shifted >>= 1;
            exponent += 1;
        }
        (exponent << 4) | ((pcm >> (exponent + 3)) & 0x0f)
    };
    (encoded ^ mask) as u8
}

fn alaw_to_linear(byte: u8) -> i16 {
    let byte = byte ^ 0x55;
    let exponent = ((byte & 0x70) >> 4) as i32;
    let mantissa = (byte & 0x0f) as i32;
    let magnitude = if exponent == 0 {
        (mantissa << 4) + 8
    } else {
        ((mantissa << 4) + 0x108) << (exponent - 1)
    };
    if byte & 0x80 != 0 {
        magnitude as i16
    } else {
        -magnitude as i16
    }
}

static ULAW_DECODE: Lazy<[i16; 256]> = Lazy::new(|| std::array::from_fn(|i| ulaw_to_linear(i as u8)));
static ALAW_DECODE: Lazy<[i16; 256]> = Lazy::new(|| std::array::from_fn(|i| alaw_to_linear(i as u8)));

/// Decode an 8 kHz voice frame to signed linear samples for analysis
pub fn decode_to_slin(frame: &Frame) -> Option<Vec<i16>> {
    match frame.kind {
        FrameKind::Voice(Format::Slin8) => frame.slin_samples(),
        FrameKind::Voice(Format::Ulaw) => Some(frame.data.iter().map(|b| ULAW_DECODE[*b as usize]).collect()),
        FrameKind::Voice(Format::Alaw) => Some(frame.data.iter().map(|b| ALAW_DECODE[*b as usize]).collect()),
        _ => None,
    }
}

/// Which companding law a [`G711Translator`] applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum G711Law {
    Ulaw,
    Alaw,
}

impl G711Law {
    fn format(self) -> Format {
        match self {
            G711Law::Ulaw => Format::Ulaw,
            G711Law::Alaw => Format::Alaw,
        }
    }
}

/// G.711 encoder or decoder between the law and signed linear 8 kHz
#[derive(Debug, Clone)]
pub struct G711Translator {
    law: G711Law,
    encode: bool,
}

impl G711Translator {
    /// Signed linear to `law`
    pub fn encoder(law: G711Law) -> Self {
        Self { law, encode: true }
    }

    /// `law` to signed linear
    pub fn decoder(law: G711Law) -> Self {
        Self { law, encode: false }
    }
}

impl Translator for G711Translator {
    fn source(&self) -> Format {
        if self.encode {
            Format::Slin8
        } else {
            self.law.format()
        }
    }

    fn target(&self) -> Format {
        if self.encode {
            self.law.format()
        } else {
            Format::Slin8
        }
    }

    fn translate(&mut self, frame: Frame) -> Result<FrameList> {
        if frame.kind != FrameKind::Voice(self.source()) {
            return Err(Error::translation(format!(
                "{} translator fed {:?}",
                self.source(),
                frame.kind
            )));
        }

        let data: Bytes = if self.encode {
            let samples = frame
                .slin_samples()
                .ok_or_else(|| Error::translation("signed linear payload expected"))?;
            let encode = match self.law {
                G711Law::Ulaw => linear_to_ulaw,
                G711Law::Alaw => linear_to_alaw,
            };
            samples.into_iter().map(encode).collect::<Vec<u8>>().into()
        } else {
            let table: &[i16; 256] = match self.law {
                G711Law::Ulaw => &ULAW_DECODE,
                G711Law::Alaw => &ALAW_DECODE,
            };
            let mut out = BytesMut::with_capacity(frame.data.len() * 2);
            for byte in frame.data.iter() {
                out.put_i16_le(table[*byte as usize]);
            }
            out.freeze()
        };

        let mut translated = Frame::voice(self.target(), data, frame.samples);
        translated.src = frame.src;
        Ok(vec![translated])
    }
}

/// Instantiate a single-step translator, if one exists
fn direct_step(from: Format, to: Format) -> Option<Box<dyn Translator>> {
    let step: Box<dyn Translator> = match (from, to) {
        (Format::Slin8, Format::Ulaw) => Box::new(G711Translator::encoder(G711Law::Ulaw)),
        (Format::Slin8, Format::Alaw) => Box::new(G711Translator::encoder(G711Law::Alaw)),
        (Format::Ulaw, Format::Slin8) => Box::new(G711Translator::decoder(G711Law::Ulaw)),
        (Format::Alaw, Format::Slin8) => Box::new(G711Translator::decoder(G711Law::Alaw)),
        _ => return None,
    };
    Some(step)
}

/// Whether a path can be built between two formats
pub fn can_translate(from: Format, to: Format) -> bool {
    from == to || TranslatorPath::build(from, to).is_ok()
}

/// Ordered chain of translators from one format to another
pub struct TranslatorPath {
    from: Format,
    to: Format,
    steps: Vec<Box<dyn Translator>>,
}

impl TranslatorPath {
    /// Build a path, going through signed linear when no direct step exists
    pub fn build(from: Format, to: Format) -> Result<Self> {
        let no_path = || Error::NoTranslationPath {
            from: from.to_string(),
            to: to.to_string(),
        };
        if from == to {
            return Err(no_path());
        }

        let steps = if let Some(step) = direct_step(from, to) {
            vec![step]
        } else {
            let first = direct_step(from, Format::Slin8).ok_or_else(no_path)?;
            let second = direct_step(Format::Slin8, to).ok_or_else(no_path)?;
            vec![first, second]
        };

        debug!("Built translator path {} -> {} ({} steps)", from, to, steps.len());
        Ok(Self { from, to, steps })
    }

    pub fn source(&self) -> Format {
        self.from
    }

    pub fn target(&self) -> Format {
        self.to
    }

    pub fn steps(&self) -> usize {
        self.steps.len()
    }

    /// Run a frame through every step, keeping output order
    pub fn translate(&mut self, frame: Frame) -> Result<FrameList> {
        let mut frames = vec![frame];
        for step in self.steps.iter_mut() {
            let mut next = Vec::with_capacity(frames.len());
            for f in frames {
                next.extend(step.translate(f)?);
            }
            frames = next;
        }
        Ok(frames)
    }
}

impl fmt::Debug for TranslatorPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TranslatorPath")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("steps", &self.steps.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ulaw_companding_is_close() {
        for sample in [-32000i16, -1000, -8, 0, 8, 1000, 12345, 32000] {
            let decoded = ulaw_to_linear(linear_to_ulaw(sample));
            let error = (decoded as i32 - sample as i32).abs();
            assert!(error <= (sample as i32).abs() / 16 + 8, "{} -> {}", sample, decoded);
        }
    }

    #[test]
    fn test_alaw_companding_is_close() {
        for sample in [-32000i16, -1000, -8, 0, 8, 1000, 12345, 32000] {
            let decoded = alaw_to_linear(linear_to_alaw(sample));
            let error = (decoded as i32 - sample as i32).abs();
            assert!(error <= (sample as i32).abs() / 16 + 16, "{} -> {}", sample, decoded);
        }
    }

    #[test]
    fn test_two_step_path_via_slin() {
        let mut path = TranslatorPath::build(Format::Ulaw, Format::Alaw).unwrap();
        assert_eq!(path.steps(), 2);

        let out = path.translate(Frame::voice(Format::Ulaw, vec![0xffu8; 160], 160)).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, FrameKind::Voice(Format::Alaw));
        assert_eq!(out[0].samples, 160);
        assert_eq!(out[0].data.len(), 160);
    }

    #[test]
    fn test_missing_path() {
        assert!(TranslatorPath::build(Format::Gsm, Format::Ulaw).is_err());
        assert!(TranslatorPath::build(Format::Ulaw, Format::Ulaw).is_err());
        assert!(can_translate(Format::Ulaw, Format::Ulaw));
        assert!(can_translate(Format::Slin8, Format::Alaw));
        assert!(!can_translate(Format::H264, Format::Ulaw));
    }

    #[test]
    fn test_translator_rejects_wrong_input() {
        let mut t = G711Translator::encoder(G711Law::Ulaw);
        assert!(t.translate(Frame::voice(Format::Alaw, vec![0u8; 10], 10)).is_err());
    }
}
