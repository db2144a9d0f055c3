//! DTMF digits, tone tables and in-band detection
//!
//! The switching core reports every digit as a begin/end pair. The timing
//! constants here bound how short a digit and how short the silence between
//! two digits may be before the read pipeline starts emulating.

use std::f32::consts::PI;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Duration used when a digit arrives with no duration at all (ms)
pub const DEFAULT_EMULATE_DTMF_DURATION_MS: u32 = 100;

/// Minimum duration of a digit as seen downstream (ms)
pub const MIN_DTMF_DURATION_MS: u32 = 80;

/// Minimum silence between the end of one digit and the begin of the next (ms)
pub const MIN_DTMF_GAP_MS: u32 = 45;

const LOW_FREQS: [f32; 4] = [697.0, 770.0, 852.0, 941.0];
const HIGH_FREQS: [f32; 4] = [1209.0, 1336.0, 1477.0, 1633.0];

/// Keypad layout, rows are low frequencies and columns high frequencies
const KEYPAD: [[DtmfDigit; 4]; 4] = [
    [DtmfDigit::One, DtmfDigit::Two, DtmfDigit::Three, DtmfDigit::A],
    [DtmfDigit::Four, DtmfDigit::Five, DtmfDigit::Six, DtmfDigit::B],
    [DtmfDigit::Seven, DtmfDigit::Eight, DtmfDigit::Nine, DtmfDigit::C],
    [DtmfDigit::Star, DtmfDigit::Zero, DtmfDigit::Pound, DtmfDigit::D],
];

/// A DTMF digit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DtmfDigit {
    Zero,
    One,
    Two,
    Three,
    Four,
    Five,
    Six,
    Seven,
    Eight,
    Nine,
    A,
    B,
    C,
    D,
    Star,
    Pound,
}

impl DtmfDigit {
    /// Parse a digit character. Letters are accepted in either case.
    pub fn from_char(c: char) -> Option<Self> {
        let digit = match c {
            '0' => DtmfDigit::Zero,
            '1' => DtmfDigit::One,
            '2' => DtmfDigit::Two,
            '3' => DtmfDigit::Three,
            '4' => DtmfDigit::Four,
            '5' => DtmfDigit::Five,
            '6' => DtmfDigit::Six,
            '7' => DtmfDigit::Seven,
            '8' => DtmfDigit::Eight,
            '9' => DtmfDigit::Nine,
            'A' | 'a' => DtmfDigit::A,
            'B' | 'b' => DtmfDigit::B,
            'C' | 'c' => DtmfDigit::C,
            'D' | 'd' => DtmfDigit::D,
            '*' => DtmfDigit::Star,
            '#' => DtmfDigit::Pound,
            _ => return None,
        };
        Some(digit)
    }

    /// Parse a digit character, reporting invalid characters as an error
    pub fn parse(c: char) -> Result<Self> {
        Self::from_char(c).ok_or(Error::InvalidDigit(c))
    }

    pub fn as_char(self) -> char {
        match self {
            DtmfDigit::Zero => '0',
            DtmfDigit::One => '1',
            DtmfDigit::Two => '2',
            DtmfDigit::Three => '3',
            DtmfDigit::Four => '4',
            DtmfDigit::Five => '5',
            DtmfDigit::Six => '6',
            DtmfDigit::Seven => '7',
            DtmfDigit::Eight => '8',
            DtmfDigit::Nine => '9',
            DtmfDigit::A => 'A',
            DtmfDigit::B => 'B',
            DtmfDigit::C => 'C',
            DtmfDigit::D => 'D',
            DtmfDigit::Star => '*',
            DtmfDigit::Pound => '#',
        }
    }

    /// Low and high frequency (Hz) of the digit's tone pair
    pub fn frequencies(self) -> (u32, u32) {
        for (row, keys) in KEYPAD.iter().enumerate() {
            if let Some(col) = keys.iter().position(|d| *d == self) {
                return (LOW_FREQS[row] as u32, HIGH_FREQS[col] as u32);
            }
        }
        unreachable!("every digit is on the keypad")
    }

    /// Tone list used to play the digit when a technology cannot signal it natively
    pub fn tone_spec(self) -> String {
        let (low, high) = self.frequencies();
        format!("{}+{}", low, high)
    }
}

impl fmt::Display for DtmfDigit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Parse a digit string such as `"*8"` into digits
pub fn parse_digits(s: &str) -> Result<Vec<DtmfDigit>> {
    s.chars().map(DtmfDigit::parse).collect()
}

/// Change reported by [`DtmfDetector`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtmfEvent {
    /// A digit started sounding
    Begin(DtmfDigit),
    /// A digit stopped, with its measured duration in ms
    End(DtmfDigit, u32),
}

const DETECT_RATE: u32 = 8000;
const BLOCK_SAMPLES: usize = 200;
// blocks a state must persist before it is reported
const CONFIRM_BLOCKS: u32 = 2;
// ignore blocks quieter than this (mean square, normalised samples)
const MIN_BLOCK_ENERGY: f32 = 1.0e-4;

#[derive(Debug, Clone, Copy)]
struct Goertzel {
    cosine: f32,
    sine: f32,
    coefficient: f32,
}

impl Goertzel {
    fn new(freq: f32) -> Self {
        let k = freq * BLOCK_SAMPLES as f32 / DETECT_RATE as f32;
        let omega = 2.0 * PI * k / BLOCK_SAMPLES as f32;
        Self {
            cosine: omega.cos(),
            sine: omega.sin(),
            coefficient: 2.0 * omega.cos(),
        }
    }

    fn power(&self, block: &[f32]) -> f32 {
        let (mut prev, mut prevprev) = (0.0f32, 0.0f32);
        for &sample in block {
            let current = self.coefficient * prev - prevprev + sample;
            prevprev = prev;
            prev = current;
        }
        let real = prev - prevprev * self.cosine;
        let imag = prevprev * self.sine;
        real * real + imag * imag
    }
}

/// Goertzel based in-band DTMF detector for signed linear 8 kHz audio
///
/// Audio is consumed in 25 ms blocks. A digit is reported once it has been
/// present for two consecutive blocks and ended once it has been absent for
/// two consecutive blocks.
pub struct DtmfDetector {
    lows: [Goertzel; 4],
    highs: [Goertzel; 4],
    low_harmonics: [Goertzel; 4],
    high_harmonics: [Goertzel; 4],
    block: Vec<f32>,
    candidate: Option<DtmfDigit>,
    candidate_blocks: u32,
    reported: Option<DtmfDigit>,
    reported_samples: usize,
}

impl Default for DtmfDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl DtmfDetector {
    pub fn new() -> Self {
        Self {
            lows: LOW_FREQS.map(Goertzel::new),
            highs: HIGH_FREQS.map(Goertzel::new),
            low_harmonics: LOW_FREQS.map(|f| Goertzel::new(f * 2.0)),
            high_harmonics: HIGH_FREQS.map(|f| Goertzel::new(f * 2.0)),
            block: Vec::with_capacity(BLOCK_SAMPLES),
            candidate: None,
            candidate_blocks: 0,
            reported: None,
            reported_samples: 0,
        }
    }

    /// Feed signed linear samples, returning the digit changes they complete
    pub fn process(&mut self, samples: &[i16]) -> Vec<DtmfEvent> {
        let mut events = Vec::new();
        for &sample in samples {
            self.block.push(sample as f32 / 32768.0);
            if self.block.len() == BLOCK_SAMPLES {
                self.process_block(&mut events);
                self.block.clear();
            }
        }
        events
    }

    /// Digit currently considered to be sounding
    pub fn current(&self) -> Option<DtmfDigit> {
        self.reported
    }

    pub fn reset(&mut self) {
        self.block.clear();
        self.candidate = None;
        self.candidate_blocks = 0;
        self.reported = None;
        self.reported_samples = 0;
    }

    fn process_block(&mut self, events: &mut Vec<DtmfEvent>) {
        let detected = self.classify_block();

        if detected == self.candidate {
            self.candidate_blocks = self.candidate_blocks.saturating_add(1);
        } else {
            self.candidate = detected;
            self.candidate_blocks = 1;
        }

        if self.reported.is_some() {
            self.reported_samples += BLOCK_SAMPLES;
        }

        if self.candidate_blocks == CONFIRM_BLOCKS && self.candidate != self.reported {
            if let Some(old) = self.reported.take() {
                // the trailing confirmation blocks were silence
                let sounding = self
                    .reported_samples
                    .saturating_sub(BLOCK_SAMPLES * CONFIRM_BLOCKS as usize);
                let ms = (sounding as u32 * 1000) / DETECT_RATE;
                events.push(DtmfEvent::End(old, ms));
            }
            if let Some(new) = self.candidate {
                events.push(DtmfEvent::Begin(new));
                self.reported = Some(new);
                self.reported_samples = BLOCK_SAMPLES * CONFIRM_BLOCKS as usize;
            }
        }
    }

    fn classify_block(&self) -> Option<DtmfDigit> {
        let energy: f32 =
            self.block.iter().map(|s| s * s).sum::<f32>() / self.block.len() as f32;
        if energy < MIN_BLOCK_ENERGY {
            return None;
        }

        let low_powers = self.lows.map(|g| g.power(&self.block));
        let high_powers = self.highs.map(|g| g.power(&self.block));
        let low = dominant(&low_powers)?;
        let high = dominant(&high_powers)?;

        // strong harmonics mean speech or music, not a tone pair
        if self.low_harmonics[low].power(&self.block) > low_powers[low] / 8.0
            || self.high_harmonics[high].power(&self.block) > high_powers[high] / 8.0
        {
            return None;
        }

        Some(KEYPAD[low][high])
    }
}

/// Index of the dominant bin, if it is eight times stronger than the others combined
fn dominant(powers: &[f32; 4]) -> Option<usize> {
    let (idx, peak) = powers
        .iter()
        .copied()
        .enumerate()
        .fold((0, f32::MIN), |best, (i, p)| if p > best.1 { (i, p) } else { best });
    let others: f32 = powers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != idx)
        .map(|(_, p)| *p)
        .sum();
    (others * 8.0 < peak).then_some(idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tones::ToneList;

    fn tone_samples(digit: DtmfDigit, ms: u32) -> Vec<i16> {
        let mut list = ToneList::parse(&digit.tone_spec(), DETECT_RATE).unwrap();
        list.generate(((DETECT_RATE * ms) / 1000) as usize)
    }

    #[test]
    fn test_digit_table() {
        assert_eq!(DtmfDigit::Zero.tone_spec(), "941+1336");
        assert_eq!(DtmfDigit::One.tone_spec(), "697+1209");
        assert_eq!(DtmfDigit::Star.tone_spec(), "941+1209");
        assert_eq!(DtmfDigit::Pound.tone_spec(), "941+1477");
        assert_eq!(DtmfDigit::D.tone_spec(), "941+1633");
        assert_eq!(DtmfDigit::from_char('b'), Some(DtmfDigit::B));
        assert_eq!(DtmfDigit::from_char('x'), None);
        assert_eq!(parse_digits("*8").unwrap(), vec![DtmfDigit::Star, DtmfDigit::Eight]);
        assert!(parse_digits("1x").is_err());
    }

    #[test]
    fn test_detector_reports_begin_and_end() {
        let mut detector = DtmfDetector::new();
        let mut events = detector.process(&tone_samples(DtmfDigit::Five, 200));
        events.extend(detector.process(&vec![0i16; 1600]));

        assert_eq!(events.len(), 2, "events: {:?}", events);
        assert_eq!(events[0], DtmfEvent::Begin(DtmfDigit::Five));
        match events[1] {
            DtmfEvent::End(DtmfDigit::Five, ms) => assert!((150..=250).contains(&ms), "{}", ms),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_detector_ignores_single_frequency() {
        let mut detector = DtmfDetector::new();
        let mut list = ToneList::parse("1000", DETECT_RATE).unwrap();
        let events = detector.process(&list.generate(1600));
        assert!(events.is_empty());
        assert_eq!(detector.current(), None);
    }

    #[test]
    fn test_detector_ignores_silence() {
        let mut detector = DtmfDetector::new();
        assert!(detector.process(&vec![0i16; 4000]).is_empty());
    }
}
