//! Tone list parsing and synthesis
//!
//! Tone lists use the familiar telephony indication syntax: a comma separated
//! sequence of `[!]freq1[+freq2][/duration_ms]` entries. A frequency of `0`
//! is silence, an entry without a duration plays until the generator is
//! stopped, and entries prefixed with `!` are played once and skipped when
//! the list repeats.

use std::f32::consts::PI;

use crate::error::{Error, Result};

/// Per-tone peak amplitude for synthesized tones
const DEFAULT_AMPLITUDE: f32 = 8192.0;

/// One entry of a tone list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToneEntry {
    pub freq1: u32,
    pub freq2: u32,
    pub duration_ms: Option<u32>,
    pub once: bool,
}

impl ToneEntry {
    fn parse(item: &str) -> Result<Self> {
        let item = item.trim();
        let (once, item) = match item.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, item),
        };
        let (freqs, duration) = match item.split_once('/') {
            Some((f, d)) => (f, Some(d)),
            None => (item, None),
        };
        let (f1, f2) = match freqs.split_once('+') {
            Some((a, b)) => (a, Some(b)),
            None => (freqs, None),
        };

        let parse_num = |s: &str| {
            s.trim()
                .parse::<u32>()
                .map_err(|_| Error::invalid_tone(format!("bad number {:?} in {:?}", s, item)))
        };

        let duration_ms = duration.map(parse_num).transpose()?;
        if duration_ms == Some(0) {
            return Err(Error::invalid_tone(format!("zero duration in {:?}", item)));
        }

        Ok(Self {
            freq1: parse_num(f1)?,
            freq2: f2.map(parse_num).transpose()?.unwrap_or(0),
            duration_ms,
            once,
        })
    }
}

/// A parsed tone list with its synthesis position
#[derive(Debug, Clone)]
pub struct ToneList {
    entries: Vec<ToneEntry>,
    sample_rate: u32,
    amplitude: f32,
    index: usize,
    entry_pos: usize,
    finished: bool,
}

impl ToneList {
    /// Parse a tone list for synthesis at `sample_rate`
    pub fn parse(spec: &str, sample_rate: u32) -> Result<Self> {
        if sample_rate == 0 {
            return Err(Error::invalid_parameter("sample rate must be non-zero"));
        }
        let entries = spec
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(ToneEntry::parse)
            .collect::<Result<Vec<_>>>()?;
        if entries.is_empty() {
            return Err(Error::invalid_tone(format!("empty tone list {:?}", spec)));
        }
        Ok(Self {
            entries,
            sample_rate,
            amplitude: DEFAULT_AMPLITUDE,
            index: 0,
            entry_pos: 0,
            finished: false,
        })
    }

    pub fn entries(&self) -> &[ToneEntry] {
        &self.entries
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Whether every entry has been played and none repeats
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Synthesize up to `samples` samples; fewer are returned once the list is finished
    pub fn generate(&mut self, samples: usize) -> Vec<i16> {
        let mut out = Vec::with_capacity(samples);
        while out.len() < samples && !self.finished {
            let entry = self.entries[self.index];
            let entry_len = entry
                .duration_ms
                .map(|ms| (ms as usize * self.sample_rate as usize) / 1000);

            let remaining_in_entry = entry_len.map_or(usize::MAX, |len| len - self.entry_pos.min(len));
            let take = remaining_in_entry.min(samples - out.len());
            for _ in 0..take {
                out.push(self.sample(entry, self.entry_pos));
                self.entry_pos += 1;
            }

            if entry_len.is_some_and(|len| self.entry_pos >= len) {
                self.advance();
            }
        }
        out
    }

    fn sample(&self, entry: ToneEntry, pos: usize) -> i16 {
        let t = pos as f32 / self.sample_rate as f32;
        let mut value = 0.0;
        for freq in [entry.freq1, entry.freq2] {
            if freq != 0 {
                value += self.amplitude * (2.0 * PI * freq as f32 * t).sin();
            }
        }
        value.clamp(i16::MIN as f32, i16::MAX as f32) as i16
    }

    fn advance(&mut self) {
        self.entry_pos = 0;
        if self.index + 1 < self.entries.len() {
            self.index += 1;
            return;
        }
        match self.entries.iter().position(|e| !e.once) {
            Some(first_repeating) => self.index = first_repeating,
            None => self.finished = true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entries() {
        let list = ToneList::parse("!350+440/100,0/50, 480", 8000).unwrap();
        assert_eq!(
            list.entries(),
            &[
                ToneEntry { freq1: 350, freq2: 440, duration_ms: Some(100), once: true },
                ToneEntry { freq1: 0, freq2: 0, duration_ms: Some(50), once: false },
                ToneEntry { freq1: 480, freq2: 0, duration_ms: None, once: false },
            ]
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ToneList::parse("abc", 8000).is_err());
        assert!(ToneList::parse("", 8000).is_err());
        assert!(ToneList::parse("440", 0).is_err());
    }

    #[test]
    fn test_play_once_list_finishes() {
        let mut list = ToneList::parse("!440/10,!0/10", 8000).unwrap();
        let samples = list.generate(1000);
        assert_eq!(samples.len(), 160);
        assert!(list.is_finished());
        // second entry is silence
        assert!(samples[80..].iter().all(|s| *s == 0));
    }

    #[test]
    fn test_repeating_list_never_finishes() {
        let mut list = ToneList::parse("!440/10,0/10", 8000).unwrap();
        assert_eq!(list.generate(1000).len(), 1000);
        assert!(!list.is_finished());
    }
}
