//! Fixed capacity byte jitter buffer
//!
//! Technologies that receive audio in bursts (ISDN B-channels, network
//! transports) fill the buffer as data arrives; the channel's paced reader
//! drains it. The buffer withholds data until `upper_threshold` bytes have
//! accumulated, and on overflow it resynchronises its read cursor
//! `upper_threshold` bytes behind the write cursor.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Smallest accepted buffer size in bytes
pub const MIN_JITTER_SIZE: usize = 100;
/// Largest accepted buffer size in bytes
pub const MAX_JITTER_SIZE: usize = 8000;
/// Size used when the configured one is out of range
pub const DEFAULT_JITTER_SIZE: usize = 1000;

/// Configuration for the jitter buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitterBufferConfig {
    /// Capacity in bytes
    pub size: usize,
    /// Bytes that must accumulate before draining starts
    pub upper_threshold: usize,
}

impl Default for JitterBufferConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_JITTER_SIZE,
            upper_threshold: DEFAULT_JITTER_SIZE / 2,
        }
    }
}

impl JitterBufferConfig {
    pub fn new(size: usize, upper_threshold: usize) -> Self {
        Self { size, upper_threshold }
    }

    /// Bring the configuration into range, logging what had to change
    pub fn normalized(self) -> Self {
        let mut config = self;
        if !(MIN_JITTER_SIZE..=MAX_JITTER_SIZE).contains(&config.size) {
            warn!(
                "Jitter buffer size {} outside {}..={}, using {}",
                config.size, MIN_JITTER_SIZE, MAX_JITTER_SIZE, DEFAULT_JITTER_SIZE
            );
            config.size = DEFAULT_JITTER_SIZE;
        }
        // a threshold at or above the size could never be reached
        if config.upper_threshold >= config.size {
            warn!(
                "Jitter buffer upper threshold {} not below size {}, using {}",
                config.upper_threshold,
                config.size,
                config.size / 2
            );
            config.upper_threshold = config.size / 2;
        }
        // with nothing retained an overflow would leave the buffer empty
        if config.upper_threshold == 0 {
            warn!("Jitter buffer upper threshold 0, using 1");
            config.upper_threshold = 1;
        }
        config
    }
}

/// Counters kept for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitterBufferStats {
    pub bytes_filled: u64,
    pub bytes_drained: u64,
    pub overflows: u64,
    pub bytes_discarded: u64,
}

struct JitterState {
    samples: Vec<u8>,
    filled: Vec<bool>,
    wp: usize,
    rp: usize,
    unread: usize,
    // true until upper_threshold bytes have accumulated
    priming: bool,
    bytes_wrote: usize,
    stats: JitterBufferStats,
}

impl JitterState {
    fn next(&self, pos: usize) -> usize {
        if pos + 1 == self.samples.len() {
            0
        } else {
            pos + 1
        }
    }
}

/// Ring buffer with per-slot filled markers and its own lock
pub struct JitterBuffer {
    config: JitterBufferConfig,
    state: Mutex<JitterState>,
}

impl JitterBuffer {
    pub fn new(config: JitterBufferConfig) -> Self {
        let config = config.normalized();
        debug!(
            "Created jitter buffer: size={} upper_threshold={}",
            config.size, config.upper_threshold
        );
        Self {
            config,
            state: Mutex::new(JitterState {
                samples: vec![0; config.size],
                filled: vec![false; config.size],
                wp: 0,
                rp: 0,
                unread: 0,
                priming: true,
                bytes_wrote: 0,
                stats: JitterBufferStats::default(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.config.size
    }

    pub fn upper_threshold(&self) -> usize {
        self.config.upper_threshold
    }

    /// Whether drain is currently withholding data
    pub fn is_priming(&self) -> bool {
        self.state.lock().priming
    }

    /// Bytes written but not yet drained
    pub fn unread(&self) -> usize {
        self.state.lock().unread
    }

    pub fn stats(&self) -> JitterBufferStats {
        self.state.lock().stats
    }

    /// Write `data` at the write cursor.
    ///
    /// When the write cursor laps the read cursor the buffer keeps only the
    /// newest `upper_threshold` bytes, goes back to priming and returns
    /// [`Error::JitterOverflow`]. Callers count that as dropped audio.
    pub fn fill(&self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let mut wp = state.wp;
        let mut lapped = false;

        for &byte in data {
            state.samples[wp] = byte;
            if !state.filled[wp] {
                state.filled[wp] = true;
                state.unread += 1;
            }
            wp = state.next(wp);
            if wp == state.rp {
                lapped = true;
            }
        }
        state.wp = wp;
        state.stats.bytes_filled += data.len() as u64;

        if lapped {
            let size = state.samples.len();
            let keep = self.config.upper_threshold;
            let rp = (wp + size - keep) % size;

            // only the retained window stays readable
            let mut pos = wp;
            for _ in 0..size - keep {
                state.filled[pos] = false;
                pos = state.next(pos);
            }

            let before = state.unread;
            state.rp = rp;
            state.unread = state.filled.iter().filter(|&&f| f).count();
            state.priming = true;
            state.bytes_wrote = 0;
            state.stats.overflows += 1;

            let discarded = before.saturating_sub(state.unread);
            state.stats.bytes_discarded += discarded as u64;
            debug!("Jitter buffer overflow, resynchronised rp={} wp={}", rp, wp);
            return Err(Error::JitterOverflow { discarded });
        }

        if state.priming {
            state.bytes_wrote += data.len();
            if state.bytes_wrote >= self.config.upper_threshold {
                state.priming = false;
                state.bytes_wrote = 0;
            }
        }
        Ok(())
    }

    /// Copy up to `out.len()` filled bytes from the read cursor.
    ///
    /// Returns 0 while priming. Stops early when the read cursor catches the
    /// write cursor, which puts the buffer back into priming.
    pub fn drain(&self, out: &mut [u8]) -> usize {
        let mut state = self.state.lock();
        if state.priming {
            return 0;
        }

        let wp = state.wp;
        let mut rp = state.rp;
        let mut read = 0;

        while read < out.len() && state.filled[rp] {
            out[read] = state.samples[rp];
            state.filled[rp] = false;
            read += 1;
            rp = state.next(rp);
            if rp == wp {
                state.priming = true;
                state.bytes_wrote = 0;
                break;
            }
        }

        state.rp = rp;
        state.unread = state.unread.saturating_sub(read);
        state.stats.bytes_drained += read as u64;
        read
    }

    /// Drop all buffered data and start priming again
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.filled.iter_mut().for_each(|f| *f = false);
        state.wp = 0;
        state.rp = 0;
        state.unread = 0;
        state.priming = true;
        state.bytes_wrote = 0;
    }
}

impl std::fmt::Debug for JitterBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("JitterBuffer")
            .field("size", &self.config.size)
            .field("upper_threshold", &self.config.upper_threshold)
            .field("wp", &state.wp)
            .field("rp", &state.rp)
            .field("unread", &state.unread)
            .field("priming", &state.priming)
            .finish()
    }
}
