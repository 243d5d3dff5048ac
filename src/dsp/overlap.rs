//! Overlapping-window re-framer.
//!
//! Re-emits the input as whole windows of `window_len` samples, a new one
//! every `window_len / ratio` input samples, so the FFT sees overlapping
//! windows without the engine knowing about it. A full window of history is
//! always kept so the ratio can change mid-stream.

use super::{ProcessorUpdate, Reconfigurable, SampleProcessor};
use crate::backend::FFT_LEN;
use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlapConfig {
    pub window_len: usize,
    /// Windows per `window_len` input samples; a power of two up to `window_len`.
    pub ratio: usize,
}

impl Default for OverlapConfig {
    fn default() -> Self {
        Self {
            window_len: FFT_LEN,
            ratio: 1,
        }
    }
}

impl OverlapConfig {
    /// Rounds the window length up and the ratio down to powers of two, ratio in `[1, window_len]`.
    pub fn sanitized(self) -> Self {
        let window_len = self.window_len.max(1).next_power_of_two();
        let ratio = match self.ratio {
            0 => 1,
            r if r.is_power_of_two() => r,
            r => r.next_power_of_two() >> 1,
        };
        Self {
            window_len,
            ratio: ratio.min(window_len),
        }
    }

    pub fn hop(&self) -> usize {
        self.window_len / self.ratio
    }
}

#[derive(Debug, Clone)]
pub struct OverlapFramer {
    config: OverlapConfig,
    buffer: Vec<Complex32>,
    read: usize,
}

impl OverlapFramer {
    pub fn new(config: OverlapConfig) -> Self {
        let config = config.sanitized();
        Self {
            buffer: history(config.window_len),
            config,
            read: 0,
        }
    }

    pub fn config(&self) -> OverlapConfig {
        self.config
    }

    /// Appends every window completed by `input` to `out`. Returns how many were emitted.
    pub fn process_into(&mut self, input: &[Complex32], out: &mut Vec<Complex32>) -> usize {
        self.buffer.extend_from_slice(input);
        let wlen = self.config.window_len;
        let hop = self.config.hop();
        let mut emitted = 0;
        while self.buffer.len() - self.read >= wlen {
            out.extend_from_slice(&self.buffer[self.read..self.read + wlen]);
            self.read += hop;
            emitted += 1;
        }
        self.buffer.drain(..self.read);
        self.read = 0;
        emitted
    }
}

fn history(window_len: usize) -> Vec<Complex32> {
    vec![Complex32::new(0.0, 0.0); window_len - 1]
}

impl SampleProcessor for OverlapFramer {
    type Output = Vec<Complex32>;

    fn process_block(&mut self, samples: &[Complex32]) -> ProcessorUpdate<Self::Output> {
        let mut out = Vec::new();
        match self.process_into(samples, &mut out) {
            0 => ProcessorUpdate::None,
            _ => ProcessorUpdate::Snapshot(out),
        }
    }

    fn reset(&mut self) {
        self.buffer = history(self.config.window_len);
        self.read = 0;
    }
}

impl Reconfigurable<OverlapConfig> for OverlapFramer {
    fn update_config(&mut self, config: OverlapConfig) {
        let config = config.sanitized();
        if config.window_len != self.config.window_len {
            self.config = config;
            self.reset();
        } else {
            self.config = config;
        }
        debug!(
            "[dsp] overlap ratio {} (hop {})",
            self.config.ratio,
            self.config.hop()
        );
    }
}
