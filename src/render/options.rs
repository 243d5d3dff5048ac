//! Caller-owned description of one render pass.

use serde::{Deserialize, Serialize};
use std::ops::{BitOr, BitOrAssign};

pub const MAX_CHANNELS: usize = 8;

/// Set of enabled display layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Layers(u32);

impl Layers {
    pub const NONE: Self = Self(0);
    pub const LIVE: Self = Self(1 << 0);
    pub const MAX_HOLD: Self = Self(1 << 1);
    pub const HISTOGRAM: Self = Self(1 << 2);
    pub const WATERFALL: Self = Self(1 << 3);
    pub const FREQ_LABELS: Self = Self(1 << 4);
    pub const POWER_LABELS: Self = Self(1 << 5);
    pub const TIME_LABELS: Self = Self(1 << 6);
    pub const CHANNELS: Self = Self(1 << 7);
    pub const COLOR_SCALE: Self = Self(1 << 8);
    pub const ALL: Self = Self((1 << 9) - 1);

    /// Layers drawn in the histogram region.
    pub const SPECTRAL: Self = Self(Self::LIVE.0 | Self::MAX_HOLD.0 | Self::HISTOGRAM.0);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    /// All of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Any of `other` is set.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: Self, on: bool) {
        if on {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }
}

impl Default for Layers {
    fn default() -> Self {
        Self::LIVE
            | Self::MAX_HOLD
            | Self::HISTOGRAM
            | Self::WATERFALL
            | Self::FREQ_LABELS
            | Self::POWER_LABELS
            | Self::COLOR_SCALE
    }
}

impl BitOr for Layers {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Layers {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// A highlighted band in normalised frequency, over the full analysis bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Channel {
    pub enabled: bool,
    pub center: f32,
    pub width: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderOptions {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub layers: Layers,
    /// Share of the vertical space given to the histogram, in [0.1, 0.9].
    pub ratio: f32,
    /// Requested frequency divisions; the layout may use fewer.
    pub freq_divisions: u32,
    /// Zoom window centre, normalised to the analysis bandwidth.
    pub zoom_center: f32,
    /// Zoom window width, normalised to the analysis bandwidth.
    pub zoom_span: f32,
    /// Fraction of the waterfall history shown.
    pub waterfall_span: f32,
    /// Frequency labels relative to the centre instead of absolute.
    pub relative_freq: bool,
    pub channels: [Channel; MAX_CHANNELS],
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            width: 1024,
            height: 768,
            layers: Layers::default(),
            ratio: 0.5,
            freq_divisions: 10,
            zoom_center: 0.5,
            zoom_span: 1.0,
            waterfall_span: 1.0,
            relative_freq: false,
            channels: [Channel::default(); MAX_CHANNELS],
        }
    }
}

impl RenderOptions {
    pub fn set_rect(&mut self, x: i32, y: i32, width: i32, height: i32) {
        self.x = x;
        self.y = y;
        self.width = width;
        self.height = height;
    }

    /// Sets the zoom window from its two edges.
    pub fn set_freq_window(&mut self, start: f32, stop: f32) {
        self.zoom_center = 0.5 * (start + stop);
        self.zoom_span = stop - start;
    }

    /// Zoom window edges, clamped into [0, 1].
    pub fn freq_window(&self) -> (f32, f32) {
        let span = finite_or(self.zoom_span, 1.0).clamp(0.0, 1.0);
        let center = finite_or(self.zoom_center, 0.5).clamp(0.0, 1.0);
        let start = (center - 0.5 * span).clamp(0.0, 1.0);
        let stop = (center + 0.5 * span).clamp(0.0, 1.0);
        (start, stop)
    }

    pub fn clamped_ratio(&self) -> f32 {
        finite_or(self.ratio, 0.5).clamp(0.1, 0.9)
    }

    pub fn clamped_waterfall_span(&self) -> f32 {
        finite_or(self.waterfall_span, 1.0).clamp(1.0 / 1024.0, 1.0)
    }
}

fn finite_or(value: f32, fallback: f32) -> f32 {
    if value.is_finite() { value } else { fallback }
}
