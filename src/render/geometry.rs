//! Pixel layout of a render pass and the pixel <-> (frequency, power, time) mappings.
//!
//! Screen coordinates grow right and down. The histogram region sits above
//! the waterfall; the power reference level is at the top of the histogram.

use super::options::{Layers, RenderOptions};
use crate::backend::{FFT_LEN, WATERFALL_ROWS};
use crate::engine::{DisplayScales, POWER_DIVISIONS};
use tracing::debug;

pub const MARGIN: i32 = 10;
/// Room for power or time labels left of the plot.
pub const LABEL_WIDTH: i32 = 30;
/// Room for the colour-scale legend right of the plot.
pub const SCALE_WIDTH: i32 = 10;
/// Height of the frequency label row.
pub const LABEL_HEIGHT: i32 = 12;
/// Narrowest frequency division before divisions are dropped.
pub const MIN_DIV_WIDTH: i32 = 80;

/// Membership bits returned by [`RenderDescriptor::inside`].
pub mod region {
    pub const X: u8 = 1;
    pub const HISTOGRAM: u8 = 2;
    pub const WATERFALL: u8 = 4;
}

/// Derived layout, recomputed by [`RenderDescriptor::refresh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Geometry {
    /// Plotted x range, `[left, right)`.
    pub x: [i32; 2],
    pub x_div: i32,
    pub n_div: u32,
    /// Histogram `[top, bottom]`, when a spectral layer is on.
    pub histogram: Option<[i32; 2]>,
    /// Pixels per power division.
    pub histo_div: i32,
    /// Waterfall `[top, bottom]`, when the waterfall is on.
    pub waterfall: Option<[i32; 2]>,
    /// Right edge of the power / time labels.
    pub x_label: i32,
    /// Centre line of the frequency labels.
    pub y_label: Option<i32>,
    /// Colour-scale legend `[left, right]`.
    pub scale_x: [i32; 2],
}

/// Render options plus the geometry derived from them.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderDescriptor {
    pub options: RenderOptions,
    geometry: Geometry,
}

impl Default for RenderDescriptor {
    fn default() -> Self {
        Self::new(RenderOptions::default())
    }
}

impl RenderDescriptor {
    pub fn new(options: RenderOptions) -> Self {
        let mut desc = Self {
            options,
            geometry: Geometry::default(),
        };
        desc.refresh();
        desc
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Recomputes the cached layout from `options`.
    pub fn refresh(&mut self) {
        self.geometry = layout(&self.options);
        debug!("[render] geometry {:?}", self.geometry);
    }

    fn x_span(&self) -> f64 {
        f64::from((self.geometry.x[1] - self.geometry.x[0]).max(1))
    }

    pub fn pos2freq(&self, x: f32, scales: &DisplayScales) -> f64 {
        let (start, stop) = self.options.freq_window();
        let xs = (f64::from(x) - f64::from(self.geometry.x[0])) / self.x_span();
        let rel = f64::from(start) + xs * f64::from(stop - start) - 0.5;
        scales.frequency.center + scales.frequency.span * rel
    }

    pub fn freq2pos(&self, freq: f64, scales: &DisplayScales) -> f32 {
        let (start, stop) = self.options.freq_window();
        let width = f64::from(stop - start);
        if width <= 0.0 || scales.frequency.span <= 0.0 {
            return self.geometry.x[0] as f32;
        }
        let rel = (freq - scales.frequency.center) / scales.frequency.span + 0.5;
        let xs = (rel - f64::from(start)) / width;
        (f64::from(self.geometry.x[0]) + xs * self.x_span()) as f32
    }

    /// Power in dB at row `y` of the histogram.
    pub fn pos2pwr(&self, y: f32, scales: &DisplayScales) -> Option<f32> {
        let [top, _] = self.geometry.histogram?;
        let div = self.geometry.histo_div.max(1) as f32;
        Some(scales.power.reference_db - scales.power.db_per_div * (y - top as f32) / div)
    }

    pub fn pwr2pos(&self, db: f32, scales: &DisplayScales) -> Option<f32> {
        let [top, _] = self.geometry.histogram?;
        let div = self.geometry.histo_div.max(1) as f32;
        Some(top as f32 + (scales.power.reference_db - db) / scales.power.db_per_div * div)
    }

    /// Samples elapsed since the newest waterfall row, at row `y`.
    pub fn pos2samp(&self, y: f32) -> Option<f64> {
        let [top, bottom] = self.geometry.waterfall?;
        let height = f64::from((bottom - top).max(1));
        Some((f64::from(y) - f64::from(top)) / height * self.history_samples())
    }

    pub fn samp2pos(&self, samples: f64) -> Option<f32> {
        let [top, bottom] = self.geometry.waterfall?;
        let height = f64::from((bottom - top).max(1));
        Some((f64::from(top) + samples / self.history_samples() * height) as f32)
    }

    fn history_samples(&self) -> f64 {
        f64::from(self.options.clamped_waterfall_span()) * (WATERFALL_ROWS * FFT_LEN) as f64
    }

    /// Which plotted regions contain the pixel, as [`region`] bits.
    pub fn inside(&self, x: i32, y: i32) -> u8 {
        let g = &self.geometry;
        let mut bits = 0;
        if x >= g.x[0] && x < g.x[1] {
            bits |= region::X;
        }
        if let Some([top, bottom]) = g.histogram
            && y >= top
            && y < bottom
        {
            bits |= region::HISTOGRAM;
        }
        if let Some([top, bottom]) = g.waterfall
            && y >= top
            && y < bottom
        {
            bits |= region::WATERFALL;
        }
        bits
    }

    /// X pixel of each frequency grid line, left to right.
    pub fn freq_ticks(&self) -> impl Iterator<Item = i32> + '_ {
        let g = &self.geometry;
        (0..=g.n_div as i32).map(move |i| g.x[0] + i * g.x_div)
    }

    /// Y pixel of each power grid line, top (reference) to bottom.
    pub fn power_ticks(&self) -> impl Iterator<Item = i32> + '_ {
        let g = &self.geometry;
        g.histogram
            .into_iter()
            .flat_map(move |[top, _]| (0..=POWER_DIVISIONS as i32).map(move |i| top + i * g.histo_div))
    }
}

fn layout(o: &RenderOptions) -> Geometry {
    let spectral = o.layers.intersects(Layers::SPECTRAL);
    let waterfall = o.layers.contains(Layers::WATERFALL);

    let mut left = MARGIN;
    let mut right = MARGIN;
    if o.layers.intersects(Layers::POWER_LABELS | Layers::TIME_LABELS) {
        left += LABEL_WIDTH;
    }
    if o.layers.contains(Layers::COLOR_SCALE) {
        right += SCALE_WIDTH;
    }

    let avail = (o.width - left - right).max(1);
    let mut n_div = (o.freq_divisions.clamp(2, 10) & !1) as i32;
    while n_div > 2 && avail / n_div < MIN_DIV_WIDTH {
        n_div -= 2;
    }
    let x_div = (avail / n_div).max(1);
    let used = x_div * n_div;
    let pad = ((avail - used) / 2).max(0);
    let x0 = o.x + left + pad;
    let x1 = x0 + used;

    let top = o.y + MARGIN;
    let bottom = o.y + o.height - MARGIN;
    let avail_v = (bottom - top).max(0);
    let label_h = if spectral && o.layers.contains(Layers::FREQ_LABELS) {
        LABEL_HEIGHT
    } else {
        0
    };
    let divisions = POWER_DIVISIONS as i32;

    let (histogram, histo_div, waterfall_rows, y_label) = match (spectral, waterfall) {
        (true, true) => {
            let gap = MARGIN + label_h;
            let share = ((avail_v - gap).max(0) as f32 * o.clamped_ratio()) as i32;
            let div = (share / divisions).max(1);
            let h_bottom = top + div * divisions;
            let w_top = h_bottom + gap;
            (
                Some([top, h_bottom]),
                div,
                Some([w_top, bottom.max(w_top + 1)]),
                (label_h > 0).then_some(h_bottom + 2 + label_h / 2),
            )
        }
        (true, false) => {
            let div = ((avail_v - label_h).max(0) / divisions).max(1);
            let h_bottom = top + div * divisions;
            (
                Some([top, h_bottom]),
                div,
                None,
                (label_h > 0).then_some(h_bottom + 2 + label_h / 2),
            )
        }
        (false, true) => (None, 0, Some([top, bottom.max(top + 1)]), None),
        (false, false) => (None, 0, None, None),
    };

    Geometry {
        x: [x0, x1],
        x_div,
        n_div: n_div as u32,
        histogram,
        histo_div,
        waterfall: waterfall_rows,
        x_label: x0 - 4,
        y_label,
        scale_x: [x1 + 2, x1 + SCALE_WIDTH],
    }
}
