//! UI actions and the display state they drive.

use crate::engine::{DB_PER_DIV_STEPS, PowerRange};
use crate::render::geometry::{RenderDescriptor, region};
use crate::render::options::{Channel, Layers, RenderOptions};
use serde::{Deserialize, Serialize};
use tracing::debug;

const RATIO_STEP: f32 = 0.05;
const MIN_ZOOM_WIDTH: f32 = 1.0 / 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UiAction {
    RefUp,
    RefDown,
    DbPerDivUp,
    DbPerDivDown,
    ZoomToggle,
    ZoomWidthUp,
    ZoomWidthDown,
    ZoomCenterUp,
    ZoomCenterDown,
    RatioUp,
    RatioDown,
    FreezeToggle,
    ResetMaxHold,
    /// Mouse click at a pixel of the drawing surface.
    Click { x: i32, y: i32 },
}

/// What the caller must do after an action was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    /// Push [`DisplayControls::power_range`] into the engine.
    Power,
    /// Descriptors changed; they are already refreshed.
    Layout,
    Freeze(bool),
    ResetMaxHold,
}

/// Power scale, zoom and layout state, with the main and zoomed render descriptors.
#[derive(Debug, Clone)]
pub struct DisplayControls {
    reference_db: f32,
    db_per_div_index: usize,
    zoom_enabled: bool,
    zoom_center: f32,
    zoom_width: f32,
    frozen: bool,
    base: RenderOptions,
    main: RenderDescriptor,
    zoom: RenderDescriptor,
}

impl DisplayControls {
    pub fn new(base: RenderOptions, reference_db: f32, db_per_div_index: usize) -> Self {
        let mut controls = Self {
            reference_db,
            db_per_div_index: db_per_div_index.min(DB_PER_DIV_STEPS.len() - 1),
            zoom_enabled: false,
            zoom_center: 0.5,
            zoom_width: 0.25,
            frozen: false,
            main: RenderDescriptor::new(base.clone()),
            zoom: RenderDescriptor::new(base.clone()),
            base,
        };
        controls.relayout();
        controls
    }

    pub fn power_range(&self) -> PowerRange {
        PowerRange {
            reference_db: self.reference_db,
            db_per_div: DB_PER_DIV_STEPS[self.db_per_div_index],
        }
    }

    pub fn frozen(&self) -> bool {
        self.frozen
    }

    pub fn zoom_enabled(&self) -> bool {
        self.zoom_enabled
    }

    /// Zoom band as `(center, width)` in normalised frequency.
    pub fn zoom_band(&self) -> (f32, f32) {
        (self.zoom_center, self.zoom_width)
    }

    pub fn ratio(&self) -> f32 {
        self.base.clamped_ratio()
    }

    pub fn main(&self) -> &RenderDescriptor {
        &self.main
    }

    /// Descriptors to draw this frame, main first.
    pub fn descriptors(&self) -> impl Iterator<Item = &RenderDescriptor> {
        std::iter::once(&self.main).chain(self.zoom_enabled.then_some(&self.zoom))
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        let width = i32::try_from(width).unwrap_or(i32::MAX);
        let height = i32::try_from(height).unwrap_or(i32::MAX);
        self.base.set_rect(self.base.x, self.base.y, width, height);
        self.relayout();
    }

    pub fn apply(&mut self, action: UiAction) -> Effect {
        debug!("[worker] action {action:?}");
        let step = DB_PER_DIV_STEPS[self.db_per_div_index];
        match action {
            UiAction::RefUp => {
                self.reference_db += step;
                Effect::Power
            }
            UiAction::RefDown => {
                self.reference_db -= step;
                Effect::Power
            }
            UiAction::DbPerDivUp if self.db_per_div_index + 1 < DB_PER_DIV_STEPS.len() => {
                self.db_per_div_index += 1;
                Effect::Power
            }
            UiAction::DbPerDivDown if self.db_per_div_index > 0 => {
                self.db_per_div_index -= 1;
                Effect::Power
            }
            UiAction::DbPerDivUp | UiAction::DbPerDivDown => Effect::None,
            UiAction::ZoomToggle => {
                self.zoom_enabled = !self.zoom_enabled;
                self.relayout()
            }
            UiAction::ZoomWidthUp => {
                self.zoom_width = (self.zoom_width * 2.0).min(1.0);
                self.relayout()
            }
            UiAction::ZoomWidthDown => {
                self.zoom_width = (self.zoom_width * 0.5).max(MIN_ZOOM_WIDTH);
                self.relayout()
            }
            UiAction::ZoomCenterUp => {
                self.zoom_center += self.zoom_width / 8.0;
                self.relayout()
            }
            UiAction::ZoomCenterDown => {
                self.zoom_center -= self.zoom_width / 8.0;
                self.relayout()
            }
            UiAction::RatioUp => {
                self.base.ratio = (self.base.clamped_ratio() + RATIO_STEP).min(0.9);
                self.relayout()
            }
            UiAction::RatioDown => {
                self.base.ratio = (self.base.clamped_ratio() - RATIO_STEP).max(0.1);
                self.relayout()
            }
            UiAction::FreezeToggle => {
                self.frozen = !self.frozen;
                Effect::Freeze(self.frozen)
            }
            UiAction::ResetMaxHold => Effect::ResetMaxHold,
            UiAction::Click { x, y } => self.click(x, y),
        }
    }

    fn click(&mut self, x: i32, y: i32) -> Effect {
        if !self.zoom_enabled {
            return Effect::None;
        }
        let bits = self.main.inside(x, y);
        if bits & region::X == 0 || bits & (region::HISTOGRAM | region::WATERFALL) == 0 {
            return Effect::None;
        }
        let g = self.main.geometry();
        let (start, stop) = self.main.options.freq_window();
        let xs = (x - g.x[0]) as f32 / (g.x[1] - g.x[0]).max(1) as f32;
        self.zoom_center = start + xs * (stop - start);
        self.relayout()
    }

    fn relayout(&mut self) -> Effect {
        let half = 0.5 * self.zoom_width;
        self.zoom_center = self.zoom_center.clamp(half, 1.0 - half);

        let mut main = self.base.clone();
        if self.zoom_enabled {
            let (x, y, w, h) = (main.x, main.y, main.width, main.height);
            let left = w / 2;
            main.set_rect(x, y, left, h);
            main.layers.insert(Layers::CHANNELS);
            main.channels[0] = Channel {
                enabled: true,
                center: self.zoom_center,
                width: self.zoom_width,
            };

            let mut zoom = self.base.clone();
            zoom.set_rect(x + left, y, w - left, h);
            zoom.layers.remove(Layers::CHANNELS);
            zoom.set_freq_window(self.zoom_center - half, self.zoom_center + half);
            self.zoom.options = zoom;
            self.zoom.refresh();
        }
        self.main.options = main;
        self.main.refresh();
        Effect::Layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controls() -> DisplayControls {
        let mut base = RenderOptions::default();
        base.set_rect(0, 0, 1200, 800);
        DisplayControls::new(base, 0.0, 3)
    }

    #[test]
    fn reference_moves_by_current_step() {
        let mut c = controls();
        assert_eq!(c.apply(UiAction::RefUp), Effect::Power);
        assert_eq!(c.power_range().reference_db, 10.0);
        c.apply(UiAction::DbPerDivDown);
        c.apply(UiAction::RefDown);
        assert_eq!(c.power_range().reference_db, 5.0);
        assert_eq!(c.power_range().db_per_div, 5.0);
    }

    #[test]
    fn db_per_div_walks_the_table() {
        let mut c = controls();
        assert_eq!(c.apply(UiAction::DbPerDivUp), Effect::Power);
        assert_eq!(c.power_range().db_per_div, 20.0);
        assert_eq!(c.apply(UiAction::DbPerDivUp), Effect::None);
        for _ in 0..10 {
            c.apply(UiAction::DbPerDivDown);
        }
        assert_eq!(c.power_range().db_per_div, 1.0);
    }

    #[test]
    fn zoom_splits_the_screen() {
        let mut c = controls();
        assert_eq!(c.descriptors().count(), 1);
        assert_eq!(c.apply(UiAction::ZoomToggle), Effect::Layout);
        let descs: Vec<_> = c.descriptors().collect();
        assert_eq!(descs.len(), 2);
        assert_eq!(descs[0].options.width, 600);
        assert_eq!(descs[1].options.x, 600);
        assert!(descs[0].options.layers.contains(Layers::CHANNELS));
        assert!(descs[0].options.channels[0].enabled);
        assert!(!descs[1].options.layers.contains(Layers::CHANNELS));
        assert_eq!(descs[1].options.freq_window(), (0.375, 0.625));
    }

    #[test]
    fn zoom_width_and_centre_stay_in_band() {
        let mut c = controls();
        c.apply(UiAction::ZoomToggle);
        c.apply(UiAction::ZoomWidthUp);
        assert_eq!(c.zoom_band(), (0.5, 0.5));
        c.apply(UiAction::ZoomWidthDown);
        c.apply(UiAction::ZoomCenterUp);
        assert_eq!(c.zoom_band(), (0.53125, 0.25));
        for _ in 0..100 {
            c.apply(UiAction::ZoomCenterUp);
        }
        assert_eq!(c.zoom_band(), (0.875, 0.25));
        for _ in 0..20 {
            c.apply(UiAction::ZoomWidthUp);
        }
        assert_eq!(c.zoom_band(), (0.5, 1.0));
    }

    #[test]
    fn ratio_steps_are_clamped() {
        let mut c = controls();
        c.apply(UiAction::RatioUp);
        assert!((c.ratio() - 0.55).abs() < 1e-6);
        for _ in 0..20 {
            c.apply(UiAction::RatioUp);
        }
        assert_eq!(c.ratio(), 0.9);
        for _ in 0..40 {
            c.apply(UiAction::RatioDown);
        }
        assert!((c.ratio() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn click_recentres_zoom_only_when_zoomed() {
        let mut c = controls();
        let g = *c.main().geometry();
        let [top, _] = g.histogram.unwrap();
        let x = g.x[0] + (g.x[1] - g.x[0]) / 4;
        assert_eq!(c.apply(UiAction::Click { x, y: top + 1 }), Effect::None);

        c.apply(UiAction::ZoomToggle);
        let g = *c.main().geometry();
        let [top, _] = g.histogram.unwrap();
        let x = g.x[0] + (g.x[1] - g.x[0]) / 4;
        assert_eq!(c.apply(UiAction::Click { x, y: top + 1 }), Effect::Layout);
        assert!((c.zoom_band().0 - 0.25).abs() < 0.01);
        assert_eq!(c.apply(UiAction::Click { x: -5, y: top + 1 }), Effect::None);
    }

    #[test]
    fn freeze_toggles() {
        let mut c = controls();
        assert_eq!(c.apply(UiAction::FreezeToggle), Effect::Freeze(true));
        assert!(c.frozen());
        assert_eq!(c.apply(UiAction::FreezeToggle), Effect::Freeze(false));
    }

    #[test]
    fn resize_reflows_both_views() {
        let mut c = controls();
        c.apply(UiAction::ZoomToggle);
        c.resize(2000, 900);
        let descs: Vec<_> = c.descriptors().collect();
        assert_eq!(descs[0].options.width + descs[1].options.width, 2000);
        assert_eq!(descs[1].options.height, 900);
    }
}
