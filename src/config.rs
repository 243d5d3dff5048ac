//! Persisted runtime settings.

use crate::backend::AccumulationTuning;
use crate::device::VendorPolicy;
use crate::dsp::overlap::OverlapConfig;
use crate::engine::pipeline::BATCH_GRANULE;
use crate::engine::window::WindowKind;
use crate::engine::{DB_PER_DIV_STEPS, DEFAULT_DB_PER_DIV_INDEX, EngineOptions, FrequencyRange, PowerRange};
use crate::render::options::{Layers, RenderOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// `platform:device` override, wins over the settings file.
pub const DEVICE_ENV: &str = "AFTERGLOW_DEVICE";
pub const DEFAULT_FIFO_CAPACITY: usize = 2 * 1024 * 1024;
const MAX_FIFO_CAPACITY: usize = 1 << 26;
const MAX_FREQ_DIVISIONS: u32 = 64;
const SETTINGS_FILE: &str = "settings.json";

pub fn config_dir() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("afterglow")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerSettings {
    pub reference_db: f32,
    /// Index into the dB/div step table.
    pub db_per_div_index: usize,
}

impl Default for PowerSettings {
    fn default() -> Self {
        Self {
            reference_db: 0.0,
            db_per_div_index: DEFAULT_DB_PER_DIV_INDEX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrequencySettings {
    pub center: f64,
    pub span: f64,
}

impl Default for FrequencySettings {
    fn default() -> Self {
        let range = FrequencyRange::default();
        Self {
            center: range.center,
            span: range.span,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplaySettings {
    pub width: u32,
    pub height: u32,
    pub layers: Layers,
    pub ratio: f32,
    pub freq_divisions: u32,
    pub waterfall_span: f32,
    pub relative_freq: bool,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        let options = RenderOptions::default();
        Self {
            width: options.width as u32,
            height: options.height as u32,
            layers: options.layers,
            ratio: options.ratio,
            freq_divisions: options.freq_divisions,
            waterfall_span: options.waterfall_span,
            relative_freq: options.relative_freq,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub power: PowerSettings,
    pub frequency: FrequencySettings,
    pub tuning: AccumulationTuning,
    pub window: WindowKind,
    pub preferred_vendors: Vec<u32>,
    /// `platform:device`; `AFTERGLOW_DEVICE` takes precedence.
    pub device: Option<String>,
    pub fifo_capacity: usize,
    pub display: DisplaySettings,
    pub overlap_ratio: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            power: PowerSettings::default(),
            frequency: FrequencySettings::default(),
            tuning: AccumulationTuning::default(),
            window: WindowKind::default(),
            preferred_vendors: VendorPolicy::default().preferred,
            device: None,
            fifo_capacity: DEFAULT_FIFO_CAPACITY,
            display: DisplaySettings::default(),
            overlap_ratio: 1,
        }
    }
}

impl Settings {
    /// Clamps every field into its legal range.
    pub fn sanitize(&mut self) {
        let defaults = Settings::default();

        self.power.reference_db = finite_or(self.power.reference_db, 0.0).clamp(-200.0, 200.0);
        self.power.db_per_div_index = self.power.db_per_div_index.min(DB_PER_DIV_STEPS.len() - 1);

        if !self.frequency.center.is_finite() {
            self.frequency.center = defaults.frequency.center;
        }
        if !(self.frequency.span.is_finite() && self.frequency.span > 0.0) {
            self.frequency.span = defaults.frequency.span;
        }

        self.tuning.sanitize();

        self.device = self
            .device
            .take()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());

        self.fifo_capacity = self
            .fifo_capacity
            .clamp(2 * BATCH_GRANULE, MAX_FIFO_CAPACITY)
            .next_power_of_two();

        let display = &mut self.display;
        display.width = display.width.max(1);
        display.height = display.height.max(1);
        display.layers = Layers::from_bits_truncate(display.layers.bits());
        display.ratio = finite_or(display.ratio, 0.5).clamp(0.1, 0.9);
        display.freq_divisions = display.freq_divisions.clamp(2, MAX_FREQ_DIVISIONS);
        display.waterfall_span = finite_or(display.waterfall_span, 1.0).clamp(1.0 / 1024.0, 1.0);

        self.overlap_ratio = self.overlap().ratio;
    }

    pub fn power_range(&self) -> PowerRange {
        PowerRange {
            reference_db: self.power.reference_db,
            db_per_div: DB_PER_DIV_STEPS[self.power.db_per_div_index.min(DB_PER_DIV_STEPS.len() - 1)],
        }
    }

    /// The device override after applying `env`, the value of `AFTERGLOW_DEVICE`.
    pub fn device_override_with(&self, env: Option<String>) -> Option<String> {
        env.map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .or_else(|| self.device.clone())
    }

    pub fn engine_options(&self) -> EngineOptions {
        let device_override = self.device_override_with(std::env::var(DEVICE_ENV).ok());
        if let Some(device) = &device_override {
            debug!("[settings] device override {device}");
        }
        EngineOptions {
            vendor_policy: VendorPolicy {
                preferred: self.preferred_vendors.clone(),
            },
            device_override,
            tuning: self.tuning,
            window: self.window,
            power: self.power_range(),
            frequency: FrequencyRange {
                center: self.frequency.center,
                span: self.frequency.span,
            },
            ..EngineOptions::default()
        }
    }

    pub fn render_options(&self) -> RenderOptions {
        let d = &self.display;
        let mut options = RenderOptions {
            layers: d.layers,
            ratio: d.ratio,
            freq_divisions: d.freq_divisions,
            waterfall_span: d.waterfall_span,
            relative_freq: d.relative_freq,
            ..RenderOptions::default()
        };
        options.set_rect(
            0,
            0,
            i32::try_from(d.width).unwrap_or(i32::MAX),
            i32::try_from(d.height).unwrap_or(i32::MAX),
        );
        options
    }

    pub fn overlap(&self) -> OverlapConfig {
        OverlapConfig {
            ratio: self.overlap_ratio,
            ..OverlapConfig::default()
        }
        .sanitized()
    }
}

fn finite_or(value: f32, fallback: f32) -> f32 {
    if value.is_finite() { value } else { fallback }
}

/// Settings plus the file they came from.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    pub data: Settings,
}

impl SettingsStore {
    pub fn load_or_default() -> Self {
        Self::load_from(config_dir().join(SETTINGS_FILE))
    }

    /// Missing or unreadable files give defaults; parse errors are logged.
    pub fn load_from(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut data: Settings = fs::read_to_string(&path)
            .ok()
            .and_then(|s| {
                serde_json::from_str(&s)
                    .map_err(|e| warn!("[settings] parse error {path:?}: {e}"))
                    .ok()
            })
            .unwrap_or_default();
        data.sanitize();
        Self { path, data }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the sanitised settings through a temporary file.
    pub fn save(&self) -> io::Result<()> {
        let mut data = self.data.clone();
        data.sanitize();
        let json = serde_json::to_string_pretty(&data).map_err(io::Error::other)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &json)?;
        fs::rename(&temp_path, &self.path)?;
        debug!("[settings] saved {:?}", self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load_from(dir.path().join("settings.json"));
        assert_eq!(store.data, Settings::default());
        assert_eq!(store.data.fifo_capacity, DEFAULT_FIFO_CAPACITY);
        assert_eq!(store.data.preferred_vendors, [0x10de, 0x1002]);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let mut store = SettingsStore::load_from(&path);
        store.data.power.reference_db = -20.0;
        store.data.frequency.center = 100.0e6;
        store.data.window = WindowKind::Blackman;
        store.data.device = Some("1:0".into());
        store.save().unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = SettingsStore::load_from(&path);
        assert_eq!(loaded.data, store.data);
    }

    #[test]
    fn parse_errors_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(SettingsStore::load_from(&path).data, Settings::default());
    }

    #[test]
    fn partial_files_keep_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "power": { "reference_db": -30 }, "overlap_ratio": 4 }"#).unwrap();
        let data = SettingsStore::load_from(&path).data;
        assert_eq!(data.power.reference_db, -30.0);
        assert_eq!(data.power.db_per_div_index, DEFAULT_DB_PER_DIV_INDEX);
        assert_eq!(data.overlap().hop(), 256);
    }

    #[test]
    fn sanitize_clamps_out_of_range_values() {
        let mut s = Settings {
            fifo_capacity: 3_000_000,
            overlap_ratio: 3,
            device: Some("  ".into()),
            ..Settings::default()
        };
        s.power.db_per_div_index = 99;
        s.power.reference_db = f32::NAN;
        s.frequency.span = -1.0;
        s.display.ratio = 2.0;
        s.display.freq_divisions = 0;
        s.display.width = 0;
        s.sanitize();

        assert_eq!(s.fifo_capacity, 4 * 1024 * 1024);
        assert_eq!(s.overlap_ratio, 2);
        assert_eq!(s.device, None);
        assert_eq!(s.power.db_per_div_index, DB_PER_DIV_STEPS.len() - 1);
        assert_eq!(s.power.reference_db, 0.0);
        assert_eq!(s.frequency.span, FrequencySettings::default().span);
        assert_eq!(s.display.ratio, 0.9);
        assert_eq!(s.display.freq_divisions, 2);
        assert_eq!(s.display.width, 1);
    }

    #[test]
    fn environment_override_wins() {
        let s = Settings {
            device: Some("1:0".into()),
            ..Settings::default()
        };
        assert_eq!(s.device_override_with(None).as_deref(), Some("1:0"));
        assert_eq!(
            s.device_override_with(Some(" 2:1 ".into())).as_deref(),
            Some("2:1")
        );
        assert_eq!(s.device_override_with(Some(String::new())).as_deref(), Some("1:0"));
    }

    #[test]
    fn options_carry_settings_through() {
        let mut s = Settings::default();
        s.power.reference_db = -10.0;
        s.power.db_per_div_index = 2;
        s.display.width = 640;
        s.display.height = 480;
        s.display.layers = Layers::LIVE | Layers::WATERFALL;

        let engine = s.engine_options();
        assert_eq!(engine.power.reference_db, -10.0);
        assert_eq!(engine.power.db_per_div, 5.0);
        assert_eq!(engine.vendor_policy.preferred, s.preferred_vendors);

        let render = s.render_options();
        assert_eq!((render.width, render.height), (640, 480));
        assert_eq!(render.layers, Layers::LIVE | Layers::WATERFALL);
    }
}
