//! Frequency and time axis label text.

const UNITS: [(f64, &str); 4] = [(1.0, "Hz"), (1e3, "kHz"), (1e6, "MHz"), (1e9, "GHz")];
/// Most decimals an absolute label may carry before switching to relative labels.
const MAX_ABS_DECIMALS: usize = 3;
const MAX_DECIMALS: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisMode {
    /// Zero span: only the centre is labelled.
    CenterOnly,
    Absolute,
    /// Centre absolute, the others as signed offsets from it.
    Relative,
}

/// Labels for the `n_div + 1` vertical grid lines of the frequency axis.
#[derive(Debug, Clone, PartialEq)]
pub struct FreqAxis {
    center: f64,
    step: f64,
    mode: AxisMode,
    abs_unit: (f64, &'static str),
    abs_decimals: usize,
    rel_unit: (f64, &'static str),
    rel_decimals: usize,
}

impl FreqAxis {
    /// `force_relative` selects offset labels even when absolute ones would fit.
    pub fn build(center: f64, span: f64, n_div: u32, force_relative: bool) -> Self {
        let step = if n_div == 0 { 0.0 } else { span / f64::from(n_div) };
        let half = 0.5 * span.abs();
        let max_abs = (center - half).abs().max((center + half).abs());
        let abs_unit = unit_for(max_abs);
        let rel_unit = unit_for(step.abs());

        let abs_decimals = decimals(center / abs_unit.0).max(decimals(step / abs_unit.0));
        let mode = if step == 0.0 || !step.is_finite() {
            AxisMode::CenterOnly
        } else if force_relative || abs_decimals > MAX_ABS_DECIMALS {
            AxisMode::Relative
        } else {
            AxisMode::Absolute
        };

        Self {
            center,
            step,
            mode,
            abs_unit,
            abs_decimals: match mode {
                AxisMode::Absolute => abs_decimals,
                _ => decimals(center / abs_unit.0),
            },
            rel_unit,
            rel_decimals: decimals(step / rel_unit.0),
        }
    }

    /// Frequencies for a zoom window `[start, stop]` of the full bandwidth.
    pub fn zoomed(
        center: f64,
        span: f64,
        start: f32,
        stop: f32,
        n_div: u32,
        force_relative: bool,
    ) -> Self {
        if start == 0.0 && stop == 1.0 {
            return Self::build(center, span, n_div, force_relative);
        }
        // normalised edges only carry ~7 meaningful digits
        let start = (1e7 * f64::from(start)).round() / 1e7;
        let stop = (1e7 * f64::from(stop)).round() / 1e7;
        let rel_center = 0.5 * (start + stop) - 0.5;
        Self::build(
            center + rel_center * span,
            span * (stop - start),
            n_div,
            force_relative,
        )
    }

    pub fn mode(&self) -> AxisMode {
        self.mode
    }

    /// Label for grid line `step` counted from the centre line.
    pub fn label(&self, step: i32) -> String {
        match self.mode {
            AxisMode::CenterOnly if step != 0 => String::new(),
            AxisMode::CenterOnly => format_value(self.center, self.abs_unit, self.abs_decimals),
            AxisMode::Absolute => format_value(
                self.center + f64::from(step) * self.step,
                self.abs_unit,
                self.abs_decimals,
            ),
            AxisMode::Relative if step == 0 => {
                format_value(self.center, self.abs_unit, self.abs_decimals)
            }
            AxisMode::Relative => {
                let offset = f64::from(step) * self.step / self.rel_unit.0;
                format!(
                    "{offset:+.prec$} {unit}",
                    prec = self.rel_decimals,
                    unit = self.rel_unit.1
                )
            }
        }
    }
}

fn unit_for(magnitude: f64) -> (f64, &'static str) {
    UNITS
        .iter()
        .rev()
        .copied()
        .find(|(scale, _)| magnitude >= *scale)
        .unwrap_or(UNITS[0])
}

/// Fewest decimals that print `value` exactly, up to `MAX_DECIMALS`.
fn decimals(value: f64) -> usize {
    let value = value.abs();
    if !value.is_finite() {
        return 0;
    }
    let mut scaled = value;
    for d in 0..MAX_DECIMALS {
        if (scaled - scaled.round()).abs() <= 1e-9 * scaled.max(1.0) {
            return d;
        }
        scaled *= 10.0;
    }
    MAX_DECIMALS
}

fn format_value(hz: f64, unit: (f64, &'static str), decimals: usize) -> String {
    format!("{:.*} {}", decimals, hz / unit.0, unit.1)
}

/// Waterfall time label for `samples` at `rate` samples per second.
pub fn format_time(samples: f64, rate: f64) -> String {
    if rate <= 0.0 || !rate.is_finite() {
        return String::new();
    }
    let seconds = samples / rate;
    if seconds == 0.0 {
        "0 s".to_string()
    } else if seconds.abs() >= 1.0 {
        format!("{seconds:.2} s")
    } else if seconds.abs() >= 1e-3 {
        format!("{:.1} ms", seconds * 1e3)
    } else {
        format!("{:.1} µs", seconds * 1e6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_labels_pick_unit_from_largest_frequency() {
        let axis = FreqAxis::build(100.0e6, 2.0e6, 10, false);
        assert_eq!(axis.mode(), AxisMode::Absolute);
        assert_eq!(axis.label(0), "100.0 MHz");
        assert_eq!(axis.label(-5), "99.0 MHz");
        assert_eq!(axis.label(5), "101.0 MHz");
        assert_eq!(axis.label(1), "100.2 MHz");

        let axis = FreqAxis::build(0.0, 48_000.0, 8, false);
        assert_eq!(axis.label(4), "24 kHz");
        assert_eq!(axis.label(-1), "-6 kHz");
    }

    #[test]
    fn fine_centre_switches_to_relative() {
        let axis = FreqAxis::build(100.000_012_3e6, 2.0e6, 10, false);
        assert_eq!(axis.mode(), AxisMode::Relative);
        assert_eq!(axis.label(0), "100.0000123 MHz");
        assert_eq!(axis.label(2), "+400 kHz");
        assert_eq!(axis.label(-1), "-200 kHz");
    }

    #[test]
    fn relative_can_be_forced() {
        let axis = FreqAxis::build(100.0e6, 2.0e6, 10, true);
        assert_eq!(axis.mode(), AxisMode::Relative);
        assert_eq!(axis.label(0), "100 MHz");
        assert_eq!(axis.label(5), "+1000 kHz");
    }

    #[test]
    fn zero_span_labels_only_centre() {
        let axis = FreqAxis::build(1.5e9, 0.0, 10, false);
        assert_eq!(axis.mode(), AxisMode::CenterOnly);
        assert_eq!(axis.label(0), "1.5 GHz");
        assert!(axis.label(3).is_empty());
    }

    #[test]
    fn zoomed_axis_uses_window_centre_and_width() {
        let full = FreqAxis::zoomed(100.0e6, 2.0e6, 0.0, 1.0, 10, false);
        assert_eq!(full, FreqAxis::build(100.0e6, 2.0e6, 10, false));

        let zoomed = FreqAxis::zoomed(100.0e6, 2.0e6, 0.25, 0.75, 10, false);
        assert_eq!(zoomed.label(-5), "99.5 MHz");
        assert_eq!(zoomed.label(5), "100.5 MHz");
    }

    #[test]
    fn time_labels() {
        assert_eq!(format_time(0.0, 1e6), "0 s");
        assert_eq!(format_time(2.5e6, 1e6), "2.50 s");
        assert_eq!(format_time(12_500.0, 1e6), "12.5 ms");
        assert_eq!(format_time(10.0, 1e6), "10.0 µs");
        assert!(format_time(10.0, 0.0).is_empty());
    }
}
