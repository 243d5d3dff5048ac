use serde::{Deserialize, Serialize};

/// Gain applied to the default Hamming window.
pub const DEFAULT_WINDOW_GAIN: f32 = 1.855;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    /// Periodic Hamming scaled by [`DEFAULT_WINDOW_GAIN`].
    #[default]
    Default,
    Rectangular,
    Hann,
    Hamming,
    Blackman,
}

impl WindowKind {
    pub fn coefficients(self, len: usize) -> Vec<f32> {
        let raised = |a0: f32, a1: f32, a2: f32| -> Vec<f32> {
            (0..len)
                .map(|n| {
                    let phase = (n as f32) * core::f32::consts::TAU / (len as f32);
                    a0 - a1 * phase.cos() + a2 * (2.0 * phase).cos()
                })
                .collect()
        };
        let mut coeffs = match self {
            WindowKind::Default => {
                return raised(0.54, 0.46, 0.0)
                    .into_iter()
                    .map(|w| w * DEFAULT_WINDOW_GAIN)
                    .collect();
            }
            WindowKind::Rectangular => vec![1.0; len],
            WindowKind::Hann => raised(0.5, 0.5, 0.0),
            WindowKind::Hamming => raised(0.54, 0.46, 0.0),
            WindowKind::Blackman => raised(0.42, 0.5, 0.08),
        };
        normalize_coherent_gain(&mut coeffs);
        coeffs
    }
}

/// Scales `coeffs` so their mean is one.
fn normalize_coherent_gain(coeffs: &mut [f32]) {
    let sum: f32 = coeffs.iter().sum();
    if sum > 0.0 {
        let scale = coeffs.len() as f32 / sum;
        coeffs.iter_mut().for_each(|w| *w *= scale);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_scaled_periodic_hamming() {
        let w = WindowKind::Default.coefficients(1024);
        assert!((w[0] - 0.08 * DEFAULT_WINDOW_GAIN).abs() < 1e-5);
        assert!((w[512] - DEFAULT_WINDOW_GAIN).abs() < 1e-5);
        // periodic: symmetric around the centre sample, not the array end
        assert!((w[1] - w[1023]).abs() < 1e-5);
    }

    #[test]
    fn alternative_windows_have_unit_coherent_gain() {
        for kind in [
            WindowKind::Rectangular,
            WindowKind::Hann,
            WindowKind::Hamming,
            WindowKind::Blackman,
        ] {
            let w = kind.coefficients(1024);
            let mean = w.iter().sum::<f32>() / w.len() as f32;
            assert!((mean - 1.0).abs() < 1e-4, "{kind:?}");
        }
    }
}
