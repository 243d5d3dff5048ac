//! Colour tables for the waterfall and histogram surfaces.

pub const PALETTE_LEN: usize = 256;

/// Dark blue through cyan and yellow to red, rising in brightness.
const WATERFALL_STOPS: &[(f32, [f32; 3])] = &[
    (0.00, [0.00, 0.00, 0.08]),
    (0.20, [0.05, 0.05, 0.55]),
    (0.45, [0.00, 0.70, 0.90]),
    (0.65, [0.30, 0.90, 0.20]),
    (0.85, [1.00, 0.85, 0.00]),
    (1.00, [1.00, 0.10, 0.05]),
];

/// Near-black purple glow that blooms through magenta and orange to white.
const HISTOGRAM_STOPS: &[(f32, [f32; 3])] = &[
    (0.00, [0.00, 0.00, 0.00]),
    (0.06, [0.25, 0.05, 0.30]),
    (0.30, [0.60, 0.10, 0.75]),
    (0.55, [0.95, 0.20, 0.45]),
    (0.80, [1.00, 0.65, 0.10]),
    (1.00, [1.00, 1.00, 0.90]),
];

pub fn waterfall_palette() -> Vec<[f32; 4]> {
    ramp(WATERFALL_STOPS, PALETTE_LEN)
}

pub fn histogram_palette() -> Vec<[f32; 4]> {
    ramp(HISTOGRAM_STOPS, PALETTE_LEN)
}

/// Linear interpolation of `palette` at `t` in [0, 1].
pub fn lookup(palette: &[[f32; 4]], t: f32) -> [f32; 4] {
    let Some(last) = palette.len().checked_sub(1) else {
        return [0.0; 4];
    };
    let pos = t.clamp(0.0, 1.0) * last as f32;
    let i = (pos.floor() as usize).min(last);
    let j = (i + 1).min(last);
    let f = pos - i as f32;
    std::array::from_fn(|k| mix(palette[i][k], palette[j][k], f))
}

fn ramp(stops: &[(f32, [f32; 3])], len: usize) -> Vec<[f32; 4]> {
    (0..len)
        .map(|i| {
            let t = i as f32 / (len.max(2) - 1) as f32;
            let upper = stops
                .iter()
                .position(|(at, _)| *at >= t)
                .unwrap_or(stops.len() - 1)
                .max(1);
            let (t0, c0) = stops[upper - 1];
            let (t1, c1) = stops[upper];
            let f = if t1 > t0 { ((t - t0) / (t1 - t0)).clamp(0.0, 1.0) } else { 1.0 };
            [mix(c0[0], c1[0], f), mix(c0[1], c1[1], f), mix(c0[2], c1[2], f), 1.0]
        })
        .collect()
}

fn mix(a: f32, b: f32, f: f32) -> f32 {
    a * (1.0 - f) + b * f
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn palettes_hit_their_end_stops() {
        let wf = waterfall_palette();
        assert_eq!(wf.len(), PALETTE_LEN);
        assert_eq!(wf[0], [0.0, 0.0, 0.08, 1.0]);
        assert_eq!(wf[PALETTE_LEN - 1], [1.0, 0.1, 0.05, 1.0]);

        let histo = histogram_palette();
        assert_eq!(histo[0], [0.0, 0.0, 0.0, 1.0]);
        assert!(histo.iter().all(|c| c.iter().all(|v| (0.0..=1.0).contains(v))));
    }

    #[test]
    fn lookup_interpolates_and_clamps() {
        let palette = [[0.0, 0.0, 0.0, 1.0], [1.0, 0.5, 0.0, 1.0]];
        assert_eq!(lookup(&palette, 0.5), [0.5, 0.25, 0.0, 1.0]);
        assert_eq!(lookup(&palette, -3.0), palette[0]);
        assert_eq!(lookup(&palette, 7.0), palette[1]);
        assert_eq!(lookup(&[], 0.5), [0.0; 4]);
    }
}
