//! Builds the per-frame draw list from a render descriptor and the engine scales.
//!
//! The list is backend neutral: [`super::gpu::GpuRenderer`] executes it with
//! wgpu, and tests inspect it directly.

use super::axis::{FreqAxis, format_time};
use super::channels;
use super::geometry::RenderDescriptor;
use super::options::Layers;
use crate::backend::{FFT_LEN, WATERFALL_ROWS};
use crate::engine::DisplayScales;
use crate::surface::TextMetrics;

const GRID_COLOR: [f32; 4] = [0.0, 0.0, 0.0, 0.5];
const LABEL_COLOR: [f32; 4] = [1.0, 1.0, 0.33, 1.0];
const SPECTRUM_BACKGROUND: [f32; 4] = [0.0, 0.0, 0.1, 1.0];
const LIVE_COLOR: [f32; 4] = [1.0, 1.0, 1.0, 0.75];
const HOLD_COLOR: [f32; 4] = [1.0, 0.0, 0.0, 0.75];
/// Colour-map input scale for the histogram surface.
const HISTOGRAM_CMAP_SCALE: f32 = 1.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl Rect {
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceKind {
    Waterfall,
    Histogram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trace {
    Live,
    MaxHold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
    Left,
    Center,
    Right,
}

/// A colour-mapped quad sampling one result surface.
///
/// `u` runs over display columns and `v` over surface rows, both normalised
/// to the surface size; the waterfall wraps vertically.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceQuad {
    pub kind: SurfaceKind,
    pub rect: Rect,
    pub u: [f32; 2],
    /// Row coordinate at the top and bottom edges.
    pub v: [f32; 2],
    pub scale: f32,
    pub offset: f32,
}

/// A line strip over a contiguous run of spectrum points.
///
/// Point `i` of the spectrum buffer lands at `x = a·(i mod FFT_LEN) + b`,
/// `y = c·value + d` with `transform = [a, b, c, d]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectrumStrip {
    pub trace: Trace,
    pub first: u32,
    pub count: u32,
    pub transform: [f32; 4],
    pub color: [f32; 4],
    pub clip: Rect,
}

/// A text label anchored at `(x, y)`; `y` is the vertical centre of the line.
#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    pub text: String,
    pub x: f32,
    pub y: f32,
    pub align: Align,
    pub color: [f32; 4],
}

#[derive(Debug, Clone, PartialEq)]
pub enum DrawCommand {
    Fill { rect: Rect, color: [f32; 4] },
    Line { from: [f32; 2], to: [f32; 2], color: [f32; 4] },
    Surface(SurfaceQuad),
    Spectrum(SpectrumStrip),
    ColorScale { kind: SurfaceKind, rect: Rect },
    Text(Label),
}

/// Draw commands in painter's order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrawList {
    pub commands: Vec<DrawCommand>,
}

impl DrawList {
    pub fn push(&mut self, command: DrawCommand) {
        self.commands.push(command);
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DrawCommand> {
        self.commands.iter()
    }

    pub fn surfaces(&self) -> impl Iterator<Item = &SurfaceQuad> {
        self.iter().filter_map(|cmd| match cmd {
            DrawCommand::Surface(quad) => Some(quad),
            _ => None,
        })
    }

    pub fn strips(&self) -> impl Iterator<Item = &SpectrumStrip> {
        self.iter().filter_map(|cmd| match cmd {
            DrawCommand::Spectrum(strip) => Some(strip),
            _ => None,
        })
    }

    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.iter().filter_map(|cmd| match cmd {
            DrawCommand::Text(label) => Some(label.text.as_str()),
            _ => None,
        })
    }
}

/// Spectrum point range `(first, count)` inside the zoom window `[start, stop]`.
///
/// Point 0 is the ambiguous ±fs/2 column and is never drawn.
pub fn spectrum_range(start: f32, stop: f32) -> (u32, u32) {
    let last = (FFT_LEN - 1) as f32;
    let first = 1 + (start * last - 0.5).ceil() as i32;
    let end = 1 + (stop * last - 0.5).floor() as i32;
    let count = (end - first + 1).max(0);
    (first.max(1) as u32, count as u32)
}

/// Horizontal texture range for the zoom window, skipping column 0.
pub fn surface_u(start: f32, stop: f32) -> [f32; 2] {
    let texel = 1.0 / FFT_LEN as f32;
    [texel + (1.0 - texel) * start, texel + (1.0 - texel) * stop]
}

/// Vertical waterfall texture range: newest row at the top, `span` of the history below it.
pub fn waterfall_v(waterfall_pos: usize, span: f32) -> [f32; 2] {
    let top = (waterfall_pos % WATERFALL_ROWS) as f32 - 0.5;
    let top = top / WATERFALL_ROWS as f32;
    [top, top - span]
}

pub fn compose(
    desc: &RenderDescriptor,
    scales: &DisplayScales,
    waterfall_pos: usize,
    metrics: &dyn TextMetrics,
) -> DrawList {
    let mut list = DrawList::default();
    let opts = &desc.options;
    let layers = opts.layers;
    let g = *desc.geometry();
    let (start, stop) = opts.freq_window();
    let (x0, x1) = (g.x[0] as f32, g.x[1] as f32);
    let scale_rect = |[top, bottom]: [i32; 2]| {
        Rect::new(g.scale_x[0] as f32, top as f32, g.scale_x[1] as f32, bottom as f32)
    };

    if layers.contains(Layers::WATERFALL)
        && let Some(rows @ [top, bottom]) = g.waterfall
    {
        list.push(DrawCommand::Surface(SurfaceQuad {
            kind: SurfaceKind::Waterfall,
            rect: Rect::new(x0, top as f32, x1, bottom as f32),
            u: surface_u(start, stop),
            v: waterfall_v(waterfall_pos, opts.clamped_waterfall_span()),
            scale: scales.power.scale(),
            offset: scales.power.offset(),
        }));
        if layers.contains(Layers::COLOR_SCALE) {
            list.push(DrawCommand::ColorScale {
                kind: SurfaceKind::Waterfall,
                rect: scale_rect(rows),
            });
        }
    }

    if let Some(rows @ [top, bottom]) = g.histogram {
        let area = Rect::new(x0, top as f32, x1, bottom as f32);
        if layers.contains(Layers::HISTOGRAM) {
            list.push(DrawCommand::Surface(SurfaceQuad {
                kind: SurfaceKind::Histogram,
                rect: area,
                u: surface_u(start, stop),
                v: [1.0, 0.0],
                scale: HISTOGRAM_CMAP_SCALE,
                offset: 0.0,
            }));
            if layers.contains(Layers::COLOR_SCALE) {
                list.push(DrawCommand::ColorScale {
                    kind: SurfaceKind::Histogram,
                    rect: scale_rect(rows),
                });
            }
        } else if layers.intersects(Layers::LIVE | Layers::MAX_HOLD) {
            list.push(DrawCommand::Fill {
                rect: area,
                color: SPECTRUM_BACKGROUND,
            });
        }

        if layers.intersects(Layers::LIVE | Layers::MAX_HOLD) && stop > start {
            push_spectrum(&mut list, desc, scales, area, start, stop);
        }

        push_grid(&mut list, desc, scales, area, metrics);
    }

    if layers.contains(Layers::TIME_LABELS) {
        push_time_labels(&mut list, desc, scales);
    }

    if layers.contains(Layers::CHANNELS) {
        push_channels(&mut list, desc, start, stop);
    }

    list
}

fn push_spectrum(
    list: &mut DrawList,
    desc: &RenderDescriptor,
    scales: &DisplayScales,
    area: Rect,
    start: f32,
    stop: f32,
) {
    let (first, count) = spectrum_range(start, stop);
    if count < 2 {
        return;
    }
    let last = (FFT_LEN - 1) as f32;
    let width = area.width();
    let height = area.height();
    let zoom = stop - start;
    let power_scale = scales.power.scale();
    let transform = [
        width / (zoom * last),
        area.x0 - width * (0.5 / last + start) / zoom,
        -height * power_scale,
        area.y1 - height * power_scale * scales.power.offset(),
    ];

    for (layer, trace, base, color) in [
        (Layers::LIVE, Trace::Live, 0, LIVE_COLOR),
        (Layers::MAX_HOLD, Trace::MaxHold, FFT_LEN as u32, HOLD_COLOR),
    ] {
        if desc.options.layers.contains(layer) {
            list.push(DrawCommand::Spectrum(SpectrumStrip {
                trace,
                first: base + first,
                count,
                transform,
                color,
                clip: area,
            }));
        }
    }
}

fn push_grid(
    list: &mut DrawList,
    desc: &RenderDescriptor,
    scales: &DisplayScales,
    area: Rect,
    metrics: &dyn TextMetrics,
) {
    let g = desc.geometry();
    let layers = desc.options.layers;
    if !layers.intersects(Layers::SPECTRAL) {
        return;
    }

    for (i, y) in desc.power_ticks().enumerate() {
        let y = y as f32 + 0.5;
        list.push(DrawCommand::Line {
            from: [area.x0 + 0.5, y],
            to: [area.x1 - 0.5, y],
            color: GRID_COLOR,
        });
        if layers.contains(Layers::POWER_LABELS) {
            let db = scales.power.reference_db - i as f32 * scales.power.db_per_div;
            list.push(DrawCommand::Text(Label {
                text: format!("{db:.0}"),
                x: g.x_label as f32,
                y: y - 0.5,
                align: Align::Right,
                color: LABEL_COLOR,
            }));
        }
    }

    let (start, stop) = desc.options.freq_window();
    let n_div = g.n_div as i32;
    let axis = FreqAxis::zoomed(
        scales.frequency.center,
        scales.frequency.span,
        start,
        stop,
        g.n_div,
        desc.options.relative_freq,
    );
    // spread labels so the outermost ones stay within the plot
    let spread = 0.5
        * (metrics.width(&axis.label(n_div / 2)) + metrics.width(&axis.label(-(n_div / 2))));

    for (i, x) in desc.freq_ticks().enumerate() {
        let x = x as f32;
        list.push(DrawCommand::Line {
            from: [x + 0.5, area.y0 + 0.5],
            to: [x + 0.5, area.y1 - 0.5],
            color: GRID_COLOR,
        });
        if layers.contains(Layers::FREQ_LABELS)
            && let Some(y_label) = g.y_label
        {
            let step = i as i32 - n_div / 2;
            let text = axis.label(step);
            if text.is_empty() {
                continue;
            }
            let shift = (-spread * step as f32 / n_div.max(1) as f32).floor();
            list.push(DrawCommand::Text(Label {
                text,
                x: x + shift,
                y: y_label as f32,
                align: Align::Center,
                color: LABEL_COLOR,
            }));
        }
    }
}

fn push_time_labels(list: &mut DrawList, desc: &RenderDescriptor, scales: &DisplayScales) {
    let g = desc.geometry();
    let Some([top, bottom]) = g.waterfall else {
        return;
    };
    let middle = (top + bottom) / 2;
    for y in [top, middle, bottom] {
        let Some(samples) = desc.pos2samp(y as f32) else {
            continue;
        };
        let text = format_time(samples, scales.frequency.span);
        if text.is_empty() {
            continue;
        }
        list.push(DrawCommand::Text(Label {
            text,
            x: g.x_label as f32,
            y: y as f32,
            align: Align::Right,
            color: LABEL_COLOR,
        }));
    }
}

fn push_channels(list: &mut DrawList, desc: &RenderDescriptor, start: f32, stop: f32) {
    let zoom = stop - start;
    if zoom <= 0.0 {
        return;
    }
    let g = desc.geometry();
    let (x0, width) = (g.x[0] as f32, (g.x[1] - g.x[0]) as f32);
    let regions: Vec<[i32; 2]> = [g.histogram, g.waterfall].into_iter().flatten().collect();

    for shade in channels::shades(&desc.options.channels) {
        let a = ((shade.start - start) / zoom).clamp(0.0, 1.0);
        let b = ((shade.stop - start) / zoom).clamp(0.0, 1.0);
        if (b - a) * width < 0.5 {
            continue;
        }
        for &[top, bottom] in &regions {
            list.push(DrawCommand::Fill {
                rect: Rect::new(x0 + a * width, top as f32, x0 + b * width, bottom as f32),
                color: shade.color,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{FrequencyRange, PowerRange};
    use crate::render::options::{Channel, RenderOptions};
    use crate::surface::MonospaceMetrics;

    fn scales() -> DisplayScales {
        DisplayScales {
            power: PowerRange::default(),
            frequency: FrequencyRange {
                center: 100.0e6,
                span: 2.0e6,
            },
        }
    }

    fn desc(layers: Layers) -> RenderDescriptor {
        RenderDescriptor::new(RenderOptions {
            layers,
            ..RenderOptions::default()
        })
    }

    fn compose_with(desc: &RenderDescriptor, pos: usize) -> DrawList {
        compose(desc, &scales(), pos, &MonospaceMetrics::default())
    }

    #[test]
    fn no_layers_no_commands() {
        assert!(compose_with(&desc(Layers::NONE), 0).is_empty());
    }

    #[test]
    fn default_layers_draw_everything_enabled() {
        let d = desc(Layers::default());
        let list = compose_with(&d, 0);
        let kinds: Vec<_> = list.surfaces().map(|q| q.kind).collect();
        assert_eq!(kinds, [SurfaceKind::Waterfall, SurfaceKind::Histogram]);
        let traces: Vec<_> = list.strips().map(|s| s.trace).collect();
        assert_eq!(traces, [Trace::Live, Trace::MaxHold]);
        let scales_drawn = list
            .iter()
            .filter(|c| matches!(c, DrawCommand::ColorScale { .. }))
            .count();
        assert_eq!(scales_drawn, 2);

        let n_div = d.geometry().n_div as usize;
        let lines = list
            .iter()
            .filter(|c| matches!(c, DrawCommand::Line { .. }))
            .count();
        assert_eq!(lines, 11 + n_div + 1);
        assert_eq!(list.texts().count(), 11 + n_div + 1);
        assert!(list.texts().any(|t| t == "0"));
        assert!(list.texts().any(|t| t == "-100"));
        assert!(list.texts().any(|t| t == "100.0 MHz"));
    }

    #[test]
    fn traces_without_histogram_get_a_background() {
        let list = compose_with(&desc(Layers::LIVE), 0);
        assert!(list.surfaces().next().is_none());
        assert!(matches!(
            list.commands[0],
            DrawCommand::Fill { color, .. } if color == SPECTRUM_BACKGROUND
        ));
        assert_eq!(list.strips().count(), 1);
        assert_eq!(list.texts().count(), 0);
    }

    #[test]
    fn disabled_layers_issue_no_calls() {
        let list = compose_with(&desc(Layers::WATERFALL), 0);
        assert_eq!(list.len(), 1);
        assert!(matches!(list.commands[0], DrawCommand::Surface(SurfaceQuad { kind: SurfaceKind::Waterfall, .. })));

        let list = compose_with(&desc(Layers::HISTOGRAM | Layers::MAX_HOLD), 0);
        assert_eq!(list.surfaces().count(), 1);
        let strips: Vec<_> = list.strips().collect();
        assert_eq!(strips.len(), 1);
        assert_eq!(strips[0].first, FFT_LEN as u32 + 1);
    }

    #[test]
    fn spectrum_range_follows_zoom() {
        assert_eq!(spectrum_range(0.0, 1.0), (1, 1023));
        let (first, count) = spectrum_range(0.25, 0.75);
        assert_eq!(first, 1 + (0.25f32 * 1023.0 - 0.5).ceil() as u32);
        assert!((510..=512).contains(&count));
        assert!(spectrum_range(0.5, 0.5).1 <= 1);
    }

    #[test]
    fn strip_transform_spans_plot() {
        for (start, stop) in [(0.0, 1.0), (0.25, 0.75), (0.6, 0.7)] {
            let mut d = desc(Layers::LIVE);
            d.options.set_freq_window(start, stop);
            d.refresh();
            let list = compose_with(&d, 0);
            let strip = list.strips().next().unwrap();
            let [a, b, _, _] = strip.transform;
            let bin = a;
            let first_x = a * strip.first as f32 + b;
            let last_x = a * (strip.first + strip.count - 1) as f32 + b;
            let [x0, x1] = d.geometry().x;
            assert!(first_x >= x0 as f32 - 0.01 && first_x <= x0 as f32 + bin);
            assert!(last_x <= x1 as f32 + 0.01 && last_x >= x1 as f32 - bin);
        }
    }

    #[test]
    fn strip_power_transform_matches_grid() {
        let d = desc(Layers::LIVE);
        let list = compose_with(&d, 0);
        let strip = list.strips().next().unwrap();
        let [_, _, c, dd] = strip.transform;
        let [top, bottom] = d.geometry().histogram.unwrap();
        let power = PowerRange::default();
        // stored value giving 0 dB at the reference line, and the floor at the bottom
        let at_ref = power.reference_db / 20.0 + (FFT_LEN as f32).log10();
        let at_floor = power.floor_db() / 20.0 + (FFT_LEN as f32).log10();
        assert!((c * at_ref + dd - top as f32).abs() < 0.01);
        assert!((c * at_floor + dd - bottom as f32).abs() < 0.01);
    }

    #[test]
    fn waterfall_scrolls_by_texture_coordinates() {
        let d = desc(Layers::WATERFALL);
        let v = |pos| compose_with(&d, pos).surfaces().next().unwrap().v;
        assert_eq!(v(0), [-0.5 / 1024.0, -0.5 / 1024.0 - 1.0]);
        assert_eq!(v(512), [511.5 / 1024.0, 511.5 / 1024.0 - 1.0]);
        assert_eq!(v(1024 + 512), v(512));

        let quad = compose_with(&d, 0).surfaces().next().copied().unwrap();
        assert_eq!(quad.u, surface_u(0.0, 1.0));
        assert!((quad.u[0] - 1.0 / 1024.0).abs() < 1e-7);
        assert_eq!(quad.u[1], 1.0);
    }

    #[test]
    fn frequency_labels_spread_symmetrically() {
        let d = desc(Layers::HISTOGRAM | Layers::FREQ_LABELS);
        let list = compose_with(&d, 0);
        let ticks: Vec<i32> = d.freq_ticks().collect();
        let labels: Vec<(f32, String)> = list
            .iter()
            .filter_map(|c| match c {
                DrawCommand::Text(label) => Some((label.x, label.text.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(labels.len(), ticks.len());
        let mid = ticks.len() / 2;
        assert_eq!(labels[mid].0, ticks[mid] as f32);
        assert!(labels[0].0 > ticks[0] as f32);
        assert!(labels[ticks.len() - 1].0 < ticks[ticks.len() - 1] as f32);
    }

    #[test]
    fn time_labels_cover_waterfall() {
        let d = desc(Layers::WATERFALL | Layers::TIME_LABELS);
        let list = compose_with(&d, 0);
        let texts: Vec<_> = list.texts().collect();
        assert_eq!(texts.len(), 3);
        assert_eq!(texts[0], "0 s");
        // 1024 rows of 1024 samples at 2 MS/s
        assert_eq!(texts[2], "524.3 ms");
    }

    #[test]
    fn channel_overlay_shades_both_regions() {
        let mut d = desc(Layers::default() | Layers::CHANNELS);
        d.options.channels[0] = Channel {
            enabled: true,
            center: 0.5,
            width: 0.2,
        };
        let list = compose_with(&d, 0);
        let fills: Vec<Rect> = list
            .iter()
            .filter_map(|c| match c {
                DrawCommand::Fill { rect, .. } => Some(*rect),
                _ => None,
            })
            .collect();
        assert_eq!(fills.len(), 4);
        let [x0, x1] = d.geometry().x;
        assert_eq!(fills[0].x0, x0 as f32);
        assert_eq!(fills[3].x1, x1 as f32);
    }

    #[test]
    fn channel_overlay_follows_zoom() {
        let mut d = desc(Layers::WATERFALL | Layers::CHANNELS);
        d.options.set_freq_window(0.4, 0.6);
        d.options.channels[1] = Channel {
            enabled: true,
            center: 0.45,
            width: 0.1,
        };
        d.refresh();
        let list = compose_with(&d, 0);
        let fills: Vec<Rect> = list
            .iter()
            .filter_map(|c| match c {
                DrawCommand::Fill { rect, .. } => Some(*rect),
                _ => None,
            })
            .collect();
        // band covers the left half of the window; only the right half is dimmed
        assert_eq!(fills.len(), 1);
        let [x0, x1] = d.geometry().x;
        let mid = x0 as f32 + 0.5 * (x1 - x0) as f32;
        assert!((fills[0].x0 - mid).abs() < 1.0);
        assert_eq!(fills[0].x1, x1 as f32);
    }
}
