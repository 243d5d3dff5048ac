//! Channel overlay: turns enabled bands into non-overlapping shaded intervals.

use super::options::Channel;

const DIM: [f32; 4] = [0.0, 0.0, 0.0, 0.5];

/// A shaded interval in normalised frequency over the full bandwidth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Shade {
    pub start: f32,
    pub stop: f32,
    pub color: [f32; 4],
}

#[derive(Debug, Clone, Copy)]
struct Edge {
    pos: f32,
    dir: i32,
}

/// Sweeps the band edges left to right. Outside every band is dimmed;
/// inside a single band is left clear; overlaps are lightened with an
/// opacity that grows with depth but stays below 0.2.
pub fn shades(channels: &[Channel]) -> Vec<Shade> {
    let mut edges = Vec::with_capacity(2 * channels.len() + 2);
    edges.push(Edge { pos: 0.0, dir: -1 });
    edges.push(Edge { pos: 1.0, dir: 1 });
    for ch in channels.iter().filter(|ch| ch.enabled) {
        let half = 0.5 * ch.width;
        edges.push(Edge {
            pos: clamp_unit(ch.center - half),
            dir: 1,
        });
        edges.push(Edge {
            pos: clamp_unit(ch.center + half),
            dir: -1,
        });
    }
    if edges.len() == 2 {
        return Vec::new();
    }

    insertion_sort(&mut edges[1..]);

    let mut out = Vec::new();
    let mut level = edges[0].dir;
    for pair in edges.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        if prev.pos != next.pos && level != 0 {
            let color = if level < 0 {
                DIM
            } else {
                [1.0, 1.0, 1.0, 0.2 - 0.2 / (1 + level) as f32]
            };
            out.push(Shade {
                start: prev.pos,
                stop: next.pos,
                color,
            });
        }
        level += next.dir;
    }
    out
}

fn insertion_sort(edges: &mut [Edge]) {
    for i in 1..edges.len() {
        let mut j = i;
        while j > 0 && edges[j - 1].pos > edges[j].pos {
            edges.swap(j - 1, j);
            j -= 1;
        }
    }
}

fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}
