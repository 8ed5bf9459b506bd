//! Training curves rendered straight into a PNG with the `image` crate.

use std::path::Path;

use image::{ImageResult, Rgb, RgbImage};

use crate::train::History;

const WIDTH: u32 = 1200;
const PANEL_HEIGHT: u32 = 500;
const MARGIN: i64 = 40;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const AXIS: Rgb<u8> = Rgb([60, 60, 60]);
const GRID: Rgb<u8> = Rgb([225, 225, 225]);
const TRAIN: Rgb<u8> = Rgb([31, 119, 180]);
const VAL: Rgb<u8> = Rgb([255, 127, 14]);
const PHASE: Rgb<u8> = Rgb([44, 160, 44]);

/// Plot area of one panel in image coordinates.
#[derive(Debug, Clone, Copy)]
struct Panel {
    left: i64,
    top: i64,
    right: i64,
    bottom: i64,
}

impl Panel {
    fn stacked(index: u32) -> Self {
        let top = (index * PANEL_HEIGHT) as i64;
        Self {
            left: MARGIN,
            top: top + MARGIN,
            right: WIDTH as i64 - MARGIN,
            bottom: top + PANEL_HEIGHT as i64 - MARGIN,
        }
    }

    fn x(&self, i: usize, n: usize) -> i64 {
        if n < 2 {
            return (self.left + self.right) / 2;
        }
        self.left + (i as i64 * (self.right - self.left)) / (n as i64 - 1)
    }

    /// `y` is clamped to the fixed [0, 1] axis.
    fn y(&self, v: f64) -> i64 {
        let v = if v.is_finite() { v.clamp(0.0, 1.0) } else { 1.0 };
        self.bottom - (v * (self.bottom - self.top) as f64).round() as i64
    }
}

fn put(img: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < img.width() && (y as u32) < img.height() {
        img.put_pixel(x as u32, y as u32, color);
    }
}

/// Bresenham, two pixels thick.
fn line(img: &mut RgbImage, (x0, y0): (i64, i64), (x1, y1): (i64, i64), color: Rgb<u8>) {
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let (mut x, mut y, mut err) = (x0, y0, dx + dy);
    loop {
        put(img, x, y, color);
        put(img, x, y + 1, color);
        if x == x1 && y == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
    }
}

fn draw_frame(img: &mut RgbImage, p: Panel) {
    for step in 1..4 {
        let y = p.y(step as f64 * 0.25);
        line(img, (p.left, y), (p.right, y), GRID);
    }
    line(img, (p.left, p.top), (p.left, p.bottom), AXIS);
    line(img, (p.left, p.bottom), (p.right, p.bottom), AXIS);
}

fn draw_series(img: &mut RgbImage, p: Panel, values: &[f64], color: Rgb<u8>) {
    let n = values.len();
    let points: Vec<(i64, i64)> = values.iter().enumerate().map(|(i, &v)| (p.x(i, n), p.y(v))).collect();
    if let [only] = points.as_slice() {
        put(img, only.0, only.1, color);
    }
    for pair in points.windows(2) {
        line(img, pair[0], pair[1], color);
    }
}

const SWATCH_W: i64 = 28;
const SWATCH_H: i64 = 10;

/// Top-left corners of the train and val legend swatches.
fn legend_origins(p: Panel) -> [(i64, i64); 2] {
    let y = p.top + 8;
    [(p.right - 2 * SWATCH_W - 24, y), (p.right - SWATCH_W - 8, y)]
}

fn draw_legend(img: &mut RgbImage, p: Panel) {
    for ((x0, y0), color) in legend_origins(p).into_iter().zip([TRAIN, VAL]) {
        for y in y0..y0 + SWATCH_H {
            for x in x0..x0 + SWATCH_W {
                put(img, x, y, color);
            }
        }
    }
}

fn draw_phase_marker(img: &mut RgbImage, p: Panel, at: usize, n: usize) {
    let x = p.x(at, n);
    let mut y = p.top;
    while y < p.bottom {
        line(img, (x, y), (x, (y + 6).min(p.bottom)), PHASE);
        y += 12;
    }
}

/// Draws accuracy (top) and loss (bottom) for both phases, with a marker at
/// the last epoch of the first phase, and writes the PNG to `path`.
/// Returns the number of plotted epochs.
///
/// Color key: blue is the training series, orange is validation, the dashed
/// green vertical line is the fine-tuning boundary. The x axis is the epoch
/// across both phases, the y axis is fixed to [0, 1] with grid lines every
/// 0.25. Each panel repeats the blue/orange key as swatches in its top-right
/// corner.
pub fn plot_history(frozen: &History, fine_tune: &History, path: &Path) -> ImageResult<usize> {
    let all = History::concat(&[frozen, fine_tune]);
    let n = all.len();
    let mut img = RgbImage::from_pixel(WIDTH, PANEL_HEIGHT * 2, BACKGROUND);

    let panels = [
        (Panel::stacked(0), all.accuracy(), all.val_accuracy()),
        (Panel::stacked(1), all.loss(), all.val_loss()),
    ];
    for (panel, train, val) in &panels {
        draw_frame(&mut img, *panel);
        if !frozen.is_empty() && !fine_tune.is_empty() {
            draw_phase_marker(&mut img, *panel, frozen.len() - 1, n);
        }
        draw_series(&mut img, *panel, train, TRAIN);
        draw_series(&mut img, *panel, val, VAL);
        draw_legend(&mut img, *panel);
    }

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    img.save(path)?;
    Ok(n)
}
