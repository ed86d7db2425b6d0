//! Drawing for human consumption. Never applied to frames that are analysed.

use edgewatch_common::frame::Frame;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;

use crate::region::Component;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: u32 = 2;
const LINE_COLOR: Rgb<u8> = Rgb([0, 255, 255]);

#[derive(Debug, Clone, Copy)]
pub struct GraphOptions {
    pub width: u32,
    pub height: u32,
}

/// Copy of `frame` with a green rectangle drawn around each component.
pub fn annotate_components(frame: &Frame, components: &[Component]) -> RgbImage {
    let mut canvas = frame.to_rgb();
    let (w, h) = canvas.dimensions();
    for component in components {
        let Some(b) = component.bbox.clip(w, h) else {
            continue;
        };
        // Nested outlines, each one pixel further in.
        for t in 0..BOX_THICKNESS {
            let (inner_w, inner_h) = (b.width.saturating_sub(2 * t), b.height.saturating_sub(2 * t));
            if inner_w == 0 || inner_h == 0 {
                break;
            }
            let rect = Rect::at((b.x + t) as i32, (b.y + t) as i32).of_size(inner_w, inner_h);
            draw_hollow_rect_mut(&mut canvas, rect, BOX_COLOR);
        }
    }
    canvas
}

/// Plot `(seconds, score)` points as a polyline on a black canvas.
///
/// Time spans the full width. Scores are scaled between their own minimum
/// and maximum with 10% padding above and below, larger values higher up.
pub fn render_score_graph(points: &[(f64, f64)], options: GraphOptions) -> RgbImage {
    let (w, h) = (options.width.max(1), options.height.max(1));
    let mut canvas = RgbImage::new(w, h);
    if points.is_empty() {
        return canvas;
    }

    let (mut t_min, mut t_max) = (f64::INFINITY, f64::NEG_INFINITY);
    let (mut v_min, mut v_max) = (f64::INFINITY, f64::NEG_INFINITY);
    for &(t, v) in points {
        t_min = t_min.min(t);
        t_max = t_max.max(t);
        v_min = v_min.min(v);
        v_max = v_max.max(v);
    }
    let pad = (v_max - v_min) * 0.1;
    let (v_lo, v_hi) = (v_min - pad, v_max + pad);

    let to_pixel = |(t, v): (f64, f64)| -> (f32, f32) {
        let x = if t_max > t_min {
            (t - t_min) / (t_max - t_min) * w as f64
        } else {
            0.0
        };
        let y = if v_hi > v_lo {
            (v - v_lo) / (v_hi - v_lo) * h as f64
        } else {
            0.0
        };
        let x = (x as i64).clamp(0, w as i64 - 1);
        let y = (h as i64 - y as i64).clamp(0, h as i64 - 1);
        (x as f32, y as f32)
    };

    let pixels: Vec<(f32, f32)> = points.iter().map(|&p| to_pixel(p)).collect();
    if let [(x, y)] = pixels[..] {
        draw_filled_rect_mut(&mut canvas, Rect::at(x as i32, y as i32).of_size(1, 2), LINE_COLOR);
        return canvas;
    }
    for pair in pixels.windows(2) {
        let (start, end) = (pair[0], pair[1]);
        // Second pass one row down for a two-pixel stroke.
        for dy in [0.0, 1.0] {
            draw_line_segment_mut(
                &mut canvas,
                (start.0, start.1 + dy),
                (end.0, end.1 + dy),
                LINE_COLOR,
            );
        }
    }
    canvas
}
