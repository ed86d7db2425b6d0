//! Gradient edge detection with hysteresis (Canny style).
//!
//! Pipeline: intensity, separable Gaussian smoothing, 3x3 Sobel gradients,
//! L1 magnitude, non-maximum suppression along the quantised gradient
//! direction, then hysteresis between the low and high thresholds. Output
//! pixels are 255 (edge) or 0. Image borders are replicated.

use edgewatch_common::config::EdgeConfig;
use edgewatch_common::frame::Frame;
use image::{GrayImage, Luma};

pub const EDGE: u8 = 255;

const TAN_22_5: f32 = 0.414_213_56;
const TAN_67_5: f32 = 2.414_213_6;

/// Normalised 1-D Gaussian weights of odd length `size`.
///
/// Sigma follows the usual size-derived rule `0.3 * ((size - 1) / 2 - 1) + 0.8`.
pub(crate) fn gaussian_kernel(size: u32) -> Vec<f32> {
    let size = size.max(1) | 1;
    let sigma = 0.3 * ((size as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let half = (size / 2) as i32;
    let weights: Vec<f32> = (-half..=half)
        .map(|i| (-((i * i) as f32) / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f32 = weights.iter().sum();
    weights.into_iter().map(|w| w / sum).collect()
}

/// Separable convolution with `kernel` in both directions, rounded back to u8.
pub(crate) fn smooth(gray: &GrayImage, kernel: &[f32]) -> GrayImage {
    let (w, h) = gray.dimensions();
    if w == 0 || h == 0 || kernel.len() <= 1 {
        return gray.clone();
    }
    let half = (kernel.len() / 2) as i64;
    let (wi, hi) = (w as i64, h as i64);
    let src = gray.as_raw();

    let mut horizontal = vec![0f32; src.len()];
    for y in 0..hi {
        let row = (y * wi) as usize;
        for x in 0..wi {
            let mut acc = 0f32;
            for (k, weight) in kernel.iter().enumerate() {
                let sx = (x + k as i64 - half).clamp(0, wi - 1) as usize;
                acc += weight * src[row + sx] as f32;
            }
            horizontal[row + x as usize] = acc;
        }
    }

    let mut out = GrayImage::new(w, h);
    for y in 0..hi {
        for x in 0..wi {
            let mut acc = 0f32;
            for (k, weight) in kernel.iter().enumerate() {
                let sy = (y + k as i64 - half).clamp(0, hi - 1);
                acc += weight * horizontal[(sy * wi + x) as usize];
            }
            out.put_pixel(x as u32, y as u32, Luma([acc.round().clamp(0.0, 255.0) as u8]));
        }
    }
    out
}

/// Binary edge map producer. Stateless; identical input gives identical output.
#[derive(Debug, Clone)]
pub struct EdgeExtractor {
    kernel: Vec<f32>,
    low: f32,
    high: f32,
}

impl EdgeExtractor {
    pub fn new(config: &EdgeConfig) -> Self {
        Self {
            kernel: gaussian_kernel(config.blur_kernel),
            low: config.low_threshold,
            high: config.high_threshold.max(config.low_threshold),
        }
    }

    /// Edge map of a color or gray frame, as a 1-channel frame.
    pub fn extract(&self, frame: &Frame) -> Frame {
        Frame::gray(self.edges(&frame.to_luma()))
    }

    pub fn edges(&self, gray: &GrayImage) -> GrayImage {
        let (w, h) = gray.dimensions();
        if w == 0 || h == 0 {
            return GrayImage::new(w, h);
        }
        let smoothed = smooth(gray, &self.kernel);
        let (gx, gy, mag) = sobel(&smoothed);
        let candidates = suppress_non_maxima(w, h, &gx, &gy, &mag, self.low);
        hysteresis(w, h, &candidates, &mag, self.high)
    }
}

/// Sobel derivatives and L1 magnitude, row-major.
fn sobel(img: &GrayImage) -> (Vec<i32>, Vec<i32>, Vec<f32>) {
    let (w, h) = (img.width() as i64, img.height() as i64);
    let src = img.as_raw();
    let at = |x: i64, y: i64| -> i32 {
        let x = x.clamp(0, w - 1);
        let y = y.clamp(0, h - 1);
        src[(y * w + x) as usize] as i32
    };

    let n = (w * h) as usize;
    let mut gx = vec![0i32; n];
    let mut gy = vec![0i32; n];
    let mut mag = vec![0f32; n];
    for y in 0..h {
        for x in 0..w {
            let dx = (at(x + 1, y - 1) + 2 * at(x + 1, y) + at(x + 1, y + 1))
                - (at(x - 1, y - 1) + 2 * at(x - 1, y) + at(x - 1, y + 1));
            let dy = (at(x - 1, y + 1) + 2 * at(x, y + 1) + at(x + 1, y + 1))
                - (at(x - 1, y - 1) + 2 * at(x, y - 1) + at(x + 1, y - 1));
            let i = (y * w + x) as usize;
            gx[i] = dx;
            gy[i] = dy;
            mag[i] = (dx.abs() + dy.abs()) as f32;
        }
    }
    (gx, gy, mag)
}

/// Keep pixels above `low` that are ridge maxima across the edge.
///
/// A pixel survives if it is strictly greater than its neighbour on the
/// negative side of the gradient and not smaller than the one on the
/// positive side, so a two-pixel plateau keeps exactly one pixel.
fn suppress_non_maxima(w: u32, h: u32, gx: &[i32], gy: &[i32], mag: &[f32], low: f32) -> Vec<bool> {
    let (wi, hi) = (w as i64, h as i64);
    let m = |x: i64, y: i64| -> f32 {
        if x < 0 || y < 0 || x >= wi || y >= hi {
            0.0
        } else {
            mag[(y * wi + x) as usize]
        }
    };

    let mut keep = vec![false; mag.len()];
    for y in 0..hi {
        for x in 0..wi {
            let i = (y * wi + x) as usize;
            let here = mag[i];
            if here <= low {
                continue;
            }
            let ax = gx[i].abs() as f32;
            let ay = gy[i].abs() as f32;
            let ((px, py), (nx, ny)) = if ay <= ax * TAN_22_5 {
                ((x - 1, y), (x + 1, y))
            } else if ay > ax * TAN_67_5 {
                ((x, y - 1), (x, y + 1))
            } else if (gx[i] > 0) == (gy[i] > 0) {
                ((x - 1, y - 1), (x + 1, y + 1))
            } else {
                ((x + 1, y - 1), (x - 1, y + 1))
            };
            keep[i] = here > m(px, py) && here >= m(nx, ny);
        }
    }
    keep
}

/// Promote candidates above `high` to edges and grow them through
/// 8-connected candidates.
fn hysteresis(w: u32, h: u32, candidates: &[bool], mag: &[f32], high: f32) -> GrayImage {
    let (wi, hi) = (w as i64, h as i64);
    let mut out = vec![0u8; candidates.len()];
    let mut stack: Vec<usize> = candidates
        .iter()
        .zip(mag)
        .enumerate()
        .filter(|(_, (&c, &m))| c && m > high)
        .map(|(i, _)| i)
        .collect();
    for &i in &stack {
        out[i] = EDGE;
    }

    while let Some(i) = stack.pop() {
        let (x, y) = ((i as i64) % wi, (i as i64) / wi);
        for dy in -1..=1 {
            for dx in -1..=1 {
                let (nx, ny) = (x + dx, y + dy);
                if nx < 0 || ny < 0 || nx >= wi || ny >= hi {
                    continue;
                }
                let j = (ny * wi + nx) as usize;
                if candidates[j] && out[j] == 0 {
                    out[j] = EDGE;
                    stack.push(j);
                }
            }
        }
    }

    // Dimensions and buffer length always agree here.
    GrayImage::from_raw(w, h, out).unwrap_or_else(|| GrayImage::new(w, h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn extractor() -> EdgeExtractor {
        EdgeExtractor::new(&EdgeConfig::default())
    }

    fn square_frame() -> Frame {
        let mut img = GrayImage::new(100, 100);
        for y in 40..60 {
            for x in 40..60 {
                img.put_pixel(x, y, Luma([255]));
            }
        }
        Frame::gray(img)
    }

    fn edge_extent(edges: &GrayImage) -> Option<(u32, u32, u32, u32)> {
        let mut extent: Option<(u32, u32, u32, u32)> = None;
        for (x, y, p) in edges.enumerate_pixels() {
            if p.0[0] == EDGE {
                extent = Some(match extent {
                    None => (x, y, x, y),
                    Some((a, b, c, d)) => (a.min(x), b.min(y), c.max(x), d.max(y)),
                });
            }
        }
        extent
    }

    #[test]
    fn kernel_is_normalised_and_symmetric() {
        let k = gaussian_kernel(5);
        assert_eq!(k.len(), 5);
        assert!((k.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert_eq!(k[0], k[4]);
        assert!(k[2] > k[1] && k[1] > k[0]);
    }

    #[test]
    fn uniform_frames_have_no_edges() {
        for value in [0u8, 97, 255] {
            let frame = Frame::color(RgbImage::from_pixel(32, 24, Rgb([value, value, value])));
            let edges = extractor().extract(&frame);
            assert_eq!(edges.channels(), 1);
            assert!(edges.to_luma().pixels().all(|p| p.0[0] == 0));
        }
    }

    #[test]
    fn output_is_binary() {
        let edges = extractor().extract(&square_frame());
        assert!(edges
            .to_luma()
            .pixels()
            .all(|p| p.0[0] == 0 || p.0[0] == EDGE));
    }

    #[test]
    fn square_outline_is_detected() {
        let edges = extractor().extract(&square_frame());
        let (x0, y0, x1, y1) = edge_extent(&edges.to_luma()).expect("edges expected");
        assert!((38..=41).contains(&x0), "left edge at {x0}");
        assert!((38..=41).contains(&y0), "top edge at {y0}");
        assert!((58..=61).contains(&x1), "right edge at {x1}");
        assert!((58..=61).contains(&y1), "bottom edge at {y1}");
        // Interior stays flat.
        assert_eq!(edges.to_luma().get_pixel(50, 50).0[0], 0);
    }

    #[test]
    fn deterministic_for_identical_input() {
        let frame = square_frame();
        assert_eq!(extractor().extract(&frame), extractor().extract(&frame));
    }

    #[test]
    fn weak_gradients_below_low_threshold_are_dropped() {
        // A 10-level step yields a gradient far below the default thresholds.
        let img = GrayImage::from_fn(40, 40, |x, _| Luma([if x < 20 { 100 } else { 110 }]));
        let edges = extractor().edges(&img);
        assert!(edges.pixels().all(|p| p.0[0] == 0));
    }

    /// A 100 to 145 step in every row of the lower half, under a 100 to 255
    /// step in the upper half. The weak step's gradient sits between the
    /// default thresholds.
    fn stacked_steps(upper_right: u8) -> GrayImage {
        GrayImage::from_fn(40, 40, |x, y| {
            Luma([match (x < 20, y < 20) {
                (true, _) => 100,
                (false, true) => upper_right,
                (false, false) => 145,
            }])
        })
    }

    #[test]
    fn weak_edge_joined_to_strong_edge_is_kept() {
        let edges = extractor().edges(&stacked_steps(255));
        for y in 28..40 {
            assert!(
                (18..22).any(|x| edges.get_pixel(x, y).0[0] == EDGE),
                "weak row {y} not joined"
            );
        }
    }

    #[test]
    fn isolated_weak_edge_is_dropped() {
        let edges = extractor().edges(&stacked_steps(145));
        assert!(edges.pixels().all(|p| p.0[0] == 0));
    }
}
