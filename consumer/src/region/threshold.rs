use image::{GrayImage, Luma};

use crate::edge::{gaussian_kernel, smooth};

pub const FOREGROUND: u8 = 255;

/// Inverse adaptive threshold against a Gaussian-weighted local mean.
///
/// A pixel is foreground when it is at least `c` levels darker than the
/// mean of its `block` x `block` neighbourhood, so dark strokes on a light
/// background come out white.
pub fn adaptive_threshold_inv(gray: &GrayImage, block: u32, c: i32) -> GrayImage {
    let mean = smooth(gray, &gaussian_kernel(block));
    let mut out = GrayImage::new(gray.width(), gray.height());
    for ((src, local), dst) in gray.pixels().zip(mean.pixels()).zip(out.pixels_mut()) {
        if (src.0[0] as i32) <= local.0[0] as i32 - c {
            *dst = Luma([FOREGROUND]);
        }
    }
    out
}

/// Dilate with a `width` x `height` rectangle anchored at its centre.
/// Pixels outside the image do not contribute.
pub fn dilate_rect(mask: &GrayImage, width: u32, height: u32) -> GrayImage {
    let horizontal = max_filter(mask, width.max(1), true);
    max_filter(&horizontal, height.max(1), false)
}

fn max_filter(src: &GrayImage, length: u32, along_x: bool) -> GrayImage {
    if length == 1 {
        return src.clone();
    }
    let (w, h) = src.dimensions();
    let before = (length / 2) as i64;
    let after = length as i64 - 1 - before;
    let limit = if along_x { w as i64 } else { h as i64 };

    GrayImage::from_fn(w, h, |x, y| {
        let pos = if along_x { x as i64 } else { y as i64 };
        let lo = (pos - before).max(0);
        let hi = (pos + after).min(limit - 1);
        let best = (lo..=hi)
            .map(|p| {
                if along_x {
                    src.get_pixel(p as u32, y).0[0]
                } else {
                    src.get_pixel(x, p as u32).0[0]
                }
            })
            .max()
            .unwrap_or(0);
        Luma([best])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dark_stroke_on_light_background_is_foreground() {
        let img = GrayImage::from_fn(60, 40, |x, y| {
            Luma([if (20..40).contains(&x) && (18..22).contains(&y) { 0 } else { 255 }])
        });
        let mask = adaptive_threshold_inv(&img, 21, 4);
        assert_eq!(mask.get_pixel(30, 20).0[0], FOREGROUND);
        assert_eq!(mask.get_pixel(5, 5).0[0], 0);
        assert_eq!(mask.get_pixel(30, 25).0[0], 0);
    }

    #[test]
    fn uniform_image_has_no_foreground() {
        let img = GrayImage::from_pixel(30, 30, Luma([128]));
        assert!(adaptive_threshold_inv(&img, 21, 4).pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn dilation_grows_by_half_kernel() {
        let mut mask = GrayImage::new(40, 20);
        mask.put_pixel(20, 10, Luma([FOREGROUND]));
        let grown = dilate_rect(&mask, 15, 3);
        let set: Vec<(u32, u32)> = grown
            .enumerate_pixels()
            .filter(|(_, _, p)| p.0[0] == FOREGROUND)
            .map(|(x, y, _)| (x, y))
            .collect();
        assert_eq!(set.len(), 15 * 3);
        assert!(set.iter().all(|&(x, y)| (13..=27).contains(&x) && (9..=11).contains(&y)));
    }

    #[test]
    fn dilation_clips_at_border() {
        let mut mask = GrayImage::new(10, 10);
        mask.put_pixel(0, 0, Luma([FOREGROUND]));
        let grown = dilate_rect(&mask, 5, 5);
        assert_eq!(grown.get_pixel(2, 2).0[0], FOREGROUND);
        assert_eq!(grown.get_pixel(3, 0).0[0], 0);
    }
}
