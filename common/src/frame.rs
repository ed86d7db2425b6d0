use image::{GrayImage, RgbImage};
use serde::Serialize;
use std::borrow::Cow;
use std::time::Instant;

/// Byte layout of a raw capture buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    Bgr,
    Bgra,
    Rgb,
    Rgba,
    Gray,
}

impl PixelLayout {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelLayout::Gray => 1,
            PixelLayout::Bgr | PixelLayout::Rgb => 3,
            PixelLayout::Bgra | PixelLayout::Rgba => 4,
        }
    }
}

/// An immutable grid of pixels: 3-channel color or 1-channel intensity.
///
/// Edge maps are `Gray` frames whose pixels are either 0 or 255.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Color(RgbImage),
    Gray(GrayImage),
}

impl Frame {
    pub fn color(image: RgbImage) -> Self {
        Frame::Color(image)
    }

    pub fn gray(image: GrayImage) -> Self {
        Frame::Gray(image)
    }

    /// Build a frame from a raw capture buffer, normalising BGR(A)/RGBA to RGB.
    pub fn from_raw(
        width: u32,
        height: u32,
        layout: PixelLayout,
        data: Vec<u8>,
    ) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::Empty { width, height });
        }
        let bpp = layout.bytes_per_pixel();
        let expected = width as usize * height as usize * bpp;
        if data.len() != expected {
            return Err(FrameError::BufferSize {
                got: data.len(),
                expected,
            });
        }

        let frame = match layout {
            PixelLayout::Gray => GrayImage::from_raw(width, height, data).map(Frame::Gray),
            PixelLayout::Rgb => RgbImage::from_raw(width, height, data).map(Frame::Color),
            PixelLayout::Bgr | PixelLayout::Bgra | PixelLayout::Rgba => {
                let swap = matches!(layout, PixelLayout::Bgr | PixelLayout::Bgra);
                let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
                for px in data.chunks_exact(bpp) {
                    if swap {
                        rgb.extend_from_slice(&[px[2], px[1], px[0]]);
                    } else {
                        rgb.extend_from_slice(&px[..3]);
                    }
                }
                RgbImage::from_raw(width, height, rgb).map(Frame::Color)
            }
        };
        frame.ok_or(FrameError::BufferSize {
            got: expected,
            expected,
        })
    }

    pub fn width(&self) -> u32 {
        self.dimensions().0
    }

    pub fn height(&self) -> u32 {
        self.dimensions().1
    }

    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Frame::Color(img) => img.dimensions(),
            Frame::Gray(img) => img.dimensions(),
        }
    }

    pub fn channels(&self) -> u8 {
        match self {
            Frame::Color(_) => 3,
            Frame::Gray(_) => 1,
        }
    }

    /// Single-channel intensity view. Borrowed when the frame is already gray.
    pub fn to_luma(&self) -> Cow<'_, GrayImage> {
        match self {
            Frame::Color(img) => Cow::Owned(image::imageops::grayscale(img)),
            Frame::Gray(img) => Cow::Borrowed(img),
        }
    }

    /// Copy the region covered by `bbox`, clipped to the frame bounds.
    /// Returns `None` when the box lies entirely outside the frame.
    pub fn crop(&self, bbox: &BoundingBox) -> Option<Frame> {
        let (width, height) = self.dimensions();
        let clipped = bbox.clip(width, height)?;
        let (x, y, w, h) = clipped.key();
        Some(match self {
            Frame::Color(img) => Frame::Color(image::imageops::crop_imm(img, x, y, w, h).to_image()),
            Frame::Gray(img) => Frame::Gray(image::imageops::crop_imm(img, x, y, w, h).to_image()),
        })
    }

    /// RGB copy of the frame, for drawing on.
    pub fn to_rgb(&self) -> RgbImage {
        match self {
            Frame::Color(img) => img.clone(),
            Frame::Gray(img) => image::DynamicImage::ImageLuma8(img.clone()).to_rgb8(),
        }
    }
}

/// A frame with its monotonic capture instant.
///
/// `captured_at` drives all windowing; `captured_at_ms` is wall-clock time
/// kept only for reporting.
#[derive(Debug, Clone)]
pub struct TimestampedFrame {
    pub frame: Frame,
    pub captured_at: Instant,
    pub captured_at_ms: i64,
    pub seq: u64,
}

impl TimestampedFrame {
    pub fn new(frame: Frame, seq: u64) -> Self {
        Self::at(frame, Instant::now(), seq)
    }

    pub fn at(frame: Frame, captured_at: Instant, seq: u64) -> Self {
        Self {
            frame,
            captured_at,
            captured_at_ms: chrono::Utc::now().timestamp_millis(),
            seq,
        }
    }

    /// Same capture metadata carrying different pixels, such as the
    /// frame's edge map.
    pub fn with_frame(&self, frame: Frame) -> Self {
        Self {
            frame,
            captured_at: self.captured_at,
            captured_at_ms: self.captured_at_ms,
            seq: self.seq,
        }
    }
}

/// Axis-aligned region in a frame's pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Inclusive pixel extents, `(min_x, min_y, max_x, max_y)`.
    pub fn from_extents(min_x: u32, min_y: u32, max_x: u32, max_y: u32) -> Self {
        Self::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1)
    }

    pub fn key(&self) -> (u32, u32, u32, u32) {
        (self.x, self.y, self.width, self.height)
    }

    /// One past the last column.
    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    /// One past the last row.
    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    /// width / height; infinite for zero-height boxes.
    pub fn aspect_ratio(&self) -> f64 {
        if self.height == 0 {
            f64::INFINITY
        } else {
            self.width as f64 / self.height as f64
        }
    }

    pub fn clip(&self, width: u32, height: u32) -> Option<BoundingBox> {
        let right = self.right().min(width);
        let bottom = self.bottom().min(height);
        if self.x >= right || self.y >= bottom {
            return None;
        }
        Some(Self::new(self.x, self.y, right - self.x, bottom - self.y))
    }

    /// Grow by `margin` on every side, clipped to `width` x `height`.
    pub fn expand(&self, margin: u32, width: u32, height: u32) -> BoundingBox {
        let x = self.x.saturating_sub(margin);
        let y = self.y.saturating_sub(margin);
        let right = self.right().saturating_add(margin).min(width);
        let bottom = self.bottom().saturating_add(margin).min(height);
        Self::new(x, y, right.saturating_sub(x), bottom.saturating_sub(y))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame buffer has {got} bytes, expected {expected}")]
    BufferSize { got: usize, expected: usize },
    #[error("frame has no pixels ({width}x{height})")]
    Empty { width: u32, height: u32 },
}
