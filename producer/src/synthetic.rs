use async_trait::async_trait;
use edgewatch_common::config::MIN_FRAME_INTERVAL;
use edgewatch_common::frame::{Frame, FrameError, PixelLayout};
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};

use crate::{CaptureError, FrameSource};

const BACKGROUND: u8 = 32;
const BAR: u8 = 200;
const SQUARE: u8 = 240;
const STEP_PX: u64 = 4;

/// Deterministic test pattern: a few static bright bars and a square that
/// slides left to right, delivered as BGRA like a screen grabber would.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    index: u64,
    ticker: Interval,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, interval: Duration) -> Result<Self, CaptureError> {
        if width == 0 || height == 0 {
            return Err(FrameError::Empty { width, height }.into());
        }
        let mut ticker = tokio::time::interval(interval.max(MIN_FRAME_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Ok(Self {
            width,
            height,
            index: 0,
            ticker,
        })
    }

    /// Raw BGRA buffer of frame number `index`.
    pub fn render(&self, index: u64) -> Vec<u8> {
        let (w, h) = (self.width as u64, self.height as u64);
        let side = (h / 6).max(2);
        let travel = w.saturating_sub(side).max(1);
        let square_x = (index * STEP_PX) % travel;
        let square_y = h / 2;

        // Three horizontal bars in the top third, like a row of labels.
        let bar_h = (h / 24).max(1);
        let bars: Vec<(u64, u64, u64, u64)> = (0..3)
            .map(|i| {
                let x = w / 10 + i * (w * 3 / 10);
                (x, h / 8, w / 5, bar_h)
            })
            .collect();

        let mut buf = vec![0u8; (w * h * 4) as usize];
        for y in 0..h {
            for x in 0..w {
                let in_square =
                    x >= square_x && x < square_x + side && y >= square_y && y < square_y + side;
                let in_bar = bars
                    .iter()
                    .any(|&(bx, by, bw, bh)| x >= bx && x < bx + bw && y >= by && y < by + bh);
                let v = if in_square {
                    SQUARE
                } else if in_bar {
                    BAR
                } else {
                    BACKGROUND
                };
                let i = ((y * w + x) * 4) as usize;
                buf[i..i + 4].copy_from_slice(&[v, v, v, 255]);
            }
        }
        buf
    }
}

#[async_trait]
impl FrameSource for SyntheticSource {
    async fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        self.ticker.tick().await;
        let buf = self.render(self.index);
        self.index += 1;
        Ok(Some(Frame::from_raw(
            self.width,
            self.height,
            PixelLayout::Bgra,
            buf,
        )?))
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}
