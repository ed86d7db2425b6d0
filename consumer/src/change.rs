//! Sliding-window change scoring over binary edge maps.

use edgewatch_common::frame::{Frame, TimestampedFrame};
use image::GrayImage;
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ChangeError {
    #[error("edge map is {got:?}, window holds {expected:?}")]
    DimensionMismatch {
        expected: (u32, u32),
        got: (u32, u32),
    },
    #[error("edge map must have one channel, got {0}")]
    NotAnEdgeMap(u8),
}

/// Bounded FIFO of timestamped frames. Pushing into a full window evicts
/// the oldest entry.
#[derive(Debug, Clone)]
pub struct FrameWindow {
    entries: VecDeque<TimestampedFrame>,
    capacity: usize,
}

impl FrameWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `entry`, returning the evicted oldest entry if the window was full.
    pub fn push(&mut self, entry: TimestampedFrame) -> Option<TimestampedFrame> {
        let evicted = if self.entries.len() == self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &TimestampedFrame> {
        self.entries.iter()
    }

    pub fn oldest(&self) -> Option<&TimestampedFrame> {
        self.entries.front()
    }

    pub fn newest(&self) -> Option<&TimestampedFrame> {
        self.entries.back()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Fraction of pixels that are an edge in exactly one of `a` and `b`, over
/// the pixels that are an edge in either. Zero when neither has edges.
pub fn pair_change(a: &GrayImage, b: &GrayImage) -> f64 {
    let mut union = 0u64;
    let mut differing = 0u64;
    for (&pa, &pb) in a.as_raw().iter().zip(b.as_raw()) {
        let (ea, eb) = (pa != 0, pb != 0);
        if ea || eb {
            union += 1;
            if ea != eb {
                differing += 1;
            }
        }
    }
    if union == 0 {
        0.0
    } else {
        differing as f64 / union as f64
    }
}

/// Scores motion as the mean [`pair_change`] over consecutive edge maps in a
/// window of the last N frames.
///
/// Pair values are computed once when a frame enters the window and dropped
/// with the older frame of the pair, so scoring costs nothing per read.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    window: FrameWindow,
    /// `pairs[i]` compares window entries `i` and `i + 1`.
    pairs: VecDeque<f64>,
}

impl ChangeDetector {
    pub fn new(window_size: usize) -> Self {
        let window = FrameWindow::new(window_size);
        Self {
            pairs: VecDeque::with_capacity(window.capacity()),
            window,
        }
    }

    /// Add the edge map of a newly captured frame, stamped with that
    /// frame's capture metadata.
    ///
    /// Rejects color frames and maps whose size differs from the frames
    /// already in the window; the window is left untouched on error.
    pub fn push(&mut self, edges: TimestampedFrame) -> Result<(), ChangeError> {
        let Frame::Gray(ref incoming) = edges.frame else {
            return Err(ChangeError::NotAnEdgeMap(edges.frame.channels()));
        };
        if let Some(newest) = self.window.newest() {
            let expected = newest.frame.dimensions();
            if expected != incoming.dimensions() {
                return Err(ChangeError::DimensionMismatch {
                    expected,
                    got: incoming.dimensions(),
                });
            }
        }

        let change = self.window.newest().and_then(|newest| match &newest.frame {
            Frame::Gray(previous) => Some(pair_change(previous, incoming)),
            Frame::Color(_) => None,
        });

        if self.window.push(edges).is_some() {
            self.pairs.pop_front();
        }
        // With a one-frame window the previous map was just evicted.
        if let (Some(change), true) = (change, self.window.len() > 1) {
            self.pairs.push_back(change);
        }
        Ok(())
    }

    /// Mean change across the window, in `[0, 1]`. Zero with fewer than two frames.
    pub fn score(&self) -> f64 {
        if self.pairs.is_empty() {
            return 0.0;
        }
        let mean = self.pairs.iter().sum::<f64>() / self.pairs.len() as f64;
        mean.clamp(0.0, 1.0)
    }

    /// Time between the oldest and newest frame in the window.
    pub fn span(&self) -> Duration {
        match (self.window.oldest(), self.window.newest()) {
            (Some(oldest), Some(newest)) => newest.captured_at.saturating_duration_since(oldest.captured_at),
            _ => Duration::ZERO,
        }
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn clear(&mut self) {
        self.window.clear();
        self.pairs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb, RgbImage};
    use std::time::Instant;

    fn halves(left: bool) -> Frame {
        Frame::gray(GrayImage::from_fn(8, 4, |x, _| {
            Luma([if (x < 4) == left { 255 } else { 0 }])
        }))
    }

    fn blank() -> Frame {
        Frame::gray(GrayImage::new(8, 4))
    }

    fn stamped(frame: Frame, captured_at: Instant) -> TimestampedFrame {
        TimestampedFrame::at(frame, captured_at, 0)
    }

    #[test]
    fn window_evicts_oldest_first() {
        let mut window = FrameWindow::new(3);
        let start = Instant::now();
        for seq in 0..3 {
            assert!(window.push(TimestampedFrame::at(blank(), start, seq)).is_none());
        }
        let evicted = window.push(TimestampedFrame::at(blank(), start, 3)).unwrap();
        assert_eq!(evicted.seq, 0);
        assert_eq!(window.len(), 3);
        let seqs: Vec<u64> = window.iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn zero_capacity_window_holds_one() {
        let mut window = FrameWindow::new(0);
        window.push(TimestampedFrame::new(blank(), 0));
        window.push(TimestampedFrame::new(blank(), 1));
        assert_eq!(window.capacity(), 1);
        assert_eq!(window.newest().map(|f| f.seq), Some(1));
    }

    #[test]
    fn fewer_than_two_frames_score_zero() {
        let mut detector = ChangeDetector::new(5);
        assert_eq!(detector.score(), 0.0);
        detector.push(stamped(halves(true), Instant::now())).unwrap();
        assert_eq!(detector.score(), 0.0);
    }

    #[test]
    fn identical_maps_score_zero() {
        let mut detector = ChangeDetector::new(5);
        let now = Instant::now();
        for _ in 0..4 {
            detector.push(stamped(halves(true), now)).unwrap();
        }
        assert_eq!(detector.score(), 0.0);
    }

    #[test]
    fn complementary_maps_score_one() {
        let mut detector = ChangeDetector::new(5);
        let now = Instant::now();
        detector.push(stamped(halves(true), now)).unwrap();
        detector.push(stamped(halves(false), now)).unwrap();
        assert_eq!(detector.score(), 1.0);
    }

    #[test]
    fn edgeless_pair_scores_zero() {
        assert_eq!(pair_change(&GrayImage::new(4, 4), &GrayImage::new(4, 4)), 0.0);
    }

    #[test]
    fn score_is_mean_over_pairs() {
        let mut detector = ChangeDetector::new(5);
        let now = Instant::now();
        detector.push(stamped(halves(true), now)).unwrap();
        detector.push(stamped(halves(false), now)).unwrap();
        detector.push(stamped(halves(false), now)).unwrap();
        assert!((detector.score() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn evicted_pairs_stop_counting() {
        let mut detector = ChangeDetector::new(2);
        let now = Instant::now();
        detector.push(stamped(halves(true), now)).unwrap();
        detector.push(stamped(halves(false), now)).unwrap();
        assert_eq!(detector.score(), 1.0);
        detector.push(stamped(halves(false), now)).unwrap();
        assert_eq!(detector.len(), 2);
        assert_eq!(detector.score(), 0.0);
    }

    #[test]
    fn single_frame_window_never_scores() {
        let mut detector = ChangeDetector::new(1);
        let now = Instant::now();
        detector.push(stamped(halves(true), now)).unwrap();
        detector.push(stamped(halves(false), now)).unwrap();
        assert_eq!(detector.score(), 0.0);
    }

    #[test]
    fn dimension_mismatch_leaves_window_untouched() {
        let mut detector = ChangeDetector::new(3);
        detector.push(stamped(blank(), Instant::now())).unwrap();
        let err = detector
            .push(stamped(Frame::gray(GrayImage::new(5, 5)), Instant::now()))
            .unwrap_err();
        assert!(matches!(
            err,
            ChangeError::DimensionMismatch {
                expected: (8, 4),
                got: (5, 5)
            }
        ));
        assert_eq!(detector.len(), 1);
    }

    #[test]
    fn color_frames_are_rejected() {
        let mut detector = ChangeDetector::new(3);
        let err = detector
            .push(stamped(
                Frame::color(RgbImage::from_pixel(2, 2, Rgb([1, 2, 3]))),
                Instant::now(),
            ))
            .unwrap_err();
        assert!(matches!(err, ChangeError::NotAnEdgeMap(3)));
        assert!(detector.is_empty());
    }

    #[test]
    fn span_covers_oldest_to_newest() {
        let mut detector = ChangeDetector::new(3);
        let start = Instant::now();
        for ms in [0u64, 40, 80, 120] {
            detector.push(stamped(blank(), start + Duration::from_millis(ms))).unwrap();
        }
        assert_eq!(detector.span(), Duration::from_millis(80));
        detector.clear();
        assert_eq!(detector.span(), Duration::ZERO);
        assert_eq!(detector.score(), 0.0);
    }

    #[test]
    fn capture_metadata_is_kept() {
        let mut detector = ChangeDetector::new(3);
        let captured = TimestampedFrame::at(Frame::color(RgbImage::new(8, 4)), Instant::now(), 41);
        detector.push(captured.with_frame(blank())).unwrap();

        let newest = detector.window.newest().unwrap();
        assert_eq!(newest.seq, 41);
        assert_eq!(newest.captured_at, captured.captured_at);
        assert_eq!(newest.captured_at_ms, captured.captured_at_ms);
    }
}
