//! The per-tick analysis loop: take the freshest frame, extract edges, score
//! change, and periodically extract regions.

pub mod history;

use edgewatch_common::channel::{Closure, FrameChannel};
use edgewatch_common::config::Config;
use edgewatch_common::frame::{Frame, TimestampedFrame};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::change::{ChangeDetector, ChangeError};
use crate::edge::EdgeExtractor;
use crate::recognition::{recognize_components, RecognitionSettings, Recognizer};
use crate::region::{Component, RegionExtractor};

pub use history::{RateMeter, ScoreHistory};

/// Ticks averaged for the reported analysis rate.
const RATE_SAMPLES: usize = 30;

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("inconsistent frame: {0}")]
    Dimension(#[from] ChangeError),
    #[error("capture source lost: {0}")]
    Capture(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopState {
    /// Waiting for the first frame.
    Idle,
    Running,
    /// Stop requested; no further frames are taken.
    Draining,
    Stopped,
}

/// Everything a consumer needs about one analysed frame.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub seq: u64,
    pub captured_at_ms: i64,
    pub state: LoopState,
    pub score: f64,
    pub window_len: usize,
    pub window_span: Duration,
    /// Most recent region extraction, possibly from an earlier frame.
    pub components: Arc<Vec<Component>>,
    /// Whether `components` were extracted from this frame.
    pub regions_fresh: bool,
    pub dropped_frames: u64,
    /// Measured analysis throughput, frames per second.
    pub analysis_fps: f64,
    pub frame: Arc<Frame>,
    /// `(seconds, score)` samples for graphing.
    pub history: Arc<Vec<(f64, f64)>>,
}

#[derive(Debug)]
pub enum TickOutcome {
    /// Nothing to analyse this tick.
    Empty,
    Analyzed(Arc<TickReport>),
    Stopped,
}

pub struct AnalysisLoop {
    state: LoopState,
    channel: Arc<FrameChannel<TimestampedFrame>>,
    edges: EdgeExtractor,
    detector: ChangeDetector,
    regions: RegionExtractor,
    recognizer: Option<Arc<dyn Recognizer>>,
    recognition: RecognitionSettings,
    region_every: u64,
    tick_interval: Duration,
    history: ScoreHistory,
    rate: RateMeter,
    components: Arc<Vec<Component>>,
    analysed: u64,
    dropped_seen: u64,
}

impl AnalysisLoop {
    pub fn new(config: &Config, channel: Arc<FrameChannel<TimestampedFrame>>) -> Self {
        Self {
            state: LoopState::Idle,
            channel,
            edges: EdgeExtractor::new(&config.edge),
            detector: ChangeDetector::new(config.analysis.window_size),
            regions: RegionExtractor::new(&config.region, &config.edge),
            recognizer: None,
            recognition: RecognitionSettings::from_config(&config.recognition),
            region_every: config.analysis.region_every_n_frames,
            tick_interval: Duration::from_millis(config.analysis.tick_interval_ms.max(1)),
            history: ScoreHistory::new(
                Duration::try_from_secs_f64(config.analysis.history_seconds).unwrap_or(Duration::ZERO),
            ),
            rate: RateMeter::new(RATE_SAMPLES),
            components: Arc::new(Vec::new()),
            analysed: 0,
            dropped_seen: 0,
        }
    }

    /// Attach text to extracted regions with `recognizer`.
    pub fn with_recognizer(mut self, recognizer: Arc<dyn Recognizer>) -> Self {
        self.recognizer = Some(recognizer);
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn analysed(&self) -> u64 {
        self.analysed
    }

    /// Run one iteration.
    ///
    /// An empty channel is not an error. A channel closed by a failed
    /// capture, or a frame whose size differs from the window's, stops the
    /// loop and is returned.
    pub async fn tick(&mut self) -> Result<TickOutcome, AnalysisError> {
        match self.state {
            LoopState::Stopped => return Ok(TickOutcome::Stopped),
            LoopState::Draining => {
                self.finish();
                return Ok(TickOutcome::Stopped);
            }
            LoopState::Idle | LoopState::Running => {}
        }

        let Some(captured) = self.channel.take_nonblocking() else {
            return match self.channel.closure() {
                None => Ok(TickOutcome::Empty),
                Some(Closure::Finished) => {
                    info!("capture finished, draining");
                    self.begin_drain();
                    self.finish();
                    Ok(TickOutcome::Stopped)
                }
                Some(Closure::Failed(reason)) => {
                    self.finish();
                    Err(AnalysisError::Capture(reason))
                }
            };
        };

        if self.state == LoopState::Idle {
            info!(seq = captured.seq, "first frame received, IDLE→RUNNING");
            self.state = LoopState::Running;
        }

        match self.analyse(captured).await {
            Ok(report) => Ok(TickOutcome::Analyzed(report)),
            Err(e) => {
                self.finish();
                Err(e)
            }
        }
    }

    async fn analyse(&mut self, captured: TimestampedFrame) -> Result<Arc<TickReport>, AnalysisError> {
        let edge_map = self.edges.extract(&captured.frame);
        self.detector.push(captured.with_frame(edge_map))?;
        let score = self.detector.score();
        self.history.push(captured.captured_at, score);

        let regions_fresh = self.region_every > 0 && self.analysed % self.region_every == 0;
        self.analysed += 1;
        if regions_fresh {
            let mut components = self.regions.extract(&captured.frame);
            if let Some(recognizer) = &self.recognizer {
                recognize_components(&captured.frame, &mut components, recognizer.as_ref(), &self.recognition)
                    .await;
            }
            debug!(seq = captured.seq, regions = components.len(), "regions extracted");
            self.components = Arc::new(components);
        }

        let dropped = self.channel.dropped();
        if dropped > self.dropped_seen {
            debug!(
                dropped = dropped - self.dropped_seen,
                total = dropped,
                "frames replaced before analysis"
            );
            self.dropped_seen = dropped;
        }

        let analysis_fps = self.rate.record(Instant::now());
        debug!(seq = captured.seq, score, analysis_fps, window = self.detector.len(), "frame analysed");

        Ok(Arc::new(TickReport {
            seq: captured.seq,
            captured_at_ms: captured.captured_at_ms,
            state: self.state,
            score,
            window_len: self.detector.len(),
            window_span: self.detector.span(),
            components: Arc::clone(&self.components),
            regions_fresh,
            dropped_frames: dropped,
            analysis_fps,
            frame: Arc::new(captured.frame),
            history: Arc::new(self.history.points()),
        }))
    }

    /// Stop taking new frames. The next tick releases resources.
    pub fn begin_drain(&mut self) {
        if matches!(self.state, LoopState::Idle | LoopState::Running) {
            info!(analysed = self.analysed, "stop requested, RUNNING→DRAINING");
            self.state = LoopState::Draining;
        }
    }

    /// Release held frames and clear the window.
    pub fn finish(&mut self) {
        if self.state == LoopState::Stopped {
            return;
        }
        let released = self.channel.clear();
        self.detector.clear();
        self.history.clear();
        self.rate.clear();
        self.components = Arc::new(Vec::new());
        self.state = LoopState::Stopped;
        info!(released, analysed = self.analysed, "analysis stopped");
    }

    /// Tick at the configured interval until stopped, publishing each
    /// report to `reports`. Returns the number of frames analysed.
    pub async fn run(
        mut self,
        stop: watch::Receiver<bool>,
        reports: watch::Sender<Option<Arc<TickReport>>>,
    ) -> Result<u64, AnalysisError> {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if *stop.borrow() {
                self.begin_drain();
            }
            match self.tick().await {
                Ok(TickOutcome::Empty) => {}
                Ok(TickOutcome::Analyzed(report)) => {
                    reports.send_replace(Some(report));
                }
                Ok(TickOutcome::Stopped) => break,
                Err(e) => {
                    error!(error = %e, "analysis loop failed");
                    return Err(e);
                }
            }
        }
        Ok(self.analysed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognition::RecognitionError;
    use async_trait::async_trait;
    use edgewatch_common::config::DetectionMode;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    fn config() -> Config {
        let mut config = Config::default();
        config.analysis.window_size = 4;
        config.analysis.region_every_n_frames = 2;
        config.analysis.tick_interval_ms = 1;
        config.region.mode = DetectionMode::Edge;
        config
    }

    fn black(w: u32, h: u32) -> Frame {
        Frame::color(RgbImage::from_pixel(w, h, Rgb([0, 0, 0])))
    }

    fn square() -> Frame {
        Frame::color(RgbImage::from_fn(100, 100, |x, y| {
            let inside = (40..60).contains(&x) && (40..60).contains(&y);
            Rgb(if inside { [255, 255, 255] } else { [0, 0, 0] })
        }))
    }

    fn setup(config: &Config) -> (Arc<FrameChannel<TimestampedFrame>>, AnalysisLoop) {
        let channel = Arc::new(FrameChannel::new(1));
        let analysis = AnalysisLoop::new(config, Arc::clone(&channel));
        (channel, analysis)
    }

    fn analysed(outcome: TickOutcome) -> Arc<TickReport> {
        match outcome {
            TickOutcome::Analyzed(report) => report,
            other => panic!("expected a report, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn black_then_square_scores_change_and_finds_one_region() {
        let config = config();
        let (channel, mut analysis) = setup(&config);

        channel.put(TimestampedFrame::new(black(100, 100), 0));
        let first = analysed(analysis.tick().await.unwrap());
        assert_eq!(first.score, 0.0);
        assert_eq!(analysis.state(), LoopState::Running);
        assert!(first.regions_fresh);
        assert!(first.components.is_empty());

        channel.put(TimestampedFrame::new(square(), 1));
        let second = analysed(analysis.tick().await.unwrap());
        assert!(second.score > 0.0 && second.score <= 1.0);
        assert_eq!(second.window_len, 2);
        assert_eq!(first.analysis_fps, 0.0);
        assert!(second.analysis_fps.is_finite() && second.analysis_fps > 0.0);
        assert!(!second.regions_fresh);

        channel.put(TimestampedFrame::new(square(), 2));
        let third = analysed(analysis.tick().await.unwrap());
        assert!(third.regions_fresh);
        assert_eq!(third.components.len(), 1);
        let b = third.components[0].bbox;
        assert!((38..=41).contains(&b.x) && (38..=41).contains(&b.y), "{b:?}");
        assert!((19..=23).contains(&b.width) && (19..=23).contains(&b.height), "{b:?}");
    }

    #[tokio::test]
    async fn empty_channel_is_not_an_error() {
        let (_channel, mut analysis) = setup(&config());
        assert!(matches!(analysis.tick().await, Ok(TickOutcome::Empty)));
        assert_eq!(analysis.state(), LoopState::Idle);
    }

    #[tokio::test]
    async fn overwritten_frames_are_counted_and_skipped() {
        let (channel, mut analysis) = setup(&config());
        channel.put(TimestampedFrame::new(black(10, 10), 0));
        channel.put(TimestampedFrame::new(black(10, 10), 1));
        let report = analysed(analysis.tick().await.unwrap());
        assert_eq!(report.seq, 1);
        assert_eq!(report.dropped_frames, 1);
        assert!(matches!(analysis.tick().await, Ok(TickOutcome::Empty)));
    }

    #[tokio::test]
    async fn dimension_change_is_fatal() {
        let (channel, mut analysis) = setup(&config());
        channel.put(TimestampedFrame::new(black(10, 10), 0));
        analysis.tick().await.unwrap();
        channel.put(TimestampedFrame::new(black(12, 10), 1));
        let err = analysis.tick().await.unwrap_err();
        assert!(matches!(err, AnalysisError::Dimension(ChangeError::DimensionMismatch { .. })));
        assert_eq!(analysis.state(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn capture_failure_propagates() {
        let (channel, mut analysis) = setup(&config());
        channel.close(Closure::Failed("permission revoked".into()));
        let err = analysis.tick().await.unwrap_err();
        assert!(matches!(err, AnalysisError::Capture(reason) if reason == "permission revoked"));
        assert_eq!(analysis.state(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn drain_skips_pending_frames_and_clears_window() {
        let (channel, mut analysis) = setup(&config());
        channel.put(TimestampedFrame::new(black(10, 10), 0));
        analysis.tick().await.unwrap();

        channel.put(TimestampedFrame::new(black(10, 10), 1));
        analysis.begin_drain();
        assert_eq!(analysis.state(), LoopState::Draining);
        assert!(matches!(analysis.tick().await, Ok(TickOutcome::Stopped)));
        assert_eq!(analysis.state(), LoopState::Stopped);
        assert!(channel.is_empty());
        assert_eq!(analysis.analysed(), 1);
        assert!(matches!(analysis.tick().await, Ok(TickOutcome::Stopped)));
    }

    #[tokio::test]
    async fn zero_cadence_never_extracts_regions() {
        let mut config = config();
        config.analysis.region_every_n_frames = 0;
        let (channel, mut analysis) = setup(&config);
        channel.put(TimestampedFrame::new(square(), 0));
        let report = analysed(analysis.tick().await.unwrap());
        assert!(!report.regions_fresh);
        assert!(report.components.is_empty());
    }

    struct Fixed(&'static str);

    #[async_trait]
    impl Recognizer for Fixed {
        async fn recognize(&self, _crop: &Frame) -> Result<String, RecognitionError> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn recognizer_labels_extracted_regions() {
        let (channel, analysis) = setup(&config());
        let mut analysis = analysis.with_recognizer(Arc::new(Fixed("SQUARE")));
        channel.put(TimestampedFrame::new(square(), 0));
        let report = analysed(analysis.tick().await.unwrap());
        assert_eq!(report.components.len(), 1);
        assert_eq!(report.components[0].text.as_deref(), Some("SQUARE"));
    }

    #[tokio::test]
    async fn run_publishes_reports_until_stopped() {
        let (channel, analysis) = setup(&config());
        let (stop_tx, stop_rx) = watch::channel(false);
        let (report_tx, mut report_rx) = watch::channel(None);

        let handle = tokio::spawn(analysis.run(stop_rx, report_tx));

        channel.put(TimestampedFrame::new(Frame::gray(GrayImage::from_pixel(8, 8, Luma([3]))), 7));
        report_rx.changed().await.unwrap();
        assert_eq!(report_rx.borrow().as_ref().map(|r| r.seq), Some(7));

        stop_tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn run_ends_cleanly_when_capture_finishes() {
        let (channel, analysis) = setup(&config());
        let (_stop_tx, stop_rx) = watch::channel(false);
        let (report_tx, _report_rx) = watch::channel(None);
        channel.close(Closure::Finished);
        assert_eq!(analysis.run(stop_rx, report_tx).await.unwrap(), 0);
    }
}
