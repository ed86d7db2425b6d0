//! Capture side of the pipeline: frame sources and the pump that feeds
//! them into the shared [`FrameChannel`].

pub mod mjpeg;
pub mod synthetic;

use async_trait::async_trait;
use edgewatch_common::channel::{Closure, FrameChannel};
use edgewatch_common::config::{CaptureConfig, CaptureMode};
use edgewatch_common::frame::{Frame, FrameError, TimestampedFrame};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub use mjpeg::{MjpegSource, PollingSource};
pub use synthetic::SyntheticSource;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("stream ended")]
    StreamEnded,
    #[error("failed to decode frame: {0}")]
    Decode(String),
    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),
    #[error("capture source unavailable: {0}")]
    Unavailable(String),
}

impl CaptureError {
    /// Errors that retrying cannot fix, such as a revoked permission.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CaptureError::Unavailable(_) | CaptureError::HttpStatus(401 | 403)
        )
    }
}

/// A pull source of frames.
///
/// `Ok(None)` means "nothing yet"; the caller polls again shortly.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError>;

    /// Drop any open connection so the next call starts fresh.
    async fn reset(&mut self) {}

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

/// Reconnect behaviour of [`run_capture`].
#[derive(Debug, Clone)]
pub struct CapturePolicy {
    /// Consecutive failures after which the source is declared lost.
    pub max_consecutive_failures: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Pause after a source reports "nothing yet".
    pub idle_poll: Duration,
}

impl CapturePolicy {
    pub fn from_config(config: &CaptureConfig) -> Self {
        Self {
            max_consecutive_failures: config.max_consecutive_failures.max(1),
            ..Self::default()
        }
    }
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
            idle_poll: Duration::from_millis(5),
        }
    }
}

/// Build the source selected by `[capture] mode`.
pub fn source_from_config(config: &CaptureConfig) -> Result<Box<dyn FrameSource>, CaptureError> {
    let interval = config.frame_interval();
    Ok(match config.mode {
        CaptureMode::Synthetic => Box::new(SyntheticSource::new(
            config.width,
            config.height,
            interval,
        )?),
        CaptureMode::Mjpeg => Box::new(MjpegSource::new(&config.url, config.max_part_bytes)?),
        CaptureMode::Polling => Box::new(PollingSource::new(&config.url, interval)?),
    })
}

/// Pull frames from `source` into `channel` until `stop` flips to `true`.
///
/// Transient failures reconnect with exponential backoff. A fatal error, or
/// too many consecutive failures, closes the channel with the failure so the
/// analysis side can stop, and is returned to the caller. Returns the number
/// of frames delivered on a clean stop.
pub async fn run_capture(
    mut source: Box<dyn FrameSource>,
    channel: Arc<FrameChannel<TimestampedFrame>>,
    mut stop: watch::Receiver<bool>,
    policy: CapturePolicy,
) -> Result<u64, CaptureError> {
    let mut seq: u64 = 0;
    let mut failures: u32 = 0;
    let mut backoff = policy.initial_backoff;

    info!(source = source.name(), "capture started");

    loop {
        if *stop.borrow() {
            break;
        }

        let next = tokio::select! {
            biased;
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            next = source.next_frame() => next,
        };

        match next {
            Ok(Some(frame)) => {
                failures = 0;
                backoff = policy.initial_backoff;
                if channel.put(TimestampedFrame::new(frame, seq)) {
                    debug!(seq, "analysis behind, oldest frame dropped");
                }
                seq += 1;
            }
            Ok(None) => {
                if sleep_or_stop(policy.idle_poll, &mut stop).await {
                    break;
                }
            }
            Err(e) if e.is_fatal() => {
                error!(error = %e, source = source.name(), "capture source lost");
                channel.close(Closure::Failed(e.to_string()));
                return Err(e);
            }
            Err(e) => {
                failures += 1;
                if failures >= policy.max_consecutive_failures {
                    error!(
                        error = %e,
                        failures,
                        source = source.name(),
                        "capture failed repeatedly, giving up"
                    );
                    channel.close(Closure::Failed(e.to_string()));
                    return Err(e);
                }
                warn!(
                    error = %e,
                    failures,
                    source = source.name(),
                    "capture error, reconnecting in {:?}",
                    backoff
                );
                source.reset().await;
                if sleep_or_stop(backoff, &mut stop).await {
                    break;
                }
                backoff = (backoff * 2).min(policy.max_backoff);
            }
        }
    }

    info!(frames = seq, source = source.name(), "capture stopped");
    channel.close(Closure::Finished);
    Ok(seq)
}

/// Sleep for `duration`; returns `true` if a stop was requested meanwhile.
async fn sleep_or_stop(duration: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => *stop.borrow(),
        changed = stop.changed() => changed.is_err() || *stop.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;
    use std::collections::VecDeque;

    struct Scripted {
        steps: VecDeque<Result<Option<Frame>, CaptureError>>,
    }

    #[async_trait]
    impl FrameSource for Scripted {
        async fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            match self.steps.pop_front() {
                Some(step) => step,
                None => std::future::pending().await,
            }
        }
    }

    fn frame() -> Frame {
        Frame::gray(GrayImage::new(4, 4))
    }

    fn fast_policy(max_failures: u32) -> CapturePolicy {
        CapturePolicy {
            max_consecutive_failures: max_failures,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            idle_poll: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn extreme_fps_builds_a_ticking_source() {
        let config = edgewatch_common::config::Config::parse("[capture]\nfps = 1e12\n").unwrap();
        let mut source = source_from_config(&config.capture).unwrap();
        let frame = source.next_frame().await.unwrap().unwrap();
        assert_eq!(frame.dimensions(), (config.capture.width, config.capture.height));

        let polling = CaptureConfig {
            mode: CaptureMode::Polling,
            fps: 1e12,
            ..CaptureConfig::default()
        };
        assert!(source_from_config(&polling).is_ok());
    }

    #[tokio::test]
    async fn repeated_failures_close_channel_with_reason() {
        let source = Scripted {
            steps: VecDeque::from([
                Ok(Some(frame())),
                Err(CaptureError::StreamEnded),
                Err(CaptureError::StreamEnded),
            ]),
        };
        let channel = Arc::new(FrameChannel::new(1));
        let (_stop_tx, stop_rx) = watch::channel(false);

        let result = run_capture(Box::new(source), Arc::clone(&channel), stop_rx, fast_policy(2)).await;

        assert!(matches!(result, Err(CaptureError::StreamEnded)));
        assert_eq!(channel.take_nonblocking().map(|f| f.seq), Some(0));
        assert_eq!(
            channel.closure(),
            Some(Closure::Failed("stream ended".into()))
        );
    }

    #[tokio::test]
    async fn fatal_error_stops_without_retry() {
        let source = Scripted {
            steps: VecDeque::from([Err(CaptureError::Unavailable("permission revoked".into()))]),
        };
        let channel = Arc::new(FrameChannel::new(1));
        let (_stop_tx, stop_rx) = watch::channel(false);

        let result = run_capture(Box::new(source), Arc::clone(&channel), stop_rx, fast_policy(10)).await;

        assert!(matches!(result, Err(CaptureError::Unavailable(_))));
        assert!(matches!(channel.closure(), Some(Closure::Failed(_))));
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let source = Scripted {
            steps: VecDeque::from([
                Err(CaptureError::StreamEnded),
                Ok(Some(frame())),
                Err(CaptureError::StreamEnded),
                Ok(Some(frame())),
                Ok(None),
                Err(CaptureError::StreamEnded),
                Err(CaptureError::StreamEnded),
            ]),
        };
        let channel = Arc::new(FrameChannel::new(4));
        let (_stop_tx, stop_rx) = watch::channel(false);

        let result = run_capture(Box::new(source), Arc::clone(&channel), stop_rx, fast_policy(2)).await;

        assert!(result.is_err());
        assert_eq!(channel.len(), 2);
    }

    #[tokio::test]
    async fn stop_signal_closes_channel_cleanly() {
        let source = Scripted {
            steps: VecDeque::from([Ok(Some(frame())), Ok(Some(frame()))]),
        };
        let channel = Arc::new(FrameChannel::new(1));
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = tokio::spawn(run_capture(
            Box::new(source),
            Arc::clone(&channel),
            stop_rx,
            fast_policy(3),
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop_tx.send(true).unwrap();

        let delivered = handle.await.unwrap().unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(channel.dropped(), 1);
        assert_eq!(channel.closure(), Some(Closure::Finished));
    }
}
