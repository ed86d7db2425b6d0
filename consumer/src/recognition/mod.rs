//! Text recognition of detected regions through an external engine.

pub mod tesseract;

use async_trait::async_trait;
use edgewatch_common::config::RecognitionConfig;
use edgewatch_common::frame::Frame;
use futures_util::future::join_all;
use std::time::Duration;
use tracing::{debug, warn};

use crate::region::Component;

pub use tesseract::{check_tesseract_available, TesseractCli};

#[derive(Debug, thiserror::Error)]
pub enum RecognitionError {
    #[error("failed to encode crop: {0}")]
    Encode(String),
    #[error("failed to spawn recognizer: {0}")]
    Spawn(String),
    #[error("failed to write crop to recognizer stdin: {0}")]
    Write(String),
    #[error("failed to wait for recognizer: {0}")]
    Wait(String),
    #[error("recognizer exited with non-zero status: {0}")]
    Failed(String),
}

/// An engine that turns a cropped region into text.
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn recognize(&self, crop: &Frame) -> Result<String, RecognitionError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

#[derive(Debug, Clone)]
pub struct RecognitionSettings {
    /// Budget for a single region; an overrun abandons that region only.
    pub timeout: Duration,
    /// Pixels of context added around each box before cropping.
    pub crop_margin: u32,
}

impl RecognitionSettings {
    pub fn from_config(config: &RecognitionConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            crop_margin: config.crop_margin,
        }
    }
}

/// Attach recognised text to each component of `frame`.
///
/// All regions are recognised concurrently, each under its own timeout, so
/// a stalled engine costs one timeout per call rather than one per region.
/// Failures, timeouts and blank results leave `text` unset. Returns how many
/// components received text.
pub async fn recognize_components(
    frame: &Frame,
    components: &mut [Component],
    recognizer: &dyn Recognizer,
    settings: &RecognitionSettings,
) -> usize {
    let (width, height) = frame.dimensions();
    let crops: Vec<Option<Frame>> = components
        .iter_mut()
        .map(|component| {
            component.text = None;
            frame.crop(&component.bbox.expand(settings.crop_margin, width, height))
        })
        .collect();

    let results = join_all(crops.iter().map(|crop| async move {
        match crop {
            Some(crop) => Some(tokio::time::timeout(settings.timeout, recognizer.recognize(crop)).await),
            None => None,
        }
    }))
    .await;

    let mut labelled = 0;
    for (component, result) in components.iter_mut().zip(results) {
        match result {
            None => {}
            Some(Ok(Ok(text))) => {
                let text = text.trim();
                if !text.is_empty() {
                    debug!(bbox = ?component.bbox, text, "region recognised");
                    component.text = Some(text.to_string());
                    labelled += 1;
                }
            }
            Some(Ok(Err(e))) => {
                warn!(error = %e, recognizer = recognizer.name(), bbox = ?component.bbox, "recognition failed");
            }
            Some(Err(_)) => {
                warn!(
                    timeout_ms = settings.timeout.as_millis() as u64,
                    recognizer = recognizer.name(),
                    bbox = ?component.bbox,
                    "recognition timed out"
                );
            }
        }
    }
    labelled
}
