use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Shortest frame period a source will tick at, whatever `fps` says.
pub const MIN_FRAME_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub edge: EdgeConfig,
    #[serde(default)]
    pub region: RegionConfig,
    #[serde(default)]
    pub recognition: RecognitionConfig,
    #[serde(default)]
    pub view: ViewConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Generated test pattern, no camera required.
    Synthetic,
    /// HTTP multipart MJPEG stream.
    Mjpeg,
    /// One JPEG per HTTP request at `fps`.
    Polling,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_capture_mode")]
    pub mode: CaptureMode,
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_fps")]
    pub fps: f64,
    #[serde(default = "default_synthetic_width")]
    pub width: u32,
    #[serde(default = "default_synthetic_height")]
    pub height: u32,
    /// Consecutive capture failures tolerated before the source is declared lost.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Largest multipart part buffered before the parser gives up on it.
    #[serde(default = "default_max_part_bytes")]
    pub max_part_bytes: usize,
}

impl CaptureConfig {
    /// Period between frames implied by `fps`, never below [`MIN_FRAME_INTERVAL`].
    pub fn frame_interval(&self) -> Duration {
        Duration::try_from_secs_f64(1.0 / self.fps)
            .unwrap_or(MIN_FRAME_INTERVAL)
            .max(MIN_FRAME_INTERVAL)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_channel_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Run region extraction on every Nth analysed frame. 0 disables it.
    #[serde(default = "default_region_every_n_frames")]
    pub region_every_n_frames: u64,
    /// How far back the in-memory score history reaches.
    #[serde(default = "default_history_seconds")]
    pub history_seconds: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EdgeConfig {
    #[serde(default = "default_blur_kernel")]
    pub blur_kernel: u32,
    #[serde(default = "default_low_threshold")]
    pub low_threshold: f32,
    #[serde(default = "default_high_threshold")]
    pub high_threshold: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    /// Adaptive threshold followed by rectangular dilation.
    Threshold,
    /// Edge map contours, no morphology.
    Edge,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegionConfig {
    #[serde(default = "default_detection_mode")]
    pub mode: DetectionMode,
    #[serde(default = "default_adaptive_block_size")]
    pub adaptive_block_size: u32,
    #[serde(default = "default_adaptive_c")]
    pub adaptive_c: i32,
    #[serde(default = "default_dilate_width")]
    pub dilate_width: u32,
    #[serde(default = "default_dilate_height")]
    pub dilate_height: u32,
    #[serde(default = "default_min_side")]
    pub min_width: u32,
    #[serde(default = "default_min_side")]
    pub min_height: u32,
    #[serde(default = "default_aspect_min")]
    pub aspect_min: f64,
    #[serde(default = "default_aspect_max")]
    pub aspect_max: f64,
    /// Also run detection on the tonal inverse of the frame.
    #[serde(default)]
    pub invert_pass: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecognitionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_recognition_command")]
    pub command: String,
    #[serde(default = "default_recognition_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_page_seg_mode")]
    pub page_seg_mode: u32,
    /// Characters the recognizer may emit. Empty means unrestricted.
    #[serde(default)]
    pub whitelist: String,
    #[serde(default = "default_crop_margin")]
    pub crop_margin: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ViewConfig {
    #[serde(default = "default_view_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_graph_width")]
    pub graph_width: u32,
    #[serde(default = "default_graph_height")]
    pub graph_height: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            mode: default_capture_mode(),
            url: default_url(),
            fps: default_fps(),
            width: default_synthetic_width(),
            height: default_synthetic_height(),
            max_consecutive_failures: default_max_consecutive_failures(),
            max_part_bytes: default_max_part_bytes(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: default_channel_capacity(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            window_size: default_window_size(),
            region_every_n_frames: default_region_every_n_frames(),
            history_seconds: default_history_seconds(),
        }
    }
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            blur_kernel: default_blur_kernel(),
            low_threshold: default_low_threshold(),
            high_threshold: default_high_threshold(),
        }
    }
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            mode: default_detection_mode(),
            adaptive_block_size: default_adaptive_block_size(),
            adaptive_c: default_adaptive_c(),
            dilate_width: default_dilate_width(),
            dilate_height: default_dilate_height(),
            min_width: default_min_side(),
            min_height: default_min_side(),
            aspect_min: default_aspect_min(),
            aspect_max: default_aspect_max(),
            invert_pass: false,
        }
    }
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: default_recognition_command(),
            timeout_ms: default_recognition_timeout_ms(),
            page_seg_mode: default_page_seg_mode(),
            whitelist: String::new(),
            crop_margin: default_crop_margin(),
        }
    }
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            enabled: default_view_enabled(),
            bind: default_bind(),
            graph_width: default_graph_width(),
            graph_height: default_graph_height(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    /// Parse and validate a TOML document.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the pipeline structurally unsound.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel.capacity == 0 {
            return Err(invalid("channel.capacity must be at least 1"));
        }
        if self.analysis.window_size == 0 {
            return Err(invalid("analysis.window_size must be at least 1"));
        }
        if self.analysis.tick_interval_ms == 0 {
            return Err(invalid("analysis.tick_interval_ms must be positive"));
        }
        if !(self.capture.fps.is_finite() && self.capture.fps > 0.0) {
            return Err(invalid("capture.fps must be a positive finite number"));
        }
        if self.capture.max_part_bytes == 0 {
            return Err(invalid("capture.max_part_bytes must be positive"));
        }
        if self.edge.blur_kernel == 0 || self.edge.blur_kernel % 2 == 0 {
            return Err(invalid("edge.blur_kernel must be odd"));
        }
        if self.edge.low_threshold < 0.0 || self.edge.low_threshold > self.edge.high_threshold {
            return Err(invalid(
                "edge thresholds must satisfy 0 <= low_threshold <= high_threshold",
            ));
        }
        let block = self.region.adaptive_block_size;
        if block < 3 || block % 2 == 0 {
            return Err(invalid("region.adaptive_block_size must be odd and >= 3"));
        }
        if self.region.dilate_width == 0 || self.region.dilate_height == 0 {
            return Err(invalid("region dilation kernel must be at least 1x1"));
        }
        if !(self.region.aspect_min > 0.0 && self.region.aspect_min <= self.region.aspect_max) {
            return Err(invalid(
                "region aspect band must satisfy 0 < aspect_min <= aspect_max",
            ));
        }
        if self.recognition.enabled && self.recognition.timeout_ms == 0 {
            return Err(invalid("recognition.timeout_ms must be positive"));
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> ConfigError {
    ConfigError::Invalid(reason.to_string())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_capture_mode() -> CaptureMode {
    CaptureMode::Synthetic
}
fn default_url() -> String {
    "http://127.0.0.1:8000/stream".into()
}
fn default_fps() -> f64 {
    10.0
}
fn default_synthetic_width() -> u32 {
    320
}
fn default_synthetic_height() -> u32 {
    240
}
fn default_max_consecutive_failures() -> u32 {
    5
}
fn default_max_part_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_channel_capacity() -> usize {
    1
}
fn default_tick_interval_ms() -> u64 {
    33
}
fn default_window_size() -> usize {
    10
}
fn default_region_every_n_frames() -> u64 {
    10
}
fn default_history_seconds() -> f64 {
    30.0
}
fn default_blur_kernel() -> u32 {
    5
}
fn default_low_threshold() -> f32 {
    50.0
}
fn default_high_threshold() -> f32 {
    150.0
}
fn default_detection_mode() -> DetectionMode {
    DetectionMode::Threshold
}
fn default_adaptive_block_size() -> u32 {
    21
}
fn default_adaptive_c() -> i32 {
    4
}
fn default_dilate_width() -> u32 {
    15
}
fn default_dilate_height() -> u32 {
    3
}
fn default_min_side() -> u32 {
    10
}
fn default_aspect_min() -> f64 {
    0.1
}
fn default_aspect_max() -> f64 {
    10.0
}
fn default_recognition_command() -> String {
    "tesseract".into()
}
fn default_recognition_timeout_ms() -> u64 {
    2000
}
fn default_page_seg_mode() -> u32 {
    7
}
fn default_crop_margin() -> u32 {
    2
}
fn default_view_enabled() -> bool {
    true
}
fn default_bind() -> String {
    "127.0.0.1:8080".into()
}
fn default_graph_width() -> u32 {
    400
}
fn default_graph_height() -> u32 {
    150
}
fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.capture.mode, CaptureMode::Synthetic);
        assert_eq!(config.channel.capacity, 1);
        assert_eq!(config.analysis.window_size, 10);
        assert_eq!(config.region.mode, DetectionMode::Threshold);
        assert_eq!(config.region.adaptive_block_size, 21);
        assert_eq!((config.region.dilate_width, config.region.dilate_height), (15, 3));
        assert!(!config.recognition.enabled);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn sections_override_defaults() {
        let config = Config::parse(
            r#"
            [region]
            mode = "edge"
            aspect_min = 0.5
            invert_pass = true

            [analysis]
            window_size = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.region.mode, DetectionMode::Edge);
        assert_eq!(config.region.aspect_min, 0.5);
        assert_eq!(config.region.aspect_max, 10.0);
        assert!(config.region.invert_pass);
        assert_eq!(config.analysis.window_size, 4);
        assert_eq!(config.analysis.region_every_n_frames, 10);
    }

    #[test]
    fn rejects_even_block_size() {
        let err = Config::parse("[region]\nadaptive_block_size = 20\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let err = Config::parse("[edge]\nlow_threshold = 200.0\nhigh_threshold = 100.0\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_zero_window() {
        let err = Config::parse("[analysis]\nwindow_size = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_non_finite_fps() {
        for fps in ["nan", "inf", "-inf", "0.0", "-5.0"] {
            let err = Config::parse(&format!("[capture]\nfps = {fps}\n")).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "fps = {fps}");
        }
    }

    #[test]
    fn huge_fps_is_clamped_to_minimum_interval() {
        let config = Config::parse("[capture]\nfps = 1e12\n").unwrap();
        assert_eq!(config.capture.frame_interval(), MIN_FRAME_INTERVAL);
        let config = Config::parse("[capture]\nfps = 4.0\n").unwrap();
        assert_eq!(config.capture.frame_interval(), Duration::from_millis(250));
    }

    #[test]
    fn unknown_mode_is_parse_error() {
        let err = Config::parse("[capture]\nmode = \"webcam\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
