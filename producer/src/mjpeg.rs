use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use edgewatch_common::config::MIN_FRAME_INTERVAL;
use edgewatch_common::frame::Frame;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use image::ImageReader;
use std::io::Cursor;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{CaptureError, FrameSource};

const BOUNDARY: &[u8] = b"--frame\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Parse state for the MJPEG multipart stream.
enum ParseState {
    /// Looking for the boundary marker `--frame\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting part bytes until the next boundary.
    CollectingPart,
}

/// Incremental splitter for a `multipart/x-mixed-replace` byte stream.
///
/// Only the most recent complete part is kept; older complete parts that
/// were never collected are counted in `skipped`. A part or header block
/// that grows past `max_part` bytes is abandoned and the parser resyncs on
/// the next boundary.
pub struct MultipartParser {
    buffer: BytesMut,
    state: ParseState,
    scan_from: usize,
    latest: Option<Vec<u8>>,
    skipped: u64,
    max_part: usize,
    oversized: u64,
}

impl MultipartParser {
    pub const DEFAULT_MAX_PART: usize = 16 * 1024 * 1024;

    pub fn new() -> Self {
        Self::with_max_part(Self::DEFAULT_MAX_PART)
    }

    pub fn with_max_part(max_part: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            scan_from: 0,
            latest: None,
            skipped: 0,
            max_part: max_part.max(1),
            oversized: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);

        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, BOUNDARY) {
                        // Discard everything up to and including the boundary
                        let _ = self.buffer.split_to(pos + BOUNDARY.len());
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep last few bytes in case boundary spans chunks
                        if self.buffer.len() > BOUNDARY.len() {
                            let _ = self.buffer.split_to(self.buffer.len() - BOUNDARY.len());
                        }
                        break;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let _ = self.buffer.split_to(pos + HEADER_END.len());
                        self.scan_from = 0;
                        self.state = ParseState::CollectingPart;
                    } else {
                        self.abandon_if_oversized();
                        break;
                    }
                }
                ParseState::CollectingPart => {
                    let Some(pos) = find_subsequence(&self.buffer[self.scan_from..], BOUNDARY)
                    else {
                        // Resume the search near the tail next time.
                        self.scan_from = self.buffer.len().saturating_sub(BOUNDARY.len());
                        self.abandon_if_oversized();
                        break;
                    };
                    let part_end = self.scan_from + pos;
                    // Strip trailing \r\n before boundary
                    let end = if part_end >= 2 && &self.buffer[part_end - 2..part_end] == b"\r\n" {
                        part_end - 2
                    } else {
                        part_end
                    };
                    let part = self.buffer[..end].to_vec();
                    let _ = self.buffer.split_to(part_end + BOUNDARY.len());

                    if !part.is_empty() && self.latest.replace(part).is_some() {
                        self.skipped += 1;
                    }
                    self.state = ParseState::SeekingHeaderEnd;
                }
            }
        }
    }

    /// Drop a half-read part that has outgrown `max_part` and wait for the
    /// next boundary. A completed part already waiting is kept.
    fn abandon_if_oversized(&mut self) {
        if self.buffer.len() <= self.max_part {
            return;
        }
        self.oversized += 1;
        warn!(
            buffered = self.buffer.len(),
            max_part = self.max_part,
            oversized = self.oversized,
            "multipart part exceeds limit, resyncing on next boundary"
        );
        self.buffer.clear();
        self.scan_from = 0;
        self.state = ParseState::SeekingBoundary;
    }

    /// Take the newest complete part, if any.
    pub fn next_part(&mut self) -> Option<Vec<u8>> {
        self.latest.take()
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Parts abandoned for exceeding the size limit.
    pub fn oversized(&self) -> u64 {
        self.oversized
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = ParseState::SeekingBoundary;
        self.scan_from = 0;
        self.latest = None;
    }
}

impl Default for MultipartParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode an encoded still image (JPEG, PNG, ...) into a color frame.
pub fn decode_image(data: &[u8]) -> Result<Frame, CaptureError> {
    let img = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| CaptureError::Decode(e.to_string()))?
        .decode()
        .map_err(|e| CaptureError::Decode(e.to_string()))?;
    Ok(Frame::color(img.to_rgb8()))
}

/// Live MJPEG stream over HTTP.
pub struct MjpegSource {
    url: String,
    client: reqwest::Client,
    stream: Option<BoxStream<'static, reqwest::Result<Bytes>>>,
    parser: MultipartParser,
}

impl MjpegSource {
    pub fn new(url: &str, max_part_bytes: usize) -> Result<Self, CaptureError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(CaptureError::HttpConnect)?;
        Ok(Self {
            url: url.to_string(),
            client,
            stream: None,
            parser: MultipartParser::with_max_part(max_part_bytes),
        })
    }

    async fn connect(&mut self) -> Result<(), CaptureError> {
        info!(url = self.url, "connecting to MJPEG stream");
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(CaptureError::HttpConnect)?;

        if !response.status().is_success() {
            return Err(CaptureError::HttpStatus(response.status().as_u16()));
        }

        info!(status = %response.status(), "connected to MJPEG stream");
        self.parser.reset();
        self.stream = Some(response.bytes_stream().boxed());
        Ok(())
    }
}

#[async_trait]
impl FrameSource for MjpegSource {
    async fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        if self.stream.is_none() {
            self.connect().await?;
        }

        let part = loop {
            if let Some(part) = self.parser.next_part() {
                break part;
            }
            let Some(stream) = self.stream.as_mut() else {
                return Err(CaptureError::StreamEnded);
            };
            match stream.next().await {
                Some(Ok(chunk)) => self.parser.push(&chunk),
                Some(Err(e)) => {
                    self.stream = None;
                    return Err(CaptureError::HttpStream(e));
                }
                None => {
                    self.stream = None;
                    return Err(CaptureError::StreamEnded);
                }
            }
        };

        match decode_image(&part) {
            Ok(frame) => {
                debug!(
                    bytes = part.len(),
                    skipped = self.parser.skipped(),
                    oversized = self.parser.oversized(),
                    "MJPEG frame decoded"
                );
                Ok(Some(frame))
            }
            Err(e) => {
                warn!(error = %e, "failed to decode MJPEG part, skipping");
                Ok(None)
            }
        }
    }

    async fn reset(&mut self) {
        self.stream = None;
        self.parser.reset();
    }

    fn name(&self) -> &str {
        "mjpeg"
    }
}

/// Polling fallback: fetch a single still image every `interval`.
pub struct PollingSource {
    url: String,
    client: reqwest::Client,
    ticker: Interval,
}

impl PollingSource {
    pub fn new(url: &str, interval: Duration) -> Result<Self, CaptureError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(CaptureError::HttpConnect)?;
        let mut ticker = tokio::time::interval(interval.max(MIN_FRAME_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Ok(Self {
            url: url.to_string(),
            client,
            ticker,
        })
    }
}

#[async_trait]
impl FrameSource for PollingSource {
    async fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        self.ticker.tick().await;

        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(CaptureError::HttpConnect)?;
        if !resp.status().is_success() {
            return Err(CaptureError::HttpStatus(resp.status().as_u16()));
        }
        let body = resp.bytes().await.map_err(CaptureError::HttpStream)?;

        match decode_image(&body) {
            Ok(frame) => Ok(Some(frame)),
            Err(e) => {
                warn!(error = %e, "failed to decode polled frame, skipping");
                Ok(None)
            }
        }
    }

    fn name(&self) -> &str {
        "polling"
    }
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
