use async_trait::async_trait;
use edgewatch_common::config::RecognitionConfig;
use edgewatch_common::frame::Frame;
use image::ImageFormat;
use std::io::Cursor;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, warn};

use super::{RecognitionError, Recognizer};

/// Runs the `tesseract` CLI once per crop, feeding a PNG on stdin and
/// reading plain text from stdout.
///
/// The child is killed when the returned future is dropped, so an outer
/// timeout also reaps the process.
#[derive(Debug, Clone)]
pub struct TesseractCli {
    command: String,
    page_seg_mode: u32,
    whitelist: Option<String>,
}

impl TesseractCli {
    pub fn new(config: &RecognitionConfig) -> Self {
        let whitelist = Some(config.whitelist.trim())
            .filter(|w| !w.is_empty())
            .map(str::to_string);
        Self {
            command: config.command.clone(),
            page_seg_mode: config.page_seg_mode,
            whitelist,
        }
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![
            "stdin".to_string(),
            "stdout".to_string(),
            "--psm".to_string(),
            self.page_seg_mode.to_string(),
        ];
        if let Some(whitelist) = &self.whitelist {
            args.push("-c".to_string());
            args.push(format!("tessedit_char_whitelist={whitelist}"));
        }
        args
    }
}

fn encode_png(crop: &Frame) -> Result<Vec<u8>, RecognitionError> {
    let mut png = Vec::new();
    let result = match crop {
        Frame::Color(img) => img.write_to(&mut Cursor::new(&mut png), ImageFormat::Png),
        Frame::Gray(img) => img.write_to(&mut Cursor::new(&mut png), ImageFormat::Png),
    };
    result.map_err(|e| RecognitionError::Encode(e.to_string()))?;
    Ok(png)
}

#[async_trait]
impl Recognizer for TesseractCli {
    async fn recognize(&self, crop: &Frame) -> Result<String, RecognitionError> {
        let png = encode_png(crop)?;

        let mut child = Command::new(&self.command)
            .args(self.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RecognitionError::Spawn(e.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| RecognitionError::Spawn("could not get stdin handle".into()))?;
        stdin
            .write_all(&png)
            .await
            .map_err(|e| RecognitionError::Write(e.to_string()))?;
        // Close stdin so tesseract sees the end of the image.
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| RecognitionError::Wait(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(stderr = %stderr, "tesseract exited with error");
            return Err(RecognitionError::Failed(stderr.into_owned()));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(bytes = png.len(), chars = text.len(), "tesseract finished");
        Ok(text)
    }

    fn name(&self) -> &str {
        "tesseract"
    }
}

/// Check whether the recognizer binary is runnable. Logs a warning if not.
pub async fn check_tesseract_available(command: &str) {
    match Command::new(command).arg("--version").output().await {
        Ok(out) if out.status.success() => {
            debug!(command, "tesseract is available");
        }
        Ok(_) => {
            warn!(command, "tesseract returned non-zero for --version; recognition may fail");
        }
        Err(e) => {
            warn!(
                error = %e,
                command,
                "tesseract not found; regions will be reported without text"
            );
        }
    }
}
