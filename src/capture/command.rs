//! Capture adapter that runs an external command printing a PNG to stdout.
//!
//! Examples: `adb exec-out screencap -p`, or a helper that grabs a mirrored window.

use async_trait::async_trait;
use std::time::Duration;
use tokio::process::Command;

use super::{CaptureError, CaptureSource, Frame};

pub const DEFAULT_CAPTURE_TIMEOUT_SECS: u64 = 10;

const PNG_MAGIC: &[u8; 8] = b"\x89PNG\r\n\x1a\n";

/// Whether `bytes` start with the PNG signature.
pub fn is_png(bytes: &[u8]) -> bool {
    bytes.len() >= PNG_MAGIC.len() && &bytes[..PNG_MAGIC.len()] == PNG_MAGIC
}

/// Captures frames by spawning a command and decoding its stdout.
#[derive(Debug, Clone)]
pub struct CommandCapture {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandCapture {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(DEFAULT_CAPTURE_TIMEOUT_SECS),
        }
    }

    /// Build from a full command line (`program arg...`). Returns `None` when empty.
    pub fn from_command_line(parts: &[String]) -> Option<Self> {
        let (program, args) = parts.split_first()?;
        Some(Self::new(program.clone()).with_args(args.iter().cloned()))
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl CaptureSource for CommandCapture {
    async fn capture(&self) -> Result<Frame, CaptureError> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.program).args(&self.args).kill_on_drop(true).output(),
        )
        .await
        .map_err(|_| CaptureError::Timeout)?
        .map_err(|e| CaptureError::Unavailable(format!("{}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CaptureError::Unavailable(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let data = &output.stdout;
        if !is_png(data) {
            tracing::error!(
                "Capture output is not a PNG, got: {:?}",
                &data[..8.min(data.len())]
            );
            return Err(CaptureError::Decode("invalid PNG header".to_string()));
        }

        Frame::from_png_bytes(data)
    }
}
