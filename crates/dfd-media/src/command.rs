//! FFmpeg command builder and runner.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{MediaError, MediaResult};

/// Output target meaning "write to stdout".
const STDOUT: &str = "-";

/// Builder for FFmpeg commands.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    /// Input file path
    input: PathBuf,
    /// Output file path, or `-` for stdout
    output: String,
    /// Input arguments (before -i)
    input_args: Vec<String>,
    /// Output arguments (after -i)
    output_args: Vec<String>,
    /// Log level
    log_level: String,
}

impl FfmpegCommand {
    /// Create a new FFmpeg command writing to a file.
    pub fn new(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        Self {
            input: input.as_ref().to_path_buf(),
            output: output.as_ref().to_string_lossy().to_string(),
            input_args: Vec::new(),
            output_args: Vec::new(),
            log_level: "error".to_string(),
        }
    }

    /// Create a new FFmpeg command writing its output to stdout.
    pub fn to_stdout(input: impl AsRef<Path>) -> Self {
        Self::new(input, STDOUT)
    }

    /// Add input arguments (before -i).
    pub fn input_arg(mut self, arg: impl Into<String>) -> Self {
        self.input_args.push(arg.into());
        self
    }

    /// Add output arguments (after -i).
    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    /// Add multiple output arguments.
    pub fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set video filter.
    pub fn video_filter(self, filter: impl Into<String>) -> Self {
        self.output_arg("-vf").output_arg(filter)
    }

    /// Emit every selected frame once, without frame-rate duplication.
    pub fn passthrough_timing(self) -> Self {
        self.output_arg("-fps_mode").output_arg("passthrough")
    }

    /// Emit packed 8-bit RGB frames with no container.
    pub fn raw_rgb24(self) -> Self {
        self.output_args(["-pix_fmt", "rgb24", "-f", "rawvideo"])
    }

    /// Set log level.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Whether the command writes to stdout.
    pub fn writes_stdout(&self) -> bool {
        self.output == STDOUT
    }

    /// Build the command arguments.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        args.push("-hide_banner".to_string());
        args.push("-nostdin".to_string());

        // Only file outputs may be overwritten
        if !self.writes_stdout() {
            args.push("-y".to_string());
        }

        args.push("-v".to_string());
        args.push(self.log_level.clone());

        args.extend(self.input_args.clone());

        args.push("-i".to_string());
        args.push(self.input.to_string_lossy().to_string());

        args.extend(self.output_args.clone());

        args.push(self.output.clone());

        args
    }
}

/// Captured result of an FFmpeg run.
#[derive(Debug)]
pub struct FfmpegOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl FfmpegOutput {
    /// Convert a failed run into an error.
    pub fn into_error(self, message: impl Into<String>) -> MediaError {
        let stderr = if self.stderr.trim().is_empty() {
            None
        } else {
            Some(self.stderr)
        };
        MediaError::ffmpeg_failed(message, stderr, self.exit_code)
    }
}

/// Runner for FFmpeg commands.
#[derive(Debug, Default, Clone)]
pub struct FfmpegRunner;

impl FfmpegRunner {
    /// Create a new runner.
    pub fn new() -> Self {
        Self
    }

    /// Run a command and capture stdout and stderr.
    ///
    /// A non-zero exit status is reported in the output, not as an error, so
    /// callers can keep whatever frames were produced before a decode failure.
    pub async fn capture(&self, cmd: &FfmpegCommand) -> MediaResult<FfmpegOutput> {
        check_ffmpeg()?;

        let args = cmd.build_args();
        debug!("Running FFmpeg: ffmpeg {}", args.join(" "));

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MediaError::ffmpeg_failed(format!("Failed to spawn FFmpeg: {}", e), None, None))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| MediaError::ffmpeg_failed("Failed to capture FFmpeg stdout", None, None))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| MediaError::ffmpeg_failed("Failed to capture FFmpeg stderr", None, None))?;

        // Drain both pipes concurrently so a chatty stderr cannot block stdout
        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();
        let (out_res, err_res) = tokio::join!(
            stdout.read_to_end(&mut out_buf),
            stderr.read_to_end(&mut err_buf)
        );
        out_res?;
        err_res?;

        let status = child.wait().await?;

        Ok(FfmpegOutput {
            stdout: out_buf,
            stderr: String::from_utf8_lossy(&err_buf).to_string(),
            exit_code: status.code(),
            success: status.success(),
        })
    }
}

/// Check if FFmpeg is available.
pub fn check_ffmpeg() -> MediaResult<PathBuf> {
    which::which("ffmpeg").map_err(|_| MediaError::FfmpegNotFound)
}

/// Check if FFprobe is available.
pub fn check_ffprobe() -> MediaResult<PathBuf> {
    which::which("ffprobe").map_err(|_| MediaError::FfprobeNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_builder() {
        let cmd = FfmpegCommand::to_stdout("input.mp4")
            .video_filter("scale=299:299")
            .passthrough_timing()
            .raw_rgb24();

        let args = cmd.build_args();
        assert!(cmd.writes_stdout());
        assert!(!args.contains(&"-y".to_string()));
        assert!(args.contains(&"-vf".to_string()));
        assert!(args.contains(&"scale=299:299".to_string()));
        assert!(args.contains(&"rawvideo".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("-"));

        let input_pos = args.iter().position(|a| a == "-i").unwrap();
        let vf_pos = args.iter().position(|a| a == "-vf").unwrap();
        assert!(input_pos < vf_pos);
    }

    #[test]
    fn test_file_output_overwrites() {
        let args = FfmpegCommand::new("in.mp4", "out.png").log_level("warning").build_args();
        assert!(args.contains(&"-y".to_string()));
        assert!(args.contains(&"warning".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("out.png"));
    }
}
