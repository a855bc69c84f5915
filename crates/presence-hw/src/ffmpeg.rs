//! Network and file streams decoded by an `ffmpeg` child process.
//!
//! `ffprobe` reports the stream dimensions, then `ffmpeg` decodes to raw
//! `rgb24` on stdout, one frame every `width * height * 3` bytes.

use crate::frame::Frame;
use crate::source::{redact_uri, SourceError, VideoSource};
use image::RgbImage;
use std::io::Read;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FfmpegOptions {
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
    /// I/O timeout for network inputs; a stalled server surfaces as a read failure.
    pub io_timeout: Duration,
    /// ffmpeg before 5.0 names the RTSP socket timeout `-stimeout`
    /// (its `-timeout` switches RTSP into listen mode).
    pub legacy_rtsp_timeout: bool,
}

impl Default for FfmpegOptions {
    fn default() -> Self {
        Self {
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
            io_timeout: Duration::from_secs(5),
            legacy_rtsp_timeout: false,
        }
    }
}

impl FfmpegOptions {
    /// Defaults, with the RTSP timeout flag chosen from `ffmpeg -version`.
    pub fn detect() -> Self {
        let mut opts = Self::default();
        match ffmpeg_major_version(&opts.ffmpeg_bin) {
            Some(major) => {
                opts.legacy_rtsp_timeout = major < 5;
                tracing::debug!(major, legacy = opts.legacy_rtsp_timeout, "ffmpeg version detected");
            }
            None => tracing::debug!("ffmpeg version unknown, assuming 5.0 or newer"),
        }
        opts
    }
}

pub struct FfmpegSource {
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
    sequence: u64,
}

impl FfmpegSource {
    pub fn open(uri: &str, opts: &FfmpegOptions) -> Result<Self, SourceError> {
        let (width, height) = probe_dimensions(uri, opts)?;

        let mut child = Command::new(&opts.ffmpeg_bin)
            .args(decode_args(uri, opts))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SourceError::Unavailable(format!("spawn {}: {e}", opts.ffmpeg_bin)))?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SourceError::Unavailable("ffmpeg stdout not captured".into()));
        };

        tracing::info!(uri = %redact_uri(uri), width, height, pid = child.id(), "ffmpeg source opened");

        Ok(Self {
            child,
            stdout,
            width,
            height,
            sequence: 0,
        })
    }
}

impl VideoSource for FfmpegSource {
    fn read_frame(&mut self) -> Result<Frame, SourceError> {
        let mut buf = vec![0u8; (self.width * self.height * 3) as usize];
        self.stdout
            .read_exact(&mut buf)
            .map_err(|e| SourceError::ReadFailed(format!("ffmpeg pipe: {e}")))?;

        let image = RgbImage::from_raw(self.width, self.height, buf)
            .ok_or_else(|| SourceError::ReadFailed("frame buffer size mismatch".into()))?;
        self.sequence += 1;
        Ok(Frame::new(image, self.sequence))
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        tracing::debug!(pid = self.child.id(), "ffmpeg source released");
    }
}

fn is_rtsp(uri: &str) -> bool {
    uri.starts_with("rtsp://") || uri.starts_with("rtsps://")
}

fn is_network(uri: &str) -> bool {
    uri.split_once("://")
        .is_some_and(|(scheme, _)| !scheme.is_empty() && scheme != "file")
}

/// Input options shared by ffprobe and ffmpeg.
///
/// RTSP gets TCP transport and a socket timeout; other URL inputs (http,
/// https, tcp, ...) get the generic avio `-rw_timeout`. Local files get none.
fn input_args(uri: &str, opts: &FfmpegOptions) -> Vec<String> {
    let micros = opts.io_timeout.as_micros().to_string();
    if is_rtsp(uri) {
        let flag = if opts.legacy_rtsp_timeout { "-stimeout" } else { "-timeout" };
        vec!["-rtsp_transport".to_string(), "tcp".to_string(), flag.to_string(), micros]
    } else if is_network(uri) {
        vec!["-rw_timeout".to_string(), micros]
    } else {
        Vec::new()
    }
}

/// Major version from `ffmpeg -version`. Git builds (`N-...`) report `None`.
fn ffmpeg_major_version(ffmpeg_bin: &str) -> Option<u32> {
    let output = Command::new(ffmpeg_bin)
        .arg("-version")
        .stdin(Stdio::null())
        .output()
        .ok()?;
    parse_major_version(&String::from_utf8_lossy(&output.stdout))
}

/// Parse `ffmpeg version 4.4.2-0ubuntu0.22.04.1 ...` or `ffmpeg version n6.1 ...`.
fn parse_major_version(text: &str) -> Option<u32> {
    let version = text.lines().next()?.strip_prefix("ffmpeg version ")?;
    let version = version.strip_prefix('n').unwrap_or(version);
    let digits: String = version.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn decode_args(uri: &str, opts: &FfmpegOptions) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.extend(input_args(uri, opts));
    args.extend(
        ["-i", uri, "-an", "-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"]
            .iter()
            .map(|s| s.to_string()),
    );
    args
}

/// Read `(width, height)` of the first video stream with ffprobe.
pub fn probe_dimensions(uri: &str, opts: &FfmpegOptions) -> Result<(u32, u32), SourceError> {
    let mut args = vec![
        "-v".to_string(),
        "error".to_string(),
        "-select_streams".to_string(),
        "v:0".to_string(),
        "-show_entries".to_string(),
        "stream=width,height".to_string(),
        "-of".to_string(),
        "csv=p=0".to_string(),
    ];
    args.extend(input_args(uri, opts));
    args.push(uri.to_string());

    let output = Command::new(&opts.ffprobe_bin)
        .args(&args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| SourceError::Unavailable(format!("run {}: {e}", opts.ffprobe_bin)))?;

    if !output.status.success() {
        return Err(SourceError::Unavailable(format!(
            "ffprobe {} exited with {}",
            redact_uri(uri),
            output.status
        )));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    parse_dimensions(&text).ok_or_else(|| {
        SourceError::Unavailable(format!("unexpected ffprobe output: {:?}", text.trim()))
    })
}

/// Parse ffprobe's `csv=p=0` output (`1920,1080`), ignoring trailing separators and extra lines.
fn parse_dimensions(text: &str) -> Option<(u32, u32)> {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty())?;
    let mut parts = line.trim_end_matches(',').split(',');
    let width: u32 = parts.next()?.trim().parse().ok()?;
    let height: u32 = parts.next()?.trim().parse().ok()?;
    (width > 0 && height > 0).then_some((width, height))
}
