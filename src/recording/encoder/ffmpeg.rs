//! Video containers through an `ffmpeg` child process.
//!
//! Raw RGBA frames go in on stdin; the muxed container comes back on stdout
//! and is forwarded in read-sized chunks. The child is killed if the encoder
//! is dropped without finishing.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use image::RgbaImage;
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;

use super::{ChunkReceiver, EncoderBackend, EncoderConfig, EncoderFormat, VideoEncoder};

const READ_CHUNK_BYTES: usize = 64 * 1024;
const STDERR_TAIL_LINES: usize = 3;

pub struct FfmpegBackend {
    binary: PathBuf,
    encoders: OnceCell<HashSet<String>>,
}

impl Default for FfmpegBackend {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FfmpegBackend {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            encoders: OnceCell::new(),
        }
    }

    /// Encoder names from `ffmpeg -encoders`; empty when ffmpeg is missing.
    async fn available_encoders(&self) -> &HashSet<String> {
        self.encoders
            .get_or_init(|| async {
                match probe_encoders(&self.binary).await {
                    Ok(names) => {
                        info!("ffmpeg available with {} encoders", names.len());
                        names
                    }
                    Err(err) => {
                        info!("ffmpeg unavailable: {err:#}");
                        HashSet::new()
                    }
                }
            })
            .await
    }
}

async fn probe_encoders(binary: &Path) -> Result<HashSet<String>> {
    let output = Command::new(binary)
        .args(["-hide_banner", "-encoders"])
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("failed to run {}", binary.display()))?;

    if !output.status.success() {
        bail!("{} -encoders exited with {}", binary.display(), output.status);
    }
    Ok(parse_encoder_list(&String::from_utf8_lossy(&output.stdout)))
}

/// Lines look like ` V....D libvpx-vp9   libvpx VP9 (codec vp9)`; the list
/// starts after the ` ------` separator.
fn parse_encoder_list(listing: &str) -> HashSet<String> {
    listing
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let flags = parts.next()?;
            flags.starts_with('V').then(|| parts.next().map(str::to_string)).flatten()
        })
        .collect()
}

fn codec_name(format: EncoderFormat) -> Option<&'static str> {
    match format {
        EncoderFormat::WebmVp9 => Some("libvpx-vp9"),
        EncoderFormat::WebmVp8 => Some("libvpx"),
        EncoderFormat::Mp4H264 => Some("libx264"),
        EncoderFormat::Gif => None,
    }
}

fn encode_args(config: &EncoderConfig, codec: &str) -> Vec<String> {
    let mut args: Vec<String> = [
        "-hide_banner",
        "-loglevel",
        "error",
        "-f",
        "rawvideo",
        "-pix_fmt",
        "rgba",
        "-s",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    args.push(format!("{}x{}", config.width, config.height));
    args.extend(["-r".to_string(), config.fps.max(1).to_string()]);
    args.extend(["-i", "pipe:0", "-an", "-c:v", codec].map(String::from));
    args.extend(["-b:v".to_string(), config.bitrate.to_string()]);
    args.extend(["-pix_fmt", "yuv420p"].map(String::from));

    match config.format {
        EncoderFormat::WebmVp9 => {
            args.extend(["-deadline", "realtime", "-cpu-used", "8", "-f", "webm"].map(String::from));
        }
        EncoderFormat::WebmVp8 => {
            args.extend(["-deadline", "realtime", "-f", "webm"].map(String::from));
        }
        EncoderFormat::Mp4H264 => {
            // Non-seekable output needs a fragmented mp4.
            args.extend(
                ["-preset", "veryfast", "-movflags", "frag_keyframe+empty_moov", "-f", "mp4"]
                    .map(String::from),
            );
        }
        EncoderFormat::Gif => {}
    }

    args.push("pipe:1".to_string());
    args
}

#[async_trait]
impl EncoderBackend for FfmpegBackend {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn handles(&self, format: EncoderFormat) -> bool {
        codec_name(format).is_some()
    }

    async fn supports(&self, format: EncoderFormat) -> bool {
        match codec_name(format) {
            Some(codec) => self.available_encoders().await.contains(codec),
            None => false,
        }
    }

    async fn start(&self, config: &EncoderConfig) -> Result<(Box<dyn VideoEncoder>, ChunkReceiver)> {
        let codec = codec_name(config.format)
            .ok_or_else(|| anyhow!("ffmpeg backend cannot produce {}", config.format))?;

        let mut child = Command::new(&self.binary)
            .args(encode_args(config, codec))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.binary.display()))?;

        let stdin = child.stdin.take().context("ffmpeg stdin unavailable")?;
        let mut stdout = child.stdout.take().context("ffmpeg stdout unavailable")?;
        let mut stderr = child.stderr.take().context("ffmpeg stderr unavailable")?;

        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK_BYTES];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!("ffmpeg stdout read failed: {err}");
                        break;
                    }
                }
            }
        });
        let stderr_task = tokio::spawn(async move {
            let mut text = String::new();
            let _ = stderr.read_to_string(&mut text).await;
            text
        });

        debug!("ffmpeg {} encoder started ({}x{})", codec, config.width, config.height);
        let encoder = FfmpegEncoder {
            format: config.format,
            frame_bytes: config.width as usize * config.height as usize * 4,
            child,
            stdin: Some(stdin),
            reader,
            stderr_task,
        };
        Ok((Box::new(encoder), rx))
    }
}

pub struct FfmpegEncoder {
    format: EncoderFormat,
    frame_bytes: usize,
    child: Child,
    stdin: Option<ChildStdin>,
    reader: JoinHandle<()>,
    stderr_task: JoinHandle<String>,
}

fn stderr_tail(text: &str) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("; ")
}

#[async_trait]
impl VideoEncoder for FfmpegEncoder {
    fn format(&self) -> EncoderFormat {
        self.format
    }

    async fn push_frame(&mut self, frame: RgbaImage) -> Result<()> {
        let raw = frame.as_raw();
        if raw.len() != self.frame_bytes {
            bail!(
                "frame is {}x{}, encoder expects {} bytes",
                frame.width(),
                frame.height(),
                self.frame_bytes
            );
        }
        let stdin = self.stdin.as_mut().context("encoder already finished")?;
        stdin.write_all(raw).await.context("ffmpeg stopped accepting frames")
    }

    async fn finish(mut self: Box<Self>) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }

        let status = self.child.wait().await.context("failed to wait for ffmpeg")?;
        let _ = (&mut self.reader).await;
        let stderr = (&mut self.stderr_task).await.unwrap_or_default();

        if !status.success() {
            bail!("ffmpeg exited with {status}: {}", stderr_tail(&stderr));
        }
        Ok(())
    }

    fn abort(mut self: Box<Self>) {
        self.stdin.take();
        if let Err(err) = self.child.start_kill() {
            debug!("ffmpeg already gone on abort: {err}");
        }
        self.reader.abort();
        self.stderr_task.abort();
    }
}
