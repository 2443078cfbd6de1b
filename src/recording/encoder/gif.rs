//! Animated GIF encoding in-process, on a dedicated encoder thread.

use std::io::{self, BufWriter, Write};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc::{self, SyncSender, TrySendError},
    Arc,
};
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, Frame, RgbaImage};
use log::{debug, warn};
use tokio::sync::{mpsc as tokio_mpsc, oneshot};

use super::{ChunkReceiver, ChunkSender, EncoderBackend, EncoderConfig, EncoderFormat, VideoEncoder};

/// Frames waiting for the encoder thread; further frames are dropped.
const FRAME_QUEUE_DEPTH: usize = 4;
/// Fastest NeuQuant setting; quantization dominates encode time.
const QUANTIZE_SPEED: i32 = 30;
const WRITE_BUFFER_BYTES: usize = 64 * 1024;

pub struct GifBackend;

#[async_trait]
impl EncoderBackend for GifBackend {
    fn name(&self) -> &'static str {
        "gif"
    }

    fn handles(&self, format: EncoderFormat) -> bool {
        format == EncoderFormat::Gif
    }

    async fn supports(&self, format: EncoderFormat) -> bool {
        self.handles(format)
    }

    async fn start(&self, config: &EncoderConfig) -> Result<(Box<dyn VideoEncoder>, ChunkReceiver)> {
        if config.format != EncoderFormat::Gif {
            bail!("gif backend cannot produce {}", config.format);
        }
        let (encoder, rx) = GifSession::spawn(config)?;
        Ok((Box::new(encoder), rx))
    }
}

/// Forwards every buffered write as one chunk.
struct ChunkWriter {
    tx: ChunkSender,
}

impl Write for ChunkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "chunk receiver dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct GifSession {
    frames: Option<SyncSender<RgbaImage>>,
    done: Option<oneshot::Receiver<Result<()>>>,
    aborted: Arc<AtomicBool>,
    dropped: u64,
}

impl GifSession {
    fn spawn(config: &EncoderConfig) -> Result<(Self, ChunkReceiver)> {
        let (chunk_tx, chunk_rx) = tokio_mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::sync_channel::<RgbaImage>(FRAME_QUEUE_DEPTH);
        let (done_tx, done_rx) = oneshot::channel();
        let aborted = Arc::new(AtomicBool::new(false));

        let delay = Delay::from_numer_denom_ms(1000, config.fps.max(1));
        let thread_aborted = Arc::clone(&aborted);

        thread::Builder::new()
            .name("gif-encoder".to_string())
            .spawn(move || {
                let writer = BufWriter::with_capacity(WRITE_BUFFER_BYTES, ChunkWriter { tx: chunk_tx });
                let mut encoder = GifEncoder::new_with_speed(writer, QUANTIZE_SPEED);
                let mut result = encoder
                    .set_repeat(Repeat::Infinite)
                    .map_err(|e| anyhow!("failed to configure gif encoder: {e}"));

                let mut encoded = 0u64;
                while let Ok(frame) = frame_rx.recv() {
                    if thread_aborted.load(Ordering::SeqCst) || result.is_err() {
                        continue;
                    }
                    if let Err(e) = encoder.encode_frame(Frame::from_parts(frame, 0, 0, delay)) {
                        result = Err(anyhow!("gif frame {encoded} failed to encode: {e}"));
                    } else {
                        encoded += 1;
                    }
                }

                // Dropping the encoder writes the trailer and flushes the
                // buffer; dropping the writer then closes the chunk channel.
                drop(encoder);
                debug!("gif encoder thread finished after {encoded} frames");
                let _ = done_tx.send(result);
            })
            .context("failed to spawn gif encoder thread")?;

        Ok((
            Self {
                frames: Some(frame_tx),
                done: Some(done_rx),
                aborted,
                dropped: 0,
            },
            chunk_rx,
        ))
    }
}

#[async_trait]
impl VideoEncoder for GifSession {
    fn format(&self) -> EncoderFormat {
        EncoderFormat::Gif
    }

    async fn push_frame(&mut self, frame: RgbaImage) -> Result<()> {
        let frames = self.frames.as_ref().context("encoder already finished")?;
        match frames.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                debug!("gif encoder busy; dropped frame ({} so far)", self.dropped);
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(anyhow!("gif encoder thread exited")),
        }
    }

    async fn finish(mut self: Box<Self>) -> Result<()> {
        self.frames.take();
        if self.dropped > 0 {
            warn!("gif encoder dropped {} frames under load", self.dropped);
        }
        let done = self.done.take().context("encoder already finished")?;
        done.await.context("gif encoder thread vanished")?
    }

    fn abort(mut self: Box<Self>) {
        self.aborted.store(true, Ordering::SeqCst);
        self.frames.take();
    }
}
