//! Streaming file transform: plaintext file ⇄ sequence of chunk frames.
//!
//! Both directions read `src` in fixed windows, push each window through the
//! chunk codec and write the result sequentially to a temp path. `src` is never
//! modified; on any failure the temp file is removed before the error is
//! returned, so callers only ever see a complete output or none at all.

use std::path::Path;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::debug;

use cloak_core::config::MAX_CHUNK_SIZE;
use cloak_core::{CloakError, CloakResult};
use cloak_crypto::chunk::FRAME_OVERHEAD;
use cloak_crypto::{encrypt_chunk, FrameDecoder, SecretKey};

use crate::fsutil::discard_file;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformMode {
    Encrypt,
    Decrypt,
}

impl TransformMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TransformMode::Encrypt => "encrypt",
            TransformMode::Decrypt => "decrypt",
        }
    }
}

impl std::fmt::Display for TransformMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encrypt `src` into `temp` as a sequence of frames.
///
/// `on_progress` fires once per chunk with that chunk's plaintext size.
/// Returns the number of plaintext bytes processed.
pub async fn encrypt_file(
    src: &Path,
    temp: &Path,
    key: &SecretKey,
    chunk_size: usize,
    chunk_log: Option<&Path>,
    on_progress: impl FnMut(u64),
) -> CloakResult<u64> {
    check_chunk_size(chunk_size)?;
    let result = encrypt_inner(src, temp, key, chunk_size, chunk_log, on_progress).await;
    if result.is_err() {
        discard_file(temp).await;
    }
    result
}

/// Decrypt the frames in `src` into `temp`.
///
/// `chunk_size` is the plaintext chunk size the file was written with; the
/// read window adds the per-frame overhead on top. Any malformed or
/// unauthenticated frame aborts the whole file.
pub async fn decrypt_file(
    src: &Path,
    temp: &Path,
    key: &SecretKey,
    chunk_size: usize,
    chunk_log: Option<&Path>,
    on_progress: impl FnMut(u64),
) -> CloakResult<u64> {
    check_chunk_size(chunk_size)?;
    let result = decrypt_inner(src, temp, key, chunk_size, chunk_log, on_progress).await;
    if result.is_err() {
        discard_file(temp).await;
    }
    result
}

fn check_chunk_size(chunk_size: usize) -> CloakResult<()> {
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        return Err(CloakError::InvalidArgument(format!(
            "chunk size must be between 1 and {MAX_CHUNK_SIZE}, got {chunk_size}"
        )));
    }
    Ok(())
}

async fn encrypt_inner(
    src: &Path,
    temp: &Path,
    key: &SecretKey,
    chunk_size: usize,
    chunk_log: Option<&Path>,
    mut on_progress: impl FnMut(u64),
) -> CloakResult<u64> {
    let input = File::open(src).await.map_err(|e| CloakError::io(src, e))?;
    let mut reader = BufReader::new(input);
    let output = File::create(temp).await.map_err(|e| CloakError::io(temp, e))?;
    let mut writer = BufWriter::new(output);
    let mut log = ChunkLog::open(chunk_log, TransformMode::Encrypt).await;

    let mut window = vec![0u8; chunk_size];
    let mut processed = 0u64;
    let mut index = 0usize;
    loop {
        let n = fill_window(&mut reader, &mut window)
            .await
            .map_err(|e| CloakError::io(src, e))?;
        if n == 0 {
            break;
        }
        let frame = encrypt_chunk(key, &window[..n])?;
        writer
            .write_all(&frame)
            .await
            .map_err(|e| CloakError::io(temp, e))?;
        log.record(index, n, frame.len()).await;
        on_progress(n as u64);
        processed += n as u64;
        index += 1;
        if n < chunk_size {
            break;
        }
    }

    finish_output(writer, temp).await?;
    debug!(src = %src.display(), chunks = index, bytes = processed, "encrypted stream");
    Ok(processed)
}

async fn decrypt_inner(
    src: &Path,
    temp: &Path,
    key: &SecretKey,
    chunk_size: usize,
    chunk_log: Option<&Path>,
    mut on_progress: impl FnMut(u64),
) -> CloakResult<u64> {
    let input = File::open(src).await.map_err(|e| CloakError::io(src, e))?;
    let mut reader = BufReader::new(input);
    let output = File::create(temp).await.map_err(|e| CloakError::io(temp, e))?;
    let mut writer = BufWriter::new(output);
    let mut log = ChunkLog::open(chunk_log, TransformMode::Decrypt).await;

    let mut window = vec![0u8; chunk_size + FRAME_OVERHEAD];
    let mut decoder = FrameDecoder::new();
    let mut processed = 0u64;
    let mut index = 0usize;
    loop {
        let n = fill_window(&mut reader, &mut window)
            .await
            .map_err(|e| CloakError::io(src, e))?;
        if n == 0 {
            break;
        }
        decoder.push(&window[..n]);
        while let Some(plaintext) = decoder.next_frame(key)? {
            writer
                .write_all(&plaintext)
                .await
                .map_err(|e| CloakError::io(temp, e))?;
            log.record(index, plaintext.len(), plaintext.len() + FRAME_OVERHEAD)
                .await;
            on_progress(plaintext.len() as u64);
            processed += plaintext.len() as u64;
            index += 1;
        }
    }
    decoder.finish()?;

    finish_output(writer, temp).await?;
    debug!(src = %src.display(), chunks = index, bytes = processed, "decrypted stream");
    Ok(processed)
}

/// Read until `window` is full or the input ends; returns the bytes read.
async fn fill_window<R: AsyncRead + Unpin>(
    reader: &mut R,
    window: &mut [u8],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < window.len() {
        let n = reader.read(&mut window[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn finish_output(mut writer: BufWriter<File>, temp: &Path) -> CloakResult<()> {
    writer.flush().await.map_err(|e| CloakError::io(temp, e))?;
    writer
        .get_ref()
        .sync_all()
        .await
        .map_err(|e| CloakError::io(temp, e))
}

/// Optional per-chunk diagnostic log. Failures here never fail the transform.
struct ChunkLog {
    file: Option<File>,
    mode: TransformMode,
}

impl ChunkLog {
    async fn open(path: Option<&Path>, mode: TransformMode) -> Self {
        let file = match path {
            Some(path) => match OpenOptions::new().create(true).append(true).open(path).await {
                Ok(file) => Some(file),
                Err(e) => {
                    debug!(path = %path.display(), "chunk log unavailable: {e}");
                    None
                }
            },
            None => None,
        };
        Self { file, mode }
    }

    async fn record(&mut self, index: usize, plain: usize, frame: usize) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let line = format!("{} chunk={index} plain={plain} frame={frame}\n", self.mode);
        if let Err(e) = file.write_all(line.as_bytes()).await {
            debug!("chunk log write failed: {e}");
            self.file = None;
        }
    }
}
