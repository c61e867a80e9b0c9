//! Tokio adapter over [`IoContext`].
//!
//! Submission may block on the gate, so it runs on the blocking pool; the
//! completion callback resolves a oneshot the calling task awaits.

use std::io;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::debug;

use crate::buffer::AlignedBuffer;
use crate::config::AioConfig;
use crate::context::{IoCompletion, IoContext};
use crate::error::{AioError, AioResult};
use crate::sys::IoOp;

/// Async positional reads and writes on one engine-backed file.
#[derive(Clone)]
pub struct AsyncFile {
    ctx: Arc<IoContext>,
}

impl AsyncFile {
    /// Opens `path` on a kernel AIO context.
    pub async fn open(path: impl AsRef<Path>, config: AioConfig) -> AioResult<Self> {
        let path = path.as_ref().to_path_buf();
        let ctx = tokio::task::spawn_blocking(move || IoContext::open(path, config))
            .await
            .map_err(join_error)??;
        Ok(Self::new(ctx))
    }

    /// Wraps an already open context.
    pub fn new(ctx: IoContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    /// Submits `buffer` and waits for its completion.
    pub async fn submit(&self, op: IoOp, buffer: AlignedBuffer, offset: u64) -> AioResult<IoCompletion> {
        let (tx, rx) = oneshot::channel();
        let ctx = Arc::clone(&self.ctx);
        tokio::task::spawn_blocking(move || {
            ctx.submit(
                op,
                buffer,
                offset,
                Box::new(move |completion: IoCompletion| {
                    if tx.send(completion).is_err() {
                        debug!("{} completion at offset {} dropped, waiter gone", op.as_str(), offset);
                    }
                }),
            )
        })
        .await
        .map_err(join_error)?;

        rx.await.map_err(|_| AioError::Closed)
    }

    /// Reads `len` bytes at `offset` into a fresh aligned buffer.
    pub async fn read_at(&self, offset: u64, len: usize) -> AioResult<AlignedBuffer> {
        let buffer = AlignedBuffer::new(len)?;
        let completion = self.submit(IoOp::Read, buffer, offset).await?;
        completion.result?;
        Ok(completion.buffer)
    }

    /// Writes `data` at `offset`, returning the bytes written.
    pub async fn write_at(&self, data: &[u8], offset: u64) -> AioResult<usize> {
        let buffer = AlignedBuffer::from_slice(data)?;
        self.submit(IoOp::Write, buffer, offset).await?.result
    }

    /// Closes the underlying context.
    pub async fn close(&self) -> AioResult<()> {
        let ctx = Arc::clone(&self.ctx);
        tokio::task::spawn_blocking(move || ctx.close())
            .await
            .map_err(join_error)?
    }

    /// The wrapped engine.
    pub fn context(&self) -> &IoContext {
        &self.ctx
    }
}

fn join_error(e: tokio::task::JoinError) -> AioError {
    AioError::Io(io::Error::new(io::ErrorKind::Other, e))
}
