//! Buffer pool & handoff queues (spec.md §4.6): two FIFOs between consumer
//! and receiver, plus O(1) bookkeeping counters. The pool never allocates;
//! buffers are pushed in by the consumer pre-sized to the device payload.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::buffer::Buffer;

struct PoolInner {
    input_tx: mpsc::UnboundedSender<Buffer>,
    input_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Buffer>>,
    output_tx: mpsc::UnboundedSender<Buffer>,
    output_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Buffer>>,
    n_input: AtomicU64,
    n_output: AtomicU64,
    n_underruns: AtomicU64,
}

/// Shared handle to a stream's input/output buffer queues.
///
/// Cloning shares the same underlying channels: the receiver task holds one
/// clone, the consumer another.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new() -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(PoolInner {
                input_tx,
                input_rx: tokio::sync::Mutex::new(input_rx),
                output_tx,
                output_rx: tokio::sync::Mutex::new(output_rx),
                n_input: AtomicU64::new(0),
                n_output: AtomicU64::new(0),
                n_underruns: AtomicU64::new(0),
            }),
        }
    }

    /// Consumer side: enqueue a free buffer for the receiver to claim.
    pub fn push_input(&self, buffer: Buffer) {
        self.inner.n_input.fetch_add(1, Ordering::Relaxed);
        // An unbounded channel only fails to send once every receiver handle
        // has been dropped, which means the stream itself is gone.
        let _ = self.inner.input_tx.send(buffer);
    }

    /// Receiver side: claim a free buffer, blocking until one is available.
    pub async fn pop_input_blocking(&self) -> Option<Buffer> {
        let mut rx = self.inner.input_rx.lock().await;
        let buf = rx.recv().await;
        if buf.is_none() {
            self.inner.n_underruns.fetch_add(1, Ordering::Relaxed);
        }
        buf
    }

    /// Receiver side: claim a free buffer without blocking.
    pub fn try_pop_input(&self) -> Option<Buffer> {
        let mut rx = self
            .inner
            .input_rx
            .try_lock()
            .expect("single receiver task owns the input queue");
        match rx.try_recv() {
            Ok(buf) => Some(buf),
            Err(mpsc::error::TryRecvError::Empty) => {
                self.inner.n_underruns.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(mpsc::error::TryRecvError::Disconnected) => None,
        }
    }

    /// Receiver side: push a completed (or failed) buffer back to the consumer.
    pub fn push_output(&self, buffer: Buffer) {
        self.inner.n_output.fetch_add(1, Ordering::Relaxed);
        let _ = self.inner.output_tx.send(buffer);
    }

    /// Consumer side: block until a completed buffer is available.
    pub async fn pop_output_blocking(&self) -> Option<Buffer> {
        let mut rx = self.inner.output_rx.lock().await;
        rx.recv().await
    }

    /// Consumer side: wait up to `duration` for a completed buffer.
    pub async fn pop_output_with_timeout(&self, duration: Duration) -> Option<Buffer> {
        let mut rx = self.inner.output_rx.lock().await;
        timeout(duration, rx.recv()).await.ok().flatten()
    }

    /// Number of buffers ever pushed onto the input FIFO.
    pub fn n_input(&self) -> u64 {
        self.inner.n_input.load(Ordering::Relaxed)
    }

    /// Number of buffers ever pushed onto the output FIFO.
    pub fn n_output(&self) -> u64 {
        self.inner.n_output.load(Ordering::Relaxed)
    }

    /// Number of times the receiver found the input FIFO empty.
    pub fn n_underruns(&self) -> u64 {
        self.inner.n_underruns.load(Ordering::Relaxed)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_then_pop_input_round_trips() {
        let pool = BufferPool::new();
        pool.push_input(Buffer::new(16));
        let buf = pool.pop_input_blocking().await.expect("buffer");
        assert_eq!(buf.allocated_size(), 16);
        assert_eq!(pool.n_input(), 1);
    }

    #[tokio::test]
    async fn try_pop_input_counts_underrun_when_empty() {
        let pool = BufferPool::new();
        assert!(pool.try_pop_input().is_none());
        assert_eq!(pool.n_underruns(), 1);
    }

    #[tokio::test]
    async fn output_timeout_returns_none_when_nothing_pending() {
        let pool = BufferPool::new();
        let result = pool.pop_output_with_timeout(Duration::from_millis(10)).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn cloned_pool_shares_queues() {
        let pool = BufferPool::new();
        let other = pool.clone();
        other.push_output(Buffer::new(8));
        let buf = pool.pop_output_blocking().await.expect("buffer");
        assert_eq!(buf.allocated_size(), 8);
        assert_eq!(pool.n_output(), 1);
    }
}
