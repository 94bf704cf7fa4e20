//! The shared write buffer and its two-buffer ping-pong.
//!
//! Callers stage small packets in the shared buffer under the buffer lock;
//! the writer task swaps the whole buffer out and drains it to the socket
//! outside the lock, so callers never block on socket I/O and the socket
//! write never holds the buffer lock. Large packets bypass the buffer
//! entirely (the direct path, selected in the engine).

use crate::error::ClientError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, timeout};

pub(crate) struct WriteBuffers {
    shared: Mutex<Vec<u8>>,
    capacity: usize,
    not_empty: Notify,
    empty: Notify,
}

#[inline]
pub(crate) fn use_direct(len: usize, capacity: usize, factor: f64) -> bool {
    len as f64 >= capacity as f64 * factor
}

impl WriteBuffers {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            not_empty: Notify::new(),
            empty: Notify::new(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stages `packet` in the shared buffer. Waits at most `wait` for the
    /// buffer lock and then for enough room, re-checking elapsed time; a
    /// packet that can never fit fails immediately.
    pub async fn shared_write(&self, packet: &[u8], wait: Duration) -> Result<(), ClientError> {
        if packet.len() > self.capacity {
            return Err(ClientError::Usage(format!(
                "packet of {} bytes exceeds the shared buffer capacity {}",
                packet.len(),
                self.capacity
            )));
        }
        let start = Instant::now();
        let mut shared = timeout(wait, self.shared.lock())
            .await
            .map_err(|_| ClientError::TimedWrite("shared buffer lock"))?;
        while self.capacity - shared.len() < packet.len() {
            let remaining = wait
                .checked_sub(start.elapsed())
                .filter(|d| !d.is_zero())
                .ok_or(ClientError::TimedWrite("empty buffer"))?;
            let emptied = self.empty.notified();
            tokio::pin!(emptied);
            emptied.as_mut().enable();
            drop(shared);
            if timeout(remaining, emptied).await.is_err() {
                return Err(ClientError::TimedWrite("empty buffer"));
            }
            let remaining = wait
                .checked_sub(start.elapsed())
                .filter(|d| !d.is_zero())
                .ok_or(ClientError::TimedWrite("empty buffer"))?;
            shared = timeout(remaining, self.shared.lock())
                .await
                .map_err(|_| ClientError::TimedWrite("shared buffer lock"))?;
        }
        shared.extend_from_slice(packet);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Writer side: waits until the shared buffer has bytes, then swaps its
    /// contents into `out` and signals waiting producers. Returns false once
    /// `stopped` is raised.
    pub async fn wait_take(
        &self, out: &mut Vec<u8>, stop: &Notify, stopped: &AtomicBool,
    ) -> bool {
        debug_assert!(out.is_empty());
        loop {
            let stop_signal = stop.notified();
            tokio::pin!(stop_signal);
            stop_signal.as_mut().enable();
            if stopped.load(Ordering::Acquire) {
                return false;
            }
            {
                let mut shared = self.shared.lock().await;
                if !shared.is_empty() {
                    std::mem::swap(out, &mut *shared);
                    self.empty.notify_waiters();
                    return true;
                }
                let filled = self.not_empty.notified();
                tokio::pin!(filled);
                filled.as_mut().enable();
                drop(shared);
                tokio::select! {
                    _ = filled => {}
                    _ = stop_signal => return false,
                }
            }
        }
    }

    /// Empties the buffer and wakes every producer blocked on room; part of
    /// connection death and of connection setup.
    pub async fn clear(&self) {
        let mut shared = self.shared.lock().await;
        shared.clear();
        self.empty.notify_waiters();
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.shared.lock().await.len()
    }
}
