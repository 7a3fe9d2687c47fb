// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Buffered measurement writer.
//!
//! Decouples real-time measurement producers from the collection transport.
//! Producers append encoded records into a bounded chunk chain; a dedicated
//! drain thread writes the tail of the chain into an [`OutStream`],
//! reconnecting and retrying as needed.
//!
//! Back-pressure policy: when the queue is full, the oldest measurement
//! chunks are dropped to make room. Metadata (headers, schema definitions)
//! is never dropped; it is additionally accumulated into a prologue that is
//! replayed ahead of measurement bytes whenever the transport is
//! (re)established.

mod chain;

use crate::stream::OutStream;
use chain::Chain;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

const MIN_CHUNK_SIZE: usize = 64;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);
/// How long `close` keeps retrying a failing transport before dropping the
/// remaining queue.
const CLOSE_FLUSH_DEADLINE: Duration = Duration::from_secs(5);

/// Queue counters, taken under the writer lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Bytes currently held, including a chunk the drain has in flight.
    pub bytes_queued: usize,
    /// Measurement chunks evicted by back-pressure so far.
    pub chunks_dropped: u64,
    /// Measurement bytes evicted by back-pressure so far.
    pub bytes_dropped: u64,
}

struct Inner {
    chain: Chain,
    /// Accumulated header/schema bytes, replayed on every fresh transport.
    meta: Vec<u8>,
    active: bool,
}

struct WriterState {
    inner: Mutex<Inner>,
    /// Producers signal the drain thread.
    data_ready: Condvar,
    /// The drain thread (and reclaims) signal blocked producers.
    space_free: Condvar,
    capacity: usize,
}

/// Bounded producer/consumer byte queue with a dedicated drain thread.
pub struct BufferedWriter {
    state: Arc<WriterState>,
    drain: Option<JoinHandle<()>>,
}

impl BufferedWriter {
    /// Create a writer draining into `stream`, with `queue_capacity` bytes
    /// of buffer split into `chunk_count` chunks. The stream is owned by
    /// the writer (and its drain thread) from here on.
    pub fn create(
        stream: Box<dyn OutStream>,
        queue_capacity: usize,
        chunk_count: usize,
    ) -> BufferedWriter {
        let chunk_size = (queue_capacity / chunk_count.max(1)).max(MIN_CHUNK_SIZE);
        let capacity = queue_capacity.max(chunk_size);
        let state = Arc::new(WriterState {
            inner: Mutex::new(Inner {
                chain: Chain::new(chunk_size),
                meta: Vec::new(),
                active: true,
            }),
            data_ready: Condvar::new(),
            space_free: Condvar::new(),
            capacity,
        });

        let drain_state = Arc::clone(&state);
        let drain = thread::spawn(move || drain_loop(drain_state, stream));

        BufferedWriter {
            state,
            drain: Some(drain),
        }
    }

    /// Append measurement bytes without blocking.
    ///
    /// When the queue is full, the oldest measurement chunks are evicted to
    /// make room; metadata is never touched. Returns the number of bytes
    /// accepted, which is zero when the queue is entirely metadata.
    pub fn push(&self, data: &[u8]) -> usize {
        let mut inner = self.state.inner.lock();
        if !inner.active {
            return 0;
        }

        let queued = inner.chain.bytes_queued();
        if queued + data.len() > self.state.capacity {
            let needed = queued + data.len() - self.state.capacity;
            if inner.chain.reclaim(needed) > 0 {
                // Eviction is chunk-granular and can free more than this
                // push consumes.
                self.state.space_free.notify_all();
            }
        }
        let space = self.state.capacity.saturating_sub(inner.chain.bytes_queued());
        let take = space.min(data.len());
        if take > 0 {
            inner.chain.append(&data[..take], false);
            self.state.data_ready.notify_one();
        }
        take
    }

    /// Append measurement bytes, waiting for space instead of dropping.
    ///
    /// Returns the number of bytes accepted, which is short only when the
    /// writer is closed while waiting.
    pub fn push_blocking(&self, data: &[u8]) -> usize {
        let mut inner = self.state.inner.lock();
        let mut written = 0;
        while written < data.len() {
            if !inner.active {
                break;
            }
            let space = self
                .state
                .capacity
                .saturating_sub(inner.chain.bytes_queued());
            let take = space.min(data.len() - written);
            if take > 0 {
                inner.chain.append(&data[written..written + take], false);
                written += take;
                self.state.data_ready.notify_one();
            } else {
                self.state.space_free.wait(&mut inner);
            }
        }
        written
    }

    /// Append metadata bytes.
    ///
    /// The bytes are recorded into the replay prologue and queued in-band
    /// like measurements, but in chunks that back-pressure will never evict.
    /// If the queue holds nothing evictable, the caller blocks until the
    /// drain frees space. Returns the bytes accepted (short only on close).
    pub fn push_meta(&self, data: &[u8]) -> usize {
        let mut inner = self.state.inner.lock();
        if !inner.active {
            return 0;
        }
        inner.meta.extend_from_slice(data);

        let mut written = 0;
        while written < data.len() {
            if !inner.active {
                break;
            }
            let queued = inner.chain.bytes_queued();
            let remaining = data.len() - written;
            if queued + remaining > self.state.capacity {
                let needed = queued + remaining - self.state.capacity;
                if inner.chain.reclaim(needed) > 0 {
                    self.state.space_free.notify_all();
                }
            }
            let space = self
                .state
                .capacity
                .saturating_sub(inner.chain.bytes_queued());
            let take = space.min(remaining);
            if take > 0 {
                inner.chain.append(&data[written..written + take], true);
                written += take;
                self.state.data_ready.notify_one();
            } else {
                self.state.space_free.wait(&mut inner);
            }
        }
        written
    }

    /// Lock the queue and hand the encoding layer a direct append handle.
    ///
    /// The writer lock is held for the lifetime of the returned guard; the
    /// drain thread is signalled when it drops.
    pub fn write_buf(&self) -> WriteBuf<'_> {
        WriteBuf {
            inner: Some(self.state.inner.lock()),
            state: &self.state,
            appended: false,
        }
    }

    /// Current queue counters.
    pub fn stats(&self) -> WriterStats {
        let inner = self.state.inner.lock();
        WriterStats {
            bytes_queued: inner.chain.bytes_queued(),
            chunks_dropped: inner.chain.chunks_dropped(),
            bytes_dropped: inner.chain.bytes_dropped(),
        }
    }

    /// Stop accepting data, flush what is queued (best effort, bounded by
    /// [`CLOSE_FLUSH_DEADLINE`]), join the drain thread and release the
    /// stream.
    pub fn close(mut self) {
        self.shutdown();
    }

    /// Stop accepting data and wake everyone; the drain thread proceeds to
    /// its bounded final flush.
    fn deactivate(&self) {
        self.state.inner.lock().active = false;
        self.state.data_ready.notify_all();
        self.state.space_free.notify_all();
    }

    fn shutdown(&mut self) {
        self.deactivate();
        if let Some(handle) = self.drain.take() {
            if handle.join().is_err() {
                error!("drain thread panicked");
            }
        }
    }
}

impl Drop for BufferedWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// RAII handle for formatting bytes straight into the queue head.
pub struct WriteBuf<'a> {
    inner: Option<parking_lot::MutexGuard<'a, Inner>>,
    state: &'a WriterState,
    appended: bool,
}

impl WriteBuf<'_> {
    /// Append measurement bytes under the held lock. Same back-pressure
    /// policy as [`BufferedWriter::push`].
    pub fn push_bytes(&mut self, data: &[u8]) -> usize {
        let Some(inner) = self.inner.as_mut() else {
            return 0;
        };
        if !inner.active {
            return 0;
        }
        let queued = inner.chain.bytes_queued();
        if queued + data.len() > self.state.capacity {
            let needed = queued + data.len() - self.state.capacity;
            if inner.chain.reclaim(needed) > 0 {
                self.state.space_free.notify_all();
            }
        }
        let space = self.state.capacity.saturating_sub(inner.chain.bytes_queued());
        let take = space.min(data.len());
        if take > 0 {
            inner.chain.append(&data[..take], false);
            self.appended = true;
        }
        take
    }
}

impl Drop for WriteBuf<'_> {
    fn drop(&mut self) {
        let appended = self.appended;
        drop(self.inner.take());
        if appended {
            self.state.data_ready.notify_one();
        }
    }
}

fn drain_loop(state: Arc<WriterState>, mut stream: Box<dyn OutStream>) {
    let mut backoff = INITIAL_BACKOFF;
    let mut closing_since: Option<Instant> = None;

    loop {
        // Wait for a chunk (or shutdown) and snapshot the prologue.
        let (chunk, meta) = {
            let mut inner = state.inner.lock();
            loop {
                if let Some(chunk) = inner.chain.pop_tail() {
                    break (Some(chunk), inner.meta.clone());
                }
                if !inner.active {
                    break (None, Vec::new());
                }
                state.data_ready.wait(&mut inner);
            }
        };

        let Some(chunk) = chunk else {
            break;
        };

        if closing_since.is_none() && !state.inner.lock().active {
            closing_since = Some(Instant::now());
        }

        match stream.write(&chunk.buf, &meta) {
            Ok(_) => {
                backoff = INITIAL_BACKOFF;
                let mut inner = state.inner.lock();
                inner.chain.recycle(chunk);
                drop(inner);
                state.space_free.notify_all();
            }
            Err(e) if e.is_recoverable() => {
                debug!("write to {} failed, backing off {:?}: {e}", stream.dest(), backoff);
                let mut inner = state.inner.lock();
                inner.chain.restore_tail(chunk);

                if let Some(since) = closing_since {
                    if since.elapsed() >= CLOSE_FLUSH_DEADLINE {
                        let queued = inner.chain.bytes_queued();
                        warn!("dropping {queued} unflushed bytes for {}", stream.dest());
                        inner.chain.clear();
                        break;
                    }
                }

                // Interruptible back-off: close() signals data_ready.
                let _ = state.data_ready.wait_for(&mut inner, backoff);
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            Err(e) => {
                error!(
                    "dropping {} bytes after fatal error on {}: {e}",
                    chunk.buf.len(),
                    stream.dest()
                );
                let mut inner = state.inner.lock();
                inner.chain.recycle(chunk);
                drop(inner);
                state.space_free.notify_all();
            }
        }
    }

    if let Err(e) = stream.close() {
        warn!("closing {} failed: {e}", stream.dest());
    }
}
