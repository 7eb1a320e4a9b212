//! Read buffers shared by all tunnel pumps

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Free buffers kept for reuse before extra ones are simply dropped
const DEFAULT_RETAINED: usize = 256;

/// Pool of fixed-size byte buffers
///
/// A pump checks a buffer out when it starts a read and hands it back once
/// the bytes have been written to the peer. Buffers go back to the pool when
/// the [`Checkout`] guard drops, so every exit path returns them exactly once.
#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    retained: usize,
    free: Mutex<Vec<Box<[u8]>>>,
    outstanding: AtomicUsize,
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Arc<Self> {
        Self::with_retained(buffer_size, DEFAULT_RETAINED)
    }

    pub fn with_retained(buffer_size: usize, retained: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer_size,
            retained,
            free: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn checkout(self: &Arc<Self>) -> Checkout {
        let reused = self.free.lock().unwrap_or_else(|e| e.into_inner()).pop();
        let buf = reused.unwrap_or_else(|| vec![0u8; self.buffer_size].into_boxed_slice());
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        Checkout {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    /// Buffers currently checked out
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Buffers waiting in the pool
    pub fn available(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn give_back(&self, buf: Box<[u8]>) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < self.retained {
            free.push(buf);
        }
    }
}

/// A buffer checked out of a [`BufferPool`]
#[derive(Debug)]
pub struct Checkout {
    buf: Option<Box<[u8]>>,
    pool: Arc<BufferPool>,
}

impl Deref for Checkout {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for Checkout {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(buf);
        }
    }
}
