//! Container output consumers.

use std::sync::{Arc, Mutex};

pub use crate::engine::{OutputChunk, OutputStream};

/// Receives container output as it arrives.
///
/// Called from the forwarding task; implementations must not block.
pub trait OutputConsumer: Send + Sync {
    fn consume(&self, chunk: &OutputChunk);
}

impl<F> OutputConsumer for F
where
    F: Fn(&OutputChunk) + Send + Sync,
{
    fn consume(&self, chunk: &OutputChunk) {
        self(chunk)
    }
}

/// Output retained per container by default.
pub const DEFAULT_OUTPUT_CAPACITY: usize = 1024 * 1024;

#[derive(Debug, Default)]
struct Decoded {
    text: String,
    /// Trailing bytes of a character split across chunks.
    partial: Vec<u8>,
}

impl Decoded {
    fn push(&mut self, bytes: &[u8]) {
        self.partial.extend_from_slice(bytes);
        let pending = std::mem::take(&mut self.partial);
        let mut rest = pending.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    self.text.push_str(valid);
                    return;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // Checked by from_utf8 above.
                    self.text.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.partial = after.to_vec();
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Drop the oldest text so at most `capacity` bytes remain.
    fn trim_to(&mut self, capacity: usize) {
        if self.text.len() <= capacity {
            return;
        }
        let mut cut = self.text.len() - capacity;
        while !self.text.is_char_boundary(cut) {
            cut += 1;
        }
        self.text.drain(..cut);
    }
}

/// Accumulates combined output; cloning shares the buffer.
///
/// Bytes are decoded as UTF-8 across chunk boundaries. Only the most recent
/// `capacity` bytes of text are kept.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    inner: Arc<Mutex<Decoded>>,
    capacity: usize,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_OUTPUT_CAPACITY)
    }
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Decoded::default())),
            capacity,
        }
    }

    pub fn contents(&self) -> String {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).text.clone()
    }
}

impl OutputConsumer for OutputBuffer {
    fn consume(&self, chunk: &OutputChunk) {
        let mut decoded = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        decoded.push(&chunk.bytes);
        decoded.trim_to(self.capacity);
    }
}

/// Logs each output chunk at debug level under the container's name.
#[derive(Debug, Clone)]
pub struct TracingConsumer {
    name: String,
}

impl TracingConsumer {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl OutputConsumer for TracingConsumer {
    fn consume(&self, chunk: &OutputChunk) {
        for line in String::from_utf8_lossy(&chunk.bytes).lines() {
            match chunk.stream {
                OutputStream::Stdout => tracing::debug!("[{}] {}", self.name, line),
                OutputStream::Stderr => tracing::debug!("[{}:err] {}", self.name, line),
            }
        }
    }
}
