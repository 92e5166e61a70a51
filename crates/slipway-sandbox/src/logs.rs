//! Bounded build log capture

use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use slipway_core::LogStream;

const TRUNCATED_MARKER: &str = "[earlier output truncated]\n";

/// Keeps the most recent `max_bytes` of output
#[derive(Debug, Clone)]
pub struct LogBuffer {
    inner: Arc<Mutex<Captured>>,
}

#[derive(Debug)]
struct Captured {
    text: String,
    max_bytes: usize,
    truncated: bool,
}

impl LogBuffer {
    /// Create new buffer
    #[must_use]
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Captured {
                text: String::new(),
                max_bytes: max_bytes.max(1),
                truncated: false,
            })),
        }
    }

    /// Append a chunk, dropping the oldest output past the cap
    pub fn push(&self, chunk: &str) {
        let mut captured = self.inner.lock();
        captured.text.push_str(chunk);

        let excess = captured.text.len().saturating_sub(captured.max_bytes);
        if excess > 0 {
            let mut cut = excess;
            while !captured.text.is_char_boundary(cut) {
                cut += 1;
            }
            captured.text.drain(..cut);
            captured.truncated = true;
        }
    }

    /// Everything captured so far
    #[must_use]
    pub fn snapshot(&self) -> String {
        let captured = self.inner.lock();
        if captured.truncated {
            format!("{TRUNCATED_MARKER}{}", captured.text)
        } else {
            captured.text.clone()
        }
    }

    /// Drain `stream` into the buffer until it ends or errors
    pub async fn collect(&self, mut stream: LogStream) {
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(text) => self.push(&text),
                Err(e) => {
                    tracing::debug!(error = %e, "log stream ended with error");
                    break;
                }
            }
        }
    }
}
