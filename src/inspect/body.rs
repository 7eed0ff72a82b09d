//! Body reassembly
//!
//! Content rules (length checks, multipart parsing, decompression)
//! need the complete payload, so chunks are buffered per direction and
//! evaluation fires exactly once, on the end-of-stream chunk.

/// Growable per-direction buffer assembling streamed chunks.
#[derive(Debug, Default)]
pub struct BodyAccumulator {
    buf: Vec<u8>,
    complete: bool,
}

impl BodyAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk in arrival order. The accumulator is complete
    /// only once a chunk carries the end-of-stream flag.
    pub fn append(&mut self, chunk: &[u8], end_of_stream: bool) {
        self.buf.extend_from_slice(chunk);
        if end_of_stream {
            self.complete = true;
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
