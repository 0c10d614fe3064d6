//! Newline-delimited JSON framing.
//!
//! [`LineDecoder`] turns arbitrary stdout chunks into complete response
//! envelopes. A trailing partial line is buffered until the next chunk
//! completes it, so the decoder is correct no matter how the pipe splits
//! writes.

use serde_json::Value;

use super::error::{BridgeError, BridgeResult};
use super::protocol::{RequestEnvelope, ResponseEnvelope};

/// Encode one request as a single newline-terminated line.
pub fn encode_request(id: &str, payload: &Value) -> BridgeResult<Vec<u8>> {
    let envelope = RequestEnvelope { id, payload };
    let mut line = serde_json::to_vec(&envelope)
        .map_err(|e| BridgeError::InvalidRequest(e.to_string()))?;
    line.push(b'\n');
    Ok(line)
}

/// Buffered decoder for the worker's stdout stream.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    discarded: u64,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every envelope completed by it.
    ///
    /// Malformed lines (invalid JSON, missing id) are dropped and counted.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ResponseEnvelope> {
        self.buffer.extend_from_slice(chunk);

        let mut responses = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            if let Some(response) = self.decode_line(start, end) {
                responses.push(response);
            }
            start = end + 1;
        }
        self.buffer.drain(..start);
        responses
    }

    /// Bytes currently held for an incomplete line.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Number of lines discarded as malformed so far.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    fn decode_line(&mut self, start: usize, end: usize) -> Option<ResponseEnvelope> {
        let line = &self.buffer[start..end];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        match serde_json::from_slice::<ResponseEnvelope>(line) {
            Ok(response) if !response.id.is_empty() => Some(response),
            Ok(_) => {
                self.discarded += 1;
                None
            }
            Err(e) => {
                self.discarded += 1;
                tracing::trace!(target: "askbridge::worker", error = %e, "discarding malformed worker line");
                None
            }
        }
    }
}
