//! Reassembly of complete lines from arbitrary output chunks.
//!
//! Engine processes are not guaranteed to line-buffer their output, so a read may end
//! in the middle of a line (or of a multi-byte UTF-8 sequence). Bytes are held until a
//! newline arrives.

/// Buffers bytes for one stream and yields complete lines.
#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: Vec<u8>,
}

impl LineAssembler {
    /// Feed a chunk, returning every line completed by it (without the newline).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                lines.push(decode_line(&self.pending));
                self.pending.clear();
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// Flush the trailing partial line at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = decode_line(&self.pending);
        self.pending.clear();
        Some(line)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
