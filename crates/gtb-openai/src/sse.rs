//! Line buffering for the `text/event-stream` body of streamed chat completions.

/// One SSE line of interest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// `data:` payload, prefix stripped.
    Data(String),
    /// `data: [DONE]`.
    Done,
}

/// Accumulates raw body bytes and yields complete events.
///
/// Network chunks do not line up with event boundaries (nor with UTF-8 boundaries), so
/// bytes are kept until a full line is available.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(ev) = parse_line(&String::from_utf8_lossy(&line)) {
                events.push(ev);
            }
        }
        events
    }

    /// Parse whatever is left once the body ended without a trailing newline.
    pub fn flush(&mut self) -> Vec<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&String::from_utf8_lossy(&rest))
            .into_iter()
            .collect()
    }
}

fn parse_line(line: &str) -> Option<SseEvent> {
    let line = line.trim();
    // Blank separators, comments and non-data fields (event:, id:, retry:).
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    Some(SseEvent::Data(data.to_string()))
}
