//! Incremental decoder for `data:`-framed server-sent event streams.
//!
//! LLM providers stream completions as SSE where each event carries one
//! `data:` payload and the stream ends with a `data: [DONE]` sentinel.
//! The decoder consumes raw byte chunks (which may split lines
//! arbitrarily) and yields complete payloads in order.

/// Terminal sentinel payload used by chat-completion streams.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Incremental SSE `data:` payload decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes; returns the data payloads completed by it.
    ///
    /// Comment lines (leading `:`) and non-`data` fields are ignored.
    /// Consecutive `data:` lines belonging to one event are joined with
    /// a newline, per the SSE framing rules.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut payloads = Vec::new();
        let mut pending: Vec<String> = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !pending.is_empty() {
                    payloads.push(pending.join("\n"));
                    pending.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            if let Some(value) = line.strip_prefix("data:") {
                pending.push(value.strip_prefix(' ').unwrap_or(value).to_owned());
            }
        }

        // Events are only complete at a blank line; keep any partial
        // event buffered, in order, ahead of the partial line.
        if !pending.is_empty() {
            let mut prefix = String::new();
            for line in &pending {
                prefix.push_str("data: ");
                prefix.push_str(line);
                prefix.push('\n');
            }
            self.buffer.insert_str(0, &prefix);
        }

        payloads
    }

    /// Flush a trailing payload after the stream ends without a final
    /// blank line.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let mut pending = Vec::new();
        for line in rest.lines() {
            let line = line.trim_end_matches('\r');
            if let Some(value) = line.strip_prefix("data:") {
                pending.push(value.strip_prefix(' ').unwrap_or(value).to_owned());
            }
        }
        if pending.is_empty() {
            None
        } else {
            Some(pending.join("\n"))
        }
    }
}

/// Whether a payload is the terminal `[DONE]` sentinel.
pub fn is_done(payload: &str) -> bool {
    payload.trim() == DONE_SENTINEL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_event() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.feed(b"data: {\"a\":1}\n\n");
        assert_eq!(payloads, vec!["{\"a\":1}".to_owned()]);
    }

    #[test]
    fn multiple_events_one_chunk() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.feed(b"data: one\n\ndata: two\n\n");
        assert_eq!(payloads, vec!["one".to_owned(), "two".to_owned()]);
    }

    #[test]
    fn event_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: hel").is_empty());
        let payloads = decoder.feed(b"lo\n\n");
        assert_eq!(payloads, vec!["hello".to_owned()]);
    }

    #[test]
    fn blank_line_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: hello\n").is_empty());
        let payloads = decoder.feed(b"\n");
        assert_eq!(payloads, vec!["hello".to_owned()]);
    }

    #[test]
    fn multi_line_data_joined() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.feed(b"data: line1\ndata: line2\n\n");
        assert_eq!(payloads, vec!["line1\nline2".to_owned()]);
    }

    #[test]
    fn comments_and_other_fields_ignored() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.feed(b": keepalive\nevent: delta\nretry: 100\ndata: x\n\n");
        assert_eq!(payloads, vec!["x".to_owned()]);
    }

    #[test]
    fn crlf_lines() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.feed(b"data: hello\r\n\r\n");
        assert_eq!(payloads, vec!["hello".to_owned()]);
    }

    #[test]
    fn no_space_after_colon() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.feed(b"data:tight\n\n");
        assert_eq!(payloads, vec!["tight".to_owned()]);
    }

    #[test]
    fn finish_flushes_trailing_payload() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: trailing\n").is_empty());
        assert_eq!(decoder.finish().as_deref(), Some("trailing"));
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn finish_empty_stream() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn done_sentinel_detection() {
        assert!(is_done("[DONE]"));
        assert!(is_done(" [DONE] "));
        assert!(!is_done("{\"done\":true}"));
    }

    #[test]
    fn done_arrives_as_ordinary_payload() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.feed(b"data: {\"x\":1}\n\ndata: [DONE]\n\n");
        assert_eq!(payloads.len(), 2);
        assert!(is_done(&payloads[1]));
    }
}
