//! Incremental decoder for OpenAI-style `text/event-stream` chat completions.
//!
//! Network chunks respect neither line nor UTF-8 boundaries, so raw bytes are
//! buffered and only complete lines are decoded.

/// A decoded stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Incremental content from `choices[0].delta.content`.
    Delta(String),
    /// The `[DONE]` sentinel.
    Done,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns every complete event they finished.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = parse_line(&String::from_utf8_lossy(&line)) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing line that never got its newline.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&String::from_utf8_lossy(&rest))
    }
}

fn parse_line(line: &str) -> Option<SseEvent> {
    let line = line.trim();
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    let json: serde_json::Value = serde_json::from_str(data).ok()?;
    let content = json["choices"][0]["delta"]["content"].as_str()?;
    if content.is_empty() {
        None
    } else {
        Some(SseEvent::Delta(content.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(text: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": text}}]})
        )
    }

    #[test]
    fn test_decodes_deltas_and_done() {
        let mut decoder = SseDecoder::new();
        let body = format!("{}{}data: [DONE]\n\n", delta("Hel"), delta("lo"));
        let events = decoder.push(body.as_bytes());
        assert_eq!(
            events,
            vec![
                SseEvent::Delta("Hel".into()),
                SseEvent::Delta("lo".into()),
                SseEvent::Done
            ]
        );
    }

    #[test]
    fn test_line_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        let line = delta("split");
        let (a, b) = line.as_bytes().split_at(10);
        assert!(decoder.push(a).is_empty());
        assert_eq!(decoder.push(b), vec![SseEvent::Delta("split".into())]);
    }

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        let line = delta("héllo");
        let cut = line.find('é').unwrap() + 1;
        let (a, b) = line.as_bytes().split_at(cut);
        assert!(decoder.push(a).is_empty());
        assert_eq!(decoder.push(b), vec![SseEvent::Delta("héllo".into())]);
    }

    #[test]
    fn test_ignores_keepalives_and_garbage() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b": keepalive\n\ndata: {not json}\n\nevent: ping\n");
        assert!(events.is_empty());
    }

    #[test]
    fn test_role_only_chunk_is_skipped() {
        let mut decoder = SseDecoder::new();
        let chunk = "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n";
        assert!(decoder.push(chunk.as_bytes()).is_empty());
    }

    #[test]
    fn test_finish_flushes_unterminated_line() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: [DONE]").is_empty());
        assert_eq!(decoder.finish(), Some(SseEvent::Done));
    }
}
