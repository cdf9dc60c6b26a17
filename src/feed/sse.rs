use crate::error::AppError;
use reqwest::header::ACCEPT;
use reqwest::{Client, Response};

/// Event name used when the stream omits an `event:` field.
const DEFAULT_EVENT_NAME: &str = "message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub topic: String,
    pub payload: String,
}

pub async fn connect_feed(client: &Client, endpoint: &str) -> Result<Response, AppError> {
    let response = client
        .get(endpoint)
        .header(ACCEPT, "text/event-stream")
        .send()
        .await?
        .error_for_status()?;
    Ok(response)
}

/// Incremental `text/event-stream` decoder. Chunks are buffered until a
/// complete line is available; a blank line dispatches the accumulated
/// frame. Frames without data are dropped per the SSE processing model.
#[derive(Debug, Default)]
pub struct SseFrameDecoder {
    buffer: Vec<u8>,
    event_name: Option<String>,
    data_lines: Vec<String>,
}

impl SseFrameDecoder {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<RawEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline_pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<RawEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event_name = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            // `id` and `retry` carry no meaning for this feed.
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<RawEvent> {
        let event_name = self.event_name.take();
        if self.data_lines.is_empty() {
            return None;
        }

        let payload = self.data_lines.join("\n");
        self.data_lines.clear();

        Some(RawEvent {
            topic: event_name.unwrap_or_else(|| DEFAULT_EVENT_NAME.to_string()),
            payload,
        })
    }
}
