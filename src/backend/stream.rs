//! Server-sent-event framing and chunk coalescing for streamed completions.

use std::time::{Duration, Instant};

use serde_json::Value;

use crate::clock::SharedClock;

pub const COALESCE_MIN_CHARS: usize = 256;
pub const COALESCE_MAX_INTERVAL: Duration = Duration::from_millis(180);

#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    Data(Value),
    Done,
}

/// Splits a byte stream into `data:` events; partial lines wait for the next chunk.
#[derive(Debug, Default)]
pub struct SseParser {
    pending: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(newline) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            if let Some(event) = parse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Parses whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let line = std::mem::take(&mut self.pending);
        parse_line(&line)
    }
}

fn parse_line(line: &[u8]) -> Option<SseEvent> {
    let line = String::from_utf8_lossy(line);
    let payload = line.trim().strip_prefix("data:")?.trim();
    if payload.is_empty() {
        return None;
    }
    if payload == "[DONE]" {
        return Some(SseEvent::Done);
    }
    serde_json::from_str(payload).ok().map(SseEvent::Data)
}

/// Text carried by one streamed event.
pub fn event_delta(event: &Value) -> Option<&str> {
    let choice = event.get("choices")?.get(0)?;
    choice
        .pointer("/delta/content")
        .and_then(Value::as_str)
        .or_else(|| choice.get("text").and_then(Value::as_str))
        .or_else(|| choice.pointer("/message/content").and_then(Value::as_str))
}

pub fn event_model(event: &Value) -> Option<&str> {
    event
        .get("model")
        .and_then(Value::as_str)
        .filter(|model| !model.trim().is_empty())
}

/// Batches small deltas before they reach the caller.
///
/// The first delta is emitted at once; later ones are held until `min_chars`
/// have accumulated or `max_interval` has passed since the last emission.
#[derive(Debug)]
pub struct StreamCoalescer {
    buffer: String,
    buffered_chars: usize,
    last_emit: Option<Instant>,
    min_chars: usize,
    max_interval: Duration,
    clock: SharedClock,
}

impl StreamCoalescer {
    pub fn new(clock: SharedClock) -> Self {
        Self::with_limits(clock, COALESCE_MIN_CHARS, COALESCE_MAX_INTERVAL)
    }

    pub fn with_limits(clock: SharedClock, min_chars: usize, max_interval: Duration) -> Self {
        Self {
            buffer: String::new(),
            buffered_chars: 0,
            last_emit: None,
            min_chars,
            max_interval,
            clock,
        }
    }

    pub fn feed(&mut self, delta: &str) -> Option<String> {
        if delta.is_empty() {
            return None;
        }
        self.buffer.push_str(delta);
        self.buffered_chars += delta.chars().count();
        let now = self.clock.now();
        let due = match self.last_emit {
            None => true,
            Some(last) => {
                self.buffered_chars >= self.min_chars
                    || now.saturating_duration_since(last) >= self.max_interval
            }
        };
        if !due {
            return None;
        }
        self.last_emit = Some(now);
        self.take()
    }

    pub fn flush(&mut self) -> Option<String> {
        self.take()
    }

    fn take(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        self.buffered_chars = 0;
        Some(std::mem::take(&mut self.buffer))
    }
}
