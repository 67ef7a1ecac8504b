//! Frame decoder for `data:`-prefixed, newline-delimited stream records.
//!
//! Fragments from the transport are appended to a buffer and only complete
//! lines are consumed; fragment boundaries need not line up with record
//! boundaries. A trailing partial line waits for the next fragment.

use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;

use crate::error::TransportError;
use crate::transport::FragmentStream;

/// Record marker at the start of every meaningful line.
pub const RECORD_MARKER: &str = "data:";

/// Payload that terminates the stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Application event decoded from one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Text to append to the assistant turn.
    ContentDelta(String),
    /// End of generation.
    Stop,
    /// A record whose payload could not be parsed. Carries the raw payload.
    MalformedFrame(String),
}

/// Structured record payload. Both the `choices[].delta` and the flat
/// `{content}` shapes are accepted, plus a `stop` flag.
#[derive(Debug, Default, Deserialize)]
struct Record {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    stop: bool,
}

#[derive(Debug, Default, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Option<Delta>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

impl Record {
    fn into_content(self) -> Option<String> {
        self.choices
            .into_iter()
            .next()
            .and_then(|c| c.delta)
            .and_then(|d| d.content)
            .or(self.content)
            .filter(|c| !c.is_empty())
    }
}

/// Incremental decoder for one stream.
///
/// Create a new decoder per turn; the retained partial line belongs to a
/// single stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: String,
    stopped: bool,
}

impl FrameDecoder {
    /// Create an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a `Stop` has been emitted. Once stopped, input is ignored.
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Bytes of the retained partial line.
    #[must_use]
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Feed one fragment and return the events of every line it completes.
    pub fn push(&mut self, fragment: &str) -> Vec<StreamEvent> {
        if self.stopped {
            return Vec::new();
        }
        self.buffer.push_str(fragment);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            self.decode_line(&line, &mut events);
            if self.stopped {
                self.buffer.clear();
                break;
            }
        }
        events
    }

    /// Signal end of input. A remaining unterminated line is decoded as the
    /// final line.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if !self.stopped && !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.decode_line(&line, &mut events);
        }
        self.buffer.clear();
        events
    }

    fn decode_line(&mut self, line: &str, events: &mut Vec<StreamEvent>) {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');
        let Some(payload) = line.strip_prefix(RECORD_MARKER) else {
            // Comments, keep-alives, `event:` lines and blank separators.
            return;
        };
        let payload = payload.strip_prefix(' ').unwrap_or(payload);
        if payload.is_empty() {
            return;
        }
        if payload == DONE_SENTINEL {
            events.push(StreamEvent::Stop);
            self.stopped = true;
            return;
        }

        match serde_json::from_str::<Record>(payload) {
            Ok(record) => {
                let stop = record.stop;
                if let Some(content) = record.into_content() {
                    events.push(StreamEvent::ContentDelta(content));
                }
                if stop {
                    events.push(StreamEvent::Stop);
                    self.stopped = true;
                }
            }
            Err(e) => {
                tracing::trace!(error = %e, payload = %payload, "Malformed stream record");
                events.push(StreamEvent::MalformedFrame(payload.to_string()));
            }
        }
    }
}

/// Adapt a fragment stream into a stream of decoded events.
///
/// The returned stream ends right after `Stop`, even if the transport has
/// more data, and forwards transport errors unchanged.
pub fn decode_stream(
    fragments: FragmentStream,
) -> BoxStream<'static, Result<StreamEvent, TransportError>> {
    struct State {
        fragments: FragmentStream,
        decoder: FrameDecoder,
        queue: std::collections::VecDeque<StreamEvent>,
        done: bool,
    }

    let state = State {
        fragments,
        decoder: FrameDecoder::new(),
        queue: std::collections::VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.queue.pop_front() {
                if event == StreamEvent::Stop {
                    state.queue.clear();
                    state.done = true;
                }
                return Some((Ok(event), state));
            }
            if state.done {
                return None;
            }
            match state.fragments.next().await {
                Some(Ok(fragment)) => state.queue.extend(state.decoder.push(&fragment)),
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
                None => {
                    state.queue.extend(state.decoder.finish());
                    state.done = true;
                }
            }
        }
    })
    .boxed()
}
