use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};

use redline_core::error::{RedlineError, Result};
use redline_core::types::StreamDelta;

/// One `text/event-stream` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` parser.
///
/// Bytes are buffered until a blank line closes an event, so a multi-byte
/// character split across network chunks decodes intact.
#[derive(Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every event it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(event) = parse_block(&String::from_utf8_lossy(&block)) {
                events.push(event);
            }
        }
        events
    }
}

/// Fields of one event block. Blocks with no `data:` line are dropped.
fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event_type = None;
    let mut data: Option<String> = None;

    for line in block.lines().filter(|l| !l.starts_with(':')) {
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event_type = Some(value.to_string()),
            "data" => match data.as_mut() {
                Some(buf) => {
                    buf.push('\n');
                    buf.push_str(value);
                }
                None => data = Some(value.to_string()),
            },
            _ => {}
        }
    }

    data.map(|data| SseEvent { event_type, data })
}

/// Adapts a response body into SSE events. A transport error ends the
/// stream with `LlmStream` so callers can retry.
pub struct SseStream<S> {
    body: S,
    parser: SseParser,
    ready: VecDeque<SseEvent>,
    done: bool,
}

impl<S> SseStream<S> {
    pub fn new(body: S) -> Self {
        Self {
            body,
            parser: SseParser::new(),
            ready: VecDeque::new(),
            done: false,
        }
    }
}

impl<S> Stream for SseStream<S>
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Unpin,
{
    type Item = Result<SseEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(event) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if this.done {
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.body).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => this.ready.extend(this.parser.feed(&chunk)),
                Poll::Ready(Some(Err(e))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(RedlineError::LlmStream(e.to_string()))));
                }
                Poll::Ready(None) => this.done = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Fail with the status and body text when the response is not a success.
pub async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown error".to_string());
    Err(RedlineError::LlmRequest(format!("HTTP {}: {}", status, body)))
}

/// Turn a streaming response into deltas, mapping each event with `parse`.
pub fn into_deltas<'a, F, I>(response: reqwest::Response, parse: F) -> BoxStream<'a, Result<StreamDelta>>
where
    F: Fn(SseEvent) -> I + Send + 'a,
    I: IntoIterator<Item = Result<StreamDelta>>,
    I::IntoIter: Send + 'a,
{
    SseStream::new(response.bytes_stream())
        .flat_map(move |item| match item {
            Ok(event) => stream::iter(parse(event).into_iter().collect::<Vec<_>>()),
            Err(e) => stream::iter(vec![Err(e)]),
        })
        .boxed()
}
