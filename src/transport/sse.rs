//! Server-sent event framing for stream backends.
//!
//! Splits an HTTP body into events on blank lines and folds `event:`,
//! `data:` and `id:` fields. Comment lines (`:keep-alive`) are dropped.

use futures::stream::{self, Stream, StreamExt};

/// One dispatched SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type; `message` when the block carried no `event:` field.
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

/// Parse a single event block (without the trailing blank line).
///
/// Returns `None` for blocks that carry no data, such as keep-alives.
pub fn parse_event(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();
    let mut id = None;

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            "id" => id = Some(value.to_string()),
            _ => {}
        }
    }

    if data.is_empty() {
        return None;
    }
    Some(SseEvent {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data.join("\n"),
        id,
    })
}

fn find_boundary(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

/// Turn a byte stream into a stream of events.
///
/// Ends when the body ends; a read error is yielded once and then the
/// stream ends.
pub fn parse_event_stream<S, B, E>(byte_stream: S) -> impl Stream<Item = Result<SseEvent, String>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let byte_stream = Box::pin(byte_stream);

    stream::unfold(
        (byte_stream, Vec::<u8>::new(), false),
        |(mut byte_stream, mut buffer, finished)| async move {
            if finished {
                return None;
            }
            loop {
                // Drain complete events already buffered
                if let Some(end) = find_boundary(&buffer) {
                    let block: Vec<u8> = buffer.drain(..end + 2).collect();
                    let text = String::from_utf8_lossy(&block[..end]).into_owned();
                    match parse_event(&text) {
                        Some(event) => return Some((Ok(event), (byte_stream, buffer, false))),
                        None => continue,
                    }
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => {
                        buffer.extend(bytes.as_ref().iter().copied().filter(|b| *b != b'\r'));
                    }
                    Some(Err(e)) => {
                        return Some((
                            Err(format!("stream read error: {e}")),
                            (byte_stream, buffer, true),
                        ));
                    }
                    None => {
                        // Body ended, flush a final unterminated event
                        let rest = String::from_utf8_lossy(&buffer).into_owned();
                        buffer.clear();
                        return parse_event(rest.trim())
                            .map(|event| (Ok(event), (byte_stream, buffer, true)));
                    }
                }
            }
        },
    )
}
