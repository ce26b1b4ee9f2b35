//! Server-Sent Events (SSE) listener and parser.
//!
//! The listener keeps a GET request open against the plugin's advertised event
//! stream, reconnecting with a capped backoff and resuming from the last seen
//! event id. JSON-RPC messages found in `data:` fields are handed to the
//! rmcp session, which answers requests and dispatches notifications.

use std::fmt::Display;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use reqwest::Client;
use reqwest::header::ACCEPT;
use rmcp::model::ServerJsonRpcMessage;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{SESSION_HEADER, apply_auth};
use crate::client::session::parse_server_message;
use crate::config::ResolvedAuth;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

pub(super) struct SseListener {
    pub(super) plugin_name: String,
    pub(super) client: Client,
    pub(super) url: Url,
    pub(super) auth: Option<ResolvedAuth>,
    pub(super) session_id: Option<String>,
    pub(super) incoming: mpsc::UnboundedSender<ServerJsonRpcMessage>,
    pub(super) cancel: CancellationToken,
}

/// Spawns a background task that listens on the event stream until cancelled.
pub(super) fn spawn_sse_listener(listener: SseListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_event_id: Option<String> = None;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            tokio::select! {
                _ = listener.cancel.cancelled() => break,
                () = listen_once(&listener, &mut last_event_id, &mut backoff) => {}
            }

            tokio::select! {
                _ = listener.cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = backoff.saturating_mul(2).min(MAX_BACKOFF);
        }
        tracing::debug!(target: "tendril_sse", plugin = %listener.plugin_name, "SSE listener stopped");
    })
}

async fn listen_once(listener: &SseListener, last_event_id: &mut Option<String>, backoff: &mut Duration) {
    let mut request = listener
        .client
        .get(listener.url.clone())
        .header(ACCEPT, "text/event-stream");
    request = apply_auth(request, listener.auth.as_ref());
    if let Some(session) = &listener.session_id {
        request = request.header(SESSION_HEADER, session);
    }
    if let Some(id) = last_event_id.as_deref() {
        request = request.header("Last-Event-ID", id);
    }

    match request.send().await {
        Ok(response) if response.status().is_success() => {
            *backoff = INITIAL_BACKOFF;
            let mut stream = response.bytes_stream();
            let result = process_sse_stream(&mut stream, last_event_id, |frame| {
                if let Some(message) = frame_message(&listener.plugin_name, frame) {
                    let _ = listener.incoming.send(message);
                }
            })
            .await;
            if let Err(error) = result {
                tracing::warn!(target: "tendril_sse", plugin = %listener.plugin_name, "SSE stream error: {}", error);
            }
        }
        Ok(response) => {
            tracing::warn!(target: "tendril_sse", plugin = %listener.plugin_name, "SSE request failed: {}", response.status());
        }
        Err(error) => {
            tracing::warn!(target: "tendril_sse", plugin = %listener.plugin_name, "SSE connect error: {}", error);
        }
    }
}

fn frame_message(plugin_name: &str, frame: SseFrame) -> Option<ServerJsonRpcMessage> {
    let data = frame.data?;
    let message = serde_json::from_str::<Value>(&data).ok().and_then(parse_server_message);
    if message.is_none() {
        tracing::debug!(target: "tendril_sse", plugin = %plugin_name, "ignoring SSE data: {}", data);
    }
    message
}

/// Reads frames off an SSE byte stream until it ends.
pub(super) async fn process_sse_stream<S, B, E>(
    stream: &mut S,
    last_event_id: &mut Option<String>,
    mut on_frame: impl FnMut(SseFrame),
) -> Result<(), String>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut buf = Vec::<u8>::new();
    while let Some(chunk) = stream.next().await {
        let bytes = chunk.map_err(|error| error.to_string())?;
        buf.extend_from_slice(bytes.as_ref());

        for frame in drain_frames(&mut buf) {
            if let Some(id) = &frame.id {
                *last_event_id = Some(id.clone());
            }
            on_frame(frame);
        }
    }
    Ok(())
}

/// Removes every complete frame from the front of `buf`.
pub(super) fn drain_frames(buf: &mut Vec<u8>) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    while let Some(end) = find_frame_end(buf) {
        if let Ok(text) = std::str::from_utf8(&buf[..end])
            && let Some(frame) = parse_sse_frame(text)
        {
            frames.push(frame);
        }
        let consumed = end + find_separator_len(&buf[end..]);
        buf.drain(..consumed);
    }
    frames
}

/// Parses a complete `text/event-stream` body, including an unterminated
/// final frame.
pub(super) fn parse_event_stream_body(body: &str) -> Vec<SseFrame> {
    let mut buf = body.as_bytes().to_vec();
    let mut frames = drain_frames(&mut buf);
    if let Ok(rest) = std::str::from_utf8(&buf)
        && let Some(frame) = parse_sse_frame(rest)
    {
        frames.push(frame);
    }
    frames
}

/// Finds the end of the first SSE frame in the buffer.
fn find_frame_end(buf: &[u8]) -> Option<usize> {
    (0..buf.len()).find(|&i| buf[i..].starts_with(b"\n\n") || buf[i..].starts_with(b"\r\n\r\n"))
}

/// Finds the length of the SSE frame separator.
fn find_separator_len(slice: &[u8]) -> usize {
    if slice.starts_with(b"\n\n") {
        2
    } else if slice.starts_with(b"\r\n\r\n") {
        4
    } else {
        0
    }
}

/// A single parsed SSE frame.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct SseFrame {
    pub(super) data: Option<String>,
    pub(super) id: Option<String>,
    pub(super) event: Option<String>,
    pub(super) retry: Option<u64>,
}

/// Parses a string slice into an `SseFrame`.
fn parse_sse_frame(frame_text: &str) -> Option<SseFrame> {
    let mut data_lines = Vec::new();
    let mut id: Option<String> = None;
    let mut event: Option<String> = None;
    let mut retry: Option<u64> = None;

    for line in frame_text.lines() {
        if line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        } else if let Some(rest) = line.strip_prefix("id:") {
            id = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("retry:") {
            retry = rest.trim().parse().ok();
        }
    }

    if data_lines.is_empty() && id.is_none() && event.is_none() && retry.is_none() {
        None
    } else {
        Some(SseFrame {
            data: (!data_lines.is_empty()).then(|| data_lines.join("\n")),
            id,
            event,
            retry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[test]
    fn parses_multi_line_data_and_fields() {
        let frames = parse_event_stream_body("id: 7\nevent: message\ndata: {\"a\":\ndata: 1}\nretry: 250\n\n: keepalive\n\n");
        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        assert_eq!(frame.id.as_deref(), Some("7"));
        assert_eq!(frame.event.as_deref(), Some("message"));
        assert_eq!(frame.data.as_deref(), Some("{\"a\":\n1}"));
        assert_eq!(frame.retry, Some(250));
    }

    #[test]
    fn handles_crlf_and_unterminated_tail() {
        let frames = parse_event_stream_body("data: one\r\n\r\ndata: two");
        let data: Vec<_> = frames.iter().filter_map(|frame| frame.data.as_deref()).collect();
        assert_eq!(data, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn frames_split_across_chunks_are_reassembled() {
        let chunks: Vec<Result<&[u8], String>> = vec![
            Ok(b"id: 1\ndata: {\"jsonrpc\":\"2.0\",".as_slice()),
            Ok(b"\"method\":\"notifications/tools/list_changed\"}\n".as_slice()),
            Ok(b"\nid: 2\ndata: x\n\n".as_slice()),
        ];
        let mut stream = stream::iter(chunks);
        let mut last_event_id = None;
        let mut frames = Vec::new();
        process_sse_stream(&mut stream, &mut last_event_id, |frame| frames.push(frame))
            .await
            .unwrap();

        assert_eq!(frames.len(), 2);
        assert!(frames[0].data.as_deref().unwrap().contains("list_changed"));
        assert_eq!(last_event_id.as_deref(), Some("2"));
    }

    #[test]
    fn only_json_rpc_frames_become_messages() {
        let frame = |data: Option<&str>| SseFrame {
            data: data.map(str::to_string),
            id: None,
            event: None,
            retry: None,
        };
        assert!(frame_message("p", frame(Some(r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#))).is_some());
        assert!(frame_message("p", frame(Some("not json"))).is_none());
        assert!(frame_message("p", frame(Some("[1,2]"))).is_none());
        assert!(frame_message("p", frame(None)).is_none());
    }
}
