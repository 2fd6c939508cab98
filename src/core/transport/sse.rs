//! Server-sent event framing and the per-response SSE writer.
//!
//! Frames are pushed through a single-slot queue to one background task that
//! owns the byte stream, so concurrent senders can never interleave bytes of
//! two frames.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::message::JsonRpcMessage;
use super::{TransportError, TransportResult};

/// Event type of frames carrying a serialized message.
pub const EVENT_MESSAGE: &str = "message";

/// Event type of the frame announcing the message endpoint.
pub const EVENT_ENDPOINT: &str = "endpoint";

/// One server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Named event type; readers treat `None` as "message".
    pub event: Option<String>,
    /// Payload; may span several lines.
    pub data: String,
}

impl SseEvent {
    /// A `message` event carrying one serialized JSON-RPC message.
    pub fn message(message: &JsonRpcMessage) -> TransportResult<Self> {
        Ok(Self {
            event: Some(EVENT_MESSAGE.to_string()),
            data: serde_json::to_string(message)?,
        })
    }

    /// An `endpoint` event carrying a URI as raw text.
    pub fn endpoint(uri: impl Into<String>) -> Self {
        Self {
            event: Some(EVENT_ENDPOINT.to_string()),
            data: uri.into(),
        }
    }

    /// Encode as wire text, terminated by the blank dispatch line.
    pub fn encode(&self) -> String {
        let mut frame = String::with_capacity(self.data.len() + 32);
        if let Some(event) = &self.event {
            frame.push_str("event: ");
            frame.push_str(event);
            frame.push('\n');
        }
        for line in self.data.split('\n') {
            frame.push_str("data: ");
            frame.push_str(line.strip_suffix('\r').unwrap_or(line));
            frame.push('\n');
        }
        frame.push('\n');
        frame
    }

    /// Decode the `data` payload of a `message` event.
    pub fn to_message(&self) -> TransportResult<JsonRpcMessage> {
        JsonRpcMessage::from_slice(self.data.as_bytes())
    }

    /// Parse a complete event stream.
    ///
    /// Follows the event-stream interpretation rules: comment lines are
    /// skipped, `data` lines accumulate, and a blank line dispatches the
    /// event if any data was seen. A trailing event without its blank line is
    /// dropped.
    pub fn parse_stream(input: &str) -> Vec<SseEvent> {
        let mut events = Vec::new();
        let mut event_type: Option<String> = None;
        let mut data: Option<String> = None;

        for raw in input.split_inclusive('\n') {
            // A final line without its terminator is incomplete.
            let Some(line) = raw.strip_suffix('\n') else {
                break;
            };
            let line = line.strip_suffix('\r').unwrap_or(line);

            if line.is_empty() {
                if let Some(payload) = data.take() {
                    events.push(SseEvent {
                        event: event_type.take(),
                        data: payload,
                    });
                }
                event_type = None;
                continue;
            }

            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };

            match field {
                "event" => event_type = Some(value.to_string()),
                "data" => match data.as_mut() {
                    Some(buffer) => {
                        buffer.push('\n');
                        buffer.push_str(value);
                    }
                    None => data = Some(value.to_string()),
                },
                _ => {}
            }
        }

        events
    }
}

/// Wire units accepted by the writer task.
#[derive(Debug)]
enum Frame {
    Event(SseEvent),
    Comment(String),
}

impl Frame {
    fn encode(&self) -> String {
        match self {
            Self::Event(event) => event.encode(),
            Self::Comment(text) => format!(": {text}\n\n"),
        }
    }
}

/// Writes SSE frames to one byte stream.
pub struct SseWriter {
    sender: Mutex<Option<mpsc::Sender<Frame>>>,
    task: Mutex<Option<JoinHandle<std::io::Result<()>>>>,
    disposing: AtomicBool,
    shutdown: CancellationToken,
}

impl SseWriter {
    /// Start a writer task that owns `stream`.
    pub fn new<W>(stream: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (sender, frames) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(write_frames(stream, frames, shutdown.clone()));

        Self {
            sender: Mutex::new(Some(sender)),
            task: Mutex::new(Some(task)),
            disposing: AtomicBool::new(false),
            shutdown,
        }
    }

    /// Queue one `message` event.
    ///
    /// Fails with [`TransportError::Closed`] once disposal has begun or the
    /// underlying stream has gone away.
    pub async fn send_message(&self, message: &JsonRpcMessage) -> TransportResult<()> {
        self.send_frame(Frame::Event(SseEvent::message(message)?))
            .await
    }

    /// Queue the `endpoint` event.
    pub async fn send_endpoint(&self, uri: &str) -> TransportResult<()> {
        self.send_frame(Frame::Event(SseEvent::endpoint(uri))).await
    }

    /// Queue a comment line, ignored by readers (used as keep-alive).
    pub async fn send_comment(&self, text: &str) -> TransportResult<()> {
        self.send_frame(Frame::Comment(text.to_string())).await
    }

    async fn send_frame(&self, frame: Frame) -> TransportResult<()> {
        if self.is_disposing() {
            return Err(TransportError::Closed);
        }

        let sender = self.sender.lock().await.clone();
        let Some(sender) = sender else {
            return Err(TransportError::Closed);
        };

        sender.send(frame).await.map_err(|_| TransportError::Closed)
    }

    /// Whether disposal has begun.
    pub fn is_disposing(&self) -> bool {
        self.disposing.load(Ordering::Acquire)
    }

    /// Complete the queue and wait for every queued frame to be written.
    ///
    /// The stream is closed when this returns. Calling it again is a no-op.
    pub async fn dispose(&self) -> TransportResult<()> {
        self.disposing.store(true, Ordering::Release);
        self.sender.lock().await.take();

        let Some(task) = self.task.lock().await.take() else {
            return Ok(());
        };

        match task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransportError::IoError(e)),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(TransportError::connection(format!("SSE writer task failed: {e}"))),
        }
    }

    /// Stop writing immediately, dropping queued frames, then dispose.
    pub async fn shutdown(&self) -> TransportResult<()> {
        self.shutdown.cancel();
        self.dispose().await
    }
}

async fn write_frames<W>(
    mut stream: W,
    mut frames: mpsc::Receiver<Frame>,
    shutdown: CancellationToken,
) -> std::io::Result<()>
where
    W: AsyncWrite + Send + Unpin,
{
    let written = pump(&mut stream, &mut frames, &shutdown).await;
    let closed = stream.shutdown().await;

    if shutdown.is_cancelled() {
        debug!("SSE writer stopped by shutdown");
        return Ok(());
    }

    written.and(closed)
}

async fn pump<W>(
    stream: &mut W,
    frames: &mut mpsc::Receiver<Frame>,
    shutdown: &CancellationToken,
) -> std::io::Result<()>
where
    W: AsyncWrite + Send + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => return Ok(()),
            },
        };

        let bytes = frame.encode();
        trace!(len = bytes.len(), "writing SSE frame");
        stream.write_all(bytes.as_bytes()).await?;
        stream.flush().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::message::{JsonRpcNotification, JsonRpcResponse};
    use serde_json::json;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_encode_message_event() {
        let event = SseEvent {
            event: Some("message".to_string()),
            data: "{\"a\":1}".to_string(),
        };
        assert_eq!(event.encode(), "event: message\ndata: {\"a\":1}\n\n");
    }

    #[test]
    fn test_multiline_data_round_trip() {
        let event = SseEvent::endpoint("line one\nline two");
        let parsed = SseEvent::parse_stream(&event.encode());
        assert_eq!(parsed, vec![event]);
    }

    #[test]
    fn test_message_round_trip() {
        let original: JsonRpcMessage = JsonRpcResponse::success(
            json!("req-1"),
            json!({"content": [{"type": "text", "text": "a\nb"}], "isError": false}),
        )
        .into();
        let event = SseEvent::message(&original).unwrap();

        let stream = format!(": keep-alive\n\n{}", event.encode());
        let parsed = SseEvent::parse_stream(&stream);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].event.as_deref(), Some(EVENT_MESSAGE));
        assert_eq!(parsed[0].to_message().unwrap(), original);
    }

    #[test]
    fn test_parse_crlf_and_missing_space() {
        let parsed = SseEvent::parse_stream("event:endpoint\r\ndata:/mcp\r\n\r\ndata: x\n");
        assert_eq!(parsed, vec![SseEvent::endpoint("/mcp")]);
    }

    #[test]
    fn test_parse_needs_blank_line_to_dispatch() {
        assert!(SseEvent::parse_stream("data: x\n").is_empty());
        assert_eq!(SseEvent::parse_stream("data: x\n\ndata: y").len(), 1);
        assert_eq!(
            SseEvent::parse_stream("data: x\n\n"),
            vec![SseEvent { event: None, data: "x".to_string() }]
        );
    }

    #[tokio::test]
    async fn test_writer_writes_frames_in_order() {
        let (client, mut server) = tokio::io::duplex(4096);
        let writer = SseWriter::new(client);

        writer.send_endpoint("/mcp?sessionId=abc").await.unwrap();
        let note: JsonRpcMessage =
            JsonRpcNotification::new("notifications/progress", Some(json!({"progress": 1})))
                .into();
        writer.send_message(&note).await.unwrap();
        writer.dispose().await.unwrap();

        let mut output = String::new();
        server.read_to_string(&mut output).await.unwrap();
        let events = SseEvent::parse_stream(&output);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], SseEvent::endpoint("/mcp?sessionId=abc"));
        assert_eq!(events[1].to_message().unwrap(), note);
    }

    #[tokio::test]
    async fn test_send_after_dispose_is_rejected() {
        let writer = SseWriter::new(tokio::io::sink());
        writer.dispose().await.unwrap();

        let note: JsonRpcMessage = JsonRpcNotification::new("ping", None).into();
        let result = writer.send_message(&note).await;
        assert!(matches!(result, Err(TransportError::Closed)));

        // Second dispose is a no-op.
        writer.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_is_not_an_error() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let writer = SseWriter::new(client);
        writer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_broken_stream_is_surfaced() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let writer = SseWriter::new(client);

        let _ = writer.send_comment("keep-alive").await;
        assert!(writer.dispose().await.is_err());
    }
}
