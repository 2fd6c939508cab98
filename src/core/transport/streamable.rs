//! Streamable HTTP transport for one session.
//!
//! Bridges HTTP request cycles and the long-lived push connection to the
//! protocol runtime through three queues:
//!
//! - incoming: client → runtime, bounded, many writers / one reader
//! - responses: runtime → POST cycle, capacity 1, one writer / one reader
//! - notifications: runtime → GET streams, unbounded, one writer / competing readers
//!
//! Responses are drained exactly once per POST, while notifications must
//! never wait for an idle GET connection, hence the separate queues.
//!
//! Two concurrent POSTs on one session are a caller error: the response
//! reader is serialized, but which POST receives which response is
//! undefined.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, Interval, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::message::JsonRpcMessage;
use super::sse::SseWriter;
use super::{TransportError, TransportResult};

/// Lifecycle of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransportState {
    /// Constructed, no message seen yet.
    Created = 0,
    /// At least one message received.
    Active = 1,
    /// Dispose requested, queues being completed.
    Draining = 2,
    /// Terminal.
    Closed = 3,
}

impl TransportState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Active,
            2 => Self::Draining,
            _ => Self::Closed,
        }
    }

    fn accepts_messages(self) -> bool {
        matches!(self, Self::Created | Self::Active)
    }
}

/// Per-session streamable transport.
pub struct StreamableTransport {
    session_id: String,
    state: AtomicU8,
    closed: CancellationToken,
    keep_alive: Option<Duration>,

    incoming_tx: Mutex<Option<mpsc::Sender<JsonRpcMessage>>>,
    incoming_rx: Mutex<mpsc::Receiver<JsonRpcMessage>>,

    response_tx: Mutex<Option<mpsc::Sender<JsonRpcMessage>>>,
    response_rx: Mutex<mpsc::Receiver<JsonRpcMessage>>,

    notification_tx: Mutex<Option<mpsc::UnboundedSender<JsonRpcMessage>>>,
    notification_rx: Mutex<mpsc::UnboundedReceiver<JsonRpcMessage>>,
}

enum PushItem {
    Message(JsonRpcMessage),
    KeepAlive,
    Done,
}

impl StreamableTransport {
    /// Create a transport for `session_id`.
    ///
    /// `incoming_capacity` bounds the client → runtime queue (minimum 1).
    pub fn new(
        session_id: impl Into<String>,
        incoming_capacity: usize,
        keep_alive: Option<Duration>,
    ) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::channel(incoming_capacity.max(1));
        let (response_tx, response_rx) = mpsc::channel(1);
        let (notification_tx, notification_rx) = mpsc::unbounded_channel();

        Self {
            session_id: session_id.into(),
            state: AtomicU8::new(TransportState::Created as u8),
            closed: CancellationToken::new(),
            keep_alive,
            incoming_tx: Mutex::new(Some(incoming_tx)),
            incoming_rx: Mutex::new(incoming_rx),
            response_tx: Mutex::new(Some(response_tx)),
            response_rx: Mutex::new(response_rx),
            notification_tx: Mutex::new(Some(notification_tx)),
            notification_rx: Mutex::new(notification_rx),
        }
    }

    /// Session this transport belongs to.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransportState {
        TransportState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn ensure_open(&self) -> TransportResult<()> {
        if self.state().accepts_messages() {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    /// Push a client message onto the incoming queue.
    ///
    /// Waits while the queue is full; this is the backpressure point against
    /// a slow runtime. Fails once the transport is disposed.
    pub async fn on_message_received(&self, message: JsonRpcMessage) -> TransportResult<()> {
        self.ensure_open()?;
        let _ = self.state.compare_exchange(
            TransportState::Created as u8,
            TransportState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        let sender = self.incoming_tx.lock().await.clone();
        let Some(sender) = sender else {
            return Err(TransportError::Closed);
        };

        trace!(session_id = %self.session_id, method = ?message.method(), "queueing incoming message");
        tokio::select! {
            sent = sender.send(message) => sent.map_err(|_| TransportError::Closed),
            _ = self.closed.cancelled() => Err(TransportError::Closed),
        }
    }

    /// Next client message for the runtime; `None` once the transport is closed.
    pub async fn receive(&self) -> Option<JsonRpcMessage> {
        tokio::select! {
            _ = self.closed.cancelled() => None,
            message = async {
                let mut incoming = self.incoming_rx.lock().await;
                incoming.recv().await
            } => message,
        }
    }

    /// Route a runtime message to its queue.
    ///
    /// Notifications go to the unbounded push queue and never wait. Anything
    /// else takes the single response slot and waits until the current POST
    /// cycle has drained it.
    pub async fn send_message(&self, message: JsonRpcMessage) -> TransportResult<()> {
        self.ensure_open()?;

        if message.is_notification() {
            let sender = self.notification_tx.lock().await.clone();
            let Some(sender) = sender else {
                return Err(TransportError::Closed);
            };
            return sender.send(message).map_err(|_| TransportError::Closed);
        }

        let sender = self.response_tx.lock().await.clone();
        let Some(sender) = sender else {
            return Err(TransportError::Closed);
        };

        tokio::select! {
            sent = sender.send(message) => sent.map_err(|_| TransportError::Closed),
            _ = self.closed.cancelled() => Err(TransportError::Closed),
        }
    }

    /// Write the single response of one POST cycle.
    ///
    /// Waits for the response whose id equals `request_id`, or for
    /// cancellation or closure, and never writes a second item. Responses
    /// for other ids were left behind by abandoned POST cycles; they are
    /// discarded. Returns whether a response was written.
    pub async fn write_pending_responses(
        &self,
        request_id: &Value,
        writer: &SseWriter,
        cancel: &CancellationToken,
    ) -> TransportResult<bool> {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => None,
                _ = self.closed.cancelled() => None,
                message = async {
                    let mut responses = self.response_rx.lock().await;
                    responses.recv().await
                } => message,
            };

            let Some(message) = next else {
                debug!(session_id = %self.session_id, "POST cycle ended without a response");
                return Ok(false);
            };

            if message.id() != Some(request_id) {
                warn!(
                    session_id = %self.session_id,
                    expected = %request_id,
                    "Discarding stale response {:?}",
                    message.id()
                );
                continue;
            }

            writer.send_message(&message).await?;
            return Ok(true);
        }
    }

    /// Stream notifications to a push connection.
    ///
    /// Runs until `cancel` fires, the transport closes, or the writer stops
    /// accepting frames (client went away).
    pub async fn write_notifications(
        &self,
        writer: &SseWriter,
        cancel: &CancellationToken,
    ) -> TransportResult<()> {
        let mut keep_alive = self
            .keep_alive
            .map(|period| interval_at(Instant::now() + period, period));

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => PushItem::Done,
                _ = self.closed.cancelled() => PushItem::Done,
                _ = tick(&mut keep_alive) => PushItem::KeepAlive,
                message = async {
                    let mut notifications = self.notification_rx.lock().await;
                    notifications.recv().await
                } => match message {
                    Some(message) => PushItem::Message(message),
                    None => PushItem::Done,
                },
            };

            let sent = match item {
                PushItem::Message(message) => writer.send_message(&message).await,
                PushItem::KeepAlive => writer.send_comment("keep-alive").await,
                PushItem::Done => return Ok(()),
            };

            if let Err(e) = sent {
                if e.is_closed() {
                    debug!(session_id = %self.session_id, "push stream closed by client");
                    return Ok(());
                }
                return Err(e);
            }
        }
    }

    /// Close the transport; every pending reader observes end-of-stream.
    pub async fn dispose(&self) {
        let previous = self.state.swap(TransportState::Draining as u8, Ordering::AcqRel);
        if TransportState::from_u8(previous) == TransportState::Closed {
            self.state
                .store(TransportState::Closed as u8, Ordering::Release);
            return;
        }

        self.closed.cancel();
        self.incoming_tx.lock().await.take();
        self.response_tx.lock().await.take();
        self.notification_tx.lock().await.take();

        self.state
            .store(TransportState::Closed as u8, Ordering::Release);
        debug!(session_id = %self.session_id, "transport disposed");
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::message::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
    use crate::core::transport::sse::SseEvent;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    fn transport() -> Arc<StreamableTransport> {
        Arc::new(StreamableTransport::new("test-session", 4, None))
    }

    fn response(id: i64) -> JsonRpcMessage {
        JsonRpcResponse::success(json!(id), json!({})).into()
    }

    fn notification(method: &str) -> JsonRpcMessage {
        JsonRpcNotification::new(method, None).into()
    }

    async fn drain(mut reader: tokio::io::DuplexStream) -> Vec<SseEvent> {
        let mut output = String::new();
        reader.read_to_string(&mut output).await.unwrap();
        SseEvent::parse_stream(&output)
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let transport = transport();
        assert_eq!(transport.state(), TransportState::Created);

        transport
            .on_message_received(JsonRpcRequest::new(1, "ping", None).into())
            .await
            .unwrap();
        assert_eq!(transport.state(), TransportState::Active);

        transport.dispose().await;
        assert_eq!(transport.state(), TransportState::Closed);

        let result = transport
            .on_message_received(JsonRpcRequest::new(2, "ping", None).into())
            .await;
        assert!(matches!(result, Err(TransportError::Closed)));
        assert!(transport.send_message(response(1)).await.is_err());

        // Disposing twice is harmless.
        transport.dispose().await;
        assert_eq!(transport.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_incoming_preserves_order() {
        let transport = transport();
        for id in 0..3 {
            transport
                .on_message_received(JsonRpcRequest::new(id, "ping", None).into())
                .await
                .unwrap();
        }
        for id in 0..3 {
            let message = transport.receive().await.unwrap();
            assert_eq!(message.id(), Some(&json!(id)));
        }
    }

    #[tokio::test]
    async fn test_full_incoming_queue_applies_backpressure() {
        use tokio_test::{assert_pending, assert_ready, assert_ready_ok, task};

        let transport = Arc::new(StreamableTransport::new("bounded", 1, None));
        transport
            .on_message_received(JsonRpcRequest::new(1, "ping", None).into())
            .await
            .unwrap();

        let mut second =
            task::spawn(transport.on_message_received(JsonRpcRequest::new(2, "ping", None).into()));
        assert_pending!(second.poll());

        assert_eq!(transport.receive().await.unwrap().id(), Some(&json!(1)));
        assert!(second.is_woken());
        assert_ready_ok!(second.poll());

        let mut third =
            task::spawn(transport.on_message_received(JsonRpcRequest::new(3, "ping", None).into()));
        assert_pending!(third.poll());

        transport.dispose().await;
        assert!(third.is_woken());
        assert!(matches!(
            assert_ready!(third.poll()),
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_receive_ends_after_dispose() {
        let transport = transport();
        let reader = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.receive().await })
        };
        transport.dispose().await;
        assert!(reader.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_post_cycle_yields_single_response() {
        let transport = transport();
        transport.send_message(response(1)).await.unwrap();

        let (client, server) = tokio::io::duplex(4096);
        let writer = SseWriter::new(client);
        let cancel = CancellationToken::new();

        let written = transport
            .write_pending_responses(&json!(1), &writer, &cancel)
            .await
            .unwrap();
        assert!(written);

        // A second response now fits the freed slot but belongs to the next cycle.
        transport.send_message(response(2)).await.unwrap();
        writer.dispose().await.unwrap();

        let events = drain(server).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].to_message().unwrap(), response(1));
    }

    #[tokio::test]
    async fn test_post_cycle_discards_stale_response() {
        let transport = transport();
        // Left behind by a POST whose client went away.
        transport.send_message(response(2)).await.unwrap();

        let (client, server) = tokio::io::duplex(4096);
        let writer = SseWriter::new(client);

        let cycle = {
            let transport = transport.clone();
            tokio::spawn(async move {
                let written = transport
                    .write_pending_responses(&json!(3), &writer, &CancellationToken::new())
                    .await;
                writer.dispose().await.unwrap();
                written
            })
        };
        transport.send_message(response(3)).await.unwrap();
        assert!(cycle.await.unwrap().unwrap());

        let events = drain(server).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].to_message().unwrap(), response(3));
    }

    #[tokio::test]
    async fn test_response_slot_holds_one_item() {
        use tokio_test::{assert_pending, assert_ready_ok, task};

        let transport = transport();
        transport.send_message(response(1)).await.unwrap();

        let mut second = task::spawn(transport.send_message(response(2)));
        assert_pending!(second.poll());

        let writer = SseWriter::new(tokio::io::sink());
        let written = transport
            .write_pending_responses(&json!(1), &writer, &CancellationToken::new())
            .await
            .unwrap();
        assert!(written);

        assert!(second.is_woken());
        assert_ready_ok!(second.poll());
    }

    #[tokio::test]
    async fn test_post_cycle_cancelled_without_response() {
        let transport = transport();
        let writer = SseWriter::new(tokio::io::sink());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let written = transport
            .write_pending_responses(&json!(1), &writer, &cancel)
            .await
            .unwrap();
        assert!(!written);
    }

    #[tokio::test]
    async fn test_push_stream_receives_only_notifications() {
        let transport = transport();
        let (client, server) = tokio::io::duplex(4096);
        let writer = Arc::new(SseWriter::new(client));
        let cancel = CancellationToken::new();

        let push = {
            let transport = transport.clone();
            let writer = writer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { transport.write_notifications(&writer, &cancel).await })
        };

        transport
            .send_message(notification("notifications/progress"))
            .await
            .unwrap();
        transport.send_message(response(9)).await.unwrap();
        transport
            .send_message(notification("notifications/message"))
            .await
            .unwrap();

        // Let the push task drain both notifications before stopping it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        push.await.unwrap().unwrap();
        writer.dispose().await.unwrap();

        let events = drain(server).await;
        let methods: Vec<_> = events
            .iter()
            .map(|e| e.to_message().unwrap().method().map(str::to_string))
            .collect();
        assert_eq!(
            methods,
            vec![
                Some("notifications/progress".to_string()),
                Some("notifications/message".to_string())
            ]
        );

        // The response is still waiting for its POST cycle.
        let post_writer = SseWriter::new(tokio::io::sink());
        let written = transport
            .write_pending_responses(&json!(9), &post_writer, &CancellationToken::new())
            .await
            .unwrap();
        assert!(written);
    }

    #[tokio::test]
    async fn test_notifications_never_block() {
        let transport = transport();
        for _ in 0..1_000 {
            transport
                .send_message(notification("notifications/message"))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_push_stream_ends_on_dispose() {
        let transport = transport();
        let writer = Arc::new(SseWriter::new(tokio::io::sink()));

        let push = {
            let transport = transport.clone();
            let writer = writer.clone();
            tokio::spawn(async move {
                transport
                    .write_notifications(&writer, &CancellationToken::new())
                    .await
            })
        };

        transport.dispose().await;
        push.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_comments() {
        let transport = Arc::new(StreamableTransport::new(
            "keep-alive",
            1,
            Some(Duration::from_secs(5)),
        ));
        let (client, mut server) = tokio::io::duplex(4096);
        let writer = Arc::new(SseWriter::new(client));
        let cancel = CancellationToken::new();

        let push = {
            let transport = transport.clone();
            let writer = writer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { transport.write_notifications(&writer, &cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(11)).await;
        cancel.cancel();
        push.await.unwrap().unwrap();
        writer.dispose().await.unwrap();

        let mut output = String::new();
        server.read_to_string(&mut output).await.unwrap();
        assert_eq!(output.matches(": keep-alive").count(), 2);
        assert!(SseEvent::parse_stream(&output).is_empty());
    }
}
