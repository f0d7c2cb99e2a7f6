use crate::protocol::{OutboundFrame, QueryRequest};
use crate::relay::{FrameSink, RelayOutcome, StreamRelay};
use crate::types::*;
use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::Arc;
use tracing::Instrument;

/// Frames read while a query is in flight wait here, up to this many.
const MAX_BACKLOG: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    AwaitingFrame,
    Processing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Close frame or end of stream while awaiting a query.
    ClientDisconnected,
    ValidationFailed,
    RelayFailed(FailureKind),
    ReceiveFailed,
    /// Client went away while a query was in flight.
    Cancelled,
}

/// `FrameSink` over the write half of a WebSocket.
pub struct WsFrameSink<S> {
    inner: S,
    closed: bool,
}

impl<S> WsFrameSink<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            closed: false,
        }
    }
}

impl<S> FrameSink for WsFrameSink<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display + Send,
{
    async fn send_frame(&mut self, frame: OutboundFrame) -> Result<()> {
        if self.closed {
            return Err(RelayError::Transport("connection already closed".to_string()).into());
        }
        let text = frame.to_json()?;
        if let Err(e) = self.inner.send(Message::Text(text)).await {
            self.closed = true;
            return Err(RelayError::Transport(e.to_string()).into());
        }
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.inner.send(Message::Close(None)).await {
            tracing::debug!("Close frame not delivered: {}", e);
        }
        let _ = self.inner.close().await;
    }
}

enum Inbound {
    Query(QueryRequest),
    Ignore,
    Disconnect,
    Invalid(ObservedError),
    ReceiveError(String),
}

fn classify<E: Display>(next: Option<std::result::Result<Message, E>>) -> Inbound {
    match next {
        None | Some(Ok(Message::Close(_))) => Inbound::Disconnect,
        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => Inbound::Ignore,
        Some(Ok(Message::Text(text))) => match QueryRequest::parse_text(&text) {
            Ok(q) => Inbound::Query(q),
            Err(e) => Inbound::Invalid(e),
        },
        Some(Ok(Message::Binary(bytes))) => match QueryRequest::parse_bytes(&bytes) {
            Ok(q) => Inbound::Query(q),
            Err(e) => Inbound::Invalid(e),
        },
        Some(Err(e)) => Inbound::ReceiveError(e.to_string()),
    }
}

/// One client connection: receive a query, relay it to completion, repeat.
pub struct ConnectionSession {
    id: ConnectionId,
    relay: StreamRelay,
    state: SessionState,
    served: u64,
    backlog: VecDeque<Message>,
}

impl ConnectionSession {
    pub fn new(relay: StreamRelay) -> Self {
        Self {
            id: ConnectionId::new(),
            relay,
            state: SessionState::Connecting,
            served: 0,
            backlog: VecDeque::new(),
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn relay(&self) -> &StreamRelay {
        &self.relay
    }

    /// Number of queries accepted for processing.
    pub fn served(&self) -> u64 {
        self.served
    }

    pub async fn run<R, E, S>(&mut self, mut inbound: R, mut sink: S) -> CloseReason
    where
        R: Stream<Item = std::result::Result<Message, E>> + Unpin + Send,
        E: Display + Send,
        S: FrameSink,
    {
        let span = tracing::info_span!("connection", conn = %self.id.short());
        async {
            tracing::info!("[🌐 -> ⚙️ ] 🟢 WebSocket connection accepted");
            self.state = SessionState::AwaitingFrame;

            let reason = loop {
                let next = match self.backlog.pop_front() {
                    Some(m) => Some(Ok(m)),
                    None => inbound.next().await,
                };

                match classify(next) {
                    Inbound::Ignore => continue,
                    Inbound::Disconnect => break CloseReason::ClientDisconnected,
                    Inbound::ReceiveError(message) => {
                        tracing::error!("[🌐 -> ⚙️ ] ❌ Receive failed: {}", message);
                        Self::reject(&mut sink, message).await;
                        break CloseReason::ReceiveFailed;
                    }
                    Inbound::Invalid(e) => {
                        tracing::warn!("[🌐 -> ⚙️ ] Rejected frame: {}", e.inner);
                        Self::reject(&mut sink, e.inner.to_string()).await;
                        break CloseReason::ValidationFailed;
                    }
                    Inbound::Query(request) => {
                        self.state = SessionState::Processing;
                        self.served += 1;
                        let rid = RequestId::for_connection(&self.id, self.served);
                        let query_span = tracing::info_span!("query", rid = %rid);
                        if let Some(reason) = self
                            .process(&mut inbound, &mut sink, &request)
                            .instrument(query_span)
                            .await
                        {
                            break reason;
                        }
                        self.state = SessionState::AwaitingFrame;
                    }
                }
            };

            self.state = SessionState::Closed;
            tracing::info!(
                "[🌐 -> ⚙️ ] 🔴 WebSocket connection closed ({:?}, {} queries)",
                reason,
                self.served
            );
            reason
        }
        .instrument(span)
        .await
    }

    async fn reject<S: FrameSink>(sink: &mut S, message: String) {
        if let Err(e) = sink.send_frame(OutboundFrame::error(message)).await {
            tracing::debug!("Error frame not delivered: {}", e.inner);
        }
        sink.close().await;
    }

    /// Runs the relay while still watching the socket for a disconnect.
    async fn process<R, E, S>(
        &mut self,
        inbound: &mut R,
        sink: &mut S,
        request: &QueryRequest,
    ) -> Option<CloseReason>
    where
        R: Stream<Item = std::result::Result<Message, E>> + Unpin + Send,
        E: Display + Send,
        S: FrameSink,
    {
        tracing::info!("[🌐 -> ⚙️ ] 📥 Received query (stream: {})", request.param.stream);

        let outcome = {
            let relay = self.relay.run(sink, request);
            tokio::pin!(relay);
            loop {
                // A full backlog stops reads; the socket buffers the rest.
                let room = self.backlog.len() < MAX_BACKLOG;
                tokio::select! {
                    outcome = &mut relay => break Ok(outcome),
                    msg = inbound.next(), if room => match msg {
                        None | Some(Ok(Message::Close(_))) => break Err(None),
                        Some(Err(e)) => {
                            tracing::warn!("[🌐 -> ⚙️ ] Receive failed mid-request: {}", e);
                            break Err(Some(e.to_string()));
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(m)) => self.backlog.push_back(m),
                    },
                }
            }
        };

        match outcome {
            Ok(RelayOutcome::Completed) => None,
            Ok(RelayOutcome::Failed(kind)) => Some(CloseReason::RelayFailed(kind)),
            Err(receive_error) => {
                // The relay future is gone, and with it the upstream stream.
                self.relay.abort();
                match receive_error {
                    Some(message) => {
                        Self::reject(sink, message).await;
                        Some(CloseReason::ReceiveFailed)
                    }
                    None => {
                        sink.close().await;
                        Some(CloseReason::Cancelled)
                    }
                }
            }
        }
    }
}

pub async fn ws_query_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(socket: WebSocket, state: Arc<AppState>) {
    let (sender, receiver) = socket.split();
    let mut session = ConnectionSession::new(state.new_relay());
    session.run(receiver, WsFrameSink::new(sender)).await;
}
