//! Per-connection WebSocket handler.
//!
//! Keeps WebSocket framing and heartbeats at the edge while the connection
//! registry owns routing. The public WebSocket contract pings every 5s and
//! considers a connection idle after 10s without client traffic. Tests
//! shorten these intervals to speed up feedback; adjust the constants below
//! if SLAs change so clients and intermediaries stay aligned.
//!
//! The subscriber socket is receive-mostly: inbound frames only refresh the
//! connection's liveness, and notification frames are pushed through the
//! registry from the delivery pipeline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use actix_ws::{CloseCode, CloseReason, Closed, Message, MessageStream, ProtocolError, Session};
use async_trait::async_trait;
use tokio::time;
use tracing::warn;

use crate::domain::message::UserId;
use crate::registry::{SinkClosed, SocketRegistry, SocketSink};

/// Time between heartbeats to the client (5s in production, shorter in tests).
#[cfg(not(test))]
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
#[cfg(test)]
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(50);

/// Max idle time before disconnecting the client (10s in production, shorter in tests).
#[cfg(not(test))]
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);
#[cfg(test)]
const CLIENT_TIMEOUT: Duration = Duration::from_millis(100);

/// Registry-facing handle over one `actix_ws` session.
///
/// `Session` clones share the underlying connection, so the registry can
/// push frames while the session loop keeps reading.
pub(super) struct SessionSink {
    session: tokio::sync::Mutex<Session>,
}

impl SessionSink {
    pub(super) fn new(session: Session) -> Self {
        Self {
            session: tokio::sync::Mutex::new(session),
        }
    }
}

#[async_trait]
impl SocketSink for SessionSink {
    async fn send_text(&self, frame: &str) -> Result<(), SinkClosed> {
        let mut session = self.session.lock().await;
        session.text(frame).await.map_err(|Closed| SinkClosed)
    }

    async fn close(&self) {
        let session = self.session.lock().await.clone();
        let _ = session.close(None).await;
    }
}

/// Drive one registered connection until it closes, then deregister it.
pub(super) async fn handle_socket(
    registry: Arc<SocketRegistry>,
    user_id: UserId,
    session: Session,
    stream: MessageStream,
) {
    let sink = Arc::new(SessionSink::new(session.clone()));
    let connection = registry.add(user_id, sink);
    SocketSession::new(Arc::clone(&registry), user_id, connection)
        .run(session, stream)
        .await;
    registry.remove(user_id, connection);
}

enum SessionError {
    ClientClosed(Option<CloseReason>),
    StreamClosed,
    HeartbeatTimeout,
    Protocol(ProtocolError),
    Network(Closed),
}

enum CloseAction {
    None,
    Close(Option<CloseReason>),
}

struct SocketSession {
    registry: Arc<SocketRegistry>,
    user_id: UserId,
    connection: crate::registry::ConnectionId,
}

impl SocketSession {
    fn new(
        registry: Arc<SocketRegistry>,
        user_id: UserId,
        connection: crate::registry::ConnectionId,
    ) -> Self {
        Self {
            registry,
            user_id,
            connection,
        }
    }

    async fn run(&self, mut session: Session, mut stream: MessageStream) {
        let mut last_heartbeat = Instant::now();
        let mut heartbeat = time::interval(HEARTBEAT_INTERVAL);

        loop {
            let result = tokio::select! {
                _ = heartbeat.tick() => {
                    self.handle_heartbeat_tick(&mut session, &last_heartbeat).await
                }
                message = stream.recv() => {
                    self.handle_stream_message(&mut session, &mut last_heartbeat, message)
                        .await
                }
            };

            if let Err(error) = result {
                self.log_shutdown_reason(&error);
                let close_action = Self::close_action_for(&error);
                Self::close_session_if_needed(session, close_action).await;
                return;
            }
        }
    }

    async fn handle_heartbeat_tick(
        &self,
        session: &mut Session,
        last_heartbeat: &Instant,
    ) -> Result<(), SessionError> {
        if Instant::now().duration_since(*last_heartbeat) > CLIENT_TIMEOUT {
            return Err(SessionError::HeartbeatTimeout);
        }

        session.ping(b"").await.map_err(SessionError::Network)
    }

    async fn handle_stream_message(
        &self,
        session: &mut Session,
        last_heartbeat: &mut Instant,
        message: Option<Result<Message, ProtocolError>>,
    ) -> Result<(), SessionError> {
        let Some(message) = message else {
            return Err(SessionError::StreamClosed);
        };

        match message {
            Ok(message) => self.handle_message(session, last_heartbeat, message).await,
            Err(error) => Err(SessionError::Protocol(error)),
        }
    }

    async fn handle_message(
        &self,
        session: &mut Session,
        last_heartbeat: &mut Instant,
        message: Message,
    ) -> Result<(), SessionError> {
        match message {
            Message::Ping(payload) => {
                self.record_traffic(last_heartbeat);
                session
                    .pong(&payload)
                    .await
                    .map_err(SessionError::Network)?;
                Ok(())
            }
            Message::Text(_)
            | Message::Pong(_)
            | Message::Binary(_)
            | Message::Continuation(_)
            | Message::Nop => {
                self.record_traffic(last_heartbeat);
                Ok(())
            }
            Message::Close(reason) => Err(SessionError::ClientClosed(reason)),
        }
    }

    fn record_traffic(&self, last_heartbeat: &mut Instant) {
        *last_heartbeat = Instant::now();
        self.registry.touch(self.user_id, self.connection);
    }

    fn log_shutdown_reason(&self, error: &SessionError) {
        match error {
            SessionError::HeartbeatTimeout => {
                warn!(user_id = %self.user_id, "WebSocket heartbeat timeout; closing connection");
            }
            SessionError::Protocol(error) => {
                warn!(user_id = %self.user_id, error = %error, "WebSocket protocol error");
            }
            SessionError::Network(error) => {
                warn!(user_id = %self.user_id, error = %error, "WebSocket send failed; closing connection");
            }
            SessionError::ClientClosed(_) | SessionError::StreamClosed => {}
        }
    }

    fn close_action_for(error: &SessionError) -> CloseAction {
        match error {
            SessionError::HeartbeatTimeout => CloseAction::Close(Some(CloseReason {
                code: CloseCode::Normal,
                description: Some("heartbeat timeout".to_owned()),
            })),
            SessionError::Protocol(_) => CloseAction::Close(Some(CloseReason {
                code: CloseCode::Protocol,
                description: Some("protocol error".to_owned()),
            })),
            SessionError::ClientClosed(reason) => CloseAction::Close(reason.clone()),
            SessionError::StreamClosed | SessionError::Network(_) => CloseAction::None,
        }
    }

    async fn close_session_if_needed(session: Session, close_action: CloseAction) {
        if let CloseAction::Close(reason) = close_action {
            if let Err(error) = session.close(reason).await {
                warn!(error = %error, "Failed to close WebSocket session");
            }
        }
    }
}
