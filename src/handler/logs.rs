//! `/ws/logs`: one WebSocket connection, many container subscriptions.
//!
//! A single reader loop decodes control messages one at a time. Everything
//! sent to the client (log records from any number of streaming tasks and the
//! reader's own error replies) goes through one bounded queue drained by one
//! writer task, so each JSON object is written as a whole frame.

use std::{fmt::Display, ops::ControlFlow, sync::Arc, time::Duration};

use axum::{
    Extension,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc::{self, Receiver};
use tokio_util::sync::CancellationToken;

use super::AppState;
use crate::{
    middleware::CorrelationId,
    protocol::{CONTAINER_ID_REQUIRED, ClientMessage, INVALID_MESSAGE_FORMAT, ServerMessage},
    runtime::ContainerRuntime,
    subscription::{EventSender, SubscriptionManager},
};

/// How long teardown waits for queued events to reach a client that stopped
/// reading.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub max_subscriptions: usize,
    pub outbound_buffer: usize,
}

pub struct ConnectionContext {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub settings: ConnectionSettings,
    /// Server-wide token; cancelling it closes the connection.
    pub shutdown: CancellationToken,
    pub correlation_id: String,
}

pub async fn ws_logs(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    ws: WebSocketUpgrade,
) -> Response {
    let context = ConnectionContext {
        runtime: Arc::clone(&state.runtime),
        settings: ConnectionSettings {
            max_subscriptions: state.config.max_subscriptions,
            outbound_buffer: state.config.outbound_buffer,
        },
        shutdown: state.shutdown.clone(),
        correlation_id: correlation.0,
    };

    ws.max_message_size(state.config.max_message_size)
        .on_failed_upgrade(|e| log::warn!("WebSocket upgrade error: {e}"))
        .on_upgrade(move |socket: WebSocket| async move {
            let (outbound, inbound) = socket.split();
            serve_connection(inbound, outbound, context).await;
        })
}

/// Runs a connection until the client goes away, a write fails, or the server
/// shuts down. Returns only after every streaming task has exited.
pub async fn serve_connection<R, E, W>(inbound: R, outbound: W, context: ConnectionContext)
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
    W: Sink<Message> + Send + Unpin + 'static,
    W::Error: Display + Send,
{
    let ConnectionContext {
        runtime,
        settings,
        shutdown,
        correlation_id,
    } = context;

    log::info!("[{correlation_id}] WebSocket connection opened");

    let token = shutdown.child_token();
    let (events, queue) = mpsc::channel(settings.outbound_buffer);
    let mut writer = tokio::spawn(write_events(
        outbound,
        queue,
        token.clone(),
        correlation_id.clone(),
    ));

    let session = Session {
        manager: SubscriptionManager::new(
            runtime,
            events.clone(),
            settings.max_subscriptions,
            token.clone(),
        ),
        events,
        token,
        correlation_id,
    };

    session.read_control_messages(inbound).await;

    let Session {
        manager,
        events,
        correlation_id,
        ..
    } = session;

    log::info!(
        "[{correlation_id}] Closing WebSocket connection with {} active subscriptions",
        manager.len().await
    );
    log::debug!("[{correlation_id}] Cancelling {:?}", manager.active().await);
    manager.close_all().await;
    // The writer stops once every sender is gone
    drop(manager);
    drop(events);

    match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("[{correlation_id}] WebSocket writer failed: {e}"),
        Err(_) => {
            log::warn!("[{correlation_id}] Client stopped reading, dropping queued events");
            writer.abort();
        }
    }

    log::info!("[{correlation_id}] WebSocket connection closed");
}

async fn write_events<W>(
    mut outbound: W,
    mut queue: Receiver<ServerMessage>,
    token: CancellationToken,
    correlation_id: String,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display + Send,
{
    while let Some(event) = queue.recv().await {
        let text = match event.encode() {
            Ok(text) => text,
            Err(e) => {
                log::error!("[{correlation_id}] Unable to encode event: {e}");
                continue;
            }
        };

        if let Err(e) = outbound.send(Message::Text(text.into())).await {
            // A dead write path cannot serve any subscription
            log::warn!("[{correlation_id}] WebSocket write error: {e}");
            token.cancel();
            return;
        }
    }

    let _ = outbound.send(Message::Close(None)).await;
    let _ = outbound.close().await;
}

struct Session {
    manager: SubscriptionManager,
    events: EventSender,
    token: CancellationToken,
    correlation_id: String,
}

impl Session {
    async fn read_control_messages<R, E>(&self, mut inbound: R)
    where
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                frame = inbound.next() => frame,
            };

            let flow = match frame {
                Some(Ok(Message::Text(text))) => self.dispatch(text.as_str().as_bytes()).await,
                Some(Ok(Message::Binary(data))) => self.dispatch(&data).await,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => ControlFlow::Continue(()),
                Some(Ok(Message::Close(_))) | None => ControlFlow::Break(()),
                Some(Err(e)) => {
                    log::warn!("[{}] WebSocket read error: {e}", self.correlation_id);
                    ControlFlow::Break(())
                }
            };

            if flow.is_break() {
                break;
            }
        }
    }

    async fn dispatch(&self, raw: &[u8]) -> ControlFlow<()> {
        let message = match ClientMessage::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                log::debug!("[{}] Invalid control message: {e}", self.correlation_id);
                return self.reply(ServerMessage::error(INVALID_MESSAGE_FORMAT)).await;
            }
        };

        match message {
            ClientMessage::Subscribe { container_id } if container_id.is_empty() => {
                self.reply(ServerMessage::error(CONTAINER_ID_REQUIRED)).await
            }
            ClientMessage::Subscribe { container_id } => {
                match self.manager.subscribe(&container_id).await {
                    Ok(_) => ControlFlow::Continue(()),
                    Err(e) => {
                        log::info!(
                            "[{}] Subscribe to {container_id} rejected: {e}",
                            self.correlation_id
                        );
                        self.reply(ServerMessage::error(e.to_string())).await
                    }
                }
            }
            ClientMessage::Unsubscribe { container_id } if container_id.is_empty() => {
                ControlFlow::Continue(())
            }
            ClientMessage::Unsubscribe { container_id } => {
                self.manager.unsubscribe(&container_id).await;
                ControlFlow::Continue(())
            }
        }
    }

    /// Queues an event for the writer. Breaks when the connection is gone.
    async fn reply(&self, message: ServerMessage) -> ControlFlow<()> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => ControlFlow::Break(()),
            sent = self.events.send(message) => match sent {
                Ok(()) => ControlFlow::Continue(()),
                Err(_) => ControlFlow::Break(()),
            },
        }
    }
}
