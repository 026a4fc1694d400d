//! WebSocket implementation of the hub transport.
//!
//! `WebSocketConnector::connect` opens the socket, performs the hub handshake
//! and spawns a `LinkDriver` task that owns the socket from then on. The
//! returned `WebSocketLink` talks to the driver over a command channel; the
//! driver reports lifecycle changes and server invocations as `LinkEvent`s.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::RealtimeConfig;
use crate::error::{RealtimeError, Result};
use crate::metrics::{ConnectionMetrics, EventMetrics};

use super::message::{encode_handshake, parse_frames, split_handshake};
use super::{
    BackoffConfig, ExponentialBackoff, HubCommand, HubConnector, HubLink, HubMessage, LinkEvent,
    LinkHandle,
};

type HubSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Timing knobs for one hub connection
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub handshake_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub server_timeout: Duration,
    pub backoff: BackoffConfig,
    pub max_reconnect_attempts: u32,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(15),
            keep_alive_interval: Duration::from_secs(15),
            server_timeout: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
            max_reconnect_attempts: 4,
        }
    }
}

impl From<&RealtimeConfig> for TransportOptions {
    fn from(config: &RealtimeConfig) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout(),
            keep_alive_interval: config.keep_alive_interval(),
            server_timeout: config.server_timeout(),
            backoff: config.backoff(),
            max_reconnect_attempts: config.max_reconnect_attempts,
        }
    }
}

/// Opens hub connections over WebSocket
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    options: TransportOptions,
}

impl WebSocketConnector {
    pub fn new(options: TransportOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl HubConnector for WebSocketConnector {
    async fn connect(&self, endpoint: &str) -> Result<LinkHandle> {
        let (socket, leftover) = open_hub_socket(endpoint, self.options.handshake_timeout).await?;
        info!(endpoint = %endpoint, "Hub handshake completed");

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let driver = LinkDriver {
            endpoint: endpoint.to_string(),
            options: self.options.clone(),
            commands: command_rx,
            events: event_tx,
            pending: HashMap::new(),
            next_invocation_id: 0,
        };
        tokio::spawn(driver.run(socket, leftover));

        Ok(LinkHandle {
            link: Arc::new(WebSocketLink {
                commands: command_tx,
            }),
            events: event_rx,
        })
    }
}

enum LinkCommand {
    Invoke {
        command: HubCommand,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
}

/// Client half of a running `LinkDriver`
pub struct WebSocketLink {
    commands: mpsc::UnboundedSender<LinkCommand>,
}

#[async_trait]
impl HubLink for WebSocketLink {
    async fn invoke(&self, command: HubCommand) -> Result<()> {
        let target = command.target();
        let (reply, response) = oneshot::channel();

        self.commands
            .send(LinkCommand::Invoke { command, reply })
            .map_err(|_| RealtimeError::transport(format!("{} failed: connection is closed", target)))?;

        response.await.map_err(|_| {
            RealtimeError::transport(format!("{} failed: connection closed before completion", target))
        })?
    }

    async fn stop(&self) {
        let (done, stopped) = oneshot::channel();
        if self.commands.send(LinkCommand::Stop { done }).is_ok() {
            let _ = stopped.await;
        }
    }
}

/// Connect and complete the hub handshake within `handshake_timeout`.
///
/// Returns the socket and any records the server sent in the same frame as
/// its handshake response.
async fn open_hub_socket(endpoint: &str, handshake_timeout: Duration) -> Result<(HubSocket, String)> {
    match tokio::time::timeout(handshake_timeout, handshake(endpoint)).await {
        Ok(result) => result,
        Err(_) => Err(RealtimeError::handshake(format!(
            "no handshake response within {}ms",
            handshake_timeout.as_millis()
        ))),
    }
}

async fn handshake(endpoint: &str) -> Result<(HubSocket, String)> {
    let (mut socket, _) = connect_async(endpoint)
        .await
        .map_err(|e| RealtimeError::handshake(format!("connect to {} failed: {}", endpoint, e)))?;

    socket
        .send(Message::Text(encode_handshake()))
        .await
        .map_err(|e| RealtimeError::handshake(format!("sending handshake failed: {}", e)))?;

    let mut buffer = String::new();
    loop {
        let frame = socket
            .next()
            .await
            .ok_or_else(|| RealtimeError::handshake("socket closed during handshake"))?
            .map_err(|e| RealtimeError::handshake(format!("socket error during handshake: {}", e)))?;

        match frame {
            Message::Text(text) => buffer.push_str(&text),
            Message::Binary(bytes) => buffer.push_str(&String::from_utf8_lossy(&bytes)),
            Message::Close(_) => {
                return Err(RealtimeError::handshake("server closed the socket during handshake"))
            }
            _ => continue,
        }

        if let Some((response, rest)) = split_handshake(&buffer)? {
            if let Some(error) = response.error {
                return Err(RealtimeError::handshake(error));
            }
            let rest = rest.to_string();
            return Ok((socket, rest));
        }
    }
}

struct PendingInvocation {
    target: &'static str,
    reply: oneshot::Sender<Result<()>>,
}

/// Why `LinkDriver::drive` returned
enum DriveOutcome {
    /// Stop was requested, or every link handle was dropped
    Stopped(Option<oneshot::Sender<()>>),
    /// The socket was lost and may be re-established
    Dropped(String),
    /// The server closed the connection and does not want a reconnect
    Closed(String),
}

enum ReconnectOutcome {
    Connected(Box<HubSocket>, String),
    Stopped(Option<oneshot::Sender<()>>),
    Exhausted(String),
}

/// Owns the socket for the lifetime of a link, across reconnects
struct LinkDriver {
    endpoint: String,
    options: TransportOptions,
    commands: mpsc::UnboundedReceiver<LinkCommand>,
    events: mpsc::UnboundedSender<LinkEvent>,
    pending: HashMap<String, PendingInvocation>,
    next_invocation_id: u64,
}

impl LinkDriver {
    async fn run(mut self, socket: HubSocket, leftover: String) {
        let mut socket = socket;
        let mut leftover = leftover;

        loop {
            match self.drive(&mut socket, std::mem::take(&mut leftover)).await {
                DriveOutcome::Stopped(done) => {
                    if let Err(e) = socket.close(None).await {
                        debug!(error = %e, "Closing hub socket failed");
                    }
                    self.fail_pending("connection stopped");
                    self.finish(None, done);
                    return;
                }
                DriveOutcome::Closed(error) => {
                    warn!(endpoint = %self.endpoint, error = %error, "Hub closed the connection");
                    self.fail_pending(&error);
                    self.finish(Some(error), None);
                    return;
                }
                DriveOutcome::Dropped(reason) => {
                    warn!(endpoint = %self.endpoint, reason = %reason, "Hub connection lost");
                    self.fail_pending(&reason);
                    self.emit(LinkEvent::Reconnecting { reason });

                    match self.reconnect().await {
                        ReconnectOutcome::Connected(new_socket, rest) => {
                            socket = *new_socket;
                            leftover = rest;
                            info!(endpoint = %self.endpoint, "Hub connection re-established");
                            self.emit(LinkEvent::Reconnected);
                        }
                        ReconnectOutcome::Stopped(done) => {
                            self.finish(None, done);
                            return;
                        }
                        ReconnectOutcome::Exhausted(error) => {
                            warn!(endpoint = %self.endpoint, error = %error, "Giving up on hub connection");
                            self.finish(Some(error), None);
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn drive(&mut self, socket: &mut HubSocket, leftover: String) -> DriveOutcome {
        if let Some(outcome) = self.handle_text(&leftover) {
            return outcome;
        }

        let server_timeout = self.options.server_timeout;
        let idle = tokio::time::sleep(server_timeout);
        tokio::pin!(idle);

        let mut keep_alive = tokio::time::interval_at(
            Instant::now() + self.options.keep_alive_interval,
            self.options.keep_alive_interval,
        );
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(LinkCommand::Invoke { command, reply }) => {
                        if let Err(reason) = self.send_invocation(socket, command, reply).await {
                            return DriveOutcome::Dropped(reason);
                        }
                    }
                    Some(LinkCommand::Stop { done }) => return DriveOutcome::Stopped(Some(done)),
                    None => return DriveOutcome::Stopped(None),
                },
                frame = socket.next() => {
                    idle.as_mut().reset(Instant::now() + server_timeout);
                    let outcome = match frame {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text),
                        Some(Ok(Message::Binary(bytes))) => {
                            self.handle_text(&String::from_utf8_lossy(&bytes))
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|f| format!("socket closed by server: {}", f.reason))
                                .unwrap_or_else(|| "socket closed by server".to_string());
                            Some(DriveOutcome::Dropped(reason))
                        }
                        Some(Ok(_)) => None,
                        Some(Err(e)) => Some(DriveOutcome::Dropped(format!("socket error: {}", e))),
                        None => Some(DriveOutcome::Dropped("socket closed".to_string())),
                    };
                    if let Some(outcome) = outcome {
                        return outcome;
                    }
                }
                _ = &mut idle => {
                    return DriveOutcome::Dropped(format!(
                        "no message from server within {}ms",
                        server_timeout.as_millis()
                    ));
                }
                _ = keep_alive.tick() => {
                    if let Err(reason) = send_message(socket, &HubMessage::Ping).await {
                        return DriveOutcome::Dropped(reason);
                    }
                }
            }
        }
    }

    async fn send_invocation(
        &mut self,
        socket: &mut HubSocket,
        command: HubCommand,
        reply: oneshot::Sender<Result<()>>,
    ) -> std::result::Result<(), String> {
        self.next_invocation_id += 1;
        let invocation_id = self.next_invocation_id.to_string();
        let message = HubMessage::invocation(invocation_id.clone(), &command);

        debug!(invocation_id = %invocation_id, method = command.target(), "Invoking hub method");
        self.pending.insert(
            invocation_id,
            PendingInvocation {
                target: command.target(),
                reply,
            },
        );

        send_message(socket, &message).await
    }

    /// Handle every record in a text frame. Returns an outcome when a hub
    /// Close message ends the current socket.
    fn handle_text(&mut self, text: &str) -> Option<DriveOutcome> {
        for message in parse_frames(text) {
            match message {
                Ok(HubMessage::Invocation {
                    target, arguments, ..
                }) => self.emit(LinkEvent::Invocation { target, arguments }),
                Ok(HubMessage::Completion {
                    invocation_id,
                    error,
                    ..
                }) => self.complete(&invocation_id, error),
                Ok(HubMessage::Ping) => {}
                Ok(HubMessage::Close {
                    error,
                    allow_reconnect,
                }) => {
                    let reason = error.unwrap_or_else(|| "server closed the connection".to_string());
                    return Some(if allow_reconnect {
                        DriveOutcome::Dropped(reason)
                    } else {
                        DriveOutcome::Closed(reason)
                    });
                }
                Ok(HubMessage::Other(kind)) => {
                    debug!(kind, "Ignoring unsupported hub message type");
                }
                Err(e) => {
                    EventMetrics::record_undecodable();
                    warn!(error = %e, "Dropping undecodable hub record");
                }
            }
        }
        None
    }

    fn complete(&mut self, invocation_id: &str, error: Option<String>) {
        let Some(pending) = self.pending.remove(invocation_id) else {
            debug!(invocation_id, "Completion for unknown invocation");
            return;
        };

        let result = match error {
            Some(error) => Err(RealtimeError::transport(format!(
                "{} failed: {}",
                pending.target, error
            ))),
            None => Ok(()),
        };
        let _ = pending.reply.send(result);
    }

    fn fail_pending(&mut self, reason: &str) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(RealtimeError::transport(format!(
                "{} failed: {}",
                pending.target, reason
            ))));
        }
    }

    async fn reconnect(&mut self) -> ReconnectOutcome {
        let mut backoff = ExponentialBackoff::with_config(self.options.backoff.clone())
            .with_max_attempts(self.options.max_reconnect_attempts);
        let endpoint = self.endpoint.clone();
        let handshake_timeout = self.options.handshake_timeout;
        let mut last_error = "no reconnect attempts allowed".to_string();

        while let Some(delay) = backoff.next_delay() {
            let attempt = backoff.attempt();
            ConnectionMetrics::record_reconnect_attempt();
            info!(
                endpoint = %endpoint,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Scheduling hub reconnect"
            );

            let wait = tokio::time::sleep(delay);
            tokio::pin!(wait);
            loop {
                tokio::select! {
                    _ = &mut wait => break,
                    command = self.commands.recv() => {
                        if let ControlFlow::Break(done) = reject_while_reconnecting(command) {
                            return ReconnectOutcome::Stopped(done);
                        }
                    }
                }
            }

            let connecting = open_hub_socket(&endpoint, handshake_timeout);
            tokio::pin!(connecting);
            let result = loop {
                tokio::select! {
                    result = &mut connecting => break result,
                    command = self.commands.recv() => {
                        if let ControlFlow::Break(done) = reject_while_reconnecting(command) {
                            return ReconnectOutcome::Stopped(done);
                        }
                    }
                }
            };

            match result {
                Ok((socket, rest)) => return ReconnectOutcome::Connected(Box::new(socket), rest),
                Err(e) => {
                    warn!(endpoint = %endpoint, attempt, error = %e, "Hub reconnect attempt failed");
                    last_error = e.to_string();
                }
            }
        }

        ReconnectOutcome::Exhausted(last_error)
    }

    fn emit(&self, event: LinkEvent) {
        if self.events.send(event).is_err() {
            debug!("Link event receiver dropped");
        }
    }

    fn finish(&self, error: Option<String>, done: Option<oneshot::Sender<()>>) {
        self.emit(LinkEvent::Closed { error });
        if let Some(done) = done {
            let _ = done.send(());
        }
    }
}

/// Commands that arrive while no socket is up: invocations fail fast, a stop
/// request ends reconnection.
fn reject_while_reconnecting(command: Option<LinkCommand>) -> ControlFlow<Option<oneshot::Sender<()>>> {
    match command {
        Some(LinkCommand::Invoke { command, reply }) => {
            let _ = reply.send(Err(RealtimeError::transport(format!(
                "{} failed: connection is reconnecting",
                command.target()
            ))));
            ControlFlow::Continue(())
        }
        Some(LinkCommand::Stop { done }) => ControlFlow::Break(Some(done)),
        None => ControlFlow::Break(None),
    }
}

async fn send_message(socket: &mut HubSocket, message: &HubMessage) -> std::result::Result<(), String> {
    let frame = message.to_frame().map_err(|e| e.to_string())?;
    socket
        .send(Message::Text(frame))
        .await
        .map_err(|e| format!("socket send failed: {}", e))
}
