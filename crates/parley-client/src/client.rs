//! Client connection state machine.
//!
//! Public operations are serialized by an async mutex. Transitions happen
//! under a separate status lock together with a check of the cancellation
//! epoch, so a `disconnect` racing a connect or reconnect always wins.
//!
//! One driver task per connect owns the read half of the socket. When the
//! transport drops it runs the reconnect loop and, on resume, replays the
//! session commitment and channel joins before reporting `Connected`.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use futures::StreamExt;
use parley_common::{
    envelope_aad, is_valid_channel_id, is_valid_session_id, ConnectionId, HubCall, HubFault,
    Invocation, MessageEnvelope, ServerFrame, SignalKind, SignalMessage, E2EE_SESSION_HEADER,
};
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::e2ee::{E2eeInfo, E2eeState, SignalAction};
use crate::error::ClientError;
use crate::events::{self, ClientEvent, ClientEvents, EventSink, ReceivedMessage};
use crate::state::{ConnectionState, ConnectionStatus};
use crate::transport::{self, WsReader};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
struct Link {
    connection_id: ConnectionId,
    outbound: mpsc::Sender<Message>,
}

struct Completion {
    fault: Option<HubFault>,
    e2ee_verified: bool,
}

struct Shared {
    status: ConnectionStatus,
    link: Option<Link>,
}

struct Inner {
    config: ClientConfig,
    events: EventSink,
    ops: AsyncMutex<()>,
    shared: Mutex<Shared>,
    /// Bumped by every explicit disconnect; stale work compares against it.
    epoch: watch::Sender<u64>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Completion>>>,
    next_invocation: AtomicU64,
    channels: Mutex<BTreeSet<String>>,
    e2ee: Mutex<E2eeState>,
}

/// Shuts the connection down once the last `ChatClient` handle is gone.
/// The driver task holds `Inner` but not this guard.
struct HandleGuard {
    inner: Arc<Inner>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

/// Handle to a chat connection. Clones share the same connection; dropping
/// the last clone disconnects.
#[derive(Clone)]
pub struct ChatClient {
    inner: Arc<Inner>,
    _guard: Arc<HandleGuard>,
}

impl ChatClient {
    pub fn new(config: ClientConfig) -> (Self, ClientEvents) {
        let (sink, stream) = events::event_stream(config.event_capacity);
        let (epoch, _) = watch::channel(0u64);
        let inner = Arc::new(Inner {
            config,
            events: sink,
            ops: AsyncMutex::new(()),
            shared: Mutex::new(Shared {
                status: ConnectionStatus::default(),
                link: None,
            }),
            epoch,
            pending: Mutex::new(HashMap::new()),
            next_invocation: AtomicU64::new(1),
            channels: Mutex::new(BTreeSet::new()),
            e2ee: Mutex::new(E2eeState::default()),
        });
        let guard = Arc::new(HandleGuard {
            inner: Arc::clone(&inner),
        });
        (
            Self {
                inner,
                _guard: guard,
            },
            stream,
        )
    }

    /// Open the hub connection. Fails without retrying; the state returns to
    /// `Disconnected` carrying the cause.
    pub async fn connect(&self, url: &str) -> Result<(), ClientError> {
        self.inner.config.validate()?;
        let url = transport::parse_url(url)?;
        let _ops = self.inner.ops.lock().await;

        let (epoch, mut cancel) = {
            let mut shared = lock(&self.inner.shared);
            if shared.status.state != ConnectionState::Disconnected {
                return Err(ClientError::AlreadyActive);
            }
            let epoch = *self.inner.epoch.borrow();
            let cancel = self.inner.epoch.subscribe();
            self.inner
                .set_state(&mut shared, ConnectionState::Connecting, None);
            (epoch, cancel)
        };

        let opened = tokio::select! {
            result = transport::open(&url, self.inner.config.handshake_timeout) => result,
            _ = cancel.changed() => Err(ClientError::Cancelled),
        };
        let transport = match opened {
            Ok(transport) => transport,
            Err(err) => {
                self.inner
                    .transition_if(epoch, ConnectionState::Disconnected, Some(err.clone()));
                return Err(err);
            }
        };

        let link = Link {
            connection_id: transport.connection_id,
            outbound: transport.outbound,
        };
        if !self.inner.activate(epoch, link) {
            return Err(ClientError::Cancelled);
        }
        info!("connected to {} as {}", url, transport.connection_id);

        tokio::spawn(drive(
            Arc::clone(&self.inner),
            url,
            transport.reader,
            epoch,
            cancel,
        ));
        Ok(())
    }

    /// Close the connection and cancel any pending connect or reconnect.
    /// Channel memberships and the E2EE session are released.
    pub async fn disconnect(&self) {
        self.inner.shutdown();
    }

    pub async fn join_channel(&self, channel_id: &str) -> Result<(), ClientError> {
        let _ops = self.inner.ops.lock().await;
        self.inner.connected_link()?;
        check_channel(channel_id)?;
        self.inner
            .invoke(HubCall::JoinChannel {
                channel_id: channel_id.to_string(),
            })
            .await?;
        lock(&self.inner.channels).insert(channel_id.to_string());
        Ok(())
    }

    pub async fn leave_channel(&self, channel_id: &str) -> Result<(), ClientError> {
        let _ops = self.inner.ops.lock().await;
        self.inner.connected_link()?;
        check_channel(channel_id)?;
        self.inner
            .invoke(HubCall::LeaveChannel {
                channel_id: channel_id.to_string(),
            })
            .await?;
        lock(&self.inner.channels).remove(channel_id);
        Ok(())
    }

    /// Send `text` to a joined channel, encrypted when an E2EE session is
    /// active. Returns the envelope as it went on the wire.
    pub async fn send_message(
        &self,
        text: &str,
        channel_id: &str,
        sender_name: &str,
    ) -> Result<MessageEnvelope, ClientError> {
        let _ops = self.inner.ops.lock().await;
        let link = self.inner.connected_link()?;
        check_channel(channel_id)?;

        let message_id = Uuid::new_v4().to_string();
        let sender_id = link.connection_id.to_string();
        let session = lock(&self.inner.e2ee).active();
        let (content, encrypted) = match &session {
            Some(session) => {
                let aad = envelope_aad(&message_id, channel_id, &sender_id);
                let sealed = session
                    .seal(text, &aad)
                    .map_err(|err| ClientError::Encryption(err.to_string()))?;
                (sealed, true)
            }
            None => (text.to_string(), false),
        };

        let envelope = MessageEnvelope {
            message_id,
            sender_id,
            sender_name: sender_name.to_string(),
            content,
            channel_id: channel_id.to_string(),
            timestamp: Utc::now(),
            encrypted,
        };
        let completion = self
            .inner
            .invoke(HubCall::SendMessage {
                envelope: envelope.clone(),
            })
            .await?;
        if encrypted && !completion.e2ee_verified {
            debug!("encrypted message {} sent without a verified session", envelope.message_id);
        }
        Ok(envelope)
    }

    /// Offer a new key agreement. Share the returned session id with the
    /// peer, who answers through [`ChatClient::join_handshake`].
    pub async fn start_handshake(&self) -> Result<String, ClientError> {
        let _ops = self.inner.ops.lock().await;
        self.inner.connected_link()?;

        let (session_id, offer) = lock(&self.inner.e2ee).begin_initiator();
        if let Err(err) = self.inner.invoke(HubCall::Signal(offer)).await {
            lock(&self.inner.e2ee).abandon(&session_id);
            return Err(err);
        }
        info!("offered E2EE session {}", session_id);
        Ok(session_id)
    }

    pub async fn join_handshake(&self, session_id: &str) -> Result<(), ClientError> {
        let _ops = self.inner.ops.lock().await;
        self.inner.connected_link()?;
        if !is_valid_session_id(session_id) {
            return Err(HubFault::invalid("invalid session id").into());
        }

        lock(&self.inner.e2ee).begin_responder(session_id);
        let joined = self
            .inner
            .invoke(HubCall::JoinSignaling {
                session_id: session_id.to_string(),
            })
            .await;
        if let Err(err) = joined {
            lock(&self.inner.e2ee).abandon(session_id);
            return Err(err);
        }
        Ok(())
    }

    /// Forward an auxiliary negotiation payload to the session peer.
    pub async fn send_candidate(&self, session_id: &str, payload: &str) -> Result<(), ClientError> {
        let _ops = self.inner.ops.lock().await;
        self.inner.connected_link()?;
        self.inner
            .invoke(HubCall::Signal(SignalMessage::new(
                session_id,
                SignalKind::Candidate,
                payload,
            )))
            .await?;
        Ok(())
    }

    pub fn status(&self) -> ConnectionStatus {
        lock(&self.inner.shared).status.clone()
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        lock(&self.inner.shared)
            .link
            .as_ref()
            .map(|link| link.connection_id)
    }

    pub fn e2ee_session(&self) -> Option<E2eeInfo> {
        lock(&self.inner.e2ee).info()
    }

    pub fn channels(&self) -> Vec<String> {
        lock(&self.inner.channels).iter().cloned().collect()
    }
}

fn check_channel(channel_id: &str) -> Result<(), ClientError> {
    if is_valid_channel_id(channel_id) {
        Ok(())
    } else {
        Err(HubFault::invalid(format!("invalid channel id {:?}", channel_id)).into())
    }
}

impl Inner {
    fn emit(&self, event: ClientEvent) {
        self.events.emit(event);
    }

    /// Bump the epoch, which stops the driver and any pending connect, then
    /// close the socket and release session state.
    fn shutdown(&self) {
        let link = {
            let mut shared = lock(&self.shared);
            self.epoch.send_modify(|epoch| *epoch += 1);
            if shared.status.state != ConnectionState::Disconnected {
                self.set_state(&mut shared, ConnectionState::Disconnected, None);
            }
            shared.link.take()
        };
        self.fail_pending();
        self.reset_session_state();
        if let Some(link) = link {
            let _ = link.outbound.try_send(Message::Close(None));
        }
    }

    fn set_state(&self, shared: &mut Shared, state: ConnectionState, error: Option<ClientError>) {
        let current = shared.status.state;
        if !current.can_transition_to(state) {
            warn!("ignoring invalid transition {} -> {}", current, state);
            return;
        }
        match &error {
            Some(err) => info!("connection {} -> {} ({})", current, state, err),
            None => info!("connection {} -> {}", current, state),
        }
        shared.status = ConnectionStatus::new(state, error);
        self.emit(ClientEvent::StateChanged(shared.status.clone()));
    }

    fn current_epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    /// Transition only if no disconnect happened since `epoch` was read.
    fn transition_if(&self, epoch: u64, state: ConnectionState, error: Option<ClientError>) -> bool {
        let mut shared = lock(&self.shared);
        if self.current_epoch() != epoch {
            return false;
        }
        self.set_state(&mut shared, state, error);
        true
    }

    fn activate(&self, epoch: u64, link: Link) -> bool {
        let mut shared = lock(&self.shared);
        if self.current_epoch() != epoch {
            return false;
        }
        shared.link = Some(link);
        self.set_state(&mut shared, ConnectionState::Connected, None);
        true
    }

    /// Drop the live link after a transport failure and enter `Reconnecting`.
    fn suspend(&self, epoch: u64, reason: &str) -> bool {
        let mut shared = lock(&self.shared);
        if self.current_epoch() != epoch {
            return false;
        }
        shared.link = None;
        self.set_state(
            &mut shared,
            ConnectionState::Reconnecting,
            Some(ClientError::TransportFailure(reason.to_string())),
        );
        true
    }

    fn connected_link(&self) -> Result<Link, ClientError> {
        let shared = lock(&self.shared);
        match (&shared.status.state, &shared.link) {
            (ConnectionState::Connected, Some(link)) => Ok(link.clone()),
            _ => Err(ClientError::NotConnected),
        }
    }

    fn fail_pending(&self) {
        lock(&self.pending).clear();
    }

    fn reset_session_state(&self) {
        lock(&self.channels).clear();
        lock(&self.e2ee).reset();
    }

    fn encode(&self, call: HubCall) -> Result<(u64, String), ClientError> {
        let invocation_id = self.next_invocation.fetch_add(1, Ordering::Relaxed);
        let mut invocation = Invocation::new(invocation_id, call);
        if let Some(session) = lock(&self.e2ee).active() {
            invocation = invocation.with_header(E2EE_SESSION_HEADER, session.session_id());
        }
        let text = invocation
            .encode()
            .map_err(|err| ClientError::Protocol(err.to_string()))?;
        Ok((invocation_id, text))
    }

    async fn invoke(&self, call: HubCall) -> Result<Completion, ClientError> {
        let link = self.connected_link()?;
        let (invocation_id, text) = self.encode(call)?;

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(invocation_id, tx);
        if link.outbound.send(Message::Text(text.into())).await.is_err() {
            lock(&self.pending).remove(&invocation_id);
            return Err(ClientError::TransportFailure("connection closed".into()));
        }

        match tokio::time::timeout(self.config.invoke_timeout, rx).await {
            Ok(Ok(completion)) => match completion.fault {
                Some(fault) => Err(fault.into()),
                None => Ok(completion),
            },
            Ok(Err(_)) => Err(ClientError::TransportFailure(
                "connection lost before the call completed".into(),
            )),
            Err(_) => {
                lock(&self.pending).remove(&invocation_id);
                Err(ClientError::Timeout(format!(
                    "no completion for call {} within {:?}",
                    invocation_id, self.config.invoke_timeout
                )))
            }
        }
    }

    /// Queue a call without waiting for its completion. Used from the driver,
    /// which is the task that would read that completion.
    fn send_unacked(&self, call: HubCall) {
        let Some(link) = lock(&self.shared).link.clone() else {
            warn!("dropping {} while not connected", call.name());
            return;
        };
        let name = call.name();
        match self.encode(call) {
            Ok((_, text)) => {
                if link.outbound.try_send(Message::Text(text.into())).is_err() {
                    warn!("failed to queue {}", name);
                }
            }
            Err(err) => warn!("failed to encode {}: {}", name, err),
        }
    }

    /// Re-register the session commitment and rejoin channels on a new link.
    async fn restore(&self, link: &Link) -> Result<(), ClientError> {
        let mut calls = Vec::new();
        let active = lock(&self.e2ee).active();
        if let Some(session) = active {
            calls.push(HubCall::RegisterSession {
                session_id: session.session_id().to_string(),
                key: session.commitment_base64(),
                ttl_secs: self.config.session_ttl_secs,
            });
        }
        let channels: Vec<String> = lock(&self.channels).iter().cloned().collect();
        calls.extend(
            channels
                .into_iter()
                .map(|channel_id| HubCall::JoinChannel { channel_id }),
        );

        for call in calls {
            let (_, text) = self.encode(call)?;
            link.outbound
                .send(Message::Text(text.into()))
                .await
                .map_err(|_| ClientError::TransportFailure("connection closed while restoring".into()))?;
        }
        Ok(())
    }

    fn handle_frame(&self, text: &str) {
        let frame = match ServerFrame::decode(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("invalid frame from gateway: {}", err);
                return;
            }
        };

        match frame {
            ServerFrame::Completion {
                invocation_id,
                fault,
                e2ee_verified,
            } => {
                let waiter = lock(&self.pending).remove(&invocation_id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Completion {
                            fault,
                            e2ee_verified,
                        });
                    }
                    None => {
                        if let Some(fault) = fault {
                            warn!("background call {} failed: {}", invocation_id, fault);
                        }
                    }
                }
            }
            ServerFrame::Message {
                envelope,
                e2ee_verified,
            } => self.deliver_message(envelope, e2ee_verified),
            ServerFrame::Signal(msg) => self.handle_signal(msg),
            ServerFrame::Error { message } => warn!("gateway error: {}", message),
            ServerFrame::Welcome { connection_id } => {
                debug!("unexpected WELCOME for {}", connection_id)
            }
        }
    }

    fn deliver_message(&self, envelope: MessageEnvelope, e2ee_verified: bool) {
        if !envelope.encrypted {
            let text = envelope.content.clone();
            self.emit(ClientEvent::Message(ReceivedMessage {
                envelope,
                text,
                e2ee_verified,
            }));
            return;
        }

        let session = lock(&self.e2ee).active();
        let opened = match session {
            Some(session) => session
                .open(&envelope.content, &envelope.associated_data())
                .map_err(|err| err.to_string()),
            None => Err("no E2EE session is active".to_string()),
        };

        match opened {
            Ok(text) => self.emit(ClientEvent::Message(ReceivedMessage {
                envelope,
                text,
                e2ee_verified,
            })),
            Err(reason) => {
                warn!("could not decrypt message {}: {}", envelope.message_id, reason);
                let error = ClientError::DecryptionFailure {
                    message_id: envelope.message_id.clone(),
                    reason,
                };
                self.emit(ClientEvent::MessageError { envelope, error });
            }
        }
    }

    fn handle_signal(&self, msg: SignalMessage) {
        let action = lock(&self.e2ee).on_signal(&msg);
        match action {
            SignalAction::Ignore => {}
            SignalAction::Candidate {
                session_id,
                payload,
            } => self.emit(ClientEvent::Candidate {
                session_id,
                payload,
            }),
            SignalAction::Established { session, reply } => {
                if let Some(reply) = reply {
                    self.send_unacked(HubCall::Signal(reply));
                }
                self.send_unacked(HubCall::RegisterSession {
                    session_id: session.session_id().to_string(),
                    key: session.commitment_base64(),
                    ttl_secs: self.config.session_ttl_secs,
                });
                info!(
                    "E2EE session {} established (fingerprint {})",
                    session.session_id(),
                    session.fingerprint()
                );
                self.emit(ClientEvent::E2eeEstablished {
                    session_id: session.session_id().to_string(),
                    fingerprint: session.fingerprint(),
                });
            }
            SignalAction::Failed { session_id, error } => {
                warn!("E2EE handshake {} failed: {}", session_id, error);
                self.emit(ClientEvent::HandshakeFailed { session_id, error });
            }
        }
    }
}

enum ReadOutcome {
    Cancelled,
    Closed(String),
}

async fn read_frames(
    inner: &Inner,
    reader: &mut WsReader,
    cancel: &mut watch::Receiver<u64>,
) -> ReadOutcome {
    loop {
        tokio::select! {
            _ = cancel.changed() => return ReadOutcome::Cancelled,
            msg = reader.next() => match msg {
                Some(Ok(Message::Text(text))) => inner.handle_frame(text.as_str()),
                Some(Ok(Message::Close(_))) | None => {
                    return ReadOutcome::Closed("connection closed by gateway".into())
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return ReadOutcome::Closed(err.to_string()),
            }
        }
    }
}

async fn drive(
    inner: Arc<Inner>,
    url: Url,
    mut reader: WsReader,
    epoch: u64,
    mut cancel: watch::Receiver<u64>,
) {
    loop {
        let reason = match read_frames(&inner, &mut reader, &mut cancel).await {
            ReadOutcome::Cancelled => return,
            ReadOutcome::Closed(reason) => reason,
        };

        if !inner.suspend(epoch, &reason) {
            return;
        }
        inner.fail_pending();
        warn!("connection lost ({}), reconnecting", reason);

        match reconnect(&inner, &url, epoch, &mut cancel).await {
            Some(next) => reader = next,
            None => return,
        }
    }
}

async fn reconnect(
    inner: &Inner,
    url: &Url,
    epoch: u64,
    cancel: &mut watch::Receiver<u64>,
) -> Option<WsReader> {
    let config = &inner.config;
    let mut last_error: Option<ClientError> = None;

    for attempt in 1..=config.max_reconnect_attempts {
        tokio::select! {
            _ = tokio::time::sleep(config.backoff.delay_for(attempt)) => {}
            _ = cancel.changed() => return None,
        }

        let opened = tokio::select! {
            result = transport::open(url, config.reconnect_timeout) => result,
            _ = cancel.changed() => return None,
        };
        let transport = match opened {
            Ok(transport) => transport,
            Err(err) => {
                warn!(
                    "reconnect attempt {}/{} failed: {}",
                    attempt, config.max_reconnect_attempts, err
                );
                last_error = Some(err);
                continue;
            }
        };

        let link = Link {
            connection_id: transport.connection_id,
            outbound: transport.outbound,
        };
        if let Err(err) = inner.restore(&link).await {
            last_error = Some(err);
            continue;
        }
        if !inner.activate(epoch, link) {
            return None;
        }
        info!(
            "reconnected as {} after {} attempt(s)",
            transport.connection_id, attempt
        );
        return Some(transport.reader);
    }

    let detail = last_error
        .map(|err| err.to_string())
        .unwrap_or_else(|| "reconnect disabled".to_string());
    let error = ClientError::TransportFailure(format!(
        "gave up after {} attempts: {}",
        config.max_reconnect_attempts, detail
    ));
    if inner.transition_if(epoch, ConnectionState::Disconnected, Some(error)) {
        inner.reset_session_state();
    }
    None
}
