use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::backoff::Backoff;
use super::client::InboundMessage;
use super::client::OFFLINE;
use super::client::ONLINE;
use super::client::Transport;
use super::client::TransportError;
use super::client::TransportEvent;
use super::discovery;
use super::topics::Topics;
use crate::commands::CommandDispatcher;
use crate::commands::CommandRequest;
use crate::commands::CommandResult;
use crate::commands::Origin;
use crate::commands::RunRequest;
use crate::device::Device;
use crate::engine::ModuleKind;
use crate::engine::Snapshot;
use crate::engine::StatusAggregator;
use crate::update::UpdateStatus;

/// Capacity of the queue feeding the session's single writer
const OUTBOUND_CHANNEL_SIZE: usize = 64;

/// Payload on the install topic that triggers an update
const INSTALL_PAYLOAD: &[u8] = b"INSTALL";

/// A message handed to the session for publishing.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32, backoff: Duration },
}

/// What other components keep after handing the session to its task.
pub struct SessionHandle {
    pub outbound: mpsc::Sender<Outbound>,
    pub state: watch::Receiver<ConnectionState>,
}

/// Owns the broker connection and is the only writer to it.
///
/// On every ConnAck the session announces itself in a fixed order: availability, command
/// subscriptions, discovery, then the full status. Status changes queued while that burst is
/// written are handled afterwards, so a subscriber never sees a partial device.
pub struct BrokerSession<T: Transport> {
    transport: T,
    topics: Topics,
    device: Arc<Device>,
    aggregator: Arc<StatusAggregator>,
    backoff: Backoff,
    connected: bool,
    state: watch::Sender<ConnectionState>,
    outbound: mpsc::Receiver<Outbound>,
    requests: Option<mpsc::Sender<CommandRequest>>,
    updates: Option<watch::Receiver<UpdateStatus>>,
    install: Option<mpsc::Sender<()>>,
    update_status: Option<UpdateStatus>,
}

impl<T: Transport> BrokerSession<T> {
    pub fn new(
        transport: T,
        topics: Topics,
        device: Arc<Device>,
        aggregator: Arc<StatusAggregator>,
        backoff: Backoff,
    ) -> (Self, SessionHandle) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_SIZE);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let session = Self {
            transport,
            topics,
            device,
            aggregator,
            backoff,
            connected: false,
            state: state_tx,
            outbound: outbound_rx,
            requests: None,
            updates: None,
            install: None,
            update_status: None,
        };
        let handle = SessionHandle {
            outbound: outbound_tx,
            state: state_rx,
        };
        (session, handle)
    }

    /// Forward requests arriving on the run topic to `requests`.
    pub fn with_commands(mut self, requests: mpsc::Sender<CommandRequest>) -> Self {
        self.requests = Some(requests);
        self
    }

    /// Publish the update entity state and accept install triggers.
    pub fn with_updates(
        mut self,
        status: watch::Receiver<UpdateStatus>,
        install: mpsc::Sender<()>,
    ) -> Self {
        self.updates = Some(status);
        self.install = Some(install);
        self
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut changes = self.aggregator.subscribe();
        let mut updates = self.updates.take();
        self.update_status = updates.as_mut().map(|rx| rx.borrow_and_update().clone());

        self.state.send_replace(ConnectionState::Connecting);
        info!("Connecting to MQTT broker as {}", self.topics.root());

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = self.transport.next_event() => match event {
                    Ok(TransportEvent::Connected) => self.on_connected(),
                    Ok(TransportEvent::Message(msg)) => self.on_message(msg),
                    Ok(TransportEvent::Other) => {}
                    Err(e) => {
                        if !self.wait_before_reconnect(&e, &cancel).await {
                            break;
                        }
                    }
                },
                Some(out) = self.outbound.recv() => {
                    self.publish(&out.topic, out.payload, out.retain);
                }
                change = changes.recv() => match change {
                    Ok(kind) => self.publish_module(kind),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Status notifications lagged by {}, republishing all", skipped);
                        self.publish_status_full();
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },
                Some(status) = next_update(&mut updates) => {
                    self.publish_update_state(&status);
                    self.update_status = Some(status);
                }
            }
        }

        self.close().await;
    }

    fn on_connected(&mut self) {
        self.connected = true;
        self.backoff.reset();
        self.state.send_replace(ConnectionState::Connected);
        info!("Connected to MQTT broker");

        self.publish(&self.topics.availability(), ONLINE.into(), true);

        if self.requests.is_some() {
            self.subscribe(&self.topics.run());
        }
        if self.install.is_some() {
            self.subscribe(&self.topics.update_install());
        }

        let descriptors = discovery::descriptors(&self.device, &self.topics);
        debug!("Publishing {} discovery descriptors", descriptors.len());
        for descriptor in descriptors {
            self.publish(&descriptor.topic, descriptor.payload, true);
        }

        self.publish_status_full();

        if let Some(status) = &self.update_status {
            self.publish_update_state(status);
        }
    }

    async fn wait_before_reconnect(
        &mut self,
        error: &TransportError,
        cancel: &CancellationToken,
    ) -> bool {
        self.connected = false;
        let (attempt, delay) = self.backoff.next_delay();
        warn!(
            "MQTT connection lost ({}), reconnecting in {:?} (attempt {})",
            error, delay, attempt
        );
        self.state.send_replace(ConnectionState::Reconnecting {
            attempt,
            backoff: delay,
        });

        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn on_message(&mut self, msg: InboundMessage) {
        if msg.topic == self.topics.run() {
            self.forward_command(msg);
        } else if msg.topic == self.topics.update_install() {
            self.forward_install(&msg);
        } else {
            debug!("Ignoring message on {}", msg.topic);
        }
    }

    fn forward_command(&self, msg: InboundMessage) {
        let Some(requests) = &self.requests else {
            return;
        };

        let request: RunRequest = match serde_json::from_slice(&msg.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("Malformed command request on {}: {}", msg.topic, e);
                let result = CommandResult::error(format!("invalid request: {}", e));
                self.publish(&self.topics.run_result(), result.to_bytes(), false);
                return;
            }
        };

        let request = request.into_request(Origin::Broker { topic: msg.topic });
        info!("Command '{}' requested over MQTT", request.command);
        if let Err(e) = requests.try_send(request) {
            warn!("Dropping command request: {}", e);
            let result = CommandResult::error("command queue is full".to_string());
            self.publish(&self.topics.run_result(), result.to_bytes(), false);
        }
    }

    fn forward_install(&self, msg: &InboundMessage) {
        let Some(install) = &self.install else {
            return;
        };
        if msg.payload.trim_ascii() != INSTALL_PAYLOAD {
            debug!("Ignoring install payload {:?}", String::from_utf8_lossy(&msg.payload));
            return;
        }
        info!("Update install requested over MQTT");
        if install.try_send(()).is_err() {
            debug!("Install already pending");
        }
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) {
        if !self.connected {
            debug!("Dropping publish to {} while disconnected", topic);
            return;
        }
        if let Err(e) = self.transport.publish(topic, payload, retain) {
            warn!("Failed to publish to {}: {}", topic, e);
        }
    }

    fn subscribe(&self, topic: &str) {
        if let Err(e) = self.transport.subscribe(topic) {
            warn!("Failed to subscribe to {}: {}", topic, e);
        }
    }

    fn publish_status(&self, snapshot: &Snapshot) {
        self.publish(
            &self.topics.status(),
            snapshot.to_json().to_string().into_bytes(),
            true,
        );
    }

    fn publish_namespace(&self, snapshot: &Snapshot, kind: ModuleKind) {
        let Some(report) = snapshot.get(kind) else {
            return;
        };
        let state = report.state.clone().unwrap_or_default();
        self.publish(&self.topics.module_state(kind), state.into_bytes(), true);
        let attrs = serde_json::Value::Object(report.fields.clone());
        self.publish(
            &self.topics.module_attrs(kind),
            attrs.to_string().into_bytes(),
            true,
        );
    }

    fn publish_status_full(&self) {
        let snapshot = self.aggregator.snapshot();
        self.publish_status(&snapshot);
        for kind in snapshot.kinds().filter(|kind| kind.has_namespace()) {
            self.publish_namespace(&snapshot, kind);
        }
    }

    fn publish_module(&self, kind: ModuleKind) {
        let snapshot = self.aggregator.snapshot();
        self.publish_status(&snapshot);
        if kind.has_namespace() {
            self.publish_namespace(&snapshot, kind);
        }
    }

    fn publish_update_state(&self, status: &UpdateStatus) {
        match serde_json::to_vec(status) {
            Ok(payload) => self.publish(&self.topics.update_state(), payload, true),
            Err(e) => warn!("Failed to encode update state: {}", e),
        }
    }

    async fn close(mut self) {
        if self.connected {
            self.publish(&self.topics.availability(), OFFLINE.into(), true);
        }
        if let Err(e) = self.transport.disconnect().await {
            warn!("Error while disconnecting from MQTT broker: {}", e);
        }
        self.connected = false;
        self.state.send_replace(ConnectionState::Disconnected);
        info!("MQTT session closed");
    }
}

async fn next_update(updates: &mut Option<watch::Receiver<UpdateStatus>>) -> Option<UpdateStatus> {
    match updates {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(rx.borrow_and_update().clone()),
            Err(_) => {
                // Update manager is gone; stop polling this branch.
                *updates = None;
                None
            }
        },
        None => std::future::pending().await,
    }
}

/// Dispatch broker command requests and publish each result to `result_topic`.
///
/// Every request runs in its own task so a command that waits for completion never
/// delays the next one.
pub async fn relay_commands(
    dispatcher: Arc<CommandDispatcher>,
    mut requests: mpsc::Receiver<CommandRequest>,
    outbound: mpsc::Sender<Outbound>,
    result_topic: String,
    cancel: CancellationToken,
) {
    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            request = requests.recv() => {
                let Some(request) = request else {
                    break;
                };
                let dispatcher = dispatcher.clone();
                let outbound = outbound.clone();
                let topic = result_topic.clone();
                tasks.spawn(async move {
                    let result = dispatcher.dispatch(&request).await;
                    let payload = CommandResult::from(&result).to_bytes();
                    let _ = outbound
                        .send(Outbound {
                            topic,
                            payload,
                            retain: false,
                        })
                        .await;
                });
            }
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    // In-flight dispatches observe the dispatcher's own cancellation.
    while tasks.join_next().await.is_some() {}
    debug!("Command relay stopped");
}
