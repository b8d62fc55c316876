//! Room session: a named room joined as a pub/sub topic, served by a publish loop and a
//! receive loop that share one cancellation token.
//!
//! Callers read `incoming` and `logs` and write through [`RoomSession::send`]; only
//! [`RoomSession::exit`] (or a room switch) ends the session. `incoming` closing is the
//! one termination signal consumers get.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ChatConfig;
use crate::fabric::{Fabric, FabricError, Subscription, Topic};
use crate::identity::NodeId;
use crate::protocol::{topic_name, ChatMessage, LogEvent, DEFAULT_ROOM, DEFAULT_USER};
use crate::wire::{decode_message, encode_message};

/// Joining a room failed. The caller's other sessions are unaffected.
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error("could not join topic {topic}: {source}")]
    Topic {
        topic: String,
        #[source]
        source: FabricError,
    },
    #[error("could not subscribe to topic {topic}: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: FabricError,
    },
}

/// The session no longer accepts outgoing messages.
#[derive(Debug, thiserror::Error)]
#[error("room session closed")]
pub struct SessionClosed;

/// A live room membership.
pub struct RoomSession {
    /// Messages from other members, in pub/sub delivery order. Closes when the session ends.
    pub incoming: mpsc::Receiver<ChatMessage>,
    /// Local diagnostics (publish and receive failures, the terminal close notice).
    pub logs: mpsc::Receiver<LogEvent>,
    outgoing: Option<mpsc::Sender<String>>,
    room_name: String,
    self_id: NodeId,
    generation: u64,
    display_name: watch::Sender<String>,
    topic: Arc<dyn Topic>,
    cancel: CancellationToken,
    publish_task: Option<JoinHandle<()>>,
    receive_task: Option<JoinHandle<Box<dyn Subscription>>>,
}

impl RoomSession {
    /// Join `room_name` as `display_name`. Empty names fall back to
    /// `default_user` / `default_room`.
    pub async fn join(
        fabric: &dyn Fabric,
        display_name: &str,
        room_name: &str,
        config: &ChatConfig,
    ) -> Result<Self, JoinError> {
        Self::join_generation(fabric, display_name, room_name, config, 0).await
    }

    pub(crate) async fn join_generation(
        fabric: &dyn Fabric,
        display_name: &str,
        room_name: &str,
        config: &ChatConfig,
        generation: u64,
    ) -> Result<Self, JoinError> {
        let display_name = or_default(display_name, DEFAULT_USER);
        let room_name = or_default(room_name, DEFAULT_ROOM);
        let topic_name = topic_name(&room_name);

        let topic = fabric
            .join_topic(&topic_name)
            .await
            .map_err(|source| JoinError::Topic {
                topic: topic_name.clone(),
                source,
            })?;
        let subscription = match topic.subscribe() {
            Ok(sub) => sub,
            Err(source) => {
                topic.close();
                return Err(JoinError::Subscribe {
                    topic: topic_name,
                    source,
                });
            }
        };

        let self_id = fabric.local_id();
        let capacity = config.channel_capacity();
        let (outgoing_tx, outgoing_rx) = mpsc::channel(capacity);
        let (incoming_tx, incoming_rx) = mpsc::channel(capacity);
        let (logs_tx, logs_rx) = mpsc::channel(capacity);
        let (name_tx, name_rx) = watch::channel(display_name);
        let cancel = CancellationToken::new();

        let publish_task = tokio::spawn(publish_loop(
            topic.clone(),
            outgoing_rx,
            logs_tx.clone(),
            name_rx,
            self_id,
            cancel.clone(),
        ));
        let receive_task = tokio::spawn(receive_loop(
            subscription,
            incoming_tx,
            logs_tx,
            self_id,
            cancel.clone(),
        ));
        info!(room = %room_name, topic = %topic_name, generation, "joined room");

        Ok(Self {
            incoming: incoming_rx,
            logs: logs_rx,
            outgoing: Some(outgoing_tx),
            room_name,
            self_id,
            generation,
            display_name: name_tx,
            topic,
            cancel,
            publish_task: Some(publish_task),
            receive_task: Some(receive_task),
        })
    }

    pub fn room_name(&self) -> &str {
        &self.room_name
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    /// Switch counter value this session was created under (0 for the first session).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn display_name(&self) -> String {
        self.display_name.borrow().clone()
    }

    /// Rename this member. Applies to every message published afterwards; empty names are ignored.
    pub fn update_user(&self, name: &str) {
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        self.display_name.send_replace(name.to_string());
    }

    /// Sender for outgoing text. Valid until the session ends.
    pub fn outgoing(&self) -> Option<mpsc::Sender<String>> {
        self.outgoing.clone()
    }

    /// Queue a chat message for publishing.
    pub async fn send(&self, text: impl Into<String>) -> Result<(), SessionClosed> {
        let tx = self.outgoing.as_ref().ok_or(SessionClosed)?;
        tx.send(text.into()).await.map_err(|_| SessionClosed)
    }

    /// Current room members other than self, sorted. May lag actual membership.
    pub fn peer_list(&self) -> Vec<NodeId> {
        let mut peers = self.topic.list_peers();
        peers.sort();
        peers
    }

    /// Leave the room: stop both loops, then release the subscription and the topic.
    pub async fn exit(mut self) {
        self.cancel.cancel();
        self.release().await;
    }

    /// Stop accepting sends, give queued ones up to `grace` to be published, then exit.
    pub async fn drain_and_exit(mut self, grace: Duration) {
        self.outgoing = None;
        let drained = match self.publish_task.as_mut() {
            Some(task) => tokio::time::timeout(grace, task).await.is_ok(),
            None => true,
        };
        if drained {
            self.publish_task = None;
        } else {
            debug!(room = %self.room_name, "grace delay elapsed with sends still queued");
        }
        self.cancel.cancel();
        self.release().await;
    }

    async fn release(&mut self) {
        if let Some(task) = self.receive_task.take() {
            match task.await {
                Ok(mut subscription) => subscription.cancel(),
                Err(e) => warn!(room = %self.room_name, error = %e, "receive loop failed"),
            }
        }
        if let Some(task) = self.publish_task.take() {
            if let Err(e) = task.await {
                warn!(room = %self.room_name, error = %e, "publish loop failed");
            }
        }
        self.topic.close();
        info!(room = %self.room_name, generation = self.generation, "left room");
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn or_default(value: &str, default: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

/// Deliver a log event. Once the session is cancelled nobody waits for room in the channel.
async fn emit(logs: &mpsc::Sender<LogEvent>, cancel: &CancellationToken, event: LogEvent) {
    trace!(%event, "session log");
    if cancel.is_cancelled() {
        let _ = logs.try_send(event);
        return;
    }
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = logs.send(event) => {}
    }
}

async fn publish_loop(
    topic: Arc<dyn Topic>,
    mut outgoing: mpsc::Receiver<String>,
    logs: mpsc::Sender<LogEvent>,
    display_name: watch::Receiver<String>,
    self_id: NodeId,
    cancel: CancellationToken,
) {
    loop {
        let text = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            text = outgoing.recv() => match text {
                Some(text) => text,
                None => break,
            },
        };
        let msg = ChatMessage {
            message: text,
            sender_id: self_id,
            sender_name: display_name.borrow().clone(),
        };
        let payload = match encode_message(&msg) {
            Ok(payload) => payload,
            Err(e) => {
                emit(&logs, &cancel, LogEvent::puberr(format!("could not encode message: {}", e)))
                    .await;
                continue;
            }
        };
        if let Err(e) = topic.publish(payload).await {
            emit(&logs, &cancel, LogEvent::puberr(format!("could not publish to topic: {}", e)))
                .await;
        }
    }
    trace!(topic = topic.name(), "publish loop stopped");
}

async fn receive_loop(
    mut subscription: Box<dyn Subscription>,
    incoming: mpsc::Sender<ChatMessage>,
    logs: mpsc::Sender<LogEvent>,
    self_id: NodeId,
    cancel: CancellationToken,
) -> Box<dyn Subscription> {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = subscription.next() => next,
        };
        let raw = match next {
            Ok(raw) => raw,
            Err(e) => {
                debug!(error = %e, "subscription read failed");
                break;
            }
        };
        // the topic echoes our own publishes back
        if raw.source == self_id {
            continue;
        }
        let msg = match decode_message(&raw.data) {
            Ok(msg) => msg,
            Err(e) => {
                emit(
                    &logs,
                    &cancel,
                    LogEvent::suberr(format!("could not decode message from {}: {}", raw.source.short(), e)),
                )
                .await;
                continue;
            }
        };
        if msg.sender_id != raw.source {
            emit(
                &logs,
                &cancel,
                LogEvent::suberr(format!(
                    "dropped message from {} claiming sender {}",
                    raw.source.short(),
                    msg.sender_id.short()
                )),
            )
            .await;
            continue;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = incoming.send(msg) => if sent.is_err() {
                break;
            },
        }
    }
    drop(incoming);
    emit(&logs, &cancel, LogEvent::suberr("subscription has closed")).await;
    subscription
}
