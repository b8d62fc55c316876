//! Event router: multiplexes user input, the active session's channels and a periodic
//! peer-list refresh into one stream of [`UiEvent`]s for a front-end to render.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::identity::NodeId;
use crate::protocol::{ChatMessage, LogEvent};
use crate::session::RoomSession;
use crate::switcher::RoomSwitcher;

/// One line of user input, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserInput {
    Chat(String),
    /// `/room <name>`
    SwitchRoom(String),
    /// `/user <name>`
    Rename(String),
    /// `/peers`
    ListPeers,
    /// `/quit` or `/exit`
    Quit,
}

impl UserInput {
    /// Classify a raw input line. Blank lines yield `None`; unknown commands are chat text.
    pub fn parse(line: &str) -> Option<UserInput> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return None;
        }
        let trimmed = line.trim();
        let (cmd, arg) = match trimmed.split_once(char::is_whitespace) {
            Some((cmd, arg)) => (cmd, arg.trim()),
            None => (trimmed, ""),
        };
        let input = match cmd {
            "/room" => UserInput::SwitchRoom(arg.to_string()),
            "/user" => UserInput::Rename(arg.to_string()),
            "/peers" => UserInput::ListPeers,
            "/quit" | "/exit" => UserInput::Quit,
            _ => UserInput::Chat(line.to_string()),
        };
        Some(input)
    }
}

/// What the front-end should show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    /// A message from another room member.
    Message(ChatMessage),
    /// Our own message, queued for publishing.
    Sent { name: String, text: String },
    Log(LogEvent),
    /// Room members other than self. `requested` is set for `/peers`, clear for the periodic refresh.
    Peers { peers: Vec<NodeId>, requested: bool },
    RoomChanged { room: String, generation: u64 },
    UserChanged(String),
    /// The router stopped; no further events follow.
    Closed,
}

/// Owns the active session and drives it from user input.
pub struct EventRouter {
    switcher: RoomSwitcher,
    session: RoomSession,
    events: mpsc::Sender<UiEvent>,
    teardowns: Vec<JoinHandle<()>>,
}

impl EventRouter {
    pub fn new(switcher: RoomSwitcher, session: RoomSession, events: mpsc::Sender<UiEvent>) -> Self {
        Self {
            switcher,
            session,
            events,
            teardowns: Vec::new(),
        }
    }

    /// Run until input ends, `/quit` arrives, `cancel` fires or the front-end goes away.
    /// Exits the active session before returning.
    pub async fn run(mut self, mut input: mpsc::Receiver<UserInput>, cancel: CancellationToken) {
        let mut refresh = tokio::time::interval(self.switcher.config().refresh_interval());
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut incoming_open = true;
        let mut logs_open = true;

        let mut running = self
            .emit(UiEvent::RoomChanged {
                room: self.session.room_name().to_string(),
                generation: self.session.generation(),
            })
            .await;

        while running {
            running = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                line = input.recv() => match line {
                    Some(line) => {
                        let switched = matches!(line, UserInput::SwitchRoom(_));
                        let keep_going = self.handle(line).await;
                        if switched {
                            incoming_open = true;
                            logs_open = true;
                        }
                        keep_going
                    }
                    None => false,
                },
                msg = self.session.incoming.recv(), if incoming_open => match msg {
                    Some(msg) => self.emit(UiEvent::Message(msg)).await,
                    None => {
                        debug!(room = self.session.room_name(), "incoming closed");
                        incoming_open = false;
                        true
                    }
                },
                log = self.session.logs.recv(), if logs_open => match log {
                    Some(log) => self.emit(UiEvent::Log(log)).await,
                    None => {
                        logs_open = false;
                        true
                    }
                },
                _ = refresh.tick() => {
                    let peers = self.session.peer_list();
                    self.emit(UiEvent::Peers { peers, requested: false }).await
                }
            };
        }

        let EventRouter {
            session,
            events,
            teardowns,
            ..
        } = self;
        session.exit().await;
        for teardown in teardowns {
            if let Err(e) = teardown.await {
                warn!(error = %e, "room teardown failed");
            }
        }
        let _ = events.send(UiEvent::Closed).await;
    }

    /// Returns `false` when the router should stop.
    async fn handle(&mut self, input: UserInput) -> bool {
        match input {
            UserInput::Chat(text) => {
                if self.session.send(text.clone()).await.is_err() {
                    return self
                        .emit(UiEvent::Log(LogEvent::puberr("room session closed")))
                        .await;
                }
                let name = self.session.display_name();
                self.emit(UiEvent::Sent { name, text }).await
            }
            UserInput::SwitchRoom(room) => {
                match self.switcher.switch_room(&mut self.session, "", &room).await {
                    Ok(teardown) => {
                        self.teardowns.retain(|t| !t.is_finished());
                        self.teardowns.push(teardown);
                        self.emit(UiEvent::RoomChanged {
                            room: self.session.room_name().to_string(),
                            generation: self.session.generation(),
                        })
                        .await
                    }
                    Err(e) => {
                        self.emit(UiEvent::Log(LogEvent::suberr(format!(
                            "could not switch to room {:?}: {}",
                            room, e
                        ))))
                        .await
                    }
                }
            }
            UserInput::Rename(name) => {
                if name.trim().is_empty() {
                    return true;
                }
                self.session.update_user(&name);
                let name = self.session.display_name();
                self.emit(UiEvent::UserChanged(name)).await
            }
            UserInput::ListPeers => {
                let peers = self.session.peer_list();
                self.emit(UiEvent::Peers {
                    peers,
                    requested: true,
                })
                .await
            }
            UserInput::Quit => false,
        }
    }

    /// Returns `false` once the front-end has dropped its receiver.
    async fn emit(&self, event: UiEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}
