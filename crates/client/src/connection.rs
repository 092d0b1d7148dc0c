//! Async driver for a [`ChannelMachine`].
//!
//! One tokio task owns the machine, the transport links and both timers.
//! Commands from the facade, transport events, the reconnect timer and the
//! keepalive interval are all multiplexed through a single `select!`, so
//! the machine only ever sees one input at a time.

use std::collections::HashMap;
use std::pin::Pin;

use supportdesk_shared::{ChannelIdentity, ChatError, Metadata};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};

use crate::machine::{ChannelMachine, ChatSnapshot, Effect, HandleId, TransportEvent};
use crate::transport::{Transport, TransportLink};

/// Requests from the facade to the driver task.
#[derive(Debug)]
pub(crate) enum Command {
    SetIdentity(Option<ChannelIdentity>),
    Send { content: String, metadata: Metadata },
    Connect,
    Disconnect,
    Shutdown,
}

enum Wake {
    Command(Option<Command>),
    Transport(HandleId, TransportEvent),
    ReconnectTimer(u64),
    KeepaliveTick,
}

struct Driver<T: Transport> {
    machine: ChannelMachine,
    transport: T,
    links: HashMap<HandleId, Box<dyn TransportLink>>,
    events_tx: mpsc::UnboundedSender<(HandleId, TransportEvent)>,
    reconnect: Option<(u64, Pin<Box<Sleep>>)>,
    keepalive: Option<Interval>,
    snapshots: watch::Sender<ChatSnapshot>,
    published_revision: u64,
}

/// Spawn the driver task. It runs until `Shutdown` arrives or every
/// command sender is dropped, tearing the channel down on the way out.
pub(crate) fn spawn_driver<T: Transport>(
    machine: ChannelMachine,
    transport: T,
    commands: mpsc::UnboundedReceiver<Command>,
    snapshots: watch::Sender<ChatSnapshot>,
) -> tokio::task::JoinHandle<()> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let published_revision = machine.revision();
    let driver = Driver {
        machine,
        transport,
        links: HashMap::new(),
        events_tx,
        reconnect: None,
        keepalive: None,
        snapshots,
        published_revision,
    };
    tokio::spawn(driver.run(commands, events_rx))
}

async fn wait_reconnect(timer: &mut Option<(u64, Pin<Box<Sleep>>)>) -> u64 {
    match timer {
        Some((generation, sleep)) => {
            sleep.as_mut().await;
            *generation
        }
        None => std::future::pending().await,
    }
}

async fn wait_keepalive(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl<T: Transport> Driver<T> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<(HandleId, TransportEvent)>,
    ) {
        loop {
            let wake = tokio::select! {
                command = commands.recv() => Wake::Command(command),
                Some((handle, event)) = events.recv() => Wake::Transport(handle, event),
                generation = wait_reconnect(&mut self.reconnect) => Wake::ReconnectTimer(generation),
                _ = wait_keepalive(&mut self.keepalive) => Wake::KeepaliveTick,
            };

            let effects = match wake {
                Wake::Command(None) | Wake::Command(Some(Command::Shutdown)) => {
                    let effects = self.machine.teardown();
                    self.apply(effects);
                    break;
                }
                Wake::Command(Some(command)) => self.handle_command(command),
                Wake::Transport(handle, event) => {
                    if matches!(event, TransportEvent::Closed(_)) {
                        self.links.remove(&handle);
                    }
                    self.machine.on_transport_event(handle, event)
                }
                Wake::ReconnectTimer(generation) => {
                    self.reconnect = None;
                    self.machine.on_reconnect_timer(generation)
                }
                Wake::KeepaliveTick => self.machine.on_keepalive_tick(),
            };
            self.apply(effects);
        }

        crate::log_debug!("Chat driver stopped");
    }

    fn handle_command(&mut self, command: Command) -> Vec<Effect> {
        match command {
            Command::SetIdentity(identity) => self.machine.set_identity(identity),
            Command::Send { content, metadata } => {
                match self.machine.send(&content, metadata) {
                    Ok(effects) => effects,
                    Err(ChatError::EmptyMessage) => Vec::new(),
                    Err(e) => {
                        crate::log_warn!("Chat send refused: {}", e);
                        Vec::new()
                    }
                }
            }
            Command::Connect => self.machine.connect(),
            Command::Disconnect => self.machine.disconnect(),
            Command::Shutdown => self.machine.teardown(),
        }
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Open { handle, url } => {
                    let link = self.transport.open(handle, url, self.events_tx.clone());
                    self.links.insert(handle, link);
                }
                Effect::Transmit { handle, frame } => {
                    let result = match self.links.get(&handle) {
                        Some(link) => link.send_text(frame),
                        None => Err(ChatError::NotConnected),
                    };
                    if let Err(e) = result {
                        self.machine.on_transmit_failed(handle, &e);
                    }
                }
                Effect::Close {
                    handle,
                    code,
                    reason,
                } => {
                    if let Some(link) = self.links.get(&handle) {
                        link.close(code, &reason);
                    }
                }
                Effect::Quiesce {
                    handle,
                    code,
                    reason,
                } => {
                    if let Some(link) = self.links.remove(&handle) {
                        link.detach();
                        link.close(code, &reason);
                    }
                }
                Effect::ScheduleReconnect { generation, delay } => {
                    self.reconnect = Some((generation, Box::pin(tokio::time::sleep(delay))));
                }
                Effect::CancelReconnect => self.reconnect = None,
                Effect::StartKeepalive { interval } => {
                    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    self.keepalive = Some(ticker);
                }
                Effect::StopKeepalive => self.keepalive = None,
            }
        }
        self.publish();
    }

    fn publish(&mut self) {
        let revision = self.machine.revision();
        if revision != self.published_revision {
            self.published_revision = revision;
            self.snapshots.send_replace(self.machine.snapshot());
        }
    }
}
