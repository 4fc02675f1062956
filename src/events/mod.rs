//! In-process event bus
//!
//! Decouples chat-history persistence from the pipeline: the session
//! publishes `add_message`, `session_end` and `exit_chat` events, and the
//! history workers (plus the controller's own exit handler) subscribe.
//! Publication never blocks the pipeline; each subscriber gets its own
//! unbounded channel and offloads work on its own task.

use std::sync::RwLock;

use tokio::sync::mpsc;
use tracing::debug;

use crate::types::{AddMessageEvent, ExitChatEvent, SessionEndEvent};

/// Event topics carried by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    AddMessage,
    SessionEnd,
    ExitChat,
}

/// A published event.
#[derive(Debug, Clone)]
pub enum BusEvent {
    AddMessage(AddMessageEvent),
    SessionEnd(SessionEndEvent),
    ExitChat(ExitChatEvent),
}

impl BusEvent {
    pub fn topic(&self) -> Topic {
        match self {
            BusEvent::AddMessage(_) => Topic::AddMessage,
            BusEvent::SessionEnd(_) => Topic::SessionEnd,
            BusEvent::ExitChat(_) => Topic::ExitChat,
        }
    }
}

#[derive(Default)]
struct Subscribers {
    add_message: Vec<mpsc::UnboundedSender<BusEvent>>,
    session_end: Vec<mpsc::UnboundedSender<BusEvent>>,
    exit_chat: Vec<mpsc::UnboundedSender<BusEvent>>,
}

impl Subscribers {
    fn for_topic(&self, topic: Topic) -> &Vec<mpsc::UnboundedSender<BusEvent>> {
        match topic {
            Topic::AddMessage => &self.add_message,
            Topic::SessionEnd => &self.session_end,
            Topic::ExitChat => &self.exit_chat,
        }
    }

    fn for_topic_mut(&mut self, topic: Topic) -> &mut Vec<mpsc::UnboundedSender<BusEvent>> {
        match topic {
            Topic::AddMessage => &mut self.add_message,
            Topic::SessionEnd => &mut self.session_end,
            Topic::ExitChat => &mut self.exit_chat,
        }
    }
}

/// Topic → subscriber-channel dispatch.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Subscribers>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for one topic. Events arrive on the returned
    /// channel in publication order.
    pub fn subscribe(&self, topic: Topic) -> mpsc::UnboundedReceiver<BusEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().unwrap().for_topic_mut(topic).push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber of its topic. Dead
    /// subscribers are skipped (and pruned on the next publish pass).
    pub fn publish(&self, event: BusEvent) {
        let topic = event.topic();
        let dead = {
            let guard = self.subscribers.read().unwrap();
            let subs = guard.for_topic(topic);
            let mut dead = false;
            for tx in subs.iter() {
                if tx.send(event.clone()).is_err() {
                    dead = true;
                }
            }
            dead
        };
        if dead {
            let mut guard = self.subscribers.write().unwrap();
            let subs = guard.for_topic_mut(topic);
            subs.retain(|tx| !tx.is_closed());
            debug!(?topic, remaining = subs.len(), "pruned closed bus subscribers");
        }
    }
}
