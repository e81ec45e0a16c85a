//! Named publish/subscribe hub between the server and presentation code.
//!
//! Handlers run off the publishing task (on the blocking pool when a tokio
//! runtime is present, otherwise on a fresh thread), so a slow or panicking
//! subscriber never stalls the coordination loop. No ordering is promised
//! between handlers or between events.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock, RwLock};

use serde::Serialize;
use tracing::{debug, trace};

pub const EVENT_NEW_CONNECTION_REQUEST: &str = "new_connection_request";
pub const EVENT_THREAD_LIST_UPDATED: &str = "thread_list_updated";
pub const EVENT_NEW_MESSAGE: &str = "new_message";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewConnectionRequest,
    ThreadListUpdated,
    NewMessage,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewConnectionRequest => EVENT_NEW_CONNECTION_REQUEST,
            Self::ThreadListUpdated => EVENT_THREAD_LIST_UPDATED,
            Self::NewMessage => EVENT_NEW_MESSAGE,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            EVENT_NEW_CONNECTION_REQUEST => Ok(Self::NewConnectionRequest),
            EVENT_THREAD_LIST_UPDATED => Ok(Self::ThreadListUpdated),
            EVENT_NEW_MESSAGE => Ok(Self::NewMessage),
            other => Err(format!("unknown event {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConnectionRequestEvent {
    pub peer_id: String,
    pub username: String,
    pub avatar_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewMessageEvent {
    pub from: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Event {
    NewConnectionRequest(NewConnectionRequestEvent),
    ThreadListUpdated,
    NewMessage(NewMessageEvent),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::NewConnectionRequest(_) => EventKind::NewConnectionRequest,
            Event::ThreadListUpdated => EventKind::ThreadListUpdated,
            Event::NewMessage(_) => EventKind::NewMessage,
        }
    }
}

type Handler = Arc<dyn Fn(Event) + Send + Sync + 'static>;

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<Handler>>>,
}

static GLOBAL: OnceLock<Arc<EventBus>> = OnceLock::new();

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide bus, created on first use. Prefer passing an
    /// `Arc<EventBus>` explicitly; this exists for call sites that cannot.
    pub fn global() -> Arc<EventBus> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(EventBus::new())))
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.entry(kind).or_default().push(Arc::new(handler));
        debug!(event = %kind, "Subscribed handler");
    }

    /// Dispatch `event` to every handler of its kind without waiting for
    /// them. With no subscribers this does nothing.
    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        let handlers: Vec<Handler> = {
            let table = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            match table.get(&kind) {
                Some(list) => list.clone(),
                None => Vec::new(),
            }
        };

        trace!(event = %kind, subscribers = handlers.len(), "Publishing event");

        for handler in handlers {
            let event = event.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(rt) => {
                    rt.spawn_blocking(move || handler(event));
                }
                Err(_) => {
                    std::thread::spawn(move || handler(event));
                }
            }
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        let counts: HashMap<&str, usize> = table.iter().map(|(k, v)| (k.as_str(), v.len())).collect();
        f.debug_struct("EventBus").field("subscribers", &counts).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn chat(from: &str, message: &str) -> Event {
        Event::NewMessage(NewMessageEvent {
            from: from.into(),
            message: message.into(),
        })
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish(Event::ThreadListUpdated);
        assert!(format!("{bus:?}").contains("subscribers: {}"));
    }

    #[test]
    fn test_every_handler_of_kind_runs() {
        let bus = EventBus::new();
        let (tx, rx) = mpsc::channel();

        for i in 0..3 {
            let tx = tx.clone();
            bus.subscribe(EventKind::NewMessage, move |event| {
                let _ = tx.send((i, event));
            });
        }
        let other = tx.clone();
        bus.subscribe(EventKind::ThreadListUpdated, move |event| {
            let _ = other.send((99, event));
        });

        bus.publish(chat("P1", "hi"));

        let mut seen: Vec<i32> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap().0)
            .collect();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2]);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[tokio::test]
    async fn test_blocked_handler_does_not_block_publisher() {
        let bus = EventBus::new();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = std::sync::Mutex::new(gate_rx);
        let (tx, rx) = mpsc::channel();

        bus.subscribe(EventKind::NewMessage, move |_| {
            let _ = gate_rx.lock().map(|rx| rx.recv());
        });
        bus.subscribe(EventKind::NewMessage, move |event| {
            let _ = tx.send(event);
        });

        bus.publish(chat("P1", "hi"));
        let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got, chat("P1", "hi"));
        gate_tx.send(()).unwrap();
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let bus = EventBus::new();
        let (tx, rx) = mpsc::channel();
        bus.subscribe(EventKind::ThreadListUpdated, |_| panic!("subscriber bug"));
        bus.subscribe(EventKind::ThreadListUpdated, move |e| {
            let _ = tx.send(e);
        });

        bus.publish(Event::ThreadListUpdated);
        bus.publish(Event::ThreadListUpdated);
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn test_event_names() {
        assert_eq!(EventKind::NewConnectionRequest.to_string(), "new_connection_request");
        assert_eq!("new_message".parse::<EventKind>().unwrap(), EventKind::NewMessage);
        assert!("nope".parse::<EventKind>().is_err());

        let json = serde_json::to_value(chat("P1", "hi")).unwrap();
        assert_eq!(json["event"], "new_message");
        assert_eq!(json["data"]["from"], "P1");
    }

    #[test]
    fn test_global_is_shared() {
        let a = EventBus::global();
        let b = EventBus::global();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
