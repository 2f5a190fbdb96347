//! In-process publish/subscribe relay.
//!
//! Publishers push [`Message`]s into one unbounded ingress queue. A relay
//! task forwards each message verbatim to every subscriber whose prefix
//! matches the first frame (the topic). Subscriber queues are bounded;
//! a subscriber that falls behind misses messages. There is no replay and no
//! acknowledgment.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::message::Message;

/// Capacity of each subscriber queue.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 1024;

/// Topic names and builders.
pub mod topics {
    /// Kernel lifecycle notices.
    pub const KERNEL: &str = "KERNEL";
    /// Second frame of the notice sent once every module is started.
    pub const SYSTEM_READY: &str = "SYSTEM_READY";
    /// Second frame of the notice sent on a reload signal.
    pub const SIGHUP: &str = "SIGHUP";

    /// Readings produced by an authentication source.
    pub fn source(name: &str) -> String {
        format!("S_{name}")
    }

    /// Raw interrupts from a hardware device.
    pub fn interrupt(device: &str) -> String {
        format!("S_INT:{device}")
    }

    /// Internal service calls.
    pub fn service(name: &str) -> String {
        format!("SERVICE.{name}")
    }
}

/// Event bus failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    /// The relay has stopped.
    #[error("event bus is closed")]
    Closed,

    /// An empty message has no topic.
    #[error("message has no topic frame")]
    EmptyMessage,
}

struct Slot {
    prefixes: Vec<Vec<u8>>,
    tx: mpsc::Sender<Message>,
}

impl Slot {
    fn matches(&self, topic: &[u8]) -> bool {
        self.prefixes.iter().any(|p| topic.starts_with(p))
    }
}

type Registry = Arc<Mutex<Vec<Slot>>>;

/// Entry point: starts the relay.
pub struct EventBus;

impl EventBus {
    /// Spawn the relay on `runtime` and return a handle to it.
    pub fn start(runtime: &Handle) -> BusHandle {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let registry: Registry = Arc::new(Mutex::new(Vec::new()));

        let relay_registry = Arc::clone(&registry);
        runtime.spawn(async move {
            while let Some(msg) = rx.recv().await {
                fan_out(&relay_registry, msg);
            }
            debug!("event bus relay stopped");
        });

        BusHandle {
            publisher: Publisher { tx },
            registry,
            runtime: runtime.clone(),
        }
    }
}

fn fan_out(registry: &Registry, msg: Message) {
    let Some(topic) = msg.part(0) else {
        return;
    };
    let mut slots = registry.lock().unwrap_or_else(PoisonError::into_inner);
    slots.retain(|slot| {
        if !slot.matches(topic) {
            return true;
        }
        match slot.tx.try_send(msg.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!("subscriber queue full, message dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    });
}

/// Shared access to a running bus.
#[derive(Clone)]
pub struct BusHandle {
    publisher: Publisher,
    registry: Registry,
    runtime: Handle,
}

impl std::fmt::Debug for BusHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusHandle").finish_non_exhaustive()
    }
}

impl BusHandle {
    /// A new publishing endpoint.
    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    /// Publish through the handle's own endpoint.
    ///
    /// # Errors
    ///
    /// See [`Publisher::publish`].
    pub fn publish(&self, msg: Message) -> Result<(), BusError> {
        self.publisher.publish(msg)
    }

    /// Subscribe to every topic starting with one of `prefixes`.
    ///
    /// An empty prefix matches every topic.
    pub fn subscribe<I, P>(&self, prefixes: I) -> Subscriber
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let prefixes = prefixes.into_iter().map(|p| p.as_ref().to_vec()).collect();
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Slot { prefixes, tx });
        Subscriber {
            rx,
            runtime: self.runtime.clone(),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Publishing endpoint. Cheap to clone, usable from any thread.
#[derive(Clone, Debug)]
pub struct Publisher {
    tx: mpsc::UnboundedSender<Message>,
}

impl Publisher {
    /// Queue a message for the relay. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::EmptyMessage`] for a message without a topic and
    /// [`BusError::Closed`] when the relay is gone.
    pub fn publish(&self, msg: Message) -> Result<(), BusError> {
        if msg.is_empty() {
            return Err(BusError::EmptyMessage);
        }
        self.tx.send(msg).map_err(|_| BusError::Closed)
    }
}

/// Receiving endpoint of a subscription.
#[derive(Debug)]
pub struct Subscriber {
    rx: mpsc::Receiver<Message>,
    runtime: Handle,
}

impl Subscriber {
    /// Wait for the next message. `None` once the relay is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Take a message if one is queued.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Block the calling thread for up to `timeout` waiting for a message.
    ///
    /// Must be called from a plain thread, not from inside the runtime.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<Message> {
        let rx = &mut self.rx;
        self.runtime
            .block_on(async { tokio::time::timeout(timeout, rx.recv()).await })
            .ok()
            .flatten()
    }
}
