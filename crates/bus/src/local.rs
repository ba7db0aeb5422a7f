use std::sync::{Arc, Mutex, MutexGuard};

use crate::Signal;

/// Identifies a subscriber so its own signals are not echoed back to it
pub type PeerId = u64;

#[derive(Default)]
struct Subscribers {
    next_id: PeerId,
    senders: Vec<(PeerId, crossbeam_channel::Sender<Signal>)>,
}

/// In-process publish/subscribe
///
/// Every subscriber receives every signal published after it subscribed.
/// Subscribers whose receiver has been dropped are forgotten on the next
/// publish.
#[derive(Clone, Default)]
pub struct LocalBus {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> crossbeam_channel::Receiver<Signal> {
        self.subscribe_peer().1
    }

    /// Subscribe as a peer whose own signals, published with
    /// [`LocalBus::publish_from`], are not delivered back to it.
    pub fn subscribe_peer(&self) -> (PeerId, crossbeam_channel::Receiver<Signal>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut subscribers = self.lock();
        subscribers.next_id += 1;
        let id = subscribers.next_id;
        subscribers.senders.push((id, tx));
        (id, rx)
    }

    #[tracing::instrument(skip(self, signal), fields(signal = signal.name()))]
    pub fn publish(&self, signal: Signal) {
        self.publish_from(None, signal);
    }

    pub fn publish_from(&self, origin: Option<PeerId>, signal: Signal) {
        tracing::debug!(?origin, ?signal, "publishing");
        self.lock().senders.retain(|(id, tx)| {
            if Some(*id) == origin {
                return true;
            }
            tx.send(signal.clone()).is_ok()
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().senders.len()
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("bus lock poisoned, continuing");
                poisoned.into_inner()
            }
        }
    }
}
