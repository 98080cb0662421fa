//! Publish/subscribe channel between the task graph and the preview server.
//!
//! Task completion publishes a rebuilt event; the server side subscribes
//! and turns events into browser reload notifications. Publishing is
//! fire-and-forget with at-most-once delivery per subscriber, and
//! subscribers whose receiving end is gone are pruned on the next publish.

use std::sync::Mutex;

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::paths::AssetClass;

/// A notification that some part of the output directory changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rebuild {
    /// A transform task for the given class completed successfully.
    Class(AssetClass),
    /// Something changed that warrants a reload without a rebuild.
    Reload,
}

#[derive(Debug, Default)]
pub struct Broadcaster {
    subscribers: Mutex<Vec<Sender<Rebuild>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<Rebuild> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    pub fn publish(&self, event: Rebuild) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(event).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_reach_every_subscriber() {
        let broadcaster = Broadcaster::new();
        let a = broadcaster.subscribe();
        let b = broadcaster.subscribe();

        broadcaster.publish(Rebuild::Class(AssetClass::Styles));

        assert_eq!(a.try_recv().unwrap(), Rebuild::Class(AssetClass::Styles));
        assert_eq!(b.try_recv().unwrap(), Rebuild::Class(AssetClass::Styles));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let broadcaster = Broadcaster::new();
        let kept = broadcaster.subscribe();

        {
            let _gone = broadcaster.subscribe();
        }

        broadcaster.publish(Rebuild::Reload);
        broadcaster.publish(Rebuild::Reload);

        assert_eq!(kept.try_iter().count(), 2);
        assert_eq!(broadcaster.subscribers.lock().unwrap().len(), 1);
    }
}
