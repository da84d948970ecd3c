use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Fan-out of events to every live subscriber, in emission order.
///
/// Subscribers only see events emitted after they subscribed. Dropped
/// receivers are pruned on the next emit.
#[derive(Debug)]
pub struct EventHub<T> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T> Default for EventHub<T> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> EventHub<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: T) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
