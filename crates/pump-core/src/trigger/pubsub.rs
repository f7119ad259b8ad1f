//! Message-driven firing: one fire per matching broadcast message.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Trigger;

pub struct PubSubTrigger<M> {
    trigger: Arc<Trigger>,
    receiver: broadcast::Receiver<M>,
    filter: Box<dyn Fn(&M) -> bool + Send + Sync>,
}

impl<M: Clone + Send + 'static> PubSubTrigger<M> {
    /// Fire on every message received.
    pub fn new(trigger: Arc<Trigger>, receiver: broadcast::Receiver<M>) -> Self {
        Self {
            trigger,
            receiver,
            filter: Box::new(|_| true),
        }
    }

    /// Only fire for messages accepted by `filter`.
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&M) -> bool + Send + Sync + 'static,
    {
        self.filter = Box::new(filter);
        self
    }

    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = self.receiver.recv() => message,
                };
                match message {
                    Ok(message) if (self.filter)(&message) => {
                        self.trigger.fire();
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(trigger = self.trigger.id(), skipped, "PubSub trigger lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(trigger = self.trigger.id(), "PubSub trigger stopped");
        })
    }
}
