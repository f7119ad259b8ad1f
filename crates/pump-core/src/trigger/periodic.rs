//! Fixed-interval firing.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Trigger;
use crate::config::PeriodicConfig;

#[derive(Debug, Clone)]
pub struct PeriodicTrigger {
    trigger: Arc<Trigger>,
    config: PeriodicConfig,
}

impl PeriodicTrigger {
    pub fn new(trigger: Arc<Trigger>, config: PeriodicConfig) -> Self {
        Self { trigger, config }
    }

    pub fn trigger(&self) -> &Arc<Trigger> {
        &self.trigger
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let interval = self.config.interval();
            let start = if self.config.run_immediately {
                Instant::now()
            } else {
                Instant::now() + interval
            };
            let mut timer = tokio::time::interval_at(start, interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {
                        self.trigger.fire();
                    }
                }
            }
            debug!(trigger = self.trigger.id(), "Periodic trigger stopped");
        })
    }
}
