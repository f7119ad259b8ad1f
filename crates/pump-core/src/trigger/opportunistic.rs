//! Fire as often as the sources can keep up.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Trigger;
use crate::config::OpportunisticConfig;

/// Interval of the background tick that retries a fire held back by the
/// chilldown period.
pub const TICK_PERIOD: Duration = Duration::from_secs(1);

/// Fires on start (optionally), after every completed cycle and on a
/// background tick, but never twice within the chilldown period.
#[derive(Debug, Clone)]
pub struct OpportunisticTrigger {
    trigger: Arc<Trigger>,
    config: OpportunisticConfig,
}

impl OpportunisticTrigger {
    pub fn new(trigger: Arc<Trigger>, config: OpportunisticConfig) -> Self {
        Self { trigger, config }
    }

    pub fn trigger(&self) -> &Arc<Trigger> {
        &self.trigger
    }

    /// Fire unless the previous fire is more recent than the chilldown period.
    pub fn on_tick(&self) -> usize {
        if let Some(last) = self.trigger.last_fire_at()
            && Instant::now() < last + self.config.chilldown_period()
        {
            return 0;
        }
        self.trigger.fire()
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if self.config.run_immediately {
                self.on_tick();
            }

            let mut tick = tokio::time::interval_at(Instant::now() + TICK_PERIOD, TICK_PERIOD);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.trigger.woken() => {
                        self.on_tick();
                    }
                    _ = tick.tick() => {
                        self.on_tick();
                    }
                }
            }
            debug!(trigger = self.trigger.id(), "Opportunistic trigger stopped");
        })
    }
}
