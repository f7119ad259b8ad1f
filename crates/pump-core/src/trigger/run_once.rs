//! Single-fire policy driving the application to stop.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::Trigger;

/// Fires once, waits for every armed source to finish its cycle, then
/// cancels the shutdown token.
#[derive(Debug, Clone)]
pub struct RunOnceTrigger {
    trigger: Arc<Trigger>,
    shutdown: CancellationToken,
}

impl RunOnceTrigger {
    pub fn new(trigger: Arc<Trigger>, shutdown: CancellationToken) -> Self {
        Self { trigger, shutdown }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let baseline = self.trigger.completed_cycles();
            let armed = self.trigger.fire() as u64;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.trigger.wait_completed(baseline + armed) => {}
            }
            info!(trigger = self.trigger.id(), cycles = armed, "Run-once trigger completed, shutting down");
            self.shutdown.cancel();
        })
    }
}
