use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use pump_core::registry::spawn_trigger;
use pump_core::{CancellationToken, FactoryContext, Pipeline, PumpService, StageRegistry, Trigger};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::PumpFile;

/// Pipelines and triggers built from a definition file.
pub struct App {
    file: PumpFile,
    service: Arc<PumpService<String>>,
    triggers: HashMap<String, Arc<Trigger>>,
}

impl App {
    pub fn build(file: PumpFile, registry: &StageRegistry<String>) -> Result<Self> {
        let service = Arc::new(PumpService::new());

        let mut ctx = FactoryContext::new(service.clone());
        for definition in &file.triggers {
            ctx = ctx.with_trigger(definition.create());
        }

        for definition in &file.pipelines {
            let pipeline = registry
                .build(definition, &ctx)
                .and_then(|builder| builder.build())
                .with_context(|| format!("Failed to build pipeline '{}'", definition.id))?;
            service.add_pipeline(pipeline)?;
        }

        Ok(Self {
            file,
            service,
            triggers: ctx.triggers,
        })
    }

    pub fn pipelines(&self) -> Vec<Arc<Pipeline<String>>> {
        self.service.pipelines()
    }

    fn spawn_triggers(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        self.file
            .triggers
            .iter()
            .filter_map(|definition| {
                let trigger = self.triggers.get(&definition.id)?.clone();
                Some(spawn_trigger(
                    definition,
                    trigger,
                    self.service.shutdown_token(),
                    cancel.child_token(),
                ))
            })
            .collect()
    }
}

/// Run until Ctrl-C or until a run-once trigger asks for shutdown.
pub async fn run(app: App) -> Result<()> {
    let cancel = CancellationToken::new();
    app.service.start();
    let policies = app.spawn_triggers(&cancel);
    info!(
        pipelines = app.file.pipelines.len(),
        triggers = policies.len(),
        "Pump started"
    );

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            info!("Ctrl-C received, shutting down");
        }
        _ = app.service.wait_for_shutdown() => {
            info!("Shutdown requested");
        }
    }

    cancel.cancel();
    for policy in policies {
        if let Err(e) = policy.await {
            warn!(error = %e, "Trigger policy task failed");
        }
    }
    app.service.stop().await;

    let snapshot = app.service.snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

/// Print the depth layout of every pipeline.
pub fn check(app: &App) {
    for pipeline in app.pipelines() {
        println!("{}", pipeline.id());
        for (depth, stages) in pipeline.layout().iter().enumerate() {
            println!("  depth {depth}: {}", stages.join(" -> "));
        }
    }
}
