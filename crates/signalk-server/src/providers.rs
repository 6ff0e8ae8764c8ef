//! Starts one pipeline per configured provider and ends them together.

use std::path::PathBuf;
use std::sync::Arc;

use signalk_core::config::ProviderConfig;
use signalk_providers::{LogRegistry, Pipeline, PipelineContext, Record};
use tracing::{error, info};

pub struct ProviderManager {
    ctx: PipelineContext,
    pipelines: Vec<Pipeline>,
}

impl ProviderManager {
    pub fn new(ctx: PipelineContext) -> Self {
        Self {
            ctx,
            pipelines: Vec::new(),
        }
    }

    /// Raw logs of providers with `logging` set go to `directory`.
    pub fn with_logging_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        let directory = directory.into();
        match LogRegistry::new(&directory) {
            Ok(registry) => self.ctx = self.ctx.with_log_registry(Arc::new(registry)),
            Err(e) => error!("Cannot start raw logging to {}: {}", directory.display(), e),
        }
        self
    }

    /// Start every enabled provider. A provider whose settings are invalid
    /// is reported and skipped; the others still start.
    pub fn start_all(&mut self, providers: &[ProviderConfig]) -> usize {
        let mut started = 0;
        for config in providers {
            if !config.enabled {
                info!("{}: disabled", config.id);
                continue;
            }
            if self.start(config) {
                started += 1;
            }
        }
        started
    }

    pub fn start(&mut self, config: &ProviderConfig) -> bool {
        if self.get(&config.id).is_some() {
            error!("{}: a provider with this id is already running", config.id);
            return false;
        }
        match Pipeline::from_provider(config, &self.ctx) {
            Ok(pipeline) => {
                self.pipelines.push(pipeline);
                true
            }
            Err(e) => {
                error!("{}: not started: {}", config.id, e);
                self.ctx.app.error(&config.id, e.to_string());
                false
            }
        }
    }

    pub fn get(&self, provider_id: &str) -> Option<&Pipeline> {
        self.pipelines.iter().find(|p| p.provider_id() == provider_id)
    }

    pub fn provider_ids(&self) -> Vec<&str> {
        self.pipelines.iter().map(Pipeline::provider_id).collect()
    }

    /// Send `record` out through a provider's transport.
    pub fn write(&self, provider_id: &str, record: Record) -> bool {
        self.get(provider_id).map_or(false, |p| p.write(record))
    }

    /// End every pipeline and wait until they have drained.
    pub async fn shutdown(&mut self) {
        for pipeline in &mut self.pipelines {
            pipeline.end();
        }
        for pipeline in self.pipelines.drain(..) {
            pipeline.finished().await;
        }
        info!("All providers stopped");
    }
}
