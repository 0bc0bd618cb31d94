use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cache::AvailabilityCache;
use crate::config::TenantConfig;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::reaper;

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL + cache
/// + reaper + compactor. Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    config: TenantConfig,
    shutdown: CancellationToken,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, config: TenantConfig) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if self.shutdown.is_cancelled() {
            return Err(std::io::Error::other("server is shutting down"));
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Sanitize tenant name to prevent path traversal
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        // Two connections may race to create the same tenant; the entry lock
        // makes exactly one of them open the WAL.
        let engine = match self.engines.entry(tenant.to_string()) {
            dashmap::Entry::Occupied(e) => return Ok(e.get().clone()),
            dashmap::Entry::Vacant(slot) => {
                let engine = self.open_engine(&safe_name)?;
                slot.insert(engine.clone());
                engine
            }
        };

        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        info!("tenant {safe_name} loaded");
        Ok(engine)
    }

    fn open_engine(&self, safe_name: &str) -> std::io::Result<Arc<Engine>> {
        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notify = Arc::new(NotifyHub::new());
        let cache = Arc::new(AvailabilityCache::new(&self.config.cache));
        cache.init();
        let engine = Arc::new(Engine::new(wal_path, notify, cache, self.config.engine.clone())?);

        let reaper_cfg = &self.config.reaper;
        tokio::spawn(reaper::run_reaper(
            engine.clone(),
            reaper_cfg.interval,
            self.shutdown.child_token(),
        ));
        tokio::spawn(reaper::run_compactor(
            engine.clone(),
            reaper_cfg.compact_threshold,
            reaper_cfg.compact_check_interval,
            self.shutdown.child_token(),
        ));
        Ok(engine)
    }

    pub fn tenant_count(&self) -> usize {
        self.engines.len()
    }

    /// Stop background tasks and close every tenant's cache. Engines stay
    /// usable for in-flight requests; reads fall back to the store.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for engine in self.engines.iter() {
            engine.value().cache().shutdown();
        }
        info!("tenant manager shut down ({} tenants)", self.engines.len());
    }
}
