use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::config::Config;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::reaper;

/// One engine per organization, each with its own WAL, notification hub,
/// overdue watcher and compactor. Nothing is shared across organizations.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    overdue_scan_interval: Duration,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, overdue_scan_interval: Duration) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            overdue_scan_interval,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.data_dir.clone(),
            config.compact_threshold,
            config.overdue_scan_interval,
        )
    }

    /// Get or lazily open the engine for an organization.
    pub fn get_or_create(&self, organization_id: &str) -> io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(organization_id) {
            return Ok(engine.value().clone());
        }
        if organization_id.len() > MAX_TENANT_NAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "organization id too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many organizations"));
        }

        // The id is the file name as-is; anything that would need rewriting
        // is refused so two ids can never share a WAL.
        if !is_valid_organization_id(organization_id) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "organization id must be non-empty [a-z0-9_-]",
            ));
        }

        std::fs::create_dir_all(&self.data_dir)?;
        let wal_path = self.data_dir.join(format!("{organization_id}.wal"));

        // Two callers racing on a new organization must end up with the same engine.
        let engine = match self.engines.entry(organization_id.to_string()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new()))?);
                slot.insert(engine.clone());
                engine
            }
        };

        tokio::spawn(reaper::run_overdue_watcher(engine.clone(), self.overdue_scan_interval));
        tokio::spawn(reaper::run_compactor(engine.clone(), self.compact_threshold));

        metrics::gauge!(crate::observability::ORGANIZATIONS_ACTIVE).set(self.engines.len() as f64);
        info!("opened organization {organization_id}");
        Ok(engine)
    }
}

fn is_valid_organization_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
}
