//! Lifecycle management for locally hosted web UIs: install, repair, run and
//! remove instances, with every long operation exposed as a tracked task.

pub mod catalog;
pub mod config;
pub mod error;
pub mod fs_walk;
pub mod instance_registry;
pub mod json_store;
pub mod process;
pub mod setup;
pub mod signals;
pub mod supervisor;
pub mod task_tracker;
pub mod workflow;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use crate::{
    catalog::Catalog,
    config::AgentConfig,
    error::Result,
    instance_registry::InstanceRegistry,
    supervisor::ProcessSupervisor,
    task_tracker::{NotificationSink, TaskTracker},
    workflow::InstallationManager,
};

/// Every long-lived component, constructed in dependency order.
#[derive(Debug, Clone)]
pub struct Agent {
    pub config: AgentConfig,
    pub catalog: Arc<Catalog>,
    pub tracker: TaskTracker,
    pub instances: Arc<InstanceRegistry>,
    pub supervisor: ProcessSupervisor,
    pub manager: InstallationManager,
}

impl Agent {
    /// Loads persisted state and adopts processes that survived a previous run.
    pub async fn open(config: AgentConfig, sink: Arc<dyn NotificationSink>) -> Result<Self> {
        let catalog = Arc::new(Catalog::load(config.catalog_path.as_deref())?);
        tracing::info!(kinds = catalog.list().len(), "ui catalog loaded");

        let tracker = TaskTracker::new(sink);
        let instances = Arc::new(InstanceRegistry::open(config.instance_registry_path()).await);
        let supervisor =
            ProcessSupervisor::open(&config, tracker.clone(), instances.clone(), catalog.clone())
                .await?;
        let manager = InstallationManager::new(
            config.clone(),
            tracker.clone(),
            instances.clone(),
            supervisor.clone(),
            catalog.clone(),
        );

        Ok(Self {
            config,
            catalog,
            tracker,
            instances,
            supervisor,
            manager,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingSink;

    #[tokio::test]
    async fn open_on_empty_data_root() {
        let dir = tempfile::tempdir().unwrap();
        let agent = Agent::open(
            AgentConfig::with_data_root(dir.path()),
            RecordingSink::new(),
        )
        .await
        .unwrap();

        assert!(agent.instances.list_all().is_empty());
        assert!(agent.supervisor.list().is_empty());
        assert!(agent.tracker.list_all().is_empty());
        assert!(!agent.catalog.list().is_empty());
    }
}
