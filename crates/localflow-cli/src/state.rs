//! Application state wiring the runtime to its concrete collaborators.
//!
//! The runtime is generic over store and invoker; AppState pins them to the
//! SQLite store and the activity registry.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use localflow_core::activity::ActivityRegistry;
use localflow_core::timer::clock::SystemClock;
use localflow_core::workflow::runtime::{RuntimeOptions, WorkflowRuntime};
use localflow_infra::activity::register_process_activities;
use localflow_infra::config::{load_global_config, resolve_activities_dir};
use localflow_infra::filesystem::{ensure_data_dir, resolve_data_dir};
use localflow_infra::sqlite::pool::DatabasePool;
use localflow_infra::sqlite::workflow::SqliteWorkflowStore;
use localflow_types::config::GlobalConfig;

use crate::activities::register_builtin_activities;

pub type ConcreteStore = Arc<SqliteWorkflowStore>;

pub type ConcreteRuntime = WorkflowRuntime<ConcreteStore, ActivityRegistry>;

/// Shared application state used by every command handler.
pub struct AppState {
    pub runtime: Arc<ConcreteRuntime>,
    pub store: ConcreteStore,
    /// Names of all registered activities, sorted.
    pub activities: Vec<String>,
    pub config: GlobalConfig,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Initialize the application state: data dir, config, DB, activities.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        ensure_data_dir(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let config = load_global_config(&data_dir).await;

        let db_pool = DatabasePool::open_in(&data_dir)
            .await
            .context("Failed to open workflow database")?;
        let store = Arc::new(SqliteWorkflowStore::new(db_pool));

        let mut registry = ActivityRegistry::with_retry(config.retry.clone());
        register_builtin_activities(&mut registry);
        let activities_dir = resolve_activities_dir(&config, &data_dir);
        let scripts = register_process_activities(&mut registry, &activities_dir)
            .await
            .with_context(|| format!("Failed to scan activities in {}", activities_dir.display()))?;
        let activities = registry.names();

        let runtime = WorkflowRuntime::new(
            Arc::clone(&store),
            registry,
            Arc::new(SystemClock),
            RuntimeOptions::from(&config),
        );
        let definitions = runtime.load_definitions().await?;

        tracing::debug!(
            data_dir = %data_dir.display(),
            definitions,
            script_activities = scripts,
            "application state initialized"
        );

        Ok(Self {
            runtime: Arc::new(runtime),
            store,
            activities,
            config,
            data_dir,
        })
    }
}
