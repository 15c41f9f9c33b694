//! In-memory `WorkflowStore` used by tests and ephemeral runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use localflow_types::error::RepositoryError;
use localflow_types::timer::Timer;
use localflow_types::workflow::{WorkflowDefinition, WorkflowEvent, WorkflowInstance};
use uuid::Uuid;

use super::workflow::WorkflowStore;

#[derive(Default)]
struct Tables {
    instances: HashMap<Uuid, WorkflowInstance>,
    event_log: BTreeMap<u64, WorkflowEvent>,
    timers: HashMap<Uuid, Timer>,
    definitions: BTreeMap<String, WorkflowDefinition>,
}

/// Volatile store: nothing survives the process, but the API and
/// round-trip guarantees match the SQLite store.
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    tables: Mutex<Tables>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().expect("store lock poisoned")
    }
}

impl WorkflowStore for InMemoryWorkflowStore {
    async fn save_instance(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        self.tables()
            .instances
            .insert(instance.id, instance.clone());
        Ok(())
    }

    async fn load_instance(&self, id: &Uuid) -> Result<WorkflowInstance, RepositoryError> {
        self.tables()
            .instances
            .get(id)
            .cloned()
            .ok_or(RepositoryError::NotFound)
    }

    async fn list_instances(&self) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let mut instances: Vec<_> = self.tables().instances.values().cloned().collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(instances)
    }

    async fn save_event_log(&self, events: &[WorkflowEvent]) -> Result<(), RepositoryError> {
        let mut tables = self.tables();
        for event in events {
            tables
                .event_log
                .entry(event.sequence)
                .or_insert_with(|| event.clone());
        }
        Ok(())
    }

    async fn load_event_log(&self) -> Result<Vec<WorkflowEvent>, RepositoryError> {
        Ok(self.tables().event_log.values().cloned().collect())
    }

    async fn save_timer(&self, timer: &Timer) -> Result<(), RepositoryError> {
        self.tables().timers.insert(timer.id, timer.clone());
        Ok(())
    }

    async fn delete_timer(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.tables().timers.remove(id).is_some())
    }

    async fn load_timers(&self) -> Result<Vec<Timer>, RepositoryError> {
        let mut timers: Vec<_> = self.tables().timers.values().cloned().collect();
        timers.sort_by(|a, b| {
            a.fire_at
                .cmp(&b.fire_at)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(timers)
    }

    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        self.tables()
            .definitions
            .insert(def.name.clone(), def.clone());
        Ok(())
    }

    async fn get_definition(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.tables().definitions.get(name).cloned())
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        Ok(self.tables().definitions.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use localflow_types::workflow::Step;

    use super::*;

    #[tokio::test]
    async fn test_load_unknown_instance_is_not_found() {
        let store = InMemoryWorkflowStore::new();
        let err = store.load_instance(&Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_event_log_empty_when_never_saved() {
        let store = InMemoryWorkflowStore::new();
        assert!(store.load_event_log().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_instance_roundtrip() {
        let store = InMemoryWorkflowStore::new();
        let instance = WorkflowInstance::new("order_flow", Utc::now());
        store.save_instance(&instance).await.unwrap();
        assert_eq!(store.load_instance(&instance.id).await.unwrap(), instance);
        assert_eq!(store.list_instances().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_timers_save_and_delete() {
        let store = InMemoryWorkflowStore::new();
        let now = Utc::now();
        let timer = Timer {
            id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            fire_at: now,
            duration_secs: 0,
            created_at: now,
        };
        store.save_timer(&timer).await.unwrap();
        assert_eq!(store.load_timers().await.unwrap(), vec![timer.clone()]);
        assert!(store.delete_timer(&timer.id).await.unwrap());
        assert!(!store.delete_timer(&timer.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_definitions_by_name() {
        let store = InMemoryWorkflowStore::new();
        let def = WorkflowDefinition {
            name: "order_flow".to_string(),
            steps: vec![Step::activity("charge_card")],
            source: None,
            registered_at: Utc::now(),
        };
        store.save_definition(&def).await.unwrap();
        assert_eq!(store.get_definition("order_flow").await.unwrap(), Some(def));
        assert!(store.get_definition("missing").await.unwrap().is_none());
    }
}
