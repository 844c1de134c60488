//! Storage of workflow definitions and execution checkpoints.
//!
//! The engine saves the [`ExecutionContext`] after every top-level node and
//! at the end of the run. Whatever implements [`ExecutionRepository`] owns
//! durability; the engine only needs the two calls below plus the loads
//! used by resume.

use crate::definition::WorkflowDefinition;
use crate::execution::ExecutionContext;
use async_trait::async_trait;
use klikkflow_core::{ExecutionId, WorkflowId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Errors from repository operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    /// Nothing stored under the given ID.
    NotFound { kind: &'static str, id: String },
    /// The backing store failed.
    Storage { message: String },
    /// Stored data could not be encoded or decoded.
    Serialization { message: String },
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { kind, id } => write!(f, "{kind} not found: {id}"),
            Self::Storage { message } => write!(f, "storage failed: {message}"),
            Self::Serialization { message } => write!(f, "serialization failed: {message}"),
        }
    }
}

impl std::error::Error for PersistenceError {}

/// Persistence interface used by the engine.
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Stores the current state of a run, replacing any earlier checkpoint.
    async fn save_execution_state(&self, context: &ExecutionContext)
    -> Result<(), PersistenceError>;

    /// Loads the latest checkpoint of a run.
    async fn load_execution_state(
        &self,
        execution_id: ExecutionId,
    ) -> Result<ExecutionContext, PersistenceError>;

    /// Loads a workflow definition.
    async fn load_workflow_definition(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<WorkflowDefinition, PersistenceError>;

    /// Stores a workflow definition.
    async fn save_workflow_definition(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<(), PersistenceError>;
}

/// Repository kept in process memory.
///
/// Only the latest state of each execution is kept. A repository built with
/// [`InMemoryRepository::with_history`] also records every checkpoint, so
/// callers can inspect or resume from intermediate states.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    workflows: Arc<Mutex<HashMap<WorkflowId, WorkflowDefinition>>>,
    executions: Arc<Mutex<HashMap<ExecutionId, ExecutionContext>>>,
    history: Option<Arc<Mutex<Vec<ExecutionContext>>>>,
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A repository that records every checkpoint it is handed.
    #[must_use]
    pub fn with_history() -> Self {
        Self {
            history: Some(Arc::default()),
            ..Self::default()
        }
    }

    /// Every checkpoint saved for a run, oldest first. Empty unless the
    /// repository was built with [`InMemoryRepository::with_history`].
    pub async fn checkpoints(&self, execution_id: ExecutionId) -> Vec<ExecutionContext> {
        let Some(history) = &self.history else {
            return Vec::new();
        };
        history
            .lock()
            .await
            .iter()
            .filter(|ctx| ctx.execution_id == execution_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryRepository {
    async fn save_execution_state(
        &self,
        context: &ExecutionContext,
    ) -> Result<(), PersistenceError> {
        self.executions
            .lock()
            .await
            .insert(context.execution_id, context.clone());
        if let Some(history) = &self.history {
            history.lock().await.push(context.clone());
        }
        Ok(())
    }

    async fn load_execution_state(
        &self,
        execution_id: ExecutionId,
    ) -> Result<ExecutionContext, PersistenceError> {
        self.executions
            .lock()
            .await
            .get(&execution_id)
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound {
                kind: "execution",
                id: execution_id.to_string(),
            })
    }

    async fn load_workflow_definition(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<WorkflowDefinition, PersistenceError> {
        self.workflows
            .lock()
            .await
            .get(&workflow_id)
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound {
                kind: "workflow",
                id: workflow_id.to_string(),
            })
    }

    async fn save_workflow_definition(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<(), PersistenceError> {
        self.workflows
            .lock()
            .await
            .insert(definition.id, definition.clone());
        Ok(())
    }
}

/// Repository storing one pretty-printed JSON file per workflow and per
/// execution under a root directory:
///
/// ```text
/// <root>/workflows/wf_<ulid>.json
/// <root>/executions/exec_<ulid>.json
/// ```
#[derive(Debug, Clone)]
pub struct FileRepository {
    root: PathBuf,
}

impl FileRepository {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn workflow_path(&self, workflow_id: WorkflowId) -> PathBuf {
        self.root.join("workflows").join(format!("{workflow_id}.json"))
    }

    fn execution_path(&self, execution_id: ExecutionId) -> PathBuf {
        self.root
            .join("executions")
            .join(format!("{execution_id}.json"))
    }
}

async fn write_json<T: serde::Serialize + Sync>(
    path: &Path,
    value: &T,
) -> Result<(), PersistenceError> {
    let content = serde_json::to_vec_pretty(value).map_err(|e| PersistenceError::Serialization {
        message: e.to_string(),
    })?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PersistenceError::Storage {
                message: format!("failed to create {}: {e}", parent.display()),
            })?;
    }
    // Stage beside the target and rename over it.
    let staging = path.with_extension("json.tmp");
    tokio::fs::write(&staging, content)
        .await
        .map_err(|e| PersistenceError::Storage {
            message: format!("failed to write {}: {e}", staging.display()),
        })?;
    tokio::fs::rename(&staging, path)
        .await
        .map_err(|e| PersistenceError::Storage {
            message: format!("failed to replace {}: {e}", path.display()),
        })?;
    debug!(path = %path.display(), "wrote json file");
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(
    path: &Path,
    kind: &'static str,
    id: String,
) -> Result<T, PersistenceError> {
    let content = match tokio::fs::read(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PersistenceError::NotFound { kind, id });
        }
        Err(e) => {
            return Err(PersistenceError::Storage {
                message: format!("failed to read {}: {e}", path.display()),
            });
        }
    };
    serde_json::from_slice(&content).map_err(|e| PersistenceError::Serialization {
        message: format!("{}: {e}", path.display()),
    })
}

#[async_trait]
impl ExecutionRepository for FileRepository {
    async fn save_execution_state(
        &self,
        context: &ExecutionContext,
    ) -> Result<(), PersistenceError> {
        write_json(&self.execution_path(context.execution_id), context).await
    }

    async fn load_execution_state(
        &self,
        execution_id: ExecutionId,
    ) -> Result<ExecutionContext, PersistenceError> {
        read_json(
            &self.execution_path(execution_id),
            "execution",
            execution_id.to_string(),
        )
        .await
    }

    async fn load_workflow_definition(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<WorkflowDefinition, PersistenceError> {
        read_json(
            &self.workflow_path(workflow_id),
            "workflow",
            workflow_id.to_string(),
        )
        .await
    }

    async fn save_workflow_definition(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<(), PersistenceError> {
        write_json(&self.workflow_path(definition.id), definition).await
    }
}
