use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::storage::{CheckpointStore, DedupStore};

/// Runs named steps whose outputs are checkpointed per job.
///
/// A step that already has a saved output is not executed again; its saved
/// output is returned instead. Without a job id nothing is saved, which is
/// what one-off runs from the CLI use.
pub struct StepRunner<'a> {
    store: &'a dyn DedupStore,
    job_id: Option<Uuid>,
    replayed: usize,
}

impl<'a> StepRunner<'a> {
    pub fn durable(store: &'a dyn DedupStore, job_id: Uuid) -> Self {
        Self {
            store,
            job_id: Some(job_id),
            replayed: 0,
        }
    }

    pub fn ephemeral(store: &'a dyn DedupStore) -> Self {
        Self {
            store,
            job_id: None,
            replayed: 0,
        }
    }

    /// Steps answered from a checkpoint so far.
    pub fn replayed(&self) -> usize {
        self.replayed
    }

    pub async fn run<T, F>(&mut self, name: &str, step: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: Future<Output = Result<T>>,
    {
        let Some(job_id) = self.job_id else {
            return step.await;
        };

        if let Some(saved) = self.store.load_step(job_id, name).await? {
            debug!(%job_id, step = name, "Replaying checkpointed step");
            self.replayed += 1;
            return Ok(serde_json::from_value(saved)?);
        }

        let output = step.await?;
        self.store
            .save_step(job_id, name, &serde_json::to_value(&output)?)
            .await?;

        // First write wins: if a concurrent attempt saved first, use its output.
        match self.store.load_step(job_id, name).await? {
            Some(saved) => Ok(serde_json::from_value(saved)?),
            None => Ok(output),
        }
    }
}
