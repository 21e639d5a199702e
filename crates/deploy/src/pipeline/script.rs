//! A step that runs a build or push script and watches its log.

use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::config::DeployTimings;
use crate::error::DeployResult;
use crate::pipeline::process::{ProcessRunner, tail_log};
use crate::steps::{ProgressState, Step, StepOutcome};
use crate::store::KeyValueStore;

const DONE: &str = "true";

/// What a [`ScriptStep`] runs and how it knows it is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptDefinition {
    pub name: String,
    /// Fully rendered command line.
    pub command: String,
    pub log_path: PathBuf,
    /// Log line the script prints when it succeeds.
    pub success_sentinel: String,
    /// Store key holding the persisted completion flag.
    pub completion_key: String,
    /// Extra values persisted alongside the completion flag.
    pub outputs: Vec<(String, String)>,
}

/// Idempotent script step.
///
/// Completion is persisted under the definition's key, so a resumed chain skips a
/// build or push that already finished instead of running it again.
pub struct ScriptStep<R> {
    definition: ScriptDefinition,
    runner: Arc<R>,
    store: Arc<dyn KeyValueStore>,
    timings: DeployTimings,
}

impl<R: ProcessRunner> ScriptStep<R> {
    pub fn new(
        definition: ScriptDefinition,
        runner: Arc<R>,
        store: Arc<dyn KeyValueStore>,
        timings: DeployTimings,
    ) -> Self {
        Self {
            definition,
            runner,
            store,
            timings,
        }
    }

    fn is_done(&self) -> bool {
        matches!(self.store.get(&self.definition.completion_key), Ok(Some(flag)) if flag == DONE)
    }

    async fn run(&self) -> DeployResult<()> {
        let definition = &self.definition;
        tracing::info!(step = %definition.name, log = %definition.log_path.display(), "Running script");

        self.runner.launch(&definition.command, &definition.log_path).await?;
        tail_log(
            &definition.log_path,
            &definition.success_sentinel,
            self.timings.log_poll(),
            self.timings.log_timeout(),
        )
        .await?;

        for (key, value) in &definition.outputs {
            self.store.put(key, value)?;
        }
        self.store.put(&definition.completion_key, DONE)
    }
}

impl<R: ProcessRunner> Step for ScriptStep<R> {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn resume(&mut self) -> BoxFuture<'_, StepOutcome> {
        async move {
            if self.is_done() {
                tracing::info!(step = %self.definition.name, "Already done, skipping");
                return StepOutcome::Completed;
            }

            match self.run().await {
                Ok(()) => StepOutcome::Completed,
                Err(err) => {
                    tracing::error!(step = %self.definition.name, code = err.code(), error = %err, "Script failed");
                    StepOutcome::Failed(format!(
                        "{} failed: {err}. Log: {}",
                        self.definition.name,
                        self.definition.log_path.display()
                    ))
                }
            }
        }
        .boxed()
    }

    fn reset(&mut self) -> DeployResult<()> {
        for (key, _) in &self.definition.outputs {
            self.store.clear(key)?;
        }
        self.store.clear(&self.definition.completion_key)
    }

    fn restored_state(&self) -> ProgressState {
        if self.is_done() {
            ProgressState::Completed
        } else {
            ProgressState::NotStarted
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Mutex;

    use tempdir::TempDir;

    use super::*;
    use crate::error::DeployError;
    use crate::store::MemoryStore;

    /// Writes a fixed log instead of running anything.
    #[derive(Default)]
    struct FakeRunner {
        output: String,
        launched: Mutex<Vec<String>>,
    }

    impl ProcessRunner for FakeRunner {
        async fn launch(&self, command: &str, log_path: &Path) -> DeployResult<()> {
            self.launched.lock().unwrap().push(command.to_string());
            std::fs::write(log_path, &self.output)
                .map_err(|err| DeployError::FileAccess(err.to_string()))
        }
    }

    fn definition(dir: &TempDir) -> ScriptDefinition {
        ScriptDefinition {
            name: "Push image".to_string(),
            command: "docker push repo:tag".to_string(),
            log_path: dir.path().join("push.log"),
            success_sentinel: "pushed".to_string(),
            completion_key: "pushed-flag".to_string(),
            outputs: vec![("image-uri".to_string(), "repo:tag".to_string())],
        }
    }

    #[tokio::test]
    async fn test_success_persists_completion_and_is_skipped_next_time() {
        let dir = TempDir::new("script").unwrap();
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let runner = Arc::new(FakeRunner {
            output: "image pushed".to_string(),
            ..FakeRunner::default()
        });

        let mut step = ScriptStep::new(definition(&dir), runner.clone(), store.clone(), DeployTimings::fast());
        assert_eq!(step.restored_state(), ProgressState::NotStarted);
        assert_eq!(step.resume().await, StepOutcome::Completed);
        assert_eq!(store.get("image-uri").unwrap().as_deref(), Some("repo:tag"));

        let mut resumed = ScriptStep::new(definition(&dir), runner.clone(), store.clone(), DeployTimings::fast());
        assert_eq!(resumed.restored_state(), ProgressState::Completed);
        assert_eq!(resumed.resume().await, StepOutcome::Completed);
        assert_eq!(runner.launched.lock().unwrap().len(), 1);

        resumed.reset().unwrap();
        assert_eq!(store.get("pushed-flag").unwrap(), None);
        assert_eq!(store.get("image-uri").unwrap(), None);
    }

    #[tokio::test]
    async fn test_failure_sentinel_fails_step() {
        let dir = TempDir::new("script").unwrap();
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let runner = Arc::new(FakeRunner {
            output: "login has failed.".to_string(),
            ..FakeRunner::default()
        });

        let mut step = ScriptStep::new(definition(&dir), runner, store.clone(), DeployTimings::fast());
        assert!(matches!(step.resume().await, StepOutcome::Failed(_)));
        assert_eq!(store.get("pushed-flag").unwrap(), None);
    }
}
