//! Ordered, resumable steps sharing one progress state machine.
//!
//! A [`StepChain`] owns its steps and drives them with a scheduler loop:
//! completing step `i` starts step `i + 1`, and so on until a step pauses,
//! fails, or the chain ends. Nothing recurses, so chain length does not grow
//! the call stack.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::DeployResult;

const EVENT_CAPACITY: usize = 64;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, strum::Display,
)]
pub enum ProgressState {
    #[default]
    NotStarted,
    InProgress,
    InProgressWarning,
    InProgressError,
    Completed,
    CompletedWarning,
}

impl ProgressState {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed | Self::CompletedWarning)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Severity {
    Warning,
    Error,
}

/// What a step reports after one resume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    CompletedWithWarning(String),
    /// Recoverable problem; the chain stops here until the step is retried.
    Warning(String),
    Failed(String),
    /// Waiting on something outside the chain, which later calls
    /// [`StepChain::complete_step`].
    Pending,
}

/// One unit of work in a [`StepChain`].
pub trait Step: Send {
    fn name(&self) -> &str;

    /// Do the step's work, or notice that it was already done.
    fn resume(&mut self) -> BoxFuture<'_, StepOutcome>;

    /// Forget any external side effect the step recorded.
    fn reset(&mut self) -> DeployResult<()> {
        Ok(())
    }

    /// State to assume when the chain is assembled, e.g. from a persisted flag.
    fn restored_state(&self) -> ProgressState {
        ProgressState::NotStarted
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    #[error("cannot {action} step '{step}' while it is {state}")]
    InvalidTransition {
        step: String,
        state: ProgressState,
        action: &'static str,
    },

    #[error("no step at index {0}")]
    OutOfRange(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepEvent {
    StateChanged {
        index: usize,
        name: String,
        state: ProgressState,
    },
    Message {
        index: usize,
        severity: Severity,
        message: String,
    },
}

struct Slot {
    step: Box<dyn Step>,
    state: ProgressState,
}

pub struct StepChain {
    slots: Vec<Slot>,
    events: broadcast::Sender<StepEvent>,
}

impl StepChain {
    /// Assemble a chain in order, taking each step's restored state.
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let slots = steps
            .into_iter()
            .map(|step| Slot {
                state: step.restored_state(),
                step,
            })
            .collect();
        Self { slots, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StepEvent> {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn state(&self, index: usize) -> Option<ProgressState> {
        self.slots.get(index).map(|slot| slot.state)
    }

    pub fn states(&self) -> Vec<ProgressState> {
        self.slots.iter().map(|slot| slot.state).collect()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.slots.get(index).map(|slot| slot.step.name())
    }

    pub fn next(&self, index: usize) -> Option<usize> {
        (index + 1 < self.slots.len()).then_some(index + 1)
    }

    pub fn prev(&self, index: usize) -> Option<usize> {
        (index > 0 && index < self.slots.len()).then(|| index - 1)
    }

    /// Index of the first step that is not completed, where [`StepChain::start`] resumes.
    pub fn setup(&self) -> Option<usize> {
        self.slots.iter().position(|slot| !slot.state.is_completed())
    }

    /// Resume the chain from its first unfinished step.
    pub async fn start(&mut self) -> Result<(), StepError> {
        match self.setup() {
            Some(index) => self.try_start(index).await,
            None => Ok(()),
        }
    }

    /// Start or retry step `index`. A completed step must be reset first.
    pub async fn try_start(&mut self, index: usize) -> Result<(), StepError> {
        let state = self.slot(index)?.state;
        if state.is_completed() {
            return Err(self.invalid(index, "start"));
        }
        self.run_from(index).await
    }

    /// Complete a step that reported [`StepOutcome::Pending`] and advance.
    pub async fn complete_step(&mut self, index: usize) -> Result<(), StepError> {
        self.finish(index)?;
        match self.next_unfinished(index) {
            Some(next) => self.run_from(next).await,
            None => Ok(()),
        }
    }

    /// Reset step `index` and every step after it.
    pub fn reset(&mut self, index: usize) -> Result<(), StepError> {
        self.slot(index)?;
        for i in index..self.slots.len() {
            if let Err(err) = self.slots[i].step.reset() {
                tracing::warn!(step = self.slots[i].step.name(), error = %err, "Failed to reset step state");
            }
            self.set_state(i, ProgressState::NotStarted);
        }
        Ok(())
    }

    /// Re-open a completed step: later steps are reset, this one goes back
    /// to in progress without repeating its work.
    pub fn edit_completed(&mut self, index: usize) -> Result<(), StepError> {
        if !self.slot(index)?.state.is_completed() {
            return Err(self.invalid(index, "edit"));
        }
        if let Some(next) = self.next(index) {
            self.reset(next)?;
        }
        self.set_state(index, ProgressState::InProgress);
        Ok(())
    }

    /// Record a problem on an unfinished step. Never advances the chain.
    pub fn encountered_exception(
        &mut self,
        index: usize,
        severity: Severity,
        message: impl Into<String>,
    ) -> Result<(), StepError> {
        if self.slot(index)?.state.is_completed() {
            return Err(self.invalid(index, "report a problem on"));
        }

        let message = message.into();
        tracing::warn!(step = self.slots[index].step.name(), %severity, %message, "Step reported a problem");
        let state = match severity {
            Severity::Warning => ProgressState::InProgressWarning,
            Severity::Error => ProgressState::InProgressError,
        };
        self.set_state(index, state);
        let _ = self.events.send(StepEvent::Message {
            index,
            severity,
            message,
        });
        Ok(())
    }

    pub async fn reset_and_try_start(&mut self, index: usize) -> Result<(), StepError> {
        self.reset(index)?;
        self.try_start(index).await
    }

    async fn run_from(&mut self, mut index: usize) -> Result<(), StepError> {
        loop {
            self.set_state(index, ProgressState::InProgress);
            tracing::debug!(step = self.slots[index].step.name(), index, "Starting step");

            let outcome = self.slots[index].step.resume().await;
            match outcome {
                StepOutcome::Completed => self.finish(index)?,
                StepOutcome::CompletedWithWarning(message) => {
                    self.encountered_exception(index, Severity::Warning, message)?;
                    self.finish(index)?;
                }
                StepOutcome::Warning(message) => {
                    return self.encountered_exception(index, Severity::Warning, message);
                }
                StepOutcome::Failed(message) => {
                    return self.encountered_exception(index, Severity::Error, message);
                }
                StepOutcome::Pending => return Ok(()),
            }

            match self.next_unfinished(index) {
                Some(next) => index = next,
                None => {
                    tracing::info!("All steps completed");
                    return Ok(());
                }
            }
        }
    }

    fn finish(&mut self, index: usize) -> Result<(), StepError> {
        let state = self.slot(index)?.state;
        if state.is_completed() || state == ProgressState::InProgressError {
            return Err(self.invalid(index, "complete"));
        }

        let completed = if state == ProgressState::InProgressWarning {
            ProgressState::CompletedWarning
        } else {
            ProgressState::Completed
        };
        self.set_state(index, completed);
        tracing::info!(step = self.slots[index].step.name(), state = %completed, "Step completed");
        Ok(())
    }

    /// First step after `index` that still has work to do.
    fn next_unfinished(&self, index: usize) -> Option<usize> {
        (index + 1..self.slots.len()).find(|&i| !self.slots[i].state.is_completed())
    }

    fn set_state(&mut self, index: usize, state: ProgressState) {
        let slot = &mut self.slots[index];
        if slot.state == state {
            return;
        }
        slot.state = state;
        let _ = self.events.send(StepEvent::StateChanged {
            index,
            name: slot.step.name().to_string(),
            state,
        });
    }

    fn slot(&self, index: usize) -> Result<&Slot, StepError> {
        self.slots.get(index).ok_or(StepError::OutOfRange(index))
    }

    fn invalid(&self, index: usize, action: &'static str) -> StepError {
        let slot = &self.slots[index];
        StepError::InvalidTransition {
            step: slot.step.name().to_string(),
            state: slot.state,
            action,
        }
    }
}
