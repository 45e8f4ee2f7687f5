//! Completion and failure reporting for running module tasks.
//!
//! Every module runs as a task with the state machine
//! `Created -> Running -> {Completed, Failed}`. The [`CallbackProcess`]
//! drives that machine and fans each transition out to the registered
//! [`CallbackReceiver`]s:
//!
//! - `receive_callback(result, source, repeat = true)` for partial results
//!   while running (any number),
//! - `receive_callback(result, source, repeat = false)` on completion, or
//! - `receive_exception(source, error)` on failure.
//!
//! A receiver sees at most one terminal callback per task.

use crate::module::ModuleError;
use crate::properties::Value;
use crate::tree::NodeId;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Identity of a task, passed to receivers as the callback source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Tree node the module sits on.
    pub node: NodeId,
    /// Module name at the time the task was created.
    pub module: String,
}

/// Lifecycle of a module task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Created,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    fn to_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TaskState::Created,
            1 => TaskState::Running,
            2 => TaskState::Completed,
            _ => TaskState::Failed,
        }
    }
}

/// Something that wants to hear how a task ended.
///
/// Implemented by the tree's run collector and by external owners such as
/// a CLI or a workbench front-end.
pub trait CallbackReceiver: Send + Sync {
    /// A result from `source`. `repeat` is true for partial results that
    /// will be followed by more callbacks from the same task.
    fn receive_callback(&self, result: &Value, source: &TaskInfo, repeat: bool);

    /// `source` failed. Called once, and never followed by other callbacks.
    fn receive_exception(&self, source: &TaskInfo, error: &ModuleError);
}

/// The reporting side of one running task.
pub struct CallbackProcess {
    info: TaskInfo,
    state: AtomicU8,
    receivers: Vec<Arc<dyn CallbackReceiver>>,
}

impl std::fmt::Debug for CallbackProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackProcess")
            .field("info", &self.info)
            .field("state", &self.state())
            .field("receivers", &self.receivers.len())
            .finish()
    }
}

impl CallbackProcess {
    pub fn new(info: TaskInfo, receivers: Vec<Arc<dyn CallbackReceiver>>) -> Self {
        Self {
            info,
            state: AtomicU8::new(TaskState::Created.to_u8()),
            receivers,
        }
    }

    pub fn info(&self) -> &TaskInfo {
        &self.info
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers.len()
    }

    /// Atomically move from one of `from` to `to`.
    fn transition(&self, from: &[TaskState], to: TaskState) -> bool {
        loop {
            let current = self.state.load(Ordering::Acquire);
            if !from.contains(&TaskState::from_u8(current)) {
                return false;
            }
            if self
                .state
                .compare_exchange_weak(current, to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
            // CAS failed, retry
        }
    }

    /// `Created -> Running`.
    pub fn start(&self) -> bool {
        self.transition(&[TaskState::Created], TaskState::Running)
    }

    /// Deliver a partial result. Ignored unless the task is running.
    pub fn report(&self, result: &Value) -> bool {
        if self.state() != TaskState::Running {
            return false;
        }
        for receiver in &self.receivers {
            receiver.receive_callback(result, &self.info, true);
        }
        true
    }

    /// Enter `Completed` and deliver the final result.
    ///
    /// Returns false (and delivers nothing) if the task already ended.
    pub fn complete(&self, result: Value) -> bool {
        if !self.transition(&[TaskState::Created, TaskState::Running], TaskState::Completed) {
            return false;
        }
        for receiver in &self.receivers {
            receiver.receive_callback(&result, &self.info, false);
        }
        true
    }

    /// Enter `Failed` and deliver the error.
    ///
    /// Returns false (and delivers nothing) if the task already ended.
    pub fn fail(&self, error: &ModuleError) -> bool {
        if !self.transition(&[TaskState::Created, TaskState::Running], TaskState::Failed) {
            return false;
        }
        for receiver in &self.receivers {
            receiver.receive_exception(&self.info, error);
        }
        true
    }
}

/// One callback as seen by a [`CallbackRecorder`].
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackEvent {
    Result {
        source: TaskInfo,
        result: Value,
        repeat: bool,
    },
    Exception {
        source: TaskInfo,
        error: String,
    },
}

impl CallbackEvent {
    pub fn source(&self) -> &TaskInfo {
        match self {
            CallbackEvent::Result { source, .. } | CallbackEvent::Exception { source, .. } => {
                source
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            CallbackEvent::Result { repeat, .. } => !repeat,
            CallbackEvent::Exception { .. } => true,
        }
    }
}

/// A receiver that keeps every callback it gets, in arrival order.
#[derive(Debug, Default)]
pub struct CallbackRecorder {
    events: Mutex<Vec<CallbackEvent>>,
}

impl CallbackRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: CallbackEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    pub fn events(&self) -> Vec<CallbackEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events whose source is `node`.
    pub fn events_for(&self, node: NodeId) -> Vec<CallbackEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.source().node == node)
            .collect()
    }

    /// Number of terminal callbacks received from `node`.
    pub fn terminal_count(&self, node: NodeId) -> usize {
        self.events_for(node)
            .iter()
            .filter(|e| e.is_terminal())
            .count()
    }

    /// Number of failures received, across all tasks.
    pub fn exception_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, CallbackEvent::Exception { .. }))
            .count()
    }
}

impl CallbackReceiver for CallbackRecorder {
    fn receive_callback(&self, result: &Value, source: &TaskInfo, repeat: bool) {
        self.push(CallbackEvent::Result {
            source: source.clone(),
            result: result.clone(),
            repeat,
        });
    }

    fn receive_exception(&self, source: &TaskInfo, error: &ModuleError) {
        self.push(CallbackEvent::Exception {
            source: source.clone(),
            error: error.to_string(),
        });
    }
}
