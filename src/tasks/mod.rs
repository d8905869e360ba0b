//! Background work that reports back over channels.
//!
//! Long runs (indexing a photo library) happen on a worker thread. The
//! caller keeps a [`BackgroundTask`] handle, drains [`TaskUpdate`]s from it
//! and can cancel through the shared [`CancelToken`].

pub mod manager;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub use manager::BackgroundTaskManager;

/// Cooperative cancellation flag for one run. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Unique identifier for a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

impl TaskId {
    pub fn new() -> Self {
        use std::sync::atomic::AtomicU64;
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TaskId(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// Type of background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Indexing,
}

impl TaskType {
    pub fn display_name(&self) -> &'static str {
        match self {
            TaskType::Indexing => "Face Indexing",
        }
    }
}

/// Progress information for a task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskProgress {
    pub current: usize,
    pub total: usize,
    pub current_item: Option<String>,
    pub message: Option<String>,
}

impl TaskProgress {
    pub fn new(current: usize, total: usize) -> Self {
        Self {
            current,
            total,
            current_item: None,
            message: None,
        }
    }

    pub fn with_item(mut self, item: impl Into<String>) -> Self {
        self.current_item = Some(item.into());
        self
    }

    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Calculate progress percentage (0-100).
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            0
        } else {
            ((self.current as f64 / self.total as f64) * 100.0).min(100.0) as u8
        }
    }
}

/// State of a background task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// Update messages sent from background tasks via channels.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskUpdate {
    /// Task has started with total items to process.
    Started { total: usize },
    /// Progress update during processing.
    Progress(TaskProgress),
    /// Task completed successfully.
    Completed { message: String },
    /// Task was cancelled.
    Cancelled,
    /// Task failed with error.
    Failed { error: String },
}

/// A running background task with its state and communication channels.
pub struct BackgroundTask {
    pub id: TaskId,
    pub task_type: TaskType,
    pub state: TaskState,
    pub progress: Option<TaskProgress>,
    pub cancel: CancelToken,
    pub receiver: mpsc::Receiver<TaskUpdate>,
    started_at: Instant,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    pub fn new(task_type: TaskType, cancel: CancelToken, receiver: mpsc::Receiver<TaskUpdate>) -> Self {
        Self {
            id: TaskId::new(),
            task_type,
            state: TaskState::Running,
            progress: None,
            cancel,
            receiver,
            started_at: Instant::now(),
            handle: None,
        }
    }

    /// Request cancellation of this task.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Get elapsed time since task started.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Running until a final update arrives or the worker thread exits.
    pub fn is_running(&self) -> bool {
        self.state == TaskState::Running && self.handle.as_ref().map_or(true, |h| !h.is_finished())
    }

    pub(crate) fn attach(&mut self, handle: JoinHandle<()>) {
        self.handle = Some(handle);
    }
}

/// Result of polling task updates.
#[derive(Debug, Clone)]
pub struct TaskCompletionInfo {
    pub id: TaskId,
    pub task_type: TaskType,
    pub message: String,
    pub success: bool,
    /// Wall time from registration until the final update was polled.
    pub elapsed: Duration,
}
