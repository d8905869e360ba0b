//! Background task manager for tracking and controlling concurrent tasks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use super::{BackgroundTask, CancelToken, TaskCompletionInfo, TaskId, TaskProgress, TaskState, TaskType, TaskUpdate};
use crate::db::IdentityStore;
use crate::error::{Error, Result};
use crate::faces::FaceDetector;
use crate::indexer::{Indexer, IndexerOptions};

/// Manages all background tasks, providing centralized control and status.
pub struct BackgroundTaskManager {
    tasks: HashMap<TaskId, BackgroundTask>,
    /// Order in which tasks were added (for "most recent" cancellation).
    task_order: Vec<TaskId>,
}

impl BackgroundTaskManager {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            task_order: Vec::new(),
        }
    }

    /// Register a new background task.
    /// Returns the TaskId and a sender for the task to send updates.
    pub fn register_task(&mut self, task_type: TaskType) -> (TaskId, mpsc::Sender<TaskUpdate>, CancelToken) {
        let (tx, rx) = mpsc::channel();
        let cancel = CancelToken::new();
        let task = BackgroundTask::new(task_type, cancel.clone(), rx);
        let id = task.id;

        self.tasks.insert(id, task);
        self.task_order.push(id);

        (id, tx, cancel)
    }

    /// Index `root` on a worker thread.
    ///
    /// Only one indexing run may be active; a second request gets
    /// [`Error::Busy`].
    pub fn spawn_indexing(
        &mut self,
        store: Arc<IdentityStore>,
        detector: Arc<dyn FaceDetector>,
        root: PathBuf,
        options: IndexerOptions,
    ) -> Result<TaskId> {
        if self.is_running(TaskType::Indexing) {
            return Err(Error::Busy);
        }

        let (id, tx, cancel) = self.register_task(TaskType::Indexing);
        let handle = std::thread::spawn(move || {
            let indexer = Indexer::new(&store, detector.as_ref(), options);
            let result = indexer.run(&root, &cancel, |progress| {
                let update = if progress.current == 0 {
                    TaskUpdate::Started { total: progress.total }
                } else {
                    TaskUpdate::Progress(progress)
                };
                let _ = tx.send(update);
            });

            let update = match result {
                Ok(summary) if summary.cancelled => TaskUpdate::Cancelled,
                Ok(summary) => TaskUpdate::Completed {
                    message: summary.to_string(),
                },
                Err(e) => TaskUpdate::Failed {
                    error: format!("{:#}", e),
                },
            };
            let _ = tx.send(update);
        });

        if let Some(task) = self.tasks.get_mut(&id) {
            task.attach(handle);
        }
        tracing::debug!(task = id.0, "Indexing task spawned");
        Ok(id)
    }

    /// Check if a task of the given type is already running.
    pub fn is_running(&self, task_type: TaskType) -> bool {
        self.tasks.values().any(|t| t.task_type == task_type && t.is_running())
    }

    /// Cancel a specific task by ID.
    pub fn cancel_task(&mut self, id: TaskId) -> bool {
        if let Some(task) = self.tasks.get(&id) {
            if task.is_running() {
                task.cancel();
                return true;
            }
        }
        false
    }

    /// Cancel the most recently started running task.
    /// Returns true if a task was cancelled.
    pub fn cancel_most_recent(&mut self) -> bool {
        for id in self.task_order.iter().rev() {
            if let Some(task) = self.tasks.get(id) {
                if task.is_running() {
                    task.cancel();
                    return true;
                }
            }
        }
        false
    }

    /// Poll all task channels for updates.
    /// Returns completion messages that should be displayed to the user.
    pub fn poll_updates(&mut self) -> Vec<TaskCompletionInfo> {
        let mut completed = Vec::new();

        for (&id, task) in self.tasks.iter_mut() {
            // Drain all available updates
            while let Ok(update) = task.receiver.try_recv() {
                match update {
                    TaskUpdate::Started { total } => {
                        task.progress = Some(TaskProgress::new(0, total));
                    }
                    TaskUpdate::Progress(progress) => {
                        task.progress = Some(progress);
                    }
                    TaskUpdate::Completed { message } => {
                        task.state = TaskState::Completed;
                        completed.push(TaskCompletionInfo {
                            id,
                            task_type: task.task_type,
                            message,
                            success: true,
                            elapsed: task.elapsed(),
                        });
                    }
                    TaskUpdate::Cancelled => {
                        task.state = TaskState::Cancelled;
                        completed.push(TaskCompletionInfo {
                            id,
                            task_type: task.task_type,
                            message: "Cancelled".to_string(),
                            success: false,
                            elapsed: task.elapsed(),
                        });
                    }
                    TaskUpdate::Failed { error } => {
                        task.state = TaskState::Failed;
                        completed.push(TaskCompletionInfo {
                            id,
                            task_type: task.task_type,
                            message: error,
                            success: false,
                            elapsed: task.elapsed(),
                        });
                    }
                }
            }
        }

        // Remove completed tasks from tracking
        for info in &completed {
            self.tasks.remove(&info.id);
            self.task_order.retain(|id| *id != info.id);
        }

        completed
    }

    /// Latest progress of a task, if it reported any.
    pub fn progress(&self, id: TaskId) -> Option<&TaskProgress> {
        self.tasks.get(&id).and_then(|t| t.progress.as_ref())
    }

    /// Check if any tasks are running.
    pub fn has_running_tasks(&self) -> bool {
        self.tasks.values().any(|t| t.is_running())
    }
}

impl Default for BackgroundTaskManager {
    fn default() -> Self {
        Self::new()
    }
}
