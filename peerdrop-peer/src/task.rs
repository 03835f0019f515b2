//! Transfer task bookkeeping: the append-only list of transfers the local
//! peer has participated in, published to subscribers whenever anything
//! changes.

use bytes::Bytes;
use peerdrop_core::FileMeta;

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Inbound offer awaiting an accept/decline decision.
    Waiting,
    InProgress,
    Rejected,
    Finished,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Rejected | TaskState::Finished)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub direction: Direction,
    pub state: TaskState,
    pub progress: u8,
    pub remote_name: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    /// Assembled file contents, set only on a finished receive.
    pub result: Option<Bytes>,
    pub speed_bytes_per_sec: u64,
}

pub type TaskListener = Box<dyn Fn(&[Task]) + Send>;

/// Tasks are never removed; terminal tasks keep their final state so the
/// history stays visible after the transfer ends.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: Vec<Task>,
    next_id: TaskId,
    listeners: Vec<TaskListener>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_send(&mut self, remote_name: &str, meta: &FileMeta) -> TaskId {
        self.create(Direction::Send, TaskState::InProgress, remote_name, meta)
    }

    pub fn create_receive(&mut self, remote_name: &str, meta: &FileMeta) -> TaskId {
        self.create(Direction::Receive, TaskState::Waiting, remote_name, meta)
    }

    fn create(
        &mut self,
        direction: Direction,
        state: TaskState,
        remote_name: &str,
        meta: &FileMeta,
    ) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        self.tasks.push(Task {
            id,
            direction,
            state,
            progress: 0,
            remote_name: remote_name.to_owned(),
            file_name: meta.name.clone(),
            file_size: meta.size,
            mime_type: meta.mime_type.clone(),
            result: None,
            speed_bytes_per_sec: 0,
        });
        self.notify();
        id
    }

    /// Listeners receive the full task list on every change, starting with
    /// the current state at subscription time.
    pub fn subscribe(&mut self, listener: TaskListener) {
        listener(&self.tasks);
        self.listeners.push(listener);
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn snapshot(&self) -> Vec<Task> {
        self.tasks.clone()
    }

    /// Applies `apply` to the task unless it already reached a terminal
    /// state. Progress never moves backwards.
    pub fn update(&mut self, id: TaskId, apply: impl FnOnce(&mut Task)) -> bool {
        let Some(task) = self.tasks.iter_mut().find(|task| task.id == id) else {
            return false;
        };
        if task.state.is_terminal() {
            return false;
        }
        let floor = task.progress;
        apply(task);
        if task.progress < floor {
            task.progress = floor;
        }
        self.notify();
        true
    }

    /// Waiting -> InProgress, once the local user accepts the offer.
    pub fn start(&mut self, id: TaskId) -> bool {
        self.update(id, |task| {
            if task.state == TaskState::Waiting {
                task.state = TaskState::InProgress;
            }
        })
    }

    pub fn set_progress(&mut self, id: TaskId, progress: u8) -> bool {
        self.update(id, |task| task.progress = progress.min(100))
    }

    pub fn set_speed(&mut self, id: TaskId, bytes_per_sec: u64) -> bool {
        self.update(id, |task| task.speed_bytes_per_sec = bytes_per_sec)
    }

    pub fn finish(&mut self, id: TaskId, result: Option<Bytes>) -> bool {
        self.update(id, |task| {
            task.state = TaskState::Finished;
            task.progress = 100;
            task.result = result;
        })
    }

    pub fn reject(&mut self, id: TaskId) -> bool {
        self.update(id, |task| task.state = TaskState::Rejected)
    }

    fn notify(&self) {
        for listener in &self.listeners {
            listener(&self.tasks);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn meta() -> FileMeta {
        FileMeta {
            name: "report.pdf".to_owned(),
            size: 4096,
            mime_type: "application/pdf".to_owned(),
        }
    }

    #[test]
    fn terminal_tasks_refuse_further_updates() {
        let mut registry = TaskRegistry::new();
        let id = registry.create_send("bob", &meta());

        assert!(registry.finish(id, None));
        assert!(!registry.set_progress(id, 10));
        assert!(!registry.reject(id));

        let task = registry.get(id).unwrap();
        assert_eq!(task.state, TaskState::Finished);
        assert_eq!(task.progress, 100);
    }

    #[test]
    fn progress_is_monotone() {
        let mut registry = TaskRegistry::new();
        let id = registry.create_send("bob", &meta());

        assert!(registry.set_progress(id, 40));
        assert!(registry.set_progress(id, 25));
        assert_eq!(registry.get(id).unwrap().progress, 40);

        assert!(registry.set_progress(id, 60));
        assert_eq!(registry.get(id).unwrap().progress, 60);
    }

    #[test]
    fn listeners_see_the_full_list_on_every_change() {
        let mut registry = TaskRegistry::new();
        let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        registry.subscribe(Box::new(move |tasks| {
            sink.lock().unwrap().push(tasks.len());
        }));

        let first = registry.create_send("bob", &meta());
        registry.create_receive("carol", &meta());
        registry.set_progress(first, 50);

        // Subscription snapshot, two creations, one progress update.
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 2]);
    }

    #[test]
    fn receive_tasks_wait_until_started() {
        let mut registry = TaskRegistry::new();
        let id = registry.create_receive("carol", &meta());
        assert_eq!(registry.get(id).unwrap().state, TaskState::Waiting);

        assert!(registry.start(id));
        assert_eq!(registry.get(id).unwrap().state, TaskState::InProgress);

        // Starting again is harmless.
        assert!(registry.start(id));
        assert_eq!(registry.get(id).unwrap().state, TaskState::InProgress);
    }
}
