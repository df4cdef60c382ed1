use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::task::{CreateTaskInput, Task, UpdateTaskInput};

/// In-memory record store backing the mock server.
///
/// Each instance is independent; tests build their own instead of sharing one.
#[derive(Debug, Default)]
pub struct RecordStore {
  tasks: Mutex<Vec<Task>>,
}

impl RecordStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Start from a fixed set of records, kept in the given order.
  pub fn with_tasks(tasks: Vec<Task>) -> Self {
    Self {
      tasks: Mutex::new(tasks),
    }
  }

  /// All tasks in insertion order.
  pub fn tasks(&self) -> Vec<Task> {
    self.tasks.lock().clone()
  }

  pub fn get(&self, id: &Uuid) -> Option<Task> {
    self.tasks.lock().iter().find(|t| t.id == *id).cloned()
  }

  pub fn create(&self, input: CreateTaskInput) -> Task {
    let task = Task::create(input, Utc::now());
    self.tasks.lock().push(task.clone());
    task
  }

  /// Returns `None` when no task has this id.
  pub fn update(&self, id: &Uuid, input: UpdateTaskInput) -> Option<Task> {
    let mut tasks = self.tasks.lock();
    let task = tasks.iter_mut().find(|t| t.id == *id)?;
    task.apply(input, Utc::now());
    Some(task.clone())
  }

  /// Returns `false` when no task has this id.
  pub fn delete(&self, id: &Uuid) -> bool {
    let mut tasks = self.tasks.lock();
    let before = tasks.len();
    tasks.retain(|t| t.id != *id);
    tasks.len() != before
  }

  pub fn len(&self) -> usize {
    self.tasks.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
