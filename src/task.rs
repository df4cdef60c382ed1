//! The task record and its write inputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const TITLE_MAX_CHARS: usize = 200;
pub const DESCRIPTION_MAX_CHARS: usize = 1000;

/// A to-do item as stored by the record store and served by `/api/tasks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
  pub id: Uuid,
  pub title: String,
  #[serde(default)]
  pub description: String,
  pub completed: bool,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// Body of `POST /api/tasks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTaskInput {
  #[serde(default)]
  pub title: String,
  #[serde(default)]
  pub description: String,
}

/// Body of `PUT /api/tasks/:id`. Absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateTaskInput {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub completed: Option<bool>,
}

/// Field-level rejection of a task write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
  #[error("عنوان تسک الزامی است")]
  EmptyTitle,
  #[error("عنوان نباید بیشتر از ۲۰۰ کاراکتر باشد")]
  TitleTooLong,
  #[error("توضیحات نباید بیشتر از ۱۰۰۰ کاراکتر باشد")]
  DescriptionTooLong,
}

impl CreateTaskInput {
  pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
    Self {
      title: title.into(),
      description: description.into(),
    }
  }

  pub fn validate(&self) -> Result<(), ValidationError> {
    validate_title(&self.title)?;
    validate_description(&self.description)
  }
}

impl UpdateTaskInput {
  /// Input that only flips the completion flag.
  pub fn completed(completed: bool) -> Self {
    Self {
      completed: Some(completed),
      ..Default::default()
    }
  }

  pub fn validate(&self) -> Result<(), ValidationError> {
    if let Some(title) = &self.title {
      validate_title(title)?;
    }
    if let Some(description) = &self.description {
      validate_description(description)?;
    }
    Ok(())
  }
}

impl Task {
  /// Build a new, not yet completed task stamped with `now`.
  pub fn create(input: CreateTaskInput, now: DateTime<Utc>) -> Self {
    Self {
      id: Uuid::new_v4(),
      title: input.title,
      description: input.description,
      completed: false,
      created_at: now,
      updated_at: now,
    }
  }

  /// Apply a partial update in place. `updated_at` never moves behind `created_at`.
  pub fn apply(&mut self, input: UpdateTaskInput, now: DateTime<Utc>) {
    if let Some(title) = input.title {
      self.title = title;
    }
    if let Some(description) = input.description {
      self.description = description;
    }
    if let Some(completed) = input.completed {
      self.completed = completed;
    }
    self.updated_at = now.max(self.created_at);
  }
}

fn validate_title(title: &str) -> Result<(), ValidationError> {
  if title.trim().is_empty() {
    return Err(ValidationError::EmptyTitle);
  }
  if title.chars().count() > TITLE_MAX_CHARS {
    return Err(ValidationError::TitleTooLong);
  }
  Ok(())
}

fn validate_description(description: &str) -> Result<(), ValidationError> {
  if description.chars().count() > DESCRIPTION_MAX_CHARS {
    return Err(ValidationError::DescriptionTooLong);
  }
  Ok(())
}
