//! Request router implementing the `/api/tasks` wire contract over a [`RecordStore`].

use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use super::db::RecordStore;
use crate::task::{CreateTaskInput, UpdateTaskInput};
use crate::transport::{Method, RawOutcome};

pub const TASKS_PATH: &str = "/api/tasks";

const MSG_TASK_NOT_FOUND: &str = "تسک یافت نشد";
const MSG_INVALID_REQUEST: &str = "درخواست نامعتبر است";
const MSG_DELETED: &str = "تسک با موفقیت حذف شد";

/// A request that matched one of the four task endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  List,
  Create,
  Update(Uuid),
  Delete(Uuid),
}

/// Why a path could not be routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unrouted {
  /// Path has the `/api/tasks/:id` shape but the id is not a UUID.
  BadId,
  NoRoute,
}

impl Route {
  fn parse(method: Method, path: &str) -> Result<Self, Unrouted> {
    let path = path.trim_end_matches('/');
    let rest = path.strip_prefix(TASKS_PATH).ok_or(Unrouted::NoRoute)?;

    match (method, rest) {
      (Method::Get, "") => Ok(Route::List),
      (Method::Post, "") => Ok(Route::Create),
      (Method::Put | Method::Delete, rest) => {
        let raw = rest.strip_prefix('/').ok_or(Unrouted::NoRoute)?;
        if raw.is_empty() || raw.contains('/') {
          return Err(Unrouted::NoRoute);
        }
        let id = Uuid::parse_str(raw).map_err(|_| Unrouted::BadId)?;
        Ok(match method {
          Method::Put => Route::Update(id),
          _ => Route::Delete(id),
        })
      }
      _ => Err(Unrouted::NoRoute),
    }
  }

  /// Message carried by an injected fault of `status` on this route.
  pub fn fault_message(&self, status: u16) -> &'static str {
    match (self, status >= 500) {
      (Route::List, true) => "خطای سرور. لطفا دوباره تلاش کنید",
      (Route::List, false) => "تسک‌ها یافت نشدند",
      (Route::Create, true) => "خطا در ایجاد تسک. لطفا دوباره تلاش کنید",
      (Route::Create, false) => MSG_INVALID_REQUEST,
      (Route::Update(_), true) => "خطا در ویرایش تسک. لطفا دوباره تلاش کنید",
      (Route::Update(_), false) => MSG_TASK_NOT_FOUND,
      (Route::Delete(_), true) => "خطا در حذف تسک. لطفا دوباره تلاش کنید",
      (Route::Delete(_), false) => MSG_TASK_NOT_FOUND,
    }
  }
}

/// Answers requests from the record store, with no latency and no faults.
#[derive(Debug, Clone)]
pub struct MockServer {
  db: Arc<RecordStore>,
}

impl MockServer {
  pub fn new(db: Arc<RecordStore>) -> Self {
    Self { db }
  }

  pub fn db(&self) -> &Arc<RecordStore> {
    &self.db
  }

  /// Match a request against the task endpoints.
  ///
  /// Requests that do not map to a route come back as the 404 they would
  /// produce, so callers can return it directly.
  pub fn route(&self, method: Method, path: &str) -> Result<Route, RawOutcome> {
    Route::parse(method, path).map_err(|reason| match reason {
      Unrouted::BadId => message_response(404, MSG_TASK_NOT_FOUND),
      Unrouted::NoRoute => message_response(404, MSG_INVALID_REQUEST),
    })
  }

  pub fn handle(&self, method: Method, path: &str, body: Option<Value>) -> RawOutcome {
    match self.route(method, path) {
      Ok(route) => self.dispatch(route, body),
      Err(outcome) => outcome,
    }
  }

  pub fn dispatch(&self, route: Route, body: Option<Value>) -> RawOutcome {
    match route {
      Route::List => RawOutcome::response(200, json!({ "data": self.db.tasks() })),
      Route::Create => {
        let input: CreateTaskInput = match parse_body(body) {
          Some(input) => input,
          None => return message_response(400, MSG_INVALID_REQUEST),
        };
        if let Err(e) = input.validate() {
          return message_response(400, &e.to_string());
        }
        let task = self.db.create(input);
        RawOutcome::response(201, json!({ "data": task }))
      }
      Route::Update(id) => {
        let input: UpdateTaskInput = match parse_body(body) {
          Some(input) => input,
          None => return message_response(400, MSG_INVALID_REQUEST),
        };
        if let Err(e) = input.validate() {
          return message_response(400, &e.to_string());
        }
        match self.db.update(&id, input) {
          Some(task) => RawOutcome::response(200, json!({ "data": task })),
          None => message_response(404, MSG_TASK_NOT_FOUND),
        }
      }
      Route::Delete(id) => {
        if self.db.delete(&id) {
          message_response(200, MSG_DELETED)
        } else {
          message_response(404, MSG_TASK_NOT_FOUND)
        }
      }
    }
  }
}

fn parse_body<T: serde::de::DeserializeOwned>(body: Option<Value>) -> Option<T> {
  serde_json::from_value(body?).ok()
}

pub(crate) fn message_response(status: u16, message: &str) -> RawOutcome {
  RawOutcome::response(status, json!({ "message": message }))
}
