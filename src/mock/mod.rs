//! Simulated backend: an injectable record store and the router in front of it.

mod db;
mod server;

pub use db::RecordStore;
pub use server::{MockServer, Route, TASKS_PATH};
pub(crate) use server::message_response;
