//! HTTP API layer.

pub mod chat;
pub mod conversations;
pub mod error;
pub mod routes;
pub mod state;
pub mod uploads;
