//! # fedguard
//!
//! Authorization decision service for federated-learning deployments.
//! Wires the [`policy_engine`] store and decision engine and the
//! [`audit_log`] buffer behind an axum HTTP API.

pub mod app;
pub mod cli;
pub mod config;
pub mod http;

pub use app::Services;
pub use http::{build_router, AppState};
