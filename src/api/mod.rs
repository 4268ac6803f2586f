//! HTTP API Module
//!
//! REST and WebSocket surface over the liveness engine.

mod http;

pub use http::{AppState, HttpServer};
