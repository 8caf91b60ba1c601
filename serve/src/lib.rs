//! HTTP surface for Skein agents.
//!
//! Two routes: `POST /agents/:name/stream` runs an agent and delivers its
//! stream events as Server-Sent Events (terminal `done` / `error` record
//! included), and `POST /callbacks/tools` is the endpoint the remote
//! sandbox posts tool-call envelopes to.

mod app;
mod callback;
mod sse;

pub use app::{init_logging, load_settings, router, AppState};
pub use sse::{sse_events, sse_records, StreamRequest};
