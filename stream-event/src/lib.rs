//! Typed stream events for agent runs.
//!
//! This crate defines the wire shape of every event an agent run can emit
//! (one tagged union) plus the helpers that turn events into Server-Sent-Event
//! records. It does not depend on skein; skein emits these events and the
//! serve layer calls [`to_sse_record`].

pub mod event;
pub mod sse;

pub use event::{StreamEvent, TokenUsage};
pub use sse::{done_record, error_record, to_sse_record, SseRecord};
