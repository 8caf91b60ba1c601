//! Server-Sent-Events record shaping for stream events.
//!
//! An SSE record is `event: <kind>` + `data: <json>`. The serve layer maps
//! each [`StreamEvent`] through [`to_sse_record`], then appends exactly one
//! terminal record: [`done_record`] with the final result JSON on success,
//! [`error_record`] otherwise.

use serde_json::Value;

use crate::event::StreamEvent;

/// One SSE record: the `event:` field and the `data:` JSON payload.
#[derive(Clone, Debug, PartialEq)]
pub struct SseRecord {
    pub event: String,
    pub data: String,
}

impl SseRecord {
    /// Renders the record in SSE wire format, terminated by a blank line.
    pub fn to_wire(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event, self.data)
    }
}

/// Maps a stream event to its SSE record (`event:` = kind, `data:` = JSON).
pub fn to_sse_record(event: &StreamEvent) -> Result<SseRecord, serde_json::Error> {
    Ok(SseRecord {
        event: event.kind().to_string(),
        data: serde_json::to_string(event)?,
    })
}

/// Terminal record for a successful run; `result` is the full result JSON.
pub fn done_record(result: &Value) -> SseRecord {
    SseRecord {
        event: "done".to_string(),
        data: result.to_string(),
    }
}

/// Terminal record for a failed run.
pub fn error_record(message: &str) -> SseRecord {
    SseRecord {
        event: "error".to_string(),
        data: serde_json::json!({ "error": message }).to_string(),
    }
}
