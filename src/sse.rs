//! Server-Sent Events framing.
//!
//! The engine itself only produces [`Event`] values; this module renders
//! them for the wire. Each event becomes a UTF-8 `data: <json>\n\n` line.
//! No `[DONE]` sentinel is used.

use crate::{events::Event, prelude::*};

/// Response headers an HTTP layer should set on the event stream.
pub const RESPONSE_HEADERS: &[(&str, &str)] = &[
    ("Content-Type", "text/event-stream"),
    ("Cache-Control", "no-cache"),
    ("Connection", "keep-alive"),
    // Disable buffering in intermediaries like nginx.
    ("X-Accel-Buffering", "no"),
];

/// Header echoing the run id.
pub const RUN_ID_HEADER: &str = "X-Run-ID";

/// Frame a single event.
pub fn frame(event: &Event) -> String {
    let json = serde_json::to_string(event)
        .unwrap_or_else(|err| json!({ "type": "error", "error": err.to_string() }).to_string());
    format!("data: {json}\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Phase, PhaseStatus};

    #[test]
    fn frames_are_data_prefixed_and_double_newline_terminated() {
        let event = Event::Phase {
            phase: Phase::AiProcessing,
            status: PhaseStatus::Started,
            duration: None,
            files_per_second: None,
            files_to_summarize: None,
        };
        let framed = frame(&event);
        assert!(framed.starts_with("data: {"));
        assert!(framed.ends_with("\n\n"));
        // The payload is a single line of valid JSON.
        let payload = framed.trim_start_matches("data: ").trim_end();
        assert!(!payload.contains('\n'));
        let parsed: Value = serde_json::from_str(payload).unwrap();
        assert_eq!(parsed["type"], "phase");
    }
}
