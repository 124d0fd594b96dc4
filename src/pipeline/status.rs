//! Status message texts shown while a request moves through the pipeline.

use super::PipelineError;

/// Request accepted, nothing started yet
#[must_use]
pub fn accepted() -> String {
    "⏳ Queued…".to_string()
}

/// Waiting for a download slot
#[must_use]
pub fn waiting_for_slot(ahead: usize) -> String {
    if ahead == 0 {
        "⏳ You are next in line…".to_string()
    } else {
        format!("⏳ Tasks ahead of you: {ahead}")
    }
}

/// Download in progress
#[must_use]
pub fn downloading(label: &str) -> String {
    format!("⬇️ Downloading <b>{label}</b>…")
}

/// Waiting in the upload queue
#[must_use]
pub fn queued_for_upload(label: &str, ahead: usize) -> String {
    if ahead == 0 {
        format!("📤 <b>{label}</b> is next for upload…")
    } else {
        format!("📤 <b>{label}</b> waits for upload, {ahead} ahead")
    }
}

/// Upload in progress
#[must_use]
pub fn uploading(label: &str) -> String {
    format!("📤 Uploading <b>{label}</b>…")
}

/// Terminal failure
#[must_use]
pub fn failed(err: &PipelineError) -> String {
    err.user_message().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_are_rendered() {
        assert_eq!(waiting_for_slot(0), "⏳ You are next in line…");
        assert_eq!(waiting_for_slot(3), "⏳ Tasks ahead of you: 3");
        assert!(queued_for_upload("Song", 2).contains("2 ahead"));
    }

    #[test]
    fn failures_use_user_messages() {
        assert_eq!(
            failed(&PipelineError::QueueFull { capacity: 1 }),
            "📦 Task queue is full, try later"
        );
    }
}
