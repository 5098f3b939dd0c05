//! Typed progress events emitted by the pipeline.
//!
//! The core never renders anything itself. It emits these events through a
//! [`PipelineCallback`], and front-ends (the CLI progress bars, the RPC
//! server) decide what to show. Events for a given file always arrive in
//! non-decreasing phase order.

use crate::prelude::*;

/// Which pipeline phase an event refers to.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Phase 1: parallel per-file fast OCR.
    Tesseract,
    /// Quality analysis happening inside a phase.
    Quality,
    /// Phase 2: the shared neural batch pass.
    Surya,
}

/// Whether a phase is starting or finishing.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Started,
    Completed,
}

/// A phase boundary.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PhaseEvent {
    pub phase: Phase,
    pub status: PhaseStatus,
    /// How many files this phase will touch, when known at start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Fine-grained progress within a phase.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_pages: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f64>,
    pub message: String,
}

impl ProgressEvent {
    /// A bare message event for `phase`.
    pub fn message(phase: Phase, message: impl Into<String>) -> Self {
        ProgressEvent {
            phase,
            file: None,
            page: None,
            total_pages: None,
            current: None,
            total: None,
            worker_id: None,
            eta_seconds: None,
            message: message.into(),
        }
    }
}

/// Neural model lifecycle.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Loading,
    Ready,
}

/// A model load announcement.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ModelEvent {
    pub model_name: String,
    pub status: ModelStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_seconds: Option<f64>,
}

/// The callback contract. Implementations must be cheap and non-blocking;
/// the scheduler calls these inline.
pub trait PipelineCallback: Send + Sync {
    fn on_phase(&self, event: PhaseEvent);
    fn on_progress(&self, event: ProgressEvent);
    fn on_model(&self, event: ModelEvent);
}

/// A callback that ignores everything.
#[derive(Debug, Default)]
pub struct NoopCallback;

impl PipelineCallback for NoopCallback {
    fn on_phase(&self, _event: PhaseEvent) {}
    fn on_progress(&self, _event: ProgressEvent) {}
    fn on_model(&self, _event: ModelEvent) {}
}

/// A callback that logs every event through `tracing`.
#[derive(Debug, Default)]
pub struct LoggingCallback;

impl PipelineCallback for LoggingCallback {
    fn on_phase(&self, event: PhaseEvent) {
        info!(
            phase = ?event.phase,
            status = ?event.status,
            files_count = event.files_count,
            detail = event.detail.as_deref(),
            "phase"
        );
    }

    fn on_progress(&self, event: ProgressEvent) {
        debug!(
            phase = ?event.phase,
            file = event.file.as_deref(),
            current = event.current,
            total = event.total,
            "{}",
            event.message
        );
    }

    fn on_model(&self, event: ModelEvent) {
        info!(
            model = %event.model_name,
            status = ?event.status,
            time_seconds = event.time_seconds,
            "model"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_snake_case_fields() {
        let event = PhaseEvent {
            phase: Phase::Tesseract,
            status: PhaseStatus::Started,
            files_count: Some(3),
            detail: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["phase"], json!("tesseract"));
        assert_eq!(value["status"], json!("started"));
        assert_eq!(value["files_count"], json!(3));
        assert!(value.get("detail").is_none());
    }
}
