//! Upload Queue Model
//!
//! Delivery state of completed sessions and the validation feedback returned by the
//! ingestion service.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::session::Session;

/// Delivery status of a queue item.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    #[default]
    Pending,
    Uploading,
    Completed,
    Failed,
}

impl UploadStatus {
    /// Allowed status edges.
    ///
    /// Besides the delivery path `Pending -> Uploading -> Completed | Failed` and the retry edge
    /// `Failed -> Uploading`, an explicit retry may park a failed item as `Pending`.
    /// Demotion of interrupted uploads on restart happens outside this graph.
    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        matches!(
            (self, next),
            (Pending, Uploading)
                | (Uploading, Completed)
                | (Uploading, Failed)
                | (Failed, Uploading)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Server verdict on the data quality of a delivered session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    #[serde(rename = "valid", alias = "is_valid")]
    pub is_valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Validation feedback attached to a completed item.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub validation_result: ValidationResult,
    /// Loosely typed summary echoed by the server (duration, RR count, ...).
    #[serde(default)]
    pub session_summary: BTreeMap<String, Value>,
}

/// Body of a successful `POST /api/v1/sessions/upload` response.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub validation: ValidationResult,
    #[serde(default)]
    pub session_summary: Option<BTreeMap<String, Value>>,
    #[serde(default, alias = "status", alias = "storage_status")]
    pub db_status: Option<String>,
}

impl UploadResponse {
    pub fn into_report(self) -> (ValidationReport, Option<String>) {
        (
            ValidationReport {
                validation_result: self.validation,
                session_summary: self.session_summary.unwrap_or_default(),
            },
            self.db_status,
        )
    }
}

/// One session awaiting, undergoing or done with delivery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    id: Uuid,
    session: Session,
    status: UploadStatus,
    error_message: Option<String>,
    db_status: Option<String>,
    validation_report: Option<ValidationReport>,
    #[serde(default)]
    attempts: u32,
}

impl QueueItem {
    pub fn new(session: Session) -> Self {
        Self {
            id: session.id,
            session,
            status: UploadStatus::Pending,
            error_message: None,
            db_status: None,
            validation_report: None,
            attempts: 0,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn status(&self) -> UploadStatus {
        self.status
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn db_status(&self) -> Option<&str> {
        self.db_status.as_deref()
    }

    pub fn validation_report(&self) -> Option<&ValidationReport> {
        self.validation_report.as_ref()
    }

    /// Number of delivery attempts started for this item.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn transition(&mut self, next: UploadStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(anyhow!(
                "illegal status change {} -> {} for item {}",
                self.status,
                next,
                self.id
            ));
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_uploading(&mut self) -> Result<()> {
        self.transition(UploadStatus::Uploading)?;
        self.attempts += 1;
        Ok(())
    }

    pub fn mark_completed(&mut self, response: UploadResponse) -> Result<()> {
        self.transition(UploadStatus::Completed)?;
        let (report, db_status) = response.into_report();
        self.validation_report = Some(report);
        self.db_status = db_status;
        self.error_message = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) -> Result<()> {
        self.transition(UploadStatus::Failed)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    /// Re-enters the delivery path; the previous error stays until the next attempt overwrites it.
    pub fn reset_for_retry(&mut self) -> Result<()> {
        self.transition(UploadStatus::Pending)
    }

    /// An item found `Uploading` on load was never confirmed and is demoted to `Pending`.
    pub(crate) fn recover_after_restart(&mut self) -> bool {
        if self.status == UploadStatus::Uploading {
            self.status = UploadStatus::Pending;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::session::ActiveSession;
    use crate::model::tag::SessionTag;

    fn item() -> QueueItem {
        QueueItem::new(
            ActiveSession::new("u", SessionTag::WakeCheck, "wake_check_single".into(), 0, 5)
                .freeze(),
        )
    }

    #[test]
    fn test_new_item_is_pending_with_session_id() {
        let item = item();
        assert_eq!(item.status(), UploadStatus::Pending);
        assert_eq!(item.id(), item.session().id);
        assert!(item.error_message().is_none());
    }

    #[test]
    fn test_status_graph() {
        use UploadStatus::*;
        assert!(Pending.can_transition_to(Uploading));
        assert!(Uploading.can_transition_to(Completed));
        assert!(Uploading.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Uploading));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Uploading.can_transition_to(Pending));
        for next in [Pending, Uploading, Completed, Failed] {
            assert!(!Completed.can_transition_to(next));
        }
    }

    #[test]
    fn test_completed_is_terminal() {
        let mut item = item();
        item.mark_uploading().unwrap();
        item.mark_completed(UploadResponse::default()).unwrap();
        assert!(item.mark_uploading().is_err());
        assert!(item.mark_failed("late").is_err());
        assert!(item.reset_for_retry().is_err());
        assert_eq!(item.status(), UploadStatus::Completed);
    }

    #[test]
    fn test_retry_keeps_error_until_next_attempt() {
        let mut item = item();
        item.mark_uploading().unwrap();
        item.mark_failed("HTTP 500").unwrap();
        item.reset_for_retry().unwrap();
        assert_eq!(item.status(), UploadStatus::Pending);
        assert_eq!(item.error_message(), Some("HTTP 500"));
        item.mark_uploading().unwrap();
        item.mark_failed("timeout").unwrap();
        assert_eq!(item.error_message(), Some("timeout"));
        assert_eq!(item.attempts(), 2);
    }

    #[test]
    fn test_parse_upload_response() {
        let json = r#"{
            "validation": {"valid": true, "errors": [], "warnings": ["short recording"]},
            "session_summary": {"duration_minutes": 5, "rr_count": 312},
            "status": "stored"
        }"#;
        let response: UploadResponse = serde_json::from_str(json).unwrap();
        let (report, db_status) = response.into_report();
        assert!(report.validation_result.is_valid);
        assert_eq!(report.validation_result.warnings, vec!["short recording"]);
        assert_eq!(report.session_summary["rr_count"], 312);
        assert_eq!(db_status.as_deref(), Some("stored"));
    }

    #[test]
    fn test_response_without_validation_is_malformed() {
        assert!(serde_json::from_str::<UploadResponse>(r#"{"status": "stored"}"#).is_err());
    }
}
