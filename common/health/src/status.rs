use std::collections::BTreeMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

/// Process-wide health, ordered from best to worst.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    #[default]
    Ok,
    /// A non-fatal check is failing
    Degraded,
    /// A fatal check is failing
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Failed,
}

/// Last observed result of one check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckState {
    pub status: CheckStatus,
    #[serde(rename = "detail")]
    pub details: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub fatal: bool,
    #[serde(rename = "timestamp", with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    /// Failed polls in a row, reset by a successful one
    #[serde(rename = "num_failures")]
    pub contiguous_failures: u64,
    #[serde(
        rename = "first_failure",
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub first_failure_at: Option<OffsetDateTime>,
    /// Sequence number of the poll that produced this state
    #[serde(skip)]
    pub(crate) poll: u64,
}

impl CheckState {
    pub fn is_failed(&self) -> bool {
        self.status == CheckStatus::Failed
    }

    /// How much this check weighs on the overall status.
    pub fn severity(&self) -> OverallStatus {
        match (self.status, self.fatal) {
            (CheckStatus::Ok, _) => OverallStatus::Ok,
            (CheckStatus::Failed, false) => OverallStatus::Degraded,
            (CheckStatus::Failed, true) => OverallStatus::Unhealthy,
        }
    }
}

/// Aggregate health: the worst observed check status plus every check's
/// last state. Checks that have not been polled yet are not listed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthStatus {
    pub status: OverallStatus,
    pub details: BTreeMap<String, CheckState>,
}

impl HealthStatus {
    pub(crate) fn from_states(details: BTreeMap<String, CheckState>) -> Self {
        let status = details
            .values()
            .map(CheckState::severity)
            .max()
            .unwrap_or_default();

        Self { status, details }
    }

    /// False only when a fatal check is failing; degraded still serves.
    pub fn is_healthy(&self) -> bool {
        self.status != OverallStatus::Unhealthy
    }

    /// HTTP status a healthcheck endpoint answers with for this status.
    pub fn status_code(&self) -> StatusCode {
        match self.is_healthy() {
            true => StatusCode::OK,
            false => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HealthStatus {
    /// Responds with [`HealthStatus::status_code`] and each check's state
    /// in the body.
    fn into_response(self) -> Response {
        (self.status_code(), Json(self)).into_response()
    }
}
