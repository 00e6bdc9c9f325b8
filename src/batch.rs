use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::filesystem::TargetDirectory;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BatchItem {
    pub document: String,
    /// Source subdirectory, or the Outbox destination for `save-to`.
    #[serde(default)]
    pub directory: Option<String>,
    pub target: TargetDirectory,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub document: String,
    pub target_directory: TargetDirectory,
    pub subdirectory: Option<String>,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub status_code: u16,
    pub results: Vec<BatchResult>,
}

/// 204 for nothing, the shared status when every item agrees, otherwise 207.
pub fn overall_status(results: &[BatchResult]) -> StatusCode {
    let Some(first) = results.first() else {
        return StatusCode::NO_CONTENT;
    };
    if results.iter().all(|r| r.status_code == first.status_code) {
        StatusCode::from_u16(first.status_code).unwrap_or(StatusCode::MULTI_STATUS)
    } else {
        StatusCode::MULTI_STATUS
    }
}

/// Runs `operation` on every item. A failing item never stops the others.
pub fn run<F>(items: &[BatchItem], mut operation: F) -> BatchResponse
where
    F: FnMut(&BatchItem) -> Result<(), AppError>,
{
    let results: Vec<BatchResult> = items
        .iter()
        .map(|item| {
            let (status, message) = match operation(item) {
                Ok(()) => (StatusCode::OK, None),
                Err(why) => {
                    tracing::warn!("batch item {} failed: {}", item.document, why);
                    (why.status_code(), Some(why.public_message()))
                }
            };
            BatchResult {
                document: item.document.clone(),
                target_directory: item.target,
                subdirectory: item.directory.clone(),
                status_code: status.as_u16(),
                message,
            }
        })
        .collect();

    BatchResponse {
        status_code: overall_status(&results).as_u16(),
        results,
    }
}
