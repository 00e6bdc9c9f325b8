use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub(crate) struct SubdirectoryQuery {
    pub subdirectory: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub(crate) struct ListQuery {
    pub subdirectory: Option<String>,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub(crate) struct PreviewQuery {
    pub subdirectory: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub(crate) struct RotateQuery {
    pub subdirectory: Option<String>,
    pub degrees: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub(crate) struct UnlockQuery {
    pub subdirectory: Option<String>,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SaveQuery {
    pub subdirectory: Option<String>,
    pub new_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SaveToQuery {
    pub subdirectory: Option<String>,
    /// Outbox subdirectory to publish into.
    pub directory: Option<String>,
    pub new_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MergeQuery {
    pub subdirectory: Option<String>,
    pub merge_document: String,
    pub merge_subdirectory: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PageCountResponse {
    pub page_count: u32,
}
