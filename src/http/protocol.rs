//! HTTP Surface Definitions
//!
//! Route constants and Data Transfer Objects shared by the axum server
//! handlers and the reqwest client. Streaming bodies carry file contents,
//! JSON bodies carry metadata; failures are `500` with a JSON
//! `{"errorCode": N}` body using the stable code table.

use serde::{Deserialize, Serialize};

// --- Routes ---

pub const ENDPOINT_UPLOAD: &str = "/upload";
pub const ENDPOINT_APPEND: &str = "/append";
pub const ENDPOINT_DOWNLOAD: &str = "/download";
pub const ENDPOINT_LIST: &str = "/list";
pub const ENDPOINT_INFO: &str = "/info";
pub const ENDPOINT_INFO_ALL: &str = "/infoAll";
pub const ENDPOINT_PING: &str = "/ping";
pub const ENDPOINT_COPY: &str = "/copy";
pub const ENDPOINT_COPY_ALL: &str = "/copyAll";
pub const ENDPOINT_MOVE: &str = "/move";
pub const ENDPOINT_MOVE_ALL: &str = "/moveAll";
pub const ENDPOINT_DELETE: &str = "/delete";
pub const ENDPOINT_DELETE_ALL: &str = "/deleteAll";

// --- Data Transfer Objects ---

/// Error body accompanying a `500` response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "errorCode")]
    pub error_code: u32,
}

/// Query half of an upload request; `size` switches on fixed-size validation.
#[derive(Debug, Default, Deserialize)]
pub struct UploadQuery {
    pub size: Option<u64>,
}

/// Query half of an append request.
#[derive(Debug, Deserialize)]
pub struct AppendQuery {
    pub offset: u64,
}

/// Query half of a download request. Signed so bad clients get `BAD_RANGE`
/// instead of a wrapped value.
#[derive(Debug, Default, Deserialize)]
pub struct DownloadQuery {
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

/// Query half of a list request; a missing glob lists everything.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub glob: Option<String>,
}

/// Query half of copy/move requests.
#[derive(Debug, Deserialize)]
pub struct SourceTargetQuery {
    pub name: String,
    pub target: String,
}
