use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const NATIVE_MIME_PREFIX: &str = "application/vnd.google-apps.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Folder,
    Leaf,
}

/// Snapshot of one node in the source tree as returned by the files API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceNode {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub modified_time: OffsetDateTime,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub trashed: bool,
}

impl SourceNode {
    pub fn kind(&self) -> NodeKind {
        if self.mime_type == FOLDER_MIME_TYPE {
            NodeKind::Folder
        } else {
            NodeKind::Leaf
        }
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parents.first().map(String::as_str)
    }

    /// Native documents have no binary content and must be exported.
    pub fn is_native(&self) -> bool {
        self.mime_type.starts_with(NATIVE_MIME_PREFIX) && self.kind() == NodeKind::Leaf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportTarget {
    pub mime_type: &'static str,
    pub extension: &'static str,
}

/// Export format used for a native document type, if the store can convert it.
pub fn export_target(native_mime: &str) -> Option<ExportTarget> {
    let target = match native_mime.strip_prefix(NATIVE_MIME_PREFIX)? {
        "document" => ExportTarget {
            mime_type: "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            extension: "docx",
        },
        "spreadsheet" => ExportTarget {
            mime_type: "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            extension: "xlsx",
        },
        "presentation" => ExportTarget {
            mime_type: "application/vnd.openxmlformats-officedocument.presentationml.presentation",
            extension: "pptx",
        },
        "drawing" => ExportTarget {
            mime_type: "image/png",
            extension: "png",
        },
        _ => return None,
    };
    Some(target)
}
