mod bucket;
mod client;
mod node;

pub use bucket::{BucketClient, BucketError};
pub use client::{ApiErrorClass, ChangePage, ChangeRecord, DriveClient, DriveError, WatchChannel};
pub use node::{ExportTarget, FOLDER_MIME_TYPE, NodeKind, SourceNode, export_target};
