use drivemirror_core::{ExportTarget, NodeKind, SourceNode, export_target};
use thiserror::Error;

pub const PLACEHOLDER_NAME: &str = "__placeholder";
const SEPARATOR: char = '/';

#[derive(Debug, Error)]
pub enum PathError {
    #[error("native document type has no export format: {0}")]
    UnsupportedNative(String),
}

/// Where and how a leaf lands in the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafTarget {
    pub key: String,
    pub content_type: String,
    pub export: Option<ExportTarget>,
}

/// Canonical extensions for binary types whose names often lack them.
const CANONICAL_EXTENSIONS: &[(&str, &[&str])] = &[
    ("application/pdf", &["pdf"]),
    ("image/jpeg", &["jpg", "jpeg"]),
    ("image/png", &["png"]),
    ("image/gif", &["gif"]),
    ("text/csv", &["csv"]),
    ("application/json", &["json"]),
    ("application/zip", &["zip"]),
    (
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        &["docx"],
    ),
    (
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        &["xlsx"],
    ),
    (
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        &["pptx"],
    ),
];

/// Makes a display name safe to use as one key segment.
pub fn sanitize_component(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return "_".to_string();
    }
    trimmed.replace(SEPARATOR, "_")
}

/// Prefix for the children of a folder named `name` under `prefix`.
pub fn folder_prefix(prefix: &str, name: &str) -> String {
    format!("{prefix}{}{SEPARATOR}", sanitize_component(name))
}

pub fn placeholder_key(prefix: &str) -> String {
    format!("{prefix}{PLACEHOLDER_NAME}")
}

/// Prefix built from the ancestor names, root first.
pub fn prefix_from_ancestors<'a, I>(ancestors: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    ancestors
        .into_iter()
        .fold(String::new(), |prefix, name| folder_prefix(&prefix, name))
}

pub fn leaf_target(prefix: &str, node: &SourceNode) -> Result<LeafTarget, PathError> {
    let name = sanitize_component(&node.name);
    if node.is_native() {
        let export = export_target(&node.mime_type)
            .ok_or_else(|| PathError::UnsupportedNative(node.mime_type.clone()))?;
        return Ok(LeafTarget {
            key: format!("{prefix}{}", with_extension(&name, &[export.extension])),
            content_type: export.mime_type.to_string(),
            export: Some(export),
        });
    }

    let file_name = match canonical_extensions(&node.mime_type) {
        Some(extensions) => with_extension(&name, extensions),
        None => name,
    };
    Ok(LeafTarget {
        key: format!("{prefix}{file_name}"),
        content_type: node.mime_type.clone(),
        export: None,
    })
}

/// Key of the object that represents `node` in the mirror. A folder is only
/// ever represented by its placeholder.
pub fn mirror_key(prefix: &str, node: &SourceNode) -> Result<String, PathError> {
    match node.kind() {
        NodeKind::Folder => Ok(placeholder_key(&folder_prefix(prefix, &node.name))),
        NodeKind::Leaf => Ok(leaf_target(prefix, node)?.key),
    }
}

fn canonical_extensions(mime_type: &str) -> Option<&'static [&'static str]> {
    CANONICAL_EXTENSIONS
        .iter()
        .find(|(mime, _)| *mime == mime_type)
        .map(|(_, extensions)| *extensions)
}

fn with_extension(name: &str, accepted: &[&str]) -> String {
    let current = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase());
    match (current, accepted.first()) {
        (Some(ext), _) if accepted.contains(&ext.as_str()) => name.to_string(),
        (_, Some(canonical)) => format!("{name}.{canonical}"),
        (_, None) => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivemirror_core::FOLDER_MIME_TYPE;
    use proptest::prelude::*;
    use time::OffsetDateTime;

    fn node(name: &str, mime: &str) -> SourceNode {
        SourceNode {
            id: format!("id-{name}"),
            name: name.into(),
            mime_type: mime.into(),
            modified_time: OffsetDateTime::UNIX_EPOCH,
            parents: Vec::new(),
            trashed: false,
        }
    }

    #[test]
    fn plain_files_keep_their_names() {
        let target = leaf_target("Docs/", &node("b.txt", "text/plain")).unwrap();
        assert_eq!(target.key, "Docs/b.txt");
        assert_eq!(target.content_type, "text/plain");
        assert!(target.export.is_none());
    }

    #[test]
    fn canonical_extension_is_appended_when_missing() {
        let target = leaf_target("", &node("Invoice", "application/pdf")).unwrap();
        assert_eq!(target.key, "Invoice.pdf");
        let target = leaf_target("", &node("photo.JPEG", "image/jpeg")).unwrap();
        assert_eq!(target.key, "photo.JPEG");
    }

    #[test]
    fn native_documents_use_export_extension() {
        let target =
            leaf_target("A/", &node("Plan", "application/vnd.google-apps.spreadsheet")).unwrap();
        assert_eq!(target.key, "A/Plan.xlsx");
        assert_eq!(target.export.unwrap().extension, "xlsx");
        assert!(matches!(
            leaf_target("", &node("Survey", "application/vnd.google-apps.form")),
            Err(PathError::UnsupportedNative(_))
        ));
    }

    #[test]
    fn separators_in_names_do_not_create_levels() {
        assert_eq!(folder_prefix("", "a/b"), "a_b/");
        assert_eq!(sanitize_component(".."), "_");
        assert_eq!(sanitize_component("  "), "_");
    }

    #[test]
    fn folder_mirror_key_is_its_placeholder() {
        let folder = node("C", FOLDER_MIME_TYPE);
        assert_eq!(mirror_key("", &folder).unwrap(), "C/__placeholder");
        assert_eq!(placeholder_key("C/"), "C/__placeholder");
    }

    #[test]
    fn ancestors_fold_into_prefix() {
        assert_eq!(prefix_from_ancestors(["A", "B"]), "A/B/");
        assert_eq!(prefix_from_ancestors(std::iter::empty()), "");
    }

    proptest! {
        #[test]
        fn mirror_path_depends_only_on_names_and_kind(
            ancestors in prop::collection::vec("[a-zA-Z0-9 ._/-]{1,12}", 0..5),
            name in "[a-zA-Z0-9 ._-]{1,16}",
            id_a in "[a-z0-9]{4,10}",
            id_b in "[a-z0-9]{4,10}",
            folder in any::<bool>(),
        ) {
            let mime = if folder { FOLDER_MIME_TYPE } else { "application/pdf" };
            let mut first = node(&name, mime);
            first.id = id_a;
            let mut second = node(&name, mime);
            second.id = id_b;
            second.modified_time = OffsetDateTime::now_utc();

            let prefix_a = prefix_from_ancestors(ancestors.iter().map(String::as_str));
            let mut prefix_b = String::new();
            for ancestor in &ancestors {
                prefix_b = folder_prefix(&prefix_b, ancestor);
            }

            prop_assert_eq!(
                mirror_key(&prefix_a, &first).unwrap(),
                mirror_key(&prefix_b, &second).unwrap()
            );
        }
    }
}
