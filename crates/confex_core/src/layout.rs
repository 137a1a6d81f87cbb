use std::path::{Path, PathBuf};

use tracing::warn;

/// Extension pages are stored under during the export pass; the render pass
/// later adds a `.md` sibling for each one.
pub const PAGE_EXTENSION: &str = "html";

/// Substrings that must never reach the filesystem as part of a path segment.
const UNSAFE_PARTS: [&str; 2] = ["..", "/"];

/// Replace every occurrence of a path-traversal substring with `_`.
///
/// Page titles and attachment names are externally controlled; this is the
/// only defense between them and the output tree. Idempotent.
pub fn sanitize_segment(raw: &str) -> String {
    let mut segment = raw.to_string();
    for unsafe_part in UNSAFE_PARTS {
        if segment.contains(unsafe_part) {
            warn!(
                "dangerous page title {segment:?}: {unsafe_part:?} found, replacing it with \"_\""
            );
            segment = segment.replace(unsafe_part, "_");
        }
    }
    segment
}

/// Where a page lands on disk, derived from its title, its ancestor chain,
/// and whether it has children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDescription {
    pub sanitized_filename: String,
    pub sanitized_ancestors: Vec<String>,
    /// Ancestor segments plus the filename, relative to the output root.
    pub page_location: Vec<String>,
    pub file_path: PathBuf,
    pub output_dir: PathBuf,
}

/// Derive a [`PageDescription`]. Pure: no directory is created here.
///
/// Non-leaf pages become `index.html` inside a directory named after the
/// page so their descendants can nest beneath it; leaf pages become
/// `<title>.html` in the parent's directory.
pub fn describe_page(
    out_dir: &Path,
    title: &str,
    ancestors: &[String],
    is_leaf: bool,
) -> PageDescription {
    let document_name = if is_leaf {
        format!("{title}.{PAGE_EXTENSION}")
    } else {
        format!("index.{PAGE_EXTENSION}")
    };

    let sanitized_filename = sanitize_segment(&document_name);
    let sanitized_ancestors: Vec<String> = ancestors
        .iter()
        .map(|ancestor| sanitize_segment(ancestor))
        .collect();

    let mut page_location = sanitized_ancestors.clone();
    page_location.push(sanitized_filename.clone());

    let mut file_path = out_dir.to_path_buf();
    for segment in &page_location {
        file_path.push(segment);
    }
    let output_dir = file_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| out_dir.to_path_buf());

    PageDescription {
        sanitized_filename,
        sanitized_ancestors,
        page_location,
        file_path,
        output_dir,
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{PageDescription, describe_page, sanitize_segment};

    #[test]
    fn sanitize_replaces_traversal_substrings() {
        assert_eq!(sanitize_segment("../etc/passwd"), "__etc_passwd");
        assert_eq!(sanitize_segment("a/b"), "a_b");
        assert_eq!(sanitize_segment("up..down"), "up_down");
        assert_eq!(sanitize_segment("Plain Title"), "Plain Title");
    }

    #[test]
    fn sanitize_output_never_contains_unsafe_parts() {
        for raw in ["..", "....", "../..", "a/../b", ".../...", "//"] {
            let sanitized = sanitize_segment(raw);
            assert!(!sanitized.contains(".."), "{raw} -> {sanitized}");
            assert!(!sanitized.contains('/'), "{raw} -> {sanitized}");
        }
    }

    #[test]
    fn sanitize_is_idempotent() {
        for raw in ["..", "a/b..c", "normal", "../../x"] {
            let once = sanitize_segment(raw);
            assert_eq!(sanitize_segment(&once), once);
        }
    }

    #[test]
    fn leaf_pages_are_titled_files() {
        let descr = describe_page(
            Path::new("/tmp/out"),
            "Child",
            &["SPACE".to_string(), "Home".to_string()],
            true,
        );
        assert_eq!(descr.sanitized_filename, "Child.html");
        assert_eq!(
            descr.file_path,
            Path::new("/tmp/out/SPACE/Home/Child.html")
        );
        assert_eq!(descr.output_dir, Path::new("/tmp/out/SPACE/Home"));
    }

    #[test]
    fn non_leaf_pages_become_index_files() {
        let descr = describe_page(Path::new("/tmp/out"), "Home", &["SPACE".to_string()], false);
        assert_eq!(descr.sanitized_filename, "index.html");
        assert_eq!(descr.file_path, Path::new("/tmp/out/SPACE/index.html"));
        assert_eq!(descr.page_location, vec!["SPACE", "index.html"]);
    }

    #[test]
    fn ancestors_are_sanitized_in_place() {
        let descr = describe_page(
            Path::new("/out"),
            "Leaf",
            &["SPACE".to_string(), "evil/../dir".to_string()],
            true,
        );
        assert_eq!(descr.sanitized_ancestors, vec!["SPACE", "evil___dir"]);
        assert_eq!(descr.file_path, Path::new("/out/SPACE/evil___dir/Leaf.html"));
    }

    #[test]
    fn moving_a_page_moves_its_output_path_identically() {
        let here = describe_page(Path::new("/out"), "Page", &["A".to_string()], true);
        let there = describe_page(Path::new("/out"), "Page", &["B".to_string()], true);
        assert_eq!(here.sanitized_filename, there.sanitized_filename);
        assert_eq!(here.file_path, Path::new("/out/A/Page.html"));
        assert_eq!(there.file_path, Path::new("/out/B/Page.html"));
    }

    #[test]
    fn description_is_a_plain_value() {
        let descr = describe_page(Path::new("/out"), "T", &[], true);
        let PageDescription { page_location, .. } = descr.clone();
        assert_eq!(page_location, vec!["T.html"]);
        assert_eq!(descr, descr.clone());
    }
}
