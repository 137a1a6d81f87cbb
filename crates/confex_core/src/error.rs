use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Failures surfaced by the content-service client.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The service reported that the requested resource does not exist.
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid service URL {0:?}")]
    InvalidUrl(String),
    #[error("unexpected response shape: {0}")]
    Decode(String),
    #[error("request to {0} exhausted its retry budget")]
    RetriesExhausted(String),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// A document that could not be parsed or rewritten as markup.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct MarkupError(pub(crate) String);

/// Conditions that end an export or render run.
#[derive(Debug, Error)]
pub enum ExportError {
    /// The same identifier was reported twice: either page identifiers are
    /// not unique or the hierarchy contains a cycle. The rest of the
    /// traversal cannot be trusted, so the run stops here.
    #[error("duplicate page identifier {0} found")]
    DuplicatePage(String),
    #[error("no homepage found for space {0}")]
    MissingHomepage(String),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("{context} {}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{} is neither a regular file nor a directory", path.display())]
    UnsupportedEntry { path: PathBuf },
    #[error(transparent)]
    Scan(#[from] walkdir::Error),
    #[error("malformed markup in {}", path.display())]
    Markup {
        path: PathBuf,
        #[source]
        source: MarkupError,
    },
}

impl ExportError {
    pub(crate) fn io(context: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn markup(path: &Path, source: MarkupError) -> Self {
        Self::Markup {
            path: path.to_path_buf(),
            source,
        }
    }
}
