use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use tracing::{debug, warn};

use crate::api::ContentApi;
use crate::error::ExportError;
use crate::layout::sanitize_segment;

/// Folder attachments land in, next to their page's file.
pub const ATTACHMENT_FOLDER_NAME: &str = "attachments";

// 4 MiB; single threaded, so this is safe to raise much higher.
const DOWNLOAD_CHUNK_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentStats {
    pub downloaded: usize,
    pub missing: usize,
}

/// Download every attachment of a page into `<output_dir>/attachments/`.
///
/// An attachment the service no longer has (HTTP 404) is logged and
/// skipped; any other failure aborts the run.
pub fn download_attachments<A: ContentApi + ?Sized>(
    api: &mut A,
    page_id: &str,
    output_dir: &Path,
) -> Result<AttachmentStats, ExportError> {
    let mut stats = AttachmentStats::default();
    for attachment in api.get_attachments(page_id)? {
        let sanitized_name = sanitize_segment(&attachment.title);
        let folder = output_dir.join(ATTACHMENT_FOLDER_NAME);
        fs::create_dir_all(&folder)
            .map_err(|error| ExportError::io("failed to create", &folder, error))?;
        let destination = folder.join(&sanitized_name);

        debug!(
            "saving attachment {} to {}",
            attachment.title,
            destination.display()
        );
        let Some(reader) = api.open_attachment(&attachment.download)? else {
            warn!("attachment {} not found (404), skipping", attachment.download);
            stats.missing += 1;
            continue;
        };
        write_chunked(reader, &destination)?;
        stats.downloaded += 1;
    }
    Ok(stats)
}

/// Copy the response body in fixed-size chunks so peak memory stays at one
/// chunk no matter how large the attachment is.
fn write_chunked(mut reader: Box<dyn Read>, destination: &Path) -> Result<(), ExportError> {
    let mut file = File::create(destination)
        .map_err(|error| ExportError::io("failed to create", destination, error))?;
    let mut chunk = vec![0u8; DOWNLOAD_CHUNK_SIZE];
    loop {
        let read = reader
            .read(&mut chunk)
            .map_err(|error| ExportError::io("failed to download", destination, error))?;
        if read == 0 {
            break;
        }
        file.write_all(&chunk[..read])
            .map_err(|error| ExportError::io("failed to write", destination, error))?;
    }
    Ok(())
}
