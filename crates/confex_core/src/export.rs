use std::collections::HashSet;
use std::fs;

use tracing::{debug, error, info, warn};

use crate::api::{ContentApi, Page};
use crate::attachments;
use crate::config::ExportOptions;
use crate::error::ExportError;
use crate::layout::{PageDescription, describe_page};

/// Decides whether a page's on-disk copy is already current.
///
/// Injectable so an incremental mode can plug in later; the default
/// re-exports everything unconditionally. A skipped page is still
/// traversed into, so a policy can never hide a subtree.
pub trait SkipPolicy {
    fn should_skip(&self, page_id: &str, last_modified: Option<&str>) -> bool;
}

/// Default policy: never skip.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysExport;

impl SkipPolicy for AlwaysExport {
    fn should_skip(&self, _page_id: &str, _last_modified: Option<&str>) -> bool {
        false
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExportReport {
    pub spaces_processed: usize,
    pub pages_exported: usize,
    pub pages_skipped: usize,
    pub attachments_downloaded: usize,
    pub attachments_missing: usize,
}

struct WorkItem {
    page_id: String,
    ancestors: Vec<String>,
}

/// Depth-first export of a page hierarchy onto the local filesystem.
///
/// One exporter instance covers one run; its seen-set spans every space
/// visited during that run, so an identifier reported twice anywhere is
/// rejected.
pub struct Exporter<'a, A: ContentApi> {
    api: &'a mut A,
    options: ExportOptions,
    skip_policy: &'a dyn SkipPolicy,
    seen: HashSet<String>,
    report: ExportReport,
}

impl<'a, A: ContentApi> Exporter<'a, A> {
    pub fn new(api: &'a mut A, options: ExportOptions, skip_policy: &'a dyn SkipPolicy) -> Self {
        Self {
            api,
            options,
            skip_policy,
            seen: HashSet::new(),
            report: ExportReport::default(),
        }
    }

    /// Export a single space by key. A `~`-prefixed key addresses a
    /// personal space.
    ///
    /// A space the service cannot resolve ends the run cleanly with
    /// nothing written; a resolved space without a homepage is fatal.
    pub fn export_space(mut self, space_key: &str) -> Result<ExportReport, ExportError> {
        debug!("looking for target space {space_key}");
        let space = match self.api.get_space(space_key) {
            Ok(space) => space,
            Err(lookup_error) if lookup_error.is_not_found() => {
                error!("space {space_key} does not exist: {lookup_error}");
                return Ok(self.report);
            }
            Err(lookup_error) => {
                error!("unknown error while retrieving space {space_key}: {lookup_error}");
                return Ok(self.report);
            }
        };
        let Some(homepage_id) = space.homepage_id else {
            error!("space {space_key} was found, but no homepage is marked");
            return Err(ExportError::MissingHomepage(space.key));
        };

        info!("found target space {space_key}, downloading it");
        self.walk(&homepage_id, vec![space.key.clone()])?;
        self.report.spaces_processed += 1;
        Ok(self.report)
    }

    /// Export every space the service reports.
    pub fn export_all_spaces(mut self) -> Result<ExportReport, ExportError> {
        let spaces = self.api.get_all_spaces()?;
        if spaces.is_empty() {
            error!("no spaces found; check the service URL and credentials");
        }
        for space in spaces {
            debug!("processing space {}", space.key);
            let Some(homepage_id) = space.homepage_id else {
                warn!("skipping space {}: no homepage found", space.key);
                warn!("a root page must be marked for a space to be enumerable");
                return Err(ExportError::MissingHomepage(space.key));
            };
            self.walk(&homepage_id, vec![space.key.clone()])?;
            self.report.spaces_processed += 1;
        }
        Ok(self.report)
    }

    /// Worklist descent over the hierarchy rooted at `root_id`.
    fn walk(&mut self, root_id: &str, ancestors: Vec<String>) -> Result<(), ExportError> {
        let mut stack = vec![WorkItem {
            page_id: root_id.to_string(),
            ancestors,
        }];

        while let Some(item) = stack.pop() {
            // Recorded before any children are pushed, so a cycle in the
            // reported hierarchy is rejected instead of growing the stack.
            if !self.seen.insert(item.page_id.clone()) {
                return Err(ExportError::DuplicatePage(item.page_id));
            }

            let page = self.api.get_page_by_id(&item.page_id)?;
            let last_modified = self.api.get_page_last_modified(&page.id)?;
            let child_ids = self.api.get_child_id_list(&page.id)?;
            let is_leaf = child_ids.is_empty();
            let descr = describe_page(&self.options.out_dir, &page.title, &item.ancestors, is_leaf);

            if self
                .skip_policy
                .should_skip(&page.id, last_modified.as_deref())
            {
                debug!("skipping page {} ({})", page.title, page.id);
                self.report.pages_skipped += 1;
            } else {
                self.persist_page(&page, &descr)?;
            }

            let mut child_ancestors = descr.sanitized_ancestors;
            child_ancestors.push(page.title.clone());
            // Reversed so the first child's subtree completes first.
            for child_id in child_ids.into_iter().rev() {
                stack.push(WorkItem {
                    page_id: child_id,
                    ancestors: child_ancestors.clone(),
                });
            }
        }
        Ok(())
    }

    fn persist_page(&mut self, page: &Page, descr: &PageDescription) -> Result<(), ExportError> {
        fs::create_dir_all(&descr.output_dir)
            .map_err(|error| ExportError::io("failed to create", &descr.output_dir, error))?;
        info!("saving {}", descr.page_location.join(" / "));
        fs::write(&descr.file_path, &page.body)
            .map_err(|error| ExportError::io("failed to write", &descr.file_path, error))?;
        self.report.pages_exported += 1;

        if !self.options.skip_attachments {
            let stats = attachments::download_attachments(&mut *self.api, &page.id, &descr.output_dir)?;
            self.report.attachments_downloaded += stats.downloaded;
            self.report.attachments_missing += stats.missing;
        }
        Ok(())
    }
}
