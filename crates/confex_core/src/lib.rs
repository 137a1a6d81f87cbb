//! Core engine for mirroring a Confluence space hierarchy onto the local
//! filesystem and rendering the exported markup to Markdown.
//!
//! The export pass ([`export::Exporter`]) walks the page tree depth-first
//! over the [`api::ContentApi`] seam, persisting raw storage markup and
//! attachments. The render pass ([`markdown::render_tree`]) then converts
//! every exported file independently, rewriting embedded media references
//! ([`normalize`]) along the way.

pub mod api;
pub mod attachments;
pub mod config;
pub mod error;
pub mod export;
pub mod layout;
pub mod markdown;
pub mod normalize;
