use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use confex_core::api::ConfluenceClient;
use confex_core::config::{ClientConfig, ExportOptions};
use confex_core::export::{AlwaysExport, Exporter};
use confex_core::markdown::render_tree;

#[derive(Debug, Parser)]
#[command(
    name = "confex",
    version,
    about = "Export a Confluence space tree to HTML and render it to Markdown"
)]
struct Cli {
    /// Base URL of the Confluence instance
    #[arg(long, env = "CONFEX_URL")]
    url: String,
    /// Username to authenticate with
    #[arg(long, env = "CONFEX_USERNAME")]
    username: String,
    /// API access token
    #[arg(long, env = "CONFEX_TOKEN", hide_env_values = true)]
    token: String,
    /// Directory to write the exported tree into
    #[arg(long, value_name = "PATH", env = "CONFEX_OUT_DIR")]
    out_dir: PathBuf,
    /// Space key to export (prefix with `~` for a personal space);
    /// omit to export every space
    #[arg(long, env = "CONFEX_SPACE_KEY")]
    space: Option<String>,
    /// Skip fetching attachments
    #[arg(long, env = "CONFEX_SKIP_ATTACHMENTS")]
    skip_attachments: bool,
    /// Skip fetching entirely and only rerun the Markdown conversion
    /// over a previously exported tree
    #[arg(long, env = "CONFEX_NO_FETCH")]
    no_fetch: bool,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging();
    let cli = Cli::parse();

    if !cli.no_fetch {
        run_export(&cli)?;
    }

    let report = render_tree(&cli.out_dir).context("markdown render pass failed")?;
    info!("rendered {} markdown files", report.files_converted);
    Ok(())
}

fn run_export(cli: &Cli) -> Result<()> {
    let config = ClientConfig::new(&cli.url, &cli.username, &cli.token);
    let mut api = ConfluenceClient::new(config).context("failed to build service client")?;
    let options = ExportOptions {
        out_dir: cli.out_dir.clone(),
        skip_attachments: cli.skip_attachments,
    };
    let exporter = Exporter::new(&mut api, options, &AlwaysExport);

    let report = match &cli.space {
        Some(space_key) => exporter.export_space(space_key),
        None => exporter.export_all_spaces(),
    }
    .context("export pass failed")?;

    info!(
        "exported {} pages across {} spaces ({} attachments, {} missing)",
        report.pages_exported,
        report.spaces_processed,
        report.attachments_downloaded,
        report.attachments_missing
    );
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout)
        .init();
}
