use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "mediaq")]
#[command(about = "Media download queue", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Enqueue one or more URLs and run them to completion
    Download(DownloadArgs),
    /// Fetch and install the extractor and converter binaries
    InstallTools(InstallToolsArgs),
    /// List persisted jobs and their states
    Status,
}

#[derive(clap::Args, Debug)]
pub struct DownloadArgs {
    /// Source URLs to download
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// Format selector override for these jobs
    #[arg(long)]
    pub format: Option<String>,
}

#[derive(clap::Args, Debug)]
pub struct InstallToolsArgs {
    /// Install only the extractor, skipping the converter bundle
    #[arg(long)]
    pub extractor_only: bool,
}
