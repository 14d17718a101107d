mod cli;

use std::collections::HashSet;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info};

use cli::{Cli, Commands, DownloadArgs, InstallToolsArgs};
use mediaq::config::Config;
use mediaq::events::{BroadcastSink, EventSink, LogSink, QueueEvent};
use mediaq::fetcher::{self, MirrorFetcher, ProgressRatchet};
use mediaq::model::Job;
use mediaq::service::Service;

type AnyError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), AnyError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Download(args) => download(config, args).await?,
        Commands::InstallTools(args) => install_tools(config, args).await?,
        Commands::Status => status(config).await?,
    }

    Ok(())
}

/// Enqueue the given URLs and block until every one reaches a resting state.
async fn download(config: Config, args: DownloadArgs) -> Result<(), AnyError> {
    let service = Service::start(config).await?;

    let sink = Arc::new(BroadcastSink::new(256));
    let mut events = sink.subscribe();
    service.attach_sink(sink).await;

    let mut outstanding = HashSet::new();
    for url in &args.urls {
        let mut job = Job::new(url, url);
        job.format_selector = args.format.clone();
        let id = service.queue.enqueue(job).await?;
        outstanding.insert(id);
    }

    let logger = LogSink;
    while !outstanding.is_empty() {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                // Progress events dropped under load; resting states are
                // re-checked against the store below.
                info!(skipped, "Event stream lagged");
                refresh_outstanding(&service, &mut outstanding)?;
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        logger.emit(event.clone()).await;
        match &event {
            QueueEvent::JobCompleted { job_id, .. }
            | QueueEvent::JobError { job_id, .. }
            | QueueEvent::JobPaused { job_id }
            | QueueEvent::JobDeleted { job_id } => {
                outstanding.remove(job_id.as_str());
            }
            _ => {}
        }
    }

    service.shutdown();
    Ok(())
}

fn refresh_outstanding(
    service: &Service,
    outstanding: &mut HashSet<String>,
) -> Result<(), AnyError> {
    for job in service.queue.store().list()? {
        if job.status.is_terminal() || job.status == mediaq::model::JobStatus::Paused {
            outstanding.remove(&job.id);
        }
    }
    Ok(())
}

/// Fetch the extractor (and converter unless skipped) and record the
/// installed paths in settings.
async fn install_tools(config: Config, args: InstallToolsArgs) -> Result<(), AnyError> {
    let service = Service::start(config).await?;
    let fetcher = MirrorFetcher::new(&service.config.fetcher, service.metrics.clone())?;
    let install_dir = service.config.paths.install_dir.clone();

    let mut progress = ProgressRatchet::new(|pct| info!(percent = pct as u64, "Fetching"));

    let extractor =
        fetcher::install_extractor(&fetcher, &service.config.fetcher, &install_dir, &mut progress)
            .await?;
    info!(path = %extractor.display(), "Extractor installed");

    let converter = if args.extractor_only {
        None
    } else {
        let mut progress = ProgressRatchet::new(|pct| info!(percent = pct as u64, "Fetching"));
        match fetcher::install_converter(
            &fetcher,
            &service.config.fetcher,
            &install_dir,
            &mut progress,
        )
        .await
        {
            Ok(path) => {
                info!(path = %path.display(), "Converter installed");
                Some(path)
            }
            Err(err) => {
                // The extractor alone can still download; conversion-only
                // formats will fail at job time.
                error!(error = %err, "Converter install failed");
                None
            }
        }
    };

    let mut settings = service.queue.store().settings()?;
    settings.extractor_path = Some(extractor);
    if converter.is_some() {
        settings.converter_path = converter;
    }
    service.queue.store().set_settings(&settings).await?;
    service.shutdown();
    Ok(())
}

async fn status(config: Config) -> Result<(), AnyError> {
    let service = Service::start(config).await?;
    let jobs = service.queue.store().list()?;
    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }
    for job in jobs {
        println!(
            "{}  {:<12}  {:>5.1}%  retries={}  {}",
            job.id,
            format!("{:?}", job.status),
            job.progress_percent,
            job.retry_count,
            job.title,
        );
    }
    Ok(())
}
