//! rangesync - delta downloads over HTTP ranges

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use rangesync::cli::{CheckArgs, Cli, Commands, MakeArgs, UpdateArgs};
use rangesync::client::{CheckMethod, UpdateClient, UpdateOptions};
use rangesync::controlfile::FileMaker;
use rangesync::events::{Severity, StatusEvent};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.json);

    match cli.command {
        Commands::Update(args) => run_update(args).await,
        Commands::Make(args) => run_make(args),
        Commands::Check(args) => run_check(args).await,
    }
}

fn init_tracing(verbose: u8, json: bool) {
    let filter = match verbose {
        0 => EnvFilter::new("rangesync=info"),
        1 => EnvFilter::new("rangesync=debug"),
        2 => EnvFilter::new("rangesync=trace"),
        _ => EnvFilter::new("trace"),
    };

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .init();
    }
}

async fn run_update(args: UpdateArgs) -> anyhow::Result<()> {
    let config = args.to_config();
    let options = UpdateOptions {
        control_source: args.control.clone(),
        output: args.output.clone(),
        url_override: args.url.clone(),
        seeds: args.seeds.clone(),
        save_control_file: args.save_control_file.clone(),
    };

    // engine events surface through the log
    let events = Arc::new(|event: StatusEvent| match event.severity {
        Severity::Info => tracing::info!("{}", event.message),
        Severity::Warning => tracing::warn!("{}", event.message),
        Severity::Error => tracing::error!("{}", event.message),
    });

    let mut client = UpdateClient::new(options, config, events);

    // Ctrl+C trips the cancellation token; the engine stops at the next
    // range boundary and leaves the .part file for a future run
    let cancel = client.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Received Ctrl+C, stopping after the current range...");
            cancel.cancel();
        }
    });

    let bar_task = args.progress.then(|| {
        let progress = client.progress();
        tokio::spawn(async move {
            let bar = ProgressBar::new(100);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}% {msg}")
                    .unwrap()
                    .progress_chars("=>-"),
            );
            loop {
                bar.set_position((progress.fraction() * 100.0) as u64);
                bar.set_message(format!(
                    "{} downloaded",
                    human_bytes::human_bytes(progress.bytes_downloaded() as f64)
                ));
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
    });

    let result = client.run().await;
    if let Some(task) = bar_task {
        task.abort();
    }

    let stats = result?;
    let from_seeds = human_bytes::human_bytes(stats.bytes_from_seeds as f64);
    let downloaded = human_bytes::human_bytes(stats.bytes_downloaded as f64);
    tracing::info!(
        output = %stats.output.display(),
        %from_seeds,
        %downloaded,
        requests = stats.requests_made,
        "Update complete"
    );
    Ok(())
}

fn run_make(args: MakeArgs) -> anyhow::Result<()> {
    let mut maker = FileMaker::new(&args.file);
    if let Some(block_size) = args.block_size {
        maker = maker.block_size(block_size);
    }
    if let Some(url) = &args.url {
        maker = maker.url(url);
    }
    for header in &args.headers {
        let (key, value) = header
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("custom header must be KEY=VALUE: {:?}", header))?;
        maker = maker.custom_header(key, value);
    }

    let out_path = maker.write_to(args.output.as_deref())?;
    println!("{}", out_path.display());
    Ok(())
}

async fn run_check(args: CheckArgs) -> anyhow::Result<()> {
    let options = UpdateOptions {
        control_source: args.control.clone(),
        output: args.output.clone(),
        ..Default::default()
    };
    let events = Arc::new(|event: StatusEvent| tracing::debug!("{}", event.message));
    let client = UpdateClient::new(options, rangesync::Config::from_env(), events);

    let method = if args.mtime_only {
        CheckMethod::Mtime
    } else {
        CheckMethod::Sha1
    };

    let update_available = client.check_for_changes(method).await?;
    if update_available {
        println!("update available");
        std::process::exit(1);
    }
    println!("up to date");
    Ok(())
}
