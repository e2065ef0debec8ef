//! Manual batch harness
//!
//! Runs one download batch from the command line and polls its progress
//! until it reaches a terminal state. Credentials come from the
//! environment so they never land in shell history:
//!
//! ```text
//! ECLAIM_USERNAME=... ECLAIM_PASSWORD=... \
//!     run_batch <rep|stm|smt> <fiscal_year> <service_month> <scheme> [workers]
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use eclaim_fetcher::application::{AppContext, DownloadOrchestrator};
use eclaim_fetcher::domain::entities::{Credential, DownloadParams, SourceType};
use eclaim_fetcher::infrastructure::logging::init_logging;

struct Args {
    source_type: SourceType,
    params: DownloadParams,
}

fn parse_args() -> Result<Args> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 4 {
        bail!(
            "usage: run_batch <rep|stm|smt> <fiscal_year> <service_month> <scheme> [workers]"
        );
    }

    let source_type = SourceType::parse(&args[0])
        .with_context(|| format!("unknown source type '{}', expected rep|stm|smt", args[0]))?;
    let fiscal_year: i64 = args[1]
        .parse()
        .with_context(|| format!("invalid fiscal year '{}'", args[1]))?;
    let service_month: u32 = args[2]
        .parse()
        .with_context(|| format!("invalid service month '{}'", args[2]))?;
    if !(1..=12).contains(&service_month) {
        bail!("service month must be between 1 and 12");
    }
    let scheme = args[3].clone();
    let max_workers: usize = match args.get(4) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("invalid worker count '{raw}'"))?,
        None => 3,
    };

    Ok(Args {
        source_type,
        params: DownloadParams {
            fiscal_year,
            service_month,
            scheme,
            max_workers,
            auto_import: false,
        },
    })
}

fn credentials_from_env() -> Result<Vec<Credential>> {
    let username =
        std::env::var("ECLAIM_USERNAME").context("ECLAIM_USERNAME is not set")?;
    let secret =
        std::env::var("ECLAIM_PASSWORD").context("ECLAIM_PASSWORD is not set")?;
    Ok(vec![Credential {
        username,
        secret,
        label: "env".to_string(),
        enabled: true,
    }])
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;
    let credentials = credentials_from_env()?;

    // Subscriber first, so config loading and stale-session recovery are
    // captured. RUST_LOG adjusts the level.
    init_logging()?;
    let context = Arc::new(AppContext::init().await?);

    let orchestrator = DownloadOrchestrator::new(Arc::clone(&context));
    if !orchestrator.can_start_download(args.source_type).await {
        bail!(
            "an active {} session already exists, wait for it or cancel it first",
            args.source_type
        );
    }

    let session_id = orchestrator
        .start_batch(args.source_type, args.params, credentials)
        .await
        .context("Failed to start batch")?;
    println!("started session {session_id}");

    loop {
        tokio::time::sleep(Duration::from_secs(2)).await;
        let Some(state) = orchestrator.get_progress(&session_id).await else {
            bail!("session {session_id} disappeared");
        };

        println!(
            "[{}] {:>5.1}% processed {}/{} (downloaded {}, skipped {}, failed {})",
            state.status.as_str(),
            state.progress_percent(),
            state.counts.processed,
            state.counts.total_discovered,
            state.counts.downloaded,
            state.counts.skipped,
            state.counts.failed,
        );

        if state.status.is_terminal() {
            if let Some(error) = &state.error_message {
                eprintln!("session ended with error: {error}");
            }
            let files = orchestrator.take_downloaded_files(&session_id).await;
            println!(
                "final state: {} ({} file(s) downloaded)",
                state.status.as_str(),
                files.len()
            );
            for file in files {
                println!("  {}", file.display());
            }
            break;
        }
    }

    Ok(())
}
