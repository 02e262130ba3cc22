//! Command-line entry point for the leftover vaccine claimer.
//! Loads credentials, prepares the browser and runs the polling loop.

use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use vaccine_claim::{
    AvailabilityPoller, ClaimExecutor, ClaimMode, ClaimOutcome, ClaimTarget, ClaimWalker,
    Endpoints, RunOutcome, SchedulerLoop, SearchCriteria, SessionContext, SystemClock,
    WebDriverBrowser,
};

mod config;
use config::{Cli, RunnerConfig};

/// Block until the operator presses Enter or cancels
async fn await_acknowledgment(cancel: &CancellationToken) {
    log::info!("⏸️ Waiting for Enter before exiting...");
    let mut line = String::new();
    let mut stdin = BufReader::new(tokio::io::stdin());

    tokio::select! {
        _ = cancel.cancelled() => {}
        result = stdin.read_line(&mut line) => {
            if let Err(e) = result {
                log::warn!("Could not read from stdin: {}", e);
            }
        }
    }
}

fn log_banner(config: &RunnerConfig, endpoints: &Endpoints) {
    let names: Vec<String> = config.options.iter().map(|kind| kind.to_string()).collect();
    log::info!(
        "💉 Monitoring {} region(s) for {}",
        config.regions.len(),
        names.join(", ")
    );
    for region in &config.regions {
        log::info!("📍 {}", endpoints.map_url_for(region));
    }
    log::info!("🕘 Active hours: {}", config.scheduler.active_window);

    match config.mode {
        ClaimMode::Automatic => log::info!("🤖 A matching slot will be claimed automatically"),
        ClaimMode::Manual => log::info!("🖐️ A matching slot will be opened for you to finish"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = Cli::parse().into_config()?;
    let endpoints = Endpoints::default();

    log::info!("🚀 Starting claim runner...");

    let session = Arc::new(SessionContext::new(
        config.credentials.clone(),
        endpoints.clone(),
        None,
    )?);

    let browser = match WebDriverBrowser::launch(config.browser.clone(), &session).await {
        Ok(browser) => browser,
        Err(e) => {
            log::error!("❌ Failed to start the browser: {}", e);
            log::error!("💡 Make sure chromedriver is running at {}", config.browser.webdriver_url);
            return Err(e.into());
        }
    };
    let browser = Arc::new(browser);

    log_banner(&config, &endpoints);
    if let Err(e) = browser.minimize().await {
        log::warn!("Could not minimise the browser: {}", e);
    }

    let target = ClaimTarget {
        regions: config.regions.clone(),
        criteria: SearchCriteria::default(),
        option_ids: config.option_ids(),
        mode: config.mode,
    };

    let mut scheduler = SchedulerLoop::new(
        Arc::new(AvailabilityPoller::new(session.clone(), None)),
        Arc::new(ClaimWalker::new(session.clone(), None)),
        Arc::new(ClaimExecutor::new(browser.clone(), endpoints, None)),
        Arc::new(SystemClock),
        target,
        Some(config.scheduler.clone()),
    )?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("🛑 Interrupt received, stopping...");
            ctrl_c.cancel();
        }
    });

    let result = scheduler.run(cancel.clone()).await;
    drop(scheduler);

    let keep_browser = match &result {
        Ok(RunOutcome::Finished(report)) => {
            match report.outcome {
                ClaimOutcome::Claimed => log::info!(
                    "✅ Claimed at {} ({})",
                    report.candidate.name,
                    report.candidate.facility_id
                ),
                _ => log::info!(
                    "👉 Finish the reservation in the browser: {}",
                    report.candidate.name
                ),
            }

            if config.wait_for_ack {
                await_acknowledgment(&cancel).await;
                false
            } else {
                true
            }
        }
        Ok(RunOutcome::Cancelled) => false,
        Err(e) => {
            log::error!("❌ Stopped: {}", e);
            false
        }
    };

    if let Ok(browser) = Arc::try_unwrap(browser) {
        let shutdown = if keep_browser {
            browser.detach().await
        } else {
            browser.close().await
        };
        if let Err(e) = shutdown {
            log::warn!("Could not release the browser: {}", e);
        }
    }

    result?;
    Ok(())
}
