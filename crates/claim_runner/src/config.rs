use std::time::Duration;

use clap::Parser;
use vaccine_claim::{
    ActiveWindow, BrowserConfig, ClaimError, ClaimMode, Credentials, OptionKind, Region,
    SchedulerConfig,
};

/// Watch clinics for leftover same-day vaccine doses and claim one
#[derive(Debug, Parser)]
#[command(name = "claim_runner", version)]
pub struct Cli {
    /// Map bounds to monitor (`x1;y1;x2;y2`, `%3B`-encoded, or a map URL)
    #[arg(short = 'a', long = "areas", num_args = 1.., required = true)]
    pub areas: Vec<String>,

    /// Vaccines to claim, most preferred first: PF, MO, AZ, JS
    #[arg(short = 'v', long = "vaccines", num_args = 1.., required = true)]
    pub vaccines: Vec<String>,

    /// NNB cookie
    #[arg(long = "nnb", env = "NAVER_NNB", hide_env_values = true)]
    pub nnb: String,

    /// NID_AUT cookie
    #[arg(long = "nid-aut", env = "NAVER_NID_AUT", hide_env_values = true)]
    pub nid_aut: String,

    /// NID_JKL cookie
    #[arg(long = "nid-jkl", env = "NAVER_NID_JKL", hide_env_values = true)]
    pub nid_jkl: String,

    /// NID_SES cookie
    #[arg(long = "nid-ses", env = "NAVER_NID_SES", hide_env_values = true)]
    pub nid_ses: String,

    /// Open the claim page for manual completion instead of submitting it
    #[arg(short = 'c', long = "check-only")]
    pub check_only: bool,

    /// Local hours during which claims are accepted, as START-END
    #[arg(long = "active-hours", default_value = "9-18")]
    pub active_hours: String,

    /// Minimum spacing per region between polling cycles, in milliseconds
    #[arg(long = "interval-ms", default_value_t = 700)]
    pub interval_ms: u64,

    /// WebDriver endpoint of a running chromedriver
    #[arg(
        long = "webdriver-url",
        env = "WEBDRIVER_URL",
        default_value = "http://localhost:9515"
    )]
    pub webdriver_url: String,

    /// Exit right after a claim instead of waiting for Enter
    #[arg(long = "no-wait")]
    pub no_wait: bool,
}

/// Validated runner settings
#[derive(Debug)]
pub struct RunnerConfig {
    /// Regions to poll
    pub regions: Vec<Region>,
    /// Requested vaccines in preference order
    pub options: Vec<OptionKind>,
    /// Credential cookies
    pub credentials: Credentials,
    /// Automatic or manual submission
    pub mode: ClaimMode,
    /// Loop timing
    pub scheduler: SchedulerConfig,
    /// WebDriver settings
    pub browser: BrowserConfig,
    /// Block for an acknowledgment after a claim
    pub wait_for_ack: bool,
}

impl Cli {
    /// Parse and validate every argument
    pub fn into_config(self) -> Result<RunnerConfig, ClaimError> {
        let regions = self
            .areas
            .iter()
            .map(|area| area.parse::<Region>())
            .collect::<Result<Vec<_>, _>>()?;

        let mut options: Vec<OptionKind> = Vec::new();
        for code in &self.vaccines {
            let kind = code.parse::<OptionKind>()?;
            if !options.contains(&kind) {
                options.push(kind);
            }
        }

        let credentials = Credentials::new(self.nnb, self.nid_aut, self.nid_jkl, self.nid_ses)?;

        let scheduler = SchedulerConfig {
            active_window: self.active_hours.parse::<ActiveWindow>()?,
            per_region_interval: Duration::from_millis(self.interval_ms),
            ..SchedulerConfig::default()
        };

        let browser = BrowserConfig {
            webdriver_url: self.webdriver_url,
            ..BrowserConfig::default()
        };

        Ok(RunnerConfig {
            regions,
            options,
            credentials,
            mode: if self.check_only {
                ClaimMode::Manual
            } else {
                ClaimMode::Automatic
            },
            scheduler,
            browser,
            wait_for_ack: !self.no_wait,
        })
    }
}

impl RunnerConfig {
    /// Provider identifiers of the requested options
    pub fn option_ids(&self) -> Vec<String> {
        self.options
            .iter()
            .map(|kind| kind.option_id().to_string())
            .collect()
    }
}
