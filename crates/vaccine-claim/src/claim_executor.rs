use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::browser::BrowserHandle;
use crate::claim_types::{ClaimError, ClaimMode, ClaimOutcome, ClaimSession};
use crate::session::Endpoints;

/// Submits a resolved session
#[async_trait]
pub trait ClaimSubmitter: Send + Sync {
    /// Consume the session in one claim attempt
    async fn execute(
        &self,
        session: ClaimSession,
        mode: ClaimMode,
    ) -> Result<ClaimOutcome, ClaimError>;
}

/// How a confirmation title is compared with a known phrase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TitleMatch {
    /// Whole title equals the phrase
    Exact(&'static str),
    /// Title ends with the phrase
    Suffix(&'static str),
}

impl TitleMatch {
    fn matches(&self, title: &str) -> bool {
        match self {
            TitleMatch::Exact(phrase) => title == *phrase,
            TitleMatch::Suffix(phrase) => title.ends_with(phrase),
        }
    }
}

/// Known confirmation titles, checked in order
pub const TITLE_OUTCOMES: &[(TitleMatch, ClaimOutcome)] = &[
    (TitleMatch::Exact("당일 예약정보입니다."), ClaimOutcome::Claimed),
    (
        TitleMatch::Suffix("잔여백신 당일 예약이 완료되었습니다."),
        ClaimOutcome::Claimed,
    ),
    (
        TitleMatch::Exact("잔여백신 당일 예약이 실패되었습니다."),
        ClaimOutcome::Rejected,
    ),
];

/// Map a confirmation title to an outcome; unknown or missing titles are `Indeterminate`
pub fn classify_title(title: Option<&str>) -> ClaimOutcome {
    let Some(title) = title.map(str::trim) else {
        return ClaimOutcome::Indeterminate;
    };

    TITLE_OUTCOMES
        .iter()
        .find(|(rule, _)| rule.matches(title))
        .map(|(_, outcome)| *outcome)
        .unwrap_or(ClaimOutcome::Indeterminate)
}

/// Executor settings
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Wait after loading the confirmation page (default: 3 seconds)
    pub settle_delay: Duration,

    /// Selector of the confirmation title (default: `.h_title`)
    pub title_selector: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(3),
            title_selector: ".h_title".to_string(),
        }
    }
}

/// Drives the claim through the browser
pub struct ClaimExecutor {
    browser: Arc<dyn BrowserHandle>,
    endpoints: Endpoints,
    config: ExecutorConfig,
}

impl ClaimExecutor {
    /// Create an executor on a shared browser
    pub fn new(
        browser: Arc<dyn BrowserHandle>,
        endpoints: Endpoints,
        config: Option<ExecutorConfig>,
    ) -> Self {
        Self {
            browser,
            endpoints,
            config: config.unwrap_or_default(),
        }
    }

    async fn confirm(&self, session: &ClaimSession) -> ClaimOutcome {
        let progress = match self
            .endpoints
            .progress_url(&session.session_key, &session.option_id)
        {
            Ok(url) => url,
            Err(e) => {
                warn!("Cannot build confirmation URL: {}", e);
                return ClaimOutcome::Indeterminate;
            }
        };
        info!("Submitting claim through {}", progress);

        if let Err(e) = self.browser.navigate(progress.as_str()).await {
            warn!("Confirmation page did not load: {}", e);
            return ClaimOutcome::Indeterminate;
        }

        sleep(self.config.settle_delay).await;

        match self.browser.read_text(&self.config.title_selector).await {
            Ok(Some(title)) => {
                info!("Confirmation title: {}", title.trim());
                classify_title(Some(&title))
            }
            Ok(None) => {
                warn!("Confirmation title {} not found", self.config.title_selector);
                ClaimOutcome::Indeterminate
            }
            Err(e) => {
                warn!("Confirmation title unreadable: {}", e);
                ClaimOutcome::Indeterminate
            }
        }
    }
}

#[async_trait]
impl ClaimSubmitter for ClaimExecutor {
    async fn execute(
        &self,
        session: ClaimSession,
        mode: ClaimMode,
    ) -> Result<ClaimOutcome, ClaimError> {
        match mode {
            ClaimMode::Manual => {
                self.browser.navigate(&session.resolved_url).await?;
                info!("Claim page ready for manual completion: {}", session.resolved_url);
                Ok(ClaimOutcome::Available)
            }
            ClaimMode::Automatic => {
                if let Err(e) = self.browser.navigate(&session.resolved_url).await {
                    warn!("Claim page did not load in the browser: {}", e);
                    return Ok(ClaimOutcome::Indeterminate);
                }

                let outcome = self.confirm(&session).await;
                match outcome {
                    ClaimOutcome::Claimed => info!("Claim confirmed for {}", session.option_id),
                    ClaimOutcome::Rejected => warn!("Claim rejected by provider"),
                    _ => warn!("Claim outcome could not be determined"),
                }
                Ok(outcome)
            }
        }
    }
}
