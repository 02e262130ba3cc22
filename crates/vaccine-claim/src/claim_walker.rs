use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::LOCATION;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info, warn};
use url::Url;

use crate::claim_types::{Candidate, ClaimError, ClaimSession};
use crate::session::SessionContext;

/// Container listing the selectable options on the claim page
const OPTION_CONTAINER: &str = "#info_item_exist";

/// Turns a candidate into a claim session, if one of the options is selectable
#[async_trait]
pub trait ClaimResolver: Send + Sync {
    /// `Ok(None)` when there is nothing to claim for this candidate
    async fn resolve(
        &self,
        candidate: &Candidate,
        option_ids: &[String],
    ) -> Result<Option<ClaimSession>, ClaimError>;
}

/// Walker settings
#[derive(Debug, Clone)]
pub struct WalkerConfig {
    /// Redirect hops followed before giving up (default: 10)
    pub max_redirects: usize,

    /// Rewrite `http://` redirect targets to `https://` (default: true)
    pub upgrade_insecure_redirects: bool,

    /// Timeout for each hop (default: 10 seconds)
    pub timeout: Duration,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            max_redirects: 10,
            upgrade_insecure_redirects: true,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Option state read from the claim page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionAvailability {
    /// No option container, or an empty one
    NothingOffered,
    /// Options exist but none of the requested ones can be selected
    NotSelectable,
    /// This requested option can be selected
    Selectable(String),
}

/// Follows the standby redirect chain to the claim page and inspects it
pub struct ClaimWalker {
    session: Arc<SessionContext>,
    config: WalkerConfig,
}

impl ClaimWalker {
    /// Create a walker on a shared session
    pub fn new(session: Arc<SessionContext>, config: Option<WalkerConfig>) -> Self {
        Self {
            session,
            config: config.unwrap_or_default(),
        }
    }

    /// Target of a redirect, resolved against the current URL
    pub fn next_hop(&self, current: &Url, location: &str) -> Result<Url, ClaimError> {
        let mut next = current.join(location).map_err(|e| {
            ClaimError::MalformedResponse(format!("bad redirect location {}: {}", location, e))
        })?;

        if self.config.upgrade_insecure_redirects && next.scheme() == "http" {
            next.set_scheme("https").map_err(|_| {
                ClaimError::MalformedResponse(format!("cannot upgrade redirect {}", location))
            })?;
        }

        Ok(next)
    }

    /// Fetch the page at the end of the redirect chain
    ///
    /// Returns `Ok(None)` when the hop limit is exceeded.
    async fn follow(&self, start: Url) -> Result<Option<(Url, String)>, ClaimError> {
        let client = self.session.client();
        let endpoints = self.session.endpoints();
        let mut url = start;
        let mut hops = 0;

        loop {
            let response = client
                .get(url.clone())
                .timeout(self.config.timeout)
                .header(
                    "Accept",
                    "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
                )
                .send()
                .await
                .map_err(|e| ClaimError::from_reqwest("claim page request failed", e))?;

            let status = response.status();
            if is_redirect(status) {
                if hops >= self.config.max_redirects {
                    warn!(
                        "Gave up after {} redirects, last location {}",
                        hops, url
                    );
                    return Ok(None);
                }
                hops += 1;

                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .ok_or_else(|| {
                        ClaimError::MalformedResponse(format!("{} without Location", status))
                    })?;

                url = self.next_hop(&url, location)?;
                debug!("Redirect {} -> {}", status.as_u16(), url);

                if endpoints.is_login_url(&url) {
                    return Err(ClaimError::AuthenticationExpired);
                }
                continue;
            }

            match status.as_u16() {
                401 | 403 => return Err(ClaimError::AuthenticationExpired),
                _ if !status.is_success() => {
                    return Err(ClaimError::UnexpectedStatus(status.as_u16()));
                }
                _ => {}
            }

            let body = response
                .text()
                .await
                .map_err(|e| ClaimError::from_reqwest("claim page body unreadable", e))?;

            return Ok(Some((url, body)));
        }
    }

    /// Inspect the claim page for the first selectable requested option
    pub fn inspect_options(html: &str, option_ids: &[String]) -> OptionAvailability {
        let document = Html::parse_document(html);

        let (Ok(container_selector), Ok(item_selector)) =
            (Selector::parse(OPTION_CONTAINER), Selector::parse("li"))
        else {
            return OptionAvailability::NothingOffered;
        };

        let Some(container) = document.select(&container_selector).next() else {
            return OptionAvailability::NothingOffered;
        };

        if container.select(&item_selector).next().is_none() {
            return OptionAvailability::NothingOffered;
        }

        for option_id in option_ids {
            let found = container
                .descendants()
                .filter_map(ElementRef::wrap)
                .find(|element| element.value().id() == Some(option_id.as_str()));

            match found {
                Some(element) if !is_disabled(element) => {
                    return OptionAvailability::Selectable(option_id.clone());
                }
                Some(_) => debug!("Option {} is disabled", option_id),
                None => debug!("Option {} is not offered", option_id),
            }
        }

        OptionAvailability::NotSelectable
    }
}

#[async_trait]
impl ClaimResolver for ClaimWalker {
    async fn resolve(
        &self,
        candidate: &Candidate,
        option_ids: &[String],
    ) -> Result<Option<ClaimSession>, ClaimError> {
        let start = self
            .session
            .endpoints()
            .standby_url(&candidate.organization_code, &candidate.facility_id)?;
        info!("Checking {} at {}", candidate.name, start);

        let Some((resolved_url, body)) = self.follow(start).await? else {
            return Ok(None);
        };

        let option_id = match Self::inspect_options(&body, option_ids) {
            OptionAvailability::Selectable(option_id) => option_id,
            OptionAvailability::NothingOffered => {
                info!("{} offers nothing to claim", candidate.name);
                return Ok(None);
            }
            OptionAvailability::NotSelectable => {
                info!("{} has none of the requested options left", candidate.name);
                return Ok(None);
            }
        };

        let session_key = resolved_url
            .query_pairs()
            .find(|(name, _)| name == "key")
            .map(|(_, value)| value.into_owned())
            .ok_or_else(|| {
                ClaimError::MalformedResponse(format!("no session key in {}", resolved_url))
            })?;

        info!("Found option {} at {}", option_id, resolved_url);
        Ok(Some(ClaimSession {
            session_key,
            option_id,
            resolved_url: resolved_url.to_string(),
        }))
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

fn is_disabled(element: ElementRef<'_>) -> bool {
    let flagged = |el: &ElementRef<'_>| {
        el.value().attr("disabled").is_some() || el.value().attr("aria-disabled") == Some("true")
    };

    flagged(&element)
        || element
            .descendants()
            .filter_map(ElementRef::wrap)
            .any(|el| el.value().name() == "input" && flagged(&el))
}
