use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, cookie::Jar, redirect::Policy};
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use crate::claim_types::{ClaimError, Region};

/// Mobile Safari, matching the pages the provider serves to its app
pub const MOBILE_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.1 Safari/605.1.15";

/// The four provider cookies that authenticate a user
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// `NNB` browser id cookie
    pub nnb: String,
    /// `NID_AUT` cookie
    pub nid_aut: String,
    /// `NID_JKL` cookie
    pub nid_jkl: String,
    /// `NID_SES` cookie
    pub nid_ses: String,
}

impl Credentials {
    /// Build credentials, rejecting blank values
    pub fn new(
        nnb: impl Into<String>,
        nid_aut: impl Into<String>,
        nid_jkl: impl Into<String>,
        nid_ses: impl Into<String>,
    ) -> Result<Self, ClaimError> {
        let credentials = Self {
            nnb: nnb.into(),
            nid_aut: nid_aut.into(),
            nid_jkl: nid_jkl.into(),
            nid_ses: nid_ses.into(),
        };

        for cookie in credentials.cookies() {
            if cookie.value.trim().is_empty() {
                return Err(ClaimError::Config(format!(
                    "credential cookie {} is empty",
                    cookie.name
                )));
            }
        }

        Ok(credentials)
    }

    /// Cookies in the order they are installed
    pub fn cookies(&self) -> [AuthCookie<'_>; 4] {
        [
            AuthCookie {
                name: "NNB",
                value: &self.nnb,
                secure: true,
            },
            AuthCookie {
                name: "NID_AUT",
                value: &self.nid_aut,
                secure: false,
            },
            AuthCookie {
                name: "NID_JKL",
                value: &self.nid_jkl,
                secure: true,
            },
            AuthCookie {
                name: "NID_SES",
                value: &self.nid_ses,
                secure: false,
            },
        ]
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("nnb", &"<redacted>")
            .field("nid_aut", &"<redacted>")
            .field("nid_jkl", &"<redacted>")
            .field("nid_ses", &"<redacted>")
            .finish()
    }
}

/// A single authentication cookie
#[derive(Debug, Clone, Copy)]
pub struct AuthCookie<'a> {
    /// Cookie name
    pub name: &'static str,
    /// Cookie value
    pub value: &'a str,
    /// Whether the cookie carries the `Secure` attribute
    pub secure: bool,
}

/// Provider URLs
#[derive(Debug, Clone)]
pub struct Endpoints {
    /// GraphQL search endpoint
    pub search_url: String,
    /// Map page; the region bounds are appended
    pub map_url: String,
    /// Origin of the reservation pages
    pub reservation_base: String,
    /// Host that serves the login form
    pub login_host: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            search_url: "https://api.place.naver.com/graphql".to_string(),
            map_url: "https://m.place.naver.com/rest/vaccine?vaccineFilter=used&bounds="
                .to_string(),
            reservation_base: "https://v-search.nid.naver.com".to_string(),
            login_host: "nid.naver.com".to_string(),
        }
    }
}

impl Endpoints {
    /// Point every endpoint at one base URL (mock servers)
    pub fn with_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            search_url: format!("{}/graphql", base),
            map_url: format!("{}/rest/vaccine?vaccineFilter=used&bounds=", base),
            reservation_base: base.to_string(),
            login_host: "nid.naver.com".to_string(),
        }
    }

    /// Map page showing a region
    pub fn map_url_for(&self, region: &Region) -> String {
        format!("{}{}", self.map_url, region.encoded_bounds())
    }

    /// Standby page for a facility, the start of the redirect chain
    pub fn standby_url(&self, organization_code: &str, facility_id: &str) -> Result<Url, ClaimError> {
        let mut url = self.reservation_url("/reservation/standby")?;
        url.query_pairs_mut()
            .append_pair("orgCd", organization_code)
            .append_pair("sid", facility_id);
        Ok(url)
    }

    /// Confirmation page that submits a claim
    pub fn progress_url(&self, session_key: &str, option_id: &str) -> Result<Url, ClaimError> {
        let mut url = self.reservation_url("/reservation/progress")?;
        url.query_pairs_mut()
            .append_pair("key", session_key)
            .append_pair("cd", option_id);
        Ok(url)
    }

    /// Page listing the user's reservations
    pub fn my_reservations_url(&self) -> Result<Url, ClaimError> {
        self.reservation_url("/reservation/me")
    }

    /// Whether a URL is the login form, where expired sessions are sent
    pub fn is_login_url(&self, url: &Url) -> bool {
        url.host_str() == Some(self.login_host.as_str()) && url.path().starts_with("/nidlogin")
    }

    fn reservation_url(&self, path: &str) -> Result<Url, ClaimError> {
        let base = Url::parse(&self.reservation_base).map_err(|e| {
            ClaimError::Config(format!("invalid reservation base {}: {}", self.reservation_base, e))
        })?;
        base.join(path)
            .map_err(|e| ClaimError::Config(format!("invalid reservation path {}: {}", path, e)))
    }
}

/// HTTP client settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// User agent for every request
    pub user_agent: String,

    /// Domain attribute of the credential cookies; `None` makes them host-only
    pub cookie_domain: Option<String>,

    /// Connect timeout; request timeouts are set per call
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_agent: MOBILE_USER_AGENT.to_string(),
            cookie_domain: Some(".naver.com".to_string()),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Authentication state shared by every network call
///
/// Owns the one HTTP client and its cookie jar. Redirects are never followed
/// automatically; the claim walker follows them itself.
pub struct SessionContext {
    client: Client,
    jar: Arc<Jar>,
    endpoints: Endpoints,
    config: SessionConfig,
    credentials: RwLock<Credentials>,
}

impl SessionContext {
    /// Build the client and load the credential cookies into its jar
    pub fn new(
        credentials: Credentials,
        endpoints: Endpoints,
        config: Option<SessionConfig>,
    ) -> Result<Self, ClaimError> {
        let config = config.unwrap_or_default();
        let jar = Arc::new(Jar::default());

        let client = Client::builder()
            .cookie_provider(jar.clone())
            .user_agent(&config.user_agent)
            .redirect(Policy::none())
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ClaimError::Config(format!("Failed to create HTTP client: {}", e)))?;

        let session = Self {
            client,
            jar,
            endpoints,
            config,
            credentials: RwLock::new(credentials.clone()),
        };
        session.install_cookies(&credentials)?;

        info!("Session prepared for {}", session.endpoints.reservation_base);
        Ok(session)
    }

    /// Replace the credential cookies
    pub async fn update_credentials(&self, credentials: Credentials) -> Result<(), ClaimError> {
        self.install_cookies(&credentials)?;

        *self.credentials.write().await = credentials;

        info!("Session credentials updated");
        Ok(())
    }

    /// Current credentials
    pub async fn credentials(&self) -> Credentials {
        self.credentials.read().await.clone()
    }

    /// Shared HTTP client carrying the cookie jar
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Provider URLs
    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Domain attribute applied to credential cookies
    pub fn cookie_domain(&self) -> Option<&str> {
        self.config.cookie_domain.as_deref()
    }

    fn install_cookies(&self, credentials: &Credentials) -> Result<(), ClaimError> {
        let origin = Url::parse(&self.endpoints.reservation_base).map_err(|e| {
            ClaimError::Config(format!(
                "invalid reservation base {}: {}",
                self.endpoints.reservation_base, e
            ))
        })?;

        for cookie in credentials.cookies() {
            let mut header = format!("{}={}; Path=/", cookie.name, cookie.value);
            if let Some(domain) = &self.config.cookie_domain {
                header.push_str(&format!("; Domain={}", domain));
            }
            if cookie.secure {
                header.push_str("; Secure");
            }
            self.jar.add_cookie_str(&header, &origin);
            debug!("Installed cookie {}", cookie.name);
        }

        Ok(())
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("endpoints", &self.endpoints)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
