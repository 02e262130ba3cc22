use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use fantoccini::cookies::Cookie;
use fantoccini::error::CmdError;
use fantoccini::{Client, ClientBuilder, Locator};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use crate::claim_types::ClaimError;
use crate::session::SessionContext;

/// The two browser capabilities the claim flow needs
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    /// Load a URL in the current window
    async fn navigate(&self, url: &str) -> Result<(), ClaimError>;

    /// Text of the first element matching a CSS selector;
    /// `Ok(None)` when nothing matches
    async fn read_text(&self, selector: &str) -> Result<Option<String>, ClaimError>;
}

/// WebDriver connection settings
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    /// WebDriver server, e.g. a local chromedriver
    pub webdriver_url: String,

    /// Window size used for the mobile pages (default: 640x1136)
    pub window_size: (u32, u32),

    /// Timeout for each WebDriver command (default: 30 seconds)
    pub command_timeout: Duration,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:9515".to_string(),
            window_size: (640, 1136),
            command_timeout: Duration::from_secs(30),
        }
    }
}

/// Chrome session driven through a WebDriver server
pub struct WebDriverBrowser {
    client: Client,
    config: BrowserConfig,
}

impl WebDriverBrowser {
    /// Open a new browser session
    pub async fn connect(config: BrowserConfig) -> Result<Self, ClaimError> {
        let mut capabilities = Map::new();
        capabilities.insert("browserName".to_string(), json!("chrome"));

        let client = ClientBuilder::native()
            .capabilities(capabilities)
            .connect(&config.webdriver_url)
            .await
            .map_err(|e| ClaimError::Automation(format!("cannot start browser session: {}", e)))?;

        info!("Browser session started via {}", config.webdriver_url);
        Ok(Self { client, config })
    }

    /// Open a session and log it in, closing the session again if the login fails
    pub async fn launch(config: BrowserConfig, session: &SessionContext) -> Result<Self, ClaimError> {
        let browser = Self::connect(config).await?;
        if let Err(e) = browser.prepare(session).await {
            if let Err(close_error) = browser.close().await {
                warn!("Browser session left open: {}", close_error);
            }
            return Err(e);
        }
        Ok(browser)
    }

    /// Size the window, load the reservation pages and install the credential cookies
    pub async fn prepare(&self, session: &SessionContext) -> Result<(), ClaimError> {
        let (width, height) = self.config.window_size;
        self.run("resize window", self.client.set_window_size(width, height))
            .await?;

        // Cookies can only be set for the domain of the loaded page
        let reservations = session.endpoints().my_reservations_url()?;
        self.navigate(reservations.as_str()).await?;

        let credentials = session.credentials().await;
        for auth in credentials.cookies() {
            let mut cookie = Cookie::new(auth.name, auth.value.to_string());
            cookie.set_path("/");
            cookie.set_secure(auth.secure);
            if let Some(domain) = session.cookie_domain() {
                cookie.set_domain(domain.to_string());
            }
            self.run("add cookie", self.client.add_cookie(cookie)).await?;
            debug!("Browser cookie {} installed", auth.name);
        }

        self.run("refresh", self.client.refresh()).await?;
        self.navigate(reservations.as_str()).await?;

        info!("Browser logged in with supplied credentials");
        Ok(())
    }

    /// Minimise the window until a claim page needs attention
    pub async fn minimize(&self) -> Result<(), ClaimError> {
        self.run("minimize window", self.client.minimize_window())
            .await
    }

    /// End the browser session
    pub async fn close(self) -> Result<(), ClaimError> {
        let timeout = self.config.command_timeout;
        match tokio::time::timeout(timeout, self.client.close()).await {
            Ok(Ok(())) => {
                info!("Browser session closed");
                Ok(())
            }
            Ok(Err(e)) => Err(automation("close session", e)),
            Err(_) => Err(ClaimError::Automation("close session timed out".to_string())),
        }
    }

    /// Leave the browser window open for the user after this handle is dropped
    pub async fn detach(self) -> Result<(), ClaimError> {
        self.run("persist session", self.client.persist()).await?;
        info!("Browser left open for manual completion");
        Ok(())
    }

    /// Await one WebDriver command under the command timeout
    async fn run<T, F>(&self, action: &str, command: F) -> Result<T, ClaimError>
    where
        F: Future<Output = Result<T, CmdError>>,
    {
        match tokio::time::timeout(self.config.command_timeout, command).await {
            Ok(result) => result.map_err(|e| automation(action, e)),
            Err(_) => {
                warn!("WebDriver {} timed out", action);
                Err(ClaimError::Automation(format!("{} timed out", action)))
            }
        }
    }
}

fn automation(action: &str, error: CmdError) -> ClaimError {
    warn!("WebDriver {} failed: {}", action, error);
    ClaimError::Automation(format!("{} failed: {}", action, error))
}

#[async_trait]
impl BrowserHandle for WebDriverBrowser {
    async fn navigate(&self, url: &str) -> Result<(), ClaimError> {
        debug!("Browser navigating to {}", url);
        self.run("navigate", self.client.goto(url)).await
    }

    async fn read_text(&self, selector: &str) -> Result<Option<String>, ClaimError> {
        let found = tokio::time::timeout(
            self.config.command_timeout,
            self.client.find(Locator::Css(selector)),
        )
        .await
        .map_err(|_| ClaimError::Automation("find element timed out".to_string()))?;

        let element = match found {
            Ok(element) => element,
            Err(e) if e.is_no_such_element() => {
                debug!("No element matches {}", selector);
                return Ok(None);
            }
            Err(e) => return Err(automation("find element", e)),
        };

        self.run("read text", element.text()).await.map(Some)
    }
}
