use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use rust_decimal::Decimal;

/// Matches the `bounds` query parameter of a map URL
static BOUNDS_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"bounds=([^&#]+)").expect("bounds pattern is valid"));

/// Geographic bounding box used as a search scope
///
/// Coordinates are kept as decimals so the midpoint and the bounds string sent
/// to the search endpoint carry exactly the digits the user supplied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    x1: Decimal,
    y1: Decimal,
    x2: Decimal,
    y2: Decimal,
}

impl Region {
    /// Build a region, rejecting empty or inverted rectangles
    pub fn new(x1: Decimal, y1: Decimal, x2: Decimal, y2: Decimal) -> Result<Self, ClaimError> {
        if x1 >= x2 || y1 >= y2 {
            return Err(ClaimError::InvalidRegion(format!(
                "expected x1 < x2 and y1 < y2, got {};{};{};{}",
                x1, y1, x2, y2
            )));
        }

        Ok(Self { x1, y1, x2, y2 })
    }

    /// Midpoint of the rectangle as `(x, y)`
    pub fn center(&self) -> (Decimal, Decimal) {
        let two = Decimal::TWO;
        (
            ((self.x1 + self.x2) / two).normalize(),
            ((self.y1 + self.y2) / two).normalize(),
        )
    }

    /// Bounds in the `x1;y1;x2;y2` form the search endpoint expects
    pub fn bounds(&self) -> String {
        format!("{};{};{};{}", self.x1, self.y1, self.x2, self.y2)
    }

    /// Bounds with the separator URL-encoded, as they appear in map links
    pub fn encoded_bounds(&self) -> String {
        urlencoding::encode(&self.bounds()).into_owned()
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.bounds())
    }
}

impl FromStr for Region {
    type Err = ClaimError;

    /// Accepts `x1;y1;x2;y2`, the `%3B`-encoded form, or a map URL with a
    /// `bounds=` parameter.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        let raw = match BOUNDS_PARAM.captures(input) {
            Some(caps) => caps[1].to_string(),
            None => input.to_string(),
        };

        let decoded = urlencoding::decode(&raw)
            .map_err(|e| ClaimError::InvalidRegion(format!("{}: {}", input, e)))?;

        let parts: Vec<&str> = decoded.split(';').map(str::trim).collect();
        if parts.len() != 4 {
            return Err(ClaimError::InvalidRegion(format!(
                "{}: expected four coordinates, found {}",
                input,
                parts.len()
            )));
        }

        let mut coords = [Decimal::ZERO; 4];
        for (slot, part) in coords.iter_mut().zip(&parts) {
            *slot = Decimal::from_str(part)
                .map_err(|e| ClaimError::InvalidRegion(format!("{}: {}", part, e)))?;
        }

        Region::new(coords[0], coords[1], coords[2], coords[3])
    }
}

/// Domain-specific search filters sent with every poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCriteria {
    /// Search keyword
    pub keyword: String,
    /// Optional category filter
    pub category: Option<String>,
    /// Page size, clamped to `1..=100`
    pub display: u32,
}

impl SearchCriteria {
    /// Largest page the search endpoint returns
    pub const MAX_DISPLAY: u32 = 100;

    /// Criteria for a keyword with the largest page size
    pub fn new(keyword: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            category: None,
            display: Self::MAX_DISPLAY,
        }
    }

    /// Restrict results to a category
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Page size actually requested
    pub fn page_size(&self) -> u32 {
        self.display.clamp(1, Self::MAX_DISPLAY)
    }
}

impl Default for SearchCriteria {
    fn default() -> Self {
        Self::new("코로나백신위탁의료기관")
    }
}

/// Reported stock at a facility
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailableQuantity {
    /// A reported count
    Known(u32),
    /// Not reported or not parseable
    Unknown,
}

impl AvailableQuantity {
    /// True only for a reported, nonzero count
    pub fn is_available(&self) -> bool {
        matches!(self, AvailableQuantity::Known(n) if *n > 0)
    }
}

impl fmt::Display for AvailableQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AvailableQuantity::Known(n) => write!(f, "{}", n),
            AvailableQuantity::Unknown => f.write_str("unknown"),
        }
    }
}

/// A facility reporting stock in a poll response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Facility identifier (`sid` on the claim page)
    pub facility_id: String,
    /// Display name
    pub name: String,
    /// Organization code (`orgCd` on the claim page)
    pub organization_code: String,
    /// Normalised stock
    pub available_quantity: AvailableQuantity,
}

/// Resource variants a user can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionKind {
    /// Pfizer
    Pfizer,
    /// Moderna
    Moderna,
    /// AstraZeneca
    AstraZeneca,
    /// Janssen
    Janssen,
}

impl OptionKind {
    /// Every known variant
    pub const ALL: [OptionKind; 4] = [
        OptionKind::Pfizer,
        OptionKind::Moderna,
        OptionKind::AstraZeneca,
        OptionKind::Janssen,
    ];

    /// Identifier of the option on the provider's claim page
    pub fn option_id(&self) -> &'static str {
        match self {
            OptionKind::Pfizer => "VEN00013",
            OptionKind::Moderna => "VEN00014",
            OptionKind::AstraZeneca => "VEN00015",
            OptionKind::Janssen => "VEN00016",
        }
    }

    /// Short code used on the command line
    pub fn code(&self) -> &'static str {
        match self {
            OptionKind::Pfizer => "PF",
            OptionKind::Moderna => "MO",
            OptionKind::AstraZeneca => "AZ",
            OptionKind::Janssen => "JS",
        }
    }

    /// Name shown to the user
    pub fn display_name(&self) -> &'static str {
        match self {
            OptionKind::Pfizer => "화이자",
            OptionKind::Moderna => "모더나",
            OptionKind::AstraZeneca => "아스트라제네카",
            OptionKind::Janssen => "얀센",
        }
    }
}

impl FromStr for OptionKind {
    type Err = ClaimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        OptionKind::ALL
            .into_iter()
            .find(|kind| kind.code().eq_ignore_ascii_case(s) || kind.option_id() == s)
            .ok_or_else(|| {
                ClaimError::Config(format!("unknown option '{}', expected PF, MO, AZ or JS", s))
            })
    }
}

impl fmt::Display for OptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name(), self.code())
    }
}

/// Key-bearing state needed for one claim attempt
///
/// Not `Clone`: a session is moved into the executor and consumed there.
#[derive(Debug, PartialEq, Eq)]
pub struct ClaimSession {
    /// `key` query parameter of the resolved claim page
    pub session_key: String,
    /// Option selected on the claim page
    pub option_id: String,
    /// Final URL after redirects
    pub resolved_url: String,
}

/// How a resolved session is submitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimMode {
    /// Drive the confirmation page and classify its title
    Automatic,
    /// Open the claim page and leave it to the user
    Manual,
}

/// Terminal result for a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Claim page handed to the user
    Available,
    /// Reservation confirmed by the provider
    Claimed,
    /// Provider refused the reservation
    Rejected,
    /// Slot was no longer selectable when resolved
    OptionUnavailable,
    /// Confirmation page could not be read or was not recognised
    Indeterminate,
}

impl ClaimOutcome {
    /// Whether this outcome ends the run
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed | ClaimOutcome::Available)
    }
}

/// Errors raised while polling, resolving or claiming
#[derive(thiserror::Error, Debug)]
pub enum ClaimError {
    /// Request exceeded its timeout
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Connection or transport failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Body did not have the expected shape
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Non-success HTTP status
    #[error("Unexpected HTTP status {0}")]
    UnexpectedStatus(u16),

    /// Provider no longer accepts the credentials
    #[error("Authentication expired, supply fresh credential cookies")]
    AuthenticationExpired,

    /// Every poll failed for too many cycles in a row
    #[error("All polls failed for {0} consecutive cycles")]
    PersistentFailure(u32),

    /// Browser automation failure
    #[error("Browser automation error: {0}")]
    Automation(String),

    /// Region could not be parsed or is inverted
    #[error("Invalid region: {0}")]
    InvalidRegion(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ClaimError {
    /// Errors retried on the next poll cycle
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClaimError::Timeout(_)
                | ClaimError::Transport(_)
                | ClaimError::MalformedResponse(_)
                | ClaimError::UnexpectedStatus(_)
        )
    }

    /// Classify a reqwest failure into timeout, transport or body errors
    pub(crate) fn from_reqwest(context: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClaimError::Timeout(format!("{}: {}", context, err))
        } else if err.is_decode() {
            ClaimError::MalformedResponse(format!("{}: {}", context, err))
        } else {
            ClaimError::Transport(format!("{}: {}", context, err))
        }
    }
}
