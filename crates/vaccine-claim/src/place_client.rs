use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::claim_types::{AvailableQuantity, Candidate, ClaimError, Region, SearchCriteria};
use crate::session::SessionContext;

/// GraphQL document for the clinic search; only the fields read below are requested
const VACCINE_LIST_QUERY: &str = "query vaccineList($input: RestsInput, $businessesInput: RestsBusinessesInput, $isNmap: Boolean!, $isBounds: Boolean!) {\n rests(input: $input) {\n businesses(input: $businessesInput) {\n total\n items {\n id\n name\n x\n y\n vaccineQuantity {\n totalQuantity\n totalQuantityStatus\n startTime\n endTime\n vaccineOrganizationCode\n list {\n quantity\n quantityStatus\n vaccineType\n __typename\n }\n __typename\n }\n __typename\n }\n __typename\n }\n __typename\n }\n}\n";

/// Source of candidates for one region
#[async_trait]
pub trait AvailabilitySource: Send + Sync {
    /// Candidates with a reported, nonzero quantity
    async fn poll(
        &self,
        region: &Region,
        criteria: &SearchCriteria,
    ) -> Result<Vec<Candidate>, ClaimError>;
}

/// Poller settings
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Timeout for the whole search request (default: 5 seconds)
    pub timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

/// Client for the provider's place search endpoint
pub struct AvailabilityPoller {
    session: Arc<SessionContext>,
    config: PollerConfig,
}

/// One element of the batched GraphQL response
#[derive(Debug, Deserialize)]
pub struct SearchEnvelope {
    /// Payload; absent when the query failed
    pub data: Option<SearchData>,
}

/// `data` of the search response
#[derive(Debug, Deserialize)]
pub struct SearchData {
    /// Search results
    pub rests: Rests,
}

/// `rests` of the search response
#[derive(Debug, Deserialize)]
pub struct Rests {
    /// Facility listing
    pub businesses: Businesses,
}

/// `businesses` of the search response
#[derive(Debug, Deserialize)]
pub struct Businesses {
    /// Facilities in the region
    pub items: Vec<PlaceItem>,
}

/// Individual facility from the search response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceItem {
    /// Facility id
    pub id: String,
    /// Facility name
    pub name: String,
    /// Stock information; null for facilities without stock data
    pub vaccine_quantity: Option<VaccineQuantity>,
}

/// Stock information of a facility
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaccineQuantity {
    /// Total stock, an integer in current responses
    pub total_quantity: Option<RawQuantity>,
    /// Organization code used by the claim pages
    pub vaccine_organization_code: Option<String>,
    /// Stock per vaccine type
    #[serde(default)]
    pub list: Vec<QuantityEntry>,
}

/// Stock of one vaccine type
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuantityEntry {
    /// Stock, a numeric string in older responses
    pub quantity: Option<RawQuantity>,
    /// Vaccine type label
    pub vaccine_type: Option<String>,
}

/// A quantity as it appears on the wire
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawQuantity {
    /// Integer form
    Count(i64),
    /// String form, parsed during normalisation
    Text(String),
}

impl RawQuantity {
    /// Normalise to a semantic quantity
    pub fn normalize(&self) -> AvailableQuantity {
        match self {
            RawQuantity::Count(n) => u32::try_from(*n)
                .map(AvailableQuantity::Known)
                .unwrap_or(AvailableQuantity::Unknown),
            RawQuantity::Text(s) => s
                .trim()
                .parse::<u32>()
                .map(AvailableQuantity::Known)
                .unwrap_or(AvailableQuantity::Unknown),
        }
    }
}

impl VaccineQuantity {
    /// Total stock, falling back to the sum of the per-type entries
    pub fn available(&self) -> AvailableQuantity {
        if let Some(AvailableQuantity::Known(total)) =
            self.total_quantity.as_ref().map(RawQuantity::normalize)
        {
            return AvailableQuantity::Known(total);
        }

        let known: Vec<u32> = self
            .list
            .iter()
            .filter_map(|entry| match entry.quantity.as_ref()?.normalize() {
                AvailableQuantity::Known(n) => Some(n),
                AvailableQuantity::Unknown => None,
            })
            .collect();

        if known.is_empty() {
            AvailableQuantity::Unknown
        } else {
            AvailableQuantity::Known(known.iter().fold(0u32, |acc, n| acc.saturating_add(*n)))
        }
    }
}

impl AvailabilityPoller {
    /// Create a poller on a shared session
    pub fn new(session: Arc<SessionContext>, config: Option<PollerConfig>) -> Self {
        Self {
            session,
            config: config.unwrap_or_default(),
        }
    }

    /// Request body for one region
    pub fn build_payload(region: &Region, criteria: &SearchCriteria) -> Value {
        let (x, y) = region.center();
        let x = x.to_string();
        let y = y.to_string();

        let mut input = json!({
            "keyword": criteria.keyword,
            "x": x,
            "y": y,
        });
        if let Some(category) = &criteria.category {
            input["category"] = json!(category);
        }

        json!([{
            "operationName": "vaccineList",
            "variables": {
                "input": input,
                "businessesInput": {
                    "start": 0,
                    "display": criteria.page_size(),
                    "deviceType": "mobile",
                    "x": x,
                    "y": y,
                    "bounds": region.bounds(),
                    "sortingOrder": "distance",
                },
                "isNmap": false,
                "isBounds": false,
            },
            "query": VACCINE_LIST_QUERY,
        }])
    }

    /// Pull the qualifying candidates out of a decoded response
    pub fn extract_candidates(envelopes: Vec<SearchEnvelope>) -> Result<Vec<Candidate>, ClaimError> {
        let data = envelopes
            .into_iter()
            .next()
            .and_then(|envelope| envelope.data)
            .ok_or_else(|| ClaimError::MalformedResponse("response has no data".to_string()))?;

        let items = data.rests.businesses.items;
        debug!("Search returned {} facilities", items.len());

        let candidates = items
            .into_iter()
            .filter_map(|item| {
                let stock = item.vaccine_quantity?;
                let available_quantity = stock.available();
                if !available_quantity.is_available() {
                    return None;
                }

                let Some(organization_code) = stock.vaccine_organization_code else {
                    warn!("Facility {} has stock but no organization code", item.id);
                    return None;
                };

                Some(Candidate {
                    facility_id: item.id,
                    name: item.name,
                    organization_code,
                    available_quantity,
                })
            })
            .collect();

        Ok(candidates)
    }
}

#[async_trait]
impl AvailabilitySource for AvailabilityPoller {
    async fn poll(
        &self,
        region: &Region,
        criteria: &SearchCriteria,
    ) -> Result<Vec<Candidate>, ClaimError> {
        debug!("Polling region {}", region);

        let endpoints = self.session.endpoints();
        let response = self
            .session
            .client()
            .post(&endpoints.search_url)
            .timeout(self.config.timeout)
            .header("Referer", endpoints.map_url_for(region))
            .json(&Self::build_payload(region, criteria))
            .send()
            .await
            .map_err(|e| ClaimError::from_reqwest("search request failed", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClaimError::UnexpectedStatus(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ClaimError::from_reqwest("search body unreadable", e))?;

        let envelopes: Vec<SearchEnvelope> = serde_json::from_str(&body)
            .map_err(|e| ClaimError::MalformedResponse(format!("search response: {}", e)))?;

        Self::extract_candidates(envelopes)
    }
}
