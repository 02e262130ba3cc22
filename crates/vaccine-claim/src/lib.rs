//! # Vaccine Claim
//!
//! This crate watches the provider's clinic search for leftover same-day
//! vaccine stock across a set of map regions and, when a requested vaccine
//! turns up, walks the reservation redirect chain and submits the claim.

/// Regions, candidates, sessions, outcomes and the error type
mod claim_types;
pub use claim_types::*;

/// Credential cookies, endpoints and the shared HTTP client
mod session;
pub use session::*;

/// Search endpoint polling and stock normalisation
mod place_client;
pub use place_client::*;

/// Redirect-following and claim page inspection
mod claim_walker;
pub use claim_walker::*;

/// Browser capability interface and its WebDriver implementation
mod browser;
pub use browser::*;

/// Claim submission and outcome classification
mod claim_executor;
pub use claim_executor::*;

/// Polling loop with active hours and backoff
mod scheduler;
pub use scheduler::*;
