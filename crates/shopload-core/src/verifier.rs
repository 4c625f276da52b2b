use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::driver::{Endpoint, Outcome};
use crate::oracle;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationFailure {
    #[error("wrong status code: expected 200, got {status}")]
    WrongStatusCode { status: u16 },
    #[error("wrong response body: expected {expected}, got {actual}")]
    WrongResponseBody { expected: String, actual: String },
}

/// A contract violation observed on one response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{endpoint}] {failure}")]
pub struct VerificationError {
    pub timestamp: DateTime<Utc>,
    pub endpoint: Endpoint,
    pub failure: VerificationFailure,
}

impl VerificationError {
    pub fn new(endpoint: Endpoint, failure: VerificationFailure) -> Self {
        Self {
            timestamp: Utc::now(),
            endpoint,
            failure,
        }
    }
}

pub fn verify_listing(user_name: &str, outcome: &Outcome) -> Result<(), VerificationError> {
    verify(Endpoint::Listing, outcome, || oracle::expected_listing(user_name))
}

pub fn verify_purchase(item_name: &str, outcome: &Outcome) -> Result<(), VerificationError> {
    verify(Endpoint::Purchase, outcome, || oracle::expected_purchase(item_name))
}

fn verify(
    endpoint: Endpoint,
    outcome: &Outcome,
    expected: impl FnOnce() -> String,
) -> Result<(), VerificationError> {
    // Transport failures are accounted for by the driver, not here.
    let Ok(response) = outcome else {
        return Ok(());
    };

    if response.status != 200 {
        return Err(VerificationError::new(
            endpoint,
            VerificationFailure::WrongStatusCode {
                status: response.status,
            },
        ));
    }

    let expected = expected();
    if response.body != expected {
        return Err(VerificationError::new(
            endpoint,
            VerificationFailure::WrongResponseBody {
                expected,
                actual: response.body.clone(),
            },
        ));
    }

    Ok(())
}
