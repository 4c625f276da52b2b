use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::{ClientProfile, NameFormat, Placement};
use crate::driver::{Endpoint, Request, NAME_PARAM};
use crate::oracle::{Item, ListingResponse};
use crate::run::RunContext;
use crate::verifier::{verify_listing, verify_purchase};

/// Per-client counters returned when the client finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientSummary {
    pub rounds: u32,
    pub purchases: u64,
    pub verification_errors: u64,
    pub transport_failures: u64,
}

impl std::ops::AddAssign for ClientSummary {
    fn add_assign(&mut self, other: Self) {
        self.rounds += other.rounds;
        self.purchases += other.purchases;
        self.verification_errors += other.verification_errors;
        self.transport_failures += other.transport_failures;
    }
}

/// One simulated shop client: strictly sequential rounds of
/// listing -> verify -> one purchase per listed item.
#[derive(Debug, Clone)]
pub struct ClientSimulator {
    id: usize,
    profile: ClientProfile,
    messages: u32,
    pacing: Duration,
}

impl ClientSimulator {
    pub fn new(id: usize, profile: ClientProfile, messages: u32, pacing: Duration) -> Self {
        Self {
            id,
            profile,
            messages,
            pacing,
        }
    }

    pub fn listing_request(&self) -> Request {
        let name = &self.profile.user_name;
        if name.is_empty() {
            return Request::get(Endpoint::Listing);
        }
        match self.profile.placement {
            Placement::Query => Request::get(Endpoint::Listing).with_query(NAME_PARAM, name.as_str()),
            Placement::Body => {
                let body = match self.profile.name_format {
                    NameFormat::Bare => name.clone(),
                    NameFormat::Object => serde_json::json!({ "name": name }).to_string(),
                };
                Request::post(Endpoint::Listing, self.profile.content_type, body)
            }
        }
    }

    pub fn purchase_request(&self, item: &Item) -> Request {
        let body = serde_json::to_string(item).unwrap_or_default();
        Request::post(Endpoint::Purchase, self.profile.content_type, body)
    }

    pub async fn run(self, ctx: Arc<RunContext>) -> ClientSummary {
        let driver = ctx.driver();
        let stats = ctx.stats();
        let _guard = driver.enter_client();
        let mut summary = ClientSummary::default();

        debug!(
            "[client {}] starting: user={:?} messages={}",
            self.id, self.profile.user_name, self.messages
        );

        for round in 0..self.messages {
            if round > 0 && !self.pacing.is_zero() {
                sleep(self.pacing).await;
            }
            summary.rounds += 1;

            let outcome = driver.send(&self.listing_request()).await;
            let response = match &outcome {
                Ok(response) => response,
                Err(e) => {
                    summary.transport_failures += 1;
                    warn!("[client {}][round {}] listing not sent: {}", self.id, round, e);
                    continue;
                }
            };

            if let Err(err) = verify_listing(&self.profile.user_name, &outcome) {
                warn!("[client {}][round {}] {}", self.id, round, err);
                stats.record_error(err);
                summary.verification_errors += 1;
                continue;
            }

            let listing: ListingResponse = match serde_json::from_str(&response.body) {
                Ok(listing) => listing,
                Err(e) => {
                    warn!("[client {}][round {}] unparsable listing: {}", self.id, round, e);
                    continue;
                }
            };

            for item in &listing.items {
                let outcome = driver.send(&self.purchase_request(item)).await;
                summary.purchases += 1;
                if let Err(e) = &outcome {
                    summary.transport_failures += 1;
                    warn!(
                        "[client {}][round {}] purchase of {} not sent: {}",
                        self.id, round, item.name, e
                    );
                    continue;
                }
                if let Err(err) = verify_purchase(&item.name, &outcome) {
                    warn!("[client {}][round {}] {}", self.id, round, err);
                    stats.record_error(err);
                    summary.verification_errors += 1;
                }
            }
        }

        debug!("[client {}] done: {:?}", self.id, summary);
        summary
    }
}
