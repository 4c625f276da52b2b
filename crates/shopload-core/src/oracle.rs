//! Expected response bodies for the shop API.
//!
//! The harness compares bodies byte for byte, so the serialized form is part
//! of the wire contract: compact JSON, keys in field declaration order,
//! prices as decimal strings, `nickname` omitted for anonymous listings.

use serde::{Deserialize, Serialize};

/// Number of items in the anonymous listing.
pub const DEFAULT_ITEM_COUNT: usize = 5;
/// Price step between consecutive anonymous items.
pub const DEFAULT_PRICE_STEP: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub name: String,
    pub price: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseResult {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseResponse {
    pub result: PurchaseResult,
}

/// Listing the server must return for `user_name` (empty = anonymous).
pub fn listing_for(user_name: &str) -> ListingResponse {
    if user_name.is_empty() {
        let items = (0..DEFAULT_ITEM_COUNT as u64)
            .map(|index| Item {
                name: format!("default{index}"),
                price: (index * DEFAULT_PRICE_STEP).to_string(),
            })
            .collect();
        return ListingResponse {
            nickname: None,
            items,
        };
    }

    let multiplier: u64 = user_name.chars().map(|c| u64::from(c as u32)).sum();
    let items = (0..user_name.chars().count() as u64)
        .map(|index| Item {
            name: format!("{user_name}{index}"),
            price: ((index + 1) * multiplier).to_string(),
        })
        .collect();

    ListingResponse {
        nickname: Some(user_name.to_string()),
        items,
    }
}

/// Purchase outcome for `item_name`: even length succeeds.
pub fn purchase_for(item_name: &str) -> PurchaseResponse {
    let result = if item_name.chars().count() % 2 == 0 {
        PurchaseResult::Success
    } else {
        PurchaseResult::Failure
    };
    PurchaseResponse { result }
}

/// Canonical body of the listing endpoint.
pub fn expected_listing(user_name: &str) -> String {
    canonical(&listing_for(user_name))
}

/// Canonical body of the purchase endpoint.
pub fn expected_purchase(item_name: &str) -> String {
    canonical(&purchase_for(item_name))
}

fn canonical<T: Serialize>(value: &T) -> String {
    // Plain structs of strings cannot fail to serialize.
    serde_json::to_string(value).unwrap_or_default()
}
