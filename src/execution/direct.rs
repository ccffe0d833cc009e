//! Direct-venue REST client (signed, integer-cent prices).

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::client::{RequestSigner, VenueClient, VenueFill, VenueOrder, VenueOrderState};
use crate::domain::{Cents, Venue};
use crate::error::ExecutionError;

const ORDERS_PATH: &str = "/trade-api/v2/portfolio/orders";

#[derive(Debug, Serialize)]
struct OrderBody<'a> {
    ticker: &'a str,
    client_order_id: &'a str,
    side: &'a str,
    action: &'a str,
    count: i64,
    /// Limit price of the chosen side, in cents.
    price: i64,
    time_in_force: &'static str,
}

#[derive(Debug, Deserialize)]
struct OrderEnvelope {
    order: OrderResponse,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    order_id: String,
    status: String,
    #[serde(default)]
    taker_fill_count: i64,
    #[serde(default)]
    taker_fill_cost: i64,
    #[serde(default)]
    taker_fees: i64,
}

/// REST client for the direct venue's order API.
pub struct DirectVenueClient {
    http: HttpClient,
    base_url: String,
    signer: RequestSigner,
}

impl DirectVenueClient {
    #[must_use]
    pub fn new(base_url: String, signer: RequestSigner, http: HttpClient) -> Self {
        Self {
            http,
            base_url,
            signer,
        }
    }

    fn transport(&self, err: &reqwest::Error) -> ExecutionError {
        if err.is_timeout() {
            ExecutionError::Timeout {
                venue: Venue::Direct.to_string(),
            }
        } else {
            ExecutionError::Transport {
                venue: Venue::Direct.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl VenueClient for DirectVenueClient {
    fn venue(&self) -> Venue {
        Venue::Direct
    }

    async fn place_ioc(&self, order: &VenueOrder) -> Result<VenueFill, ExecutionError> {
        let body = OrderBody {
            ticker: order.market_id.as_str(),
            client_order_id: &order.client_order_id,
            side: order.side.as_str(),
            action: order.action.as_str(),
            count: order.quantity,
            price: order.limit_price.value(),
            time_in_force: "immediate_or_cancel",
        };

        let timestamp_ms = chrono::Utc::now().timestamp_millis();
        let signed = self.signer.sign("POST", ORDERS_PATH, timestamp_ms);

        let response = self
            .http
            .post(format!("{}{ORDERS_PATH}", self.base_url))
            .header("X-API-KEY", &signed.api_key)
            .header("X-TIMESTAMP", signed.timestamp_ms.to_string())
            .header("X-SIGNATURE", &signed.signature)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport(&e))?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map_or(1_000, |secs| secs * 1_000);
            return Err(ExecutionError::RateLimited {
                venue: Venue::Direct.to_string(),
                retry_after_ms,
            });
        }

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ExecutionError::VenueRejected {
                venue: Venue::Direct.to_string(),
                reason: format!("{status}: {text}"),
            });
        }

        let envelope: OrderEnvelope = response.json().await.map_err(|e| self.transport(&e))?;
        let order_response = envelope.order;
        debug!(
            order_id = %order_response.order_id,
            status = %order_response.status,
            filled = order_response.taker_fill_count,
            "direct order placed"
        );

        let state = match order_response.status.as_str() {
            "executed" => VenueOrderState::Filled,
            "canceled" | "cancelled" => {
                if order_response.taker_fill_count > 0 {
                    // Partial fill with remainder cancelled: still a fill.
                    VenueOrderState::Filled
                } else {
                    VenueOrderState::Cancelled
                }
            }
            "rejected" => VenueOrderState::Rejected,
            "resting" | "open" => VenueOrderState::Resting,
            other => {
                warn!(status = other, "unrecognised direct order status");
                VenueOrderState::Rejected
            }
        };

        let avg_price = if order_response.taker_fill_count > 0 {
            Cents::new(order_response.taker_fill_cost / order_response.taker_fill_count)
        } else {
            Cents::ZERO
        };

        Ok(VenueFill {
            venue_order_id: Some(order_response.order_id),
            state,
            filled_qty: order_response.taker_fill_count,
            avg_price,
            fees: Some(Cents::new(order_response.taker_fees)),
        })
    }

    async fn cancel(&self, venue_order_id: &str) -> Result<(), ExecutionError> {
        let path = format!("{ORDERS_PATH}/{venue_order_id}");
        let timestamp_ms = chrono::Utc::now().timestamp_millis();
        let signed = self.signer.sign("DELETE", &path, timestamp_ms);

        let response = self
            .http
            .delete(format!("{}{path}", self.base_url))
            .header("X-API-KEY", &signed.api_key)
            .header("X-TIMESTAMP", signed.timestamp_ms.to_string())
            .header("X-SIGNATURE", &signed.signature)
            .send()
            .await
            .map_err(|e| self.transport(&e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ExecutionError::VenueRejected {
                venue: Venue::Direct.to_string(),
                reason: format!("cancel failed: {}", response.status()),
            })
        }
    }
}
