//! Proxied-venue REST client.
//!
//! Orders are routed through the geographic proxy; prices are decimal
//! strings on the wire and fees are a flat taker percentage attributed by
//! the engine, not returned by the venue.

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::client::{RequestSigner, VenueClient, VenueFill, VenueOrder, VenueOrderState};
use crate::domain::{Cents, OrderAction, Venue};
use crate::error::ExecutionError;

const ORDER_PATH: &str = "/order";

#[derive(Debug, Serialize)]
struct OrderBody<'a> {
    token_id: &'a str,
    client_id: &'a str,
    side: &'static str,
    price: String,
    size: i64,
    /// Fill-and-kill: the venue's immediate-or-cancel type.
    order_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    filled_size: i64,
    #[serde(default)]
    avg_price: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// REST client for the proxied venue's CLOB.
pub struct ProxiedVenueClient {
    http: HttpClient,
    base_url: String,
    signer: RequestSigner,
}

impl ProxiedVenueClient {
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
                venue: Venue::Proxied.to_string(),
            }
        } else {
            ExecutionError::Transport {
                venue: Venue::Proxied.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl VenueClient for ProxiedVenueClient {
    fn venue(&self) -> Venue {
        Venue::Proxied
    }

    fn max_client_order_id_len(&self) -> usize {
        36
    }

    async fn place_ioc(&self, order: &VenueOrder) -> Result<VenueFill, ExecutionError> {
        // The proxied venue trades YES/NO as separate tokens, both bought;
        // a sell is expressed as the SELL side of the held token.
        let side = match order.action {
            OrderAction::Buy => "BUY",
            OrderAction::Sell => "SELL",
        };
        let body = OrderBody {
            token_id: order.market_id.as_str(),
            client_id: &order.client_order_id,
            side,
            price: order.limit_price.as_price().to_string(),
            size: order.quantity,
            order_type: "FAK",
        };

        let timestamp_ms = chrono::Utc::now().timestamp_millis();
        let signed = self.signer.sign("POST", ORDER_PATH, timestamp_ms);

        let response = self
            .http
            .post(format!("{}{ORDER_PATH}", self.base_url))
            .header("POLY-API-KEY", &signed.api_key)
            .header("POLY-TIMESTAMP", signed.timestamp_ms.to_string())
            .header("POLY-SIGNATURE", &signed.signature)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport(&e))?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(ExecutionError::RateLimited {
                venue: Venue::Proxied.to_string(),
                retry_after_ms: 1_000,
            });
        }

        if !response.status().is_success() {
            let status = response.status();
            return Err(ExecutionError::VenueRejected {
                venue: Venue::Proxied.to_string(),
                reason: status.to_string(),
            });
        }

        let parsed: OrderResponse = response.json().await.map_err(|e| self.transport(&e))?;
        debug!(
            order_id = ?parsed.order_id,
            status = %parsed.status,
            filled = parsed.filled_size,
            "proxied order placed"
        );

        if !parsed.success {
            return Ok(VenueFill {
                venue_order_id: parsed.order_id,
                state: VenueOrderState::Rejected,
                filled_qty: 0,
                avg_price: Cents::ZERO,
                fees: None,
            });
        }

        let state = match parsed.status.as_str() {
            "matched" => VenueOrderState::Filled,
            "unmatched" => {
                if parsed.filled_size > 0 {
                    VenueOrderState::Filled
                } else {
                    VenueOrderState::Cancelled
                }
            }
            "live" | "delayed" => VenueOrderState::Resting,
            _ => {
                if let Some(error) = parsed.error {
                    debug!(error = %error, "proxied order error field");
                }
                VenueOrderState::Rejected
            }
        };

        let avg_price = parsed
            .avg_price
            .as_deref()
            .and_then(|s| s.parse::<rust_decimal::Decimal>().ok())
            .and_then(Cents::from_price)
            .unwrap_or(order.limit_price);

        Ok(VenueFill {
            venue_order_id: parsed.order_id,
            state,
            filled_qty: parsed.filled_size,
            avg_price,
            fees: None,
        })
    }

    async fn cancel(&self, venue_order_id: &str) -> Result<(), ExecutionError> {
        let path = format!("{ORDER_PATH}/{venue_order_id}");
        let timestamp_ms = chrono::Utc::now().timestamp_millis();
        let signed = self.signer.sign("DELETE", &path, timestamp_ms);

        let response = self
            .http
            .delete(format!("{}{path}", self.base_url))
            .header("POLY-API-KEY", &signed.api_key)
            .header("POLY-TIMESTAMP", signed.timestamp_ms.to_string())
            .header("POLY-SIGNATURE", &signed.signature)
            .send()
            .await
            .map_err(|e| self.transport(&e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ExecutionError::VenueRejected {
                venue: Venue::Proxied.to_string(),
                reason: format!("cancel failed: {}", response.status()),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_body_uses_decimal_price_and_fak() {
        let body = OrderBody {
            token_id: "tok-123",
            client_id: "cl-1",
            side: "BUY",
            price: Cents::new(53).as_price().to_string(),
            size: 150,
            order_type: "FAK",
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["price"], "0.53");
        assert_eq!(json["order_type"], "FAK");
    }

    #[test]
    fn response_defaults_tolerate_sparse_payloads() {
        let parsed: OrderResponse = serde_json::from_str(r#"{"success":true,"status":"matched","filled_size":150}"#).unwrap();
        assert!(parsed.success);
        assert_eq!(parsed.filled_size, 150);
        assert!(parsed.order_id.is_none());
    }
}
