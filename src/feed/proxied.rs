//! Proxied-venue WebSocket stream.
//!
//! Subscribes with `{type, channel: "market", markets: [token_id, ...]}`
//! and consumes `book`, `price_change`, `last_trade_price`, and
//! `tick_size_change` messages. The venue expects an application-level ping
//! every 5 seconds. All egress for this venue must route through the
//! allowed geographic region; startup asserts this and fails otherwise.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{FeedMessage, FeedStream};
use crate::domain::{BookSide, Cents, MarketId, Venue};
use crate::error::{FeedError, Result};

/// Application keep-alive period required by the venue.
pub const PING_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Serialize)]
struct SubscribeMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    channel: &'static str,
    markets: &'a [String],
}

#[derive(Debug, Deserialize)]
struct WsEnvelope {
    #[serde(rename = "event_type")]
    event_type: String,
    #[serde(default)]
    asset_id: String,
    #[serde(default)]
    hash: Option<String>,
    #[serde(flatten)]
    rest: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct BookMsg {
    #[serde(default)]
    bids: Vec<BookLevel>,
    #[serde(default)]
    asks: Vec<BookLevel>,
    #[serde(default)]
    sequence: u64,
}

#[derive(Debug, Deserialize)]
struct BookLevel {
    price: String,
    size: String,
}

#[derive(Debug, Deserialize)]
struct PriceChangeMsg {
    price: String,
    size: String,
    side: String,
    #[serde(default)]
    sequence: u64,
}

#[derive(Debug, Deserialize)]
struct LastTradeMsg {
    price: String,
    #[serde(default)]
    size: String,
}

/// Parse a decimal price string into cents.
fn price_cents(raw: &str) -> Option<i64> {
    let price: Decimal = raw.parse().ok()?;
    Cents::from_price(price).map(|c| c.value())
}

fn size_units(raw: &str) -> i64 {
    raw.parse::<Decimal>()
        .ok()
        .and_then(|d| rust_decimal::prelude::ToPrimitive::to_i64(&d.floor()))
        .unwrap_or(0)
}

/// WebSocket stream for the proxied venue.
pub struct ProxiedFeedStream {
    url: String,
    ws: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl ProxiedFeedStream {
    #[must_use]
    pub fn new(url: String) -> Self {
        Self { url, ws: None }
    }

    fn parse(text: &str) -> Option<FeedMessage> {
        let envelope: WsEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, raw = %text, "failed to parse proxied feed message");
                return None;
            }
        };
        let market_id = MarketId::from(envelope.asset_id);

        match envelope.event_type.as_str() {
            "book" => {
                let msg: BookMsg = serde_json::from_value(envelope.rest).ok()?;
                let ladder = |levels: Vec<BookLevel>| {
                    levels
                        .into_iter()
                        .filter_map(|level| {
                            Some((price_cents(&level.price)?, size_units(&level.size)))
                        })
                        .collect::<Vec<_>>()
                };
                Some(FeedMessage::Snapshot {
                    market_id,
                    bids: ladder(msg.bids),
                    asks: ladder(msg.asks),
                    sequence: msg.sequence,
                })
            }
            "price_change" => {
                let msg: PriceChangeMsg = serde_json::from_value(envelope.rest).ok()?;
                let side = match msg.side.to_ascii_uppercase().as_str() {
                    "BUY" => BookSide::Bid,
                    "SELL" => BookSide::Ask,
                    other => {
                        debug!(side = other, "unknown price_change side");
                        return None;
                    }
                };
                // price_change carries the absolute size at the level.
                Some(FeedMessage::SetLevel {
                    market_id,
                    side,
                    price_cents: price_cents(&msg.price)?,
                    size: size_units(&msg.size),
                    sequence: msg.sequence,
                })
            }
            "last_trade_price" => {
                let msg: LastTradeMsg = serde_json::from_value(envelope.rest).ok()?;
                Some(FeedMessage::Trade {
                    market_id,
                    price_cents: price_cents(&msg.price)?,
                    count: size_units(&msg.size),
                })
            }
            "tick_size_change" => {
                debug!(market_id = %market_id, hash = ?envelope.hash, "tick size change");
                None
            }
            other => {
                debug!(event_type = other, "ignoring proxied feed event");
                None
            }
        }
    }
}

#[async_trait]
impl FeedStream for ProxiedFeedStream {
    async fn connect(&mut self) -> Result<()> {
        info!(url = %self.url, "connecting to proxied venue WebSocket");
        let (ws, response) = connect_async(&self.url).await?;
        info!(status = %response.status(), "proxied venue WebSocket connected");
        self.ws = Some(ws);
        Ok(())
    }

    async fn subscribe(&mut self, market_ids: &[MarketId]) -> Result<()> {
        let ws = self.ws.as_mut().ok_or(FeedError::NotConnected)?;
        let markets: Vec<String> = market_ids.iter().map(|m| m.to_string()).collect();
        let message = SubscribeMessage {
            kind: "subscribe",
            channel: "market",
            markets: &markets,
        };
        info!(markets = ?markets, "subscribing on proxied venue");
        ws.send(Message::Text(serde_json::to_string(&message)?))
            .await?;
        Ok(())
    }

    async fn unsubscribe(&mut self, market_ids: &[MarketId]) -> Result<()> {
        let ws = self.ws.as_mut().ok_or(FeedError::NotConnected)?;
        let markets: Vec<String> = market_ids.iter().map(|m| m.to_string()).collect();
        let message = SubscribeMessage {
            kind: "unsubscribe",
            channel: "market",
            markets: &markets,
        };
        ws.send(Message::Text(serde_json::to_string(&message)?))
            .await?;
        Ok(())
    }

    async fn request_snapshot(&mut self, market_id: &MarketId) -> Result<()> {
        // Resubscribing replays the full book message.
        self.unsubscribe(std::slice::from_ref(market_id)).await?;
        self.subscribe(std::slice::from_ref(market_id)).await
    }

    async fn ping(&mut self) -> Result<()> {
        let ws = self.ws.as_mut().ok_or(FeedError::NotConnected)?;
        // The venue expects a literal "PING" text frame.
        ws.send(Message::Text("PING".into())).await?;
        Ok(())
    }

    async fn next_message(&mut self) -> Option<FeedMessage> {
        let ws = self.ws.as_mut()?;

        loop {
            match ws.next().await? {
                Ok(Message::Text(text)) => {
                    if text == "PONG" {
                        continue;
                    }
                    if let Some(message) = Self::parse(&text) {
                        return Some(message);
                    }
                }
                Ok(Message::Ping(data)) => {
                    if ws.send(Message::Pong(data)).await.is_err() {
                        return Some(FeedMessage::Disconnected {
                            reason: "failed to send pong".into(),
                        });
                    }
                }
                Ok(Message::Close(frame)) => {
                    info!(frame = ?frame, "proxied venue closed the connection");
                    return Some(FeedMessage::Disconnected {
                        reason: frame.map(|f| f.reason.to_string()).unwrap_or_default(),
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "proxied venue WebSocket error");
                    return Some(FeedMessage::Disconnected {
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    fn venue(&self) -> Venue {
        Venue::Proxied
    }
}

/// Startup gate: assert outbound egress for the proxied venue leaves from
/// the allowed region. Fails hard when the venue would geo-block us.
pub async fn verify_egress(
    http: &reqwest::Client,
    check_url: &str,
    allowed_regions: &[String],
) -> Result<()> {
    #[derive(Debug, Deserialize)]
    struct RegionResponse {
        #[serde(alias = "country", alias = "countryCode")]
        region: String,
    }

    let response: RegionResponse = http
        .get(check_url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    if allowed_regions
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(&response.region))
    {
        info!(region = %response.region, "egress verification passed");
        Ok(())
    } else {
        Err(FeedError::EgressBlocked {
            expected: allowed_regions.join(","),
            observed: response.region,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_book_snapshot() {
        let raw = r#"{"event_type":"book","asset_id":"tok-1","bids":[{"price":"0.45","size":"300"}],"asks":[{"price":"0.47","size":"150"}],"sequence":7}"#;
        assert_eq!(
            ProxiedFeedStream::parse(raw).unwrap(),
            FeedMessage::Snapshot {
                market_id: MarketId::from("tok-1"),
                bids: vec![(45, 300)],
                asks: vec![(47, 150)],
                sequence: 7,
            }
        );
    }

    #[test]
    fn parses_price_change_sides() {
        let raw = r#"{"event_type":"price_change","asset_id":"tok-1","price":"0.46","size":"75","side":"BUY","sequence":8}"#;
        assert_eq!(
            ProxiedFeedStream::parse(raw).unwrap(),
            FeedMessage::SetLevel {
                market_id: MarketId::from("tok-1"),
                side: BookSide::Bid,
                price_cents: 46,
                size: 75,
                sequence: 8,
            }
        );
    }

    #[test]
    fn parses_last_trade() {
        let raw = r#"{"event_type":"last_trade_price","asset_id":"tok-1","price":"0.46","size":"25"}"#;
        assert_eq!(
            ProxiedFeedStream::parse(raw).unwrap(),
            FeedMessage::Trade {
                market_id: MarketId::from("tok-1"),
                price_cents: 46,
                count: 25,
            }
        );
    }

    #[test]
    fn tick_size_change_and_garbage_are_skipped() {
        let raw = r#"{"event_type":"tick_size_change","asset_id":"tok-1","hash":"abc"}"#;
        assert!(ProxiedFeedStream::parse(raw).is_none());
        assert!(ProxiedFeedStream::parse("garbage").is_none());
    }

    #[test]
    fn subscribe_message_shape() {
        let markets = vec!["tok-1".to_string(), "tok-2".to_string()];
        let message = SubscribeMessage {
            kind: "subscribe",
            channel: "market",
            markets: &markets,
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "subscribe");
        assert_eq!(json["channel"], "market");
        assert_eq!(json["markets"][1], "tok-2");
    }
}
