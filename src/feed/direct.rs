//! Direct-venue WebSocket stream.
//!
//! The upgrade request carries signed auth headers (key, millisecond
//! timestamp, signature over `timestamp + method + path`). The venue
//! publishes `orderbook_snapshot` with YES and NO bid ladders and
//! `orderbook_delta` with per-level size changes; sequence numbers are
//! verified by the book, and a gap triggers a resubscribe which yields a
//! fresh snapshot.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{FeedMessage, FeedStream};
use crate::domain::{BookSide, MarketId, Venue};
use crate::error::{Error, FeedError, Result};
use crate::execution::RequestSigner;

const WS_PATH: &str = "/trade-api/ws/v2";

#[derive(Debug, Serialize)]
struct Command<'a> {
    id: u64,
    cmd: &'static str,
    params: CommandParams<'a>,
}

#[derive(Debug, Serialize)]
struct CommandParams<'a> {
    channels: [&'static str; 1],
    market_tickers: &'a [String],
}

#[derive(Debug, Deserialize)]
struct StreamUpdate {
    #[serde(rename = "type")]
    channel: String,
    #[serde(default)]
    seq: Option<u64>,
    msg: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SnapshotMsg {
    market_ticker: String,
    #[serde(default)]
    yes: Vec<[i64; 2]>,
    #[serde(default)]
    no: Vec<[i64; 2]>,
}

#[derive(Debug, Deserialize)]
struct DeltaMsg {
    market_ticker: String,
    price: i64,
    delta: i64,
    side: String,
}

#[derive(Debug, Deserialize)]
struct TradeMsg {
    market_ticker: String,
    yes_price: i64,
    count: i64,
}

/// WebSocket stream for the direct venue.
pub struct DirectFeedStream {
    url: String,
    signer: RequestSigner,
    ws: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    command_id: u64,
}

impl DirectFeedStream {
    #[must_use]
    pub fn new(url: String, signer: RequestSigner) -> Self {
        Self {
            url,
            signer,
            ws: None,
            command_id: 0,
        }
    }

    fn next_command_id(&mut self) -> u64 {
        self.command_id += 1;
        self.command_id
    }

    async fn send_command(&mut self, cmd: &'static str, tickers: &[String]) -> Result<()> {
        let id = self.next_command_id();
        let ws = self.ws.as_mut().ok_or(FeedError::NotConnected)?;
        let command = Command {
            id,
            cmd,
            params: CommandParams {
                channels: ["orderbook_delta"],
                market_tickers: tickers,
            },
        };
        ws.send(Message::Text(serde_json::to_string(&command)?))
            .await?;
        Ok(())
    }

    fn parse(text: &str) -> Option<FeedMessage> {
        let update: StreamUpdate = match serde_json::from_str(text) {
            Ok(update) => update,
            Err(e) => {
                // Malformed message: log, continue.
                warn!(error = %e, raw = %text, "failed to parse direct feed message");
                return None;
            }
        };
        let sequence = update.seq.unwrap_or(0);

        match update.channel.as_str() {
            "orderbook_snapshot" => {
                let msg: SnapshotMsg = serde_json::from_value(update.msg).ok()?;
                Some(FeedMessage::BidOnlySnapshot {
                    market_id: MarketId::from(msg.market_ticker),
                    yes_bids: msg.yes.iter().map(|[p, s]| (*p, *s)).collect(),
                    no_bids: msg.no.iter().map(|[p, s]| (*p, *s)).collect(),
                    sequence,
                })
            }
            "orderbook_delta" => {
                let msg: DeltaMsg = serde_json::from_value(update.msg).ok()?;
                let market_id = MarketId::from(msg.market_ticker);
                if msg.side == "no" {
                    Some(FeedMessage::NoSideDelta {
                        market_id,
                        price_cents: msg.price,
                        delta: msg.delta,
                        sequence,
                    })
                } else {
                    Some(FeedMessage::Delta {
                        market_id,
                        side: BookSide::Bid,
                        price_cents: msg.price,
                        delta: msg.delta,
                        sequence,
                    })
                }
            }
            "trade" => {
                let msg: TradeMsg = serde_json::from_value(update.msg).ok()?;
                Some(FeedMessage::Trade {
                    market_id: MarketId::from(msg.market_ticker),
                    price_cents: msg.yes_price,
                    count: msg.count,
                })
            }
            other => {
                debug!(channel = other, "ignoring direct feed channel");
                None
            }
        }
    }
}

#[async_trait]
impl FeedStream for DirectFeedStream {
    async fn connect(&mut self) -> Result<()> {
        info!(url = %self.url, "connecting to direct venue WebSocket");

        let mut request = self.url.as_str().into_client_request()?;
        let signed = self
            .signer
            .sign("GET", WS_PATH, chrono::Utc::now().timestamp_millis());
        let api_key = signed.api_key.parse().map_err(|_| {
            Error::Feed(FeedError::AuthenticationFailed {
                venue: Venue::Direct.to_string(),
                reason: "api key is not a valid header value".into(),
            })
        })?;
        let headers = request.headers_mut();
        headers.insert("X-API-KEY", api_key);
        headers.insert(
            "X-TIMESTAMP",
            signed
                .timestamp_ms
                .to_string()
                .parse()
                .expect("timestamp is ascii"),
        );
        headers.insert(
            "X-SIGNATURE",
            signed.signature.parse().expect("signature is hex"),
        );

        let (ws, response) = connect_async(request).await.map_err(|e| {
            // A 401/403 on upgrade is an authentication failure: fatal.
            if let tokio_tungstenite::tungstenite::Error::Http(ref resp) = e {
                let code = resp.status().as_u16();
                if code == 401 || code == 403 {
                    return Error::Feed(FeedError::AuthenticationFailed {
                        venue: Venue::Direct.to_string(),
                        reason: format!("upgrade rejected with {code}"),
                    });
                }
            }
            e.into()
        })?;

        info!(status = %response.status(), "direct venue WebSocket connected");
        self.ws = Some(ws);
        Ok(())
    }

    async fn subscribe(&mut self, market_ids: &[MarketId]) -> Result<()> {
        let tickers: Vec<String> = market_ids.iter().map(|m| m.to_string()).collect();
        info!(markets = ?tickers, "subscribing on direct venue");
        self.send_command("subscribe", &tickers).await
    }

    async fn unsubscribe(&mut self, market_ids: &[MarketId]) -> Result<()> {
        let tickers: Vec<String> = market_ids.iter().map(|m| m.to_string()).collect();
        self.send_command("unsubscribe", &tickers).await
    }

    async fn request_snapshot(&mut self, market_id: &MarketId) -> Result<()> {
        // Resubscribing a ticker makes the venue replay a full snapshot.
        let tickers = [market_id.to_string()];
        self.send_command("unsubscribe", &tickers).await?;
        self.send_command("subscribe", &tickers).await
    }

    async fn ping(&mut self) -> Result<()> {
        let ws = self.ws.as_mut().ok_or(FeedError::NotConnected)?;
        ws.send(Message::Ping(Vec::new())).await?;
        Ok(())
    }

    async fn next_message(&mut self) -> Option<FeedMessage> {
        let ws = self.ws.as_mut()?;

        loop {
            match ws.next().await? {
                Ok(Message::Text(text)) => {
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
                    info!(frame = ?frame, "direct venue closed the connection");
                    return Some(FeedMessage::Disconnected {
                        reason: frame.map(|f| f.reason.to_string()).unwrap_or_default(),
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "direct venue WebSocket error");
                    return Some(FeedMessage::Disconnected {
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    fn venue(&self) -> Venue {
        Venue::Direct
    }
}
