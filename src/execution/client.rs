//! Venue client abstraction and request signing.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;
use std::time::{Duration, Instant};

use crate::domain::{Cents, MarketId, OrderAction, Side, Venue};
use crate::error::ExecutionError;

type HmacSha256 = Hmac<Sha256>;

/// Order handed to a venue client. Always immediate-or-cancel.
#[derive(Debug, Clone)]
pub struct VenueOrder {
    pub client_order_id: String,
    pub market_id: MarketId,
    pub side: Side,
    pub action: OrderAction,
    pub quantity: i64,
    pub limit_price: Cents,
}

/// Venue-reported order state.
///
/// `Resting` should be impossible for an IOC order; the engine treats it as
/// a protocol violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VenueOrderState {
    Filled,
    Cancelled,
    Rejected,
    Resting,
}

/// Raw fill information returned by a venue.
#[derive(Debug, Clone)]
pub struct VenueFill {
    pub venue_order_id: Option<String>,
    pub state: VenueOrderState,
    pub filled_qty: i64,
    pub avg_price: Cents,
    /// Fees as reported by the venue; `None` means the engine attributes
    /// them from the fee schedule.
    pub fees: Option<Cents>,
}

/// One venue's order API.
#[async_trait]
pub trait VenueClient: Send + Sync {
    fn venue(&self) -> Venue;

    /// Longest client order id the venue accepts.
    fn max_client_order_id_len(&self) -> usize {
        32
    }

    /// Place an immediate-or-cancel order.
    async fn place_ioc(&self, order: &VenueOrder) -> Result<VenueFill, ExecutionError>;

    /// Cancel a venue order. Only used to mitigate protocol violations;
    /// the engine never places resting orders to cancel.
    async fn cancel(&self, venue_order_id: &str) -> Result<(), ExecutionError>;
}

/// HMAC-SHA256 signer for venue auth headers.
///
/// The signature covers `timestamp + method + path`. Signatures are cached
/// for a short window to amortise the MAC cost across the burst of requests
/// a busy feed produces.
pub struct RequestSigner {
    api_key: String,
    secret: Vec<u8>,
    cache_ttl: Duration,
    cache: Mutex<Option<CachedSignature>>,
}

struct CachedSignature {
    method_path: String,
    timestamp_ms: i64,
    signature: String,
    at: Instant,
}

/// Signed header set attached to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub api_key: String,
    pub timestamp_ms: i64,
    pub signature: String,
}

impl RequestSigner {
    #[must_use]
    pub fn new(api_key: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            cache_ttl: Duration::from_millis(100),
            cache: Mutex::new(None),
        }
    }

    /// Sign `method + path` at `timestamp_ms`, reusing a cached signature
    /// for identical requests inside the cache window.
    #[must_use]
    pub fn sign(&self, method: &str, path: &str, timestamp_ms: i64) -> SignedHeaders {
        let method_path = format!("{method}{path}");

        {
            let cache = self.cache.lock();
            if let Some(cached) = cache.as_ref() {
                if cached.method_path == method_path && cached.at.elapsed() < self.cache_ttl {
                    return SignedHeaders {
                        api_key: self.api_key.clone(),
                        timestamp_ms: cached.timestamp_ms,
                        signature: cached.signature.clone(),
                    };
                }
            }
        }

        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(timestamp_ms.to_string().as_bytes());
        mac.update(method.as_bytes());
        mac.update(path.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        *self.cache.lock() = Some(CachedSignature {
            method_path,
            timestamp_ms,
            signature: signature.clone(),
            at: Instant::now(),
        });

        SignedHeaders {
            api_key: self.api_key.clone(),
            timestamp_ms,
            signature,
        }
    }
}
