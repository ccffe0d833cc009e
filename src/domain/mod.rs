//! Pure domain types shared by every component.

mod bankroll;
mod book;
mod execution;
mod id;
mod market;
mod money;
mod position;
mod price;
mod probability;
mod signal;
mod state;

pub use bankroll::Bankroll;
pub use book::{BookSide, LocalOrderBook};
pub use execution::{
    ExecutionRequest, ExecutionResult, IdempotencyKey, OrderAction, OrderStatus, Side,
};
pub use id::{AccountId, EventId, MarketId, PlayId, PositionId, RequestId, ShardId, SignalId};
pub use market::{Event, MarketKind, MarketType, Sport, UpOrDown, Venue};
pub use money::{Cents, Price, Volume};
pub use position::{ExitReason, Position, PositionExit};
pub use price::{MarketPrice, PriceError};
pub use probability::{ModelOutput, Probability};
pub use signal::{Direction, RejectReason, RejectedSignal, Signal, SignalType};
pub use state::{
    CryptoState, EventState, FieldSituation, Play, PlayKind, Possession, ResolutionStatus,
    SportState, StateData,
};
