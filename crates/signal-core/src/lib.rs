pub mod config;
pub mod error;
pub mod market;
pub mod traits;
pub mod types;

pub use config::{
    CacheConfig, CorrelationGroup, ExecutorConfig, PipelineConfig, QueueConfig, RegimeConfig,
    SourceConfig,
};
pub use error::{PipelineError, SourceError};
pub use market::MarketClock;
pub use traits::SignalSource;
pub use types::{
    AccountSnapshot, Action, Condition, ConditionContext, Consensus, Direction, Position,
    PositionSide, QueueStatus, QueuedSignal, Regime, Signal, SignalDraft, SourceSignal,
    SourceStyle,
};
