//! Settle Core
//!
//! Building blocks for cloud resource providers whose remote API provisions
//! resources asynchronously.
//!
//! ## Module Structure
//!
//! - `decoder` - Tagged union decoding of polymorphic API payloads
//! - `poller` - Waiting for a resource to reach a terminal lifecycle state
//! - `fanout` - Bounded concurrent execution of per-item fetches
//! - `lifecycle` - Poll specifications and their configuration
//! - `provider` - Resource reads and the waits built on them
//! - `cancel` - Cancellation signal for long-running waits
//! - `resource` - Resource identifiers and lifecycle states
//!
//! # Example
//!
//! ```ignore
//! use settle_core::{CancelToken, PollSpec, wait_for_target};
//!
//! let spec = PollSpec::new()
//!     .pending(["pending", "updating"])
//!     .target(["stable"])
//!     .failure(["failed"]);
//!
//! let share_id = create_share(&client, &desired).await?;
//! let outcome = wait_for_target(&reader, &id, &share_id, &spec, &CancelToken::never()).await?;
//! ```

pub mod cancel;
pub mod decoder;
pub mod fanout;
pub mod lifecycle;
pub mod poller;
pub mod provider;
pub mod resource;

// Re-export main types for convenience
pub use cancel::{CancelSource, CancelToken};
pub use decoder::{DecodeError, TaggedUnion, VariantTable, decode};
pub use fanout::{FanOutError, FanOutReport, FetchResult, fan_out};
pub use lifecycle::{
    Backoff, ConfigError, FanOutConfig, FetchErrorPolicy, PollConfig, PollSpec, StateClass,
};
pub use poller::{
    FinalState, Fetched, PollError, PollOutcome, PollReport, PollWarning, poll,
};
pub use provider::{
    BoxFuture, EnrichedList, FetchError, ReadResult, ResourceReader, enrich_all,
    wait_for_deleted, wait_for_target,
};
pub use resource::{LifecycleState, ResourceId};
