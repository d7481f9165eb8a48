//! Shared factory token cache for the bot fleet.
//!
//! Every bot in the process reads the factory's token list through one
//! `TokenCacheCoordinator`, which refreshes the list at most once per
//! refresh window:
//! - `TokenCacheCoordinator`: consumer registry, leader election, single-flight refresh
//! - `TokenSource`: factory read seam (`FactoryRpcSource` over JSON-RPC)

pub mod coordinator;
pub mod error;
pub mod rpc;
pub mod source;

pub use coordinator::{
    CoordinatorConfig, CoordinatorStats, TokenCacheCoordinator, DEFAULT_LEADER_WAIT_TIMEOUT,
    DEFAULT_REFRESH_INTERVAL,
};
pub use error::{SourceError, SourceResult};
pub use rpc::FactoryRpcSource;
pub use source::{BoxFuture, TokenSource};

#[cfg(any(test, feature = "test-utils"))]
pub use source::MockTokenSource;
