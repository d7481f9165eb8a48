//! Token source trait for the factory contract.
//!
//! Abstracts the on-chain reads the coordinator needs, allowing for:
//! - A JSON-RPC backed reader in production
//! - Scripted sources with latency and failures in tests

use std::pin::Pin;

use tvb_core::{TokenMetadata, TokenState};

use crate::error::SourceResult;

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Read access to a token factory.
///
/// Two sources with the same `identity()` are interchangeable; the
/// coordinator never mixes tokens from sources with different identities.
pub trait TokenSource: Send + Sync {
    /// Stable identity of the underlying factory (lower-cased address).
    fn identity(&self) -> String;

    /// Every token address the factory has created.
    fn list_tokens(&self) -> BoxFuture<'_, SourceResult<Vec<String>>>;

    /// Current trading state of one token.
    fn token_state<'a>(&'a self, address: &'a str) -> BoxFuture<'a, SourceResult<TokenState>>;

    /// ERC-20 name and symbol of one token.
    fn token_metadata<'a>(
        &'a self,
        address: &'a str,
    ) -> BoxFuture<'a, SourceResult<TokenMetadata>>;
}

#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockTokenSource;

#[cfg(any(test, feature = "test-utils"))]
mod mock {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;
    use tvb_core::{normalize_address, TokenMetadata, TokenState};

    use super::{BoxFuture, TokenSource};
    use crate::error::{SourceError, SourceResult};

    #[derive(Debug, Clone)]
    struct MockToken {
        address: String,
        state: TokenState,
        metadata: TokenMetadata,
    }

    /// Scripted token source for tests.
    #[derive(Debug)]
    pub struct MockTokenSource {
        identity: String,
        tokens: Mutex<Vec<MockToken>>,
        /// Delay applied to every `list_tokens` call.
        latency: Mutex<Duration>,
        /// Normalized addresses whose state reads fail.
        failing: Mutex<HashSet<String>>,
        list_error: Mutex<Option<String>>,
        list_calls: AtomicU64,
        state_calls: AtomicU64,
        metadata_calls: AtomicU64,
    }

    impl MockTokenSource {
        /// Create an empty source with the given factory identity.
        pub fn new(identity: impl Into<String>) -> Self {
            Self {
                identity: normalize_address(&identity.into()),
                tokens: Mutex::new(Vec::new()),
                latency: Mutex::new(Duration::ZERO),
                failing: Mutex::new(HashSet::new()),
                list_error: Mutex::new(None),
                list_calls: AtomicU64::new(0),
                state_calls: AtomicU64::new(0),
                metadata_calls: AtomicU64::new(0),
            }
        }

        /// Builder: add a token.
        pub fn with_token(self, address: &str, symbol: &str, state: TokenState) -> Self {
            self.add_token(address, symbol, state);
            self
        }

        /// Builder: delay every listing call.
        pub fn with_latency(self, latency: Duration) -> Self {
            self.set_latency(latency);
            self
        }

        pub fn add_token(&self, address: &str, symbol: &str, state: TokenState) {
            self.tokens.lock().push(MockToken {
                address: address.to_string(),
                state,
                metadata: TokenMetadata {
                    name: format!("{symbol} Token"),
                    symbol: symbol.to_string(),
                },
            });
        }

        /// Change the state of an existing token.
        pub fn set_state(&self, address: &str, state: TokenState) {
            let key = normalize_address(address);
            for token in self.tokens.lock().iter_mut() {
                if normalize_address(&token.address) == key {
                    token.state = state;
                }
            }
        }

        pub fn set_latency(&self, latency: Duration) {
            *self.latency.lock() = latency;
        }

        /// Make state reads for one address fail.
        pub fn fail_address(&self, address: &str) {
            self.failing.lock().insert(normalize_address(address));
        }

        /// Make `list_tokens` fail with the given message, or succeed again with `None`.
        pub fn set_list_error(&self, message: Option<&str>) {
            *self.list_error.lock() = message.map(str::to_string);
        }

        pub fn list_calls(&self) -> u64 {
            self.list_calls.load(Ordering::SeqCst)
        }

        pub fn state_calls(&self) -> u64 {
            self.state_calls.load(Ordering::SeqCst)
        }

        pub fn metadata_calls(&self) -> u64 {
            self.metadata_calls.load(Ordering::SeqCst)
        }

        fn find(&self, address: &str) -> Option<MockToken> {
            let key = normalize_address(address);
            self.tokens
                .lock()
                .iter()
                .find(|t| normalize_address(&t.address) == key)
                .cloned()
        }
    }

    impl TokenSource for MockTokenSource {
        fn identity(&self) -> String {
            self.identity.clone()
        }

        fn list_tokens(&self) -> BoxFuture<'_, SourceResult<Vec<String>>> {
            Box::pin(async move {
                self.list_calls.fetch_add(1, Ordering::SeqCst);
                let latency = *self.latency.lock();
                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                if let Some(message) = self.list_error.lock().clone() {
                    return Err(SourceError::HttpClient(message));
                }
                Ok(self
                    .tokens
                    .lock()
                    .iter()
                    .map(|t| t.address.clone())
                    .collect())
            })
        }

        fn token_state<'a>(
            &'a self,
            address: &'a str,
        ) -> BoxFuture<'a, SourceResult<TokenState>> {
            Box::pin(async move {
                self.state_calls.fetch_add(1, Ordering::SeqCst);
                if self.failing.lock().contains(&normalize_address(address)) {
                    return Err(SourceError::Token {
                        address: address.to_string(),
                        reason: "scripted failure".to_string(),
                    });
                }
                self.find(address)
                    .map(|t| t.state)
                    .ok_or_else(|| SourceError::Token {
                        address: address.to_string(),
                        reason: "unknown token".to_string(),
                    })
            })
        }

        fn token_metadata<'a>(
            &'a self,
            address: &'a str,
        ) -> BoxFuture<'a, SourceResult<TokenMetadata>> {
            Box::pin(async move {
                self.metadata_calls.fetch_add(1, Ordering::SeqCst);
                self.find(address)
                    .map(|t| t.metadata)
                    .ok_or_else(|| SourceError::Token {
                        address: address.to_string(),
                        reason: "unknown token".to_string(),
                    })
            })
        }
    }
}
