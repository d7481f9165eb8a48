//! JSON-RPC reader for the token factory contract.
//!
//! Reads go through `eth_call` against the latest block. Calldata and return
//! values are encoded with the `sol!` bindings below.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy::primitives::Address;
use alloy::sol;
use alloy::sol_types::SolCall;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};
use tvb_core::{normalize_address, TokenMetadata, TokenState};

use crate::error::{SourceError, SourceResult};
use crate::source::{BoxFuture, TokenSource};

/// Default timeout for a single RPC request.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

sol! {
    function getAllTokens() external view returns (address[] memory);
    function getTokenState(address token) external view returns (uint8);
    function name() external view returns (string memory);
    function symbol() external view returns (string memory);
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: (CallParams, &'a str),
}

#[derive(Debug, Serialize)]
struct CallParams {
    to: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
    #[serde(default)]
    #[allow(dead_code)]
    data: Option<Value>,
}

/// Token factory read over Ethereum JSON-RPC.
pub struct FactoryRpcSource {
    client: Client,
    rpc_url: String,
    factory: Address,
    next_id: AtomicU64,
}

impl FactoryRpcSource {
    /// Create a reader for the factory at `factory_address`.
    ///
    /// # Arguments
    /// * `rpc_url` - JSON-RPC endpoint (e.g., "https://api.avax.network/ext/bc/C/rpc")
    /// * `factory_address` - Factory contract address (0x-prefixed hex)
    pub fn new(rpc_url: impl Into<String>, factory_address: &str) -> SourceResult<Self> {
        let factory = parse_address(factory_address)?;
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| SourceError::HttpClient(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            rpc_url: rpc_url.into(),
            factory,
            next_id: AtomicU64::new(1),
        })
    }

    /// Execute `eth_call` and return the raw return data.
    async fn eth_call(&self, to: Address, calldata: Vec<u8>) -> SourceResult<Vec<u8>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest {
            jsonrpc: "2.0",
            id,
            method: "eth_call",
            params: (
                CallParams {
                    to: format!("{to:#x}"),
                    data: format!("0x{}", hex::encode(calldata)),
                },
                "latest",
            ),
        };

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| SourceError::HttpClient(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::HttpClient(format!("HTTP {status}: {body}")));
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| SourceError::HttpClient(format!("Failed to parse response: {e}")))?;

        if let Some(err) = body.error {
            return Err(SourceError::Rpc {
                code: err.code,
                message: err.message,
            });
        }

        let result = body
            .result
            .ok_or_else(|| SourceError::Decode("response has neither result nor error".into()))?;
        trace!(id, bytes = result.len(), "eth_call result");

        hex::decode(result.trim_start_matches("0x"))
            .map_err(|e| SourceError::Decode(format!("invalid hex in result: {e}")))
    }

    async fn fetch_all_tokens(&self) -> SourceResult<Vec<String>> {
        let data = self
            .eth_call(self.factory, getAllTokensCall {}.abi_encode())
            .await?;
        let decoded = getAllTokensCall::abi_decode_returns(&data, true)
            .map_err(|e| SourceError::Decode(format!("getAllTokens: {e}")))?;
        let tokens: Vec<String> = decoded._0.iter().map(|a| a.to_string()).collect();
        debug!(factory = %self.factory, count = tokens.len(), "Fetched factory token list");
        Ok(tokens)
    }

    async fn fetch_token_state(&self, address: &str) -> SourceResult<TokenState> {
        let token = parse_address(address)?;
        let data = self
            .eth_call(self.factory, getTokenStateCall { token }.abi_encode())
            .await?;
        let decoded = getTokenStateCall::abi_decode_returns(&data, true)
            .map_err(|e| SourceError::Decode(format!("getTokenState({address}): {e}")))?;
        Ok(TokenState::try_from(decoded._0)?)
    }

    async fn fetch_token_metadata(&self, address: &str) -> SourceResult<TokenMetadata> {
        let token = parse_address(address)?;

        let data = self.eth_call(token, nameCall {}.abi_encode()).await?;
        let name = nameCall::abi_decode_returns(&data, true)
            .map_err(|e| SourceError::Decode(format!("name({address}): {e}")))?
            ._0;

        let data = self.eth_call(token, symbolCall {}.abi_encode()).await?;
        let symbol = symbolCall::abi_decode_returns(&data, true)
            .map_err(|e| SourceError::Decode(format!("symbol({address}): {e}")))?
            ._0;

        Ok(TokenMetadata { name, symbol })
    }
}

impl TokenSource for FactoryRpcSource {
    fn identity(&self) -> String {
        normalize_address(&self.factory.to_string())
    }

    fn list_tokens(&self) -> BoxFuture<'_, SourceResult<Vec<String>>> {
        Box::pin(self.fetch_all_tokens())
    }

    fn token_state<'a>(&'a self, address: &'a str) -> BoxFuture<'a, SourceResult<TokenState>> {
        Box::pin(self.fetch_token_state(address))
    }

    fn token_metadata<'a>(
        &'a self,
        address: &'a str,
    ) -> BoxFuture<'a, SourceResult<TokenMetadata>> {
        Box::pin(self.fetch_token_metadata(address))
    }
}

fn parse_address(address: &str) -> SourceResult<Address> {
    address
        .trim()
        .parse::<Address>()
        .map_err(|_| tvb_core::CoreError::InvalidAddress(address.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FACTORY: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";

    #[test]
    fn test_identity_is_lower_case_factory() {
        let source = FactoryRpcSource::new("http://127.0.0.1:1", FACTORY).unwrap();
        assert_eq!(source.identity(), FACTORY.to_ascii_lowercase());
    }

    #[test]
    fn test_rejects_invalid_factory_address() {
        let result = FactoryRpcSource::new("http://127.0.0.1:1", "not-an-address");
        assert!(matches!(
            result,
            Err(SourceError::Core(tvb_core::CoreError::InvalidAddress(_)))
        ));
    }

    #[test]
    fn test_calldata_selectors() {
        let data = getAllTokensCall {}.abi_encode();
        assert_eq!(data.len(), 4);

        let token: Address = FACTORY.parse().unwrap();
        let data = getTokenStateCall { token }.abi_encode();
        assert_eq!(&data[..4], &getTokenStateCall::SELECTOR);
        assert_eq!(data.len(), 4 + 32);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_http_error() {
        let source = FactoryRpcSource::new("http://127.0.0.1:1", FACTORY).unwrap();
        let result = source.list_tokens().await;
        assert!(matches!(result, Err(SourceError::HttpClient(_))));
    }
}
