// Copyright (c) Corebridge, Inc.
// SPDX-License-Identifier: Apache-2.0

//! JSON-RPC block fetcher (the free, slower provider).
//!
//! Each block costs two batched operations: `eth_getBlockByNumber` for the
//! header and `eth_getSystemTxsByBlockNumber` for the system transactions.
//! The upstream caps batches at [`MAX_RPC_BATCH_SIZE`] operations, so chunks
//! of ten blocks are fetched sequentially.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256, U64};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    block_time_ms, normalize_system_tx, with_retries, BlockData, BlockFetcher, RawEvmLog,
    RawEvmTx, MAX_RPC_BATCH_SIZE,
};
use crate::backoff::SharedBackoff;
use crate::error::FetchError;

const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    id: u64,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcBlockHeader {
    hash: H256,
    timestamp: U256,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcSystemTx {
    nonce: U256,
    #[serde(default)]
    gas_price: U256,
    gas: U256,
    to: Option<Address>,
    value: U256,
    input: Bytes,
    #[serde(default)]
    logs: Vec<RpcLog>,
}

#[derive(Debug, Deserialize)]
struct RpcLog {
    address: Address,
    topics: Vec<H256>,
    #[serde(default)]
    data: Bytes,
}

impl RpcSystemTx {
    fn into_raw(self) -> RawEvmTx {
        RawEvmTx {
            nonce: self.nonce,
            gas_price: self.gas_price,
            gas: self.gas,
            to: self.to,
            value: self.value,
            input: self.input,
            logs: self
                .logs
                .into_iter()
                .map(|log| RawEvmLog {
                    address: log.address,
                    topics: log.topics,
                    data: log.data,
                })
                .collect(),
        }
    }
}

pub struct RpcBlockFetcher {
    http: reqwest::Client,
    url: String,
    chain_id: u64,
    backoff: Arc<SharedBackoff>,
}

impl RpcBlockFetcher {
    pub fn new(
        url: impl Into<String>,
        chain_id: u64,
        backoff: Arc<SharedBackoff>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            url: url.into(),
            chain_id,
            backoff,
        })
    }

    async fn fetch_chunk(&self, block_numbers: &[u64]) -> Result<Vec<BlockData>, FetchError> {
        let mut batch = Vec::with_capacity(block_numbers.len() * 2);
        for (i, number) in block_numbers.iter().enumerate() {
            let hex = format!("0x{number:x}");
            batch.push(JsonRpcRequest {
                jsonrpc: "2.0",
                id: (i as u64) * 2,
                method: "eth_getBlockByNumber",
                params: serde_json::json!([hex, false]),
            });
            batch.push(JsonRpcRequest {
                jsonrpc: "2.0",
                id: (i as u64) * 2 + 1,
                method: "eth_getSystemTxsByBlockNumber",
                params: serde_json::json!([hex]),
            });
        }

        let response = self
            .http
            .post(&self.url)
            .json(&batch)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout
                } else {
                    FetchError::Transient(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
                * 1000;
            return Err(FetchError::RateLimited { retry_after_ms });
        }
        if status.is_server_error() {
            return Err(FetchError::Transient(format!("server error: {status}")));
        }
        if !status.is_success() {
            return Err(FetchError::Protocol(format!("unexpected status: {status}")));
        }

        let responses: Vec<JsonRpcResponse> = response
            .json()
            .await
            .map_err(|e| FetchError::Protocol(format!("malformed batch response: {e}")))?;

        let mut by_id: HashMap<u64, serde_json::Value> = HashMap::new();
        for entry in responses {
            if let Some(error) = entry.error {
                // Upstream rate limiting sometimes arrives as a per-entry
                // error rather than HTTP 429.
                if error.code == 429 || error.message.to_ascii_lowercase().contains("rate") {
                    return Err(FetchError::RateLimited {
                        retry_after_ms: DEFAULT_RETRY_AFTER_SECS * 1000,
                    });
                }
                return Err(FetchError::Transient(format!(
                    "rpc error {}: {}",
                    error.code, error.message
                )));
            }
            if let Some(result) = entry.result {
                by_id.insert(entry.id, result);
            }
        }

        let mut blocks = Vec::with_capacity(block_numbers.len());
        for (i, &number) in block_numbers.iter().enumerate() {
            let Some(header_value) = by_id.remove(&((i as u64) * 2)) else {
                continue;
            };
            if header_value.is_null() {
                // Block not mined yet; an estimate past the chain head is
                // normal while extrapolating.
                debug!("[RPC] Block {number} not available");
                continue;
            }
            let header: RpcBlockHeader = serde_json::from_value(header_value)
                .map_err(|e| FetchError::Protocol(format!("malformed block {number}: {e}")))?;

            let txs: Vec<RpcSystemTx> = match by_id.remove(&((i as u64) * 2 + 1)) {
                Some(value) if !value.is_null() => serde_json::from_value(value).map_err(|e| {
                    FetchError::Protocol(format!("malformed system txs for block {number}: {e}"))
                })?,
                _ => Vec::new(),
            };

            let system_txs = txs
                .into_iter()
                .filter_map(|tx| normalize_system_tx(&tx.into_raw(), self.chain_id))
                .collect();

            blocks.push(BlockData {
                number,
                hash: format!("0x{:x}", header.hash),
                timestamp: block_time_ms(header.timestamp.as_u64()),
                system_txs,
            });
        }
        Ok(blocks)
    }
}

#[async_trait]
impl BlockFetcher for RpcBlockFetcher {
    async fn fetch_blocks(&self, block_numbers: &[u64]) -> Result<Vec<BlockData>, FetchError> {
        let mut blocks = Vec::with_capacity(block_numbers.len());
        // Two operations per block; chunks run sequentially to stay polite
        // on the free endpoint.
        for chunk in block_numbers.chunks(MAX_RPC_BATCH_SIZE / 2) {
            let fetched =
                with_retries("rpc_fetch_blocks", &self.backoff, || self.fetch_chunk(chunk)).await?;
            blocks.extend(fetched);
        }
        blocks.sort_by_key(|b| b.number);
        Ok(blocks)
    }

    fn name(&self) -> &'static str {
        "rpc"
    }
}

/// Latest chain height, used by operational tooling rather than the search
/// itself (the finder brackets with anchors, not the head).
impl RpcBlockFetcher {
    pub async fn latest_block_number(&self) -> Result<u64, FetchError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: 0,
            method: "eth_blockNumber",
            params: serde_json::json!([]),
        };
        let response = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;
        let parsed: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Protocol(format!("malformed response: {e}")))?;
        let result = parsed
            .result
            .ok_or_else(|| FetchError::Protocol("missing result".to_string()))?;
        let number: U64 = serde_json::from_value(result)
            .map_err(|e| FetchError::Protocol(format!("malformed block number: {e}")))?;
        Ok(number.as_u64())
    }
}
