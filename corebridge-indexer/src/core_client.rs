// Copyright (c) Corebridge, Inc.
// SPDX-License-Identifier: Apache-2.0

//! HTTP client for the upstream CORE ledger.
//!
//! Two POST endpoints share one base URL: per-user non-funding ledger updates
//! (inclusive-start, ascending by time, may redeliver the boundary entry) and
//! the token metadata listing. Rate limits arrive as HTTP 429 with a
//! `Retry-After` header; the caller feeds that into the shared backoff.

use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::FetchError;

const CORE_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

#[derive(Debug, Serialize)]
struct LedgerUpdatesRequest<'a> {
    kind: &'static str,
    user: &'a str,
    #[serde(rename = "startTime")]
    start_time: i64,
}

#[derive(Debug, Serialize)]
struct SpotMetaRequest {
    kind: &'static str,
}

/// One entry of the per-user ledger stream.
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerEntry {
    pub time: i64,
    pub hash: String,
    pub delta: LedgerDelta,
}

/// The delta payload of a ledger entry. Only spot transfers matter to the
/// correlator; every other kind is carried as `Other` and filtered out.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind")]
pub enum LedgerDelta {
    #[serde(rename = "spotTransfer", rename_all = "camelCase")]
    SpotTransfer {
        token: String,
        amount: String,
        user: String,
        destination: String,
        #[serde(default)]
        usdc_value: Option<String>,
        #[serde(default)]
        fee: Option<String>,
        #[serde(default)]
        native_token_fee: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpotMetaResponse {
    pub tokens: Vec<TokenMeta>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenMeta {
    pub name: String,
    pub index: u32,
    pub wei_decimals: u32,
    #[serde(default)]
    pub evm_contract: Option<EvmContractMeta>,
}

/// The inner object keeps the upstream's snake_case field naming.
#[derive(Debug, Clone, Deserialize)]
pub struct EvmContractMeta {
    pub address: String,
    pub evm_extra_wei_decimals: i32,
}

pub struct CoreClient {
    http: reqwest::Client,
    base_url: String,
}

impl CoreClient {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(CORE_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    /// Fetch ledger updates for `user`, inclusive from `start_time`.
    /// The response is ascending by time.
    pub async fn user_ledger_updates(
        &self,
        user: &str,
        start_time: i64,
    ) -> Result<Vec<LedgerEntry>, FetchError> {
        let body = LedgerUpdatesRequest {
            kind: "userNonFundingLedgerUpdates",
            user,
            start_time,
        };
        self.post_json(&body).await
    }

    /// Fetch the token metadata listing.
    pub async fn spot_meta(&self) -> Result<SpotMetaResponse, FetchError> {
        self.post_json(&SpotMetaRequest { kind: "spotMeta" }).await
    }

    async fn post_json<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        body: &B,
    ) -> Result<T, FetchError> {
        let response = self
            .http
            .post(&self.base_url)
            .json(body)
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
            return Err(FetchError::RateLimited {
                retry_after_ms: retry_after_ms(&response),
            });
        }
        if status.is_server_error() {
            return Err(FetchError::Transient(format!("server error: {status}")));
        }
        if !status.is_success() {
            return Err(FetchError::Protocol(format!("unexpected status: {status}")));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| FetchError::Protocol(format!("malformed response: {e}")))
    }
}

fn retry_after_ms(response: &reqwest::Response) -> u64 {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
        * 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_updates_request_shape() {
        let body = LedgerUpdatesRequest {
            kind: "userNonFundingLedgerUpdates",
            user: "0xabc",
            start_time: 1_700_000_000_000,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["kind"], "userNonFundingLedgerUpdates");
        assert_eq!(json["user"], "0xabc");
        assert_eq!(json["startTime"], 1_700_000_000_000i64);
    }

    #[test]
    fn test_spot_transfer_delta_parses() {
        let raw = serde_json::json!({
            "time": 1_700_000_000_123i64,
            "hash": "0xdeadbeef",
            "delta": {
                "kind": "spotTransfer",
                "token": "UBTC",
                "amount": "0.5",
                "user": "0x1111111111111111111111111111111111111111",
                "destination": "0x2000000000000000000000000000000000000005",
                "usdcValue": "30000.0",
                "fee": "0.0001",
                "nativeTokenFee": "0.0"
            }
        });
        let entry: LedgerEntry = serde_json::from_value(raw).unwrap();
        assert_eq!(entry.time, 1_700_000_000_123);
        match entry.delta {
            LedgerDelta::SpotTransfer {
                token,
                amount,
                destination,
                usdc_value,
                ..
            } => {
                assert_eq!(token, "UBTC");
                assert_eq!(amount, "0.5");
                assert_eq!(destination, "0x2000000000000000000000000000000000000005");
                assert_eq!(usdc_value.as_deref(), Some("30000.0"));
            }
            other => panic!("expected spotTransfer, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_delta_kind_is_other() {
        let raw = serde_json::json!({
            "time": 1i64,
            "hash": "0x00",
            "delta": { "kind": "deposit", "usdc": "100.0" }
        });
        let entry: LedgerEntry = serde_json::from_value(raw).unwrap();
        assert!(matches!(entry.delta, LedgerDelta::Other));
    }

    #[test]
    fn test_token_meta_parses_evm_contract() {
        let raw = serde_json::json!({
            "tokens": [
                { "name": "HYPE", "index": 150, "weiDecimals": 8 },
                {
                    "name": "UBTC",
                    "index": 5,
                    "weiDecimals": 8,
                    "evmContract": {
                        "address": "0x9fdbda0a5e284c32744d2f17ee5c74b284993463",
                        "evm_extra_wei_decimals": 2
                    }
                }
            ]
        });
        let meta: SpotMetaResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(meta.tokens.len(), 2);
        assert!(meta.tokens[0].evm_contract.is_none());
        let ubtc = &meta.tokens[1];
        assert_eq!(ubtc.index, 5);
        assert_eq!(
            ubtc.evm_contract.as_ref().unwrap().evm_extra_wei_decimals,
            2
        );
    }
}
