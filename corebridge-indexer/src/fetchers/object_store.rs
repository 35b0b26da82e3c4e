// Copyright (c) Corebridge, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Object-store block fetcher (the paid, fast provider).
//!
//! Historical blocks live in a requester-pays bucket as LZ4-frame-compressed,
//! message-pack-encoded records at `<million>/<thousand>/<block>.rmp.lz4`.
//! A single call fetches every requested block concurrently; the per-object
//! cost is what bounds usage, not throughput, so there is no local
//! concurrency cap.

use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::types::RequestPayer;
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    block_time_ms, normalize_system_tx, with_retries, BlockData, BlockFetcher, RawEvmLog,
    RawEvmTx,
};
use crate::backoff::SharedBackoff;
use crate::error::FetchError;

const OBJECT_EXTENSION: &str = "rmp.lz4";

/// A stored block record: the block body plus its receipts, which carry the
/// `Transfer` logs needed to attribute contract transfers.
#[derive(Debug, Serialize, Deserialize)]
struct BlockRecord {
    block: RecordBlock,
    receipts: Vec<RecordReceipt>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordBlock {
    header: RecordHeader,
    transactions: Vec<RecordTx>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordHeader {
    number: u64,
    hash: H256,
    timestamp: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordTx {
    nonce: U256,
    gas_price: U256,
    gas: U256,
    to: Option<Address>,
    value: U256,
    input: Bytes,
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordReceipt {
    logs: Vec<RecordLog>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordLog {
    address: Address,
    topics: Vec<H256>,
    data: Bytes,
}

/// Object key for a block: million-aligned directory, thousand-aligned
/// subdirectory, block number as the file name.
fn object_key(block_number: u64) -> String {
    format!(
        "{}/{}/{}.{}",
        block_number / 1_000_000 * 1_000_000,
        block_number / 1_000 * 1_000,
        block_number,
        OBJECT_EXTENSION
    )
}

fn decode_block_record(bytes: &[u8], chain_id: u64) -> Result<BlockData, FetchError> {
    let mut decoder = lz4_flex::frame::FrameDecoder::new(bytes);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| FetchError::Protocol(format!("lz4 decompression failed: {e}")))?;

    let record: BlockRecord = rmp_serde::from_slice(&decompressed)
        .map_err(|e| FetchError::Protocol(format!("messagepack decode failed: {e}")))?;

    let header = &record.block.header;
    let system_txs = record
        .block
        .transactions
        .iter()
        .enumerate()
        .filter_map(|(i, tx)| {
            let logs = record
                .receipts
                .get(i)
                .map(|receipt| {
                    receipt
                        .logs
                        .iter()
                        .map(|log| RawEvmLog {
                            address: log.address,
                            topics: log.topics.clone(),
                            data: log.data.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            let raw = RawEvmTx {
                nonce: tx.nonce,
                gas_price: tx.gas_price,
                gas: tx.gas,
                to: tx.to,
                value: tx.value,
                input: tx.input.clone(),
                logs,
            };
            normalize_system_tx(&raw, chain_id)
        })
        .collect();

    Ok(BlockData {
        number: header.number,
        hash: format!("0x{:x}", header.hash),
        timestamp: block_time_ms(header.timestamp),
        system_txs,
    })
}

pub struct ObjectStoreBlockFetcher {
    s3: aws_sdk_s3::Client,
    bucket: String,
    chain_id: u64,
    backoff: Arc<SharedBackoff>,
}

impl ObjectStoreBlockFetcher {
    pub async fn new(
        bucket: impl Into<String>,
        region: impl Into<String>,
        chain_id: u64,
        backoff: Arc<SharedBackoff>,
    ) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.into()))
            .load()
            .await;
        Self {
            s3: aws_sdk_s3::Client::new(&config),
            bucket: bucket.into(),
            chain_id,
            backoff,
        }
    }

    /// Fetch one block object. `Ok(None)` means the object does not exist,
    /// which is expected when estimating past the chain head.
    async fn fetch_object(&self, block_number: u64) -> Result<Option<BlockData>, FetchError> {
        let key = object_key(block_number);
        let result = self
            .s3
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .request_payer(RequestPayer::Requester)
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                if err
                    .as_service_error()
                    .map_or(false, |service| service.is_no_such_key())
                {
                    debug!("[OBJECT-STORE] Block {block_number} not in bucket yet");
                    return Ok(None);
                }
                return Err(FetchError::Transient(format!("s3 get {key}: {err}")));
            }
        };

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| FetchError::Transient(format!("s3 body {key}: {e}")))?
            .into_bytes();

        decode_block_record(&bytes, self.chain_id).map(Some)
    }
}

#[async_trait]
impl BlockFetcher for ObjectStoreBlockFetcher {
    async fn fetch_blocks(&self, block_numbers: &[u64]) -> Result<Vec<BlockData>, FetchError> {
        let fetches = block_numbers.iter().map(|&number| {
            with_retries("object_store_fetch", &self.backoff, move || {
                self.fetch_object(number)
            })
        });

        let mut blocks = Vec::with_capacity(block_numbers.len());
        for result in futures::future::join_all(fetches).await {
            if let Some(block) = result? {
                blocks.push(block);
            }
        }
        blocks.sort_by_key(|b| b.number);
        Ok(blocks)
    }

    fn name(&self) -> &'static str {
        "object-store"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_object_key_layout() {
        assert_eq!(object_key(0), "0/0/0.rmp.lz4");
        assert_eq!(object_key(999), "0/0/999.rmp.lz4");
        assert_eq!(object_key(1_000), "0/1000/1000.rmp.lz4");
        assert_eq!(object_key(1_234_567), "1000000/1234000/1234567.rmp.lz4");
        assert_eq!(
            object_key(12_345_678),
            "12000000/12345000/12345678.rmp.lz4"
        );
    }

    fn compress(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_decode_block_record() {
        let record = BlockRecord {
            block: RecordBlock {
                header: RecordHeader {
                    number: 1500,
                    hash: H256::from([0x11; 32]),
                    timestamp: 1_700_000_500,
                },
                transactions: vec![RecordTx {
                    nonce: U256::from(3),
                    gas_price: U256::zero(),
                    gas: U256::from(21_000u64),
                    to: Some(Address::from([0xaa; 20])),
                    value: U256::from(5_000u64),
                    input: Bytes::new(),
                }],
            },
            receipts: vec![RecordReceipt { logs: vec![] }],
        };
        let encoded = rmp_serde::to_vec(&record).unwrap();
        let compressed = compress(&encoded);

        let block = decode_block_record(&compressed, 999).unwrap();
        assert_eq!(block.number, 1500);
        assert_eq!(block.timestamp, 1_700_000_500_000);
        assert_eq!(block.system_txs.len(), 1);
        assert_eq!(
            block.system_txs[0].amount_smallest_unit,
            U256::from(5_000u64)
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode_block_record(&compress(b"not messagepack"), 999),
            Err(FetchError::Protocol(_))
        ));
        assert!(matches!(
            decode_block_record(b"not lz4 frame data", 999),
            Err(FetchError::Protocol(_))
        ));
    }
}
