// Copyright (c) Corebridge, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Persistence operations.
//!
//! All duplicate detection is delegated to the uniqueness constraints via
//! `ON CONFLICT DO NOTHING`; the application never does read-then-write.
//! Every worker shares the same pool and PostgreSQL provides the concurrency
//! control.

use anyhow::{Context, Result};
use diesel::{BoolExpressionMethods, ExpressionMethods, OptionalExtension, QueryDsl};
use diesel_async::RunQueryDsl;
use tracing::debug;

use corebridge_pg_db::Db;
use corebridge_schema::models::{
    AnchorTx, NewTransfer, Transfer, TransferStatus, WatchedAddress,
};
use corebridge_schema::schema::{anchor_txs, transfers, watched_addresses};

/// Longest `fail_reason` that gets stored.
const MAX_FAIL_REASON_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchInsertResult {
    pub inserted: usize,
    pub duplicates: usize,
}

/// A `(block_number, block_timestamp)` projection of an anchor, used to
/// bracket a target time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnchorPoint {
    pub block_number: i64,
    pub block_timestamp: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AnchorBounds {
    pub before: Option<AnchorPoint>,
    pub after: Option<AnchorPoint>,
}

/// The EVM half of a correlated transfer, written by `mark_matched`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvmMatch {
    pub internal_hash: String,
    pub explorer_hash: String,
    pub block_number: i64,
    pub block_hash: String,
    pub block_time: i64,
    pub contract_address: Option<String>,
}

#[derive(Clone)]
pub struct Storage {
    db: Db,
}

impl Storage {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Unordered batch insert. Rows whose `core_hash` already exists are
    /// counted as duplicates, not failures; any other error fails the call.
    pub async fn insert_transfer_batch(
        &self,
        batch: &[NewTransfer],
    ) -> Result<BatchInsertResult> {
        if batch.is_empty() {
            return Ok(BatchInsertResult {
                inserted: 0,
                duplicates: 0,
            });
        }
        let mut conn = self.db.connect().await?;
        let inserted = diesel::insert_into(transfers::table)
            .values(batch)
            .on_conflict_do_nothing()
            .execute(&mut conn)
            .await
            .context("Failed to insert transfer batch")?;
        Ok(BatchInsertResult {
            inserted,
            duplicates: batch.len() - inserted,
        })
    }

    /// Oldest-first pending transfers.
    pub async fn get_pending_transfers(&self, limit: i64) -> Result<Vec<Transfer>> {
        use diesel::SelectableHelper;

        let mut conn = self.db.connect().await?;
        let rows = transfers::table
            .filter(transfers::status.eq(TransferStatus::Pending))
            .order(transfers::core_time.asc())
            .limit(limit)
            .select(Transfer::as_select())
            .load(&mut conn)
            .await
            .context("Failed to load pending transfers")?;
        Ok(rows)
    }

    pub async fn count_pending_transfers(&self) -> Result<i64> {
        let mut conn = self.db.connect().await?;
        let count = transfers::table
            .filter(transfers::status.eq(TransferStatus::Pending))
            .count()
            .get_result(&mut conn)
            .await
            .context("Failed to count pending transfers")?;
        Ok(count)
    }

    /// Set the terminal MATCHED state and all EVM fields in one statement.
    /// Only PENDING rows are eligible, which makes the call idempotent and
    /// keeps MATCHED terminal.
    pub async fn mark_matched(&self, core_hash: &str, evm: &EvmMatch) -> Result<()> {
        let mut conn = self.db.connect().await?;
        let updated = diesel::update(
            transfers::table.filter(
                transfers::core_hash
                    .eq(core_hash)
                    .and(transfers::status.eq(TransferStatus::Pending)),
            ),
        )
        .set((
            transfers::status.eq(TransferStatus::Matched),
            transfers::fail_reason.eq(None::<String>),
            transfers::evm_internal_hash.eq(&evm.internal_hash),
            transfers::evm_explorer_hash.eq(&evm.explorer_hash),
            transfers::evm_block_number.eq(evm.block_number),
            transfers::evm_block_hash.eq(&evm.block_hash),
            transfers::evm_block_time.eq(evm.block_time),
            transfers::contract_address.eq(evm.contract_address.clone()),
        ))
        .execute(&mut conn)
        .await
        .context("Failed to mark transfer matched")?;
        if updated == 0 {
            debug!("[STORAGE] mark_matched({core_hash}) touched no pending row");
        }
        Ok(())
    }

    pub async fn mark_failed(&self, core_hash: &str, reason: &str) -> Result<()> {
        let mut reason = reason.to_string();
        reason.truncate(MAX_FAIL_REASON_LEN);

        let mut conn = self.db.connect().await?;
        let updated = diesel::update(
            transfers::table.filter(
                transfers::core_hash
                    .eq(core_hash)
                    .and(transfers::status.eq(TransferStatus::Pending)),
            ),
        )
        .set((
            transfers::status.eq(TransferStatus::Failed),
            transfers::fail_reason.eq(reason),
        ))
        .execute(&mut conn)
        .await
        .context("Failed to mark transfer failed")?;
        if updated == 0 {
            debug!("[STORAGE] mark_failed({core_hash}) touched no pending row");
        }
        Ok(())
    }

    /// Idempotent anchor insert; duplicates on `internal_hash` are silently
    /// absorbed. Returns how many rows were actually new.
    pub async fn insert_anchor_batch(&self, anchors: &[AnchorTx]) -> Result<usize> {
        if anchors.is_empty() {
            return Ok(0);
        }
        let mut conn = self.db.connect().await?;
        let inserted = diesel::insert_into(anchor_txs::table)
            .values(anchors)
            .on_conflict_do_nothing()
            .execute(&mut conn)
            .await
            .context("Failed to insert anchor batch")?;
        Ok(inserted)
    }

    /// The greatest anchor with `block_timestamp <= target` and the least
    /// with `block_timestamp > target`. Two one-shot lookups run in
    /// parallel; a single composite query cannot use the timestamp index in
    /// both sort directions.
    pub async fn find_bracketing_anchors(&self, target_time_ms: i64) -> Result<AnchorBounds> {
        let before = async {
            let mut conn = self.db.connect().await?;
            anchor_txs::table
                .filter(anchor_txs::block_timestamp.le(target_time_ms))
                .order((
                    anchor_txs::block_timestamp.desc(),
                    anchor_txs::block_number.desc(),
                ))
                .select((anchor_txs::block_number, anchor_txs::block_timestamp))
                .first::<(i64, i64)>(&mut conn)
                .await
                .optional()
                .context("Failed to find lower bracketing anchor")
        };
        let after = async {
            let mut conn = self.db.connect().await?;
            anchor_txs::table
                .filter(anchor_txs::block_timestamp.gt(target_time_ms))
                .order((
                    anchor_txs::block_timestamp.asc(),
                    anchor_txs::block_number.asc(),
                ))
                .select((anchor_txs::block_number, anchor_txs::block_timestamp))
                .first::<(i64, i64)>(&mut conn)
                .await
                .optional()
                .context("Failed to find upper bracketing anchor")
        };
        let (before, after) = futures::try_join!(before, after)?;

        let to_point = |(block_number, block_timestamp)| AnchorPoint {
            block_number,
            block_timestamp,
        };
        Ok(AnchorBounds {
            before: before.map(to_point),
            after: after.map(to_point),
        })
    }

    /// Earliest anchor matching the `(from, recipient, amount)` tuple inside
    /// the time window, or None.
    pub async fn find_matching_anchor(
        &self,
        from: &str,
        recipient: &str,
        amount_smallest_unit: &str,
        min_time_ms: i64,
        max_time_ms: i64,
    ) -> Result<Option<AnchorTx>> {
        use diesel::SelectableHelper;

        let mut conn = self.db.connect().await?;
        let anchor = anchor_txs::table
            .filter(anchor_txs::from_address.eq(from))
            .filter(anchor_txs::asset_recipient.eq(recipient))
            .filter(anchor_txs::amount_smallest_unit.eq(amount_smallest_unit))
            .filter(anchor_txs::block_timestamp.ge(min_time_ms))
            .filter(anchor_txs::block_timestamp.le(max_time_ms))
            .order(anchor_txs::block_timestamp.asc())
            .select(AnchorTx::as_select())
            .first(&mut conn)
            .await
            .optional()
            .context("Failed to query matching anchor")?;
        Ok(anchor)
    }

    /// Register an address to watch. Existing rows keep their cursor.
    pub async fn upsert_watched_address(&self, address: &str) -> Result<()> {
        let mut conn = self.db.connect().await?;
        diesel::insert_into(watched_addresses::table)
            .values(&WatchedAddress {
                address: address.to_ascii_lowercase(),
                last_indexed_time: 0,
                is_active: true,
            })
            .on_conflict_do_nothing()
            .execute(&mut conn)
            .await
            .context("Failed to upsert watched address")?;
        Ok(())
    }

    pub async fn get_active_watched_addresses(&self) -> Result<Vec<WatchedAddress>> {
        use diesel::SelectableHelper;

        let mut conn = self.db.connect().await?;
        let rows = watched_addresses::table
            .filter(watched_addresses::is_active.eq(true))
            .select(WatchedAddress::as_select())
            .load(&mut conn)
            .await
            .context("Failed to load watched addresses")?;
        Ok(rows)
    }

    /// Advance the ingestion cursor. Monotone: an older timestamp never
    /// rewinds the stored value.
    pub async fn advance_cursor(&self, address: &str, time_ms: i64) -> Result<()> {
        let mut conn = self.db.connect().await?;
        diesel::update(
            watched_addresses::table.filter(
                watched_addresses::address
                    .eq(address)
                    .and(watched_addresses::last_indexed_time.lt(time_ms)),
            ),
        )
        .set(watched_addresses::last_indexed_time.eq(time_ms))
        .execute(&mut conn)
        .await
        .context("Failed to advance cursor")?;
        Ok(())
    }

    pub async fn deactivate_watched_address(&self, address: &str) -> Result<()> {
        let mut conn = self.db.connect().await?;
        diesel::update(watched_addresses::table.filter(watched_addresses::address.eq(address)))
            .set(watched_addresses::is_active.eq(false))
            .execute(&mut conn)
            .await
            .context("Failed to deactivate watched address")?;
        Ok(())
    }
}
