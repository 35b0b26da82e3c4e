// Copyright (c) Corebridge, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::io::Write;

use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::pg::{Pg, PgValue};
use diesel::prelude::*;
use diesel::serialize::{self, IsNull, Output, ToSql};
use diesel::sql_types::Text;

use crate::schema::{anchor_txs, transfers, watched_addresses};

/// Correlation state of a CORE transfer.
///
/// Transitions are PENDING -> MATCHED or PENDING -> FAILED only. MATCHED is
/// terminal; FAILED may be reset to PENDING by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsExpression, FromSqlRow)]
#[diesel(sql_type = Text)]
pub enum TransferStatus {
    Pending,
    Matched,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "PENDING",
            TransferStatus::Matched => "MATCHED",
            TransferStatus::Failed => "FAILED",
        }
    }
}

impl ToSql<Text, Pg> for TransferStatus {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        out.write_all(self.as_str().as_bytes())?;
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Pg> for TransferStatus {
    fn from_sql(value: PgValue<'_>) -> deserialize::Result<Self> {
        match value.as_bytes() {
            b"PENDING" => Ok(TransferStatus::Pending),
            b"MATCHED" => Ok(TransferStatus::Matched),
            b"FAILED" => Ok(TransferStatus::Failed),
            other => Err(format!(
                "Unrecognized transfer status: {}",
                String::from_utf8_lossy(other)
            )
            .into()),
        }
    }
}

/// A CORE-side spot transfer, as stored. EVM columns are NULL until the
/// matcher resolves the transfer; all of them are set together.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = transfers)]
pub struct Transfer {
    pub core_hash: String,
    pub core_time: i64,
    pub token: String,
    pub amount: String,
    pub recipient: String,
    pub system_address: String,
    pub watched_sender: String,
    pub usdc_value: Option<String>,
    pub fee: Option<String>,
    pub native_token_fee: Option<String>,
    pub status: TransferStatus,
    pub fail_reason: Option<String>,
    pub evm_internal_hash: Option<String>,
    pub evm_explorer_hash: Option<String>,
    pub evm_block_number: Option<i64>,
    pub evm_block_hash: Option<String>,
    pub evm_block_time: Option<i64>,
    pub contract_address: Option<String>,
}

/// Insert form of [`Transfer`]. New rows always start out PENDING with the
/// EVM columns unset, so only the CORE-side fields appear here.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = transfers)]
pub struct NewTransfer {
    pub core_hash: String,
    pub core_time: i64,
    pub token: String,
    pub amount: String,
    pub recipient: String,
    pub system_address: String,
    pub watched_sender: String,
    pub usdc_value: Option<String>,
    pub fee: Option<String>,
    pub native_token_fee: Option<String>,
}

/// A system transaction observed in an EVM block. Inserted idempotently
/// whenever a block is fetched; never mutated or deleted.
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable, Insertable)]
#[diesel(table_name = anchor_txs)]
pub struct AnchorTx {
    pub internal_hash: String,
    pub explorer_hash: String,
    pub block_number: i64,
    pub block_hash: String,
    pub block_timestamp: i64,
    pub from_address: String,
    pub asset_recipient: String,
    pub amount_smallest_unit: String,
    pub contract_address: Option<String>,
}

/// Configuration row for one indexer worker.
#[derive(Debug, Clone, Queryable, Selectable, Insertable)]
#[diesel(table_name = watched_addresses)]
pub struct WatchedAddress {
    pub address: String,
    pub last_indexed_time: i64,
    pub is_active: bool,
}
