// Copyright (c) Corebridge, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Database schema for the corebridge correlator.
//!
//! Holds the Diesel table definitions, the row models, and the embedded
//! migrations. The migrations are the schema-verification step: they create
//! the unique indexes on `transfers.core_hash` and `anchor_txs.internal_hash`
//! plus the compound match-tuple index, and a failure to apply them is fatal
//! at startup.

use diesel_migrations::{embed_migrations, EmbeddedMigrations};

pub mod models;
pub mod schema;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");
