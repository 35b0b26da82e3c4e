// Copyright (c) Corebridge, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Corebridge: lazy correlation of CORE ledger transfers with EVM
//! transactions.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐        ┌─────────────────────────────┐
//! │  Indexer fleet   │        │        Matcher pool         │
//! │  (one worker per │ writes │  producer + bounded queue   │
//! │  watched address)├───────▶│  + N consumers              │
//! └──────────────────┘PENDING └──────────────┬──────────────┘
//!                                            │ Find()
//!                                            ▼
//!                             ┌─────────────────────────────┐
//!                             │   Finder (anchor-guided     │
//!                             │   interpolation search)     │
//!                             └──────┬───────────────┬──────┘
//!                                    │               │
//!                              anchor index    block fetchers
//!                              (PostgreSQL)   (RPC / object store)
//! ```
//!
//! The shared backoff gate sits in front of every outbound call; a single
//! rate-limit response quiesces the whole process until the deadline.

pub mod anchors;
pub mod assets;
pub mod backoff;
pub mod core_client;
pub mod core_indexer;
pub mod error;
pub mod fetchers;
pub mod finder;
pub mod matcher;
pub mod metrics;
pub mod storage;
