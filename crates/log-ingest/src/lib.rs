// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log ingestion pipeline sitting between an HTTP boundary and a search backend.
//!
//! ```text
//!   HTTP handler
//!       │
//!       v
//!   ┌─────────────┐
//!   │  Validator  │ (normalize, assign id + sequence)
//!   └──────┬──────┘
//!          │
//!          v
//!   ┌─────────────┐
//!   │ IngestQueue │ (bounded, fail-fast when full)
//!   └──────┬──────┘
//!          │ dequeue_batch
//!          v
//!   ┌─────────────┐
//!   │ BatchWriter │ (N workers, retry + backoff)
//!   └──────┬──────┘
//!          │ bulk_write
//!          v
//!   ┌─────────────┐
//!   │   Backend   │ (Elasticsearch / in-memory)
//!   └─────────────┘
//! ```
//!
//! Admission returns as soon as a record is queued. Durability is confirmed
//! asynchronously through the [`tracker::DeliveryTracker`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod backend;
pub mod config;
pub mod error;
pub mod health;
pub mod http_utils;
pub mod pipeline;
pub mod queue;
pub mod record;
pub mod search;
pub mod server;
pub mod tracker;
pub mod validator;
pub mod writer;
