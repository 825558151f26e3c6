//! # airq-ingest
//!
//! Streaming ingestion of air-quality sensor CSV exports into a remote
//! telemetry API.
//!
//! Files are discovered in object storage (S3 or a local directory), parsed
//! row by row without buffering whole files, transformed into canonical
//! payloads, and delivered **exactly once per content**: every row is
//! atomically reserved in a durable store before it is sent, so restarts,
//! overlapping runs, and network failures never produce duplicate deliveries.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌───────────┐   ┌─────────────┐   ┌──────────────┐
//! │  Lister  │──▶│ Downloader │──▶│ Validator │──▶│ Transformer │──▶│Batched Sender│
//! │ S3/local │   │  (stream)  │   │ csv-async │   │ hash + key  │   └──────┬───────┘
//! └──────────┘   └────────────┘   └───────────┘   └─────────────┘          │
//!                                                         ┌────────────────┤
//!                                                         ▼                ▼
//!                                                  ┌────────────┐   ┌────────────┐
//!                                                  │Reservations│   │ Ingest API │
//!                                                  │  (SQLite)  │   │   (HTTP)   │
//!                                                  └────────────┘   └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! airq init                  # create the reservation database
//! airq list                  # candidate files, oldest first
//! airq run --dry-run         # validate + transform, send nothing
//! airq run                   # one polling cycle
//! airq watch                 # poll until Ctrl-C
//! airq stats                 # delivery counters
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`listing`] | Object store seam, candidate listing, fingerprints |
//! | [`storage_s3`] | S3 object store |
//! | [`storage_fs`] | Local directory object store |
//! | [`validate`] | Streaming CSV row validation |
//! | [`transform`] | Payload construction, hashing, idempotency keys |
//! | [`reservation`] | Reservation store contract and implementations |
//! | [`api`] | Remote ingestion API client |
//! | [`sender`] | Batched, backpressured delivery |
//! | [`pipeline`] | Per-file processing and polling cycles |
//! | [`commands`] | `list` / `run` / `watch` entry points |
//! | [`stats`] | Delivery statistics report |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod api;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod listing;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod reservation;
pub mod sender;
pub mod stats;
pub mod storage_fs;
pub mod storage_s3;
pub mod transform;
pub mod validate;
