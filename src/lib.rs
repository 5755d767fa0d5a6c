//! probetrail - probe report store and query engine.
//!
//! Agents POST health-check reports; the store keeps the latest report per
//! client plus an append-only history, and serves filtered history,
//! anomalies and derived client status.

pub mod config;
pub mod db;
pub mod scheduler;
pub mod web;
