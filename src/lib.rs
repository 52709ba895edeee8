//! TRADECAST Signal Executor Library
//!
//! Core components for fanning one trading signal out across many tenant
//! accounts, with plan gating, position tracking, reconciliation, and
//! deferred settlement.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
pub mod rate_limit;
