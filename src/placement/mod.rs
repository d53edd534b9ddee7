//! Placement & Replication Module
//!
//! Decides where block bytes live and moves them there.
//!
//! ## Core Concepts
//! - **Two placements per block**: exactly one original and one replica, on
//!   distinct online nodes. With a single replica, a failed host is never
//!   "repaired" by eviction; offline stays soft.
//! - **Ranking**: candidates are ordered by free bytes descending, lowest
//!   label on ties, with the working free-byte view decremented as blocks
//!   are booked. Rankings are recomputed per upload from the registry.
//! - **Rollback**: any block that cannot be placed twice aborts the whole
//!   upload and deletes what was already shipped.
//! - **Pending deletes**: hosts that are offline when their file is deleted
//!   owe a `BLOCK_DELETE`, settled when their heartbeat returns.

pub mod engine;
pub mod planner;
