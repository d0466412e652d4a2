//! Quotagate - Distributed Admission Control
//!
//! This crate decides, for every inbound operation, whether a caller is still
//! within its quota for a category. Counters live in a shared store (Redis)
//! and are updated with a single atomic script per check, so any number of
//! processes can enforce the same quota for the same caller.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
