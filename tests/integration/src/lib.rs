//! Integration tests for the federation execution coordinator
//!
//! This test suite validates:
//! - Attribute ownership transfer scenarios and exclusivity under contention
//! - Time management grants, LITS handling and causality
//! - Federation save/restore, including buffering and round trips into a
//!   fresh execution
//! - Synchronization points and the request/response protocol

pub mod test_utils;

#[cfg(test)]
mod ownership_tests;

#[cfg(test)]
mod time_tests;

#[cfg(test)]
mod save_restore_tests;

#[cfg(test)]
mod sync_tests;
