//! Deterministic, pure logic shared by the test bot.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod diff;
pub mod graph;
pub mod ordering;
pub mod plan;
pub mod schedule;
pub mod truncate;
pub mod types;
