//! CI test bot for a tap of formulae.
//!
//! A run detects which formulae changed, builds and bottles them, tests
//! them and everything that depends on them, and records every external
//! command as a step in a per-phase report. The architecture keeps a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (diff classification, build
//!   ordering, dependent planning, phase selection, output truncation).
//! - **[`io`]**: Side-effecting adapters (processes, git, `brew`, artifact
//!   storage, the GitHub Actions environment, configuration).
//!
//! Orchestration modules ([`step`], [`report`], [`phases`], [`runner`],
//! [`junit`]) combine the two behind an explicit [`context::RunContext`].

pub mod context;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod junit;
pub mod logging;
pub mod phases;
pub mod report;
pub mod runner;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
