//! Side-effecting adapters: processes, git, the package manager, the
//! filesystem and the CI environment.

pub mod artifacts;
pub mod brew;
pub mod config;
pub mod disk;
pub mod git;
pub mod github;
pub mod process;
pub mod store;
