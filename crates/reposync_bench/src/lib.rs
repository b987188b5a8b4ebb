//! Benchmark support for reposync.

pub mod utils;
