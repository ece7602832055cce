//! # kiln-common
//!
//! Shared utilities and types for the Kiln image builder.
//!
//! This crate provides common functionality used across all Kiln crates:
//! - Build IDs and SHA-256 content digests
//! - Standard filesystem paths
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{KilnError, KilnResult, StageFailure, StageFailureCause, ToolError};
pub use id::{BuildId, Digest};
pub use paths::KilnPaths;
