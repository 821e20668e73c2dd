//! Cooperative cancellation and guaranteed cleanup.
//!
//! This module provides:
//! - CancellationToken for cooperative cancellation
//! - CleanupManager for exactly-once LIFO cleanup execution

mod cleanup;
mod token;

pub use cleanup::{
    CleanupAction, CleanupFailure, CleanupFuture, CleanupHandle, CleanupManager, CleanupSummary,
};
pub use token::CancellationToken;
