//! Maintenance tasks around migrations

pub mod cleanup;
pub mod verify;

pub use cleanup::{collect_finished, spawn_cleanup_loop, CleanupReport};
pub use verify::{verify_namespace, VerifyReport};
