//! Utilities for integration tests.
//!
//! The `test-util` crate provides a scriptable in-process engine that
//! implements the Hydrogen engine capability traits, plus fixtures for
//! building migration source trees and database descriptors. It is used by
//! integration tests in the main crate.

mod fixtures;
mod scripted;

pub use fixtures::{
    memory_descriptor, sqlite_file_descriptor, write_basic_migrations, write_single_migration,
};
pub use scripted::{HoldHandle, MockEvent, ScriptedEngine};
