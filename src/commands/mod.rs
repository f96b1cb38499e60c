//! CLI command implementations.
//!
//! Each submodule implements an lnfly-backend CLI command with pure core
//! logic separated from IO for testability.

pub mod clear_storage;
pub mod register;
pub mod serve;
pub mod status;
