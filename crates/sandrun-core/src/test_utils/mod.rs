//! Test doubles for the isolation runtime.

pub mod mock_runtime;

pub use mock_runtime::{LogScript, MockRuntime, RuntimeCall};
