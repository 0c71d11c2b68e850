//! # Runner Testing Utils
//!
//! Shared testing utilities for the remote runner workspace.
//!
//! - **Mock remote host**: `MockConnector` scripts what a remote host answers to
//!   each command, records everything it was asked to do and can refuse
//!   connections, hang, lose the connection or panic on demand
//! - **Mock store**: `MockTaskStateStore` with failure injection
//! - **Builders**: queue messages and task records with sensible defaults
//! - **Helpers**: polling utilities for asynchronous assertions
//!
//! ```toml
//! [dev-dependencies]
//! runner-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
