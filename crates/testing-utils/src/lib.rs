//! # Funchost Testing Utils
//!
//! Shared testing utilities for the function host workspace.
//!
//! ## Features
//!
//! - **Mock Worker Process**: an in-memory process handle that can host a scripted worker
//! - **Fake Language Worker**: answers outbound protocol messages on the event bus
//! - **Mock Collaborators**: standby manager and metadata provider doubles
//! - **Test Data Builders**: `FunctionDescriptorBuilder` with sensible defaults
//!
//! ## Usage
//!
//! ```toml
//! [dev-dependencies]
//! funchost-testing-utils = { path = "../testing-utils" }
//! ```
//!
//! ```rust,ignore
//! use funchost_testing_utils::{FakeWorkerBehavior, MockWorkerProcessFactory};
//! ```

pub mod builders;
pub mod fake_worker;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use fake_worker::*;
pub use helpers::*;
pub use mocks::*;
