//! Testing utilities for harmonflow pipelines and operations.
//!
//! This module provides:
//! - Mock operations
//! - A pipeline fixture that runs in isolation from the process environment
//! - Assertions on pipeline outcomes

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_completed, assert_failed_at, assert_failure_kind, assert_no_markers,
    assert_provenance_sources,
};
pub use fixtures::PipelineFixture;
pub use mocks::{FailingOperation, RecordedInvocation, RecordingOperation, SlowOperation};
