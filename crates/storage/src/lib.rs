//! Storage for payplan plans and runs.
//!
//! [`PlanStorage`] is the seam between the operation service and whatever
//! keeps plans and runs. [`MemoryStorage`] is the in-process backend; other
//! backends verify themselves against [`conformance::run_conformance_suite`].

pub mod conformance;
mod error;
mod memory;
mod traits;

pub use error::StorageError;
pub use memory::MemoryStorage;
pub use traits::PlanStorage;
