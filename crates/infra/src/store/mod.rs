//! Conversion store boundary.
//!
//! The store exclusively owns conversion records and quota accounts. Two
//! guarantees are part of the contract rather than left to callers:
//!
//! - `create_conversion` checks and consumes quota and inserts the record as
//!   one indivisible step
//! - `update_conversion` / `delete_conversion` apply only while the stored
//!   status equals the caller's expectation, serialising concurrent writers

pub mod in_memory;
pub mod r#trait;

pub use in_memory::{InMemoryConversionStore, QuotaDefaults};
pub use r#trait::{ConversionStore, CreatedConversion, StoreError};
