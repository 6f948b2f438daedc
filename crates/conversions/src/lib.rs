//! `fitswap-conversions`: the conversion domain model.
//!
//! A conversion composites a garment image onto a user photo. This crate holds
//! the record, its status lifecycle and transition rules, quota accounting and
//! listing types. Everything here is pure: no IO, no clocks except the `now`
//! values callers pass in.

pub mod query;
pub mod quota;
pub mod record;

pub use query::{ConversionFilter, ConversionPage, Pagination};
pub use quota::{BillingPeriod, QuotaAccount, QuotaState, QuotaUnit};
pub use record::{
    CANCELLED_MESSAGE, ConversionRecord, ConversionStatus, ConversionStatusView,
    ConversionTransition, ConversionUpdate, IllegalTransition, NewConversion,
};
