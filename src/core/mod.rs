//! Core business logic abstractions

pub mod cache;
pub mod clock;
pub mod config;
pub mod log;
pub mod price;

// Re-export main types for cleaner imports
pub use cache::{KeyValueCollection, Store};
pub use clock::{Clock, ManualClock, SystemClock};
pub use price::{
    FetchParams, PriceRecord, PriceResult, PriceSource, Quote, SourceError, SourceErrorKind,
};
