//! Fetching records from upstream chat sources.
//!
//! [`MessageSource`] is the raw, backward-paging API. [`RetryingFetcher`]
//! layers timeouts, backoff, rate-limit waits and mode-specific paging on top.

pub mod error;
pub mod fetcher;
pub mod http;
pub mod memory;
pub mod retry;
pub mod source;

pub use error::{FetchError, SourceError};
pub use fetcher::{
    FetchOutcome, FetchPlan, Fetched, NoopRetryObserver, RetryObserver, RetryReason, RetryingFetcher,
};
pub use http::HttpMessageSource;
pub use memory::InMemorySource;
pub use retry::{Backoff, RetryPolicy};
pub use source::{FetchDirection, MessageSource};
