//! Policy engine: how failed requests are retried.
//!
//! ```text
//! failure → RetryStrategy::Now    → re-issue in the caller's task (bounded)
//!         → RetryStrategy::Queued → wait on the SingleFlight recovery, then re-issue
//!         → no strategy           → surface to the caller
//! ```
//!
//! [`RetryPolicy`] provides the exponential backoff used between attempts of
//! transport retries, re-follows and load-shedding waits.

pub mod retry;
pub mod single_flight;

pub use retry::{RetryConfig, RetryPolicy, RetryStrategy};
pub use single_flight::SingleFlight;
