//! Middleware for observability.
//!
//! Request logging with latency tracking, matching the online ranking
//! engine's own `{cust_no, status, duration_ms}` summary line (§6).

pub mod logging;

pub use logging::request_logging;
