//! Ambient HTTP observability.
//!
//! The broadcast-side rate limiting (`MAX_BROADCAST_TPS`) lives in
//! [`crate::price_hub`] — it throttles WS pushes, not HTTP requests, so it
//! isn't `tower` middleware. This module only carries request logging.

pub mod logging;

pub use logging::{request_logging, request_logging_simple};
