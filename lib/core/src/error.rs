//! Error handling foundation.
//!
//! Only the `Result` alias lives here. Each crate defines its own domain
//! error enums and wraps them in a [`Report`] at its public boundary,
//! adding context with `.context()` as errors travel upwards.

use rootcause::Report;

/// A Result type alias using rootcause's Report for error handling.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;
