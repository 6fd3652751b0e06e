//! Account pool - rotation, rate limiting and session reuse across sending accounts

mod account;
mod manager;

pub use account::{AccountSnapshot, Availability, RateLimitedAccount};
pub use manager::{AccountLease, AccountPool, SessionHandle};
