//! Error types for Outreach

use thiserror::Error;

/// Main error type for Outreach
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No sending accounts configured")]
    NoAccounts,

    #[error("All {0} sending accounts are deactivated")]
    AllAccountsDeactivated(usize),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for Outreach
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NoAccounts => "NO_ACCOUNTS",
            Error::AllAccountsDeactivated(_) => "ACCOUNTS_DEACTIVATED",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::NoAccounts.code(), "NO_ACCOUNTS");
        assert_eq!(Error::Config("x".into()).code(), "CONFIG_ERROR");
        assert_eq!(Error::Validation("x".into()).code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::AllAccountsDeactivated(2).to_string(),
            "All 2 sending accounts are deactivated"
        );
    }
}
