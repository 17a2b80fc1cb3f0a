//! Errors raised while validating the shared configuration.

use thiserror::Error;

/// Result type alias using the configuration error type.
pub type Result<T> = std::result::Result<T, Error>;

/// A configuration value the services cannot run with.
#[derive(Error, Debug)]
pub enum Error {
    /// Setting outside its accepted range
    #[error("invalid setting {section}.{field}: {reason}")]
    InvalidSetting {
        section: &'static str,
        field: &'static str,
        reason: String,
    },
}

impl Error {
    pub fn invalid(section: &'static str, field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            section,
            field,
            reason: reason.into(),
        }
    }

    /// Name of the offending setting.
    pub fn field(&self) -> &'static str {
        match self {
            Self::InvalidSetting { field, .. } => field,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_setting_message() {
        let err = Error::invalid("portfolio", "buy_margin", "must not be negative, got -1");
        assert_eq!(err.field(), "buy_margin");
        assert_eq!(
            err.to_string(),
            "invalid setting portfolio.buy_margin: must not be negative, got -1"
        );
    }
}
