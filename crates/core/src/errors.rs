use thiserror::Error;

/// Failures surfaced to a channel adapter at the HTTP edge. Internal detail
/// stays in logs; adapters get the class, a status and a stable message.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("unprocessable event: {0}")]
    Unprocessable(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

impl InterfaceError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unauthorized(_) => 401,
            Self::Malformed(_) => 400,
            Self::Unprocessable(_) => 422,
            Self::Unavailable(_) => 503,
        }
    }

    pub fn error_class(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Malformed(_) => "malformed",
            Self::Unprocessable(_) => "unprocessable",
            Self::Unavailable(_) => "unavailable",
        }
    }

    /// Safe to return to the caller. Only validation messages pass through.
    pub fn user_message(&self) -> String {
        match self {
            Self::Unauthorized(_) => "The request signature could not be verified.".to_string(),
            Self::Malformed(_) => "The request body is not a valid inbound envelope.".to_string(),
            Self::Unprocessable(detail) => detail.clone(),
            Self::Unavailable(_) => {
                "The event could not be recorded. Please retry shortly.".to_string()
            }
        }
    }

    /// Adapters should redeliver only when this is true.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use crate::errors::InterfaceError;

    #[test]
    fn only_unavailable_is_retryable() {
        assert!(InterfaceError::Unavailable("database is locked".to_owned()).is_retryable());
        assert!(!InterfaceError::Unauthorized("bad mac".to_owned()).is_retryable());
        assert!(!InterfaceError::Unprocessable("empty text".to_owned()).is_retryable());
    }

    #[test]
    fn internal_detail_is_not_exposed() {
        let error = InterfaceError::Unavailable("database is locked".to_owned());
        assert_eq!(error.status_code(), 503);
        assert!(!error.user_message().contains("locked"));

        let invalid = InterfaceError::Unprocessable("missing field `sender`".to_owned());
        assert_eq!(invalid.status_code(), 422);
        assert_eq!(invalid.user_message(), "missing field `sender`");
    }
}
