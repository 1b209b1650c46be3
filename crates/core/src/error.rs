//! Status codes surfaced to the graph framework.

use thiserror::Error;

/// Failure status of a kernel callback or graph operation.
///
/// Every variant maps to a fixed negative status code; success is `0`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Status {
    #[error("invalid type: {0}")]
    InvalidType(String),

    #[error("invalid dimension: {0}")]
    InvalidDimension(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("registration failed: {0}")]
    Registration(String),
}

pub const STATUS_SUCCESS: i32 = 0;

impl Status {
    pub fn code(&self) -> i32 {
        match self {
            Self::Registration(_) => -1,
            Self::NotImplemented(_) => -2,
            Self::NotSupported(_) => -3,
            Self::InvalidParameters(_) => -10,
            Self::InvalidContext(_) => -12,
            Self::InvalidDimension(_) => -15,
            Self::InvalidValue(_) => -16,
            Self::InvalidType(_) => -17,
            Self::InvalidGraph(_) => -18,
        }
    }
}

/// Collapse a callback result into the framework's integer status.
pub fn status_code<T>(result: &Result<T, Status>) -> i32 {
    match result {
        Ok(_) => STATUS_SUCCESS,
        Err(status) => status.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_are_distinct_and_negative() {
        let all = [
            Status::InvalidType(String::new()),
            Status::InvalidDimension(String::new()),
            Status::InvalidValue(String::new()),
            Status::InvalidParameters(String::new()),
            Status::InvalidGraph(String::new()),
            Status::InvalidContext(String::new()),
            Status::NotImplemented(String::new()),
            Status::NotSupported(String::new()),
            Status::Registration(String::new()),
        ];

        let mut codes: Vec<i32> = all.iter().map(Status::code).collect();
        assert!(codes.iter().all(|code| *code < 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn test_status_code_of_result() {
        let ok: Result<(), Status> = Ok(());
        let err: Result<(), Status> = Err(Status::InvalidDimension("rank".to_string()));
        assert_eq!(status_code(&ok), STATUS_SUCCESS);
        assert_eq!(status_code(&err), -15);
        assert_eq!(
            err.unwrap_err().to_string(),
            "invalid dimension: rank"
        );
    }
}
