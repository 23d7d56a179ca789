//! Result envelope returned across the request/response boundary.
//!
//! The envelope is always delivered with transport status 200; `code` carries
//! the outcome.

use crate::error::RelayError;
use serde::{Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ResultCode {
    Success = 0,
    ValidationFailed = 1000,
    NotFound = 1001,
    Conflict = 1002,
    LedgerError = 2000,
    Internal = 9000,
}

impl ResultCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }
}

impl Serialize for ResultCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u16(self.as_u16())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub code: ResultCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            code: ResultCode::Success,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            data: None,
            error: Some(message.into()),
        }
    }

    pub fn from_error(err: &RelayError) -> Self {
        Self::failure(err.result_code(), err.to_string())
    }

    pub fn from_result(result: Result<T, RelayError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) => Self::from_error(&err),
        }
    }
}
