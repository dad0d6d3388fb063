// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// transport errors
    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("read timed out: {0}")]
    Timeout(String),

    #[error("connection closed by peer while a frame was in flight")]
    ConnectionClosed,

    /// protocol and format errors
    #[error("malformed protocol: {0}")]
    MalformedProtocol(String),

    #[error("too large: {0}")]
    TooLarge(String),

    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("checksum mismatch at level {level}: stored {expected}, computed {actual}")]
    Integrity {
        level: i32,
        expected: i64,
        actual: i64,
    },

    /// routing errors
    #[error("no route for {0}")]
    NotFound(String),

    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    /// application errors
    #[error("handler failed: {0}")]
    Handler(String),

    #[error("peer answered {status}: {message}")]
    Remote { status: u16, message: String },

    /// marker error
    #[error("incomplete frame")]
    Incomplete,
}

impl AppError {
    /// Status code sent back when this error is left unhandled by the pipeline.
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::MalformedProtocol(_) | AppError::Xml(_) | AppError::InvalidValue(_) => 400,
            AppError::NotFound(_) => 404,
            AppError::MethodNotAllowed(_) => 405,
            AppError::Timeout(_) => 408,
            AppError::TooLarge(_) => 413,
            AppError::InvalidOperation(_) => 409,
            AppError::Integrity { .. } => 422,
            AppError::Remote { status, .. } => *status,
            _ => 500,
        }
    }

    /// Socket level failures, as opposed to protocol or application errors.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AppError::IoError(_)
                | AppError::DetailedIoError(_)
                | AppError::Timeout(_)
                | AppError::ConnectionClosed
        )
    }
}
