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

    #[error("malformed protocol : {0}")]
    MalformedProtocol(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// transport errors
    #[error("read timed out")]
    Timeout,

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("tls error: {0}")]
    TlsError(String),

    #[error("mismatching protocol header, expected: {expected:?}, received: {received:?}")]
    ProtocolMismatch { expected: Vec<u8>, received: Vec<u8> },

    /// session and link errors
    #[error("maximum number of handles ({0}) has been reached")]
    HandleExhausted(u32),

    #[error("unattached handle: {0}")]
    UnattachedHandle(u32),

    #[error("handle {0} is already in use")]
    HandleInUse(u32),

    #[error("unknown link: {0}")]
    UnknownLink(String),

    #[error("unknown channel: {0}")]
    UnknownChannel(u16),

    #[error("policy violation: {0}")]
    PolicyViolation(String),
}

impl AppError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, AppError::Timeout)
    }

    /// Errors that only concern one session (or one link inside it). The
    /// connection keeps running when a session reports one of these.
    pub fn is_session_scoped(&self) -> bool {
        matches!(
            self,
            AppError::HandleExhausted(_)
                | AppError::UnattachedHandle(_)
                | AppError::HandleInUse(_)
                | AppError::UnknownLink(_)
                | AppError::UnknownChannel(_)
                | AppError::PolicyViolation(_)
        )
    }
}

impl From<rustls::Error> for AppError {
    fn from(value: rustls::Error) -> Self {
        AppError::TlsError(value.to_string())
    }
}
