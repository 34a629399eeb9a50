// Copyright 2022 The Engula Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    // business errors
    #[error("content {0} not found")]
    ContentNotFound(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("invalid argument {0}")]
    InvalidArgument(String),

    #[error("push copy rejected: {0}")]
    Rejected(String),

    // internal errors
    #[error("request canceled")]
    Canceled,

    #[error("invalid {0} data")]
    InvalidData(String),

    #[error("corrupt {0}")]
    Corrupt(String),

    #[error("role conflict, lease held by machine {0}")]
    RoleConflict(u32),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("io {0}")]
    Io(#[from] std::io::Error),

    // retryable errors
    #[error("transient {0} failure")]
    Transient(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the error is expected to clear on its own by the next
    /// heartbeat, so the caller should retry instead of surfacing it.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Rejections are counted by the copy engine and treated as handled.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Error::Rejected(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Error::Canceled
        } else {
            Error::Transient(format!("join: {err}"))
        }
    }
}
