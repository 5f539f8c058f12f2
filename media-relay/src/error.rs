//! Error types for the media relay
// Copyright 2025 Francisco F. Pinochet
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


use thiserror::Error;

/// Media relay error
#[derive(Debug, Error)]
pub enum RelayError {
    /// STUN message could not be parsed
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// No port in the requested range could be bound
    #[error("Port unavailable: {0}")]
    PortUnavailable(String),

    /// Command referenced a connection or point that does not exist
    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    /// Secure transform rejected a packet
    #[error("Crypto failure: {0}")]
    CryptoFailure(String),

    /// Control channel line without a usable type
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Port range specification could not be parsed
    #[error("Invalid port range: {0}")]
    InvalidRange(String),

    /// Missing or unparsable command argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Point id already registered
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Network error
    #[error("Network error: {0}")]
    NetworkError(String),
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        RelayError::NetworkError(err.to_string())
    }
}

impl From<media_srtp::SrtpError> for RelayError {
    fn from(err: media_srtp::SrtpError) -> Self {
        RelayError::CryptoFailure(err.to_string())
    }
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;
