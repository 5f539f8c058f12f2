//! Error types for the SRTP transform
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

/// Result type for SRTP operations
pub type SrtpResult<T> = Result<T, SrtpError>;

/// Errors produced while protecting or unprotecting packets
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SrtpError {
    /// Master key material could not be decoded
    #[error("Invalid master key: {0}")]
    InvalidKey(String),

    /// Packet is shorter than the fixed header plus authentication tag
    #[error("Packet too short: {0} bytes")]
    PacketTooShort(usize),

    /// RTP/RTCP header is inconsistent with the packet length
    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    /// Authentication tag did not verify
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Known-answer test mismatch
    #[error("Self test failed: {0}")]
    SelfTestFailed(String),
}
