//! Secure media transform applied by streams
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


use crate::error::RelayResult;
use media_srtp::SrtpSession;

/// Direction in which a stream applies its transform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransformMode {
    /// Forward packets untouched
    #[default]
    None,
    /// RTP -> SRTP
    Encrypt,
    /// SRTP -> RTP
    Decrypt,
}

/// In-place packet protection.
///
/// Implementations must leave the buffer untouched when they fail.
pub trait SecureTransform: Send + Sync {
    fn protect_rtp(&mut self, packet: &mut Vec<u8>) -> RelayResult<()>;
    fn unprotect_rtp(&mut self, packet: &mut Vec<u8>) -> RelayResult<()>;
    fn protect_rtcp(&mut self, packet: &mut Vec<u8>) -> RelayResult<()>;
    fn unprotect_rtcp(&mut self, packet: &mut Vec<u8>) -> RelayResult<()>;
}

impl SecureTransform for SrtpSession {
    fn protect_rtp(&mut self, packet: &mut Vec<u8>) -> RelayResult<()> {
        Ok(SrtpSession::protect_rtp(self, packet)?)
    }

    fn unprotect_rtp(&mut self, packet: &mut Vec<u8>) -> RelayResult<()> {
        Ok(SrtpSession::unprotect_rtp(self, packet)?)
    }

    fn protect_rtcp(&mut self, packet: &mut Vec<u8>) -> RelayResult<()> {
        Ok(SrtpSession::protect_rtcp(self, packet)?)
    }

    fn unprotect_rtcp(&mut self, packet: &mut Vec<u8>) -> RelayResult<()> {
        Ok(SrtpSession::unprotect_rtcp(self, packet)?)
    }
}

/// Build the transform for a 60 hex digit key
pub fn srtp_transform(key: &str) -> RelayResult<Box<dyn SecureTransform>> {
    Ok(Box::new(SrtpSession::from_hex_key(key)?))
}
