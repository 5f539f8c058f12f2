//! Secure media transform for the STUN relay agent
//!
//! Implements the RFC 3711 default protection profile
//! (AES_CM_128_HMAC_SHA1_80) for RTP and RTCP:
//! - Session key derivation from a master key and salt
//! - In-place protect/unprotect of RTP and RTCP packets
//! - Per-SSRC rollover counter and SRTCP index tracking
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


pub mod error;
pub mod keys;
pub mod rtcp;
pub mod rtp;
pub mod session;

pub use error::{SrtpError, SrtpResult};
pub use keys::MasterKey;
pub use session::SrtpSession;

use aes::cipher::{KeyIvInit, StreamCipher};
use keys::{Aes128Ctr, SessionKeys};

/// Run the RFC 3711 Appendix B known-answer tests.
///
/// Called once at start-up; a failure means the cipher backend cannot be
/// trusted and the process must not relay encrypted media.
pub fn self_test() -> SrtpResult<()> {
    // B.2 AES-CM keystream
    let session_key = hex_array::<16>("2B7E151628AED2A6ABF7158809CF4F3C")?;
    let iv = hex_array::<16>("F0F1F2F3F4F5F6F7F8F9FAFBFCFD0000")?;
    let mut keystream = [0u8; 48];
    let mut cipher = Aes128Ctr::new((&session_key).into(), (&iv).into());
    cipher.apply_keystream(&mut keystream);
    expect(
        &keystream,
        "e03ead0935c95e80e166b16dd92b4eb4d23513162b02d0f72a43a2fe4a5f97ab\
         41e95b3bb0a2e8dd477901e4fca894c0",
        "AES-CM keystream",
    )?;

    // B.3 key derivation
    let master = MasterKey::from_hex(
        "E1F97A0D3E018BE0D64FA32C06DE41390EC675AD498AFEEBB6960B3AABE6",
    )?;
    let keys = SessionKeys::for_rtp(&master);
    expect(&keys.cipher_key, "c61e7a93744f39ee10734afe3ff7a087", "cipher key")?;
    expect(&keys.cipher_salt, "30cbbc08863d8c85d49db34a9ae1", "cipher salt")?;
    expect(
        &keys.auth_key,
        "cebe321f6ff7716b6fd4ab49af256a156d38baa4",
        "auth key",
    )?;

    Ok(())
}

fn hex_array<const N: usize>(encoded: &str) -> SrtpResult<[u8; N]> {
    let raw = hex::decode(encoded).map_err(|e| SrtpError::SelfTestFailed(e.to_string()))?;
    raw.try_into()
        .map_err(|_| SrtpError::SelfTestFailed("vector length".to_string()))
}

fn expect(actual: &[u8], expected: &str, what: &str) -> SrtpResult<()> {
    if hex::encode(actual) == expected {
        Ok(())
    } else {
        Err(SrtpError::SelfTestFailed(format!("{} mismatch", what)))
    }
}
