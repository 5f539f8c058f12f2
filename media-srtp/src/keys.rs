//! Master key handling and RFC 3711 session key derivation
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


use crate::error::{SrtpError, SrtpResult};
use aes::cipher::{KeyIvInit, StreamCipher};

pub(crate) type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// Master key length (AES-128)
pub const MASTER_KEY_LEN: usize = 16;
/// Master salt length
pub const MASTER_SALT_LEN: usize = 14;
/// Session authentication key length (HMAC-SHA1)
pub const AUTH_KEY_LEN: usize = 20;

const LABEL_RTP_ENCRYPTION: u8 = 0x00;
const LABEL_RTP_AUTH: u8 = 0x01;
const LABEL_RTP_SALT: u8 = 0x02;
const LABEL_RTCP_ENCRYPTION: u8 = 0x03;
const LABEL_RTCP_AUTH: u8 = 0x04;
const LABEL_RTCP_SALT: u8 = 0x05;

/// Master key and salt as exchanged out of band
#[derive(Clone, PartialEq, Eq)]
pub struct MasterKey {
    /// Master key (16 bytes)
    pub key: [u8; MASTER_KEY_LEN],
    /// Master salt (14 bytes)
    pub salt: [u8; MASTER_SALT_LEN],
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("key", &"[REDACTED]")
            .field("salt", &"[REDACTED]")
            .finish()
    }
}

impl MasterKey {
    /// Decode a key given as 60 hex digits: key followed by salt
    pub fn from_hex(encoded: &str) -> SrtpResult<Self> {
        let expected = (MASTER_KEY_LEN + MASTER_SALT_LEN) * 2;
        if encoded.len() != expected {
            return Err(SrtpError::InvalidKey(format!(
                "expected {} hexadecimal digits, found {}",
                expected,
                encoded.len()
            )));
        }

        let raw = hex::decode(encoded)
            .map_err(|e| SrtpError::InvalidKey(format!("not hexadecimal: {}", e)))?;

        let mut key = [0u8; MASTER_KEY_LEN];
        let mut salt = [0u8; MASTER_SALT_LEN];
        key.copy_from_slice(&raw[..MASTER_KEY_LEN]);
        salt.copy_from_slice(&raw[MASTER_KEY_LEN..]);

        Ok(MasterKey { key, salt })
    }
}

/// Keys derived for one direction-independent protocol (SRTP or SRTCP)
#[derive(Clone)]
pub(crate) struct SessionKeys {
    pub(crate) cipher_key: [u8; MASTER_KEY_LEN],
    pub(crate) cipher_salt: [u8; MASTER_SALT_LEN],
    pub(crate) auth_key: [u8; AUTH_KEY_LEN],
}

impl SessionKeys {
    pub(crate) fn for_rtp(master: &MasterKey) -> Self {
        Self::derive(master, LABEL_RTP_ENCRYPTION, LABEL_RTP_AUTH, LABEL_RTP_SALT)
    }

    pub(crate) fn for_rtcp(master: &MasterKey) -> Self {
        Self::derive(master, LABEL_RTCP_ENCRYPTION, LABEL_RTCP_AUTH, LABEL_RTCP_SALT)
    }

    fn derive(master: &MasterKey, enc: u8, auth: u8, salt: u8) -> Self {
        let mut cipher_key = [0u8; MASTER_KEY_LEN];
        let mut auth_key = [0u8; AUTH_KEY_LEN];
        let mut cipher_salt = [0u8; MASTER_SALT_LEN];

        derive_into(master, enc, &mut cipher_key);
        derive_into(master, auth, &mut auth_key);
        derive_into(master, salt, &mut cipher_salt);

        SessionKeys {
            cipher_key,
            cipher_salt,
            auth_key,
        }
    }

    /// Apply the AES-CM keystream for `ssrc`/`index` to `data`
    pub(crate) fn apply_keystream(&self, ssrc: u32, index: u64, data: &mut [u8]) {
        let iv = packet_iv(&self.cipher_salt, ssrc, index);
        let mut cipher = Aes128Ctr::new((&self.cipher_key).into(), (&iv).into());
        cipher.apply_keystream(data);
    }
}

/// AES-CM PRF with key derivation rate 0: x = label << 48 XOR master_salt
fn derive_into(master: &MasterKey, label: u8, out: &mut [u8]) {
    let mut iv = [0u8; 16];
    iv[..MASTER_SALT_LEN].copy_from_slice(&master.salt);
    iv[7] ^= label;

    out.fill(0);
    let mut cipher = Aes128Ctr::new((&master.key).into(), (&iv).into());
    cipher.apply_keystream(out);
}

/// IV = (salt * 2^16) XOR (SSRC * 2^64) XOR (index * 2^16)
pub(crate) fn packet_iv(salt: &[u8; MASTER_SALT_LEN], ssrc: u32, index: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..MASTER_SALT_LEN].copy_from_slice(salt);

    ssrc.to_be_bytes()
        .iter()
        .zip(&mut iv[4..8])
        .for_each(|(src, dst)| *dst ^= src);

    index.to_be_bytes()[2..]
        .iter()
        .zip(&mut iv[8..14])
        .for_each(|(src, dst)| *dst ^= src);

    iv
}
