// Copyright 2024 The Matrix.org Foundation C.I.C.
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

use pbkdf2::pbkdf2_hmac;
use rand::{distributions::Alphanumeric, thread_rng, Rng, RngCore};
use sha2::Sha512;
use thiserror::Error;
use vodozemac::pk_encryption::{Message, MessageDecodeError, PkDecryption};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::MegolmV1BackupKey;
use crate::types::{BackedUpRoomKey, EncryptedSessionData, MegolmV1AuthData};

/// Error type for the decoding of a recovery key or of a backup public key.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The recovery key doesn't start with the expected prefix.
    #[error("The decoded recovery key has an invalid prefix: expected {0:?}, got {1:?}")]
    Prefix([u8; 2], [u8; 2]),
    /// The parity byte of the recovery key is wrong, the key contains a typo.
    #[error("The parity byte of the recovery key doesn't match: expected {0:?}, got {1:?}")]
    Parity(u8, u8),
    /// The recovery key decodes to the wrong number of bytes.
    #[error("The decoded recovery key has a invalid length: expected {0}, got {1}")]
    Length(usize, usize),
    /// The recovery key isn't valid base58.
    #[error(transparent)]
    Base58(#[from] bs58::decode::Error),
    /// The public key isn't a valid Curve25519 key.
    #[error(transparent)]
    PublicKey(#[from] vodozemac::KeyError),
}

/// Error type for the decryption of a backed up room key.
#[derive(Debug, Error)]
pub enum DecryptionError {
    /// The encrypted session data isn't valid base64 or contains an invalid
    /// ephemeral key.
    #[error(transparent)]
    Message(#[from] MessageDecodeError),
    /// The MAC of the ciphertext didn't match, or the ciphertext couldn't be
    /// decrypted.
    #[error(transparent)]
    Decryption(#[from] vodozemac::pk_encryption::Error),
    /// The plaintext isn't a valid room key.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// The private part of a backup key.
///
/// The key is presented to the user as a recovery key, a base58 encoded
/// string split into groups of four characters, or derived from a passphrase.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct BackupDecryptionKey {
    inner: Box<[u8; BackupDecryptionKey::KEY_SIZE]>,
}

impl std::fmt::Debug for BackupDecryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BackupDecryptionKey").field(&"*****").finish()
    }
}

impl Clone for BackupDecryptionKey {
    fn clone(&self) -> Self {
        Self::from_bytes(&self.inner)
    }
}

impl std::fmt::Display for BackupDecryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let string = Zeroizing::new(self.to_base58());

        let string = Zeroizing::new(
            string
                .chars()
                .collect::<Vec<char>>()
                .chunks(Self::DISPLAY_CHUNK_SIZE)
                .map(|c| c.iter().collect::<String>())
                .collect::<Vec<_>>()
                .join(" "),
        );

        write!(f, "{}", string.as_str())
    }
}

impl BackupDecryptionKey {
    /// The number of bytes the decryption key has.
    pub const KEY_SIZE: usize = 32;

    const PREFIX: [u8; 2] = [0x8b, 0x01];
    const PREFIX_PARITY: u8 = Self::PREFIX[0] ^ Self::PREFIX[1];
    const DISPLAY_CHUNK_SIZE: usize = 4;
    const SALT_SIZE: usize = 32;

    fn parity_byte(bytes: &[u8]) -> u8 {
        bytes.iter().fold(Self::PREFIX_PARITY, |acc, x| acc ^ x)
    }

    /// Create a new random decryption key.
    pub fn new() -> Self {
        let mut key = Box::new([0u8; Self::KEY_SIZE]);
        thread_rng().fill_bytes(key.as_mut_slice());

        Self { inner: key }
    }

    /// Create a decryption key from the raw bytes of a Curve25519 private key.
    pub fn from_bytes(key: &[u8; Self::KEY_SIZE]) -> Self {
        Self { inner: Box::new(*key) }
    }

    /// Derive a decryption key from a passphrase.
    ///
    /// The same passphrase, salt and iteration count always produce the same
    /// key.
    pub fn from_passphrase(passphrase: &str, salt: &str, rounds: u32) -> Self {
        let mut key = Box::new([0u8; Self::KEY_SIZE]);
        pbkdf2_hmac::<Sha512>(passphrase.as_bytes(), salt.as_bytes(), rounds, key.as_mut_slice());

        Self { inner: key }
    }

    /// Generate a random alphanumeric salt for a new passphrase derived key.
    pub fn generate_salt() -> String {
        thread_rng().sample_iter(&Alphanumeric).take(Self::SALT_SIZE).map(char::from).collect()
    }

    /// Try to decode a recovery key.
    ///
    /// Whitespace is ignored, so both the display form and the plain base58
    /// form are accepted.
    pub fn from_base58(value: &str) -> Result<Self, DecodeError> {
        // Remove any whitespace we might have
        let value: String = value.chars().filter(|c| !c.is_whitespace()).collect();

        let decoded = Zeroizing::new(
            bs58::decode(value).with_alphabet(bs58::Alphabet::BITCOIN).into_vec()?,
        );

        let expected_length = Self::PREFIX.len() + Self::KEY_SIZE + 1;

        if decoded.len() != expected_length {
            return Err(DecodeError::Length(expected_length, decoded.len()));
        }

        let (prefix, rest) = decoded.split_at(Self::PREFIX.len());
        let (key, expected_parity) = rest.split_at(Self::KEY_SIZE);

        let prefix = [prefix[0], prefix[1]];
        let expected_parity = expected_parity[0];
        let parity = Self::parity_byte(key);

        if prefix != Self::PREFIX {
            Err(DecodeError::Prefix(Self::PREFIX, prefix))
        } else if expected_parity != parity {
            Err(DecodeError::Parity(expected_parity, parity))
        } else {
            let mut inner = Box::new([0u8; Self::KEY_SIZE]);
            inner.copy_from_slice(key);

            Ok(Self { inner })
        }
    }

    /// Encode the key as a recovery key, without any whitespace.
    pub fn to_base58(&self) -> String {
        let bytes = Zeroizing::new(
            [
                Self::PREFIX.as_ref(),
                self.inner.as_ref(),
                [Self::parity_byte(self.inner.as_ref())].as_ref(),
            ]
            .concat(),
        );

        bs58::encode(bytes.as_slice()).with_alphabet(bs58::Alphabet::BITCOIN).into_string()
    }

    fn get_pk_decryption(&self) -> PkDecryption {
        PkDecryption::from_key(vodozemac::Curve25519SecretKey::from_slice(&self.inner))
    }

    /// Get the public key that matches this decryption key.
    pub fn megolm_v1_public_key(&self) -> MegolmV1BackupKey {
        MegolmV1BackupKey::new(self.get_pk_decryption().public_key(), None)
    }

    /// Does this decryption key belong to the backup with the given auth
    /// data.
    pub fn backup_key_matches(&self, auth_data: &MegolmV1AuthData) -> bool {
        self.get_pk_decryption().public_key() == auth_data.public_key
    }

    /// Decrypt the payload of a backed up room key.
    pub fn decrypt_session_data(
        &self,
        session_data: &EncryptedSessionData,
    ) -> Result<Zeroizing<Vec<u8>>, DecryptionError> {
        let message = Message::from_base64(
            &session_data.ciphertext,
            &session_data.mac,
            &session_data.ephemeral,
        )?;

        Ok(Zeroizing::new(self.get_pk_decryption().decrypt(&message)?))
    }

    /// Decrypt a backed up room key.
    pub fn decrypt_room_key(
        &self,
        session_data: &EncryptedSessionData,
    ) -> Result<BackedUpRoomKey, DecryptionError> {
        let plaintext = self.decrypt_session_data(session_data)?;

        Ok(serde_json::from_slice(&plaintext)?)
    }
}

impl Default for BackupDecryptionKey {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    use super::{BackupDecryptionKey, DecodeError};

    const TEST_KEY: [u8; 32] = [
        0x77, 0x07, 0x6D, 0x0A, 0x73, 0x18, 0xA5, 0x7D, 0x3C, 0x16, 0xC1, 0x72, 0x51, 0xB2, 0x66,
        0x45, 0xDF, 0x4C, 0x2F, 0x87, 0xEB, 0xC0, 0x99, 0x2A, 0xB1, 0x77, 0xFB, 0xA5, 0x1D, 0xB9,
        0x2C, 0x2A,
    ];

    #[test]
    fn base58_encoding() {
        let key = BackupDecryptionKey::from_bytes(&TEST_KEY);

        let base58 = key.to_base58();
        assert!(base58.starts_with("Es"));

        let decoded = BackupDecryptionKey::from_base58(&base58).unwrap();
        assert_eq!(decoded.inner, key.inner);

        let display = key.to_string();
        assert_eq!(display.replace(' ', ""), base58);
        assert!(display.split(' ').all(|chunk| chunk.len() <= 4));

        let decoded = BackupDecryptionKey::from_base58(&display).unwrap();
        assert_eq!(decoded.to_base58(), base58);
    }

    #[test]
    fn invalid_recovery_keys() {
        let base58 = BackupDecryptionKey::from_bytes(&TEST_KEY).to_base58();

        let mut bytes = bs58::decode(&base58).into_vec().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let wrong_parity = bs58::encode(&bytes).into_string();

        assert_matches!(
            BackupDecryptionKey::from_base58(&wrong_parity),
            Err(DecodeError::Parity(..))
        );

        bytes[last] ^= 0xff;
        bytes[0] = 0x00;
        let wrong_prefix = bs58::encode(&bytes).into_string();

        assert_matches!(
            BackupDecryptionKey::from_base58(&wrong_prefix),
            Err(DecodeError::Prefix(..))
        );

        assert_matches!(
            BackupDecryptionKey::from_base58(&base58[..20]),
            Err(DecodeError::Length(35, _))
        );
        assert_matches!(BackupDecryptionKey::from_base58("0OIl"), Err(DecodeError::Base58(_)));
    }

    #[test]
    fn passphrase_derivation_is_deterministic() {
        let salt = BackupDecryptionKey::generate_salt();
        assert_eq!(salt.len(), 32);
        assert!(salt.chars().all(|c| c.is_ascii_alphanumeric()));

        let passphrase = "It's a secret to everybody";

        let first = BackupDecryptionKey::from_passphrase(passphrase, &salt, 1000);
        let second = BackupDecryptionKey::from_passphrase(passphrase, &salt, 1000);
        let other_salt = BackupDecryptionKey::from_passphrase(passphrase, "salt", 1000);
        let other_rounds = BackupDecryptionKey::from_passphrase(passphrase, &salt, 999);

        assert_eq!(first.to_base58(), second.to_base58());
        assert_ne!(first.to_base58(), other_salt.to_base58());
        assert_ne!(first.to_base58(), other_rounds.to_base58());
        assert_eq!(
            first.megolm_v1_public_key().public_key(),
            second.megolm_v1_public_key().public_key()
        );
    }

    #[test]
    fn debug_hides_the_key() {
        let key = BackupDecryptionKey::from_bytes(&TEST_KEY);
        let debug = format!("{key:?}");

        assert_eq!(debug, r#"BackupDecryptionKey("*****")"#);
    }

    proptest! {
        #[test]
        fn recovery_key_decoding(bytes in prop::array::uniform32(any::<u8>())) {
            let key = BackupDecryptionKey::from_bytes(&bytes);
            let decoded = BackupDecryptionKey::from_base58(&key.to_string()).unwrap();

            prop_assert_eq!(decoded.inner.as_ref(), &bytes);
        }
    }
}
