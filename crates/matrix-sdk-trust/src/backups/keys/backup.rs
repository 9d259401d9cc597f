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

use std::sync::Arc;

use vodozemac::{pk_encryption::PkEncryption, Curve25519PublicKey};
use zeroize::Zeroizing;

use super::DecodeError;
use crate::{
    olm::InboundGroupSession,
    types::{EncryptedSessionData, KeyBackupData, MegolmV1AuthData, MEGOLM_BACKUP_V1},
    utilities::StdMutex,
};

#[derive(Debug)]
struct InnerBackupKey {
    key: Curve25519PublicKey,
    version: StdMutex<Option<String>>,
}

/// The public part of a backup key.
#[derive(Clone)]
pub struct MegolmV1BackupKey {
    inner: Arc<InnerBackupKey>,
}

#[cfg(not(tarpaulin_include))]
impl std::fmt::Debug for MegolmV1BackupKey {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("MegolmV1BackupKey")
            .field("key", &self.to_base64())
            .field("version", &self.backup_version())
            .finish()
    }
}

impl MegolmV1BackupKey {
    pub(crate) fn new(key: Curve25519PublicKey, version: Option<String>) -> Self {
        Self { inner: InnerBackupKey { key, version: StdMutex::new(version) }.into() }
    }

    /// Get the full name of the backup algorithm this backup key supports.
    pub fn backup_algorithm(&self) -> &str {
        MEGOLM_BACKUP_V1
    }

    /// Try to create a new `MegolmV1BackupKey` from a base 64 encoded string.
    pub fn from_base64(public_key: &str) -> Result<Self, DecodeError> {
        let key = Curve25519PublicKey::from_base64(public_key)?;

        Ok(Self::new(key, None))
    }

    /// Convert the [`MegolmV1BackupKey`] to a base 64 encoded string.
    pub fn to_base64(&self) -> String {
        self.inner.key.to_base64()
    }

    /// The Curve25519 key room keys get encrypted with.
    pub fn public_key(&self) -> Curve25519PublicKey {
        self.inner.key
    }

    /// Does this key belong to the given backup auth data.
    pub fn matches(&self, auth_data: &MegolmV1AuthData) -> bool {
        self.inner.key == auth_data.public_key
    }

    /// Get the backup version that this key is used with, if any.
    pub fn backup_version(&self) -> Option<String> {
        self.inner.version.lock().clone()
    }

    /// Set the backup version that this `MegolmV1BackupKey` will be used with.
    pub fn set_version(&self, version: String) {
        *self.inner.version.lock() = Some(version);
    }

    /// Encrypt the given session so it can be uploaded to the backup.
    pub(crate) fn encrypt(
        &self,
        session: &InboundGroupSession,
    ) -> Result<KeyBackupData, serde_json::Error> {
        let pk = PkEncryption::from_key(self.inner.key);

        // The forwarding chains don't mean much, we only care whether we received the
        // session directly from the creator of the session or not.
        let forwarded_count = session.has_been_imported().into();
        let first_message_index = session.first_known_index();

        // Convert our key to the backup representation.
        let key = session.to_backup();

        // The key gets zeroized in `BackedUpRoomKey` but we're creating a copy
        // here that won't, so let's wrap it up in a `Zeroizing` struct.
        let key = Zeroizing::new(serde_json::to_vec(&key)?);

        let message = pk.encrypt(&key);

        Ok(KeyBackupData {
            first_message_index,
            forwarded_count,
            is_verified: session.sender_verified(),
            session_data: EncryptedSessionData {
                ephemeral: message.ephemeral_key.to_base64(),
                ciphertext: vodozemac::base64_encode(message.ciphertext),
                mac: vodozemac::base64_encode(message.mac),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use ruma::room_id;

    use super::MegolmV1BackupKey;
    use crate::{backups::keys::BackupDecryptionKey, olm::testing::inbound_group_session};

    #[test]
    fn encrypted_room_key_keeps_its_metadata() {
        let decryption_key = BackupDecryptionKey::new();
        let backup_key = decryption_key.megolm_v1_public_key();
        let session = inbound_group_session(room_id!("!test:localhost"));

        let data = backup_key.encrypt(&session).unwrap();

        assert_eq!(data.first_message_index, 0);
        assert_eq!(data.forwarded_count, 0);
        assert!(data.is_verified);
        assert!(!data.session_data.ciphertext.contains(&session.to_backup().session_key));

        let decrypted = decryption_key.decrypt_room_key(&data.session_data).unwrap();
        let exported = session.to_backup();

        assert_eq!(decrypted.algorithm, exported.algorithm);
        assert_eq!(decrypted.sender_key, exported.sender_key);
        assert_eq!(decrypted.session_key, exported.session_key);
        assert_eq!(decrypted.sender_claimed_keys, exported.sender_claimed_keys);
        assert_eq!(
            decrypted.forwarding_curve25519_key_chain,
            exported.forwarding_curve25519_key_chain
        );
    }

    #[test]
    fn base64_public_key() {
        let backup_key = BackupDecryptionKey::new().megolm_v1_public_key();
        let parsed = MegolmV1BackupKey::from_base64(&backup_key.to_base64()).unwrap();

        assert_eq!(parsed.public_key(), backup_key.public_key());
        assert_eq!(parsed.backup_version(), None);

        parsed.set_version("1".to_owned());
        assert_eq!(parsed.clone().backup_version().as_deref(), Some("1"));
        assert!(MegolmV1BackupKey::from_base64("not a key").is_err());
    }
}
