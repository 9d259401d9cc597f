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

use std::collections::BTreeMap;

use ruma::OwnedRoomId;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use vodozemac::Curve25519PublicKey;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::Signatures;
use crate::{error::SignatureError, olm::signing::canonical_json};

/// The identifier of the only backup algorithm we support.
pub const MEGOLM_BACKUP_V1: &str = "m.megolm_backup.v1.curve25519-aes-sha2";

/// The algorithm of the room keys that are stored in a backup.
pub const MEGOLM_V1_AES_SHA2: &str = "m.megolm.v1.aes-sha2";

fn deserialize_curve_key<'de, D>(de: D) -> Result<Curve25519PublicKey, D::Error>
where
    D: Deserializer<'de>,
{
    let key: String = Deserialize::deserialize(de)?;
    Curve25519PublicKey::from_base64(&key).map_err(serde::de::Error::custom)
}

fn serialize_curve_key<S>(key: &Curve25519PublicKey, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_str(&key.to_base64())
}

/// Auth data for the `m.megolm_backup.v1.curve25519-aes-sha2` backup
/// algorithm.
///
/// Backups whose key was derived from a passphrase additionally carry the
/// PBKDF2 salt and iteration count, this lets us derive the same key again
/// from the same passphrase.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MegolmV1AuthData {
    /// The Curve25519 public key used to encrypt the backups.
    #[serde(deserialize_with = "deserialize_curve_key", serialize_with = "serialize_curve_key")]
    pub public_key: Curve25519PublicKey,
    /// *Optional.* Signatures of the auth_data, as Signed JSON.
    #[serde(default)]
    pub signatures: Signatures,
    /// The salt that was used to derive the private key from a passphrase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_salt: Option<String>,
    /// The number of PBKDF2 iterations that were used to derive the private
    /// key from a passphrase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_iterations: Option<u32>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

impl MegolmV1AuthData {
    pub(crate) fn new(public_key: Curve25519PublicKey, signatures: Signatures) -> Self {
        Self {
            public_key,
            signatures,
            private_key_salt: None,
            private_key_iterations: None,
            extra: Default::default(),
        }
    }

    /// Get the salt and the iteration count if this auth data belongs to a
    /// passphrase derived backup key.
    pub fn passphrase_info(&self) -> Option<(&str, u32)> {
        Some((self.private_key_salt.as_deref()?, self.private_key_iterations?))
    }

    /// Get the canonical JSON form of the auth data that the signatures cover,
    /// that is everything except the signatures themselves.
    pub fn signable_json(&self) -> Result<String, SignatureError> {
        canonical_json(serde_json::to_value(self)?)
    }
}

/// Information pertaining to a room key backup, the algorithm and the auth
/// data.
#[derive(Clone, Debug, PartialEq)]
pub enum RoomKeyBackupInfo {
    /// The `m.megolm_backup.v1.curve25519-aes-sha2` variant of a backup.
    MegolmBackupV1Curve25519AesSha2(MegolmV1AuthData),
    /// Any other backup variant, or a v1 backup with malformed auth data.
    Other {
        /// The algorithm of the unknown backup variant.
        algorithm: String,
        /// The auth data of the unknown backup variant.
        auth_data: Value,
    },
}

impl RoomKeyBackupInfo {
    /// The algorithm identifier of this backup.
    pub fn algorithm(&self) -> &str {
        match self {
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(_) => MEGOLM_BACKUP_V1,
            RoomKeyBackupInfo::Other { algorithm, .. } => algorithm,
        }
    }

    /// Get the auth data if this is a backup we know how to use.
    pub fn megolm_v1_auth_data(&self) -> Option<&MegolmV1AuthData> {
        match self {
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(d) => Some(d),
            RoomKeyBackupInfo::Other { .. } => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct BackupInfoHelper {
    algorithm: String,
    #[serde(default)]
    auth_data: Value,
}

impl From<BackupInfoHelper> for RoomKeyBackupInfo {
    fn from(value: BackupInfoHelper) -> Self {
        if value.algorithm == MEGOLM_BACKUP_V1 {
            if let Ok(data) = serde_json::from_value::<MegolmV1AuthData>(value.auth_data.clone()) {
                return RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(data);
            }
        }

        RoomKeyBackupInfo::Other { algorithm: value.algorithm, auth_data: value.auth_data }
    }
}

impl<'de> Deserialize<'de> for RoomKeyBackupInfo {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(BackupInfoHelper::deserialize(deserializer)?.into())
    }
}

impl Serialize for RoomKeyBackupInfo {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let helper = match self {
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(d) => BackupInfoHelper {
                algorithm: MEGOLM_BACKUP_V1.to_owned(),
                auth_data: serde_json::to_value(d).map_err(serde::ser::Error::custom)?,
            },
            RoomKeyBackupInfo::Other { algorithm, auth_data } => {
                BackupInfoHelper { algorithm: algorithm.to_owned(), auth_data: auth_data.clone() }
            }
        };

        helper.serialize(serializer)
    }
}

/// A backup version as it is stored on the homeserver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyBackupVersion {
    /// The opaque version string the server assigned to the backup.
    pub version: String,
    /// The algorithm and auth data of the backup.
    #[serde(flatten)]
    pub info: RoomKeyBackupInfo,
    /// The number of keys stored in the backup.
    #[serde(default)]
    pub count: u64,
    /// An opaque string representing the stored keys in the backup.
    #[serde(default)]
    pub etag: String,
}

/// The encrypted payload of a single backed up room key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSessionData {
    /// Unpadded base64-encoded public half of the ephemeral key.
    pub ephemeral: String,
    /// Ciphertext, encrypted using AES-CBC-256 with PKCS#7 padding, encoded in
    /// base64.
    pub ciphertext: String,
    /// First 8 bytes of MAC key, encoded in base64.
    pub mac: String,
}

/// A single backed up room key, the encrypted payload and the cleartext
/// metadata the server uses to pick the best key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBackupData {
    /// The index of the first message in the session that the key can
    /// decrypt.
    pub first_message_index: u32,
    /// The number of times this key has been forwarded via key-sharing
    /// between devices.
    pub forwarded_count: u32,
    /// Whether the device backing up the key verified the device that the key
    /// is from.
    pub is_verified: bool,
    /// Encrypted data about the session.
    pub session_data: EncryptedSessionData,
}

/// The backed up keys of a single room, keyed by the session id.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyBackup {
    /// A map of session IDs to key data.
    pub sessions: BTreeMap<String, KeyBackupData>,
}

/// All the backed up keys of a backup version, keyed by the room id.
pub type BackedUpRooms = BTreeMap<OwnedRoomId, RoomKeyBackup>;

/// The plaintext of a backed up room key.
#[derive(Clone, Deserialize, Serialize, Zeroize, ZeroizeOnDrop)]
pub struct BackedUpRoomKey {
    /// The encryption algorithm that the session uses.
    #[zeroize(skip)]
    pub algorithm: String,
    /// The Curve25519 key of the device which initiated the session
    /// originally.
    #[zeroize(skip)]
    pub sender_key: String,
    /// The exported session key, unpadded base64.
    pub session_key: String,
    /// The Ed25519 key of the device which initiated the session originally.
    #[serde(default)]
    #[zeroize(skip)]
    pub sender_claimed_keys: BTreeMap<String, String>,
    /// Chain of Curve25519 keys through which this session was forwarded.
    #[serde(default)]
    #[zeroize(skip)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

impl std::fmt::Debug for BackedUpRoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackedUpRoomKey")
            .field("algorithm", &self.algorithm)
            .field("sender_key", &self.sender_key)
            .field("sender_claimed_keys", &self.sender_claimed_keys)
            .field("forwarding_curve25519_key_chain", &self.forwarding_curve25519_key_chain)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::{KeyBackupVersion, RoomKeyBackupInfo};

    #[test]
    fn serialization() {
        let json = json!({
            "algorithm": "m.megolm_backup.v2",
            "auth_data": {
                "some": "data"
            }
        });

        let deserialized: RoomKeyBackupInfo = serde_json::from_value(json.clone()).unwrap();
        assert_matches!(deserialized, RoomKeyBackupInfo::Other { .. });

        let serialized = serde_json::to_value(deserialized).unwrap();
        assert_eq!(json, serialized);

        let json = json!({
            "algorithm": "m.megolm_backup.v1.curve25519-aes-sha2",
            "auth_data": {
                "public_key": "XjhWTCjW7l59pbfx9tlCBQolfnIQWARoKOzjTOPSlWM",
                "private_key_salt": "saltysalt",
                "private_key_iterations": 500000,
                "signatures": {
                    "@alice:example.org": {
                        "ed25519:deviceid": "signature"
                    }
                }
            }
        });

        let deserialized: RoomKeyBackupInfo = serde_json::from_value(json.clone()).unwrap();
        let auth_data = assert_matches!(
            &deserialized,
            RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(d) => d
        );
        assert_eq!(auth_data.passphrase_info(), Some(("saltysalt", 500_000)));

        let serialized = serde_json::to_value(deserialized).unwrap();
        assert_eq!(json, serialized);
    }

    #[test]
    fn malformed_v1_auth_data_is_kept_as_unknown() {
        let version: KeyBackupVersion = serde_json::from_value(json!({
            "version": "1",
            "algorithm": "m.megolm_backup.v1.curve25519-aes-sha2",
            "auth_data": {
                "signatures": {}
            },
            "count": 3,
            "etag": "abc"
        }))
        .unwrap();

        assert_eq!(version.version, "1");
        assert_eq!(version.count, 3);
        assert_eq!(version.info.algorithm(), "m.megolm_backup.v1.curve25519-aes-sha2");
        assert!(version.info.megolm_v1_auth_data().is_none());
    }

    #[test]
    fn signable_json_drops_the_signatures() {
        let info: RoomKeyBackupInfo = serde_json::from_value(json!({
            "algorithm": "m.megolm_backup.v1.curve25519-aes-sha2",
            "auth_data": {
                "public_key": "XjhWTCjW7l59pbfx9tlCBQolfnIQWARoKOzjTOPSlWM",
                "signatures": {
                    "@alice:example.org": {
                        "ed25519:deviceid": "signature"
                    }
                }
            }
        }))
        .unwrap();

        let auth_data = info.megolm_v1_auth_data().unwrap();

        assert_eq!(
            auth_data.signable_json().unwrap(),
            r#"{"public_key":"XjhWTCjW7l59pbfx9tlCBQolfnIQWARoKOzjTOPSlWM"}"#
        );
    }
}
