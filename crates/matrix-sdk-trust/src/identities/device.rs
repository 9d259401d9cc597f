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

use ruma::{
    DeviceId, DeviceKeyAlgorithm, DeviceKeyId, OwnedDeviceId, OwnedDeviceKeyId, OwnedUserId,
    UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

use crate::{error::SignatureError, olm::verify_json};

/// A public key of a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKey {
    /// The Ed25519 signing key of the device.
    Ed25519(Ed25519PublicKey),
    /// The Curve25519 identity key of the device.
    Curve25519(Curve25519PublicKey),
}

impl DeviceKey {
    /// Convert the key to its unpadded base64 form.
    pub fn to_base64(&self) -> String {
        match self {
            DeviceKey::Ed25519(k) => k.to_base64(),
            DeviceKey::Curve25519(k) => k.to_base64(),
        }
    }
}

/// The local trust state of a device.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, PartialEq, Hash)]
pub enum LocalTrust {
    /// The device has been verified and is trusted.
    Verified,
    /// The device been blacklisted from communicating.
    BlackListed,
    /// The trust state of the device is being ignored.
    Ignored,
    /// The trust state is unset.
    #[default]
    Unset,
}

/// A device of a user, the public keys of it and our local trust in it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceData {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    keys: BTreeMap<OwnedDeviceKeyId, DeviceKey>,
    display_name: Option<String>,
    trust_state: LocalTrust,
}

#[derive(Deserialize)]
struct DeviceKeysHelper {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    keys: BTreeMap<String, String>,
    #[serde(default)]
    unsigned: UnsignedDeviceInfo,
}

#[derive(Default, Deserialize)]
struct UnsignedDeviceInfo {
    device_display_name: Option<String>,
}

impl DeviceData {
    /// Create a new device from its signing and identity key.
    pub fn new(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        ed25519_key: Ed25519PublicKey,
        curve25519_key: Curve25519PublicKey,
    ) -> Self {
        let keys = BTreeMap::from([
            (
                DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &device_id),
                DeviceKey::Ed25519(ed25519_key),
            ),
            (
                DeviceKeyId::from_parts(DeviceKeyAlgorithm::Curve25519, &device_id),
                DeviceKey::Curve25519(curve25519_key),
            ),
        ]);

        Self { user_id, device_id, keys, display_name: None, trust_state: LocalTrust::Unset }
    }

    /// Create a device from the `device_keys` JSON object a homeserver
    /// returns for a `/keys/query` request.
    ///
    /// The self-signature of the device is checked, keys of unsupported
    /// algorithms are ignored.
    pub fn try_from_device_keys(json: &Value) -> Result<Self, SignatureError> {
        let helper: DeviceKeysHelper = serde_json::from_value(json.clone())?;

        let mut keys = BTreeMap::new();

        for (key_id, key) in helper.keys {
            let Ok(key_id) = OwnedDeviceKeyId::try_from(key_id.as_str()) else {
                warn!(key_id, "Ignoring a device key with an invalid key ID");
                continue;
            };

            if key_id.key_name() != &*helper.device_id {
                return Err(SignatureError::InvalidKeyId);
            }

            let key = match key_id.algorithm() {
                DeviceKeyAlgorithm::Ed25519 => {
                    DeviceKey::Ed25519(Ed25519PublicKey::from_base64(&key)?)
                }
                DeviceKeyAlgorithm::Curve25519 => {
                    DeviceKey::Curve25519(Curve25519PublicKey::from_base64(&key)?)
                }
                _ => continue,
            };

            keys.insert(key_id, key);
        }

        let device = Self {
            user_id: helper.user_id,
            device_id: helper.device_id,
            keys,
            display_name: helper.unsigned.device_display_name,
            trust_state: LocalTrust::Unset,
        };

        let signing_key = device.ed25519_key().ok_or(SignatureError::MissingSigningKey)?;
        let key_id = DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &device.device_id);
        verify_json(signing_key, &device.user_id, key_id.as_str(), json)?;

        Ok(device)
    }

    /// The user id of the device owner.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The unique ID of the device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Get the human readable name of the device.
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// Set the human readable name of the device.
    pub fn set_display_name(&mut self, display_name: Option<String>) {
        self.display_name = display_name;
    }

    /// Get the key of the given key algorithm belonging to this device.
    pub fn get_key(&self, algorithm: DeviceKeyAlgorithm) -> Option<&DeviceKey> {
        self.keys.get(&DeviceKeyId::from_parts(algorithm, &self.device_id))
    }

    /// Get the Ed25519 signing key of this device.
    pub fn ed25519_key(&self) -> Option<Ed25519PublicKey> {
        match self.get_key(DeviceKeyAlgorithm::Ed25519)? {
            DeviceKey::Ed25519(k) => Some(*k),
            DeviceKey::Curve25519(_) => None,
        }
    }

    /// Get the Curve25519 identity key of this device.
    pub fn curve25519_key(&self) -> Option<Curve25519PublicKey> {
        match self.get_key(DeviceKeyAlgorithm::Curve25519)? {
            DeviceKey::Curve25519(k) => Some(*k),
            DeviceKey::Ed25519(_) => None,
        }
    }

    /// Get a map containing all the device keys.
    pub fn keys(&self) -> &BTreeMap<OwnedDeviceKeyId, DeviceKey> {
        &self.keys
    }

    /// Get the trust state of the device.
    pub fn local_trust_state(&self) -> LocalTrust {
        self.trust_state
    }

    /// Is the device locally marked as trusted.
    pub fn is_verified(&self) -> bool {
        self.trust_state == LocalTrust::Verified
    }

    /// Is the device locally marked as blacklisted.
    pub fn is_blacklisted(&self) -> bool {
        self.trust_state == LocalTrust::BlackListed
    }

    /// Set the trust state of the device to the given state.
    ///
    /// Note: This only changes this copy of the device, the store needs to be
    /// updated separately.
    pub fn set_trust_state(&mut self, state: LocalTrust) {
        self.trust_state = state;
    }

    /// Do the two copies of the device carry the same public keys.
    pub(crate) fn keys_match(&self, other: &DeviceData) -> bool {
        self.user_id == other.user_id
            && self.device_id == other.device_id
            && self.keys == other.keys
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use ruma::{DeviceId, UserId};

    use super::DeviceData;
    use crate::olm::Account;

    /// Create a fresh account together with the public device of it.
    pub(crate) fn device_and_account(
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> (Account, DeviceData) {
        let account = Account::new(user_id, device_id);
        let mut device = account.device_data();
        device.set_trust_state(Default::default());

        (account, device)
    }
}
