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

use std::{fmt, sync::Arc};

use ruma::{
    DeviceId, DeviceKeyAlgorithm, DeviceKeyId, OwnedDeviceId, OwnedDeviceKeyId, OwnedUserId, UserId,
};
use serde_json::Value;
use vodozemac::{olm::IdentityKeys, Ed25519Signature};

use super::signing::canonical_json;
use crate::{
    error::SignatureError,
    identities::{DeviceData, LocalTrust},
    types::Signatures,
};

/// Our own device, the long lived identity keys of it and the ability to sign
/// things with them.
#[derive(Clone)]
pub struct Account {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    inner: Arc<vodozemac::olm::Account>,
    identity_keys: IdentityKeys,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("ed25519_key", &self.identity_keys.ed25519.to_base64())
            .finish_non_exhaustive()
    }
}

impl Account {
    /// Create a fresh account with new identity keys for the given user and
    /// device.
    pub fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
        Self::from_vodozemac(user_id, device_id, vodozemac::olm::Account::new())
    }

    /// Wrap an existing vodozemac account, the identity keys of the account
    /// are kept.
    pub fn from_vodozemac(
        user_id: &UserId,
        device_id: &DeviceId,
        account: vodozemac::olm::Account,
    ) -> Self {
        let identity_keys = account.identity_keys();

        Self {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            inner: Arc::new(account),
            identity_keys,
        }
    }

    /// The user this account belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The unique id of our device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The public part of our identity keys.
    pub fn identity_keys(&self) -> IdentityKeys {
        self.identity_keys
    }

    /// The id of our Ed25519 signing key, `ed25519:<device id>`.
    pub fn signing_key_id(&self) -> OwnedDeviceKeyId {
        DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id)
    }

    /// Sign the given string using our Ed25519 identity key.
    pub fn sign(&self, message: &str) -> Ed25519Signature {
        self.inner.sign(message)
    }

    /// Sign the canonical form of the given JSON object.
    ///
    /// The `signatures` and `unsigned` fields of the object are ignored.
    pub fn sign_json(&self, json: Value) -> Result<Ed25519Signature, SignatureError> {
        Ok(self.sign(&canonical_json(json)?))
    }

    /// Create a signatures map containing a signature of our device for the
    /// given JSON object.
    pub fn signatures_for(&self, json: Value) -> Result<Signatures, SignatureError> {
        let mut signatures = Signatures::new();
        let signature = self.sign_json(json)?;
        signatures.add_signature(self.user_id.clone(), self.signing_key_id(), signature);

        Ok(signatures)
    }

    /// Get our own device in the form other devices see it.
    ///
    /// Our own device is always considered to be verified.
    pub fn device_data(&self) -> DeviceData {
        let mut device = DeviceData::new(
            self.user_id.clone(),
            self.device_id.clone(),
            self.identity_keys.ed25519,
            self.identity_keys.curve25519,
        );
        device.set_trust_state(LocalTrust::Verified);

        device
    }
}
