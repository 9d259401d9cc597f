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

//! Module containing the JSON types that get exchanged with the homeserver
//! and with other devices.

mod backup;

use std::collections::{btree_map, BTreeMap};

use ruma::{OwnedDeviceKeyId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use vodozemac::Ed25519Signature;

pub use self::backup::*;

/// Signatures for a signed object.
///
/// A map from the user id of the signer to a map of key ids to the base64
/// encoded signature the key created.
///
/// The key ids are kept as plain strings, objects may contain signatures from
/// keys we don't know how to handle and those should survive a
/// deserialization round trip.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signatures(BTreeMap<OwnedUserId, BTreeMap<String, String>>);

impl Signatures {
    /// Create a new, empty, signatures collection.
    pub fn new() -> Self {
        Signatures(Default::default())
    }

    /// Add the given signature from the given signer and the given key id to
    /// the collection.
    pub fn add_signature(
        &mut self,
        signer: OwnedUserId,
        key_id: OwnedDeviceKeyId,
        signature: Ed25519Signature,
    ) -> Option<String> {
        self.0.entry(signer).or_default().insert(key_id.to_string(), signature.to_base64())
    }

    /// Remove the signature of the given signer and key id.
    ///
    /// Returns the removed signature, if there was one.
    pub fn remove_signature(&mut self, signer: &UserId, key_id: &str) -> Option<String> {
        let signatures = self.0.get_mut(signer)?;
        let removed = signatures.remove(key_id);

        if signatures.is_empty() {
            self.0.remove(signer);
        }

        removed
    }

    /// Try to find a signature from the given signer with the given key id.
    pub fn get_signature(&self, signer: &UserId, key_id: &str) -> Option<&str> {
        self.get(signer)?.get(key_id).map(|s| s.as_str())
    }

    /// Get the map of signatures that belong to the given user.
    pub fn get(&self, signer: &UserId) -> Option<&BTreeMap<String, String>> {
        self.0.get(signer)
    }

    /// Do we hold any signatures or is our collection completely empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// How many signatures do we currently hold.
    pub fn signature_count(&self) -> usize {
        self.0.values().map(|u| u.len()).sum()
    }
}

impl IntoIterator for Signatures {
    type Item = (OwnedUserId, BTreeMap<String, String>);
    type IntoIter = btree_map::IntoIter<OwnedUserId, BTreeMap<String, String>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id, DeviceKeyAlgorithm, DeviceKeyId};
    use vodozemac::Ed25519SecretKey;

    use super::Signatures;

    #[test]
    fn removing_the_last_signature_removes_the_signer() {
        let user_id = user_id!("@alice:example.org");
        let key_id =
            DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, device_id!("ALICEDEVICE"));
        let signature = Ed25519SecretKey::new().sign(b"It's a secret to everybody");
        let expected = signature.to_base64();

        let mut signatures = Signatures::new();
        assert!(signatures.add_signature(user_id.to_owned(), key_id.clone(), signature).is_none());
        assert_eq!(signatures.signature_count(), 1);
        assert_eq!(
            signatures.get_signature(user_id, key_id.as_str()),
            Some(expected.as_str())
        );

        assert!(signatures.remove_signature(user_id, key_id.as_str()).is_some());
        assert!(signatures.is_empty());
        assert!(signatures.remove_signature(user_id, key_id.as_str()).is_none());
    }
}
