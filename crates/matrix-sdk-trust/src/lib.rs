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

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

pub mod backups;
pub mod config;
mod error;
mod identities;
pub mod olm;
pub mod requests;
pub mod store;
pub mod types;
mod utilities;
mod verification;

use std::collections::{BTreeMap, BTreeSet};

use ruma::OwnedRoomId;

/// Return type for the room key importing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomKeyImportResult {
    /// The number of room keys that were imported.
    pub imported_count: usize,
    /// The total number of room keys that were found in the backup.
    pub total_count: usize,
    /// The map of keys that were imported.
    ///
    /// It's a map from room id to a map of the sender key to a set of session
    /// ids.
    pub keys: BTreeMap<OwnedRoomId, BTreeMap<String, BTreeSet<String>>>,
}

impl RoomKeyImportResult {
    pub(crate) fn new(
        imported_count: usize,
        total_count: usize,
        keys: BTreeMap<OwnedRoomId, BTreeMap<String, BTreeSet<String>>>,
    ) -> Self {
        Self { imported_count, total_count, keys }
    }
}

pub use backups::{
    BackupCreationInfo, BackupDecryptionKey, BackupMachine, BackupServerError, BackupState,
    BackupVersionTrust, KeysBackupServer, MegolmV1BackupKey, SignatureState,
};
pub use config::{BackupSettings, VerificationSettings};
pub use error::{KeysBackupError, SignatureError, VerificationError};
pub use identities::{DeviceData, DeviceKey, LocalTrust};
pub use olm::Account;
pub use requests::{KeysBackupRequest, ToDeviceRequest};
pub use store::{CryptoStore, CryptoStoreError, MemoryStore, RoomKeyCounts};
pub use verification::{
    AnyVerificationContent, CancelCode, CancelInfo, Emoji, HashAlgorithm, KeyAgreementProtocol,
    MessageAuthenticationCode, Sas, SasState, ShortAuthenticationString, VerificationMachine,
    VerificationUpdate,
};
