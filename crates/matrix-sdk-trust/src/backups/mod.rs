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

//! Server-side backup support for room keys
//!
//! This module implements [server-side backups] using the
//! `m.megolm_backup.v1.curve25519-aes-sha2` backup algorithm. Room keys get
//! encrypted with the public key of a backup version and uploaded to the
//! homeserver, the user can later restore them on a new device using a
//! recovery key or a passphrase.
//!
//! [server-side backups]: https://spec.matrix.org/unstable/client-server-api/#server-side-key-backups

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use eyeball::SharedObservable;
use futures_core::Stream;
use ruma::{DeviceKeyAlgorithm, OwnedDeviceId, OwnedDeviceKeyId, RoomId};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, trace, warn, Span};
use vodozemac::Ed25519PublicKey;

use crate::{
    config::BackupSettings,
    error::KeysBackupError,
    olm::{signing::verify_canonical_json, Account, InboundGroupSession},
    requests::KeysBackupRequest,
    store::{CryptoStore, CryptoStoreError, RoomKeyCounts},
    types::{BackedUpRooms, KeyBackupVersion, MegolmV1AuthData, RoomKeyBackupInfo, Signatures},
    utilities::StdRwLock,
    RoomKeyImportResult,
};

mod keys;
mod server;
mod state;

pub use keys::{BackupDecryptionKey, DecodeError, DecryptionError, MegolmV1BackupKey};
pub use server::{BackupServerError, KeysBackupServer};
pub use state::BackupState;

/// The verification state of a single signature of a backup version.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureState {
    /// The signature is missing.
    #[default]
    Missing,
    /// The signature was created by a device we don't know about, it can't be
    /// checked.
    UnknownDevice,
    /// The signature is invalid.
    Invalid,
    /// The signature is valid but the device that created it isn't verified.
    ValidButNotTrusted,
    /// The signature is valid and the device that created it is verified.
    ValidAndTrusted,
}

impl SignatureState {
    /// Is the state considered to be trusted.
    pub fn trusted(self) -> bool {
        self == SignatureState::ValidAndTrusted
    }

    /// Did the signature pass the check, regardless of the trust in the
    /// device that created it.
    pub fn is_valid(self) -> bool {
        matches!(self, SignatureState::ValidAndTrusted | SignatureState::ValidButNotTrusted)
    }
}

/// The result of a signature check of the auth data of a backup version.
///
/// Only signatures of our own user are considered.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackupVersionTrust {
    /// The state of the signature of our own device.
    pub device_signature: SignatureState,
    /// The states of the signatures of our other devices.
    pub other_signatures: BTreeMap<OwnedDeviceId, SignatureState>,
}

impl BackupVersionTrust {
    /// Can the backup version be used.
    ///
    /// This is the case if at least one valid signature comes from a verified
    /// device, our own device counts as verified.
    pub fn usable(&self) -> bool {
        self.device_signature.trusted() || self.other_signatures.values().any(|s| s.trusted())
    }
}

/// A freshly generated backup key together with the backup info that needs
/// to be uploaded to create a new backup version.
#[derive(Clone, Debug)]
pub struct BackupCreationInfo {
    /// The algorithm and the signed auth data of the new backup version.
    pub info: RoomKeyBackupInfo,
    /// The private key of the new backup version.
    pub decryption_key: BackupDecryptionKey,
}

impl BackupCreationInfo {
    /// The recovery key of the new backup version, in the form the user
    /// should write down.
    pub fn recovery_key(&self) -> String {
        self.decryption_key.to_string()
    }
}

/// A state machine that handles backing up room keys.
///
/// The machine checks the backup version on the homeserver with
/// [`BackupMachine::check_and_start`] or creates a new one with
/// [`BackupMachine::create_backup_version`]. Once backups are enabled room
/// keys get uploaded in batches every time [`BackupMachine::maybe_backup_keys`]
/// is called.
///
/// All the methods that change the state of the backup are serialized, the
/// state can be observed with [`BackupMachine::state_stream`].
#[derive(Debug, Clone)]
pub struct BackupMachine {
    account: Account,
    store: Arc<dyn CryptoStore>,
    server: Arc<dyn KeysBackupServer>,
    settings: Arc<BackupSettings>,
    state: SharedObservable<BackupState>,
    backup_key: Arc<StdRwLock<Option<MegolmV1BackupKey>>>,
    lock: Arc<Mutex<()>>,
}

impl BackupMachine {
    /// Create a new backup machine for our own device.
    pub fn new(
        account: Account,
        store: Arc<dyn CryptoStore>,
        server: Arc<dyn KeysBackupServer>,
        settings: BackupSettings,
    ) -> Self {
        Self {
            account,
            store,
            server,
            settings: settings.into(),
            state: SharedObservable::new(BackupState::Unknown),
            backup_key: Default::default(),
            lock: Default::default(),
        }
    }

    /// The current state of the backup.
    pub fn state(&self) -> BackupState {
        self.state.get()
    }

    /// Get a stream of updates to the backup state.
    pub fn state_stream(&self) -> impl Stream<Item = BackupState> {
        self.state.subscribe()
    }

    /// Are backups enabled and room keys get uploaded.
    pub fn enabled(&self) -> bool {
        self.state().is_enabled()
    }

    /// The backup version we are backing up to, if any.
    pub fn backup_version(&self) -> Option<String> {
        self.backup_key.read().as_ref().and_then(|k| k.backup_version())
    }

    fn set_state(&self, new_state: BackupState) {
        let old_state = self.state.get();

        debug_assert!(
            old_state.can_transition_to(new_state),
            "Invalid backup state transition {old_state} -> {new_state}"
        );
        trace!(%old_state, %new_state, "Backup state changed");

        self.state.set(new_state);
    }

    /// Generate a new backup key and the auth data for a new backup version.
    ///
    /// If a passphrase is given, the key is derived from it and the salt and
    /// iteration count are stored in the auth data, deriving a key from a
    /// passphrase is computationally expensive. Otherwise a random key is
    /// generated. The auth data is signed by our own device.
    pub fn prepare(&self, passphrase: Option<&str>) -> Result<BackupCreationInfo, KeysBackupError> {
        let (decryption_key, passphrase_info) = match passphrase {
            Some(passphrase) => {
                let salt = BackupDecryptionKey::generate_salt();
                let iterations = self.settings.pbkdf2_iterations;
                let key = BackupDecryptionKey::from_passphrase(passphrase, &salt, iterations);

                (key, Some((salt, iterations)))
            }
            None => (BackupDecryptionKey::new(), None),
        };

        let public_key = decryption_key.megolm_v1_public_key().public_key();
        let mut auth_data = MegolmV1AuthData::new(public_key, Signatures::new());

        if let Some((salt, iterations)) = passphrase_info {
            auth_data.private_key_salt = Some(salt);
            auth_data.private_key_iterations = Some(iterations);
        }

        auth_data.signatures = self.account.signatures_for(serde_json::to_value(&auth_data)?)?;

        Ok(BackupCreationInfo {
            info: RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(auth_data),
            decryption_key,
        })
    }

    /// Upload a new backup version and start backing up to it.
    ///
    /// All our room keys will be backed up again, into the new version.
    ///
    /// Returns the version the server assigned to the new backup.
    #[instrument(skip_all, fields(version))]
    pub async fn create_backup_version(
        &self,
        creation_info: &BackupCreationInfo,
    ) -> Result<String, KeysBackupError> {
        let version = {
            let _guard = self.lock.lock().await;

            self.set_state(BackupState::Enabling);

            let future = async {
                let auth_data = Self::auth_data(&creation_info.info)?;
                let version = self.server.create_backup_version(&creation_info.info).await?;

                Span::current().record("version", &version);

                self.store.reset_backup_state().await?;
                self.enable(MegolmV1BackupKey::new(auth_data.public_key, None), &version).await?;

                Ok::<_, KeysBackupError>(version)
            };

            match future.await {
                Ok(version) => version,
                Err(e) => {
                    self.set_state(BackupState::Unknown);
                    return Err(e);
                }
            }
        };

        if self.settings.backup_after_enable {
            self.trigger_backup().await;
        }

        Ok(version)
    }

    /// Check the current backup version on the homeserver and enable backups
    /// if the version is trusted.
    ///
    /// Returns the state the backup ended up in.
    #[instrument(skip_all)]
    pub async fn check_and_start(&self) -> Result<BackupState, KeysBackupError> {
        let state = {
            let _guard = self.lock.lock().await;

            self.set_state(BackupState::CheckingBackUpOnHomeserver);

            match self.check_current_version().await {
                Ok(state) => state,
                Err(e) => {
                    warn!(error = ?e, "Couldn't check the backup version on the server");
                    self.set_state(BackupState::Unknown);
                    return Err(e);
                }
            }
        };

        if state == BackupState::ReadyToBackUp && self.settings.backup_after_enable {
            self.trigger_backup().await;
        }

        Ok(self.state())
    }

    async fn check_current_version(&self) -> Result<BackupState, KeysBackupError> {
        let stored_version = self.store.load_backup_version().await?;

        let Some(version) = self.server.get_current_backup_version().await? else {
            info!("No backup version found on the server, backups are disabled");

            if stored_version.is_some() {
                self.disable_backup().await?;
            }

            self.set_state(BackupState::Disabled);
            return Ok(BackupState::Disabled);
        };

        let trust = self.verify_backup(&version).await?;

        if !trust.usable() {
            info!(version = version.version, ?trust, "The current backup version isn't trusted");

            if stored_version.is_some() {
                self.disable_backup().await?;
            }

            self.set_state(BackupState::NotTrusted);
            return Ok(BackupState::NotTrusted);
        }

        let auth_data = Self::auth_data(&version.info)?;

        if let Some(old_version) = stored_version.filter(|v| *v != version.version) {
            info!(
                old_version,
                new_version = version.version,
                "The backup version changed, all room keys need to be backed up again"
            );

            self.store.reset_backup_state().await?;
        }

        self.enable(MegolmV1BackupKey::new(auth_data.public_key, None), &version.version).await?;

        Ok(BackupState::ReadyToBackUp)
    }

    async fn enable(
        &self,
        backup_key: MegolmV1BackupKey,
        version: &str,
    ) -> Result<(), KeysBackupError> {
        self.set_state(BackupState::Enabling);

        backup_key.set_version(version.to_owned());
        self.store.save_backup_version(Some(version.to_owned())).await?;

        info!(?backup_key, "Activated a backup");

        *self.backup_key.write() = Some(backup_key);
        self.set_state(BackupState::ReadyToBackUp);

        Ok(())
    }

    async fn disable_backup(&self) -> Result<(), CryptoStoreError> {
        debug!("Disabling key backup and resetting backup state for room keys");

        self.backup_key.write().take();
        self.store.save_backup_version(None).await?;
        self.store.reset_backup_state().await?;

        debug!("Done disabling backup");

        Ok(())
    }

    fn auth_data(info: &RoomKeyBackupInfo) -> Result<&MegolmV1AuthData, KeysBackupError> {
        info.megolm_v1_auth_data()
            .ok_or_else(|| KeysBackupError::UnsupportedAlgorithm(info.algorithm().to_owned()))
    }

    fn check_signature(
        &self,
        key: Ed25519PublicKey,
        device_verified: bool,
        key_id: &str,
        canonical_json: &str,
        signatures: &Signatures,
    ) -> SignatureState {
        match verify_canonical_json(
            key,
            self.account.user_id(),
            key_id,
            canonical_json,
            signatures,
        ) {
            Ok(()) if device_verified => SignatureState::ValidAndTrusted,
            Ok(()) => SignatureState::ValidButNotTrusted,
            Err(e) => {
                warn!(key_id, error = ?e, "The backup auth data contains an invalid signature");
                SignatureState::Invalid
            }
        }
    }

    /// Check the signatures of the auth data of a backup version.
    ///
    /// Every signature of our own user is checked against the keys of the
    /// device that created it. Signatures of other users, or signatures that
    /// don't use an Ed25519 key, are ignored.
    #[instrument(skip_all, fields(version = version.version))]
    pub async fn verify_backup(
        &self,
        version: &KeyBackupVersion,
    ) -> Result<BackupVersionTrust, KeysBackupError> {
        let Some(auth_data) = version.info.megolm_v1_auth_data() else {
            debug!(algorithm = version.info.algorithm(), "Unsupported backup algorithm");
            return Ok(BackupVersionTrust::default());
        };

        let Some(signatures) = auth_data.signatures.get(self.account.user_id()) else {
            debug!("The backup auth data doesn't contain any signatures of our own user");
            return Ok(BackupVersionTrust::default());
        };

        trace!(?auth_data, "Verifying backup auth data");

        let canonical_json = auth_data.signable_json()?;
        let mut trust = BackupVersionTrust::default();

        for key_id in signatures.keys() {
            let Ok(parsed) = OwnedDeviceKeyId::try_from(key_id.as_str()) else {
                debug!(key_id, "Ignoring a signature with a malformed key id");
                continue;
            };

            if parsed.algorithm() != DeviceKeyAlgorithm::Ed25519 {
                continue;
            }

            let device_id = parsed.key_name();

            if device_id == self.account.device_id() {
                trust.device_signature = self.check_signature(
                    self.account.identity_keys().ed25519,
                    true,
                    key_id,
                    &canonical_json,
                    &auth_data.signatures,
                );
            } else {
                trace!(?device_id, "Checking backup auth data for device");

                let device = self.store.get_device(self.account.user_id(), device_id).await?;

                let state = match device.as_ref().and_then(|d| Some((d, d.ed25519_key()?))) {
                    Some((device, key)) => self.check_signature(
                        key,
                        device.is_verified(),
                        key_id,
                        &canonical_json,
                        &auth_data.signatures,
                    ),
                    None => {
                        trace!(?device_id, "Device not found, can't check signature");
                        SignatureState::UnknownDevice
                    }
                };

                trust.other_signatures.insert(device_id.to_owned(), state);
            }
        }

        Ok(trust)
    }

    /// Add or remove the signature of our own device on a backup version.
    ///
    /// The updated auth data gets uploaded and the backup version gets checked
    /// again, the new state of the backup is returned.
    #[instrument(skip_all, fields(version = version.version, trust))]
    pub async fn trust_backup_version(
        &self,
        version: &KeyBackupVersion,
        trust: bool,
    ) -> Result<BackupState, KeysBackupError> {
        let mut auth_data = Self::auth_data(&version.info)?.clone();
        let key_id = self.account.signing_key_id();

        if trust {
            let signature = self.account.sign(&auth_data.signable_json()?);
            let user_id = self.account.user_id().to_owned();
            auth_data.signatures.add_signature(user_id, key_id, signature);
        } else {
            auth_data.signatures.remove_signature(self.account.user_id(), key_id.as_str());
        }

        let info = RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(auth_data);
        self.server.update_backup_version(&version.version, &info).await?;

        self.check_and_start().await
    }

    /// Sign a backup version with our own device after proving that we know
    /// its recovery key.
    pub async fn trust_backup_version_with_recovery_key(
        &self,
        version: &KeyBackupVersion,
        recovery_key: &str,
    ) -> Result<BackupState, KeysBackupError> {
        let decryption_key = BackupDecryptionKey::from_base58(recovery_key)?;
        Self::check_decryption_key(version, &decryption_key)?;

        self.trust_backup_version(version, true).await
    }

    /// Sign a backup version with our own device after proving that we know
    /// the passphrase of it.
    pub async fn trust_backup_version_with_passphrase(
        &self,
        version: &KeyBackupVersion,
        passphrase: &str,
    ) -> Result<BackupState, KeysBackupError> {
        let decryption_key = Self::key_from_passphrase(version, passphrase)?;
        Self::check_decryption_key(version, &decryption_key)?;

        self.trust_backup_version(version, true).await
    }

    fn key_from_passphrase(
        version: &KeyBackupVersion,
        passphrase: &str,
    ) -> Result<BackupDecryptionKey, KeysBackupError> {
        let (salt, iterations) = Self::auth_data(&version.info)?
            .passphrase_info()
            .ok_or(KeysBackupError::MissingPassphraseInfo)?;

        Ok(BackupDecryptionKey::from_passphrase(passphrase, salt, iterations))
    }

    fn check_decryption_key(
        version: &KeyBackupVersion,
        decryption_key: &BackupDecryptionKey,
    ) -> Result<(), KeysBackupError> {
        if decryption_key.backup_key_matches(Self::auth_data(&version.info)?) {
            Ok(())
        } else {
            warn!(
                version = version.version,
                "The recovery key doesn't match the public key of the backup version"
            );

            Err(KeysBackupError::InvalidRecoveryKey)
        }
    }

    async fn trigger_backup(&self) {
        if let Err(e) = self.maybe_backup_keys().await {
            warn!(error = ?e, "Couldn't back up our room keys");
        }
    }

    /// Upload all room keys that aren't backed up yet, if backups are enabled.
    ///
    /// The room keys are uploaded in batches, the pass ends once a batch
    /// contains fewer room keys than the configured batch size.
    #[instrument(skip_all)]
    pub async fn maybe_backup_keys(&self) -> Result<(), KeysBackupError> {
        let _guard = self.lock.lock().await;

        let state = self.state();

        if state != BackupState::ReadyToBackUp {
            debug!(%state, "Backups aren't ready, not backing up room keys");
            return Ok(());
        }

        self.set_state(BackupState::WillBackUp);

        let result = self.backup_room_keys().await;

        if matches!(self.state(), BackupState::WillBackUp | BackupState::BackingUp) {
            self.set_state(BackupState::ReadyToBackUp);
        }

        result
    }

    async fn backup_room_keys(&self) -> Result<(), KeysBackupError> {
        let backup_key = self.backup_key.read().clone();
        let Some((backup_key, version)) =
            backup_key.and_then(|k| k.backup_version().map(|v| (k, v)))
        else {
            warn!("Trying to backup room keys but no backup key was found");
            return Err(KeysBackupError::BackupNotEnabled);
        };

        let batch_size = self.settings.batch_size.max(1);

        loop {
            let sessions = self.store.inbound_group_sessions_for_backup(batch_size).await?;

            if sessions.is_empty() {
                trace!(?backup_key, "No room keys need to be backed up");
                return Ok(());
            }

            self.set_state(BackupState::BackingUp);

            let request = Self::backup_request(&backup_key, &version, &sessions)?;

            match self.server.upload_room_keys(&request).await {
                Ok(()) => {
                    let room_and_session_ids: Vec<_> =
                        sessions.iter().map(|s| (s.room_id(), s.session_id())).collect();

                    self.store
                        .mark_inbound_group_sessions_as_backed_up(&room_and_session_ids)
                        .await?;

                    info!(
                        room_key_count = sessions.len(),
                        version,
                        "Backed up a batch of room keys"
                    );

                    if sessions.len() < batch_size {
                        return Ok(());
                    }
                }
                Err(BackupServerError::WrongRoomKeysVersion { current_version }) => {
                    warn!(
                        version,
                        new_version = current_version,
                        "A new backup version was found on the server, disabling backups"
                    );

                    self.set_state(BackupState::WrongBackUpVersion);
                    self.disable_backup().await?;

                    return Err(KeysBackupError::WrongBackupVersion(version));
                }
                Err(BackupServerError::NotFound) => {
                    warn!(
                        version,
                        "No backup found on the server, the backup got likely deleted, disabling \
                         backups"
                    );

                    self.set_state(BackupState::Disabled);
                    self.disable_backup().await?;

                    return Err(BackupServerError::NotFound.into());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn backup_request(
        backup_key: &MegolmV1BackupKey,
        version: &str,
        sessions: &[InboundGroupSession],
    ) -> Result<KeysBackupRequest, serde_json::Error> {
        let mut rooms = BackedUpRooms::new();

        for session in sessions {
            let data = backup_key.encrypt(session)?;

            rooms
                .entry(session.room_id().to_owned())
                .or_default()
                .sessions
                .insert(session.session_id().to_owned(), data);
        }

        Ok(KeysBackupRequest { version: version.to_owned(), rooms })
    }

    /// Restore room keys from a backup version using a recovery key.
    ///
    /// See [`BackupMachine::restore`].
    pub async fn restore_with_recovery_key(
        &self,
        version: &KeyBackupVersion,
        recovery_key: &str,
        room_id: Option<&RoomId>,
        session_id: Option<&str>,
    ) -> Result<RoomKeyImportResult, KeysBackupError> {
        let decryption_key = BackupDecryptionKey::from_base58(recovery_key)?;

        self.restore(version, &decryption_key, room_id, session_id).await
    }

    /// Restore room keys from a backup version using the passphrase of the
    /// backup.
    ///
    /// See [`BackupMachine::restore`].
    pub async fn restore_with_passphrase(
        &self,
        version: &KeyBackupVersion,
        passphrase: &str,
        room_id: Option<&RoomId>,
        session_id: Option<&str>,
    ) -> Result<RoomKeyImportResult, KeysBackupError> {
        let decryption_key = Self::key_from_passphrase(version, passphrase)?;

        self.restore(version, &decryption_key, room_id, session_id).await
    }

    /// Download, decrypt and import the room keys of a backup version.
    ///
    /// The download can be narrowed down to a single room, and to a single
    /// session of that room. Room keys that fail to decrypt are skipped, the
    /// result contains the number of room keys that were found and the number
    /// of room keys that were imported. Room keys we already know from an
    /// earlier or the same message index aren't imported.
    ///
    /// Fails without importing anything if the decryption key doesn't belong
    /// to the backup version.
    #[instrument(skip_all, fields(version = version.version, ?room_id, session_id))]
    pub async fn restore(
        &self,
        version: &KeyBackupVersion,
        decryption_key: &BackupDecryptionKey,
        room_id: Option<&RoomId>,
        session_id: Option<&str>,
    ) -> Result<RoomKeyImportResult, KeysBackupError> {
        Self::check_decryption_key(version, decryption_key)?;

        let rooms = self.server.get_room_keys(&version.version, room_id, session_id).await?;
        let total_count = rooms.values().map(|r| r.sessions.len()).sum();

        let mut sessions = Vec::new();

        for (room_id, backup) in rooms {
            for (session_id, data) in backup.sessions {
                let room_key = match decryption_key.decrypt_room_key(&data.session_data) {
                    Ok(room_key) => room_key,
                    Err(e) => {
                        warn!(?room_id, session_id, error = ?e, "Couldn't decrypt a room key");
                        continue;
                    }
                };

                match InboundGroupSession::from_backup(&room_id, &session_id, &room_key) {
                    Ok(session) => sessions.push(session),
                    Err(e) => {
                        warn!(?room_id, session_id, error = ?e, "Couldn't import a room key");
                    }
                }
            }
        }

        let result = self.import_room_keys(sessions, total_count, &version.version).await?;

        if result.imported_count > 0 && self.backup_version() != Some(version.version.clone()) {
            self.trigger_backup().await;
        }

        Ok(result)
    }

    async fn import_room_keys(
        &self,
        sessions: Vec<InboundGroupSession>,
        total_count: usize,
        version: &str,
    ) -> Result<RoomKeyImportResult, KeysBackupError> {
        // Keys coming from the version we back up to are already on the
        // server, all other keys need to be uploaded to it.
        let from_active_version = self.backup_version().as_deref() == Some(version);

        let mut keys: BTreeMap<_, BTreeMap<_, BTreeSet<_>>> = BTreeMap::new();
        let mut new_sessions = Vec::new();

        for session in sessions {
            let existing = self
                .store
                .get_inbound_group_session(session.room_id(), session.session_id())
                .await?;

            if existing.is_some_and(|e| e.first_known_index() <= session.first_known_index()) {
                trace!(
                    room_id = ?session.room_id(),
                    session_id = session.session_id(),
                    "A better version of the room key is already known, skipping"
                );
                continue;
            }

            if from_active_version {
                session.mark_as_backed_up();
            }

            keys.entry(session.room_id().to_owned())
                .or_default()
                .entry(session.sender_key().to_base64())
                .or_default()
                .insert(session.session_id().to_owned());

            new_sessions.push(session);
        }

        self.store.save_inbound_group_sessions(&new_sessions).await?;

        info!(
            total_count,
            imported_count = new_sessions.len(),
            "Imported room keys from the backup"
        );

        Ok(RoomKeyImportResult::new(new_sessions.len(), total_count, keys))
    }

    /// Delete a backup version from the server.
    ///
    /// Deleting the version we back up to disables backups and the server is
    /// checked again for a current backup version.
    #[instrument(skip(self))]
    pub async fn delete_backup_version(&self, version: &str) -> Result<(), KeysBackupError> {
        let is_current = {
            let _guard = self.lock.lock().await;

            self.server.delete_backup_version(version).await?;

            let is_current = self.store.load_backup_version().await?.as_deref() == Some(version);

            if is_current {
                info!("Deleted the backup version we were backing up to");

                self.disable_backup().await?;
                self.set_state(BackupState::Unknown);
            }

            is_current
        };

        if is_current {
            if let Err(e) = self.check_and_start().await {
                warn!(error = ?e, "Couldn't check the backup state after deleting the backup");
            }
        }

        Ok(())
    }

    /// Get the number of room keys we have and how many of them are backed
    /// up.
    pub async fn room_key_counts(&self) -> Result<RoomKeyCounts, CryptoStoreError> {
        self.store.inbound_group_session_counts().await
    }

    /// Mark all our room keys as not backed up, they'll be uploaded again on
    /// the next backup pass.
    pub async fn reset_backup_markers(&self) -> Result<(), CryptoStoreError> {
        let _guard = self.lock.lock().await;
        self.store.reset_backup_state().await
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc};

    use assert_matches::assert_matches;
    use futures_util::StreamExt;
    use ruma::{device_id, room_id, user_id, DeviceId};

    use super::{
        server::testing::MemoryBackupServer, BackupDecryptionKey, BackupMachine,
        BackupServerError, BackupState, KeysBackupServer, SignatureState,
    };
    use crate::{
        config::BackupSettings,
        error::KeysBackupError,
        identities::{testing::device_and_account, DeviceData, LocalTrust},
        olm::{testing::inbound_group_session, InboundGroupSession},
        requests::KeysBackupRequest,
        store::{CryptoStore, MemoryStore, RoomKeyCounts},
        types::{KeyBackupVersion, RoomKeyBackup, RoomKeyBackupInfo},
    };

    const PASSPHRASE: &str = "It's a secret to everybody";

    fn backup_machine(
        device_id: &DeviceId,
        server: &Arc<MemoryBackupServer>,
    ) -> (BackupMachine, Arc<MemoryStore>, DeviceData) {
        let (account, device) = device_and_account(user_id!("@alice:example.org"), device_id);
        let store = Arc::new(MemoryStore::new());
        let settings =
            BackupSettings { batch_size: 10, pbkdf2_iterations: 1000, backup_after_enable: true };

        let machine = BackupMachine::new(account, store.clone(), server.clone(), settings);

        (machine, store, device)
    }

    async fn add_room_keys(store: &MemoryStore, count: usize) -> Vec<InboundGroupSession> {
        let sessions: Vec<_> = (0..count)
            .map(|i| {
                if i % 2 == 0 {
                    inbound_group_session(room_id!("!first:localhost"))
                } else {
                    inbound_group_session(room_id!("!second:localhost"))
                }
            })
            .collect();

        store.save_inbound_group_sessions(&sessions).await.unwrap();

        sessions
    }

    async fn current_version(server: &MemoryBackupServer) -> KeyBackupVersion {
        server.get_current_backup_version().await.unwrap().expect("The server should have a backup")
    }

    #[tokio::test]
    async fn prepared_auth_data_is_signed() {
        let server = Arc::new(MemoryBackupServer::new());
        let (machine, _, _) = backup_machine(device_id!("ALICEDEVICE"), &server);

        let creation_info = machine.prepare(None).unwrap();
        let auth_data = creation_info.info.megolm_v1_auth_data().unwrap();

        assert!(auth_data.passphrase_info().is_none());
        assert_eq!(auth_data.signatures.signature_count(), 1);
        assert!(creation_info.decryption_key.backup_key_matches(auth_data));

        let recovery_key = BackupDecryptionKey::from_base58(&creation_info.recovery_key()).unwrap();
        assert!(recovery_key.backup_key_matches(auth_data));

        let mut version = KeyBackupVersion {
            version: "1".to_owned(),
            info: creation_info.info.clone(),
            count: 0,
            etag: String::new(),
        };

        let trust = machine.verify_backup(&version).await.unwrap();
        assert_eq!(trust.device_signature, SignatureState::ValidAndTrusted);
        assert!(trust.usable());

        let mut tampered = auth_data.clone();
        tampered.public_key = BackupDecryptionKey::new().megolm_v1_public_key().public_key();
        version.info = RoomKeyBackupInfo::MegolmBackupV1Curve25519AesSha2(tampered);

        let trust = machine.verify_backup(&version).await.unwrap();
        assert_eq!(trust.device_signature, SignatureState::Invalid);
        assert!(!trust.usable());

        version.info = RoomKeyBackupInfo::Other {
            algorithm: "m.megolm_backup.v2".to_owned(),
            auth_data: Default::default(),
        };
        assert!(!machine.verify_backup(&version).await.unwrap().usable());
    }

    #[tokio::test]
    async fn create_a_backup_and_back_up_room_keys() {
        let server = Arc::new(MemoryBackupServer::new());
        let (machine, store, _) = backup_machine(device_id!("ALICEDEVICE"), &server);
        add_room_keys(&store, 25).await;

        let mut states = machine.state_stream();

        let creation_info = machine.prepare(None).unwrap();
        let version = machine.create_backup_version(&creation_info).await.unwrap();

        assert_eq!(machine.state(), BackupState::ReadyToBackUp);
        assert_eq!(states.next().await, Some(BackupState::ReadyToBackUp));
        assert!(machine.enabled());
        assert_eq!(machine.backup_version().as_deref(), Some(version.as_str()));
        assert_eq!(store.load_backup_version().await.unwrap(), Some(version.clone()));

        // Two full batches and one with the remaining five room keys.
        assert_eq!(server.upload_requests(), 3);
        assert_eq!(server.key_count(&version), 25);
        assert_eq!(
            machine.room_key_counts().await.unwrap(),
            RoomKeyCounts { total: 25, backed_up: 25 }
        );

        add_room_keys(&store, 1).await;
        assert_eq!(machine.room_key_counts().await.unwrap().backed_up, 25);

        machine.maybe_backup_keys().await.unwrap();
        assert_eq!(machine.room_key_counts().await.unwrap().backed_up, 26);
        assert_eq!(server.upload_requests(), 4);

        machine.reset_backup_markers().await.unwrap();
        assert_eq!(
            machine.room_key_counts().await.unwrap(),
            RoomKeyCounts { total: 26, backed_up: 0 }
        );
    }

    #[tokio::test]
    async fn backup_signed_by_an_unverified_device_is_not_trusted() {
        let server = Arc::new(MemoryBackupServer::new());
        let (machine, store, _) = backup_machine(device_id!("ALICEDEVICE"), &server);
        let (other_machine, _, other_device) = backup_machine(device_id!("OTHERDEVICE"), &server);

        assert_eq!(machine.check_and_start().await.unwrap(), BackupState::Disabled);

        let creation_info = other_machine.prepare(None).unwrap();
        other_machine.create_backup_version(&creation_info).await.unwrap();
        let version = current_version(&server).await;

        let trust = machine.verify_backup(&version).await.unwrap();
        assert_eq!(
            trust.other_signatures[device_id!("OTHERDEVICE")],
            SignatureState::UnknownDevice
        );
        assert!(!trust.usable());
        assert_eq!(machine.check_and_start().await.unwrap(), BackupState::NotTrusted);

        store.save_devices(&[other_device.clone()]).await.unwrap();

        let trust = machine.verify_backup(&version).await.unwrap();
        assert_eq!(trust.device_signature, SignatureState::Missing);
        assert_eq!(
            trust.other_signatures[device_id!("OTHERDEVICE")],
            SignatureState::ValidButNotTrusted
        );
        assert!(!trust.usable());

        let (user_id, device_id) = (other_device.user_id(), other_device.device_id());
        store.set_device_trust(user_id, device_id, LocalTrust::Verified).await.unwrap();

        assert!(machine.verify_backup(&version).await.unwrap().usable());
        assert_eq!(machine.check_and_start().await.unwrap(), BackupState::ReadyToBackUp);
        assert_eq!(machine.backup_version(), Some(version.version));
    }

    #[tokio::test]
    async fn trust_a_backup_with_the_recovery_key() {
        let server = Arc::new(MemoryBackupServer::new());
        let (machine, _, _) = backup_machine(device_id!("ALICEDEVICE"), &server);
        let (other_machine, _, _) = backup_machine(device_id!("OTHERDEVICE"), &server);

        let creation_info = other_machine.prepare(None).unwrap();
        other_machine.create_backup_version(&creation_info).await.unwrap();
        let version = current_version(&server).await;

        let wrong_key = BackupDecryptionKey::new().to_string();
        assert_matches!(
            machine.trust_backup_version_with_recovery_key(&version, &wrong_key).await,
            Err(KeysBackupError::InvalidRecoveryKey)
        );
        assert_matches!(
            machine.trust_backup_version_with_passphrase(&version, PASSPHRASE).await,
            Err(KeysBackupError::MissingPassphraseInfo)
        );
        assert_eq!(machine.state(), BackupState::Unknown);

        let state = machine
            .trust_backup_version_with_recovery_key(&version, &creation_info.recovery_key())
            .await
            .unwrap();
        assert_eq!(state, BackupState::ReadyToBackUp);

        let version = current_version(&server).await;
        let trust = machine.verify_backup(&version).await.unwrap();
        assert_eq!(trust.device_signature, SignatureState::ValidAndTrusted);
        assert_eq!(
            trust.other_signatures[device_id!("OTHERDEVICE")],
            SignatureState::UnknownDevice
        );

        assert_eq!(
            machine.trust_backup_version(&version, false).await.unwrap(),
            BackupState::NotTrusted
        );
        assert_eq!(machine.backup_version(), None);

        let trust = machine.verify_backup(&current_version(&server).await).await.unwrap();
        assert_eq!(trust.device_signature, SignatureState::Missing);
    }

    #[tokio::test]
    async fn restore_room_keys_with_a_passphrase() {
        let server = Arc::new(MemoryBackupServer::new());
        let (machine, store, _) = backup_machine(device_id!("ALICEDEVICE"), &server);
        let sessions = add_room_keys(&store, 12).await;

        let creation_info = machine.prepare(Some(PASSPHRASE)).unwrap();
        let auth_data = creation_info.info.megolm_v1_auth_data().unwrap();
        assert_eq!(auth_data.passphrase_info().map(|(s, i)| (s.len(), i)), Some((32, 1000)));

        machine.create_backup_version(&creation_info).await.unwrap();
        let version = current_version(&server).await;

        let (new_machine, new_store, _) = backup_machine(device_id!("NEWDEVICE"), &server);

        assert_matches!(
            new_machine.restore_with_passphrase(&version, "wrong passphrase", None, None).await,
            Err(KeysBackupError::InvalidRecoveryKey)
        );
        assert_eq!(new_machine.room_key_counts().await.unwrap(), RoomKeyCounts::default());

        let result =
            new_machine.restore_with_passphrase(&version, PASSPHRASE, None, None).await.unwrap();
        assert_eq!(result.total_count, 12);
        assert_eq!(result.imported_count, 12);

        for session in &sessions {
            let restored = new_store
                .get_inbound_group_session(session.room_id(), session.session_id())
                .await
                .unwrap()
                .expect("The room key should have been restored");

            assert_eq!(restored.to_backup().session_key, session.to_backup().session_key);
            assert_eq!(restored.sender_key(), session.sender_key());
            assert!(restored.has_been_imported());
            assert!(result.keys[session.room_id()][&session.sender_key().to_base64()]
                .contains(session.session_id()));
        }

        // The keys don't come from a version we back up to, they need to be
        // uploaded again.
        assert_eq!(
            new_machine.room_key_counts().await.unwrap(),
            RoomKeyCounts { total: 12, backed_up: 0 }
        );

        let result =
            new_machine.restore_with_passphrase(&version, PASSPHRASE, None, None).await.unwrap();
        assert_eq!(result.total_count, 12);
        assert_eq!(result.imported_count, 0);
    }

    #[tokio::test]
    async fn undecryptable_room_keys_are_skipped() {
        let server = Arc::new(MemoryBackupServer::new());
        let (machine, store, _) = backup_machine(device_id!("ALICEDEVICE"), &server);
        let sessions = add_room_keys(&store, 4).await;

        let creation_info = machine.prepare(None).unwrap();
        let version = machine.create_backup_version(&creation_info).await.unwrap();

        // A room key that was encrypted for a different backup key.
        let room_id = room_id!("!first:localhost");
        let bogus_session = inbound_group_session(room_id);
        let data =
            BackupDecryptionKey::new().megolm_v1_public_key().encrypt(&bogus_session).unwrap();
        let request = KeysBackupRequest {
            version: version.clone(),
            rooms: BTreeMap::from([(
                room_id.to_owned(),
                RoomKeyBackup {
                    sessions: BTreeMap::from([(bogus_session.session_id().to_owned(), data)]),
                },
            )]),
        };
        server.upload_room_keys(&request).await.unwrap();

        let version = current_version(&server).await;
        let recovery_key = creation_info.recovery_key();

        let (new_machine, new_store, _) = backup_machine(device_id!("NEWDEVICE"), &server);

        assert_matches!(
            new_machine.restore_with_recovery_key(&version, "not a recovery key", None, None).await,
            Err(KeysBackupError::Decode(_))
        );

        let result = new_machine
            .restore_with_recovery_key(&version, &recovery_key, None, None)
            .await
            .unwrap();
        assert_eq!(result.total_count, 5);
        assert_eq!(result.imported_count, 4);
        assert!(new_store
            .get_inbound_group_session(room_id, bogus_session.session_id())
            .await
            .unwrap()
            .is_none());

        let session = &sessions[1];
        let (scoped_machine, scoped_store, _) = backup_machine(device_id!("SCOPEDDEVICE"), &server);

        let result = scoped_machine
            .restore_with_recovery_key(
                &version,
                &recovery_key,
                Some(session.room_id()),
                Some(session.session_id()),
            )
            .await
            .unwrap();
        assert_eq!((result.total_count, result.imported_count), (1, 1));
        assert!(scoped_store
            .get_inbound_group_session(session.room_id(), session.session_id())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn restoring_from_the_active_version_keeps_the_keys_backed_up() {
        let server = Arc::new(MemoryBackupServer::new());
        let (machine, store, _) = backup_machine(device_id!("ALICEDEVICE"), &server);
        add_room_keys(&store, 3).await;

        let creation_info = machine.prepare(None).unwrap();
        machine.create_backup_version(&creation_info).await.unwrap();
        let version = current_version(&server).await;
        let recovery_key = creation_info.recovery_key();

        let (second_machine, _, _) = backup_machine(device_id!("SECONDDEVICE"), &server);

        let state = second_machine
            .trust_backup_version_with_recovery_key(&version, &recovery_key)
            .await
            .unwrap();
        assert_eq!(state, BackupState::ReadyToBackUp);

        let result = second_machine
            .restore_with_recovery_key(&version, &recovery_key, None, None)
            .await
            .unwrap();
        assert_eq!(result.imported_count, 3);
        assert_eq!(
            second_machine.room_key_counts().await.unwrap(),
            RoomKeyCounts { total: 3, backed_up: 3 }
        );
    }

    #[tokio::test]
    async fn new_backup_version_on_the_server_disables_backups() {
        let server = Arc::new(MemoryBackupServer::new());
        let (machine, store, _) = backup_machine(device_id!("ALICEDEVICE"), &server);
        let (other_machine, _, _) = backup_machine(device_id!("OTHERDEVICE"), &server);

        let version = machine.create_backup_version(&machine.prepare(None).unwrap()).await.unwrap();
        other_machine.create_backup_version(&other_machine.prepare(None).unwrap()).await.unwrap();

        add_room_keys(&store, 3).await;

        assert_matches!(
            machine.maybe_backup_keys().await,
            Err(KeysBackupError::WrongBackupVersion(v)) if v == version
        );
        assert_eq!(machine.state(), BackupState::WrongBackUpVersion);
        assert_eq!(machine.backup_version(), None);
        assert_eq!(store.load_backup_version().await.unwrap(), None);
        assert_eq!(machine.room_key_counts().await.unwrap().backed_up, 0);

        // The new version was created by a device we didn't verify.
        assert_eq!(machine.check_and_start().await.unwrap(), BackupState::NotTrusted);
    }

    #[tokio::test]
    async fn failed_uploads_are_retried() {
        let server = Arc::new(MemoryBackupServer::new());
        let (machine, store, _) = backup_machine(device_id!("ALICEDEVICE"), &server);

        let version = machine.create_backup_version(&machine.prepare(None).unwrap()).await.unwrap();
        add_room_keys(&store, 5).await;

        server.fail_next_upload();

        assert_matches!(
            machine.maybe_backup_keys().await,
            Err(KeysBackupError::Server(BackupServerError::Other(_)))
        );
        assert_eq!(machine.state(), BackupState::ReadyToBackUp);
        assert_eq!(machine.room_key_counts().await.unwrap().backed_up, 0);

        machine.maybe_backup_keys().await.unwrap();
        assert_eq!(machine.room_key_counts().await.unwrap().backed_up, 5);
        assert_eq!(server.key_count(&version), 5);
    }

    #[tokio::test]
    async fn deleting_the_current_backup_version() {
        let server = Arc::new(MemoryBackupServer::new());
        let (machine, store, _) = backup_machine(device_id!("ALICEDEVICE"), &server);
        add_room_keys(&store, 2).await;

        let version = machine.create_backup_version(&machine.prepare(None).unwrap()).await.unwrap();
        assert_eq!(machine.room_key_counts().await.unwrap().backed_up, 2);

        machine.delete_backup_version(&version).await.unwrap();

        assert_eq!(machine.state(), BackupState::Disabled);
        assert_eq!(machine.backup_version(), None);
        assert_eq!(machine.room_key_counts().await.unwrap().backed_up, 0);
        assert!(server.get_backup_version(&version).await.unwrap().is_none());

        assert_matches!(
            machine.delete_backup_version(&version).await,
            Err(KeysBackupError::Server(BackupServerError::NotFound))
        );
    }
}
