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

//! The homeserver endpoints the key backup engine consumes.

use async_trait::async_trait;
use ruma::RoomId;
use thiserror::Error;

use crate::{
    requests::KeysBackupRequest,
    types::{BackedUpRooms, KeyBackupVersion, RoomKeyBackupInfo},
    utilities::AsyncTraitDeps,
};

/// Errors the homeserver can return for the key backup endpoints.
#[derive(Debug, Error)]
pub enum BackupServerError {
    /// The backup version, or the requested room keys, don't exist.
    #[error("the backup version or the requested room keys don't exist on the server")]
    NotFound,

    /// We tried to upload room keys to a backup version that isn't the
    /// current one.
    #[error("the backup version isn't the current one, the current version is {current_version}")]
    WrongRoomKeysVersion {
        /// The version the server considers to be the current one.
        current_version: String,
    },

    /// Any other error, including network errors.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl BackupServerError {
    /// Create a new [`Other`][Self::Other] error.
    pub fn other<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Other(Box::new(error))
    }
}

/// The `/room_keys` part of the client-server API.
///
/// Implemented by the host application on top of its HTTP client.
#[async_trait]
pub trait KeysBackupServer: AsyncTraitDeps {
    /// Create a new backup version, returns the version the server assigned
    /// to it.
    async fn create_backup_version(
        &self,
        info: &RoomKeyBackupInfo,
    ) -> Result<String, BackupServerError>;

    /// Get the current backup version, `None` if the server has no backup.
    async fn get_current_backup_version(
        &self,
    ) -> Result<Option<KeyBackupVersion>, BackupServerError>;

    /// Get a specific backup version, `None` if it doesn't exist.
    async fn get_backup_version(
        &self,
        version: &str,
    ) -> Result<Option<KeyBackupVersion>, BackupServerError>;

    /// Replace the auth data of an existing backup version.
    async fn update_backup_version(
        &self,
        version: &str,
        info: &RoomKeyBackupInfo,
    ) -> Result<(), BackupServerError>;

    /// Delete a backup version together with all its room keys.
    async fn delete_backup_version(&self, version: &str) -> Result<(), BackupServerError>;

    /// Upload a batch of encrypted room keys.
    async fn upload_room_keys(&self, request: &KeysBackupRequest)
        -> Result<(), BackupServerError>;

    /// Fetch the backed up room keys of a backup version.
    ///
    /// The result can be narrowed down to a single room, and within that room
    /// to a single session.
    async fn get_room_keys(
        &self,
        version: &str,
        room_id: Option<&RoomId>,
        session_id: Option<&str>,
    ) -> Result<BackedUpRooms, BackupServerError>;
}
