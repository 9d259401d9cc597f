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

//! Types and traits to implement the storage layer for the verification and
//! key backup engines.
//!
//! The store holds the devices of users, our local trust in them, the inbound
//! group sessions and the backup state of those sessions. Both engines only
//! ever talk to the store through the [`CryptoStore`] trait, an in-memory
//! implementation is provided by [`MemoryStore`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use ruma::{DeviceId, OwnedDeviceId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    identities::{DeviceData, LocalTrust},
    olm::InboundGroupSession,
    utilities::AsyncTraitDeps,
};

mod memorystore;

pub use memorystore::MemoryStore;

/// A `CryptoStore` specific result type.
pub type Result<T, E = CryptoStoreError> = std::result::Result<T, E>;

/// The crypto store's error type.
#[derive(Debug, Error)]
pub enum CryptoStoreError {
    /// The store failed to (de)serialize a data type.
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    /// A problem with the underlying database backend.
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

impl CryptoStoreError {
    /// Create a new [`Backend`][Self::Backend] error.
    ///
    /// Shorthand for `CryptoStoreError::Backend(Box::new(error))`.
    #[inline]
    pub fn backend<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Backend(Box::new(error))
    }
}

/// Struct holding info about how many room keys the store has.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyCounts {
    /// The total number of room keys the store has.
    pub total: usize,
    /// The number of backed up room keys the store has.
    pub backed_up: usize,
}

/// Represents a store that the verification and backup machines use to
/// persist E2EE data.
#[async_trait]
pub trait CryptoStore: AsyncTraitDeps {
    /// Get the device for the given user with the given device ID.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The user that the device belongs to.
    ///
    /// * `device_id` - The unique id of the device.
    async fn get_device(&self, user_id: &UserId, device_id: &DeviceId)
        -> Result<Option<DeviceData>>;

    /// Get all the devices of the given user.
    async fn get_user_devices(&self, user_id: &UserId)
        -> Result<BTreeMap<OwnedDeviceId, DeviceData>>;

    /// Save the given devices, existing copies get replaced.
    async fn save_devices(&self, devices: &[DeviceData]) -> Result<()>;

    /// Set the local trust state of a device.
    ///
    /// Returns `false` if the device isn't known to the store.
    async fn set_device_trust(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust_state: LocalTrust,
    ) -> Result<bool>;

    /// Should room keys of the given room only be shared with verified
    /// devices.
    async fn get_blacklist_unverified_devices(&self, room_id: &RoomId) -> Result<bool>;

    /// Set if room keys of the given room should only be shared with verified
    /// devices.
    async fn set_blacklist_unverified_devices(&self, room_id: &RoomId, value: bool) -> Result<()>;

    /// Save the given inbound group sessions, existing sessions with the same
    /// room and session id get replaced.
    async fn save_inbound_group_sessions(&self, sessions: &[InboundGroupSession]) -> Result<()>;

    /// Get the inbound group session from our store.
    ///
    /// # Arguments
    /// * `room_id` - The room id of the room that the session belongs to.
    ///
    /// * `session_id` - The unique id of the session.
    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>>;

    /// Get the number inbound group sessions we have and how many of them are
    /// backed up.
    async fn inbound_group_session_counts(&self) -> Result<RoomKeyCounts>;

    /// Return a batch of inbound group sessions that are not yet backed up.
    ///
    /// # Arguments
    ///
    /// * `limit` - The maximal number of sessions that should be returned.
    async fn inbound_group_sessions_for_backup(
        &self,
        limit: usize,
    ) -> Result<Vec<InboundGroupSession>>;

    /// Mark the inbound group sessions with the supplied room and session IDs
    /// as backed up.
    async fn mark_inbound_group_sessions_as_backed_up(
        &self,
        room_and_session_ids: &[(&RoomId, &str)],
    ) -> Result<()>;

    /// Reset the backup state of all the stored inbound group sessions.
    async fn reset_backup_state(&self) -> Result<()>;

    /// Get the backup version that is currently in use, if any.
    async fn load_backup_version(&self) -> Result<Option<String>>;

    /// Remember the backup version that is currently in use, `None` forgets
    /// the version.
    async fn save_backup_version(&self, version: Option<String>) -> Result<()>;
}
