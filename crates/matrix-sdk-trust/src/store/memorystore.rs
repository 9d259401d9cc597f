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

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use ruma::{DeviceId, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId};

use super::{CryptoStore, Result, RoomKeyCounts};
use crate::{
    identities::{DeviceData, LocalTrust},
    olm::InboundGroupSession,
    utilities::StdRwLock,
};

/// An in-memory only store that will forget all the E2EE key once it's dropped.
#[derive(Default, Debug)]
pub struct MemoryStore {
    devices: StdRwLock<HashMap<OwnedUserId, BTreeMap<OwnedDeviceId, DeviceData>>>,
    inbound_group_sessions: StdRwLock<BTreeMap<OwnedRoomId, BTreeMap<String, InboundGroupSession>>>,
    blacklisted_rooms: StdRwLock<HashSet<OwnedRoomId>>,
    backup_version: StdRwLock<Option<String>>,
}

impl MemoryStore {
    /// Create a new empty `MemoryStore`.
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> Vec<InboundGroupSession> {
        self.inbound_group_sessions.read().values().flat_map(|s| s.values().cloned()).collect()
    }
}

#[async_trait]
impl CryptoStore for MemoryStore {
    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceData>> {
        Ok(self.devices.read().get(user_id).and_then(|d| d.get(device_id)).cloned())
    }

    async fn get_user_devices(
        &self,
        user_id: &UserId,
    ) -> Result<BTreeMap<OwnedDeviceId, DeviceData>> {
        Ok(self.devices.read().get(user_id).cloned().unwrap_or_default())
    }

    async fn save_devices(&self, devices: &[DeviceData]) -> Result<()> {
        let mut lock = self.devices.write();

        for device in devices {
            lock.entry(device.user_id().to_owned())
                .or_default()
                .insert(device.device_id().to_owned(), device.clone());
        }

        Ok(())
    }

    async fn set_device_trust(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust_state: LocalTrust,
    ) -> Result<bool> {
        let mut lock = self.devices.write();

        Ok(match lock.get_mut(user_id).and_then(|d| d.get_mut(device_id)) {
            Some(device) => {
                device.set_trust_state(trust_state);
                true
            }
            None => false,
        })
    }

    async fn get_blacklist_unverified_devices(&self, room_id: &RoomId) -> Result<bool> {
        Ok(self.blacklisted_rooms.read().contains(room_id))
    }

    async fn set_blacklist_unverified_devices(&self, room_id: &RoomId, value: bool) -> Result<()> {
        let mut lock = self.blacklisted_rooms.write();

        if value {
            lock.insert(room_id.to_owned());
        } else {
            lock.remove(room_id);
        }

        Ok(())
    }

    async fn save_inbound_group_sessions(&self, sessions: &[InboundGroupSession]) -> Result<()> {
        let mut lock = self.inbound_group_sessions.write();

        for session in sessions {
            lock.entry(session.room_id().to_owned())
                .or_default()
                .insert(session.session_id().to_owned(), session.clone());
        }

        Ok(())
    }

    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>> {
        Ok(self.inbound_group_sessions.read().get(room_id).and_then(|s| s.get(session_id)).cloned())
    }

    async fn inbound_group_session_counts(&self) -> Result<RoomKeyCounts> {
        let sessions = self.sessions();
        let backed_up = sessions.iter().filter(|s| s.backed_up()).count();

        Ok(RoomKeyCounts { total: sessions.len(), backed_up })
    }

    async fn inbound_group_sessions_for_backup(
        &self,
        limit: usize,
    ) -> Result<Vec<InboundGroupSession>> {
        Ok(self.sessions().into_iter().filter(|s| !s.backed_up()).take(limit).collect())
    }

    async fn mark_inbound_group_sessions_as_backed_up(
        &self,
        room_and_session_ids: &[(&RoomId, &str)],
    ) -> Result<()> {
        let lock = self.inbound_group_sessions.read();

        for &(room_id, session_id) in room_and_session_ids {
            if let Some(session) = lock.get(room_id).and_then(|s| s.get(session_id)) {
                session.mark_as_backed_up();
            }
        }

        Ok(())
    }

    async fn reset_backup_state(&self) -> Result<()> {
        for session in self.sessions() {
            session.reset_backup_state();
        }

        Ok(())
    }

    async fn load_backup_version(&self) -> Result<Option<String>> {
        Ok(self.backup_version.read().clone())
    }

    async fn save_backup_version(&self, version: Option<String>) -> Result<()> {
        *self.backup_version.write() = version;

        Ok(())
    }
}
