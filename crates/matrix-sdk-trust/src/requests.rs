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

//! Requests that need to be sent out by the host application.

use std::collections::BTreeMap;

use ruma::{DeviceId, OwnedDeviceId, OwnedTransactionId, OwnedUserId, TransactionId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::BackedUpRooms;

/// Customized version of
/// `ruma_client_api::to_device::send_event_to_device::v3::Request`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToDeviceRequest {
    /// Type of event being sent to each device.
    pub event_type: String,

    /// A request identifier unique to the access token used to send the
    /// request.
    pub txn_id: OwnedTransactionId,

    /// A map of users to devices to a content for a message event to be
    /// sent to the user's device. Individual message events can be sent
    /// to devices, but all events must be of the same type.
    pub messages: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, Value>>,
}

impl ToDeviceRequest {
    /// Create a new owned to-device request
    ///
    /// # Arguments
    ///
    /// * `recipient` - The ID of the user that should receive this to-device
    ///   event.
    ///
    /// * `recipient_device` - The device that should receive this to-device
    ///   event.
    ///
    /// * `event_type` - The type of the event content that is getting sent out.
    ///
    /// * `content` - The content of the to-device event.
    pub fn new(
        recipient: &UserId,
        recipient_device: &DeviceId,
        event_type: &str,
        content: Value,
    ) -> Self {
        let messages = BTreeMap::from([(
            recipient.to_owned(),
            BTreeMap::from([(recipient_device.to_owned(), content)]),
        )]);

        Self { event_type: event_type.to_owned(), txn_id: TransactionId::new(), messages }
    }

    /// Get the unique id of this request, needs to be passed back when the
    /// request was sent out.
    pub fn request_id(&self) -> &TransactionId {
        &self.txn_id
    }

    /// Gets the total number of messages in this request.
    pub fn message_count(&self) -> usize {
        self.messages.values().map(|d| d.len()).sum()
    }
}

/// A request that will back up a batch of room keys to the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeysBackupRequest {
    /// The backup version that these room keys should be part of.
    pub version: String,
    /// The map from room id to a backed up room key that we're going to upload
    /// to the server.
    pub rooms: BackedUpRooms,
}

impl KeysBackupRequest {
    /// The number of room keys this request contains.
    pub fn session_count(&self) -> usize {
        self.rooms.values().map(|r| r.sessions.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id};
    use serde_json::json;

    use super::ToDeviceRequest;

    #[test]
    fn to_device_request() {
        let request = ToDeviceRequest::new(
            user_id!("@bob:example.org"),
            device_id!("BOBDEVICE"),
            "m.key.verification.cancel",
            json!({ "transaction_id": "abc", "code": "m.user", "reason": "Cancelled" }),
        );

        assert_eq!(request.message_count(), 1);
        assert_eq!(
            request.messages[user_id!("@bob:example.org")][device_id!("BOBDEVICE")]["code"],
            "m.user"
        );
    }
}
