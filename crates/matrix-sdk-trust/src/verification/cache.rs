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

use std::{collections::BTreeMap, sync::Arc};

use ruma::{OwnedUserId, TransactionId, UserId};

use super::{event_enums::MessageType, sas::Sas};
use crate::{requests::ToDeviceRequest, utilities::StdRwLock};

/// The flow a queued request belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RequestInfo {
    pub other_user_id: OwnedUserId,
    pub flow_id: String,
    pub message_type: MessageType,
}

#[derive(Clone, Debug)]
pub(crate) struct OutgoingRequest {
    pub request: Arc<ToDeviceRequest>,
    pub owner: RequestInfo,
}

/// The queue of to-device requests waiting to be sent out.
///
/// Requests are kept in the order they were queued in.
#[derive(Clone, Debug, Default)]
pub(crate) struct OutgoingQueue {
    requests: Arc<StdRwLock<Vec<OutgoingRequest>>>,
}

impl OutgoingQueue {
    pub fn push(&self, request: ToDeviceRequest, owner: RequestInfo) {
        self.requests.write().push(OutgoingRequest { request: Arc::new(request), owner });
    }

    pub fn requests(&self) -> Vec<Arc<ToDeviceRequest>> {
        self.requests.read().iter().map(|r| r.request.clone()).collect()
    }

    pub fn remove(&self, request_id: &TransactionId) -> Option<OutgoingRequest> {
        let mut requests = self.requests.write();
        let position = requests.iter().position(|r| r.request.request_id() == request_id)?;

        Some(requests.remove(position))
    }

    /// Drop every queued request of the given flow.
    pub fn remove_flow(&self, other_user_id: &UserId, flow_id: &str) {
        self.requests
            .write()
            .retain(|r| !(&*r.owner.other_user_id == other_user_id && r.owner.flow_id == flow_id));
    }
}

/// The table of the currently active verification flows, keyed by the other
/// user and the flow id.
#[derive(Clone, Debug, Default)]
pub(crate) struct VerificationCache {
    verification: Arc<StdRwLock<BTreeMap<OwnedUserId, BTreeMap<String, Sas>>>>,
    outgoing_requests: OutgoingQueue,
}

impl VerificationCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.verification.read().values().all(|m| m.is_empty())
    }

    pub fn queue(&self) -> &OutgoingQueue {
        &self.outgoing_requests
    }

    pub fn insert(&self, sas: Sas) {
        self.verification
            .write()
            .entry(sas.other_user_id().to_owned())
            .or_default()
            .insert(sas.flow_id().to_owned(), sas);
    }

    pub fn get(&self, sender: &UserId, flow_id: &str) -> Option<Sas> {
        self.verification.read().get(sender).and_then(|m| m.get(flow_id).cloned())
    }

    /// Get all the flows we have with the given user.
    pub fn get_for_user(&self, user_id: &UserId) -> Vec<Sas> {
        self.verification
            .read()
            .get(user_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_all(&self) -> Vec<Sas> {
        self.verification.read().values().flat_map(|m| m.values().cloned()).collect()
    }

    pub fn outgoing_requests(&self) -> Vec<Arc<ToDeviceRequest>> {
        self.outgoing_requests.requests()
    }

    /// Forget about the given flow, its queued requests stay in the queue.
    pub fn remove(&self, user_id: &UserId, flow_id: &str) {
        let mut verification = self.verification.write();

        if let Some(flows) = verification.get_mut(user_id) {
            flows.remove(flow_id);

            if flows.is_empty() {
                verification.remove(user_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id};
    use serde_json::json;

    use super::{OutgoingQueue, RequestInfo};
    use crate::{requests::ToDeviceRequest, verification::event_enums::MessageType};

    fn request() -> ToDeviceRequest {
        ToDeviceRequest::new(
            user_id!("@bob:example.org"),
            device_id!("BOBDEVICE"),
            "m.key.verification.key",
            json!({ "transaction_id": "flow", "key": "abc" }),
        )
    }

    #[test]
    fn queue_keeps_the_order() {
        let queue = OutgoingQueue::default();
        let owner = |flow_id: &str| RequestInfo {
            other_user_id: user_id!("@bob:example.org").to_owned(),
            flow_id: flow_id.to_owned(),
            message_type: MessageType::Key,
        };

        let first = request();
        let second = request();
        let other_flow = request();

        queue.push(first.clone(), owner("flow"));
        queue.push(second.clone(), owner("flow"));
        queue.push(other_flow.clone(), owner("other_flow"));

        let ids: Vec<_> = queue.requests().iter().map(|r| r.txn_id.clone()).collect();
        assert_eq!(ids, [&first, &second, &other_flow].map(|r| r.txn_id.clone()));

        let removed = queue.remove(&second.txn_id).unwrap();
        assert_eq!(removed.owner, owner("flow"));
        assert!(queue.remove(&second.txn_id).is_none());

        queue.remove_flow(user_id!("@bob:example.org"), "flow");
        assert_eq!(queue.requests().len(), 1);
        assert_eq!(queue.requests()[0].txn_id, other_flow.txn_id);
    }
}
