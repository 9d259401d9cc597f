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

use std::sync::Arc;

use futures_core::Stream;
use futures_util::StreamExt;
use ruma::{DeviceId, TransactionId, UserId};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, instrument, trace, warn};

use super::{
    cache::VerificationCache,
    event_enums::{AnyVerificationContent, StartContent},
    sas::{Sas, SasIds},
    CancelCode, VerificationStore, VerificationUpdate,
};
use crate::{
    config::VerificationSettings,
    error::VerificationError,
    olm::Account,
    requests::ToDeviceRequest,
    store::{CryptoStore, CryptoStoreError},
};

/// The capacity of the channel that broadcasts [`VerificationUpdate`]s.
const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// The verification manager.
///
/// Keeps track of all the SAS verification flows of our device, routes the
/// incoming `m.key.verification.*` to-device events to the right flow and
/// collects the to-device requests the flows want to send out.
#[derive(Clone, Debug)]
pub struct VerificationMachine {
    store: VerificationStore,
    settings: Arc<VerificationSettings>,
    verifications: VerificationCache,
    updates: broadcast::Sender<VerificationUpdate>,
}

impl VerificationMachine {
    /// Create a new verification machine for the given account.
    pub fn new(
        account: Account,
        store: Arc<dyn CryptoStore>,
        settings: VerificationSettings,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        Self {
            store: VerificationStore::new(account, store),
            settings: settings.into(),
            verifications: VerificationCache::new(),
            updates,
        }
    }

    /// Our own user id.
    pub fn own_user_id(&self) -> &UserId {
        self.store.account.user_id()
    }

    /// Our own device id.
    pub fn own_device_id(&self) -> &DeviceId {
        self.store.account.device_id()
    }

    /// Start a new SAS verification with the given device.
    ///
    /// If a verification with the same user is already going on, both the
    /// existing verifications and the new one get cancelled, the new one
    /// without notifying the other side.
    #[instrument(skip(self))]
    pub async fn start_sas(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Sas, VerificationError> {
        if user_id == self.own_user_id() && device_id == self.own_device_id() {
            return Err(VerificationError::OwnDevice);
        }

        let Some(device) = self.store.get_device(user_id, device_id).await? else {
            return Err(VerificationError::UnknownDevice(user_id.to_owned(), device_id.to_owned()));
        };

        let ids = SasIds {
            account: self.store.account.clone(),
            other_device: device,
            other_devices: self.store.get_user_devices(user_id).await?,
        };

        let existing = self.live_verifications(user_id);

        let sas = Sas::new_outgoing(
            ids,
            TransactionId::new().as_str().into(),
            self.store.clone(),
            self.settings.clone(),
            self.verifications.clone(),
            self.updates.clone(),
        );
        self.verifications.insert(sas.clone());

        if existing.is_empty() {
            info!(flow_id = sas.flow_id(), "Starting a new SAS verification");
            sas.start().await?;
        } else {
            warn!(
                flow_id = sas.flow_id(),
                "A verification with the user is already going on, cancelling all of them"
            );

            Self::cancel_all(&existing).await?;
            sas.cancel_with_code(CancelCode::UnexpectedMessage).await?;
        }

        Ok(sas)
    }

    /// Get the SAS verification with the given user and flow id.
    pub fn get_sas(&self, user_id: &UserId, flow_id: &str) -> Option<Sas> {
        self.verifications.get(user_id, flow_id)
    }

    /// Get all the SAS verifications we have with the given user.
    pub fn get_verifications(&self, user_id: &UserId) -> Vec<Sas> {
        self.verifications.get_for_user(user_id)
    }

    /// Listen for state changes of all the verification flows of this
    /// machine.
    pub fn verification_updates(&self) -> impl Stream<Item = VerificationUpdate> {
        BroadcastStream::new(self.updates.subscribe()).filter_map(|update| async move {
            match update {
                Ok(update) => Some(update),
                Err(e) => {
                    warn!("Missed some verification updates: {e}");
                    None
                }
            }
        })
    }

    /// Get the to-device requests that need to be sent out.
    ///
    /// The requests stay queued until they are marked as sent or failed.
    pub fn outgoing_requests(&self) -> Vec<Arc<ToDeviceRequest>> {
        self.verifications.outgoing_requests()
    }

    /// Mark the request with the given id as successfully sent.
    pub async fn mark_request_as_sent(
        &self,
        request_id: &TransactionId,
    ) -> Result<(), CryptoStoreError> {
        let Some(request) = self.verifications.queue().remove(request_id) else {
            trace!(?request_id, "Marking an unknown request as sent");
            return Ok(());
        };

        let owner = request.owner;

        if let Some(sas) = self.get_sas(&owner.other_user_id, &owner.flow_id) {
            sas.mark_as_sent(owner.message_type).await?;
        }

        Ok(())
    }

    /// Mark the request with the given id as failed.
    ///
    /// A flow can't continue if one of its messages couldn't be delivered, the
    /// flow is cancelled without notifying the other side.
    pub async fn mark_request_as_failed(
        &self,
        request_id: &TransactionId,
    ) -> Result<(), CryptoStoreError> {
        let Some(request) = self.verifications.queue().remove(request_id) else {
            trace!(?request_id, "Marking an unknown request as failed");
            return Ok(());
        };

        let owner = request.owner;
        warn!(flow_id = owner.flow_id, ?request_id, "Failed to send a verification message");

        self.verifications.queue().remove_flow(&owner.other_user_id, &owner.flow_id);

        if let Some(sas) = self.get_sas(&owner.other_user_id, &owner.flow_id) {
            sas.mark_as_failed().await?;
        }

        Ok(())
    }

    /// Cancel the flows that timed out.
    ///
    /// Flows that are verified or cancelled are forgotten right away, this
    /// only needs to be called to notice flows where the other side went
    /// silent.
    pub async fn garbage_collect(&self) -> Result<(), CryptoStoreError> {
        for sas in self.verifications.get_all() {
            sas.cancel_if_timed_out().await?;
        }

        Ok(())
    }

    /// Handle a to-device event we received.
    ///
    /// Events that aren't verification events are ignored. A malformed
    /// verification event cancels the flow it belongs to, if the flow isn't
    /// known the deserialization error is returned.
    pub async fn receive_to_device_event(
        &self,
        sender: &UserId,
        event_type: &str,
        content: Value,
    ) -> Result<(), VerificationError> {
        let flow_id =
            content.get("transaction_id").and_then(Value::as_str).map(ToOwned::to_owned);

        match AnyVerificationContent::from_parts(event_type, content) {
            Ok(Some(content)) => self.receive_verification_content(sender, content).await,
            Ok(None) => Ok(()),
            Err(e) => {
                let Some(sas) = flow_id.and_then(|f| self.get_sas(sender, &f)) else {
                    return Err(e.into());
                };

                warn!(
                    ?sender,
                    flow_id = sas.flow_id(),
                    event_type,
                    "Received a malformed verification event, cancelling the flow: {e}"
                );

                sas.cancel_with_code(CancelCode::InvalidMessage).await?;

                Ok(())
            }
        }
    }

    /// Handle the content of a verification event we received.
    #[instrument(skip_all, fields(?sender, flow_id = content.flow_id()))]
    pub async fn receive_verification_content(
        &self,
        sender: &UserId,
        content: AnyVerificationContent,
    ) -> Result<(), VerificationError> {
        if let Some(sas) = self.get_sas(sender, content.flow_id()) {
            sas.receive(content).await?;
            return Ok(());
        }

        match content {
            AnyVerificationContent::Start(start) => self.receive_start(sender, start).await,
            _ => {
                warn!(
                    event_type = content.event_type(),
                    "Received a verification event for an unknown flow"
                );
                Ok(())
            }
        }
    }

    async fn receive_start(
        &self,
        sender: &UserId,
        start: StartContent,
    ) -> Result<(), VerificationError> {
        if sender == self.own_user_id() && *start.from_device == *self.own_device_id() {
            trace!("The start event was sent by our own device, ignoring it");
            return Ok(());
        }

        info!(from_device = start.from_device.as_str(), "Received a new SAS verification");

        let Some(device) = self.store.get_device(sender, &start.from_device).await? else {
            warn!(
                from_device = start.from_device.as_str(),
                "Received a verification start from an unknown device"
            );
            return Ok(());
        };

        let ids = SasIds {
            account: self.store.account.clone(),
            other_device: device,
            other_devices: self.store.get_user_devices(sender).await?,
        };

        let existing = self.live_verifications(sender);

        let sas = Sas::new_incoming(
            ids,
            start.transaction_id.as_str().into(),
            self.store.clone(),
            self.settings.clone(),
            self.verifications.clone(),
            self.updates.clone(),
        );
        self.verifications.insert(sas.clone());

        sas.receive(AnyVerificationContent::Start(start)).await?;

        if !existing.is_empty() {
            warn!(
                flow_id = sas.flow_id(),
                "A verification with the user is already going on, cancelling all of them"
            );

            Self::cancel_all(&existing).await?;
            sas.cancel_with_code(CancelCode::UnexpectedMessage).await?;
        }

        Ok(())
    }

    fn live_verifications(&self, user_id: &UserId) -> Vec<Sas> {
        self.verifications.get_for_user(user_id).into_iter().filter(|s| !s.is_done()).collect()
    }

    async fn cancel_all(verifications: &[Sas]) -> Result<(), CryptoStoreError> {
        for sas in verifications {
            debug!(flow_id = sas.flow_id(), "Cancelling a verification");
            sas.cancel_with_code(CancelCode::UnexpectedMessage).await?;
        }

        Ok(())
    }
}
