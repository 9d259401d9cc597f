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

mod helpers;
mod inner_sas;
mod sas_state;

use std::{collections::VecDeque, sync::Arc};

use eyeball::SharedObservable;
use futures_core::Stream;
use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument};

pub(crate) use helpers::SasIds;
use helpers::emoji_from_index;
use inner_sas::{InnerSas, SasEffect, SasInput};
pub use sas_state::SasState;

use super::{
    cache::{RequestInfo, VerificationCache},
    event_enums::{AnyVerificationContent, MessageType},
    CancelCode, CancelInfo, Emoji, ShortAuthenticationString, VerificationStore,
    VerificationUpdate,
};
use crate::{
    config::VerificationSettings, identities::DeviceData, requests::ToDeviceRequest,
    store::CryptoStoreError, utilities::StdMutex,
};

/// Short authentication string object.
///
/// Every `Sas` object represents a single verification flow between our own
/// device and a device of another user, or another device of our own user.
/// Messages that need to be sent out are queued up in the
/// [`VerificationMachine`](super::VerificationMachine) that created the flow,
/// the machine forgets about the flow as soon as it is verified or cancelled.
#[derive(Clone, Debug)]
pub struct Sas {
    inner: Arc<StdMutex<InnerSas>>,
    state: SharedObservable<SasState>,
    flow_id: Arc<str>,
    other_user_id: OwnedUserId,
    other_device_id: OwnedDeviceId,
    we_started: bool,
    store: VerificationStore,
    settings: Arc<VerificationSettings>,
    verifications: VerificationCache,
    updates: broadcast::Sender<VerificationUpdate>,
}

impl Sas {
    fn new(
        inner: InnerSas,
        store: VerificationStore,
        settings: Arc<VerificationSettings>,
        verifications: VerificationCache,
        updates: broadcast::Sender<VerificationUpdate>,
    ) -> Self {
        Self {
            state: SharedObservable::new(inner.state().clone()),
            flow_id: inner.flow_id().clone(),
            other_user_id: inner.other_user_id().to_owned(),
            other_device_id: inner.other_device_id().to_owned(),
            we_started: inner.we_started(),
            inner: Arc::new(StdMutex::new(inner)),
            store,
            settings,
            verifications,
            updates,
        }
    }

    /// Create a new outgoing flow, the start message still needs to be sent
    /// out using [`Sas::start()`].
    pub(crate) fn new_outgoing(
        ids: SasIds,
        flow_id: Arc<str>,
        store: VerificationStore,
        settings: Arc<VerificationSettings>,
        verifications: VerificationCache,
        updates: broadcast::Sender<VerificationUpdate>,
    ) -> Self {
        let inner = InnerSas::new_outgoing(ids, flow_id, &settings);
        Self::new(inner, store, settings, verifications, updates)
    }

    /// Create a new incoming flow, the start message still needs to be passed
    /// to [`Sas::receive()`].
    pub(crate) fn new_incoming(
        ids: SasIds,
        flow_id: Arc<str>,
        store: VerificationStore,
        settings: Arc<VerificationSettings>,
        verifications: VerificationCache,
        updates: broadcast::Sender<VerificationUpdate>,
    ) -> Self {
        let inner = InnerSas::new_incoming(ids, flow_id);
        Self::new(inner, store, settings, verifications, updates)
    }

    /// Our own user id.
    pub fn user_id(&self) -> &UserId {
        self.store.account.user_id()
    }

    /// Our own device ID.
    pub fn device_id(&self) -> &DeviceId {
        self.store.account.device_id()
    }

    /// Get the user id of the other side.
    pub fn other_user_id(&self) -> &UserId {
        &self.other_user_id
    }

    /// Get the device ID of the other side.
    pub fn other_device_id(&self) -> &DeviceId {
        &self.other_device_id
    }

    /// Get the device of the other user.
    pub fn other_device(&self) -> DeviceData {
        self.inner.lock().other_device().clone()
    }

    /// Get the unique ID that identifies this SAS verification flow.
    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    /// Did we initiate the verification flow.
    pub fn we_started(&self) -> bool {
        self.we_started
    }

    /// Get the current state of the verification flow.
    pub fn state(&self) -> SasState {
        self.state.get()
    }

    /// Listen for changes of the state of this verification flow.
    ///
    /// The current state is not part of the stream.
    pub fn changes(&self) -> impl Stream<Item = SasState> {
        self.state.subscribe()
    }

    /// Is the SAS flow done, either verified or cancelled.
    pub fn is_done(&self) -> bool {
        self.state.read().is_done()
    }

    /// Has the SAS verification flow been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state.read().is_cancelled()
    }

    /// Get info about the cancellation if the verification flow has been
    /// cancelled.
    pub fn cancel_info(&self) -> Option<CancelInfo> {
        self.state.read().cancel_info().cloned()
    }

    /// Are we in a state where we can show the short auth string.
    pub fn can_be_presented(&self) -> bool {
        self.state.read().can_be_presented()
    }

    /// Does this verification flow support displaying emoji for the short
    /// authentication string.
    pub fn supports_emoji(&self) -> bool {
        self.inner.lock().supports_emoji()
    }

    /// Has the verification flow timed out.
    pub fn timed_out(&self) -> bool {
        self.inner.lock().timed_out(&self.settings)
    }

    /// Get the decimal version of the short auth string.
    ///
    /// Returns a tuple containing three 4-digit integers that represent the
    /// short auth string, or `None` if the short auth string can't be shown
    /// yet.
    pub fn decimals(&self) -> Option<(u16, u16, u16)> {
        self.inner.lock().decimals()
    }

    /// Get the index of the emoji representing the short auth string.
    ///
    /// Returns seven numbers between 0 and 63 that can be used to look up a
    /// translated description of the emojis, or `None` if the short auth
    /// string can't be shown yet or the emoji method wasn't agreed upon.
    pub fn emoji_index(&self) -> Option<[u8; 7]> {
        self.inner.lock().emoji_index()
    }

    /// Get the emoji version of the short auth string.
    pub fn emoji(&self) -> Option<[Emoji; 7]> {
        self.emoji_index().map(|indices| indices.map(emoji_from_index))
    }

    /// Get a printable version of the short auth string in the given format.
    ///
    /// The decimals are separated by a space, for the emoji method the
    /// symbols are separated by a space.
    pub fn short_code_representation(&self, format: &ShortAuthenticationString) -> Option<String> {
        match format {
            ShortAuthenticationString::Decimal => {
                let (first, second, third) = self.decimals()?;
                Some(format!("{first} {second} {third}"))
            }
            ShortAuthenticationString::Emoji => {
                let emojis = self.emoji()?;
                Some(emojis.iter().map(|e| e.symbol).collect::<Vec<_>>().join(" "))
            }
            _ => None,
        }
    }

    /// Send out the start message of an outgoing flow.
    pub(crate) async fn start(&self) -> Result<(), CryptoStoreError> {
        self.process(SasInput::Start).await
    }

    /// Accept the SAS verification.
    ///
    /// This does nothing if the verification was already accepted or if we
    /// are the side that started it.
    #[instrument(skip_all, fields(flow_id = %self.flow_id))]
    pub async fn accept(&self) -> Result<(), CryptoStoreError> {
        self.process(SasInput::Accept).await
    }

    /// Confirm that the short auth strings match on both sides.
    ///
    /// This sends out our MAC, the other device gets marked as verified once
    /// the MAC of the other side was checked as well.
    #[instrument(skip_all, fields(flow_id = %self.flow_id))]
    pub async fn confirm(&self) -> Result<(), CryptoStoreError> {
        self.process(SasInput::Confirm).await
    }

    /// Tell the other side that the short auth strings don't match, this
    /// cancels the verification.
    #[instrument(skip_all, fields(flow_id = %self.flow_id))]
    pub async fn mismatch(&self) -> Result<(), CryptoStoreError> {
        self.process(SasInput::Mismatch).await
    }

    /// Cancel the verification.
    #[instrument(skip_all, fields(flow_id = %self.flow_id))]
    pub async fn cancel(&self) -> Result<(), CryptoStoreError> {
        self.cancel_with_code(CancelCode::User).await
    }

    /// Cancel the verification with the given cancel code.
    pub async fn cancel_with_code(&self, code: CancelCode) -> Result<(), CryptoStoreError> {
        self.process(SasInput::Cancel(code)).await
    }

    pub(crate) async fn receive(
        &self,
        content: AnyVerificationContent,
    ) -> Result<(), CryptoStoreError> {
        self.process(SasInput::Received(content)).await
    }

    pub(crate) async fn mark_as_sent(
        &self,
        message_type: MessageType,
    ) -> Result<(), CryptoStoreError> {
        self.process(SasInput::Sent(message_type)).await
    }

    pub(crate) async fn mark_as_failed(&self) -> Result<(), CryptoStoreError> {
        self.process(SasInput::SendFailed).await
    }

    /// Cancel the flow with a timeout if it took too long.
    ///
    /// Returns `true` if the flow got cancelled.
    pub(crate) async fn cancel_if_timed_out(&self) -> Result<bool, CryptoStoreError> {
        if self.is_done() || !self.timed_out() {
            return Ok(false);
        }

        info!(flow_id = %self.flow_id, "The verification timed out, cancelling");
        self.cancel_with_code(CancelCode::Timeout).await?;

        Ok(true)
    }

    #[cfg(test)]
    pub(crate) fn set_creation_time(&self, time: std::time::Instant) {
        self.inner.lock().set_creation_time(time);
    }

    /// Run the inputs through the state machine and carry out the effects.
    async fn process(&self, input: SasInput) -> Result<(), CryptoStoreError> {
        let mut inputs = VecDeque::from([input]);
        let mut result = Ok(());

        while let Some(input) = inputs.pop_front() {
            let effects = self.inner.lock().transition(input);

            for effect in effects {
                match effect {
                    SasEffect::Send(content) => self.queue(content),
                    SasEffect::StateChanged(state) => {
                        let done = state.is_done();
                        self.publish(state);

                        if done {
                            self.verifications.remove(&self.other_user_id, &self.flow_id);
                        }
                    }
                    SasEffect::MarkVerified(devices) => {
                        let input = match self.store.mark_devices_as_verified(&devices).await {
                            Ok(true) => SasInput::MarkedVerified,
                            Ok(false) => SasInput::Cancel(CancelCode::KeyMismatch),
                            Err(e) => {
                                error!(
                                    flow_id = %self.flow_id,
                                    "Couldn't mark the devices as verified: {e:?}"
                                );
                                result = Err(e);
                                SasInput::Cancel(CancelCode::User)
                            }
                        };

                        inputs.push_back(input);
                    }
                }
            }
        }

        result
    }

    fn queue(&self, content: AnyVerificationContent) {
        let json = match content.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!(flow_id = %self.flow_id, "Couldn't serialize a verification message: {e:?}");
                return;
            }
        };

        let request = ToDeviceRequest::new(
            &self.other_user_id,
            &self.other_device_id,
            content.event_type(),
            json,
        );

        debug!(
            flow_id = %self.flow_id,
            request_id = %request.txn_id,
            event_type = content.event_type(),
            "Queuing a verification message"
        );

        let owner = RequestInfo {
            other_user_id: self.other_user_id.clone(),
            flow_id: self.flow_id.to_string(),
            message_type: content.message_type(),
        };

        self.verifications.queue().push(request, owner);
    }

    fn publish(&self, state: SasState) {
        if state == SasState::Verified {
            info!(
                flow_id = %self.flow_id,
                other_user_id = ?self.other_user_id,
                other_device_id = ?self.other_device_id,
                "Successfully verified the device"
            );
        }

        self.state.set(state.clone());

        // Nobody might be listening, that's fine.
        let _ = self.updates.send(VerificationUpdate {
            other_user_id: self.other_user_id.clone(),
            other_device_id: self.other_device_id.clone(),
            flow_id: self.flow_id.to_string(),
            state,
        });
    }
}
