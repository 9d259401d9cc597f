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

use std::{fmt, mem, sync::Arc, time::Instant};

use ruma::{
    events::key::verification::start::{self, StartMethod},
    serde::Base64,
    DeviceId, OwnedTransactionId, UserId,
};
use tracing::{trace, warn};
use vodozemac::{
    sas::{EstablishedSas, Sas as OlmSas},
    Curve25519PublicKey,
};

use super::{
    helpers::{
        bytes_to_decimal, bytes_to_emoji_index, calculate_commitment, get_mac_content,
        receive_mac_content, short_code_bytes, SasIds,
    },
    sas_state::{AcceptedProtocols, SasState},
};
use crate::{
    config::VerificationSettings,
    identities::DeviceData,
    olm::Account,
    verification::{
        event_enums::{
            canonical_json, AcceptContent, AnyVerificationContent, CancelContent, KeyContent,
            MacContent, MessageType, StartContent,
        },
        CancelCode, CancelInfo, ShortAuthenticationString,
    },
};

/// Something that happened to a SAS flow.
#[derive(Clone, Debug)]
pub(crate) enum SasInput {
    /// Send out the `m.key.verification.start` message of an outgoing flow.
    Start,
    /// The user accepted an incoming flow.
    Accept,
    /// The user confirmed that the short auth strings match.
    Confirm,
    /// The user told us that the short auth strings don't match.
    Mismatch,
    /// The flow should be cancelled with the given code.
    Cancel(CancelCode),
    /// We received a message from the other side.
    Received(AnyVerificationContent),
    /// A message we sent out reached the server.
    Sent(MessageType),
    /// A message we tried to send out couldn't be delivered.
    SendFailed,
    /// The devices we verified were marked as verified in the store.
    MarkedVerified,
}

/// The reaction of a SAS flow to a [`SasInput`].
#[derive(Clone, Debug)]
pub(crate) enum SasEffect {
    /// The message should be sent to the other device.
    Send(AnyVerificationContent),
    /// The given devices passed the MAC check and should be marked as verified.
    MarkVerified(Vec<DeviceData>),
    /// The flow moved into a new state.
    StateChanged(SasState),
}

enum SasKeys {
    Pending(OlmSas),
    Established(EstablishedSas),
    Released,
}

impl fmt::Debug for SasKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SasKeys::Pending(_) => "Pending",
            SasKeys::Established(_) => "Established",
            SasKeys::Released => "Released",
        };

        f.debug_tuple("SasKeys").field(&name).finish()
    }
}

/// The state machine of a single SAS flow.
///
/// Every input is handled synchronously, the effects need to be carried out
/// by the caller.
#[derive(Debug)]
pub(crate) struct InnerSas {
    ids: SasIds,
    flow_id: Arc<str>,
    we_started: bool,
    state: SasState,
    keys: SasKeys,
    start_content: Option<StartContent>,
    protocols: Option<AcceptedProtocols>,
    their_commitment: Option<Base64>,
    short_code: Option<[u8; 6]>,
    their_mac: Option<MacContent>,
    creation_time: Instant,
}

impl InnerSas {
    fn new(ids: SasIds, flow_id: Arc<str>, we_started: bool) -> Self {
        Self {
            ids,
            flow_id,
            we_started,
            state: SasState::Created,
            keys: SasKeys::Pending(OlmSas::new()),
            start_content: None,
            protocols: None,
            their_commitment: None,
            short_code: None,
            their_mac: None,
            creation_time: Instant::now(),
        }
    }

    /// Create a new flow where we are the side that sends the start message.
    pub fn new_outgoing(ids: SasIds, flow_id: Arc<str>, settings: &VerificationSettings) -> Self {
        let mut sas = Self::new(ids, flow_id, true);

        let method = StartMethod::SasV1(
            start::SasV1ContentInit {
                key_agreement_protocols: settings.key_agreement_protocols.clone(),
                hashes: settings.hashes.clone(),
                message_authentication_codes: settings.message_authentication_codes.clone(),
                short_authentication_string: settings.short_authentication_string.clone(),
            }
            .into(),
        );

        sas.start_content = Some(StartContent::new(
            sas.ids.account.device_id().to_owned(),
            sas.transaction_id(),
            method,
        ));

        sas
    }

    /// Create a new flow for a start message the other side sent us.
    ///
    /// The start message itself needs to be passed in as a
    /// [`SasInput::Received`] input.
    pub fn new_incoming(ids: SasIds, flow_id: Arc<str>) -> Self {
        Self::new(ids, flow_id, false)
    }

    pub fn state(&self) -> &SasState {
        &self.state
    }

    pub fn flow_id(&self) -> &Arc<str> {
        &self.flow_id
    }

    fn transaction_id(&self) -> OwnedTransactionId {
        OwnedTransactionId::from(&*self.flow_id)
    }

    pub fn we_started(&self) -> bool {
        self.we_started
    }

    pub fn account(&self) -> &Account {
        &self.ids.account
    }

    pub fn other_user_id(&self) -> &UserId {
        self.ids.other_device.user_id()
    }

    pub fn other_device_id(&self) -> &DeviceId {
        self.ids.other_device.device_id()
    }

    pub fn other_device(&self) -> &DeviceData {
        &self.ids.other_device
    }

    pub fn supports_emoji(&self) -> bool {
        self.protocols
            .as_ref()
            .is_some_and(|p| p.short_auth_string.contains(&ShortAuthenticationString::Emoji))
    }

    pub fn decimals(&self) -> Option<(u16, u16, u16)> {
        self.presentable_short_code().map(bytes_to_decimal)
    }

    pub fn emoji_index(&self) -> Option<[u8; 7]> {
        if self.supports_emoji() {
            self.presentable_short_code().map(bytes_to_emoji_index)
        } else {
            None
        }
    }

    pub fn timed_out(&self, settings: &VerificationSettings) -> bool {
        self.creation_time.elapsed() > settings.timeout
    }

    #[cfg(test)]
    pub fn set_creation_time(&mut self, time: Instant) {
        self.creation_time = time;
    }

    fn presentable_short_code(&self) -> Option<&[u8; 6]> {
        if self.state.can_be_presented() {
            self.short_code.as_ref()
        } else {
            None
        }
    }

    /// Feed an input into the state machine.
    ///
    /// Returns the list of effects the input produced, a flow that reached a
    /// final state ignores every further input.
    pub fn transition(&mut self, input: SasInput) -> Vec<SasEffect> {
        let mut effects = Vec::new();

        if self.state.is_done() {
            trace!(flow_id = %self.flow_id, ?input, "Ignoring an input for a finished flow");
            return effects;
        }

        trace!(flow_id = %self.flow_id, state = ?self.state, ?input, "Handling a SAS input");

        let result = match input {
            SasInput::Start => self.start(&mut effects),
            SasInput::Accept => self.accept(&mut effects),
            SasInput::Confirm => self.confirm(&mut effects),
            SasInput::Mismatch => Err(CancelCode::MismatchedSas),
            SasInput::Cancel(code) => {
                let notify_other_side = self.state != SasState::Created;
                self.cancel(code, notify_other_side, &mut effects);
                Ok(())
            }
            SasInput::Received(content) => self.receive(content, &mut effects),
            SasInput::Sent(message_type) => self.mark_as_sent(message_type, &mut effects),
            SasInput::SendFailed => {
                self.cancel(CancelCode::User, false, &mut effects);
                Ok(())
            }
            SasInput::MarkedVerified => {
                if self.state == SasState::Verifying {
                    self.set_state(SasState::Verified, &mut effects);
                }
                Ok(())
            }
        };

        if let Err(code) = result {
            self.cancel(code, true, &mut effects);
        }

        effects
    }

    fn set_state(&mut self, state: SasState, effects: &mut Vec<SasEffect>) {
        trace!(
            flow_id = %self.flow_id,
            old_state = ?self.state,
            new_state = ?state,
            "SAS transition"
        );

        if state.is_done() {
            self.keys = SasKeys::Released;
        }

        self.state = state.clone();
        effects.push(SasEffect::StateChanged(state));
    }

    fn send(&self, content: AnyVerificationContent, effects: &mut Vec<SasEffect>) {
        effects.push(SasEffect::Send(content));
    }

    fn cancel(&mut self, code: CancelCode, notify_other_side: bool, effects: &mut Vec<SasEffect>) {
        let info = CancelInfo::new(true, code);

        if notify_other_side {
            let content = CancelContent::new(
                self.transaction_id(),
                info.reason().to_owned(),
                info.cancel_code().clone(),
            );

            self.send(AnyVerificationContent::Cancel(content), effects);
        }

        self.set_state(SasState::Cancelled(info), effects);
    }

    fn start(&mut self, effects: &mut Vec<SasEffect>) -> Result<(), CancelCode> {
        match (&self.state, &self.start_content) {
            (SasState::Created, Some(content)) if self.we_started => {
                self.send(AnyVerificationContent::Start(content.clone()), effects);
                self.set_state(SasState::SendingStart, effects);
            }
            _ => warn!(flow_id = %self.flow_id, state = ?self.state, "Can't start the flow"),
        }

        Ok(())
    }

    fn accept(&mut self, effects: &mut Vec<SasEffect>) -> Result<(), CancelCode> {
        if self.state != SasState::OnStarted {
            warn!(flow_id = %self.flow_id, state = ?self.state, "Can't accept the flow");
            return Ok(());
        }

        let (SasKeys::Pending(sas), Some(start), Some(protocols)) =
            (&self.keys, &self.start_content, &self.protocols)
        else {
            return Err(CancelCode::UnexpectedMessage);
        };

        let canonical_start = canonical_json(start).ok_or(CancelCode::InvalidMessage)?;
        let commitment = calculate_commitment(sas.public_key(), &canonical_start);
        let content = protocols.as_accept_content(&self.flow_id, commitment);

        self.send(AnyVerificationContent::Accept(content), effects);
        self.set_state(SasState::SendingAccept, effects);

        Ok(())
    }

    fn confirm(&mut self, effects: &mut Vec<SasEffect>) -> Result<(), CancelCode> {
        if self.state != SasState::ShortCodeReady {
            warn!(
                flow_id = %self.flow_id,
                state = ?self.state,
                "Can't confirm the short auth string"
            );
            return Ok(());
        }

        let (SasKeys::Established(sas), Some(protocols)) = (&self.keys, &self.protocols) else {
            return Err(CancelCode::UnexpectedMessage);
        };

        let content =
            get_mac_content(sas, &self.ids, &self.flow_id, protocols.message_auth_code)?;

        self.set_state(SasState::ShortCodeAccepted, effects);
        self.send(AnyVerificationContent::Mac(content), effects);
        self.set_state(SasState::SendingMac, effects);

        Ok(())
    }

    fn mark_as_sent(
        &mut self,
        message_type: MessageType,
        effects: &mut Vec<SasEffect>,
    ) -> Result<(), CancelCode> {
        match (message_type, &self.state) {
            (MessageType::Start, SasState::SendingStart) => {
                self.set_state(SasState::Started, effects)
            }
            (MessageType::Accept, SasState::SendingAccept) => {
                self.set_state(SasState::Accepted, effects)
            }
            (MessageType::Key, SasState::SendingKey) => {
                self.set_state(SasState::KeySent, effects);

                if !self.we_started {
                    self.set_state(SasState::ShortCodeReady, effects);
                }
            }
            (MessageType::Mac, SasState::SendingMac) => {
                self.set_state(SasState::MacSent, effects);

                if let Some(content) = self.their_mac.clone() {
                    self.verify_mac(&content, effects)?;
                }
            }
            // The next message of the other side can overtake the send
            // confirmation, in that case we already moved on.
            _ => {
                trace!(flow_id = %self.flow_id, ?message_type, "Ignoring a stale send confirmation")
            }
        }

        Ok(())
    }

    fn receive(
        &mut self,
        content: AnyVerificationContent,
        effects: &mut Vec<SasEffect>,
    ) -> Result<(), CancelCode> {
        match content {
            AnyVerificationContent::Cancel(content) => {
                let info = CancelInfo::from_other_side(content.code, content.reason);
                self.set_state(SasState::OnCancelled(info), effects);
                Ok(())
            }
            AnyVerificationContent::Start(content) => self.receive_start(content, effects),
            AnyVerificationContent::Accept(content) => self.receive_accept(content, effects),
            AnyVerificationContent::Key(content) => self.receive_key(content, effects),
            AnyVerificationContent::Mac(content) => self.receive_mac(content, effects),
        }
    }

    fn receive_start(
        &mut self,
        content: StartContent,
        effects: &mut Vec<SasEffect>,
    ) -> Result<(), CancelCode> {
        if self.we_started || self.state != SasState::Created {
            return Err(CancelCode::UnexpectedMessage);
        }

        if canonical_json(&content).is_none() {
            return Err(CancelCode::InvalidMessage);
        }

        self.protocols = Some(AcceptedProtocols::negotiate(&content)?);
        self.start_content = Some(content);
        self.set_state(SasState::OnStarted, effects);

        Ok(())
    }

    fn receive_accept(
        &mut self,
        content: AcceptContent,
        effects: &mut Vec<SasEffect>,
    ) -> Result<(), CancelCode> {
        if !self.we_started || !matches!(self.state, SasState::SendingStart | SasState::Started) {
            return Err(CancelCode::UnexpectedMessage);
        }

        if self.state == SasState::SendingStart {
            self.set_state(SasState::Started, effects);
        }

        let (SasKeys::Pending(sas), Some(start)) = (&self.keys, &self.start_content) else {
            return Err(CancelCode::UnexpectedMessage);
        };

        let (protocols, commitment) = AcceptedProtocols::from_accept(&content, start)?;
        let our_key = Base64::new(sas.public_key().as_bytes().to_vec());
        let key = KeyContent::new(self.transaction_id(), our_key);

        self.protocols = Some(protocols);
        self.their_commitment = Some(commitment);
        self.set_state(SasState::OnAccepted, effects);

        self.send(AnyVerificationContent::Key(key), effects);
        self.set_state(SasState::SendingKey, effects);

        Ok(())
    }

    fn receive_key(
        &mut self,
        content: KeyContent,
        effects: &mut Vec<SasEffect>,
    ) -> Result<(), CancelCode> {
        let their_key = Curve25519PublicKey::from_slice(content.key.as_bytes())
            .map_err(|_| CancelCode::InvalidMessage)?;

        if self.we_started {
            if !matches!(self.state, SasState::SendingKey | SasState::KeySent) {
                return Err(CancelCode::UnexpectedMessage);
            }

            if self.state == SasState::SendingKey {
                self.set_state(SasState::KeySent, effects);
            }

            let canonical_start = self
                .start_content
                .as_ref()
                .and_then(canonical_json)
                .ok_or(CancelCode::InvalidMessage)?;

            if self.their_commitment.as_ref()
                != Some(&calculate_commitment(their_key, &canonical_start))
            {
                warn!(
                    flow_id = %self.flow_id,
                    "The commitment of the other side doesn't match its key"
                );
                return Err(CancelCode::MismatchedCommitment);
            }

            self.establish(their_key)?;
            self.set_state(SasState::ShortCodeReady, effects);
        } else {
            if !matches!(self.state, SasState::SendingAccept | SasState::Accepted) {
                return Err(CancelCode::UnexpectedMessage);
            }

            if self.state == SasState::SendingAccept {
                self.set_state(SasState::Accepted, effects);
            }

            let our_key = self.establish(their_key)?;
            let content =
                KeyContent::new(self.transaction_id(), Base64::new(our_key.as_bytes().to_vec()));

            self.send(AnyVerificationContent::Key(content), effects);
            self.set_state(SasState::SendingKey, effects);
        }

        Ok(())
    }

    /// Run the key agreement and derive the short auth string.
    ///
    /// Returns our own ephemeral public key.
    fn establish(
        &mut self,
        their_key: Curve25519PublicKey,
    ) -> Result<Curve25519PublicKey, CancelCode> {
        let Some(protocols) = &self.protocols else {
            return Err(CancelCode::UnexpectedMessage);
        };
        let key_agreement = protocols.key_agreement_protocol;

        let SasKeys::Pending(sas) = mem::replace(&mut self.keys, SasKeys::Released) else {
            return Err(CancelCode::UnexpectedMessage);
        };

        let sas = sas.diffie_hellman(their_key).map_err(|_| CancelCode::InvalidMessage)?;
        let our_key = sas.our_public_key();

        self.short_code =
            Some(short_code_bytes(&sas, &self.ids, key_agreement, &self.flow_id, self.we_started));
        self.keys = SasKeys::Established(sas);

        Ok(our_key)
    }

    fn receive_mac(
        &mut self,
        content: MacContent,
        effects: &mut Vec<SasEffect>,
    ) -> Result<(), CancelCode> {
        if self.their_mac.is_some() {
            return Err(CancelCode::UnexpectedMessage);
        }

        match self.state {
            SasState::SendingKey
            | SasState::KeySent
            | SasState::ShortCodeReady
            | SasState::ShortCodeAccepted
                if self.short_code.is_some() =>
            {
                if self.state == SasState::SendingKey {
                    self.set_state(SasState::KeySent, effects);
                }

                if self.state == SasState::KeySent {
                    self.set_state(SasState::ShortCodeReady, effects);
                }

                self.their_mac = Some(content);

                Ok(())
            }
            SasState::SendingMac | SasState::MacSent => {
                if self.state == SasState::SendingMac {
                    self.set_state(SasState::MacSent, effects);
                }

                self.their_mac = Some(content.clone());
                self.verify_mac(&content, effects)
            }
            _ => Err(CancelCode::UnexpectedMessage),
        }
    }

    fn verify_mac(
        &mut self,
        content: &MacContent,
        effects: &mut Vec<SasEffect>,
    ) -> Result<(), CancelCode> {
        let (SasKeys::Established(sas), Some(protocols)) = (&self.keys, &self.protocols) else {
            return Err(CancelCode::UnexpectedMessage);
        };

        let mac_method = protocols.message_auth_code;
        let devices = receive_mac_content(sas, &self.ids, &self.flow_id, mac_method, content)?;

        self.set_state(SasState::Verifying, effects);
        effects.push(SasEffect::MarkVerified(devices));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Arc};

    use assert_matches::assert_matches;
    use ruma::{
        device_id,
        events::key::verification::{
            accept::AcceptMethod,
            start::{SasV1Content, StartMethod},
        },
        serde::Base64,
        user_id,
    };

    use super::{InnerSas, SasEffect, SasInput};
    use crate::{
        config::VerificationSettings,
        identities::{testing::device_and_account, DeviceData},
        olm::Account,
        verification::{
            event_enums::{AnyVerificationContent, MacContent, MessageType},
            sas::{helpers::SasIds, SasState},
            CancelCode, KeyAgreementProtocol, MessageAuthenticationCode,
            ShortAuthenticationString,
        },
    };

    fn sas_pair(settings: &VerificationSettings) -> (InnerSas, InnerSas) {
        let (alice_account, alice_device) =
            device_and_account(user_id!("@alice:example.org"), device_id!("ALICEDEVICE"));

        sas_pair_with(settings, alice_account, alice_device)
    }

    /// Create a pair of flows where Bob thinks that Alice's device is
    /// `alice_device`.
    fn sas_pair_with(
        settings: &VerificationSettings,
        alice_account: Account,
        alice_device: DeviceData,
    ) -> (InnerSas, InnerSas) {
        let (bob_account, bob_device) =
            device_and_account(user_id!("@bob:example.org"), device_id!("BOBDEVICE"));

        let flow_id: Arc<str> = "flow".into();

        let alice_ids = SasIds {
            account: alice_account,
            other_device: bob_device.clone(),
            other_devices: BTreeMap::from([(bob_device.device_id().to_owned(), bob_device)]),
        };
        let bob_ids = SasIds {
            account: bob_account,
            other_device: alice_device.clone(),
            other_devices: BTreeMap::from([(alice_device.device_id().to_owned(), alice_device)]),
        };

        (
            InnerSas::new_outgoing(alice_ids, flow_id.clone(), settings),
            InnerSas::new_incoming(bob_ids, flow_id),
        )
    }

    fn sent(effects: &[SasEffect]) -> Vec<AnyVerificationContent> {
        effects
            .iter()
            .filter_map(|e| match e {
                SasEffect::Send(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    fn single_message(effects: &[SasEffect]) -> AnyVerificationContent {
        let mut messages = sent(effects);
        assert_eq!(messages.len(), 1, "Expected a single message, got {messages:?}");
        messages.remove(0)
    }

    /// Run both sides up to the point where the short auth string can be
    /// shown, confirming every send right away.
    fn exchange_keys(alice: &mut InnerSas, bob: &mut InnerSas) {
        let start = single_message(&alice.transition(SasInput::Start));
        alice.transition(SasInput::Sent(MessageType::Start));
        bob.transition(SasInput::Received(start));
        assert_eq!(bob.state(), &SasState::OnStarted);

        let accept = single_message(&bob.transition(SasInput::Accept));
        bob.transition(SasInput::Sent(MessageType::Accept));

        let key = single_message(&alice.transition(SasInput::Received(accept)));
        assert_eq!(alice.state(), &SasState::SendingKey);
        alice.transition(SasInput::Sent(MessageType::Key));

        let key = single_message(&bob.transition(SasInput::Received(key)));
        bob.transition(SasInput::Sent(MessageType::Key));
        assert_eq!(bob.state(), &SasState::ShortCodeReady);

        alice.transition(SasInput::Received(key));
        assert_eq!(alice.state(), &SasState::ShortCodeReady);
    }

    fn edit_start(start: &mut AnyVerificationContent, edit: impl FnOnce(&mut SasV1Content)) {
        assert_matches!(start, AnyVerificationContent::Start(content) => {
            assert_matches!(&mut content.method, StartMethod::SasV1(c) => edit(c));
        });
    }

    fn mac_content(mac: &mut AnyVerificationContent) -> &mut MacContent {
        assert_matches!(mac, AnyVerificationContent::Mac(content) => content)
    }

    fn assert_cancelled_with(effects: &[SasEffect], code: CancelCode) {
        assert!(!effects.iter().any(|e| matches!(e, SasEffect::MarkVerified(_))));

        let cancel = single_message(effects);
        assert_matches!(cancel, AnyVerificationContent::Cancel(c) => {
            assert_eq!(c.code, code);
        });
    }

    #[test]
    fn full_flow() {
        let (mut alice, mut bob) = sas_pair(&VerificationSettings::default());
        exchange_keys(&mut alice, &mut bob);

        assert!(alice.decimals().is_some());
        assert_eq!(alice.decimals(), bob.decimals());
        assert_eq!(alice.emoji_index(), bob.emoji_index());

        let alice_mac = single_message(&alice.transition(SasInput::Confirm));
        assert_eq!(alice.state(), &SasState::SendingMac);

        // The MAC of Alice arrives before Bob confirmed the short auth string.
        assert!(sent(&bob.transition(SasInput::Received(alice_mac))).is_empty());
        assert_eq!(bob.state(), &SasState::ShortCodeReady);

        let bob_mac = single_message(&bob.transition(SasInput::Confirm));
        let effects = bob.transition(SasInput::Sent(MessageType::Mac));
        assert_eq!(bob.state(), &SasState::Verifying);
        let devices = effects
            .iter()
            .find_map(|e| match e {
                SasEffect::MarkVerified(d) => Some(d.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_id(), device_id!("ALICEDEVICE"));

        bob.transition(SasInput::MarkedVerified);
        assert_eq!(bob.state(), &SasState::Verified);

        // The MAC of Bob arrives before the MAC of Alice was confirmed as sent.
        alice.transition(SasInput::Received(bob_mac));
        assert_eq!(alice.state(), &SasState::Verifying);
        alice.transition(SasInput::MarkedVerified);
        assert_eq!(alice.state(), &SasState::Verified);

        assert!(alice.transition(SasInput::Cancel(CancelCode::User)).is_empty());
        assert_eq!(alice.state(), &SasState::Verified);
    }

    #[test]
    fn legacy_protocols() {
        let settings = VerificationSettings {
            key_agreement_protocols: vec![KeyAgreementProtocol::Curve25519],
            message_authentication_codes: vec![MessageAuthenticationCode::HkdfHmacSha256],
            ..Default::default()
        };

        let (mut alice, mut bob) = sas_pair(&settings);
        exchange_keys(&mut alice, &mut bob);
        assert_eq!(alice.decimals(), bob.decimals());

        let alice_mac = single_message(&alice.transition(SasInput::Confirm));
        let bob_mac = single_message(&bob.transition(SasInput::Confirm));

        bob.transition(SasInput::Received(alice_mac));
        alice.transition(SasInput::Received(bob_mac));

        assert_eq!(alice.state(), &SasState::Verifying);
        assert_eq!(bob.state(), &SasState::Verifying);
    }

    #[test]
    fn tampered_commitment() {
        let (mut alice, mut bob) = sas_pair(&VerificationSettings::default());

        let start = single_message(&alice.transition(SasInput::Start));
        bob.transition(SasInput::Received(start));
        let mut accept = single_message(&bob.transition(SasInput::Accept));

        assert_matches!(&mut accept, AnyVerificationContent::Accept(content) => {
            assert_matches!(&mut content.method, AcceptMethod::SasV1(c) => {
                c.commitment =
                    Base64::parse("Q/NmNFEUS1fS+YeEmiZkjjblKTitrKOAk7cPEumcMlg").unwrap();
            });
        });

        let key = single_message(&alice.transition(SasInput::Received(accept)));
        let key = single_message(&bob.transition(SasInput::Received(key)));

        let cancel = single_message(&alice.transition(SasInput::Received(key)));
        assert_matches!(cancel, AnyVerificationContent::Cancel(ref c) => {
            assert_eq!(c.code, CancelCode::MismatchedCommitment);
        });
        assert_matches!(alice.state(), SasState::Cancelled(info) => {
            assert_eq!(info.cancel_code(), &CancelCode::MismatchedCommitment);
        });
        assert!(alice.decimals().is_none());

        bob.transition(SasInput::Received(cancel));
        assert_matches!(bob.state(), SasState::OnCancelled(info) => {
            assert!(!info.cancelled_by_us());
        });
    }

    /// Bob commits to a start content that differs from the one Alice sent.
    fn commitment_over_edited_start(edit: impl FnOnce(&mut SasV1Content)) {
        let (mut alice, mut bob) = sas_pair(&VerificationSettings::default());

        let mut start = single_message(&alice.transition(SasInput::Start));
        edit_start(&mut start, edit);

        bob.transition(SasInput::Received(start));
        assert_eq!(bob.state(), &SasState::OnStarted);
        let accept = single_message(&bob.transition(SasInput::Accept));

        let key = single_message(&alice.transition(SasInput::Received(accept)));
        assert_eq!(alice.state(), &SasState::SendingKey);
        let key = single_message(&bob.transition(SasInput::Received(key)));

        assert_cancelled_with(
            &alice.transition(SasInput::Received(key)),
            CancelCode::MismatchedCommitment,
        );
    }

    #[test]
    fn commitment_covers_the_whole_start_content() {
        commitment_over_edited_start(|c| c.short_authentication_string.reverse());
        commitment_over_edited_start(|c| {
            c.message_authentication_codes.push("org.example.mac".into())
        });
        commitment_over_edited_start(|c| {
            c.short_authentication_string = vec![ShortAuthenticationString::Emoji]
        });
    }

    #[test]
    fn mac_over_the_wrong_key() {
        let (alice_account, _) =
            device_and_account(user_id!("@alice:example.org"), device_id!("ALICEDEVICE"));
        // Same user and device id, but a different Ed25519 key.
        let (_, stale_device) =
            device_and_account(user_id!("@alice:example.org"), device_id!("ALICEDEVICE"));

        let (mut alice, mut bob) =
            sas_pair_with(&VerificationSettings::default(), alice_account, stale_device);
        exchange_keys(&mut alice, &mut bob);
        assert_eq!(alice.decimals(), bob.decimals());

        let alice_mac = single_message(&alice.transition(SasInput::Confirm));
        single_message(&bob.transition(SasInput::Confirm));

        assert_cancelled_with(
            &bob.transition(SasInput::Received(alice_mac)),
            CancelCode::KeyMismatch,
        );
        assert_matches!(bob.state(), SasState::Cancelled(info) => {
            assert_eq!(info.cancel_code(), &CancelCode::KeyMismatch);
        });
    }

    #[test]
    fn tampered_key_ids_mac() {
        let (mut alice, mut bob) = sas_pair(&VerificationSettings::default());
        exchange_keys(&mut alice, &mut bob);

        let mut alice_mac = single_message(&alice.transition(SasInput::Confirm));
        let content = mac_content(&mut alice_mac);
        let key_mac = content.mac.values().next().unwrap().clone();
        content.keys = key_mac;

        single_message(&bob.transition(SasInput::Confirm));

        assert_cancelled_with(
            &bob.transition(SasInput::Received(alice_mac)),
            CancelCode::KeyMismatch,
        );
    }

    #[test]
    fn extra_key_id_breaks_the_key_ids_mac() {
        let (mut alice, mut bob) = sas_pair(&VerificationSettings::default());
        exchange_keys(&mut alice, &mut bob);

        let mut alice_mac = single_message(&alice.transition(SasInput::Confirm));
        let content = mac_content(&mut alice_mac);
        let key_mac = content.mac.values().next().unwrap().clone();
        content.mac.insert("ed25519:OTHERDEVICE".to_owned(), key_mac);

        single_message(&bob.transition(SasInput::Confirm));

        assert_cancelled_with(
            &bob.transition(SasInput::Received(alice_mac)),
            CancelCode::KeyMismatch,
        );
    }

    #[test]
    fn unexpected_messages_cancel_the_flow() {
        let (mut alice, mut bob) = sas_pair(&VerificationSettings::default());

        let start = single_message(&alice.transition(SasInput::Start));
        bob.transition(SasInput::Received(start.clone()));

        let cancel = single_message(&bob.transition(SasInput::Received(start)));
        assert_matches!(cancel, AnyVerificationContent::Cancel(c) => {
            assert_eq!(c.code, CancelCode::UnexpectedMessage);
        });
    }

    #[test]
    fn duplicate_mac_is_rejected() {
        let (mut alice, mut bob) = sas_pair(&VerificationSettings::default());
        exchange_keys(&mut alice, &mut bob);

        let alice_mac = single_message(&alice.transition(SasInput::Confirm));
        bob.transition(SasInput::Received(alice_mac.clone()));

        let cancel = single_message(&bob.transition(SasInput::Received(alice_mac)));
        assert_matches!(cancel, AnyVerificationContent::Cancel(c) => {
            assert_eq!(c.code, CancelCode::UnexpectedMessage);
        });
    }

    #[test]
    fn user_mismatch_and_failures() {
        let (mut alice, mut bob) = sas_pair(&VerificationSettings::default());
        exchange_keys(&mut alice, &mut bob);

        let cancel = single_message(&alice.transition(SasInput::Mismatch));
        assert_matches!(cancel, AnyVerificationContent::Cancel(c) => {
            assert_eq!(c.code, CancelCode::MismatchedSas);
        });

        assert!(sent(&bob.transition(SasInput::SendFailed)).is_empty());
        assert_matches!(bob.state(), SasState::Cancelled(info) => {
            assert_eq!(info.cancel_code(), &CancelCode::User);
        });
    }

    #[test]
    fn cancelling_before_starting_sends_nothing() {
        let (mut alice, _) = sas_pair(&VerificationSettings::default());

        let effects = alice.transition(SasInput::Cancel(CancelCode::UnexpectedMessage));
        assert!(sent(&effects).is_empty());
        assert!(alice.state().is_cancelled());
    }
}
