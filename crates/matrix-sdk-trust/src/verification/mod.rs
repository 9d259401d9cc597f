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

//! Interactive device verification using short authentication strings.
//!
//! A [`VerificationMachine`] routes the `m.key.verification.*` to-device
//! messages to the right [`Sas`] object, every [`Sas`] object represents a
//! single verification flow between our own device and one other device.

mod cache;
mod event_enums;
mod machine;
mod sas;

use std::{collections::BTreeMap, sync::Arc};

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use tracing::{info, warn};

pub use event_enums::AnyVerificationContent;
pub use machine::VerificationMachine;
pub use ruma::events::key::verification::{
    cancel::CancelCode, HashAlgorithm, KeyAgreementProtocol, MessageAuthenticationCode,
    ShortAuthenticationString,
};
pub use sas::{Sas, SasState};

use crate::{
    identities::{DeviceData, LocalTrust},
    olm::Account,
    store::{CryptoStore, CryptoStoreError},
};

/// The human readable description we send along with a cancel code.
fn cancel_reason(code: &CancelCode) -> &'static str {
    match code {
        CancelCode::User => "The user cancelled the verification.",
        CancelCode::Timeout => "The verification process timed out.",
        CancelCode::UnknownTransaction => {
            "The device does not know about the given transaction ID."
        }
        CancelCode::UnknownMethod => {
            "The device does not know how to handle the requested method."
        }
        CancelCode::UnexpectedMessage => "The device received an unexpected message.",
        CancelCode::KeyMismatch => "The expected key did not match the verified one",
        CancelCode::UserMismatch => "The expected user did not match the verified user",
        CancelCode::InvalidMessage => "The received message was invalid.",
        CancelCode::Accepted => {
            "A m.key.verification.request was accepted by a different device."
        }
        CancelCode::MismatchedCommitment => "The hash commitment did not match.",
        CancelCode::MismatchedSas => "The short authentication string did not match.",
        _ => "Unknown cancel reason",
    }
}

/// An emoji that is used for interactive verification using a short auth
/// string.
///
/// This will contain a single emoji and description from the list of emojis
/// defined by the [Matrix client-server API].
///
/// [Matrix client-server API]: https://spec.matrix.org/unstable/client-server-api/#sas-method-emoji
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd)]
pub struct Emoji {
    /// The emoji symbol that represents a part of the short auth string, for
    /// example: 🐶
    pub symbol: &'static str,
    /// The description of the emoji, for example 'Dog'.
    pub description: &'static str,
}

/// Information about the cancellation of a verification flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CancelInfo {
    cancelled_by_us: bool,
    cancel_code: CancelCode,
    reason: String,
}

impl CancelInfo {
    pub(crate) fn new(cancelled_by_us: bool, cancel_code: CancelCode) -> Self {
        let reason = cancel_reason(&cancel_code).to_owned();
        Self { cancelled_by_us, cancel_code, reason }
    }

    pub(crate) fn from_other_side(cancel_code: CancelCode, reason: String) -> Self {
        Self { cancelled_by_us: false, cancel_code, reason }
    }

    /// Get the human readable reason of the cancellation.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Get the `CancelCode` that cancelled this verification.
    pub fn cancel_code(&self) -> &CancelCode {
        &self.cancel_code
    }

    /// Was the verification cancelled by us?
    pub fn cancelled_by_us(&self) -> bool {
        self.cancelled_by_us
    }
}

/// A state change of one of the verification flows a [`VerificationMachine`]
/// manages.
#[derive(Clone, Debug)]
pub struct VerificationUpdate {
    /// The user we are verifying with.
    pub other_user_id: OwnedUserId,
    /// The device we are verifying.
    pub other_device_id: OwnedDeviceId,
    /// The transaction id of the flow.
    pub flow_id: String,
    /// The new state of the flow.
    pub state: SasState,
}

#[derive(Clone, Debug)]
pub(crate) struct VerificationStore {
    pub account: Account,
    inner: Arc<dyn CryptoStore>,
}

impl VerificationStore {
    pub fn new(account: Account, inner: Arc<dyn CryptoStore>) -> Self {
        Self { account, inner }
    }

    /// Get a device of the given user, our own device is never returned.
    pub async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceData>, CryptoStoreError> {
        Ok(self.inner.get_device(user_id, device_id).await?.filter(|d| {
            !(d.user_id() == self.account.user_id() && d.device_id() == self.account.device_id())
        }))
    }

    /// Get all the devices of the given user, without our own device.
    pub async fn get_user_devices(
        &self,
        user_id: &UserId,
    ) -> Result<BTreeMap<OwnedDeviceId, DeviceData>, CryptoStoreError> {
        let mut devices = self.inner.get_user_devices(user_id).await?;

        if user_id == self.account.user_id() {
            devices.remove(self.account.device_id());
        }

        Ok(devices)
    }

    /// Mark the given devices as verified.
    ///
    /// Returns `false` and marks nothing if one of the devices got deleted or
    /// changed its keys while we were verifying it.
    pub async fn mark_devices_as_verified(
        &self,
        devices: &[DeviceData],
    ) -> Result<bool, CryptoStoreError> {
        for device in devices {
            let stored = self.get_device(device.user_id(), device.device_id()).await?;

            if !stored.is_some_and(|d| d.keys_match(device)) {
                warn!(
                    user_id = ?device.user_id(),
                    device_id = ?device.device_id(),
                    "The device was deleted or changed its keys while we were verifying it"
                );

                return Ok(false);
            }
        }

        for device in devices {
            info!(
                user_id = ?device.user_id(),
                device_id = ?device.device_id(),
                "Marking the device as verified"
            );

            self.inner
                .set_device_trust(device.user_id(), device.device_id(), LocalTrust::Verified)
                .await?;
        }

        Ok(true)
    }
}
