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

use ruma::{
    events::key::verification::accept::{self, AcceptMethod},
    serde::Base64,
    OwnedTransactionId,
};
use tracing::{trace, warn};
use vodozemac::sas::{EstablishedSas, Mac};

use crate::verification::{
    event_enums::{accept_sas_v1, start_sas_v1, AcceptContent, StartContent},
    CancelCode, CancelInfo, HashAlgorithm, KeyAgreementProtocol, MessageAuthenticationCode,
    ShortAuthenticationString,
};

/// An Enum describing the state the SAS verification is in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SasState {
    /// The verification object was created but nothing was sent or received
    /// yet.
    Created,
    /// We are sending out the `m.key.verification.start` message.
    SendingStart,
    /// The `m.key.verification.start` message was sent out.
    Started,
    /// We received an `m.key.verification.start` message, the user needs to
    /// accept the verification.
    OnStarted,
    /// We are sending out the `m.key.verification.accept` message.
    SendingAccept,
    /// The `m.key.verification.accept` message was sent out.
    Accepted,
    /// The other side accepted our verification.
    OnAccepted,
    /// We are sending out our ephemeral public key.
    SendingKey,
    /// Our ephemeral public key was sent out.
    KeySent,
    /// Both sides exchanged their keys, the short auth string can be presented
    /// to the user.
    ShortCodeReady,
    /// The user confirmed that the short auth strings match.
    ShortCodeAccepted,
    /// We are sending out the `m.key.verification.mac` message.
    SendingMac,
    /// The `m.key.verification.mac` message was sent out, we're waiting for
    /// the MAC of the other side.
    MacSent,
    /// Both MACs are known, the devices are being marked as verified.
    Verifying,
    /// The verification flow has been successfully completed.
    Verified,
    /// We cancelled the verification flow.
    Cancelled(CancelInfo),
    /// The other side cancelled the verification flow.
    OnCancelled(CancelInfo),
}

impl SasState {
    /// Is the state a final one, either verified or cancelled.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Verified | Self::Cancelled(_) | Self::OnCancelled(_))
    }

    /// Has the verification been cancelled, by either side.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_) | Self::OnCancelled(_))
    }

    /// Get the info about the cancellation if the flow was cancelled.
    pub fn cancel_info(&self) -> Option<&CancelInfo> {
        match self {
            Self::Cancelled(info) | Self::OnCancelled(info) => Some(info),
            _ => None,
        }
    }

    /// Can the short auth string be presented to the user in this state.
    pub fn can_be_presented(&self) -> bool {
        matches!(
            self,
            Self::ShortCodeReady | Self::ShortCodeAccepted | Self::SendingMac | Self::MacSent
        )
    }
}

/// The key agreement protocols we know how to use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SupportedKeyAgreement {
    Curve25519HkdfSha256,
    Curve25519,
}

impl TryFrom<&KeyAgreementProtocol> for SupportedKeyAgreement {
    type Error = CancelCode;

    fn try_from(value: &KeyAgreementProtocol) -> Result<Self, Self::Error> {
        match value {
            KeyAgreementProtocol::Curve25519HkdfSha256 => Ok(Self::Curve25519HkdfSha256),
            KeyAgreementProtocol::Curve25519 => Ok(Self::Curve25519),
            _ => Err(CancelCode::UnknownMethod),
        }
    }
}

impl From<SupportedKeyAgreement> for KeyAgreementProtocol {
    fn from(value: SupportedKeyAgreement) -> Self {
        match value {
            SupportedKeyAgreement::Curve25519HkdfSha256 => Self::Curve25519HkdfSha256,
            SupportedKeyAgreement::Curve25519 => Self::Curve25519,
        }
    }
}

/// The MAC methods we know how to use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SupportedMacMethod {
    HkdfHmacSha256V2,
    HkdfHmacSha256,
}

impl TryFrom<&MessageAuthenticationCode> for SupportedMacMethod {
    type Error = CancelCode;

    fn try_from(value: &MessageAuthenticationCode) -> Result<Self, Self::Error> {
        match value {
            MessageAuthenticationCode::HkdfHmacSha256V2 => Ok(Self::HkdfHmacSha256V2),
            MessageAuthenticationCode::HkdfHmacSha256 => Ok(Self::HkdfHmacSha256),
            _ => Err(CancelCode::UnknownMethod),
        }
    }
}

impl From<SupportedMacMethod> for MessageAuthenticationCode {
    fn from(value: SupportedMacMethod) -> Self {
        match value {
            SupportedMacMethod::HkdfHmacSha256V2 => Self::HkdfHmacSha256V2,
            SupportedMacMethod::HkdfHmacSha256 => Self::HkdfHmacSha256,
        }
    }
}

impl SupportedMacMethod {
    pub fn calculate_mac(
        &self,
        sas: &EstablishedSas,
        input: &str,
        info: &str,
    ) -> Result<Base64, CancelCode> {
        match self {
            SupportedMacMethod::HkdfHmacSha256 => {
                Base64::parse(sas.calculate_mac_invalid_base64(input, info)).map_err(|e| {
                    warn!("Couldn't decode our own legacy MAC: {e}");
                    CancelCode::InvalidMessage
                })
            }
            SupportedMacMethod::HkdfHmacSha256V2 => {
                Ok(Base64::new(sas.calculate_mac(input, info).as_bytes().to_vec()))
            }
        }
    }

    pub fn verify_mac(
        &self,
        sas: &EstablishedSas,
        input: &str,
        info: &str,
        tag: &Base64,
    ) -> Result<(), CancelCode> {
        match self {
            SupportedMacMethod::HkdfHmacSha256 => {
                let ours: Base64 = Base64::parse(sas.calculate_mac_invalid_base64(input, info))
                    .map_err(|_| CancelCode::KeyMismatch)?;

                if ours.as_bytes() == tag.as_bytes() {
                    Ok(())
                } else {
                    Err(CancelCode::KeyMismatch)
                }
            }
            SupportedMacMethod::HkdfHmacSha256V2 => {
                let mac = Mac::from_slice(tag.as_bytes());
                sas.verify_mac(input, info, &mac).map_err(|_| CancelCode::KeyMismatch)
            }
        }
    }
}

fn is_supported_sas(method: &ShortAuthenticationString) -> bool {
    matches!(method, ShortAuthenticationString::Decimal | ShortAuthenticationString::Emoji)
}

/// The set of protocols both sides agreed on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct AcceptedProtocols {
    pub key_agreement_protocol: SupportedKeyAgreement,
    pub hash: HashAlgorithm,
    pub message_auth_code: SupportedMacMethod,
    pub short_auth_string: Vec<ShortAuthenticationString>,
}

impl AcceptedProtocols {
    /// Pick the protocols we are going to use out of the ones the other side
    /// offered.
    ///
    /// The first supported entry of every list wins, the order of the lists
    /// is the preference order of the side that started the verification.
    pub fn negotiate(content: &StartContent) -> Result<Self, CancelCode> {
        let Some(content) = start_sas_v1(content) else {
            return Err(CancelCode::UnknownMethod);
        };

        let key_agreement_protocol = content
            .key_agreement_protocols
            .iter()
            .find_map(|p| SupportedKeyAgreement::try_from(p).ok())
            .ok_or(CancelCode::UnknownMethod)?;
        let hash = content
            .hashes
            .iter()
            .find(|h| **h == HashAlgorithm::Sha256)
            .cloned()
            .ok_or(CancelCode::UnknownMethod)?;
        let message_auth_code = content
            .message_authentication_codes
            .iter()
            .find_map(|m| SupportedMacMethod::try_from(m).ok())
            .ok_or(CancelCode::UnknownMethod)?;
        let short_auth_string: Vec<_> = content
            .short_authentication_string
            .iter()
            .filter(|s| is_supported_sas(s))
            .cloned()
            .collect();

        if short_auth_string.is_empty() {
            return Err(CancelCode::UnknownMethod);
        }

        let protocols =
            Self { key_agreement_protocol, hash, message_auth_code, short_auth_string };

        trace!(?protocols, "Negotiated the SAS protocols");

        Ok(protocols)
    }

    /// Check that the protocols the other side accepted are the ones we
    /// offered.
    ///
    /// Returns the accepted protocols and the commitment of the other side.
    pub fn from_accept(
        content: &AcceptContent,
        offered: &StartContent,
    ) -> Result<(Self, Base64), CancelCode> {
        let (Some(content), Some(offered)) = (accept_sas_v1(content), start_sas_v1(offered))
        else {
            return Err(CancelCode::UnknownMethod);
        };

        if !offered.key_agreement_protocols.contains(&content.key_agreement_protocol)
            || !offered.hashes.contains(&content.hash)
            || !offered.message_authentication_codes.contains(&content.message_authentication_code)
            || content.short_authentication_string.is_empty()
            || !content
                .short_authentication_string
                .iter()
                .all(|s| offered.short_authentication_string.contains(s) && is_supported_sas(s))
        {
            return Err(CancelCode::UnknownMethod);
        }

        if content.hash != HashAlgorithm::Sha256 {
            return Err(CancelCode::UnknownMethod);
        }

        let protocols = Self {
            key_agreement_protocol: (&content.key_agreement_protocol).try_into()?,
            hash: content.hash.clone(),
            message_auth_code: (&content.message_authentication_code).try_into()?,
            short_auth_string: content.short_authentication_string.clone(),
        };

        Ok((protocols, content.commitment.clone()))
    }

    pub fn as_accept_content(&self, flow_id: &str, commitment: Base64) -> AcceptContent {
        let method = AcceptMethod::SasV1(
            accept::SasV1ContentInit {
                key_agreement_protocol: self.key_agreement_protocol.into(),
                hash: self.hash.clone(),
                message_authentication_code: self.message_auth_code.into(),
                short_authentication_string: self.short_auth_string.clone(),
                commitment,
            }
            .into(),
        );

        AcceptContent::new(OwnedTransactionId::from(flow_id), method)
    }
}
