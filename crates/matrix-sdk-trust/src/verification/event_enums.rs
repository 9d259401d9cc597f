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

//! The contents of the `m.key.verification.*` to-device events.

use ruma::{
    events::key::verification::{
        accept::{self, AcceptMethod, ToDeviceKeyVerificationAcceptEventContent},
        cancel::ToDeviceKeyVerificationCancelEventContent,
        key::ToDeviceKeyVerificationKeyEventContent,
        mac::ToDeviceKeyVerificationMacEventContent,
        start::{self, StartMethod, ToDeviceKeyVerificationStartEventContent},
    },
    CanonicalJsonValue,
};
use serde::de::Error as _;
use serde_json::Value;

pub(crate) type StartContent = ToDeviceKeyVerificationStartEventContent;
pub(crate) type AcceptContent = ToDeviceKeyVerificationAcceptEventContent;
pub(crate) type KeyContent = ToDeviceKeyVerificationKeyEventContent;
pub(crate) type MacContent = ToDeviceKeyVerificationMacEventContent;
pub(crate) type CancelContent = ToDeviceKeyVerificationCancelEventContent;

/// The only verification method we support.
pub(crate) const SAS_V1: &str = "m.sas.v1";

/// Get the canonical JSON form of a start content, `None` if the content
/// can't be represented as canonical JSON.
pub(crate) fn canonical_json(content: &StartContent) -> Option<String> {
    let value = serde_json::to_value(content).ok()?;
    let canonical: CanonicalJsonValue = value.try_into().ok()?;

    Some(canonical.to_string())
}

/// The `m.sas.v1` part of a start content.
pub(crate) fn start_sas_v1(content: &StartContent) -> Option<&start::SasV1Content> {
    match &content.method {
        StartMethod::SasV1(c) => Some(c),
        _ => None,
    }
}

/// The `m.sas.v1` part of an accept content.
pub(crate) fn accept_sas_v1(content: &AcceptContent) -> Option<&accept::SasV1Content> {
    match &content.method {
        AcceptMethod::SasV1(c) => Some(c),
        _ => None,
    }
}

/// The type of a verification message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageType {
    Start,
    Accept,
    Key,
    Mac,
    Cancel,
}

impl MessageType {
    pub fn event_type(self) -> &'static str {
        match self {
            MessageType::Start => "m.key.verification.start",
            MessageType::Accept => "m.key.verification.accept",
            MessageType::Key => "m.key.verification.key",
            MessageType::Mac => "m.key.verification.mac",
            MessageType::Cancel => "m.key.verification.cancel",
        }
    }

    pub fn from_event_type(event_type: &str) -> Option<Self> {
        Some(match event_type {
            "m.key.verification.start" => MessageType::Start,
            "m.key.verification.accept" => MessageType::Accept,
            "m.key.verification.key" => MessageType::Key,
            "m.key.verification.mac" => MessageType::Mac,
            "m.key.verification.cancel" => MessageType::Cancel,
            _ => return None,
        })
    }
}

/// Any of the verification event contents we send or receive.
#[derive(Clone, Debug)]
pub enum AnyVerificationContent {
    /// The `m.key.verification.start` content.
    Start(ToDeviceKeyVerificationStartEventContent),
    /// The `m.key.verification.accept` content.
    Accept(ToDeviceKeyVerificationAcceptEventContent),
    /// The `m.key.verification.key` content.
    Key(ToDeviceKeyVerificationKeyEventContent),
    /// The `m.key.verification.mac` content.
    Mac(ToDeviceKeyVerificationMacEventContent),
    /// The `m.key.verification.cancel` content.
    Cancel(ToDeviceKeyVerificationCancelEventContent),
}

impl AnyVerificationContent {
    /// Deserialize the content of a to-device event with the given event type.
    ///
    /// Returns `Ok(None)` if the event type isn't a verification event type.
    /// A start or accept content that claims to use `m.sas.v1` but lacks one
    /// of its fields is an error.
    pub fn from_parts(event_type: &str, content: Value) -> Result<Option<Self>, serde_json::Error> {
        let Some(message_type) = MessageType::from_event_type(event_type) else {
            return Ok(None);
        };

        let claims_sas_v1 = content.get("method").and_then(Value::as_str) == Some(SAS_V1);
        let invalid_sas_v1 = || serde_json::Error::custom("invalid m.sas.v1 content");

        Ok(Some(match message_type {
            MessageType::Start => {
                let content: StartContent = serde_json::from_value(content)?;

                if claims_sas_v1 && start_sas_v1(&content).is_none() {
                    return Err(invalid_sas_v1());
                }

                Self::Start(content)
            }
            MessageType::Accept => {
                let content: AcceptContent = serde_json::from_value(content)?;

                if claims_sas_v1 && accept_sas_v1(&content).is_none() {
                    return Err(invalid_sas_v1());
                }

                Self::Accept(content)
            }
            MessageType::Key => Self::Key(serde_json::from_value(content)?),
            MessageType::Mac => Self::Mac(serde_json::from_value(content)?),
            MessageType::Cancel => Self::Cancel(serde_json::from_value(content)?),
        }))
    }

    /// The transaction id of the verification flow this content belongs to.
    pub fn flow_id(&self) -> &str {
        match self {
            Self::Start(c) => c.transaction_id.as_str(),
            Self::Accept(c) => c.transaction_id.as_str(),
            Self::Key(c) => c.transaction_id.as_str(),
            Self::Mac(c) => c.transaction_id.as_str(),
            Self::Cancel(c) => c.transaction_id.as_str(),
        }
    }

    /// The to-device event type of this content.
    pub fn event_type(&self) -> &'static str {
        self.message_type().event_type()
    }

    pub(crate) fn message_type(&self) -> MessageType {
        match self {
            Self::Start(_) => MessageType::Start,
            Self::Accept(_) => MessageType::Accept,
            Self::Key(_) => MessageType::Key,
            Self::Mac(_) => MessageType::Mac,
            Self::Cancel(_) => MessageType::Cancel,
        }
    }

    /// Serialize the content into a JSON value.
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Start(c) => serde_json::to_value(c),
            Self::Accept(c) => serde_json::to_value(c),
            Self::Key(c) => serde_json::to_value(c),
            Self::Mac(c) => serde_json::to_value(c),
            Self::Cancel(c) => serde_json::to_value(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::events::key::verification::{cancel::CancelCode, KeyAgreementProtocol};
    use serde_json::json;

    use super::{canonical_json, start_sas_v1, AnyVerificationContent};

    #[test]
    fn start_content_canonical_form() {
        let json = json!({
            "from_device": "BOBDEVICE",
            "method": "m.sas.v1",
            "transaction_id": "abc",
            "key_agreement_protocols": ["curve25519-hkdf-sha256", "org.example.kap"],
            "hashes": ["sha256"],
            "message_authentication_codes": ["hkdf-hmac-sha256.v2"],
            "short_authentication_string": ["decimal"],
        });

        let content = AnyVerificationContent::from_parts("m.key.verification.start", json)
            .unwrap()
            .unwrap();
        let content = assert_matches!(content, AnyVerificationContent::Start(c) => c);

        let sas = start_sas_v1(&content).unwrap();
        assert_eq!(sas.key_agreement_protocols[0], KeyAgreementProtocol::Curve25519HkdfSha256);
        assert_eq!(sas.key_agreement_protocols[1].as_str(), "org.example.kap");

        let canonical = canonical_json(&content).unwrap();
        assert!(canonical.starts_with(r#"{"from_device":"BOBDEVICE","hashes":["sha256"]"#));
        assert!(canonical.ends_with(r#""transaction_id":"abc"}"#));
    }

    #[test]
    fn parsing_by_event_type() {
        let content = AnyVerificationContent::from_parts(
            "m.key.verification.cancel",
            json!({ "transaction_id": "abc", "code": "m.user", "reason": "Nope" }),
        )
        .unwrap()
        .unwrap();

        assert_eq!(content.flow_id(), "abc");
        assert_eq!(content.event_type(), "m.key.verification.cancel");
        let content = assert_matches!(content, AnyVerificationContent::Cancel(c) => c);
        assert_eq!(content.code, CancelCode::User);

        assert!(AnyVerificationContent::from_parts("m.room_key", json!({})).unwrap().is_none());
        assert!(AnyVerificationContent::from_parts(
            "m.key.verification.key",
            json!({ "transaction_id": "abc" })
        )
        .is_err());
    }

    #[test]
    fn incomplete_sas_contents_are_rejected() {
        assert!(AnyVerificationContent::from_parts(
            "m.key.verification.accept",
            json!({ "transaction_id": "abc", "method": "m.sas.v1" }),
        )
        .is_err());

        assert!(AnyVerificationContent::from_parts(
            "m.key.verification.start",
            json!({ "from_device": "BOBDEVICE", "transaction_id": "abc", "method": "m.sas.v1" }),
        )
        .is_err());

        let content = AnyVerificationContent::from_parts(
            "m.key.verification.start",
            json!({
                "from_device": "BOBDEVICE",
                "transaction_id": "abc",
                "method": "org.example.method",
            }),
        )
        .unwrap()
        .unwrap();
        let content = assert_matches!(content, AnyVerificationContent::Start(c) => c);
        assert!(start_sas_v1(&content).is_none());
    }
}
