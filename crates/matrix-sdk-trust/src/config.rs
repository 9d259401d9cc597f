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

//! Settings for the verification and key backup engines.
//!
//! Both settings structs can be deserialized, missing fields fall back to
//! their defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::verification::{
    HashAlgorithm, KeyAgreementProtocol, MessageAuthenticationCode, ShortAuthenticationString,
};

/// The number of room keys that are uploaded to the server in one request.
pub const BACKUP_BATCH_SIZE: usize = 100;

/// The number of PBKDF2 rounds used for new passphrase derived backup keys.
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 500_000;

/// Settings for interactive SAS verifications.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct VerificationSettings {
    /// The key agreement protocols we offer when we start a verification, in
    /// order of preference.
    pub key_agreement_protocols: Vec<KeyAgreementProtocol>,
    /// The hash algorithms we offer, in order of preference.
    pub hashes: Vec<HashAlgorithm>,
    /// The message authentication codes we offer, in order of preference.
    pub message_authentication_codes: Vec<MessageAuthenticationCode>,
    /// The short authentication string formats we offer.
    pub short_authentication_string: Vec<ShortAuthenticationString>,
    /// How long a verification may stay unfinished before it is cancelled
    /// with a timeout.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            key_agreement_protocols: vec![KeyAgreementProtocol::Curve25519HkdfSha256],
            hashes: vec![HashAlgorithm::Sha256],
            message_authentication_codes: vec![MessageAuthenticationCode::HkdfHmacSha256V2],
            short_authentication_string: vec![
                ShortAuthenticationString::Decimal,
                ShortAuthenticationString::Emoji,
            ],
            timeout: Duration::from_secs(60 * 10),
        }
    }
}

/// Settings for the server-side key backup.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct BackupSettings {
    /// The maximal number of room keys uploaded in a single request.
    pub batch_size: usize,
    /// The number of PBKDF2 rounds used when a backup key is derived from a
    /// new passphrase.
    pub pbkdf2_iterations: u32,
    /// Should a backup pass run as soon as a backup version got enabled.
    pub backup_after_enable: bool,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            batch_size: BACKUP_BATCH_SIZE,
            pbkdf2_iterations: DEFAULT_PBKDF2_ITERATIONS,
            backup_after_enable: true,
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
