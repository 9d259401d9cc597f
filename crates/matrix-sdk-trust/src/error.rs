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

use ruma::{CanonicalJsonError, OwnedDeviceId, OwnedUserId};
use serde_json::Error as SerdeError;
use thiserror::Error;

use crate::{
    backups::{BackupServerError, DecodeError},
    store::CryptoStoreError,
};

/// Error type describing different errors that can happen when we check a
/// signature of a JSON object.
#[derive(Error, Debug)]
pub enum SignatureError {
    /// The signature was made using an unsupported algorithm.
    #[error("the signature used an unsupported algorithm")]
    UnsupportedAlgorithm,

    /// The ID of the signing key isn't a valid key ID.
    #[error("the ID of the signing key is invalid")]
    InvalidKeyId,

    /// The signing key that should create or check a signature is missing.
    #[error("the signing key is missing from the object that signed the message")]
    MissingSigningKey,

    /// The user id of signing key differs from the user id that provided the
    /// signature.
    #[error("the user id of the signing key differs user id that provided the signature")]
    UserIdMismatch,

    /// The provided JSON value that was signed and the signature should be
    /// checked isn't a valid JSON object.
    #[error("the provided JSON value isn't an object")]
    NotAnObject,

    /// The provided JSON value that was signed and the signature should be
    /// checked isn't a valid JSON object.
    #[error("the provided JSON object doesn't contain a signatures field")]
    NoSignatureFound,

    /// The signature couldn't be verified.
    #[error("the signature didn't match the provided key")]
    VerificationError,

    /// The public key isn't a valid ed25519 key.
    #[error("the public key isn't a valid ed25519 key: {0}")]
    InvalidKey(#[from] vodozemac::KeyError),

    /// The signature could not be decoded.
    #[error("the given signature is not valid and can't be decoded")]
    InvalidSignature,

    /// The signed object couldn't be deserialized.
    #[error(transparent)]
    JsonError(#[from] SerdeError),

    /// The signed object couldn't be turned into canonical JSON.
    #[error(transparent)]
    CanonicalJson(#[from] CanonicalJsonError),
}

impl From<vodozemac::SignatureError> for SignatureError {
    fn from(_: vodozemac::SignatureError) -> Self {
        Self::VerificationError
    }
}

/// Error type for the entry points of the verification machine.
#[derive(Error, Debug)]
pub enum VerificationError {
    /// The device we want to verify isn't known to us.
    #[error("the device {1} of user {0} isn't known")]
    UnknownDevice(OwnedUserId, OwnedDeviceId),

    /// Our own device can't be verified using itself.
    #[error("can't start a verification with our own device")]
    OwnDevice,

    /// The storage layer returned an error.
    #[error("failed to read or write to the crypto store {0}")]
    Store(#[from] CryptoStoreError),

    /// An incoming verification event couldn't be deserialized.
    #[error(transparent)]
    Json(#[from] SerdeError),
}

/// Error type for the key backup engine.
#[derive(Error, Debug)]
pub enum KeysBackupError {
    /// The storage layer returned an error.
    #[error("failed to read or write to the crypto store {0}")]
    Store(#[from] CryptoStoreError),

    /// The homeserver returned an error for one of our backup requests.
    #[error(transparent)]
    Server(#[from] BackupServerError),

    /// A backup related object couldn't be serialized or deserialized.
    #[error(transparent)]
    Json(#[from] SerdeError),

    /// Signing or checking a signature of the backup auth data failed.
    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// A recovery key or a backup public key couldn't be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The backup version uses an algorithm we don't support.
    #[error("the backup version uses an unsupported algorithm {0}")]
    UnsupportedAlgorithm(String),

    /// The recovery key or passphrase doesn't belong to the backup version.
    #[error("the recovery key doesn't match the public key of the backup version")]
    InvalidRecoveryKey,

    /// The backup version wasn't created from a passphrase, the salt or the
    /// iteration count are missing from its auth data.
    #[error("the backup version doesn't contain any passphrase info")]
    MissingPassphraseInfo,

    /// No backup version is currently enabled.
    #[error("no backup version is currently enabled")]
    BackupNotEnabled,

    /// The server told us that the version we were backing up to isn't the
    /// current one.
    #[error("the backup version {0} isn't the current backup version anymore")]
    WrongBackupVersion(String),
}
