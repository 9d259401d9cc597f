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

use ruma::{CanonicalJsonValue, UserId};
use serde_json::Value;
use vodozemac::{Ed25519PublicKey, Ed25519Signature};

use crate::{error::SignatureError, types::Signatures};

/// Convert a JSON object into its canonical form, the form that gets signed.
///
/// The `signatures` and `unsigned` fields are not covered by signatures and
/// are removed before the conversion.
pub(crate) fn canonical_json(mut value: Value) -> Result<String, SignatureError> {
    let object = value.as_object_mut().ok_or(SignatureError::NotAnObject)?;

    object.remove("signatures");
    object.remove("unsigned");

    let canonical_json: CanonicalJsonValue = value.try_into()?;

    Ok(canonical_json.to_string())
}

/// Check that the already canonicalized JSON string was signed by the given
/// key.
pub(crate) fn verify_canonical_json(
    key: Ed25519PublicKey,
    signer: &UserId,
    key_id: &str,
    canonical_json: &str,
    signatures: &Signatures,
) -> Result<(), SignatureError> {
    let signature =
        signatures.get_signature(signer, key_id).ok_or(SignatureError::NoSignatureFound)?;
    let signature =
        Ed25519Signature::from_base64(signature).map_err(|_| SignatureError::InvalidSignature)?;

    Ok(key.verify(canonical_json.as_bytes(), &signature)?)
}

/// Verify a signed JSON object.
///
/// The object must have a signatures key associated with an object of the
/// form `user_id: {key_id: signature}`.
///
/// # Arguments
///
/// * `key` - The public ed25519 key which was used to sign the JSON object.
///
/// * `signer` - The user that created the signature.
///
/// * `key_id` - The id of the key that signed the JSON object, e.g.
///   `ed25519:DEVICEID`.
///
/// * `json` - The JSON object that should be verified.
pub fn verify_json(
    key: Ed25519PublicKey,
    signer: &UserId,
    key_id: &str,
    json: &Value,
) -> Result<(), SignatureError> {
    let signatures: Signatures = serde_json::from_value(
        json.get("signatures").cloned().ok_or(SignatureError::NoSignatureFound)?,
    )?;
    let canonical_json = canonical_json(json.clone())?;

    verify_canonical_json(key, signer, key_id, &canonical_json, &signatures)
}
