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

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Arc,
    },
};

use ruma::{OwnedRoomId, RoomId};
use thiserror::Error;
use vodozemac::{
    megolm::{ExportedSessionKey, SessionConfig, SessionKey, SessionKeyDecodeError},
    Curve25519PublicKey, Ed25519PublicKey, KeyError,
};

use crate::types::{BackedUpRoomKey, MEGOLM_V1_AES_SHA2};

/// Error type for the creation of an inbound group session from exported or
/// backed up key material.
#[derive(Error, Debug)]
pub enum SessionCreationError {
    /// The room key uses an algorithm we don't support.
    #[error("the room key uses the unsupported algorithm {0}")]
    Algorithm(String),

    /// The session key couldn't be decoded.
    #[error(transparent)]
    SessionKey(#[from] SessionKeyDecodeError),

    /// The sender key of the session isn't a valid Curve25519 key.
    #[error(transparent)]
    SenderKey(#[from] KeyError),

    /// The session key belongs to a different session than advertised.
    #[error("the session key belongs to the session {actual}, expected {expected}")]
    SessionIdMismatch {
        /// The session id the key material was stored under.
        expected: String,
        /// The session id of the key material.
        actual: String,
    },
}

/// Inbound group session.
///
/// Inbound group sessions are used to decrypt the room messages of a single
/// sender, they are the unit of data that gets stored in a key backup.
#[derive(Clone)]
pub struct InboundGroupSession {
    inner: Arc<vodozemac::megolm::InboundGroupSession>,
    session_id: Arc<str>,
    first_known_index: u32,
    room_id: OwnedRoomId,
    sender_key: Curve25519PublicKey,
    signing_keys: Arc<BTreeMap<String, String>>,
    forwarding_chain: Arc<Vec<String>>,
    sender_verified: bool,
    imported: bool,
    backed_up: Arc<AtomicBool>,
}

impl InboundGroupSession {
    /// Create a new inbound group session for the given room.
    ///
    /// # Arguments
    ///
    /// * `sender_key` - The public Curve25519 key of the account that sent us
    ///   the session.
    ///
    /// * `signing_key` - The public Ed25519 key of the account that sent us
    ///   the session.
    ///
    /// * `room_id` - The id of the room that the session is used in.
    ///
    /// * `session_key` - The private session key that is used to decrypt
    ///   messages.
    ///
    /// * `sender_verified` - Did we verify the device that sent us the
    ///   session.
    pub fn new(
        sender_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
        room_id: &RoomId,
        session_key: &SessionKey,
        sender_verified: bool,
    ) -> Self {
        let session =
            vodozemac::megolm::InboundGroupSession::new(session_key, SessionConfig::version_1());

        Self::from_vodozemac(
            session,
            sender_key,
            BTreeMap::from([("ed25519".to_owned(), signing_key.to_base64())]),
            room_id,
            Vec::new(),
            sender_verified,
            false,
        )
    }

    fn from_vodozemac(
        session: vodozemac::megolm::InboundGroupSession,
        sender_key: Curve25519PublicKey,
        signing_keys: BTreeMap<String, String>,
        room_id: &RoomId,
        forwarding_chain: Vec<String>,
        sender_verified: bool,
        imported: bool,
    ) -> Self {
        let session_id = session.session_id();
        let first_known_index = session.first_known_index();

        Self {
            inner: Arc::new(session),
            session_id: session_id.into(),
            first_known_index,
            room_id: room_id.to_owned(),
            sender_key,
            signing_keys: signing_keys.into(),
            forwarding_chain: forwarding_chain.into(),
            sender_verified,
            imported,
            backed_up: AtomicBool::new(false).into(),
        }
    }

    /// Create an inbound group session from a key we got out of a server-side
    /// key backup.
    ///
    /// The session is marked as imported, since we didn't receive it directly
    /// from the sender.
    pub fn from_backup(
        room_id: &RoomId,
        session_id: &str,
        key: &BackedUpRoomKey,
    ) -> Result<Self, SessionCreationError> {
        if key.algorithm != MEGOLM_V1_AES_SHA2 {
            return Err(SessionCreationError::Algorithm(key.algorithm.clone()));
        }

        let exported = ExportedSessionKey::from_base64(&key.session_key)?;
        let session =
            vodozemac::megolm::InboundGroupSession::import(&exported, SessionConfig::version_1());

        if session.session_id() != session_id {
            return Err(SessionCreationError::SessionIdMismatch {
                expected: session_id.to_owned(),
                actual: session.session_id(),
            });
        }

        let sender_key = Curve25519PublicKey::from_base64(&key.sender_key)?;

        Ok(Self::from_vodozemac(
            session,
            sender_key,
            key.sender_claimed_keys.clone(),
            room_id,
            key.forwarding_curve25519_key_chain.clone(),
            false,
            true,
        ))
    }

    /// Export the session in the form that gets encrypted and stored in a key
    /// backup.
    pub fn to_backup(&self) -> BackedUpRoomKey {
        BackedUpRoomKey {
            algorithm: MEGOLM_V1_AES_SHA2.to_owned(),
            sender_key: self.sender_key.to_base64(),
            session_key: self.inner.export_at_first_known_index().to_base64(),
            sender_claimed_keys: self.signing_keys.as_ref().clone(),
            forwarding_curve25519_key_chain: self.forwarding_chain.as_ref().clone(),
        }
    }

    /// The room where this session is used in.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The Curve25519 key of the sender of this session.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    /// The keys the sender of this session claims to own.
    pub fn signing_keys(&self) -> &BTreeMap<String, String> {
        &self.signing_keys
    }

    /// The chain of Curve25519 keys this session was forwarded through.
    pub fn forwarding_key_chain(&self) -> &[String] {
        &self.forwarding_chain
    }

    /// Get the first message index we know how to decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.first_known_index
    }

    /// Did we verify the device that created this session.
    pub fn sender_verified(&self) -> bool {
        self.sender_verified
    }

    /// Has the session been imported from a file or server-side backup? As
    /// opposed to being directly received as an `m.room_key` event.
    pub fn has_been_imported(&self) -> bool {
        self.imported
    }

    /// Has the session been backed up to the server.
    pub fn backed_up(&self) -> bool {
        self.backed_up.load(SeqCst)
    }

    /// Reset the backup state of the inbound group session.
    pub fn reset_backup_state(&self) {
        self.backed_up.store(false, SeqCst)
    }

    /// Mark this group session as backed up.
    ///
    /// Called once the server confirmed that it stored the session, the
    /// session won't be part of the next backup request.
    pub fn mark_as_backed_up(&self) {
        self.backed_up.store(true, SeqCst)
    }
}

impl fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundGroupSession")
            .field("room_id", &self.room_id)
            .field("session_id", &self.session_id)
            .field("first_known_index", &self.first_known_index)
            .field("backed_up", &self.backed_up())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use ruma::RoomId;
    use vodozemac::{
        megolm::{GroupSession, SessionConfig},
        Curve25519SecretKey, Ed25519SecretKey,
    };

    use super::InboundGroupSession;

    /// Create an inbound group session with random keys for the given room.
    pub(crate) fn inbound_group_session(room_id: &RoomId) -> InboundGroupSession {
        let outbound = GroupSession::new(SessionConfig::version_1());
        let sender_key = Curve25519SecretKey::new();

        InboundGroupSession::new(
            (&sender_key).into(),
            Ed25519SecretKey::new().public_key(),
            room_id,
            &outbound.session_key(),
            true,
        )
    }
}
