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

//! The keys of a server-side key backup.
//!
//! Room keys get encrypted with the public [`MegolmV1BackupKey`] and can only
//! be decrypted again with the matching [`BackupDecryptionKey`], which the
//! user keeps as a recovery key or derives from a passphrase.

mod backup;
mod recovery;

pub use backup::MegolmV1BackupKey;
pub use recovery::{BackupDecryptionKey, DecodeError, DecryptionError};
