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

use std::fmt;

use serde::{Deserialize, Serialize};

/// The state of the server-side key backup.
///
/// A check of the server moves from [`BackupState::CheckingBackUpOnHomeserver`]
/// to either [`BackupState::Disabled`], [`BackupState::NotTrusted`] or
/// [`BackupState::WrongBackUpVersion`], or starts enabling a trusted backup
/// version right away. Enabled backups cycle through
/// `ReadyToBackUp -> WillBackUp -> BackingUp -> ReadyToBackUp` until the
/// server rejects our version.
///
/// Every state can be driven back to [`BackupState::Unknown`] or
/// [`BackupState::CheckingBackUpOnHomeserver`] by an explicit re-check.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackupState {
    /// We don't know yet if there is a backup on the server.
    #[default]
    Unknown,
    /// We are asking the server for its current backup version.
    CheckingBackUpOnHomeserver,
    /// There is a backup on the server that uses a different version than the
    /// one we were backing up to.
    WrongBackUpVersion,
    /// Backups are disabled, there is no usable backup version.
    Disabled,
    /// There is a backup on the server but none of our verified devices
    /// vouches for it.
    NotTrusted,
    /// A backup version is being enabled.
    Enabling,
    /// Backups are enabled and every known room key has been backed up.
    ReadyToBackUp,
    /// A backup pass has been requested and is about to start.
    WillBackUp,
    /// Room keys are being uploaded to the server.
    BackingUp,
}

impl BackupState {
    /// Can the backup engine move from this state into the `next` one.
    pub fn can_transition_to(self, next: BackupState) -> bool {
        use BackupState::*;

        if self == next {
            return true;
        }

        match next {
            Unknown | CheckingBackUpOnHomeserver => true,
            // Deleting the backup version or losing it on the server disables
            // backups from any state a check has been made in.
            Disabled => self != Unknown,
            NotTrusted => self == CheckingBackUpOnHomeserver,
            WrongBackUpVersion => {
                matches!(self, CheckingBackUpOnHomeserver | WillBackUp | BackingUp)
            }
            Enabling => !matches!(self, WillBackUp | BackingUp),
            ReadyToBackUp => matches!(self, Enabling | NotTrusted | WillBackUp | BackingUp),
            WillBackUp => self == ReadyToBackUp,
            BackingUp => self == WillBackUp,
        }
    }

    /// Is a usable backup version enabled.
    pub fn is_enabled(self) -> bool {
        use BackupState::*;

        matches!(self, ReadyToBackUp | WillBackUp | BackingUp)
    }
}

impl fmt::Display for BackupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
