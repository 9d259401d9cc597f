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

//! Collection of public identities of the devices we know about.
//!
//! Devices are fetched from the homeserver by the host application and handed
//! to the [`CryptoStore`](crate::store::CryptoStore), the only thing this crate
//! changes about them is their local trust state.

mod device;

pub use device::{DeviceData, DeviceKey, LocalTrust};

#[cfg(test)]
pub(crate) use device::testing;
