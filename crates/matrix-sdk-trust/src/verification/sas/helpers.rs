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

use std::collections::BTreeMap;

use ruma::{
    serde::Base64, DeviceKeyAlgorithm, DeviceKeyId, OwnedDeviceId, OwnedDeviceKeyId,
    OwnedTransactionId,
};
use sha2::{Digest, Sha256};
use tracing::{trace, warn};
use vodozemac::{sas::EstablishedSas, Curve25519PublicKey};

use super::sas_state::{SupportedKeyAgreement, SupportedMacMethod};
use crate::{
    identities::DeviceData,
    olm::Account,
    verification::{event_enums::MacContent, CancelCode, Emoji},
};

/// The identities taking part in a single SAS flow.
#[derive(Clone, Debug)]
pub struct SasIds {
    pub account: Account,
    pub other_device: DeviceData,
    /// The devices of the other user as they were known when the flow was
    /// created.
    pub other_devices: BTreeMap<OwnedDeviceId, DeviceData>,
}

/// Calculate the commitment for a accept event from the public key and the
/// start event.
///
/// # Arguments
///
/// * `public_key` - Our own ephemeral public key that is used for the
///   interactive verification.
///
/// * `start_content` - The canonical JSON form of the
///   `m.key.verification.start` event content that started the interactive
///   verification process.
pub fn calculate_commitment(public_key: Curve25519PublicKey, start_content: &str) -> Base64 {
    let hash =
        Sha256::new().chain_update(public_key.to_base64()).chain_update(start_content).finalize();

    Base64::new(hash.as_slice().to_owned())
}

/// Get a tuple of an emoji and a description of the emoji using a number.
///
/// # Panics
///
/// There are 64 unique emojis, this function panics if the index is bigger
/// than 63.
pub(crate) fn emoji_from_index(index: u8) -> Emoji {
    match index {
        0 => Emoji { symbol: "🐶", description: "Dog" },
        1 => Emoji { symbol: "🐱", description: "Cat" },
        2 => Emoji { symbol: "🦁", description: "Lion" },
        3 => Emoji { symbol: "🐎", description: "Horse" },
        4 => Emoji { symbol: "🦄", description: "Unicorn" },
        5 => Emoji { symbol: "🐷", description: "Pig" },
        6 => Emoji { symbol: "🐘", description: "Elephant" },
        7 => Emoji { symbol: "🐰", description: "Rabbit" },
        8 => Emoji { symbol: "🐼", description: "Panda" },
        9 => Emoji { symbol: "🐓", description: "Rooster" },
        10 => Emoji { symbol: "🐧", description: "Penguin" },
        11 => Emoji { symbol: "🐢", description: "Turtle" },
        12 => Emoji { symbol: "🐟", description: "Fish" },
        13 => Emoji { symbol: "🐙", description: "Octopus" },
        14 => Emoji { symbol: "🦋", description: "Butterfly" },
        15 => Emoji { symbol: "🌷", description: "Flower" },
        16 => Emoji { symbol: "🌳", description: "Tree" },
        17 => Emoji { symbol: "🌵", description: "Cactus" },
        18 => Emoji { symbol: "🍄", description: "Mushroom" },
        19 => Emoji { symbol: "🌏", description: "Globe" },
        20 => Emoji { symbol: "🌙", description: "Moon" },
        21 => Emoji { symbol: "☁️", description: "Cloud" },
        22 => Emoji { symbol: "🔥", description: "Fire" },
        23 => Emoji { symbol: "🍌", description: "Banana" },
        24 => Emoji { symbol: "🍎", description: "Apple" },
        25 => Emoji { symbol: "🍓", description: "Strawberry" },
        26 => Emoji { symbol: "🌽", description: "Corn" },
        27 => Emoji { symbol: "🍕", description: "Pizza" },
        28 => Emoji { symbol: "🎂", description: "Cake" },
        29 => Emoji { symbol: "❤️", description: "Heart" },
        30 => Emoji { symbol: "😀", description: "Smiley" },
        31 => Emoji { symbol: "🤖", description: "Robot" },
        32 => Emoji { symbol: "🎩", description: "Hat" },
        33 => Emoji { symbol: "👓", description: "Glasses" },
        34 => Emoji { symbol: "🔧", description: "Spanner" },
        35 => Emoji { symbol: "🎅", description: "Santa" },
        36 => Emoji { symbol: "👍", description: "Thumbs Up" },
        37 => Emoji { symbol: "☂️", description: "Umbrella" },
        38 => Emoji { symbol: "⌛", description: "Hourglass" },
        39 => Emoji { symbol: "⏰", description: "Clock" },
        40 => Emoji { symbol: "🎁", description: "Gift" },
        41 => Emoji { symbol: "💡", description: "Light Bulb" },
        42 => Emoji { symbol: "📕", description: "Book" },
        43 => Emoji { symbol: "✏️", description: "Pencil" },
        44 => Emoji { symbol: "📎", description: "Paperclip" },
        45 => Emoji { symbol: "✂️", description: "Scissors" },
        46 => Emoji { symbol: "🔒", description: "Lock" },
        47 => Emoji { symbol: "🔑", description: "Key" },
        48 => Emoji { symbol: "🔨", description: "Hammer" },
        49 => Emoji { symbol: "☎️", description: "Telephone" },
        50 => Emoji { symbol: "🏁", description: "Flag" },
        51 => Emoji { symbol: "🚂", description: "Train" },
        52 => Emoji { symbol: "🚲", description: "Bicycle" },
        53 => Emoji { symbol: "✈️", description: "Aeroplane" },
        54 => Emoji { symbol: "🚀", description: "Rocket" },
        55 => Emoji { symbol: "🏆", description: "Trophy" },
        56 => Emoji { symbol: "⚽", description: "Ball" },
        57 => Emoji { symbol: "🎸", description: "Guitar" },
        58 => Emoji { symbol: "🎺", description: "Trumpet" },
        59 => Emoji { symbol: "🔔", description: "Bell" },
        60 => Emoji { symbol: "⚓", description: "Anchor" },
        61 => Emoji { symbol: "🎧", description: "Headphones" },
        62 => Emoji { symbol: "📁", description: "Folder" },
        63 => Emoji { symbol: "📌", description: "Pin" },
        _ => panic!("Trying to fetch an emoji outside the allowed range"),
    }
}

/// Convert the first five bytes of the short auth string into three decimal
/// numbers between 1000 and 9191.
pub(crate) fn bytes_to_decimal(bytes: &[u8; 6]) -> (u16, u16, u16) {
    let bytes: Vec<u16> = bytes.iter().map(|&b| b.into()).collect();

    let first = (bytes[0] << 5 | bytes[1] >> 3) + 1000;
    let second = ((bytes[1] & 0x7) << 10 | bytes[2] << 2 | bytes[3] >> 6) + 1000;
    let third = ((bytes[3] & 0x3f) << 7 | bytes[4] >> 1) + 1000;

    (first, second, third)
}

/// Split the first 42 bits of the short auth string into seven 6 bit emoji
/// indices.
pub(crate) fn bytes_to_emoji_index(bytes: &[u8; 6]) -> [u8; 7] {
    let number = bytes.iter().fold(0u64, |acc, &b| acc << 8 | u64::from(b));

    let mut indices = [0u8; 7];

    for (i, index) in indices.iter_mut().enumerate() {
        *index = ((number >> (42 - i * 6)) & 0x3f) as u8;
    }

    indices
}

/// Get the extra info that will be used when we generate bytes for the short
/// auth string.
///
/// The side that started the verification always comes first.
pub(crate) fn extra_info_sas(
    ids: &SasIds,
    key_agreement: SupportedKeyAgreement,
    sas: &EstablishedSas,
    flow_id: &str,
    we_started: bool,
) -> String {
    let info = match key_agreement {
        SupportedKeyAgreement::Curve25519HkdfSha256 => {
            let our_info = format!(
                "{}|{}|{}",
                ids.account.user_id(),
                ids.account.device_id(),
                sas.our_public_key().to_base64()
            );
            let their_info = format!(
                "{}|{}|{}",
                ids.other_device.user_id(),
                ids.other_device.device_id(),
                sas.their_public_key().to_base64()
            );

            let (first_info, second_info) =
                if we_started { (our_info, their_info) } else { (their_info, our_info) };

            format!("MATRIX_KEY_VERIFICATION_SAS|{first_info}|{second_info}|{flow_id}")
        }
        SupportedKeyAgreement::Curve25519 => {
            let our_info = format!("{}{}", ids.account.user_id(), ids.account.device_id());
            let their_info =
                format!("{}{}", ids.other_device.user_id(), ids.other_device.device_id());

            let (first_info, second_info) =
                if we_started { (our_info, their_info) } else { (their_info, our_info) };

            format!("MATRIX_KEY_VERIFICATION_SAS{first_info}{second_info}{flow_id}")
        }
    };

    trace!("Generated a SAS extra info: {}", info);

    info
}

/// Get the six bytes the short auth string is rendered from.
pub(crate) fn short_code_bytes(
    sas: &EstablishedSas,
    ids: &SasIds,
    key_agreement: SupportedKeyAgreement,
    flow_id: &str,
    we_started: bool,
) -> [u8; 6] {
    let info = extra_info_sas(ids, key_agreement, sas, flow_id, we_started);
    *sas.bytes(&info).as_bytes()
}

/// Get the extra info that will be used when we check the MAC of a
/// m.key.verification.mac event.
fn extra_mac_info_receive(ids: &SasIds, flow_id: &str) -> String {
    format!(
        "MATRIX_KEY_VERIFICATION_MAC{first_user}{first_device}\
        {second_user}{second_device}{transaction_id}",
        first_user = ids.other_device.user_id(),
        first_device = ids.other_device.device_id(),
        second_user = ids.account.user_id(),
        second_device = ids.account.device_id(),
        transaction_id = flow_id,
    )
}

/// Get the extra info that will be used when we generate a MAC and need to
/// send it out.
fn extra_mac_info_send(ids: &SasIds, flow_id: &str) -> String {
    format!(
        "MATRIX_KEY_VERIFICATION_MAC{first_user}{first_device}\
        {second_user}{second_device}{transaction_id}",
        first_user = ids.account.user_id(),
        first_device = ids.account.device_id(),
        second_user = ids.other_device.user_id(),
        second_device = ids.other_device.device_id(),
        transaction_id = flow_id,
    )
}

/// Check the MACs the other side sent us.
///
/// Returns the list of devices that got verified, the device we are verifying
/// with is always part of it.
///
/// # Arguments
///
/// * `sas` - The established SAS object that holds the shared secret.
///
/// * `ids` - The ids that are used for this SAS authentication flow.
///
/// * `flow_id` - The unique id that identifies this SAS verification process.
///
/// * `content` - The m.key.verification.mac content that was sent to us by the
///   other side.
pub fn receive_mac_content(
    sas: &EstablishedSas,
    ids: &SasIds,
    flow_id: &str,
    mac_method: SupportedMacMethod,
    content: &MacContent,
) -> Result<Vec<DeviceData>, CancelCode> {
    let mut verified_devices = Vec::new();

    let info = extra_mac_info_receive(ids, flow_id);

    trace!(
        user_id = ?ids.other_device.user_id(),
        device_id = ?ids.other_device.device_id(),
        "Received a key.verification.mac event"
    );

    let mut keys = content.mac.keys().map(|k| k.as_str()).collect::<Vec<_>>();
    keys.sort_unstable();
    mac_method.verify_mac(sas, &keys.join(","), &format!("{info}KEY_IDS"), &content.keys)?;

    for (key_id, key_mac) in &content.mac {
        trace!(
            user_id = ?ids.other_device.user_id(),
            device_id = ?ids.other_device.device_id(),
            key_id,
            "Checking a SAS MAC",
        );

        let Ok(key_id) = OwnedDeviceKeyId::try_from(key_id.as_str()) else {
            warn!(key_id, "The MAC event contained a malformed key ID");
            return Err(CancelCode::KeyMismatch);
        };

        let Some(device) = ids.other_devices.get(key_id.key_name()) else {
            warn!(%key_id, "The key ID in the MAC event doesn't belong to a known device");
            return Err(CancelCode::KeyMismatch);
        };

        let Some(key) = device.keys().get(&key_id) else {
            warn!(%key_id, "The device doesn't have a key with the given key ID");
            return Err(CancelCode::KeyMismatch);
        };

        mac_method.verify_mac(sas, &key.to_base64(), &format!("{info}{key_id}"), key_mac)?;
        trace!(%key_id, "Successfully verified a device key");

        if !verified_devices.iter().any(|d: &DeviceData| d.device_id() == device.device_id()) {
            verified_devices.push(device.clone());
        }
    }

    if !verified_devices.iter().any(|d| d.device_id() == ids.other_device.device_id()) {
        warn!(
            device_id = ?ids.other_device.device_id(),
            "The MAC event didn't contain a MAC for the device we are verifying"
        );
        return Err(CancelCode::KeyMismatch);
    }

    Ok(verified_devices)
}

/// Get the content for a m.key.verification.mac event.
///
/// # Arguments
///
/// * `sas` - The established SAS object that can be used to generate the MAC
///
/// * `ids` - The ids that are used for this SAS authentication flow.
///
/// * `flow_id` - The unique id that identifies this SAS verification process.
pub fn get_mac_content(
    sas: &EstablishedSas,
    ids: &SasIds,
    flow_id: &str,
    mac_method: SupportedMacMethod,
) -> Result<MacContent, CancelCode> {
    let mut mac: BTreeMap<String, Base64> = BTreeMap::new();

    let key_id = DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, ids.account.device_id());
    let key = ids.account.identity_keys().ed25519.to_base64();
    let info = extra_mac_info_send(ids, flow_id);

    let key_mac = mac_method.calculate_mac(sas, &key, &format!("{info}{key_id}"))?;
    mac.insert(key_id.to_string(), key_mac);

    let mut keys: Vec<_> = mac.keys().map(|s| s.as_str()).collect();
    keys.sort_unstable();

    let keys = mac_method.calculate_mac(sas, &keys.join(","), &format!("{info}KEY_IDS"))?;

    Ok(MacContent::new(OwnedTransactionId::from(flow_id), mac, keys))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use ruma::serde::Base64;
    use serde_json::json;
    use vodozemac::Curve25519PublicKey;

    use super::{bytes_to_decimal, bytes_to_emoji_index, calculate_commitment, emoji_from_index};
    use crate::verification::event_enums::{canonical_json, StartContent};

    #[test]
    fn commitment_calculation() {
        let commitment = Base64::parse("CCQmB4JCdB0FW21FdAnHj/Hu8+W9+Nb0vgwPEnZZQ4g").unwrap();

        let public_key =
            Curve25519PublicKey::from_base64("Q/NmNFEUS1fS+YeEmiZkjjblKTitrKOAk7cPEumcMlg")
                .unwrap();
        let content = json!({
            "from_device":"XOWLHHFSWM",
            "transaction_id":"bYxBsirjUJO9osar6ST4i2M2NjrYLA7l",
            "method":"m.sas.v1",
            "key_agreement_protocols":["curve25519-hkdf-sha256","curve25519"],
            "hashes":["sha256"],
            "message_authentication_codes":["hkdf-hmac-sha256","hmac-sha256"],
            "short_authentication_string":["decimal","emoji"]
        });

        let content: StartContent = serde_json::from_value(content).unwrap();
        let calculated_commitment =
            calculate_commitment(public_key, &canonical_json(&content).unwrap());

        assert_eq!(calculated_commitment, commitment);
    }

    #[test]
    fn decimal_bounds() {
        assert_eq!(bytes_to_decimal(&[0; 6]), (1000, 1000, 1000));
        assert_eq!(bytes_to_decimal(&[0xff; 6]), (9191, 9191, 9191));
    }

    #[test]
    fn emoji_indices() {
        assert_eq!(bytes_to_emoji_index(&[0; 6]), [0; 7]);
        assert_eq!(bytes_to_emoji_index(&[0xff; 6]), [63; 7]);
        // 0b000001_000010_000011_000100_000101_000110_000111_000000
        assert_eq!(
            bytes_to_emoji_index(&[0x04, 0x20, 0xc4, 0x14, 0x61, 0xc0]),
            [1, 2, 3, 4, 5, 6, 7]
        );

        assert_eq!(emoji_from_index(0).description, "Dog");
        assert_eq!(emoji_from_index(63).description, "Pin");
    }

    proptest! {
        #[test]
        fn decimals_are_in_range(bytes in any::<[u8; 6]>()) {
            let (first, second, third) = bytes_to_decimal(&bytes);

            prop_assert!((1000..=9191).contains(&first));
            prop_assert!((1000..=9191).contains(&second));
            prop_assert!((1000..=9191).contains(&third));
        }

        #[test]
        fn emoji_indices_are_in_range(bytes in any::<[u8; 6]>()) {
            let indices = bytes_to_emoji_index(&bytes);

            prop_assert!(indices.iter().all(|&i| i < 64));

            for index in indices {
                emoji_from_index(index);
            }
        }
    }
}
