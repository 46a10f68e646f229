/*
    This file is part of otpd.

    Copyright © 2024 otpd Authors.

    otpd is free software; you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License,
    as published by the Free Software Foundation, either version 3
    of the License, or (at your option) any later version.

    otpd is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public
    License along with otpd. If not, see <https://www.gnu.org/licenses/>.
*/

//! Type aliases and constants shared by the whole cluster.

use std::mem;

// Type Definitions
pub type DgSizeTag = u16;
pub type Channel = u64;
pub type DoId = u32;
pub type Zone = u32;
pub type DClassId = u16;
pub type FieldId = u16;
pub type MsgType = u16;
pub type DCFileHash = u32;

// Type Limits
pub const DG_SIZE_MAX: DgSizeTag = u16::MAX;
pub const CHANNEL_MAX: Channel = u64::MAX;
pub const DOID_MAX: DoId = u32::MAX;
pub const ZONE_MAX: Zone = u32::MAX;
pub const ZONE_BITS: usize = 8 * mem::size_of::<Zone>();

// DoId Constants
pub const INVALID_DOID: DoId = 0;

// Channel Constants
pub const INVALID_CHANNEL: Channel = 0;
/// Sentinel recipient recognized only by the message director.
pub const CONTROL_MESSAGE: Channel = 4001;
pub const STATESERVER_CHANNEL: Channel = 4002;
pub const DBSERVER_ID: Channel = 4003;
pub const DATABASE_CHANNEL: Channel = DBSERVER_ID;
pub const CLIENTAGENT_CHANNEL: Channel = 4004;
/// Trusted uberdog channel; updates from it are authoritative.
pub const UD_CHANNEL: Channel = 4005;

// Composite connection channel kinds, stored in the high 32 bits.
pub const PUPPET_CHANNEL_KIND: Channel = 1001;
pub const ACCOUNT_CHANNEL_KIND: Channel = 1003;

// DC file keywords and view suffixes recognized by the lexer.
#[rustfmt::skip]
pub static DC_KEYWORDS: [&str; 9] = [
    "ram", "required", "db",
    "airecv", "ownrecv", "clrecv",
    "broadcast", "ownsend", "clsend",
];

pub static DC_VIEW_SUFFIXES: [&str; 3] = ["AI", "OV", "UD"];

/// Builds the puppet connection channel of an avatar.
#[inline]
pub fn puppet_connection_channel(do_id: DoId) -> Channel {
    (PUPPET_CHANNEL_KIND << ZONE_BITS) | Channel::from(do_id)
}

/// Builds the account connection channel of an avatar.
#[inline]
pub fn account_connection_channel(do_id: DoId) -> Channel {
    (ACCOUNT_CHANNEL_KIND << ZONE_BITS) | Channel::from(do_id)
}

/// Extracts the avatar id from the low half of a composite channel.
#[inline]
pub fn avatar_id_from_channel(channel: Channel) -> DoId {
    (channel & Channel::from(DOID_MAX)) as DoId
}

/// Extracts the kind (high half) of a composite channel.
#[inline]
pub fn channel_kind(channel: Channel) -> Channel {
    channel >> ZONE_BITS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_channel_halves() {
        let channel: Channel = puppet_connection_channel(100001);

        assert_eq!(channel, (1001 << 32) | 100001);
        assert_eq!(avatar_id_from_channel(channel), 100001);
        assert_eq!(channel_kind(channel), PUPPET_CHANNEL_KIND);

        let channel: Channel = account_connection_channel(42);

        assert_eq!(channel, (1003 << 32) | 42);
        assert_eq!(avatar_id_from_channel(channel), 42);
        assert_eq!(channel_kind(channel), ACCOUNT_CHANNEL_KIND);
    }

    #[test]
    fn avatar_id_of_plain_channel() {
        // A non-composite channel has no kind bits set.
        assert_eq!(channel_kind(STATESERVER_CHANNEL), 0);
        assert_eq!(avatar_id_from_channel(4002), 4002);
    }
}
