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

//! Message type definitions for every cluster role.
//!
//! Each role owns its own `u16` numbering space, so two roles may
//! legally reuse a discriminant; a message type is only meaningful
//! together with the channel it was addressed to.

use crate::globals::MsgType;
use strum_macros::FromRepr;

/// Control messages, recognized only when addressed to the
/// control channel ([`crate::globals::CONTROL_MESSAGE`]).
///
/// `SetConName` and `SetConUrl` omit the sender field; every other
/// control message carries a `u64` sender right after the type.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum ControlMsg {
    SetChannel = 2001,
    RemoveChannel = 2002,
    SetConName = 2004,
    SetConUrl = 2005,
    // Interval subscriptions are reserved; accepted but never acted on.
    AddRange = 2008,
    RemoveRange = 2009,
    AddPostRemove = 2010,
    ClearPostRemove = 2011,
}

/// State server messages, both the operations it accepts and the
/// events it emits toward AI servers, owners, and observers.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum StateServerMsg {
    ObjectGenerateWithRequired = 2001,
    ObjectGenerateWithRequiredOther = 2003,
    ObjectUpdateField = 2004,
    ObjectDeleteRam = 2007,
    ObjectSetZone = 2008,
    ObjectChangeZone = 2009,
    ObjectSetLocation = 2040,
    ObjectChangingLocation = 2041,
    ObjectEnterLocationWithRequired = 2042,
    ObjectEnterLocationWithRequiredOther = 2043,
    ObjectLocationAck = 2047,
    ObjectSetAi = 2050,
    ObjectChangingAi = 2051,
    ObjectEnterAiWithRequired = 2052,
    ObjectEnterAiWithRequiredOther = 2053,
    ObjectEnterzoneWithRequiredOther = 2066,
    ObjectEnterOwnerRecv = 2068,
    ObjectChangeOwnerRecv = 2069,
    ObjectSetOwnerRecv = 2070,
    BounceMessage = 2086,
    ObjectGetZonesObjects = 2100,
    ObjectGetZonesObjectsResp = 2101,
    ObjectGetZonesObjects2 = 2102,
    ObjectGetZonesObjects2Resp = 2103,
    ObjectClearWatch = 2104,
    AddShard = 2110,
    RemoveShard = 2111,
}

/// Database server messages the state server emits for `db` fields.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum DatabaseMsg {
    ObjectSetField = 1020,
}

/// Client agent messages the state server emits.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
pub enum ClientAgentMsg {
    Disconnect = 4040,
}

/// Disconnect reason sent with [`ClientAgentMsg::Disconnect`]
/// when an owned object's shard is torn down.
pub const DISCONNECT_SHARD_CLOSED: u16 = 153;

impl From<ControlMsg> for MsgType {
    fn from(value: ControlMsg) -> Self {
        value as MsgType
    }
}

impl From<StateServerMsg> for MsgType {
    fn from(value: StateServerMsg) -> Self {
        value as MsgType
    }
}

impl From<DatabaseMsg> for MsgType {
    fn from(value: DatabaseMsg) -> Self {
        value as MsgType
    }
}

impl From<ClientAgentMsg> for MsgType {
    fn from(value: ClientAgentMsg) -> Self {
        value as MsgType
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_discriminants_round_trip() {
        let types: &[ControlMsg] = &[
            ControlMsg::SetChannel,
            ControlMsg::RemoveChannel,
            ControlMsg::SetConName,
            ControlMsg::SetConUrl,
            ControlMsg::AddRange,
            ControlMsg::RemoveRange,
            ControlMsg::AddPostRemove,
            ControlMsg::ClearPostRemove,
        ];

        for msg_type in types {
            let raw: MsgType = (*msg_type).into();
            assert_eq!(ControlMsg::from_repr(raw), Some(*msg_type));
        }
        assert_eq!(ControlMsg::from_repr(0), None);
    }

    #[test]
    fn state_server_discriminants_round_trip() {
        let raw: MsgType = StateServerMsg::ObjectSetOwnerRecv.into();

        assert_eq!(raw, 2070);
        assert_eq!(
            StateServerMsg::from_repr(raw),
            Some(StateServerMsg::ObjectSetOwnerRecv)
        );
        assert_eq!(StateServerMsg::from_repr(9999), None);
    }
}
