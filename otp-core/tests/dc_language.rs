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

//! Integration testing for the DC language front end: a realistic
//! schema goes through the lexer and parser, and the resulting
//! registry drives the field packer.

use otp_core::datagram::datagram::Datagram;
use otp_core::datagram::iterator::DatagramIterator;
use otp_core::dcfield::DCField;
use otp_core::dcfile::{DCFile, DClass};
use otp_core::dcpacker::{pack_field, unpack_field, FieldValue};
use otp_core::dcparser::parse_dc_sources;

/// A trimmed but representative game schema.
static GAME_DC: &str = "
keyword loadout;

typedef uint32 doId;

struct BarrierData {
  uint16 context;
  string name;
  uint32array avIds;
};

from game.objects import DistributedAvatar/AI/OV

dclass DistributedObject {
  setBarrierData(BarrierData data) broadcast ram;
};

dclass DistributedAvatar : DistributedObject {
  setName(string name) required broadcast db;
  setHp(uint16(0-1000) hp) required broadcast ram;
  setXY(int32 x, int32 y) broadcast ownsend;
  setChat(string) clsend airecv;
  setFriendsList(uint32array) ram db;
  announceVictory : setName, setHp;
};

dclass DistributedNpc : DistributedAvatar {
  setScript(string) required;
};
";

fn read_game_dc() -> DCFile {
    parse_dc_sources(&[GAME_DC.to_owned()]).expect("the game schema must parse")
}

#[test]
fn parses_full_schema() {
    let dc: DCFile = read_game_dc();

    assert_eq!(dc.get_num_dclasses(), 3);
    assert_eq!(dc.get_num_structs(), 1);
    assert_eq!(dc.get_num_imports(), 1);
    assert!(dc.has_keyword("loadout"));
}

#[test]
fn class_hierarchy_and_field_indices() {
    let dc: DCFile = read_game_dc();

    let object: &DClass = dc.class_by_name("DistributedObject").expect("declared");
    let avatar: &DClass = dc.class_by_name("DistributedAvatar").expect("declared");
    let npc: &DClass = dc.class_by_name("DistributedNpc").expect("declared");

    assert_eq!(object.get_dclass_id(), 0);
    assert_eq!(avatar.get_dclass_id(), 1);
    assert_eq!(npc.get_dclass_id(), 2);

    // setBarrierData(0), setName(1), setHp(2), setXY(3), setChat(4),
    // setFriendsList(5), announceVictory(6), setScript(7)
    assert_eq!(dc.get_num_fields(), 8);

    // the avatar inherits the object's field first
    assert_eq!(avatar.get_inherited_field(0), Some(0));
    assert_eq!(avatar.get_inherited_field(1), Some(1));

    // the npc sees the whole chain
    assert_eq!(npc.get_num_inherited_fields(), 8);
    assert!(npc.has_field(0));
    assert!(npc.has_field(7));
    assert!(!object.has_field(1));
}

#[test]
fn required_fields_follow_inherited_order() {
    let dc: DCFile = read_game_dc();
    let npc: &DClass = dc.class_by_name("DistributedNpc").expect("declared");

    let required: Vec<&str> = npc
        .get_inherited_fields()
        .iter()
        .filter_map(|id| dc.field_by_id(*id))
        .filter(|field| field.is_required())
        .map(|field| field.get_name())
        .collect();

    assert_eq!(required, vec!["setName", "setHp", "setScript"]);
}

#[test]
fn keywords_survive_the_pipeline() {
    let dc: DCFile = read_game_dc();
    let avatar: &DClass = dc.class_by_name("DistributedAvatar").expect("declared");

    let set_name: &DCField = dc.field_by_name(avatar, "setName").expect("declared");
    assert!(set_name.is_required() && set_name.is_broadcast() && set_name.is_db());

    let set_xy: &DCField = dc.field_by_name(avatar, "setXY").expect("declared");
    assert!(set_xy.is_ownsend() && !set_xy.is_clsend());

    let set_chat: &DCField = dc.field_by_name(avatar, "setChat").expect("declared");
    assert!(set_chat.is_clsend() && set_chat.has_keyword("airecv"));

    // molecular: union of component keywords
    let victory: &DCField = dc.field_by_name(avatar, "announceVictory").expect("declared");
    assert!(victory.is_required() && victory.is_broadcast() && victory.is_db());
    assert!(victory.is_ram());
    assert_eq!(victory.get_params().len(), 2);
}

#[test]
fn struct_typed_field_round_trip() {
    let dc: DCFile = read_game_dc();
    let avatar: &DClass = dc.class_by_name("DistributedAvatar").expect("declared");
    let barrier: &DCField = dc.field_by_name(avatar, "setBarrierData").expect("inherited");

    let args: Vec<FieldValue> = vec![FieldValue::List(vec![
        FieldValue::UInt(3),
        FieldValue::Text("gate".to_owned()),
        FieldValue::List(vec![FieldValue::UInt(100001), FieldValue::UInt(100002)]),
    ])];

    let packed: Vec<u8> = pack_field(&dc, barrier, &args).expect("pack");
    let dg: Datagram = Datagram::try_from(packed).expect("fits");
    let mut dgi: DatagramIterator = dg.into();

    assert_eq!(unpack_field(&dc, barrier, &mut dgi).expect("unpack"), args);
    assert_eq!(dgi.get_remaining(), 0);
}

#[test]
fn hash_is_stable_across_reads() {
    let first: DCFile = read_game_dc();
    let second: DCFile = read_game_dc();

    assert_eq!(first.get_legacy_hash(), second.get_legacy_hash());
    assert_ne!(first.get_legacy_hash(), 0);
}

#[test]
fn hash_differs_when_schema_changes() {
    let base: DCFile = read_game_dc();
    let altered: DCFile = parse_dc_sources(&[GAME_DC.replace("setHp", "setHitPoints")])
        .expect("altered schema must parse");

    assert_ne!(base.get_legacy_hash(), altered.get_legacy_hash());
}

#[test]
fn malformed_schema_is_rejected() {
    assert!(parse_dc_sources(&["dclass Broken {".to_owned()]).is_err());
    assert!(parse_dc_sources(&["dclass A : NotDeclared {};".to_owned()]).is_err());
    assert!(parse_dc_sources(&["dclass A { setFoo(mystery); };".to_owned()]).is_err());
}
