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

//! The state record of one live distributed object, and the wire
//! events it emits toward owners, AI servers, and observers.

use log::warn;
use multimap::MultiMap;
use otp_core::datagram::datagram::{Datagram, DatagramError};
use otp_core::dcfile::DCFile;
use otp_core::globals::{Channel, DClassId, DoId, FieldId, Zone};
use otp_core::protocol::{DatabaseMsg, StateServerMsg};
use otp_network::DatagramSink;
use std::collections::BTreeMap;

/// A live distributed object.
///
/// Every `old_*` shadow records the immediately previous value of
/// its primary; the shadows are updated exactly when the primary is
/// set, before any dependent sends occur.
pub struct StateObject {
    do_id: DoId,
    parent_id: DoId,
    old_parent_id: DoId,
    zone_id: Zone,
    old_zone_id: Zone,
    ai_channel: Channel,
    old_ai_channel: Channel,
    owner_id: Channel,
    old_owner_id: Channel,
    dclass_id: DClassId,
    has_other: bool,
    /// Packed args per required field, kept sorted by field index so
    /// generates re-emit them in schema order.
    required_fields: BTreeMap<FieldId, Vec<u8>>,
    other_fields: BTreeMap<FieldId, Vec<u8>>,
    /// Children of this object, indexed by the zone they occupy.
    zone_objects: BTreeMap<Zone, Vec<DoId>>,
    /// Observers that asked to be told about entries and departures
    /// in zones under this object.
    watch_list: MultiMap<Channel, Zone>,
}

impl StateObject {
    pub fn new(
        do_id: DoId,
        parent_id: DoId,
        zone_id: Zone,
        dclass_id: DClassId,
        has_other: bool,
    ) -> Self {
        Self {
            do_id,
            parent_id,
            old_parent_id: 0,
            zone_id,
            old_zone_id: 0,
            ai_channel: 0,
            old_ai_channel: 0,
            owner_id: 0,
            old_owner_id: 0,
            dclass_id,
            has_other,
            required_fields: BTreeMap::new(),
            other_fields: BTreeMap::new(),
            zone_objects: BTreeMap::new(),
            watch_list: MultiMap::new(),
        }
    }

    // ---------- identity and state accessors ---------- //

    pub fn get_do_id(&self) -> DoId {
        self.do_id
    }

    pub fn get_parent_id(&self) -> DoId {
        self.parent_id
    }

    pub fn get_old_parent_id(&self) -> DoId {
        self.old_parent_id
    }

    pub fn get_zone_id(&self) -> Zone {
        self.zone_id
    }

    pub fn get_old_zone_id(&self) -> Zone {
        self.old_zone_id
    }

    pub fn get_ai_channel(&self) -> Channel {
        self.ai_channel
    }

    pub fn get_old_ai_channel(&self) -> Channel {
        self.old_ai_channel
    }

    pub fn get_owner_id(&self) -> Channel {
        self.owner_id
    }

    pub fn get_old_owner_id(&self) -> Channel {
        self.old_owner_id
    }

    pub fn get_dclass_id(&self) -> DClassId {
        self.dclass_id
    }

    pub fn has_other(&self) -> bool {
        self.has_other
    }

    pub fn set_parent(&mut self, parent_id: DoId) {
        self.old_parent_id = self.parent_id;
        self.parent_id = parent_id;
    }

    pub fn set_zone(&mut self, zone_id: Zone) {
        self.old_zone_id = self.zone_id;
        self.zone_id = zone_id;
    }

    pub fn set_ai_channel(&mut self, ai_channel: Channel) {
        self.old_ai_channel = self.ai_channel;
        self.ai_channel = ai_channel;
    }

    pub fn set_owner(&mut self, owner_id: Channel) {
        self.old_owner_id = self.owner_id;
        self.owner_id = owner_id;
    }

    // ---------- field stores ---------- //

    pub fn set_required_field(&mut self, field_id: FieldId, packed: Vec<u8>) {
        self.required_fields.insert(field_id, packed);
    }

    pub fn set_other_field(&mut self, field_id: FieldId, packed: Vec<u8>) {
        self.other_fields.insert(field_id, packed);
    }

    /// Marks the object as carrying "other" fields; generates will
    /// include them from now on.
    pub fn promote_has_other(&mut self) {
        self.has_other = true;
    }

    pub fn get_required_fields(&self) -> &BTreeMap<FieldId, Vec<u8>> {
        &self.required_fields
    }

    pub fn get_other_fields(&self) -> &BTreeMap<FieldId, Vec<u8>> {
        &self.other_fields
    }

    // ---------- children index ---------- //

    pub fn has_child(&self, child_do_id: DoId) -> bool {
        self.zone_of_child(child_do_id).is_some()
    }

    pub fn zone_of_child(&self, child_do_id: DoId) -> Option<Zone> {
        for (zone_id, children) in &self.zone_objects {
            if children.contains(&child_do_id) {
                return Some(*zone_id);
            }
        }
        None
    }

    pub fn add_child_in_zone(&mut self, child_do_id: DoId, zone_id: Zone) {
        let children: &mut Vec<DoId> = self.zone_objects.entry(zone_id).or_default();

        if !children.contains(&child_do_id) {
            children.push(child_do_id);
        }
    }

    pub fn remove_child_from_zone(&mut self, child_do_id: DoId, zone_id: Zone) {
        if let Some(children) = self.zone_objects.get_mut(&zone_id) {
            children.retain(|id| *id != child_do_id);

            if children.is_empty() {
                self.zone_objects.remove(&zone_id);
            }
        }
    }

    pub fn zone_children(&self, zone_id: Zone) -> Vec<DoId> {
        self.zone_objects.get(&zone_id).cloned().unwrap_or_default()
    }

    pub fn children_in_zones(&self, zone_ids: &[Zone]) -> Vec<DoId> {
        let mut children: Vec<DoId> = vec![];

        for zone_id in zone_ids {
            children.extend(self.zone_children(*zone_id));
        }
        children
    }

    pub fn all_children(&self) -> Vec<DoId> {
        let mut children: Vec<DoId> = vec![];

        for zone_children in self.zone_objects.values() {
            children.extend_from_slice(zone_children);
        }
        children
    }

    pub fn has_children(&self) -> bool {
        !self.zone_objects.is_empty()
    }

    // ---------- watch list ---------- //

    pub fn add_watch(&mut self, observer: Channel, zone_id: Zone) {
        if let Some(zones) = self.watch_list.get_vec(&observer) {
            if zones.contains(&zone_id) {
                return;
            }
        }
        self.watch_list.insert(observer, zone_id);
    }

    /// Removes one watched zone; returns false if the observer had
    /// no watch list at all.
    pub fn remove_watch(&mut self, observer: Channel, zone_id: Zone) -> bool {
        let Some(zones) = self.watch_list.get_vec_mut(&observer) else {
            return false;
        };

        zones.retain(|zone| *zone != zone_id);

        if zones.is_empty() {
            self.watch_list.remove(&observer);
        }
        true
    }

    pub fn has_watcher(&self, observer: Channel) -> bool {
        self.watch_list.contains_key(&observer)
    }

    /// Any observer watching the given zone under this object.
    pub fn zone_watcher(&self, zone_id: Zone) -> Option<Channel> {
        for (observer, zones) in self.watch_list.iter_all() {
            if zones.contains(&zone_id) {
                return Some(*observer);
            }
        }
        None
    }

    // ---------- wire event emitters ---------- //

    /// Appends the object's required fields in schema order. With
    /// `broadcast_only`, fields not marked broadcast are withheld;
    /// owners and AI servers get the full set.
    pub fn append_required_data(
        &self,
        dc: &DCFile,
        dg: &mut Datagram,
        broadcast_only: bool,
    ) -> Result<(), DatagramError> {
        for (field_id, packed) in &self.required_fields {
            let Some(field) = dc.field_by_id(*field_id) else {
                warn!(
                    "Failed to append required data for field: {}, unknown field!",
                    field_id
                );
                continue;
            };

            if broadcast_only && !field.is_broadcast() {
                continue;
            }
            dg.add_data(packed.clone())?;
        }
        Ok(())
    }

    /// Appends the object's "other" fields: a count, then each
    /// field's index and packed args.
    pub fn append_other_data(&self, dg: &mut Datagram) -> Result<(), DatagramError> {
        dg.add_u16(self.other_fields.len() as u16)?;

        for (field_id, packed) in &self.other_fields {
            dg.add_u16(*field_id)?;
            dg.add_data(packed.clone())?;
        }
        Ok(())
    }

    pub fn send_owner_entry(
        &self,
        dc: &DCFile,
        channel: Channel,
        out: &DatagramSink,
    ) -> Result<(), DatagramError> {
        let mut dg: Datagram = Datagram::default();

        dg.add_server_header(
            vec![channel],
            Channel::from(self.do_id),
            StateServerMsg::ObjectEnterOwnerRecv.into(),
        )?;
        dg.add_u64(Channel::from(self.do_id))?;
        dg.add_u64(Channel::from(self.parent_id))?;
        dg.add_zone(self.zone_id)?;
        dg.add_u16(self.dclass_id)?;

        // owners always get the full required set
        self.append_required_data(dc, &mut dg, false)?;

        if self.has_other {
            self.append_other_data(&mut dg)?;
        }
        stage(out, dg);
        Ok(())
    }

    pub fn send_changing_owner(
        &self,
        channel: Channel,
        old_owner_id: Channel,
        new_owner_id: Channel,
        out: &DatagramSink,
    ) -> Result<(), DatagramError> {
        let mut dg: Datagram = Datagram::default();

        dg.add_server_header(
            vec![channel],
            Channel::from(self.do_id),
            StateServerMsg::ObjectChangeOwnerRecv.into(),
        )?;
        dg.add_u64(Channel::from(self.do_id))?;
        dg.add_u64(new_owner_id)?;
        dg.add_u64(old_owner_id)?;

        stage(out, dg);
        Ok(())
    }

    pub fn send_ai_entry(
        &self,
        dc: &DCFile,
        channel: Channel,
        out: &DatagramSink,
    ) -> Result<(), DatagramError> {
        let msg_type: StateServerMsg = if self.has_other {
            StateServerMsg::ObjectEnterAiWithRequiredOther
        } else {
            StateServerMsg::ObjectEnterAiWithRequired
        };

        let mut dg: Datagram = Datagram::default();

        dg.add_server_header(vec![channel], Channel::from(self.do_id), msg_type.into())?;
        dg.add_u64(Channel::from(self.do_id))?;
        dg.add_u64(Channel::from(self.parent_id))?;
        dg.add_zone(self.zone_id)?;
        dg.add_u16(self.dclass_id)?;

        // an owned object reports its full state to its AI
        self.append_required_data(dc, &mut dg, self.owner_id == 0)?;

        if self.has_other {
            self.append_other_data(&mut dg)?;
        }
        stage(out, dg);
        Ok(())
    }

    pub fn send_changing_ai(
        &self,
        channel: Channel,
        out: &DatagramSink,
    ) -> Result<(), DatagramError> {
        let mut dg: Datagram = Datagram::default();

        dg.add_server_header(
            vec![channel],
            Channel::from(self.do_id),
            StateServerMsg::ObjectChangingAi.into(),
        )?;
        dg.add_u64(Channel::from(self.do_id))?;
        dg.add_u64(self.old_ai_channel)?;
        dg.add_u64(self.ai_channel)?;

        stage(out, dg);
        Ok(())
    }

    pub fn send_location_entry(
        &self,
        dc: &DCFile,
        channel: Channel,
        out: &DatagramSink,
    ) -> Result<(), DatagramError> {
        let msg_type: StateServerMsg = if self.has_other {
            StateServerMsg::ObjectEnterLocationWithRequiredOther
        } else {
            StateServerMsg::ObjectEnterLocationWithRequired
        };

        let mut dg: Datagram = Datagram::default();

        dg.add_server_header(vec![channel], Channel::from(self.do_id), msg_type.into())?;
        dg.add_u64(Channel::from(self.do_id))?;
        dg.add_u64(Channel::from(self.parent_id))?;
        dg.add_zone(self.zone_id)?;
        dg.add_u16(self.dclass_id)?;

        self.append_required_data(dc, &mut dg, true)?;

        if self.has_other {
            self.append_other_data(&mut dg)?;
        }
        stage(out, dg);
        Ok(())
    }

    /// Tells an observer the object left its view.
    pub fn send_departure(&self, channel: Channel, out: &DatagramSink) -> Result<(), DatagramError> {
        let mut dg: Datagram = Datagram::default();

        dg.add_server_header(
            vec![channel],
            Channel::from(self.do_id),
            StateServerMsg::ObjectDeleteRam.into(),
        )?;
        dg.add_doid(self.do_id)?;

        stage(out, dg);
        Ok(())
    }

    /// Announces this object's location change on `channel`. A move
    /// under the same parent is the lightweight zone-change message;
    /// a reparent is a departure followed by a fresh zone entry.
    pub fn send_changing_location(
        &self,
        dc: &DCFile,
        channel: Channel,
        out: &DatagramSink,
    ) -> Result<(), DatagramError> {
        if self.old_parent_id == self.parent_id {
            let mut dg: Datagram = Datagram::default();

            dg.add_server_header(
                vec![channel],
                Channel::from(self.do_id),
                StateServerMsg::ObjectChangeZone.into(),
            )?;
            dg.add_doid(self.do_id)?;
            dg.add_location(self.parent_id, self.zone_id)?;
            dg.add_location(self.old_parent_id, self.old_zone_id)?;

            stage(out, dg);
            return Ok(());
        }

        self.send_departure(channel, out)?;

        let mut dg: Datagram = Datagram::default();

        dg.add_server_header(
            vec![channel],
            Channel::from(self.do_id),
            StateServerMsg::ObjectEnterzoneWithRequiredOther.into(),
        )?;
        dg.add_location(self.parent_id, self.zone_id)?;
        dg.add_u16(self.dclass_id)?;
        dg.add_doid(self.do_id)?;

        self.append_required_data(dc, &mut dg, self.owner_id == 0)?;

        if self.has_other {
            self.append_other_data(&mut dg)?;
        }
        stage(out, dg);
        Ok(())
    }

    /// Acknowledges a finished location change to the owner,
    /// consuming one pending interest context.
    pub fn send_location_ack(
        &self,
        channel: Channel,
        context: u32,
        out: &DatagramSink,
    ) -> Result<(), DatagramError> {
        let mut dg: Datagram = Datagram::default();

        dg.add_server_header(
            vec![channel],
            Channel::from(self.do_id),
            StateServerMsg::ObjectLocationAck.into(),
        )?;
        dg.add_doid(self.do_id)?;
        dg.add_location(self.old_parent_id, self.old_zone_id)?;
        dg.add_location(self.parent_id, self.zone_id)?;
        dg.add_u32(context)?;

        stage(out, dg);
        Ok(())
    }

    pub fn send_update_field(
        &self,
        channel: Channel,
        sender: Channel,
        field_id: FieldId,
        packed: &[u8],
        out: &DatagramSink,
    ) -> Result<(), DatagramError> {
        let mut dg: Datagram = Datagram::default();

        dg.add_server_header(
            vec![channel],
            sender,
            StateServerMsg::ObjectUpdateField.into(),
        )?;
        dg.add_doid(self.do_id)?;
        dg.add_u16(field_id)?;
        dg.add_data(packed.to_vec())?;

        stage(out, dg);
        Ok(())
    }

    /// Forwards a `db` field's new value to the database server.
    pub fn send_save_field(
        &self,
        database_channel: Channel,
        field_id: FieldId,
        packed: &[u8],
        out: &DatagramSink,
    ) -> Result<(), DatagramError> {
        let mut dg: Datagram = Datagram::default();

        dg.add_server_header(
            vec![database_channel],
            Channel::from(self.do_id),
            DatabaseMsg::ObjectSetField.into(),
        )?;
        dg.add_doid(self.do_id)?;
        dg.add_u16(field_id)?;
        dg.add_data(packed.to_vec())?;

        stage(out, dg);
        Ok(())
    }
}

/// Hands a finished datagram to the connection writer. A closed sink
/// means the service is shutting down; the datagram is dropped.
fn stage(out: &DatagramSink, dg: Datagram) {
    let _ = out.send(dg);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadow_fields_record_previous_values() {
        let mut object: StateObject = StateObject::new(100, 1, 5, 0, false);

        assert_eq!(object.get_parent_id(), 1);
        assert_eq!(object.get_old_parent_id(), 0);

        object.set_parent(2);
        object.set_zone(6);
        object.set_ai_channel(10001);
        object.set_owner(42);

        assert_eq!(object.get_parent_id(), 2);
        assert_eq!(object.get_old_parent_id(), 1);
        assert_eq!(object.get_zone_id(), 6);
        assert_eq!(object.get_old_zone_id(), 5);
        assert_eq!(object.get_ai_channel(), 10001);
        assert_eq!(object.get_old_ai_channel(), 0);
        assert_eq!(object.get_owner_id(), 42);
        assert_eq!(object.get_old_owner_id(), 0);

        object.set_owner(0);
        assert_eq!(object.get_old_owner_id(), 42);
    }

    #[test]
    fn children_index_moves_between_zones() {
        let mut parent: StateObject = StateObject::new(1, 0, 0, 0, false);

        parent.add_child_in_zone(100, 5);
        parent.add_child_in_zone(200, 5);
        parent.add_child_in_zone(100, 5); // duplicate insert is a no-op

        assert_eq!(parent.zone_of_child(100), Some(5));
        assert_eq!(parent.zone_children(5), vec![100, 200]);

        parent.remove_child_from_zone(100, 5);
        parent.add_child_in_zone(100, 6);

        assert_eq!(parent.zone_of_child(100), Some(6));
        assert_eq!(parent.zone_children(5), vec![200]);
        assert_eq!(parent.all_children(), vec![200, 100]);
        assert_eq!(parent.children_in_zones(&[5, 6]), vec![200, 100]);

        parent.remove_child_from_zone(200, 5);
        parent.remove_child_from_zone(100, 6);
        assert!(!parent.has_children());
    }

    #[test]
    fn watch_list_add_and_remove() {
        let mut parent: StateObject = StateObject::new(1, 0, 0, 0, false);

        parent.add_watch(9000, 5);
        parent.add_watch(9000, 6);
        parent.add_watch(9000, 5); // no duplicates

        assert!(parent.has_watcher(9000));
        assert_eq!(parent.zone_watcher(5), Some(9000));
        assert_eq!(parent.zone_watcher(7), None);

        assert!(parent.remove_watch(9000, 5));
        assert_eq!(parent.zone_watcher(5), None);
        assert_eq!(parent.zone_watcher(6), Some(9000));

        assert!(parent.remove_watch(9000, 6));
        assert!(!parent.has_watcher(9000));
        assert!(!parent.remove_watch(9000, 6));
    }
}
