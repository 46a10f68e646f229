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

//! The object table, the visibility algorithm that pushes entries
//! and departures to observers as objects move between zones, and
//! the field update fan-out.

use crate::object::StateObject;
use log::debug;
use otp_core::dcfile::DCFile;
use otp_core::globals::{Channel, DoId, FieldId, Zone};
use otp_network::DatagramSink;
use std::collections::{HashMap, VecDeque};
use std::io::Result;

pub struct ObjectManager {
    objects: HashMap<DoId, StateObject>,
    /// Interest contexts awaiting a location ack, oldest first.
    ack_contexts: VecDeque<u32>,
}

impl Default for ObjectManager {
    fn default() -> Self {
        Self {
            objects: HashMap::new(),
            ack_contexts: VecDeque::new(),
        }
    }
}

impl ObjectManager {
    pub fn has_object(&self, do_id: DoId) -> bool {
        self.objects.contains_key(&do_id)
    }

    pub fn num_objects(&self) -> usize {
        self.objects.len()
    }

    pub fn add_object(&mut self, object: StateObject) {
        if self.has_object(object.get_do_id()) {
            return;
        }
        self.objects.insert(object.get_do_id(), object);
    }

    pub fn remove_object(&mut self, do_id: DoId) -> Option<StateObject> {
        self.objects.remove(&do_id)
    }

    pub fn get_object(&self, do_id: DoId) -> Option<&StateObject> {
        self.objects.get(&do_id)
    }

    pub fn get_object_mut(&mut self, do_id: DoId) -> Option<&mut StateObject> {
        self.objects.get_mut(&do_id)
    }

    /// Every object assigned to the given AI channel.
    pub fn objects_on_ai(&self, ai_channel: Channel) -> Vec<DoId> {
        let mut doomed: Vec<DoId> = self
            .objects
            .values()
            .filter(|object| object.get_ai_channel() == ai_channel)
            .map(|object| object.get_do_id())
            .collect();

        doomed.sort_unstable();
        doomed
    }

    // ---------- ack contexts ---------- //

    pub fn push_ack_context(&mut self, context: u32) {
        self.ack_contexts.push_back(context);
    }

    /// Consumes the oldest pending ack context; zero when none wait.
    pub fn pop_ack_context(&mut self) -> u32 {
        self.ack_contexts.pop_front().unwrap_or(0)
    }

    // ---------- visibility ---------- //

    /// Owner channels of the parent's children in one zone.
    fn owners_in_zone(&self, parent_do_id: DoId, zone_id: Zone) -> Vec<Channel> {
        let Some(parent) = self.get_object(parent_do_id) else {
            return vec![];
        };

        parent
            .zone_children(zone_id)
            .into_iter()
            .filter_map(|child_id| self.get_object(child_id))
            .filter(|child| child.get_owner_id() > 0)
            .map(|child| child.get_owner_id())
            .collect()
    }

    /// Applies one child's location change on one parent record and
    /// fans the resulting entry and departure events out.
    ///
    /// Entries go to every owner in the new zone and to its watcher.
    /// Departures go to every owner and watcher of the old zone,
    /// except an observer already covered by the new zone; a watcher
    /// covering both sides gets a single zone-change message instead.
    pub fn changing_location(
        &mut self,
        parent_do_id: DoId,
        child_do_id: DoId,
        new_parent_id: DoId,
        new_zone_id: Zone,
        dc: &DCFile,
        out: &DatagramSink,
    ) -> Result<()> {
        if !self.has_object(child_do_id) {
            return Ok(());
        }

        // index update on the parent record
        let (send_entry, send_departure, old_zone_id) = {
            let Some(parent) = self.get_object_mut(parent_do_id) else {
                debug!(
                    "Cannot update location of object: {}, unknown parent: {}!",
                    child_do_id, parent_do_id
                );
                return Ok(());
            };

            match parent.zone_of_child(child_do_id) {
                Some(child_zone_id) => {
                    if new_parent_id != parent_do_id {
                        parent.remove_child_from_zone(child_do_id, child_zone_id);
                        (false, true, child_zone_id)
                    } else if new_zone_id != child_zone_id {
                        parent.remove_child_from_zone(child_do_id, child_zone_id);
                        parent.add_child_in_zone(child_do_id, new_zone_id);
                        (true, true, child_zone_id)
                    } else {
                        (false, false, child_zone_id)
                    }
                }
                None => {
                    // only the new parent may adopt an unindexed child
                    if new_parent_id == parent_do_id {
                        parent.add_child_in_zone(child_do_id, new_zone_id);
                        (true, false, 0)
                    } else {
                        (false, false, 0)
                    }
                }
            }
        };

        if !send_entry && !send_departure {
            return Ok(());
        }

        let watcher_new: Option<Channel> = self
            .get_object(parent_do_id)
            .and_then(|parent| parent.zone_watcher(new_zone_id));
        let watcher_old: Option<Channel> = match send_departure {
            true => self
                .get_object(parent_do_id)
                .and_then(|parent| parent.zone_watcher(old_zone_id)),
            false => None,
        };

        let entry_owners: Vec<Channel> = match send_entry {
            true => self.owners_in_zone(parent_do_id, new_zone_id),
            false => vec![],
        };
        let departure_owners: Vec<Channel> = match send_departure {
            true => self.owners_in_zone(parent_do_id, old_zone_id),
            false => vec![],
        };

        let Some(child) = self.get_object(child_do_id) else {
            return Ok(());
        };

        if send_entry {
            for owner in &entry_owners {
                child.send_location_entry(dc, *owner, out)?;
            }
            if let Some(watcher) = watcher_new {
                // a watcher covering both sides of a move gets the
                // zone-change message below instead of an entry
                let covered_move: bool = send_departure && watcher_old == Some(watcher);

                if !covered_move {
                    child.send_location_entry(dc, watcher, out)?;
                }
            }
        }

        if send_departure && child_do_id != parent_do_id {
            for owner in &departure_owners {
                if Some(*owner) == watcher_new || Some(*owner) == watcher_old {
                    continue;
                }
                child.send_departure(*owner, out)?;
            }
            if let Some(watcher) = watcher_old {
                if watcher_new == Some(watcher) {
                    child.send_changing_location(dc, watcher, out)?;
                } else {
                    child.send_departure(watcher, out)?;
                }
            }
        }
        Ok(())
    }

    /// Runs the visibility update for a child whose location fields
    /// were just mutated: the old parent processes the removal, the
    /// new parent the insertion, and the owner is acked once.
    pub fn object_location_changed(
        &mut self,
        child_do_id: DoId,
        dc: &DCFile,
        out: &DatagramSink,
    ) -> Result<()> {
        let (old_parent_id, new_parent_id, new_zone_id, owner_id) = {
            let Some(child) = self.get_object(child_do_id) else {
                return Ok(());
            };
            (
                child.get_old_parent_id(),
                child.get_parent_id(),
                child.get_zone_id(),
                child.get_owner_id(),
            )
        };

        if old_parent_id != 0 && old_parent_id != new_parent_id {
            self.changing_location(
                old_parent_id,
                child_do_id,
                new_parent_id,
                new_zone_id,
                dc,
                out,
            )?;
        }
        if new_parent_id != 0 {
            self.changing_location(
                new_parent_id,
                child_do_id,
                new_parent_id,
                new_zone_id,
                dc,
                out,
            )?;
        }

        if owner_id != 0 {
            let context: u32 = self.pop_ack_context();

            if let Some(child) = self.get_object(child_do_id) {
                child.send_location_ack(owner_id, context, out)?;
            }
        }
        Ok(())
    }

    /// Fans a field update out to the owners of the object's
    /// siblings across all of the parent's zones. Unowned siblings
    /// are AI-managed and already hear about the update on the AI
    /// channel.
    pub fn handle_updating_field(
        &self,
        updating_do_id: DoId,
        field_id: FieldId,
        packed: &[u8],
        excludes: &[DoId],
        out: &DatagramSink,
    ) -> Result<()> {
        let Some(object) = self.get_object(updating_do_id) else {
            return Ok(());
        };

        let parent_id: DoId = object.get_parent_id();

        if parent_id == 0 {
            debug!(
                "Cannot handle updating field for object: {}, object has no parent!",
                updating_do_id
            );
            return Ok(());
        }
        let Some(parent) = self.get_object(parent_id) else {
            debug!(
                "Cannot handle updating field for object: {}, object has no parent!",
                updating_do_id
            );
            return Ok(());
        };

        if !parent.has_child(updating_do_id) {
            return Ok(());
        }

        for sibling_id in parent.all_children() {
            if excludes.contains(&sibling_id) {
                continue;
            }
            let Some(sibling) = self.get_object(sibling_id) else {
                continue;
            };
            if sibling.get_owner_id() == 0 {
                continue;
            }
            object.send_update_field(
                sibling.get_owner_id(),
                Channel::from(updating_do_id),
                field_id,
                packed,
                out,
            )?;
        }
        Ok(())
    }
}
