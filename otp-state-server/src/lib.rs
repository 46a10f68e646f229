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

//! # otp-state-server
//! The State Server is the authority for live, non-persistent
//! distributed objects: their location, ownership, AI assignment,
//! field state, and the interest graph that pushes entries and
//! departures to observers. It dials into the message director and
//! handles every message routed at its channel or at an object's
//! channel.

mod manager;
mod object;
mod shard;

use log::{debug, error, info, trace, warn};
use manager::ObjectManager;
use object::StateObject;
use otp_core::datagram::datagram::Datagram;
use otp_core::datagram::iterator::DatagramIterator;
use otp_core::dcfile::DCFile;
use otp_core::dcpacker::extract_field_bytes;
use otp_core::globals::{
    avatar_id_from_channel, Channel, DoId, FieldId, MsgType, Zone, DATABASE_CHANNEL, DOID_MAX,
    STATESERVER_CHANNEL, UD_CHANNEL,
};
use otp_core::protocol::{ClientAgentMsg, StateServerMsg, DISCONNECT_SHARD_CLOSED};
use otp_daemon::config;
use otp_daemon::service::*;
use otp_daemon::subscriber::ClusterSubscriber;
use otp_network::tcp;
use otp_network::{Client, DatagramSink, NetEvent};
use shard::ShardManager;
use std::io::{Error, ErrorKind, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Zones at or below this id are "quiet": an AI handoff carrying one
/// does not disturb the object's visible location.
static QUIET_ZONE_MAX: Zone = 999;

/// Singleton root objects generated at boot when the schema defines
/// their classes.
static ROOT_OBJECTS: [(DoId, &str); 2] = [(20100000, "ObjectServer"), (4688, "CentralLogger")];

/// Configuration data for this service.
///
/// The service needs the database channel from the `global` section
/// of the TOML as well, so both are grouped into this struct.
pub struct CreateInfo {
    pub service_conf: config::StateServer,
    pub database_channel: Channel,
}

pub struct StateServer {
    dc: DCFile,
    channel: Channel,
    database_channel: Channel,
    out: DatagramSink,
    events: Option<mpsc::Receiver<NetEvent>>,
    objects: ObjectManager,
    shards: ShardManager,
}

impl ClusterSubscriber for StateServer {
    fn sink(&self) -> &DatagramSink {
        &self.out
    }
}

impl OtpService for StateServer {
    type Service = Self;
    type Configuration = CreateInfo;

    async fn create(
        conf: Self::Configuration,
        dc: Option<DCFile>,
    ) -> Result<Arc<Mutex<Self::Service>>> {
        let dc: DCFile = dc.ok_or_else(|| {
            Error::new(ErrorKind::InvalidInput, "State Server requires a DC file.")
        })?;

        let channel: Channel = conf.service_conf.channel.unwrap_or(STATESERVER_CHANNEL);

        let connection: tcp::Connection =
            tcp::Connection::connect(conf.service_conf.connect.as_str()).await?;
        let client: Client = Client::from(connection.socket)?;

        let (tx, rx) = mpsc::channel::<NetEvent>(64);
        let (out, _handles) = client.spawn_recv_send_tasks(tx);

        let mut ss: StateServer = StateServer::new(dc, channel, conf.database_channel, out);

        ss.events = Some(rx);
        ss.register_for_channel(ss.channel)?;
        ss.set_connection_name("StateServer")?;
        ss.create_root_objects()?;

        info!(
            "State Server online; channel: {}, schema hash: {}.",
            ss.channel,
            ss.dc.get_pretty_hash()
        );
        Ok(Arc::new(Mutex::new(ss)))
    }

    async fn start(conf: config::OtpConfig, dc: Option<DCFile>) -> Result<JoinHandle<Result<()>>> {
        // We can unwrap safely here since this function only is called if it is `Some`.
        let service_conf: config::StateServer = conf.services.state_server.unwrap();
        let create_info: CreateInfo = CreateInfo {
            service_conf,
            database_channel: conf.global.database_channel.unwrap_or(DATABASE_CHANNEL),
        };

        let service = StateServer::create(create_info, dc).await?;

        Ok(Self::spawn_async_task(async move {
            StateServer::main(service).await
        }))
    }

    async fn main(service: Arc<Mutex<Self::Service>>) -> Result<()> {
        let mut events: mpsc::Receiver<NetEvent> = {
            let mut ss = service.lock().await;

            match ss.events.take() {
                Some(events) => events,
                None => {
                    error!("State Server started without a connection event queue.");
                    return Err(Error::new(ErrorKind::NotConnected, "no event queue"));
                }
            }
        };

        while let Some(event) = events.recv().await {
            match event {
                NetEvent::Datagram(data) => {
                    let mut ss = service.lock().await;

                    if let Err(err) = ss.handle_datagram(data.dg) {
                        warn!("Failed to handle received datagram: {}", err);
                    }
                }
                NetEvent::ConnectionLost(_) => {
                    error!("Lost the connection to the message director.");
                    return Err(Error::new(ErrorKind::ConnectionReset, "md connection lost"));
                }
            }
        }
        Ok(())
    }
}

impl StateServer {
    fn new(dc: DCFile, channel: Channel, database_channel: Channel, out: DatagramSink) -> Self {
        Self {
            dc,
            channel,
            database_channel,
            out,
            events: None,
            objects: ObjectManager::default(),
            shards: ShardManager::default(),
        }
    }

    /// Generates the singleton root objects named by the schema.
    fn create_root_objects(&mut self) -> Result<()> {
        for (do_id, class_name) in ROOT_OBJECTS {
            let Some(dclass) = self.dc.class_by_name(class_name) else {
                debug!("No class definition for {}.", class_name);
                continue;
            };
            let root: StateObject = StateObject::new(do_id, 0, 0, dclass.get_dclass_id(), false);

            self.register_for_channel(Channel::from(do_id))?;
            self.objects.add_object(root);
        }
        Ok(())
    }

    /// Entry point for every datagram routed to this service.
    fn handle_datagram(&mut self, dg: Datagram) -> Result<()> {
        let mut dgi: DatagramIterator = DatagramIterator::from(dg);

        let _recipients: u8 = dgi.read_recipient_count()?;
        let channel: Channel = dgi.read_channel()?;
        let sender: Channel = dgi.read_channel()?;
        let msg_type: MsgType = dgi.read_msg_type()?;

        trace!(
            "Handling datagram on channel {} from {} with message type {}.",
            channel,
            sender,
            msg_type
        );

        match StateServerMsg::from_repr(msg_type) {
            Some(StateServerMsg::ObjectGenerateWithRequired) => {
                self.handle_generate(sender, false, &mut dgi)
            }
            Some(StateServerMsg::ObjectGenerateWithRequiredOther) => {
                self.handle_generate(sender, true, &mut dgi)
            }
            Some(StateServerMsg::ObjectUpdateField) => {
                self.handle_object_update_field(sender, &mut dgi)
            }
            Some(StateServerMsg::ObjectDeleteRam) => self.handle_delete_object(&mut dgi),
            Some(StateServerMsg::AddShard) => self.handle_add_shard(sender, &mut dgi),
            Some(StateServerMsg::RemoveShard) => self.handle_remove_shard(sender),
            Some(StateServerMsg::BounceMessage) => {
                debug!("Bounced a message from {}.", sender);
                Ok(())
            }
            _ => self.handle_object_datagram(channel, sender, msg_type, &mut dgi),
        }
    }

    /// Dispatches a message addressed at an object's own channel.
    fn handle_object_datagram(
        &mut self,
        channel: Channel,
        sender: Channel,
        msg_type: MsgType,
        dgi: &mut DatagramIterator,
    ) -> Result<()> {
        if channel > Channel::from(DOID_MAX) {
            debug!(
                "Received message type {} on non-object channel {}.",
                msg_type, channel
            );
            return Ok(());
        }
        let do_id: DoId = channel as DoId;

        if !self.objects.has_object(do_id) {
            debug!(
                "Received an unknown message type: {} from channel: {}!",
                msg_type, sender
            );
            return Ok(());
        }

        match StateServerMsg::from_repr(msg_type) {
            Some(StateServerMsg::ObjectSetOwnerRecv) => self.handle_set_owner(do_id, dgi),
            Some(StateServerMsg::ObjectSetAi) => self.handle_set_ai(do_id, dgi),
            Some(StateServerMsg::ObjectSetZone) => self.handle_set_zone(do_id, dgi),
            Some(StateServerMsg::ObjectSetLocation) => self.handle_set_location(do_id, dgi),
            Some(StateServerMsg::ObjectChangingLocation) => {
                self.handle_changing_location(do_id, dgi)
            }
            Some(StateServerMsg::ObjectGetZonesObjects) => {
                self.handle_get_zones_objects(do_id, dgi)
            }
            Some(StateServerMsg::ObjectGetZonesObjects2) => {
                self.handle_get_zones_objects_2(do_id, sender, dgi)
            }
            Some(StateServerMsg::ObjectClearWatch) => self.handle_clear_watch(do_id, sender, dgi),
            _ => {
                warn!(
                    "Received unknown message type: {} for object {}!",
                    msg_type, do_id
                );
                Ok(())
            }
        }
    }

    // ---------- object lifecycle ---------- //

    fn handle_generate(
        &mut self,
        sender: Channel,
        has_other: bool,
        dgi: &mut DatagramIterator,
    ) -> Result<()> {
        let do_id: DoId = dgi.read_doid()?;
        let parent_id: DoId = dgi.read_doid()?;
        let zone_id: Zone = dgi.read_zone()?;
        let dclass_id: u16 = dgi.read_u16()?;

        if self.objects.has_object(do_id) {
            info!(
                "Failed to generate an already existing object with do_id: {}!",
                do_id
            );
            return Ok(());
        }

        let Some(dclass) = self.dc.class_by_number(dclass_id) else {
            warn!(
                "Failed to generate an object with do_id: {}, no dclass found for dc_id: {}!",
                do_id, dclass_id
            );
            return Ok(());
        };
        let dclass_name: String = dclass.get_name().to_owned();
        let inherited: Vec<FieldId> = dclass.get_inherited_fields().to_vec();

        let mut object: StateObject = StateObject::new(do_id, parent_id, zone_id, dclass_id, has_other);

        // required fields ride in inherited order
        for field_id in inherited {
            let Some(field) = self.dc.field_by_id(field_id) else {
                continue;
            };
            if !field.is_required() {
                continue;
            }
            match extract_field_bytes(&self.dc, field, dgi) {
                Ok(packed) => object.set_required_field(field_id, packed),
                Err(err) => {
                    warn!(
                        "Failed to unpack required field: {} dclass: {}; {}",
                        field_id, dclass_name, err
                    );
                    return Ok(());
                }
            }
        }

        if has_other {
            let count: u16 = dgi.read_u16()?;

            for _ in 0..count {
                let field_id: FieldId = dgi.read_u16()?;

                let known: bool = self
                    .dc
                    .class_by_number(dclass_id)
                    .map(|dclass| dclass.has_field(field_id))
                    .unwrap_or(false);

                if !known {
                    warn!(
                        "Failed to unpack other field: {} dclass: {}, unknown field!",
                        field_id, dclass_name
                    );
                    return Ok(());
                }
                let Some(field) = self.dc.field_by_id(field_id) else {
                    return Ok(());
                };

                let packed: Vec<u8> = match extract_field_bytes(&self.dc, field, dgi) {
                    Ok(packed) => packed,
                    Err(err) => {
                        warn!(
                            "Failed to unpack other field: {} dclass: {}; {}",
                            field_id, dclass_name, err
                        );
                        return Ok(());
                    }
                };

                // only ram fields are retained between generates
                if field.is_ram() {
                    object.set_other_field(field_id, packed);
                }
            }
        }

        // a generate from the uberdog binds the object to it
        if sender == UD_CHANNEL {
            object.set_ai_channel(sender);
        }

        // subscribe the object's channel so updates targeting it route here
        self.register_for_channel(Channel::from(do_id))?;
        self.objects.add_object(object);
        self.objects.object_location_changed(do_id, &self.dc, &self.out)
    }

    fn handle_delete_object(&mut self, dgi: &mut DatagramIterator) -> Result<()> {
        let do_id: DoId = dgi.read_doid()?;

        if !self.objects.has_object(do_id) {
            debug!("Failed to delete object: {}, object does not exist!", do_id);
            return Ok(());
        }
        self.delete_object(do_id)
    }

    /// Destroys an object: its AI and its old location's observers
    /// see a departure, the parent's index forgets it, and its
    /// channel subscription is released.
    fn delete_object(&mut self, do_id: DoId) -> Result<()> {
        {
            let Some(object) = self.objects.get_object_mut(do_id) else {
                return Ok(());
            };

            let ai_channel: Channel = object.get_ai_channel();

            object.set_owner(0);
            object.set_parent(0);
            object.set_zone(0);

            if ai_channel != 0 {
                object.send_departure(ai_channel, &self.out)?;
            }
        }

        // the vacated location fans departures out to its observers
        self.objects.object_location_changed(do_id, &self.dc, &self.out)?;

        self.objects.remove_object(do_id);
        self.unregister_for_channel(Channel::from(do_id))?;
        Ok(())
    }

    // ---------- field updates ---------- //

    fn handle_object_update_field(
        &mut self,
        sender: Channel,
        dgi: &mut DatagramIterator,
    ) -> Result<()> {
        let do_id: DoId = dgi.read_doid()?;

        if dgi.get_remaining() == 0 {
            warn!(
                "Cannot handle a field update for object: {}, truncated datagram!",
                do_id
            );
            return Ok(());
        }

        let Some(object) = self.objects.get_object(do_id) else {
            debug!(
                "Cannot handle a field update for object: {}, unknown object!",
                do_id
            );
            return Ok(());
        };

        let owner_id: Channel = object.get_owner_id();
        let ai_channel: Channel = object.get_ai_channel();
        let dclass_id: u16 = object.get_dclass_id();

        let field_id: FieldId = dgi.read_u16()?;

        let Some(dclass) = self.dc.class_by_number(dclass_id) else {
            return Ok(());
        };

        if !dclass.has_field(field_id) {
            warn!(
                "Failed to update field: {} dclass: {}, unknown field!",
                field_id,
                dclass.get_name()
            );
            return Ok(());
        }
        let Some(field) = self.dc.field_by_id(field_id) else {
            return Ok(());
        };

        let packed: Vec<u8> = match extract_field_bytes(&self.dc, field, dgi) {
            Ok(packed) => packed,
            // client misbehavior must not crash the server
            Err(_) => return Ok(()),
        };

        let is_broadcast: bool = field.is_broadcast();
        let is_ram: bool = field.is_ram();
        let is_required: bool = field.is_required();
        let is_db: bool = field.is_db();

        let authoritative: bool = self.shards.has_shard(sender) || sender == UD_CHANNEL;

        if authoritative {
            let Some(object) = self.objects.get_object(do_id) else {
                return Ok(());
            };

            if owner_id != 0 {
                object.send_update_field(owner_id, ai_channel, field_id, &packed, &self.out)?;
            }
            if ai_channel != 0 && ai_channel != sender {
                object.send_update_field(ai_channel, sender, field_id, &packed, &self.out)?;
            }
            if is_broadcast {
                self.objects
                    .handle_updating_field(do_id, field_id, &packed, &[do_id], &self.out)?;
            }
        } else {
            let avatar_id: DoId = avatar_id_from_channel(sender);

            if avatar_id == 0 {
                warn!(
                    "Cannot handle field update for field: {} dclass: {}, unknown avatar!",
                    field.get_name(),
                    dclass.get_name()
                );
                return Ok(());
            }

            // An ownsend field may only come from the object's owner;
            // a clsend field from any client; anything else is not
            // sendable by a client at all.
            if field.is_ownsend() {
                if sender != owner_id {
                    warn!(
                        "Cannot handle field update for field: {} dclass: {}, field not sendable!",
                        field.get_name(),
                        dclass.get_name()
                    );
                    return Ok(());
                }
            } else if !field.is_clsend() {
                warn!(
                    "Cannot handle field update for field: {} dclass: {}, field not sendable!",
                    field.get_name(),
                    dclass.get_name()
                );
                return Ok(());
            }

            let Some(object) = self.objects.get_object(do_id) else {
                return Ok(());
            };

            // the AI always hears about accepted client updates
            if ai_channel != 0 {
                object.send_update_field(ai_channel, sender, field_id, &packed, &self.out)?;
            }
            if is_broadcast {
                self.objects.handle_updating_field(
                    do_id,
                    field_id,
                    &packed,
                    &[avatar_id],
                    &self.out,
                )?;
            }
        }

        if packed.is_empty() {
            return Ok(());
        }

        if is_ram {
            if let Some(object) = self.objects.get_object_mut(do_id) {
                if is_required {
                    object.set_required_field(field_id, packed.clone());
                } else {
                    object.set_other_field(field_id, packed.clone());
                    object.promote_has_other();
                }
            }
        }
        if is_db {
            if let Some(object) = self.objects.get_object(do_id) {
                object.send_save_field(self.database_channel, field_id, &packed, &self.out)?;
            }
        }
        Ok(())
    }

    // ---------- ownership, AI, location ---------- //

    fn handle_set_owner(&mut self, do_id: DoId, dgi: &mut DatagramIterator) -> Result<()> {
        let new_owner_id: Channel = dgi.read_channel()?;

        let (owner_id, old_owner_id) = {
            let Some(object) = self.objects.get_object_mut(do_id) else {
                return Ok(());
            };

            if new_owner_id == object.get_owner_id() {
                return Ok(());
            }
            object.set_owner(new_owner_id);
            (object.get_owner_id(), object.get_old_owner_id())
        };

        let Some(object) = self.objects.get_object(do_id) else {
            return Ok(());
        };

        if owner_id != 0 {
            object.send_owner_entry(&self.dc, owner_id, &self.out)?;
        }
        if old_owner_id != 0 {
            object.send_changing_owner(old_owner_id, old_owner_id, owner_id, &self.out)?;
        }
        Ok(())
    }

    fn handle_set_ai(&mut self, do_id: DoId, dgi: &mut DatagramIterator) -> Result<()> {
        let new_ai_channel: Channel = dgi.read_channel()?;

        let Some(shard) = self.shards.get_shard(new_ai_channel) else {
            warn!(
                "Failed to set new AI: {} for object {}, no AI was found with that channel!",
                new_ai_channel, do_id
            );
            return Ok(());
        };
        let district_id: DoId = shard.district_id;

        if dgi.get_remaining() > 0 {
            let context: u32 = dgi.read_u32()?;

            self.objects.push_ack_context(context);

            let zone_id: Zone = dgi.read_zone()?;

            if zone_id > QUIET_ZONE_MAX {
                let old_ai: Channel = {
                    let Some(object) = self.objects.get_object_mut(do_id) else {
                        return Ok(());
                    };
                    object.set_zone(zone_id);
                    object.get_ai_channel()
                };

                // the current AI learns the object moved away
                if old_ai != 0 {
                    if let Some(object) = self.objects.get_object(do_id) {
                        object.send_changing_location(&self.dc, old_ai, &self.out)?;
                    }
                }
            }
        }

        let changed: Option<Channel> = {
            let Some(object) = self.objects.get_object_mut(do_id) else {
                return Ok(());
            };

            if new_ai_channel != object.get_ai_channel() {
                object.set_ai_channel(new_ai_channel);

                // an owned object follows its shard's district
                if object.get_owner_id() != 0 {
                    object.set_parent(district_id);
                }
                Some(object.get_old_ai_channel())
            } else {
                None
            }
        };

        if let Some(old_ai_channel) = changed {
            let Some(object) = self.objects.get_object(do_id) else {
                return Ok(());
            };

            object.send_ai_entry(&self.dc, new_ai_channel, &self.out)?;

            if old_ai_channel != 0 {
                object.send_changing_ai(old_ai_channel, &self.out)?;
            }
        }

        self.objects.object_location_changed(do_id, &self.dc, &self.out)
    }

    fn handle_set_zone(&mut self, do_id: DoId, dgi: &mut DatagramIterator) -> Result<()> {
        let new_parent_id: DoId = dgi.read_doid()?;
        let new_zone_id: Zone = dgi.read_zone()?;

        let ai_channel: Channel = {
            let Some(object) = self.objects.get_object_mut(do_id) else {
                return Ok(());
            };
            object.set_parent(new_parent_id);
            object.set_zone(new_zone_id);
            object.get_ai_channel()
        };

        if ai_channel != 0 {
            if let Some(object) = self.objects.get_object(do_id) {
                object.send_changing_location(&self.dc, ai_channel, &self.out)?;
            }
        }
        self.objects.object_location_changed(do_id, &self.dc, &self.out)
    }

    fn handle_set_location(&mut self, do_id: DoId, dgi: &mut DatagramIterator) -> Result<()> {
        let new_parent_id: DoId = dgi.read_doid()?;
        let new_zone_id: Zone = dgi.read_zone()?;

        let parent_id: DoId = {
            let Some(object) = self.objects.get_object_mut(do_id) else {
                return Ok(());
            };

            if new_parent_id == object.get_parent_id() && new_zone_id == object.get_zone_id() {
                return Ok(());
            }
            object.set_parent(new_parent_id);
            object.set_zone(new_zone_id);
            object.get_parent_id()
        };

        if parent_id != 0 {
            if let Some(object) = self.objects.get_object(do_id) {
                object.send_changing_location(&self.dc, Channel::from(parent_id), &self.out)?;
            }
        }
        self.objects.object_location_changed(do_id, &self.dc, &self.out)
    }

    /// A peer (usually an AI) tells a parent one of its children
    /// moved; the parent's index and observers catch up.
    fn handle_changing_location(
        &mut self,
        parent_do_id: DoId,
        dgi: &mut DatagramIterator,
    ) -> Result<()> {
        let child_do_id: DoId = dgi.read_doid()?;
        let new_parent_id: DoId = dgi.read_doid()?;
        let new_zone_id: Zone = dgi.read_zone()?;

        self.objects.changing_location(
            parent_do_id,
            child_do_id,
            new_parent_id,
            new_zone_id,
            &self.dc,
            &self.out,
        )?;

        // acknowledge the child's finished move to its owner
        let owner_id: Channel = self
            .objects
            .get_object(child_do_id)
            .map(|child| child.get_owner_id())
            .unwrap_or(0);

        if owner_id != 0 {
            let context: u32 = self.objects.pop_ack_context();

            if let Some(child) = self.objects.get_object(child_do_id) {
                child.send_location_ack(owner_id, context, &self.out)?;
            }
        }
        Ok(())
    }

    // ---------- interest ---------- //

    fn handle_get_zones_objects(&mut self, do_id: DoId, dgi: &mut DatagramIterator) -> Result<()> {
        let count: u16 = dgi.read_u16()?;
        let mut zone_ids: Vec<Zone> = Vec::with_capacity(usize::from(count));

        for _ in 0..count {
            zone_ids.push(dgi.read_zone()?);
        }

        let (owner_id, parent_id) = {
            let Some(object) = self.objects.get_object(do_id) else {
                return Ok(());
            };
            (object.get_owner_id(), object.get_parent_id())
        };

        if owner_id == 0 {
            warn!(
                "Cannot get zone objects for object: {}, object does not have an owner!",
                do_id
            );
            return Ok(());
        }

        let Some(parent) = self.objects.get_object(parent_id) else {
            warn!(
                "Cannot get zone objects for object: {}, object has no parent!",
                do_id
            );
            return Ok(());
        };

        // the requester already holds its own object
        let candidates: Vec<DoId> = parent
            .children_in_zones(&zone_ids)
            .into_iter()
            .filter(|id| *id != do_id && self.objects.has_object(*id))
            .collect();

        // the observer learns how many generates complete the change
        let mut dg: Datagram = Datagram::default();

        dg.add_server_header(
            vec![owner_id],
            Channel::from(do_id),
            StateServerMsg::ObjectGetZonesObjectsResp.into(),
        )?;
        dg.add_u64(Channel::from(do_id))?;
        dg.add_u16(candidates.len() as u16)?;

        for candidate in &candidates {
            dg.add_u64(Channel::from(*candidate))?;
        }
        let _ = self.out.send(dg);

        for candidate in &candidates {
            if let Some(object) = self.objects.get_object(*candidate) {
                object.send_location_entry(&self.dc, owner_id, &self.out)?;
            }
        }

        // future moves into these zones are pushed to the observer
        if let Some(object) = self.objects.get_object_mut(do_id) {
            for zone_id in zone_ids {
                object.add_watch(owner_id, zone_id);
            }
        }
        Ok(())
    }

    fn handle_get_zones_objects_2(
        &mut self,
        do_id: DoId,
        sender: Channel,
        dgi: &mut DatagramIterator,
    ) -> Result<()> {
        let context: u32 = dgi.read_u32()?;
        let count: u16 = dgi.read_u16()?;
        let mut zone_ids: Vec<Zone> = Vec::with_capacity(usize::from(count));

        for _ in 0..count {
            zone_ids.push(dgi.read_zone()?);
        }

        let (owner_id, parent_id, mut candidates) = {
            let Some(object) = self.objects.get_object(do_id) else {
                return Ok(());
            };
            (
                object.get_owner_id(),
                object.get_parent_id(),
                object.children_in_zones(&zone_ids),
            )
        };

        // peers under the same parent join the candidate set
        if let Some(parent) = self.objects.get_object(parent_id) {
            for peer in parent.children_in_zones(&zone_ids) {
                if peer != do_id && peer != parent_id && !candidates.contains(&peer) {
                    candidates.push(peer);
                }
            }
        }
        candidates.retain(|id| self.objects.has_object(*id));

        let reply_to: Channel = match owner_id {
            0 => sender,
            owner_id => owner_id,
        };

        let mut dg: Datagram = Datagram::default();

        dg.add_server_header(
            vec![reply_to],
            Channel::from(do_id),
            StateServerMsg::ObjectGetZonesObjects2Resp.into(),
        )?;
        dg.add_u32(context)?;
        dg.add_u16(candidates.len() as u16)?;

        for candidate in &candidates {
            dg.add_u64(Channel::from(*candidate))?;
        }
        let _ = self.out.send(dg);

        for candidate in &candidates {
            if let Some(object) = self.objects.get_object(*candidate) {
                object.send_location_entry(&self.dc, sender, &self.out)?;
            }
        }

        if let Some(object) = self.objects.get_object_mut(do_id) {
            for zone_id in zone_ids {
                object.add_watch(sender, zone_id);
            }
        }
        Ok(())
    }

    fn handle_clear_watch(
        &mut self,
        do_id: DoId,
        sender: Channel,
        dgi: &mut DatagramIterator,
    ) -> Result<()> {
        let zone_id: Zone = dgi.read_zone()?;

        let Some(object) = self.objects.get_object_mut(do_id) else {
            return Ok(());
        };

        if !object.remove_watch(sender, zone_id) {
            warn!(
                "Sender {} tried to clear watch zone but has no watch list!",
                sender
            );
        }
        Ok(())
    }

    // ---------- shards ---------- //

    fn handle_add_shard(&mut self, sender: Channel, dgi: &mut DatagramIterator) -> Result<()> {
        let district_id: DoId = dgi.read_doid()?;
        let name: String = dgi.read_string()?;

        info!(
            "AI {} registered district {} ({}).",
            sender, district_id, name
        );
        self.shards.add_shard(sender, district_id, name);
        Ok(())
    }

    /// An AI went away: its shard record dies, and every object it
    /// ran is torn down. Owners are told their shard closed.
    fn handle_remove_shard(&mut self, sender: Channel) -> Result<()> {
        let Some(shard) = self.shards.remove_shard(sender) else {
            warn!(
                "Failed to remove shard with channel: {}, shard does not exist!",
                sender
            );
            return Ok(());
        };

        info!("Terminating shard {} ({}).", shard.name, shard.channel);

        for do_id in self.objects.objects_on_ai(shard.channel) {
            let owner_id: Channel = self
                .objects
                .get_object(do_id)
                .map(|object| object.get_owner_id())
                .unwrap_or(0);

            if owner_id != 0 {
                self.send_shard_closed(owner_id, &shard.name)?;
            }
            self.delete_object(do_id)?;
        }
        Ok(())
    }

    fn send_shard_closed(&self, owner_id: Channel, shard_name: &str) -> Result<()> {
        let mut dg: Datagram = Datagram::default();

        dg.add_server_header(vec![owner_id], self.channel, ClientAgentMsg::Disconnect.into())?;
        dg.add_u16(DISCONNECT_SHARD_CLOSED)?;
        dg.add_string(&format!("Shard {} has been terminated!", shard_name))?;

        let _ = self.out.send(dg);
        Ok(())
    }
}
