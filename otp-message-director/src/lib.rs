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

//! # otp-message-director
//! The Message Director routes typed messages between participants
//! keyed by 64-bit channels. Participants subscribe channels through
//! control messages; routed messages wait in a queue that gives a
//! momentarily-rebinding sender a bounded grace period; post-remove
//! datagrams are played back into the bus when their participant
//! disconnects.

mod participant;
mod queue;

use log::{debug, error, info, trace, warn};
use otp_core::datagram::datagram::Datagram;
use otp_core::datagram::iterator::DatagramIterator;
use otp_core::globals::{Channel, MsgType, CONTROL_MESSAGE};
use otp_core::protocol::ControlMsg;
use otp_daemon::config;
use otp_daemon::service::*;
use otp_network::tcp;
use otp_network::{Client, DatagramSink, NetEvent, RecvData};
use participant::{Participant, ParticipantTable};
use queue::MessageInterface;
use std::collections::HashMap;
use std::io::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Seconds an undeliverable message waits for its sender to rebind
/// when the configuration does not say otherwise.
pub static DEFAULT_MESSAGE_TIMEOUT: f64 = 15.0;

/// Milliseconds between flush passes over the routing queue.
static FLUSH_INTERVAL_MS: u64 = 50;

pub struct MessageDirector {
    binding: Option<tcp::Acceptor>,
    participants: ParticipantTable,
    connections: HashMap<SocketAddr, Participant>,
    message_interface: MessageInterface,
}

impl OtpService for MessageDirector {
    type Service = Self;
    type Configuration = config::MessageDirector;

    async fn create(
        conf: Self::Configuration,
        _: Option<otp_core::dcfile::DCFile>,
    ) -> Result<Arc<Mutex<Self::Service>>> {
        let timeout: f64 = conf.message_timeout.unwrap_or(DEFAULT_MESSAGE_TIMEOUT);
        let mut md: MessageDirector = MessageDirector::new(timeout);

        md.binding = Some(tcp::Acceptor::bind(conf.bind.as_str()).await?);
        Ok(Arc::new(Mutex::new(md)))
    }

    async fn start(
        conf: config::OtpConfig,
        _: Option<otp_core::dcfile::DCFile>,
    ) -> Result<JoinHandle<Result<()>>> {
        // We can unwrap safely here since this function only is called if it is `Some`.
        let service_conf: config::MessageDirector = conf.services.message_director.unwrap();
        let service = MessageDirector::create(service_conf, None).await?;

        Ok(Self::spawn_async_task(async move {
            MessageDirector::main(service).await
        }))
    }

    async fn main(service: Arc<Mutex<Self::Service>>) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<NetEvent>(64);

        // dispatch task: every inbound datagram and disconnect runs
        // through here, so all routing state mutates on one task.
        let dispatch_service = service.clone();
        let _dispatch: JoinHandle<()> = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let mut md = dispatch_service.lock().await;

                match event {
                    NetEvent::Datagram(data) => {
                        trace!("Processing datagram from {} ...", data.remote);

                        if let Err(err) = md.handle_datagram(&data) {
                            warn!("Failed to handle received datagram: {}", err);
                        }
                    }
                    NetEvent::ConnectionLost(remote) => md.handle_disconnect(remote),
                }
            }
        });

        // flush task: periodically walks the routing queue.
        let flush_service = service.clone();
        let _flush: JoinHandle<()> = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(FLUSH_INTERVAL_MS));

            loop {
                ticker.tick().await;
                flush_service.lock().await.flush_queue();
            }
        });

        let acceptor: tcp::Acceptor = {
            let mut md = service.lock().await;

            match md.binding.take() {
                Some(acceptor) => acceptor,
                None => {
                    error!("Message Director started without a bound listener.");
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::NotConnected,
                        "no listening socket",
                    ));
                }
            }
        };

        // main loop: accept participants
        loop {
            match acceptor.socket.accept().await {
                Ok((socket, address)) => {
                    info!("Received incoming connection from {}.", address);

                    let client: Client = match Client::from(socket) {
                        Ok(client) => client,
                        Err(err) => {
                            info!("Failed to accept participant {}: {}", address, err);
                            continue;
                        }
                    };
                    let remote: SocketAddr = client.get_remote();
                    let (sink, _handles) = client.spawn_recv_send_tasks(tx.clone());

                    service.lock().await.add_connection(remote, sink);
                }
                Err(socket_err) => error!("Failed to get client: {}", socket_err),
            }
        }
    }
}

impl MessageDirector {
    fn new(message_timeout_secs: f64) -> Self {
        Self {
            binding: None,
            participants: ParticipantTable::default(),
            connections: HashMap::new(),
            message_interface: MessageInterface::new(message_timeout_secs),
        }
    }

    /// Registers a freshly accepted connection as a participant.
    fn add_connection(&mut self, remote: SocketAddr, sink: DatagramSink) {
        self.connections.insert(remote, Participant::new(remote, sink));
    }

    /// Entry point for all datagrams received from participants.
    fn handle_datagram(&mut self, data: &RecvData) -> Result<()> {
        let mut dgi: DatagramIterator = DatagramIterator::from(data.dg.clone());

        let recipient_count: u8 = dgi.read_recipient_count()?;
        let mut recipients: Vec<Channel> = Vec::with_capacity(usize::from(recipient_count));

        for _ in 0..recipient_count {
            recipients.push(dgi.read_channel()?);
        }

        let first_channel: Channel = match recipients.first() {
            Some(channel) => *channel,
            None => {
                warn!("Dropping a datagram with no recipients from {}.", data.remote);
                return Ok(());
            }
        };

        if recipient_count == 1 && first_channel == CONTROL_MESSAGE {
            return self.handle_control_message(data.remote, &mut dgi);
        }

        let sender: Channel = dgi.read_channel()?;
        let msg_type: MsgType = dgi.read_msg_type()?;
        let payload: Datagram = Datagram::try_from(dgi.read_remaining())?;

        // point-to-point: the first channel in the header is the route
        self.message_interface
            .append_handle(first_channel, sender, msg_type, payload);
        Ok(())
    }

    /// Handles a datagram addressed to the control channel.
    fn handle_control_message(
        &mut self,
        remote: SocketAddr,
        dgi: &mut DatagramIterator,
    ) -> Result<()> {
        let raw_type: MsgType = dgi.read_msg_type()?;

        let msg_type: ControlMsg = match ControlMsg::from_repr(raw_type) {
            Some(msg_type) => msg_type,
            None => {
                warn!(
                    "Failed to handle unknown datagram with message type: {}!",
                    raw_type
                );
                return Ok(());
            }
        };

        // These two DON'T include the sender, so they are handled
        // before the sender field is read.
        match msg_type {
            ControlMsg::SetConName => {
                let name: String = dgi.read_string()?;

                if let Some(participant) = self.connections.get_mut(&remote) {
                    participant.connection_name = name;
                }
                return Ok(());
            }
            ControlMsg::SetConUrl => {
                let url: String = dgi.read_string()?;

                if let Some(participant) = self.connections.get_mut(&remote) {
                    participant.connection_url = url;
                }
                return Ok(());
            }
            _ => {}
        }

        let sender: Channel = dgi.read_channel()?;

        match msg_type {
            ControlMsg::SetChannel => {
                match self.connections.get_mut(&remote) {
                    Some(participant) => {
                        participant.add_host(sender);
                    }
                    None => {
                        warn!("Subscription from unknown connection {}.", remote);
                        return Ok(());
                    }
                }
                self.participants.add_participant(sender, remote);
            }
            ControlMsg::RemoveChannel => {
                self.flush_post_removes(sender);
                self.participants.remove_participant(sender);

                if let Some(participant) = self.connections.get_mut(&remote) {
                    participant.remove_host(sender);
                }
            }
            ControlMsg::AddRange | ControlMsg::RemoveRange => {
                // Interval subscriptions are reserved within this
                // cluster; accepted so peers never error out.
                debug!("Ignoring reserved range subscription from {}.", remote);
            }
            ControlMsg::AddPostRemove => {
                let stored: Datagram = Datagram::try_from(dgi.read_remaining())?;

                trace!("Participant {} added a post remove.", remote);
                self.message_interface.append_post_handle(sender, stored);
            }
            ControlMsg::ClearPostRemove => {
                self.message_interface.clear_post_handles(sender);
            }
            ControlMsg::SetConName | ControlMsg::SetConUrl => unreachable!(),
        }
        Ok(())
    }

    /// Plays back every post-remove datagram stored for the channel,
    /// dispatching each as if its participant had sent it now, then
    /// discards them.
    fn flush_post_removes(&mut self, channel: Channel) {
        if !self.message_interface.has_post_handles(channel) {
            debug!(
                "Failed to flush post message handles, unknown channel: {}!",
                channel
            );
            return;
        }

        let remote: SocketAddr = match self.participants.get_participant(channel) {
            Some(remote) => remote,
            None => {
                debug!(
                    "Failed to flush post message handles, unknown participant with channel: {}!",
                    channel
                );
                return;
            }
        };

        let stored = match self.message_interface.take_post_handles(channel) {
            Some(stored) => stored,
            None => return,
        };

        for dg in stored {
            let data: RecvData = RecvData { remote, dg };

            if let Err(err) = self.handle_datagram(&data) {
                warn!("Failed to play back a post remove datagram: {}", err);
            }
        }

        // Drain the queue while the participant's subscriptions still
        // stand, so recipients see the played-back messages (and any
        // earlier traffic) before the subscriptions are released.
        self.flush_queue();
    }

    /// Tears a disconnected participant down. Its post-remove queues
    /// are played back before each subscription is released.
    fn handle_disconnect(&mut self, remote: SocketAddr) {
        let hosts: Vec<Channel> = match self.connections.get(&remote) {
            Some(participant) => participant.connection_hosts.clone(),
            None => return,
        };

        for host in hosts {
            self.flush_post_removes(host);
            self.participants.remove_participant(host);
        }
        self.connections.remove(&remote);
        info!("Participant {} disconnected.", remote);
    }

    /// One pass over the routing queue. Each queued handle is either
    /// delivered to the participant subscribed to its channel,
    /// re-queued while its sender (or target) may still rebind
    /// within the timeout window, or dropped once it expires.
    fn flush_queue(&mut self) {
        for _ in 0..self.message_interface.num_messages() {
            let handle = match self.message_interface.pop_handle() {
                Some(handle) => handle,
                None => break,
            };

            // A message whose sender is momentarily gone is usually
            // the race of a participant rebinding; give it a bounded
            // grace period instead of dropping it outright.
            if !self.participants.has_participant(handle.sender) {
                if self.message_interface.is_expired(&handle) {
                    debug!(
                        "Dropping expired message from sender {} to channel {}.",
                        handle.sender, handle.channel
                    );
                    continue;
                }
                self.message_interface.requeue_handle(handle);
                continue;
            }

            let target: Option<SocketAddr> = self
                .participants
                .get_participant(handle.channel)
                .filter(|remote| self.connections.contains_key(remote));

            match target {
                Some(remote) => {
                    let mut dg: Datagram = Datagram::default();

                    let built = dg
                        .add_server_header(vec![handle.channel], handle.sender, handle.msg_type)
                        .and_then(|_| dg.add_datagram(&handle.datagram));

                    if built.is_err() {
                        warn!(
                            "Failed to rebuild a routed datagram for channel {}.",
                            handle.channel
                        );
                        continue;
                    }
                    trace!(
                        "Routing message {} from {} to {}.",
                        handle.msg_type,
                        handle.sender,
                        handle.channel
                    );
                    if let Some(participant) = self.connections.get(&remote) {
                        participant.send(dg);
                    }
                }
                None => {
                    // Nothing subscribed to the target channel yet; a
                    // late binder gets the same grace period senders do.
                    if self.message_interface.is_expired(&handle) {
                        debug!(
                            "Dropping expired message for unsubscribed channel {}.",
                            handle.channel
                        );
                        continue;
                    }
                    self.message_interface.requeue_handle(handle);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otp_core::datagram::iterator::DatagramIterator;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn test_remote(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().expect("valid address")
    }

    /// Creates a director with a connected fake participant,
    /// returning the receiver side of its outbound sink.
    fn connect(md: &mut MessageDirector, port: u16) -> (SocketAddr, UnboundedReceiver<Datagram>) {
        let remote: SocketAddr = test_remote(port);
        let (sink, staged) = mpsc::unbounded_channel();

        md.add_connection(remote, sink);
        (remote, staged)
    }

    fn control_datagram(msg_type: ControlMsg, sender: Channel) -> Datagram {
        let mut dg: Datagram = Datagram::default();

        dg.add_control_header(msg_type.into()).expect("fits");
        dg.add_channel(sender).expect("fits");
        dg
    }

    fn routed_datagram(channel: Channel, sender: Channel, msg_type: MsgType, payload: &str) -> Datagram {
        let mut dg: Datagram = Datagram::default();

        dg.add_server_header(vec![channel], sender, msg_type).expect("fits");
        dg.add_string(payload).expect("fits");
        dg
    }

    fn dispatch(md: &mut MessageDirector, remote: SocketAddr, dg: Datagram) {
        md.handle_datagram(&RecvData { remote, dg }).expect("handled");
    }

    #[test]
    fn subscribe_then_unsubscribe_restores_table() {
        let mut md: MessageDirector = MessageDirector::new(15.0);
        let (remote, _staged) = connect(&mut md, 5001);

        dispatch(&mut md, remote, control_datagram(ControlMsg::SetChannel, 1000));
        assert!(md.participants.has_participant(1000));

        dispatch(&mut md, remote, control_datagram(ControlMsg::RemoveChannel, 1000));
        assert!(!md.participants.has_participant(1000));
        assert!(md
            .connections
            .get(&remote)
            .expect("still connected")
            .connection_hosts
            .is_empty());
    }

    #[test]
    fn routes_by_first_channel() {
        let mut md: MessageDirector = MessageDirector::new(15.0);
        let (remote_a, _staged_a) = connect(&mut md, 5001);
        let (remote_b, mut staged_b) = connect(&mut md, 5002);

        dispatch(&mut md, remote_a, control_datagram(ControlMsg::SetChannel, 1000));
        dispatch(&mut md, remote_b, control_datagram(ControlMsg::SetChannel, 2000));

        dispatch(&mut md, remote_a, routed_datagram(2000, 1000, 42, "x"));
        md.flush_queue();

        let delivered: Datagram = staged_b.try_recv().expect("routed to B");
        let mut dgi: DatagramIterator = delivered.into();

        assert_eq!(dgi.read_recipient_count().unwrap(), 1);
        assert_eq!(dgi.read_channel().unwrap(), 2000);
        assert_eq!(dgi.read_channel().unwrap(), 1000);
        assert_eq!(dgi.read_msg_type().unwrap(), 42);
        assert_eq!(dgi.read_string().unwrap(), "x");
        assert_eq!(dgi.get_remaining(), 0);
    }

    #[test]
    fn messages_are_not_echoed_to_sender() {
        let mut md: MessageDirector = MessageDirector::new(15.0);
        let (remote_a, mut staged_a) = connect(&mut md, 5001);
        let (remote_b, mut staged_b) = connect(&mut md, 5002);

        dispatch(&mut md, remote_a, control_datagram(ControlMsg::SetChannel, 1000));
        dispatch(&mut md, remote_b, control_datagram(ControlMsg::SetChannel, 2000));

        dispatch(&mut md, remote_a, routed_datagram(2000, 1000, 42, "x"));
        md.flush_queue();

        assert!(staged_b.try_recv().is_ok());
        assert!(staged_a.try_recv().is_err());
    }

    #[test]
    fn sender_rebind_within_window_still_delivers() {
        let mut md: MessageDirector = MessageDirector::new(15.0);
        let (remote_a, _staged_a) = connect(&mut md, 5001);
        let (remote_b, mut staged_b) = connect(&mut md, 5002);

        // A sends before anyone has subscribed anything.
        dispatch(&mut md, remote_a, routed_datagram(2000, 1000, 42, "x"));
        md.flush_queue();
        assert!(staged_b.try_recv().is_err());

        // Sender and target bind within the timeout window.
        dispatch(&mut md, remote_a, control_datagram(ControlMsg::SetChannel, 1000));
        dispatch(&mut md, remote_b, control_datagram(ControlMsg::SetChannel, 2000));
        md.flush_queue();

        assert!(staged_b.try_recv().is_ok());
    }

    #[test]
    fn stale_messages_are_dropped() {
        let mut md: MessageDirector = MessageDirector::new(0.0);
        let (remote_a, _staged_a) = connect(&mut md, 5001);

        dispatch(&mut md, remote_a, routed_datagram(2000, 1000, 42, "x"));

        std::thread::sleep(Duration::from_millis(5));
        md.flush_queue();

        assert_eq!(md.message_interface.num_messages(), 0);
    }

    #[test]
    fn post_remove_plays_back_on_disconnect() {
        let mut md: MessageDirector = MessageDirector::new(15.0);
        let (remote_a, _staged_a) = connect(&mut md, 5001);
        let (remote_b, mut staged_b) = connect(&mut md, 5002);

        dispatch(&mut md, remote_a, control_datagram(ControlMsg::SetChannel, 1000));
        dispatch(&mut md, remote_b, control_datagram(ControlMsg::SetChannel, 2000));

        // A stores a farewell routed at channel 2000.
        let mut add_post: Datagram = control_datagram(ControlMsg::AddPostRemove, 1000);
        add_post
            .add_datagram(&routed_datagram(2000, 1000, 7, "bye"))
            .expect("fits");
        dispatch(&mut md, remote_a, add_post);

        md.handle_disconnect(remote_a);
        md.flush_queue();

        let delivered: Datagram = staged_b.try_recv().expect("farewell delivered");
        let mut dgi: DatagramIterator = delivered.into();

        dgi.read_recipient_count().unwrap();
        assert_eq!(dgi.read_channel().unwrap(), 2000);
        assert_eq!(dgi.read_channel().unwrap(), 1000);
        assert_eq!(dgi.read_msg_type().unwrap(), 7);
        assert_eq!(dgi.read_string().unwrap(), "bye");

        // and A's subscriptions are gone afterward
        assert!(!md.participants.has_participant(1000));
    }

    #[test]
    fn cleared_post_removes_are_not_played_back() {
        let mut md: MessageDirector = MessageDirector::new(15.0);
        let (remote_a, _staged_a) = connect(&mut md, 5001);
        let (remote_b, mut staged_b) = connect(&mut md, 5002);

        dispatch(&mut md, remote_a, control_datagram(ControlMsg::SetChannel, 1000));
        dispatch(&mut md, remote_b, control_datagram(ControlMsg::SetChannel, 2000));

        let mut add_post: Datagram = control_datagram(ControlMsg::AddPostRemove, 1000);
        add_post
            .add_datagram(&routed_datagram(2000, 1000, 7, "bye"))
            .expect("fits");
        dispatch(&mut md, remote_a, add_post);
        dispatch(&mut md, remote_a, control_datagram(ControlMsg::ClearPostRemove, 1000));

        md.handle_disconnect(remote_a);
        md.flush_queue();

        assert!(staged_b.try_recv().is_err());
    }

    #[test]
    fn connection_labels_are_recorded() {
        let mut md: MessageDirector = MessageDirector::new(15.0);
        let (remote, _staged) = connect(&mut md, 5001);

        let mut dg: Datagram = Datagram::default();
        dg.add_control_header(ControlMsg::SetConName.into()).expect("fits");
        dg.add_string("StateServer").expect("fits");
        dispatch(&mut md, remote, dg);

        let mut dg: Datagram = Datagram::default();
        dg.add_control_header(ControlMsg::SetConUrl.into()).expect("fits");
        dg.add_string("otp://ss").expect("fits");
        dispatch(&mut md, remote, dg);

        let participant: &Participant = md.connections.get(&remote).expect("connected");

        assert_eq!(participant.connection_name, "StateServer");
        assert_eq!(participant.connection_url, "otp://ss");
    }

    #[test]
    fn reserved_ranges_and_unknown_controls_are_tolerated() {
        let mut md: MessageDirector = MessageDirector::new(15.0);
        let (remote, _staged) = connect(&mut md, 5001);

        let mut add_range: Datagram = Datagram::default();
        add_range.add_control_header(ControlMsg::AddRange.into()).expect("fits");
        add_range.add_channel(1000).expect("fits");
        add_range.add_channel(2000).expect("fits");
        dispatch(&mut md, remote, add_range);

        // an unknown control message type is logged and dropped
        let mut unknown: Datagram = Datagram::default();
        unknown.add_control_header(9999).expect("fits");
        dispatch(&mut md, remote, unknown);

        assert!(!md.participants.has_participant(1000));
    }
}
