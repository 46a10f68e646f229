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

//! Participant records and the channel subscription table.

use log::debug;
use otp_core::datagram::datagram::Datagram;
use otp_core::globals::Channel;
use otp_network::DatagramSink;
use std::collections::HashMap;
use std::net::SocketAddr;

/// A live connection on the bus: its outbound sink, the connection
/// labels it has set, and the channels it has subscribed.
pub struct Participant {
    remote: SocketAddr,
    sink: DatagramSink,
    pub connection_name: String,
    pub connection_url: String,
    pub connection_hosts: Vec<Channel>,
}

impl Participant {
    pub fn new(remote: SocketAddr, sink: DatagramSink) -> Self {
        Self {
            remote,
            sink,
            connection_name: String::new(),
            connection_url: String::new(),
            connection_hosts: vec![],
        }
    }

    pub fn get_remote(&self) -> SocketAddr {
        self.remote
    }

    /// Stages a datagram on this participant's connection writer.
    pub fn send(&self, dg: Datagram) {
        if self.sink.send(dg).is_err() {
            // The writer task already ended; the disconnect event
            // will tear this participant down shortly.
            debug!("Dropped a datagram for closed connection {}.", self.remote);
        }
    }

    pub fn add_host(&mut self, channel: Channel) {
        if !self.connection_hosts.contains(&channel) {
            self.connection_hosts.push(channel);
        }
    }

    pub fn remove_host(&mut self, channel: Channel) {
        self.connection_hosts.retain(|host| *host != channel);
    }
}

/// The participant table: which participant, by remote address,
/// has subscribed each channel. Within this cluster a channel has
/// at most one subscriber.
#[derive(Default)]
pub struct ParticipantTable {
    subscriptions: HashMap<Channel, SocketAddr>,
}

impl ParticipantTable {
    pub fn has_participant(&self, channel: Channel) -> bool {
        self.subscriptions.contains_key(&channel)
    }

    pub fn add_participant(&mut self, channel: Channel, remote: SocketAddr) {
        if self.has_participant(channel) {
            debug!(
                "Failed to add participant with channel: {}, participant already exists!",
                channel
            );
            return;
        }
        self.subscriptions.insert(channel, remote);
    }

    pub fn remove_participant(&mut self, channel: Channel) {
        if self.subscriptions.remove(&channel).is_none() {
            debug!(
                "Failed to remove participant with channel: {}, participant does not exist!",
                channel
            );
        }
    }

    pub fn get_participant(&self, channel: Channel) -> Option<SocketAddr> {
        self.subscriptions.get(&channel).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_remote(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().expect("valid address")
    }

    #[test]
    fn table_tracks_single_subscriber_per_channel() {
        let mut table: ParticipantTable = ParticipantTable::default();
        let first: SocketAddr = test_remote(5001);
        let second: SocketAddr = test_remote(5002);

        table.add_participant(1000, first);
        assert!(table.has_participant(1000));
        assert_eq!(table.get_participant(1000), Some(first));

        // a second subscriber does not displace the first
        table.add_participant(1000, second);
        assert_eq!(table.get_participant(1000), Some(first));

        table.remove_participant(1000);
        assert!(!table.has_participant(1000));

        // removing twice is harmless
        table.remove_participant(1000);
    }

    #[test]
    fn participant_tracks_hosts_without_duplicates() {
        let (sink, _staged) = mpsc::unbounded_channel();
        let mut participant: Participant = Participant::new(test_remote(5001), sink);

        participant.add_host(1000);
        participant.add_host(2000);
        participant.add_host(1000);

        assert_eq!(participant.connection_hosts, vec![1000, 2000]);

        participant.remove_host(1000);
        assert_eq!(participant.connection_hosts, vec![2000]);
    }

    #[test]
    fn send_survives_closed_connection() {
        let (sink, staged) = mpsc::unbounded_channel();
        let participant: Participant = Participant::new(test_remote(5001), sink);

        drop(staged); // connection writer gone

        participant.send(Datagram::default()); // must not panic
    }
}
