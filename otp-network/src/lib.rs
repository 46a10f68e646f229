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

//! # otp-network
//! Asynchronous TCP plumbing for the otpd cluster.
//!
//! Every connection carries length-prefixed datagrams: a 16-bit
//! little-endian byte count followed by the datagram payload. A
//! [`Client`] owns the socket and splits it into one reader task,
//! which surfaces [`NetEvent`]s on the owning service's queue, and
//! one writer task, which drains datagrams staged on the client's
//! sink. The sink is the only handle a service needs to send.

pub mod tcp;

use log::debug;
use otp_core::datagram::datagram::Datagram;
use std::io::{Error, ErrorKind, Result};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Staging handle for a connection's outbound datagrams. Sends never
/// block; the connection's writer task drains them in order.
pub type DatagramSink = mpsc::UnboundedSender<Datagram>;

/// A datagram received from a remote, tagged with its address.
#[derive(Debug)]
pub struct RecvData {
    pub remote: SocketAddr,
    pub dg: Datagram,
}

/// Events surfaced by a connection's reader task.
#[derive(Debug)]
pub enum NetEvent {
    Datagram(RecvData),
    /// The remote closed the stream or the read failed; the
    /// connection is dead and its tasks have ended.
    ConnectionLost(SocketAddr),
}

/// Join handles of a connection's reader and writer tasks.
pub type RecvSendHandles = (JoinHandle<Result<()>>, JoinHandle<Result<()>>);

pub struct Client {
    socket: TcpStream,
    remote: SocketAddr,
    local: SocketAddr,
}

impl Client {
    pub fn from(socket: TcpStream) -> Result<Self> {
        Ok(Self {
            remote: socket.peer_addr()?,
            local: socket.local_addr()?,
            socket,
        })
    }

    pub fn get_remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn get_local(&self) -> SocketAddr {
        self.local
    }

    /// Consumes the client, spawning its reader and writer tasks.
    ///
    /// Returns the sink for staging outbound datagrams and the task
    /// join handles. Inbound datagrams and the eventual
    /// [`NetEvent::ConnectionLost`] arrive on `events`.
    pub fn spawn_recv_send_tasks(
        self,
        events: mpsc::Sender<NetEvent>,
    ) -> (DatagramSink, RecvSendHandles) {
        let (staged, staged_rx) = mpsc::unbounded_channel::<Datagram>();
        let (read_half, write_half) = self.socket.into_split();

        let recv_handle: JoinHandle<Result<()>> =
            tokio::spawn(recv_loop(read_half, self.remote, events));
        let send_handle: JoinHandle<Result<()>> = tokio::spawn(send_loop(write_half, staged_rx));

        (staged, (recv_handle, send_handle))
    }
}

/// Reads framed datagrams off the socket until the stream ends.
async fn recv_loop(
    mut read_half: OwnedReadHalf,
    remote: SocketAddr,
    events: mpsc::Sender<NetEvent>,
) -> Result<()> {
    loop {
        let mut size_tag: [u8; 2] = [0_u8; 2];

        if read_half.read_exact(&mut size_tag).await.is_err() {
            // Peer closed the stream. Not an I/O failure of ours;
            // surface the disconnect and end the task.
            let _ = events.send(NetEvent::ConnectionLost(remote)).await;
            return Ok(());
        }

        let length: usize = usize::from(u16::from_le_bytes(size_tag));
        let mut payload: Vec<u8> = vec![0_u8; length];

        if read_half.read_exact(&mut payload).await.is_err() {
            let _ = events.send(NetEvent::ConnectionLost(remote)).await;
            return Ok(());
        }

        let dg: Datagram = match Datagram::try_from(payload) {
            Ok(dg) => dg,
            Err(err) => {
                debug!("Dropping unframeable datagram from {}: {}", remote, err);
                continue;
            }
        };

        if events.send(NetEvent::Datagram(RecvData { remote, dg })).await.is_err() {
            // The owning service is gone; nothing left to read for.
            return Ok(());
        }
    }
}

/// Writes staged datagrams to the socket, one length-prefixed frame
/// per datagram, until the sink side is dropped.
async fn send_loop(
    mut write_half: OwnedWriteHalf,
    mut staged: mpsc::UnboundedReceiver<Datagram>,
) -> Result<()> {
    while let Some(dg) = staged.recv().await {
        let payload: &[u8] = dg.get_buffer();
        let size_tag: [u8; 2] = (payload.len() as u16).to_le_bytes();

        if write_half.write_all(&size_tag).await.is_err() {
            return Err(Error::new(ErrorKind::BrokenPipe, "peer stopped reading"));
        }
        if write_half.write_all(payload).await.is_err() {
            return Err(Error::new(ErrorKind::BrokenPipe, "peer stopped reading"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod unit_testing {
    use super::*;
    use crate::tcp::{Acceptor, Connection};

    /// Framed datagrams staged on one side come out whole on the other.
    #[tokio::test]
    async fn framed_round_trip() {
        let listener: Acceptor = Acceptor::bind("127.0.0.1:0")
            .await
            .expect("test listener binds");
        let address: String = listener
            .socket
            .local_addr()
            .expect("bound socket has an address")
            .to_string();

        let accept_task = tokio::spawn(async move {
            let (socket, _) = listener.socket.accept().await.expect("accepts");
            Client::from(socket).expect("peer addressable")
        });

        let connection: Connection =
            Connection::connect(&address).await.expect("test connection");
        let client: Client = Client::from(connection.socket).expect("peer addressable");

        let server_client: Client = accept_task.await.expect("accept task");

        let (_server_sink, server_events) = {
            let (tx, rx) = mpsc::channel::<NetEvent>(8);
            let (sink, _handles) = server_client.spawn_recv_send_tasks(tx);
            (sink, rx)
        };
        let mut server_events = server_events;

        let (client_sink, _client_handles) = {
            let (tx, _rx) = mpsc::channel::<NetEvent>(8);
            client.spawn_recv_send_tasks(tx)
        };

        let mut first: Datagram = Datagram::default();
        first.add_u16(1337).expect("fits");
        first.add_string("hello cluster").expect("fits");

        let mut second: Datagram = Datagram::default();
        second.add_channel(4002).expect("fits");

        client_sink.send(first.clone()).expect("writer alive");
        client_sink.send(second.clone()).expect("writer alive");

        match server_events.recv().await.expect("event") {
            NetEvent::Datagram(data) => assert_eq!(data.dg, first),
            other => panic!("expected a datagram, got {:?}", other),
        }
        match server_events.recv().await.expect("event") {
            NetEvent::Datagram(data) => assert_eq!(data.dg, second),
            other => panic!("expected a datagram, got {:?}", other),
        }
    }

    /// Dropping one end surfaces a ConnectionLost on the other.
    #[tokio::test]
    async fn disconnect_surfaces_event() {
        let listener: Acceptor = Acceptor::bind("127.0.0.1:0")
            .await
            .expect("test listener binds");
        let address: String = listener
            .socket
            .local_addr()
            .expect("bound socket has an address")
            .to_string();

        let accept_task = tokio::spawn(async move {
            let (socket, _) = listener.socket.accept().await.expect("accepts");
            Client::from(socket).expect("peer addressable")
        });

        let connection: Connection =
            Connection::connect(&address).await.expect("test connection");

        let server_client: Client = accept_task.await.expect("accept task");
        let expected_remote: SocketAddr = server_client.get_remote();

        let (tx, mut events) = mpsc::channel::<NetEvent>(8);
        let (_sink, _handles) = server_client.spawn_recv_send_tasks(tx);

        drop(connection); // closes the client side socket

        match events.recv().await.expect("event") {
            NetEvent::ConnectionLost(remote) => assert_eq!(remote, expected_remote),
            other => panic!("expected a disconnect, got {:?}", other),
        }
    }
}
