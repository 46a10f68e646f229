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

use log::info;
use std::io::Result;
use tokio::net::{TcpListener, TcpStream};

pub struct Acceptor {
    pub socket: TcpListener,
    pub address: String,
}

pub struct Connection {
    pub socket: TcpStream,
    pub address: String,
}

impl Acceptor {
    pub async fn bind(uri: &str) -> Result<Self> {
        let socket: TcpListener = TcpListener::bind(uri).await?;

        info!("Opened new TCP listening socket at {}.", uri);

        Ok(Self {
            socket,
            address: String::from(uri),
        })
    }
}

impl Connection {
    pub async fn connect(uri: &str) -> Result<Self> {
        let socket: TcpStream = TcpStream::connect(uri).await?;

        info!("Opened new TCP connection to {}.", uri);

        Ok(Self {
            socket,
            address: String::from(uri),
        })
    }
}

#[cfg(test)]
mod unit_testing {
    use super::{Acceptor, Connection};

    #[tokio::test]
    async fn async_tcp_listener() {
        let res: Result<Acceptor, _> = Acceptor::bind("127.0.0.1:0").await;

        match res {
            Ok(binding) => {
                assert_eq!(binding.address, "127.0.0.1:0");
                assert!(binding.socket.local_addr().is_ok());
            }
            Err(err) => panic!("Acceptor failed to bind: {:?}", err),
        }
    }

    #[tokio::test]
    async fn async_tcp_connection() {
        let listener: Acceptor = Acceptor::bind("127.0.0.1:0")
            .await
            .expect("Failed to set up listener for test.");

        let dst_address: String = listener
            .socket
            .local_addr()
            .expect("bound socket has an address")
            .to_string();

        tokio::spawn(async move {
            loop {
                let _ = listener.socket.accept().await;
            }
        });

        // This should make a TCP connection with the listener created above.
        let res: Result<Connection, _> = Connection::connect(&dst_address).await;

        match res {
            Ok(binding) => {
                assert_eq!(binding.address, dst_address);
            }
            Err(err) => panic!("Connection failed to establish: {:?}", err),
        }
    }
}
