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

//! The message director's routing queue and post-remove store.

use log::{debug, warn};
use otp_core::datagram::datagram::Datagram;
use otp_core::globals::{Channel, MsgType};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// An in-flight routed message.
#[derive(Debug)]
pub struct MessageHandle {
    pub channel: Channel,
    pub sender: Channel,
    pub msg_type: MsgType,
    pub datagram: Datagram,
    pub enqueued: Instant,
}

/// Holds routed messages until the flush pass delivers them, plus
/// the per-channel post-remove datagrams to be played back when a
/// participant goes away.
pub struct MessageInterface {
    message_timeout: Duration,
    messages: VecDeque<MessageHandle>,
    post_messages: HashMap<Channel, VecDeque<Datagram>>,
}

impl MessageInterface {
    pub fn new(message_timeout_secs: f64) -> Self {
        Self {
            message_timeout: Duration::from_secs_f64(message_timeout_secs),
            messages: VecDeque::new(),
            post_messages: HashMap::new(),
        }
    }

    pub fn num_messages(&self) -> usize {
        self.messages.len()
    }

    pub fn append_handle(
        &mut self,
        channel: Channel,
        sender: Channel,
        msg_type: MsgType,
        datagram: Datagram,
    ) {
        if datagram.size() == 0 {
            warn!(
                "Queueing a message with an empty payload from sender {} to channel {}.",
                sender, channel
            );
        }
        self.messages.push_back(MessageHandle {
            channel,
            sender,
            msg_type,
            datagram,
            enqueued: Instant::now(),
        });
    }

    pub fn pop_handle(&mut self) -> Option<MessageHandle> {
        self.messages.pop_front()
    }

    /// Puts an undeliverable handle back at the tail; it keeps its
    /// original enqueue timestamp, so the timeout still bounds it.
    pub fn requeue_handle(&mut self, handle: MessageHandle) {
        self.messages.push_back(handle);
    }

    pub fn is_expired(&self, handle: &MessageHandle) -> bool {
        handle.enqueued.elapsed() > self.message_timeout
    }

    // ---------- post removes ---------- //

    pub fn append_post_handle(&mut self, channel: Channel, datagram: Datagram) {
        self.post_messages.entry(channel).or_default().push_back(datagram);
    }

    pub fn has_post_handles(&self, channel: Channel) -> bool {
        self.post_messages.contains_key(&channel)
    }

    /// Removes and returns every stored post-remove datagram
    /// for the channel.
    pub fn take_post_handles(&mut self, channel: Channel) -> Option<VecDeque<Datagram>> {
        self.post_messages.remove(&channel)
    }

    pub fn clear_post_handles(&mut self, channel: Channel) {
        if self.post_messages.remove(&channel).is_none() {
            debug!(
                "Failed to clear post message handles, unknown channel: {}!",
                channel
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_come_out_in_order() {
        let mut interface: MessageInterface = MessageInterface::new(15.0);

        interface.append_handle(2000, 1000, 42, Datagram::default());
        interface.append_handle(3000, 1000, 43, Datagram::default());

        assert_eq!(interface.num_messages(), 2);

        let first: MessageHandle = interface.pop_handle().expect("queued");
        assert_eq!(first.channel, 2000);

        interface.requeue_handle(first);

        let second: MessageHandle = interface.pop_handle().expect("queued");
        assert_eq!(second.channel, 3000);
    }

    #[test]
    fn expiry_follows_timeout() {
        let mut fresh: MessageInterface = MessageInterface::new(15.0);
        let mut stale: MessageInterface = MessageInterface::new(0.0);

        fresh.append_handle(2000, 1000, 42, Datagram::default());
        stale.append_handle(2000, 1000, 42, Datagram::default());

        std::thread::sleep(Duration::from_millis(5));

        let handle: MessageHandle = fresh.pop_handle().expect("queued");
        assert!(!fresh.is_expired(&handle));

        let handle: MessageHandle = stale.pop_handle().expect("queued");
        assert!(stale.is_expired(&handle));
    }

    #[test]
    fn post_handles_accumulate_per_channel() {
        let mut interface: MessageInterface = MessageInterface::new(15.0);

        interface.append_post_handle(1000, Datagram::default());
        interface.append_post_handle(1000, Datagram::default());

        assert!(interface.has_post_handles(1000));
        assert!(!interface.has_post_handles(2000));

        let stored: VecDeque<Datagram> = interface.take_post_handles(1000).expect("stored");

        assert_eq!(stored.len(), 2);
        assert!(!interface.has_post_handles(1000));
    }

    #[test]
    fn clearing_unknown_channel_is_harmless() {
        let mut interface: MessageInterface = MessageInterface::new(15.0);

        interface.clear_post_handles(9999);
        interface.append_post_handle(1000, Datagram::default());
        interface.clear_post_handles(1000);

        assert!(!interface.has_post_handles(1000));
    }
}
