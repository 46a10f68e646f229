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

use otp_core::datagram::datagram::{Datagram, DatagramError};
use otp_core::globals::Channel;
use otp_core::protocol::ControlMsg;
use otp_network::DatagramSink;

/// The [`ClusterSubscriber`] trait is implemented by services that
/// dial into a message director and interact with the rest of the
/// cluster through it.
///
/// It is called a subscriber, as it is indirectly a subscriber to
/// the cluster via its message director's channel table.
pub trait ClusterSubscriber {
    /// The staging sink of this service's connection to its MD.
    fn sink(&self) -> &DatagramSink;

    /// Sends a `CONTROL_SET_CHANNEL`, registering the given channel
    /// with the message director.
    fn register_for_channel(&self, channel: Channel) -> Result<(), DatagramError> {
        let mut dg: Datagram = Datagram::default();

        dg.add_control_header(ControlMsg::SetChannel.into())?;
        dg.add_channel(channel)?;

        let _ = self.sink().send(dg);
        Ok(())
    }

    /// Sends a `CONTROL_REMOVE_CHANNEL`, releasing the given channel
    /// from the message director.
    fn unregister_for_channel(&self, channel: Channel) -> Result<(), DatagramError> {
        let mut dg: Datagram = Datagram::default();

        dg.add_control_header(ControlMsg::RemoveChannel.into())?;
        dg.add_channel(channel)?;

        let _ = self.sink().send(dg);
        Ok(())
    }

    /// Stores a datagram with the message director to be played back
    /// into the bus when this service's connection goes away.
    fn add_post_remove(&self, channel: Channel, post: &Datagram) -> Result<(), DatagramError> {
        let mut dg: Datagram = Datagram::default();

        dg.add_control_header(ControlMsg::AddPostRemove.into())?;
        dg.add_channel(channel)?;
        dg.add_datagram(post)?;

        let _ = self.sink().send(dg);
        Ok(())
    }

    /// Discards every post-remove datagram stored for the channel.
    fn clear_post_removes(&self, channel: Channel) -> Result<(), DatagramError> {
        let mut dg: Datagram = Datagram::default();

        dg.add_control_header(ControlMsg::ClearPostRemove.into())?;
        dg.add_channel(channel)?;

        let _ = self.sink().send(dg);
        Ok(())
    }

    /// Sends a `CONTROL_SET_CON_NAME` to label this connection.
    fn set_connection_name(&self, name: &str) -> Result<(), DatagramError> {
        let mut dg: Datagram = Datagram::default();

        dg.add_control_header(ControlMsg::SetConName.into())?;
        dg.add_string(name)?;

        let _ = self.sink().send(dg);
        Ok(())
    }

    /// Sends a `CONTROL_SET_CON_URL` to label this connection.
    fn set_connection_url(&self, url: &str) -> Result<(), DatagramError> {
        let mut dg: Datagram = Datagram::default();

        dg.add_control_header(ControlMsg::SetConUrl.into())?;
        dg.add_string(url)?;

        let _ = self.sink().send(dg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otp_core::datagram::iterator::DatagramIterator;
    use otp_core::globals::CONTROL_MESSAGE;
    use tokio::sync::mpsc;

    struct TestSubscriber {
        sink: DatagramSink,
    }

    impl ClusterSubscriber for TestSubscriber {
        fn sink(&self) -> &DatagramSink {
            &self.sink
        }
    }

    #[test]
    fn register_builds_control_datagram() {
        let (sink, mut staged) = mpsc::unbounded_channel();
        let subscriber: TestSubscriber = TestSubscriber { sink };

        subscriber.register_for_channel(4002).expect("builds");

        let dg: Datagram = staged.try_recv().expect("staged");
        let mut dgi: DatagramIterator = dg.into();

        assert_eq!(dgi.read_recipient_count().unwrap(), 1);
        assert_eq!(dgi.read_channel().unwrap(), CONTROL_MESSAGE);
        assert_eq!(dgi.read_msg_type().unwrap(), ControlMsg::SetChannel.into());
        assert_eq!(dgi.read_channel().unwrap(), 4002);
        assert_eq!(dgi.get_remaining(), 0);
    }

    #[test]
    fn post_remove_embeds_payload_datagram() {
        let (sink, mut staged) = mpsc::unbounded_channel();
        let subscriber: TestSubscriber = TestSubscriber { sink };

        let mut post: Datagram = Datagram::default();
        post.add_u16(7).expect("fits");

        subscriber.add_post_remove(1000, &post).expect("builds");

        let dg: Datagram = staged.try_recv().expect("staged");
        let mut dgi: DatagramIterator = dg.into();

        dgi.read_recipient_count().unwrap();
        dgi.read_channel().unwrap();
        assert_eq!(
            dgi.read_msg_type().unwrap(),
            ControlMsg::AddPostRemove.into()
        );
        assert_eq!(dgi.read_channel().unwrap(), 1000);
        // stored datagram rides as the remaining raw bytes
        assert_eq!(dgi.read_remaining(), post.get_data());
    }
}
