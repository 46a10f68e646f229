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

//! Construction of outbound network datagrams.
//!
//! Everything on the wire is little-endian; multi-byte values go
//! through the standard library's `to_le_bytes` conversions, so the
//! same code is correct on a big-endian host. A datagram must fit
//! the connection layer's 16-bit length tag, and every append checks
//! that bound before touching the buffer.

use crate::globals;
use thiserror::Error;

/// Custom error type for [`Datagram`].
#[derive(Debug, Error, PartialEq)]
pub enum DatagramError {
    #[error("datagram overflow; {0}")]
    DatagramOverflow(&'static str),
}

impl From<DatagramError> for std::io::Error {
    fn from(value: DatagramError) -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::InvalidData, value.to_string())
    }
}

/// A wire message being assembled.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Datagram {
    buffer: Vec<u8>,
}

impl Datagram {
    /// Refuses an append that would push the buffer past what the
    /// 16-bit frame length tag can describe.
    fn ensure_room(&self, length: usize) -> Result<(), DatagramError> {
        if self.buffer.len() + length > usize::from(globals::DG_SIZE_MAX) {
            return Err(DatagramError::DatagramOverflow(
                "value does not fit the 16-bit frame limit",
            ));
        }
        Ok(())
    }

    // ---------- integers and floats ---------- //

    pub fn add_u8(&mut self, v: u8) -> Result<(), DatagramError> {
        self.ensure_room(1)?;
        self.buffer.push(v);
        Ok(())
    }

    pub fn add_u16(&mut self, v: u16) -> Result<(), DatagramError> {
        self.ensure_room(2)?;
        self.buffer.extend_from_slice(&v.to_le_bytes());
        Ok(())
    }

    pub fn add_u32(&mut self, v: u32) -> Result<(), DatagramError> {
        self.ensure_room(4)?;
        self.buffer.extend_from_slice(&v.to_le_bytes());
        Ok(())
    }

    pub fn add_u64(&mut self, v: u64) -> Result<(), DatagramError> {
        self.ensure_room(8)?;
        self.buffer.extend_from_slice(&v.to_le_bytes());
        Ok(())
    }

    // two's complement shares the unsigned wire form
    #[inline(always)]
    pub fn add_i8(&mut self, v: i8) -> Result<(), DatagramError> {
        self.add_u8(v as u8)
    }

    #[inline(always)]
    pub fn add_i16(&mut self, v: i16) -> Result<(), DatagramError> {
        self.add_u16(v as u16)
    }

    #[inline(always)]
    pub fn add_i32(&mut self, v: i32) -> Result<(), DatagramError> {
        self.add_u32(v as u32)
    }

    #[inline(always)]
    pub fn add_i64(&mut self, v: i64) -> Result<(), DatagramError> {
        self.add_u64(v as u64)
    }

    /// 64-bit IEEE 754 floating point, by bit pattern.
    pub fn add_f64(&mut self, v: f64) -> Result<(), DatagramError> {
        self.ensure_room(8)?;
        self.buffer.extend_from_slice(&v.to_le_bytes());
        Ok(())
    }

    /// One byte, 0x01 for true and 0x00 for false.
    pub fn add_bool(&mut self, v: bool) -> Result<(), DatagramError> {
        self.add_u8(u8::from(v))
    }

    // ---------- sized values and raw bytes ---------- //

    /// A UTF-8 string behind a 16-bit byte-length tag.
    pub fn add_string(&mut self, v: &str) -> Result<(), DatagramError> {
        self.ensure_room(2 + v.len())?;

        if v.len() > usize::from(globals::DG_SIZE_MAX) {
            return Err(DatagramError::DatagramOverflow(
                "string is too long for its length tag",
            ));
        }
        self.add_u16(v.len() as globals::DgSizeTag)?;
        self.buffer.extend_from_slice(v.as_bytes());
        Ok(())
    }

    /// Binary data behind a 16-bit byte-length tag.
    pub fn add_blob(&mut self, v: Vec<u8>) -> Result<(), DatagramError> {
        self.ensure_room(2 + v.len())?;

        if v.len() > usize::from(globals::DG_SIZE_MAX) {
            return Err(DatagramError::DatagramOverflow(
                "blob is too long for its length tag",
            ));
        }
        self.add_u16(v.len() as globals::DgSizeTag)?;
        self.add_data(v)
    }

    /// Raw bytes, no length tag. Used for packed field data, whose
    /// layout the schema already describes.
    pub fn add_data(&mut self, mut v: Vec<u8>) -> Result<(), DatagramError> {
        self.ensure_room(v.len())?;
        self.buffer.append(&mut v);
        Ok(())
    }

    /// Splices another datagram's bytes onto this one, untagged.
    pub fn add_datagram(&mut self, dg: &Datagram) -> Result<(), DatagramError> {
        self.add_data(dg.get_data())
    }

    // ---------- cluster type aliases ---------- //

    #[inline(always)]
    pub fn add_size(&mut self, v: globals::DgSizeTag) -> Result<(), DatagramError> {
        self.add_u16(v)
    }

    #[inline(always)]
    pub fn add_channel(&mut self, v: globals::Channel) -> Result<(), DatagramError> {
        self.add_u64(v)
    }

    #[inline(always)]
    pub fn add_doid(&mut self, v: globals::DoId) -> Result<(), DatagramError> {
        self.add_u32(v)
    }

    #[inline(always)]
    pub fn add_zone(&mut self, v: globals::Zone) -> Result<(), DatagramError> {
        self.add_u32(v)
    }

    /// A `(parent, zone)` pair, the unit most location messages move.
    pub fn add_location(
        &mut self,
        parent: globals::DoId,
        zone: globals::Zone,
    ) -> Result<(), DatagramError> {
        self.add_u32(parent)?;
        self.add_u32(zone)
    }

    // ---------- message headers ---------- //

    /// Routing header of a cluster message: recipient count, the
    /// recipient channels, the sender, and the message type.
    pub fn add_server_header(
        &mut self,
        to: Vec<globals::Channel>,
        from: globals::Channel,
        msg_type: globals::MsgType,
    ) -> Result<(), DatagramError> {
        self.add_u8(to.len() as u8)?;

        for recipient in to {
            self.add_channel(recipient)?;
        }
        self.add_channel(from)?;
        self.add_u16(msg_type)?;
        Ok(())
    }

    /// Header of a control message: one recipient, the control
    /// channel sentinel, then the message type. Control messages
    /// that carry a sender put it *after* the type.
    pub fn add_control_header(&mut self, msg_type: globals::MsgType) -> Result<(), DatagramError> {
        self.add_u8(1)?;
        self.add_channel(globals::CONTROL_MESSAGE)?;
        self.add_u16(msg_type)?;
        Ok(())
    }

    // ---------- accessors ---------- //

    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    /// Returns a copy of the datagram's byte buffer.
    pub fn get_data(&self) -> Vec<u8> {
        self.buffer.clone()
    }

    /// Returns a borrow of the datagram's byte buffer.
    pub fn get_buffer(&self) -> &[u8] {
        &self.buffer
    }
}

/// Builds a [`Datagram`] from raw bytes, for example a frame the
/// connection layer read after stripping the length tag.
impl TryFrom<Vec<u8>> for Datagram {
    type Error = DatagramError;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        let mut dg: Datagram = Datagram::default();

        dg.add_data(value)?;
        Ok(dg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::globals;
    use crate::protocol::*;

    #[test]
    fn integers_encode_little_endian() {
        let mut dg: Datagram = Datagram::default();

        assert!(dg.add_u8(0xAB).is_ok());
        assert!(dg.add_u16(0x0102).is_ok());
        assert!(dg.add_u32(0x01020304).is_ok());
        assert!(dg.add_u64(0x0102030405060708).is_ok());

        #[rustfmt::skip]
        assert_eq!(dg.get_data(), vec![
            0xAB,
            0x02, 0x01,
            0x04, 0x03, 0x02, 0x01,
            0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01,
        ]);
    }

    #[test]
    fn signed_and_float_values_share_the_unsigned_wire_form() {
        let mut dg: Datagram = Datagram::default();

        assert!(dg.add_i16(-1).is_ok());
        assert!(dg.add_i32(i32::MIN).is_ok());
        assert!(dg.add_f64(1.5).is_ok());

        let mut expected: Vec<u8> = vec![0xFF, 0xFF, 0x00, 0x00, 0x00, 0x80];

        expected.extend_from_slice(&1.5_f64.to_le_bytes());
        assert_eq!(dg.get_data(), expected);
    }

    #[test]
    fn booleans_are_one_byte() {
        let mut dg: Datagram = Datagram::default();

        assert!(dg.add_bool(true).is_ok());
        assert!(dg.add_bool(false).is_ok());
        assert_eq!(dg.get_data(), vec![1, 0]);
    }

    #[test]
    fn strings_and_blobs_carry_length_tags() {
        let mut dg: Datagram = Datagram::default();

        assert!(dg.add_string("hi").is_ok());
        assert!(dg.add_blob(vec![9, 8]).is_ok());
        assert!(dg.add_data(vec![7]).is_ok()); // raw, untagged

        assert_eq!(dg.get_data(), vec![2, 0, b'h', b'i', 2, 0, 9, 8, 7]);
    }

    #[test]
    fn cluster_aliases_have_their_wire_widths() {
        let mut dg: Datagram = Datagram::default();

        assert!(dg.add_size(5).is_ok()); // 2 bytes
        assert!(dg.add_channel(4002).is_ok()); // 8 bytes
        assert!(dg.add_doid(100).is_ok()); // 4 bytes
        assert!(dg.add_zone(6).is_ok()); // 4 bytes
        assert!(dg.add_location(1, 5).is_ok()); // 4 + 4 bytes

        assert_eq!(dg.size(), 2 + 8 + 4 + 4 + 8);
    }

    #[test]
    fn server_and_control_headers() {
        let mut dg: Datagram = Datagram::default();

        assert!(dg
            .add_server_header(vec![4002], 1000, StateServerMsg::ObjectDeleteRam.into())
            .is_ok());

        let buffer: Vec<u8> = dg.get_data();

        // recipient count + channel + sender + message type
        assert_eq!(buffer.len(), 1 + 8 + 8 + 2);
        assert_eq!(buffer[0], 1); // one recipient

        let mut dg: Datagram = Datagram::default();

        assert!(dg.add_control_header(ControlMsg::SetChannel.into()).is_ok());

        let buffer: Vec<u8> = dg.get_data();

        assert_eq!(buffer.len(), 1 + 8 + 2);
        // control channel sentinel, little-endian
        assert_eq!(buffer[1..9], globals::CONTROL_MESSAGE.to_le_bytes());
    }

    #[test]
    fn appends_past_the_frame_limit_are_refused() {
        let mut dg: Datagram = Datagram::default();

        assert!(dg
            .add_data(vec![0_u8; usize::from(globals::DG_SIZE_MAX)])
            .is_ok());
        assert!(dg.add_u8(0).is_err());
        // the refused append leaves the buffer as it was
        assert_eq!(dg.size(), usize::from(globals::DG_SIZE_MAX));
    }

    #[test]
    fn datagram_from_raw_bytes() {
        let dg: Datagram = Datagram::try_from(vec![1, 2, 3]).expect("within size limits");

        assert_eq!(dg.size(), 3);
        assert_eq!(dg.get_data(), vec![1, 2, 3]);
        assert_eq!(dg.get_buffer(), &[1, 2, 3]);
    }
}
