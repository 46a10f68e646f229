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

//! Reading values back out of received datagrams.
//!
//! [`DatagramIterator`] is a cursor over one datagram. Every read
//! checks the remaining length first, so a truncated or hostile
//! datagram surfaces as an error the handler can drop, never as a
//! slice panic. Multi-byte reads decode through the standard
//! library's `from_le_bytes` conversions.

use super::datagram::{Datagram, DatagramError};
use crate::globals::*;
use std::string::FromUtf8Error;
use thiserror::Error;

/// Custom error type for [`DatagramIterator`].
#[derive(Debug, Error, PartialEq)]
pub enum IteratorError {
    /// This error kind is returned when attempting
    /// to read past the end of a datagram.
    #[error("end of file")]
    EndOfFile,
    #[error("could not convert bytes to UTF-8")]
    Utf8Error(FromUtf8Error),
    #[error("datagram error")]
    DatagramError(DatagramError),
}

impl From<IteratorError> for std::io::Error {
    fn from(value: IteratorError) -> std::io::Error {
        std::io::Error::new(
            match &value {
                IteratorError::EndOfFile => std::io::ErrorKind::UnexpectedEof,
                _ => std::io::ErrorKind::InvalidData,
            },
            value.to_string(),
        )
    }
}

/// Cursor over one received datagram.
#[derive(Debug)]
pub struct DatagramIterator {
    datagram: Datagram,
    index: usize,
}

impl From<Datagram> for DatagramIterator {
    fn from(value: Datagram) -> Self {
        Self {
            datagram: value,
            index: 0,
        }
    }
}

impl DatagramIterator {
    /// Fails with [`IteratorError::EndOfFile`] unless `bytes` more
    /// bytes can be read from the cursor.
    pub fn ensure_readable(&self, bytes: usize) -> Result<(), IteratorError> {
        if self.index + bytes > self.datagram.size() {
            return Err(IteratorError::EndOfFile);
        }
        Ok(())
    }

    /// Copies the next `N` bytes out as a fixed array, advancing
    /// the cursor. The integer readers decode from this.
    fn read_bytes<const N: usize>(&mut self) -> Result<[u8; N], IteratorError> {
        self.ensure_readable(N)?;

        let mut raw: [u8; N] = [0_u8; N];

        raw.copy_from_slice(&self.datagram.get_buffer()[self.index..self.index + N]);
        self.index += N;
        Ok(raw)
    }

    // ---------- cursor position ---------- //

    /// Current cursor offset, in bytes from the datagram's start.
    #[inline]
    pub fn tell(&self) -> usize {
        self.index
    }

    /// Moves the cursor to an absolute offset.
    #[inline]
    pub fn seek(&mut self, index: usize) {
        self.index = index
    }

    /// Advances the cursor without decoding anything.
    pub fn skip(&mut self, bytes: usize) -> Result<(), IteratorError> {
        self.ensure_readable(bytes)?;
        self.index += bytes;
        Ok(())
    }

    /// Number of unread bytes left under the cursor.
    pub fn get_remaining(&self) -> usize {
        self.datagram.size() - self.index
    }

    // ---------- raw bytes ---------- //

    pub fn read_data(&mut self, bytes: usize) -> Result<Vec<u8>, IteratorError> {
        self.ensure_readable(bytes)?;

        let data: Vec<u8> =
            self.datagram.get_buffer()[self.index..self.index + bytes].to_vec();

        self.index += bytes;
        Ok(data)
    }

    /// Reads every remaining byte of the datagram.
    pub fn read_remaining(&mut self) -> Vec<u8> {
        let remaining: usize = self.get_remaining();

        // cannot EOF; remaining is bounded by the buffer itself
        self.read_data(remaining).unwrap_or_default()
    }

    // ---------- integers and floats ---------- //

    pub fn read_u8(&mut self) -> Result<u8, IteratorError> {
        Ok(self.read_bytes::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, IteratorError> {
        Ok(u16::from_le_bytes(self.read_bytes()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, IteratorError> {
        Ok(u32::from_le_bytes(self.read_bytes()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, IteratorError> {
        Ok(u64::from_le_bytes(self.read_bytes()?))
    }

    // signed readers share the unsigned wire form
    #[inline]
    pub fn read_i8(&mut self) -> Result<i8, IteratorError> {
        self.read_u8().map(|v| v as i8)
    }

    #[inline]
    pub fn read_i16(&mut self) -> Result<i16, IteratorError> {
        self.read_u16().map(|v| v as i16)
    }

    #[inline]
    pub fn read_i32(&mut self) -> Result<i32, IteratorError> {
        self.read_u32().map(|v| v as i32)
    }

    #[inline]
    pub fn read_i64(&mut self) -> Result<i64, IteratorError> {
        self.read_u64().map(|v| v as i64)
    }

    /// 64-bit IEEE 754 floating point, by bit pattern.
    #[inline]
    pub fn read_f64(&mut self) -> Result<f64, IteratorError> {
        Ok(f64::from_le_bytes(self.read_bytes()?))
    }

    #[inline]
    pub fn read_bool(&mut self) -> Result<bool, IteratorError> {
        Ok(self.read_u8()? == 1)
    }

    // ---------- sized values ---------- //

    /// A UTF-8 string behind its 16-bit byte-length tag.
    pub fn read_string(&mut self) -> Result<String, IteratorError> {
        let length: DgSizeTag = self.read_size()?;
        let raw: Vec<u8> = self.read_data(usize::from(length))?;

        String::from_utf8(raw).map_err(IteratorError::Utf8Error)
    }

    /// A blob behind its 16-bit byte-length tag, as a [`Datagram`].
    pub fn read_datagram(&mut self) -> Result<Datagram, IteratorError> {
        let length: DgSizeTag = self.read_size()?;
        let raw: Vec<u8> = self.read_data(usize::from(length))?;

        Datagram::try_from(raw).map_err(IteratorError::DatagramError)
    }

    // ---------- cluster type aliases ---------- //

    #[inline]
    pub fn read_size(&mut self) -> Result<DgSizeTag, IteratorError> {
        self.read_u16()
    }

    #[inline]
    pub fn read_channel(&mut self) -> Result<Channel, IteratorError> {
        self.read_u64()
    }

    #[inline]
    pub fn read_doid(&mut self) -> Result<DoId, IteratorError> {
        self.read_u32()
    }

    #[inline]
    pub fn read_zone(&mut self) -> Result<Zone, IteratorError> {
        self.read_u32()
    }

    /// The recipient count leading a routed message's header.
    #[inline(always)]
    pub fn read_recipient_count(&mut self) -> Result<u8, IteratorError> {
        self.read_u8()
    }

    /// The raw message type; the caller decides which role's
    /// enumeration the value belongs to.
    #[inline(always)]
    pub fn read_msg_type(&mut self) -> Result<MsgType, IteratorError> {
        self.read_u16()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_round_trip_through_a_datagram() -> Result<(), IteratorError> {
        let mut dg: Datagram = Datagram::default();

        assert!(dg.add_u8(7).is_ok());
        assert!(dg.add_u16(1000).is_ok());
        assert!(dg.add_u32(70_000).is_ok());
        assert!(dg.add_u64(u64::MAX).is_ok());
        assert!(dg.add_i16(-12).is_ok());
        assert!(dg.add_i64(i64::MIN).is_ok());
        assert!(dg.add_f64(-2.25).is_ok());
        assert!(dg.add_bool(true).is_ok());

        let mut dgi: DatagramIterator = dg.into();

        assert_eq!(dgi.read_u8()?, 7);
        assert_eq!(dgi.read_u16()?, 1000);
        assert_eq!(dgi.read_u32()?, 70_000);
        assert_eq!(dgi.read_u64()?, u64::MAX);
        assert_eq!(dgi.read_i16()?, -12);
        assert_eq!(dgi.read_i64()?, i64::MIN);
        assert_eq!(dgi.read_f64()?, -2.25);
        assert!(dgi.read_bool()?);
        assert_eq!(dgi.get_remaining(), 0);
        Ok(())
    }

    #[test]
    fn cluster_aliases_round_trip() -> Result<(), IteratorError> {
        let mut dg: Datagram = Datagram::default();

        assert!(dg.add_channel(4002).is_ok());
        assert!(dg.add_location(1000, 42).is_ok());
        assert!(dg.add_string("alice").is_ok());

        let mut dgi: DatagramIterator = dg.into();

        assert_eq!(dgi.read_channel()?, 4002_u64);
        assert_eq!(dgi.read_doid()?, 1000_u32);
        assert_eq!(dgi.read_zone()?, 42_u32);
        assert_eq!(dgi.read_string()?, "alice");
        Ok(())
    }

    #[test]
    fn cursor_moves_with_tell_seek_and_skip() -> Result<(), IteratorError> {
        let mut dg: Datagram = Datagram::default();

        assert!(dg.add_u16(1).is_ok());
        assert!(dg.add_u16(2).is_ok());

        let mut dgi: DatagramIterator = dg.into();

        assert_eq!(dgi.tell(), 0);
        dgi.skip(2)?;
        assert_eq!(dgi.tell(), 2);
        assert_eq!(dgi.read_u16()?, 2);

        dgi.seek(0);
        assert_eq!(dgi.read_u16()?, 1);
        Ok(())
    }

    #[test]
    fn reads_past_the_end_error_cleanly() {
        let mut dg: Datagram = Datagram::default();

        assert!(dg.add_u8(5).is_ok());

        let mut dgi: DatagramIterator = dg.into();

        assert_eq!(dgi.read_u8(), Ok(5));
        assert_eq!(dgi.read_u8(), Err(IteratorError::EndOfFile));
        assert_eq!(dgi.read_u64(), Err(IteratorError::EndOfFile));
        assert_eq!(dgi.skip(1), Err(IteratorError::EndOfFile));
    }

    #[test]
    fn read_remaining_takes_whatever_is_left() -> Result<(), IteratorError> {
        let mut dg: Datagram = Datagram::default();

        assert!(dg.add_u16(9).is_ok());
        assert!(dg.add_data(vec![1, 2, 3]).is_ok());

        let mut dgi: DatagramIterator = dg.into();

        dgi.read_u16()?;
        assert_eq!(dgi.read_remaining(), vec![1, 2, 3]);
        assert_eq!(dgi.read_remaining(), Vec::<u8>::new());
        Ok(())
    }

    #[test]
    fn embedded_datagrams_read_back_whole() -> Result<(), IteratorError> {
        let mut inner: Datagram = Datagram::default();
        assert!(inner.add_u16(1337).is_ok());

        let mut dg: Datagram = Datagram::default();
        assert!(dg.add_blob(inner.get_data()).is_ok());

        let mut dgi: DatagramIterator = dg.into();

        assert_eq!(dgi.read_datagram()?, inner);
        Ok(())
    }

    #[test]
    fn invalid_utf8_is_an_error_not_a_panic() {
        let mut dg: Datagram = Datagram::default();

        assert!(dg.add_blob(vec![0xFF, 0xFE]).is_ok()); // not UTF-8

        let mut dgi: DatagramIterator = dg.into();

        assert!(matches!(
            dgi.read_string(),
            Err(IteratorError::Utf8Error(_))
        ));
    }
}
