//! Owned, immutable packet buffers.
//!
//! A [PktBuf] holds the raw bytes of a single IPv4 datagram, starting at the IP
//! header. Header structures are read out of the buffer with bounds-checked
//! typed accessors rather than copied up front.

use crate::protocols::packet::PacketHeader;

use std::slice;

use anyhow::{bail, Result};
use thiserror::Error;

/// An owned packet buffer containing one network-layer datagram.
#[derive(Debug, Clone, Default)]
pub struct PktBuf {
    data: Vec<u8>,
}

impl PktBuf {
    /// Wraps `data` (an IPv4 datagram, starting at the IP header) in a buffer.
    pub fn new(data: Vec<u8>) -> Self {
        PktBuf { data }
    }

    /// Returns the number of bytes in the buffer.
    #[inline]
    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    /// Returns the contents of the buffer as a byte slice.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns a byte slice of length `count` starting at `offset`. Errors if
    /// the requested range extends past the end of the buffer.
    pub fn get_data_slice(&self, offset: usize, count: usize) -> Result<&[u8]> {
        if offset < self.data_len() {
            if offset + count <= self.data_len() {
                let ptr = self.data[offset..].as_ptr();
                unsafe { Ok(slice::from_raw_parts(ptr, count) as &[u8]) }
            } else {
                bail!(PktBufError::ReadPastBuffer)
            }
        } else {
            bail!(PktBufError::BadOffset)
        }
    }

    /// Reads the data at `offset` as `T` and returns it as a raw pointer.
    /// Errors if `offset` is greater than or equal to the buffer length or the
    /// size of `T` exceeds the size of the data stored at `offset`.
    pub(crate) fn get_data<T: PacketHeader>(&self, offset: usize) -> Result<*const T> {
        if offset < self.data_len() {
            if offset + T::size_of() <= self.data_len() {
                Ok(self.data[offset..].as_ptr() as *const T)
            } else {
                bail!(PktBufError::ReadPastBuffer)
            }
        } else {
            bail!(PktBufError::BadOffset)
        }
    }
}

#[derive(Error, Debug)]
pub(crate) enum PktBufError {
    #[error("Data read beyond buffer bounds")]
    ReadPastBuffer,

    #[error("Invalid buffer offset")]
    BadOffset,
}
