use std::fmt;
use std::mem::size_of;

use crate::error::{Error, Result};

/// A fixed-capacity binary buffer with a cursor and a limit.
///
/// The invariant `0 <= cursor <= limit <= capacity` holds for every valid
/// sequence of operations. Relative accessors read or write at the cursor and
/// advance it by the width of the value; absolute accessors take an explicit
/// index and leave the cursor untouched. Multi-byte values are big-endian
/// regardless of host order.
///
/// Socket reads fill `cursor..limit` and advance the cursor; socket writes
/// drain the same window. [`reset`] rewinds the cursor and widens the limit
/// back to the full capacity.
///
/// [`reset`]: Buffer::reset
#[derive(Clone)]
pub struct Buffer {
    data: Box<[u8]>,
    cursor: usize,
    limit: usize,
}

macro_rules! be_accessors {
    ($get:ident, $get_at:ident, $put:ident, $put_at:ident, $ty:ty) => {
        #[doc = concat!("Reads a big-endian `", stringify!($ty), "` at the cursor and advances it.")]
        pub fn $get(&mut self) -> Result<$ty> {
            let value = self.$get_at(self.cursor)?;
            self.cursor += size_of::<$ty>();
            Ok(value)
        }

        #[doc = concat!("Reads a big-endian `", stringify!($ty), "` at `index` without touching the cursor.")]
        pub fn $get_at(&self, index: usize) -> Result<$ty> {
            const N: usize = size_of::<$ty>();
            let end = self.read_span(index, N)?;
            let mut raw = [0; N];
            raw.copy_from_slice(&self.data[index..end]);
            Ok(<$ty>::from_be_bytes(raw))
        }

        #[doc = concat!("Writes a big-endian `", stringify!($ty), "` at the cursor and advances it.")]
        pub fn $put(&mut self, value: $ty) -> Result<()> {
            self.$put_at(self.cursor, value)?;
            self.cursor += size_of::<$ty>();
            Ok(())
        }

        #[doc = concat!("Writes a big-endian `", stringify!($ty), "` at `index` without touching the cursor.")]
        pub fn $put_at(&mut self, index: usize, value: $ty) -> Result<()> {
            const N: usize = size_of::<$ty>();
            let end = self.write_span(index, N)?;
            self.data[index..end].copy_from_slice(&value.to_be_bytes());
            Ok(())
        }
    };
}

impl Buffer {
    /// Allocates a zeroed buffer with `cursor = 0` and `limit = capacity`.
    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            data: vec![0; capacity].into_boxed_slice(),
            cursor: 0,
            limit: capacity,
        }
    }

    /// Wraps an existing byte vector; the limit covers the whole content.
    pub fn from_vec(data: Vec<u8>) -> Buffer {
        let limit = data.len();
        Buffer {
            data: data.into_boxed_slice(),
            cursor: 0,
            limit,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Moves the cursor. Fails with `BufferOverflow` past the limit.
    pub fn set_cursor(&mut self, cursor: usize) -> Result<()> {
        if cursor > self.limit {
            return Err(Error::BufferOverflow);
        }
        self.cursor = cursor;
        Ok(())
    }

    /// Moves the limit. Fails with `BufferOverflow` past the capacity; the
    /// cursor is clamped down if the new limit undercuts it.
    pub fn set_limit(&mut self, limit: usize) -> Result<()> {
        if limit > self.capacity() {
            return Err(Error::BufferOverflow);
        }
        self.limit = limit;
        self.cursor = self.cursor.min(limit);
        Ok(())
    }

    /// Bytes left between the cursor and the limit.
    pub fn remaining(&self) -> usize {
        self.limit - self.cursor
    }

    pub fn has_remaining(&self) -> bool {
        self.remaining() > 0
    }

    /// Rewinds the cursor to zero and widens the limit to the capacity.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.limit = self.capacity();
    }

    /// Copies out `0..limit`.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data[..self.limit].to_vec()
    }

    be_accessors!(get_i8, get_i8_at, put_i8, put_i8_at, i8);
    be_accessors!(get_u8, get_u8_at, put_u8, put_u8_at, u8);
    be_accessors!(get_i16, get_i16_at, put_i16, put_i16_at, i16);
    be_accessors!(get_u16, get_u16_at, put_u16, put_u16_at, u16);
    be_accessors!(get_i32, get_i32_at, put_i32, put_i32_at, i32);
    be_accessors!(get_u32, get_u32_at, put_u32, put_u32_at, u32);
    be_accessors!(get_i64, get_i64_at, put_i64, put_i64_at, i64);
    be_accessors!(get_u64, get_u64_at, put_u64, put_u64_at, u64);

    /// Fills `dst` from the cursor and advances it by `dst.len()`.
    pub fn get_bytes(&mut self, dst: &mut [u8]) -> Result<()> {
        self.get_bytes_at(self.cursor, dst)?;
        self.cursor += dst.len();
        Ok(())
    }

    /// Fills `dst` from `index` without touching the cursor.
    pub fn get_bytes_at(&self, index: usize, dst: &mut [u8]) -> Result<()> {
        let end = self.read_span(index, dst.len())?;
        dst.copy_from_slice(&self.data[index..end]);
        Ok(())
    }

    /// Copies `src` in at the cursor and advances it by `src.len()`.
    pub fn put_bytes(&mut self, src: &[u8]) -> Result<()> {
        self.put_bytes_at(self.cursor, src)?;
        self.cursor += src.len();
        Ok(())
    }

    /// Copies `src` in at `index` without touching the cursor.
    pub fn put_bytes_at(&mut self, index: usize, src: &[u8]) -> Result<()> {
        let end = self.write_span(index, src.len())?;
        self.data[index..end].copy_from_slice(src);
        Ok(())
    }

    fn read_span(&self, index: usize, len: usize) -> Result<usize> {
        index
            .checked_add(len)
            .filter(|&end| end <= self.limit)
            .ok_or(Error::BufferUnderflow)
    }

    fn write_span(&self, index: usize, len: usize) -> Result<usize> {
        index
            .checked_add(len)
            .filter(|&end| end <= self.limit)
            .ok_or(Error::BufferOverflow)
    }

    /// The unread window `cursor..limit`, drained by socket writes.
    pub(crate) fn readable_slice(&self) -> &[u8] {
        &self.data[self.cursor..self.limit]
    }

    /// The unfilled window `cursor..limit`, filled by socket reads.
    pub(crate) fn writable_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.cursor..self.limit]
    }

    /// Advances the cursor after a socket transferred `n` bytes.
    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.remaining());
        self.cursor += n;
    }

    /// Rewinds only the cursor, keeping the limit.
    pub(crate) fn rewind(&mut self) {
        self.cursor = 0;
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Buffer")
            .field("capacity", &self.capacity())
            .field("cursor", &self.cursor)
            .field("limit", &self.limit)
            .finish()
    }
}
