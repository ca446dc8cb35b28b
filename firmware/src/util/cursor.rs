//! Unbounded 32-bit stream cursors.
//!
//! Cursors only ever move forward and are allowed to wrap the `u32` range. Two
//! cursors are ordered by the sign of their wrapping difference, which is
//! correct as long as they are less than 2^31 bytes apart.

use core::{
    fmt,
    ops::{Add, AddAssign, Sub, SubAssign},
};

use crate::config::SECTOR_SIZE;

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Cursor(u32);

impl Cursor {
    pub const ZERO: Self = Self(0);

    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Signed distance from `earlier` to `self`.
    pub const fn distance_from(self, earlier: Cursor) -> i32 {
        self.0.wrapping_sub(earlier.0) as i32
    }

    pub const fn is_before(self, other: Cursor) -> bool {
        self.distance_from(other) < 0
    }

    pub const fn is_at_or_after(self, other: Cursor) -> bool {
        !self.is_before(other)
    }

    /// Number of bytes from `earlier` up to `self`. The caller must know that
    /// `earlier` is not after `self`.
    #[track_caller]
    pub fn bytes_since(self, earlier: Cursor) -> u32 {
        let distance = self.distance_from(earlier);
        debug_assert!(distance >= 0, "{earlier:?} is after {self:?}");
        distance as u32
    }

    pub const fn min(self, other: Cursor) -> Cursor {
        if self.is_before(other) { self } else { other }
    }

    pub const fn max(self, other: Cursor) -> Cursor {
        if self.is_before(other) { other } else { self }
    }

    /// Rounds down to the start of the enclosing sector.
    pub const fn sector_start(self) -> Cursor {
        Self(self.0 & !(SECTOR_SIZE as u32 - 1))
    }

    /// Offset of this cursor within its sector.
    pub const fn sector_offset(self) -> u32 {
        self.0 & (SECTOR_SIZE as u32 - 1)
    }

    /// Moves back by `n` bytes without passing the origin of the stream.
    pub const fn saturating_sub(self, n: u32) -> Cursor {
        Self(self.0.saturating_sub(n))
    }

    /// Position of this cursor within a ring of `ring_len` bytes.
    pub const fn ring_index(self, ring_len: u32) -> u32 {
        self.0 % ring_len
    }
}

impl Add<u32> for Cursor {
    type Output = Cursor;

    fn add(self, rhs: u32) -> Cursor {
        Self(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u32> for Cursor {
    fn add_assign(&mut self, rhs: u32) {
        *self = *self + rhs;
    }
}

impl Sub<u32> for Cursor {
    type Output = Cursor;

    fn sub(self, rhs: u32) -> Cursor {
        Self(self.0.wrapping_sub(rhs))
    }
}

impl SubAssign<u32> for Cursor {
    fn sub_assign(&mut self, rhs: u32) {
        *self = *self - rhs;
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cursor({:#x})", self.0)
    }
}
