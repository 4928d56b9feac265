//! Machine addresses.
//!
//! An [`Address`] is an opaque machine-word value handed to us by the
//! loader and front end. The core never interprets the bits beyond total
//! ordering and constant-offset arithmetic; all addresses within one
//! procedure share a width.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// An address in the decoded binary.
///
/// Stored as a 64-bit word regardless of the source machine's pointer
/// size. [`Address::INVALID`] is the distinguished sentinel used for
/// "no destination" (e.g. a computed branch with no fixed target).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(u64);

static_assertions::assert_eq_size!(Address, u64);

impl Address {
    pub const ZERO: Address = Address(0);

    /// Sentinel for "not a valid address".
    pub const INVALID: Address = Address(u64::MAX);

    pub const fn new(value: u64) -> Self {
        Address(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != u64::MAX
    }

    /// Signed distance from `other` to `self`, in bytes.
    pub const fn difference(self, other: Address) -> i64 {
        self.0.wrapping_sub(other.0) as i64
    }

    /// Hex rendering padded to 8 digits, as the original tooling prints
    /// addresses in procedure dumps.
    pub fn to_string_zerofill(self) -> String {
        format!("0x{:08x}", self.0)
    }
}

impl Add<u64> for Address {
    type Output = Address;

    fn add(self, delta: u64) -> Address {
        Address(self.0.wrapping_add(delta))
    }
}

impl Sub<u64> for Address {
    type Output = Address;

    fn sub(self, delta: u64) -> Address {
        Address(self.0.wrapping_sub(delta))
    }
}

impl AddAssign<u64> for Address {
    fn add_assign(&mut self, delta: u64) {
        self.0 = self.0.wrapping_add(delta);
    }
}

impl SubAssign<u64> for Address {
    fn sub_assign(&mut self, delta: u64) {
        self.0 = self.0.wrapping_sub(delta);
    }
}

impl Sub for Address {
    type Output = i64;

    fn sub(self, other: Address) -> i64 {
        self.difference(other)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Address(0x{:x})", self.0)
        } else {
            write!(f, "Address(INVALID)")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_total() {
        let a = Address::new(0x1000);
        let b = Address::new(0x1004);
        assert!(a < b);
        assert!(b <= b);
        assert!(Address::INVALID > b);
    }

    #[test]
    fn arithmetic() {
        let a = Address::new(0x1000);
        assert_eq!(a + 4, Address::new(0x1004));
        assert_eq!(a - 8, Address::new(0xff8));
        assert_eq!(Address::new(0x1004) - a, 4);
        assert_eq!(a - Address::new(0x1004), -4);
    }

    #[test]
    fn formatting() {
        assert_eq!(Address::new(0x47c).to_string(), "0x47c");
        assert_eq!(Address::new(0x47c).to_string_zerofill(), "0x0000047c");
    }

    #[test]
    fn invalid_sentinel() {
        assert!(!Address::INVALID.is_valid());
        assert!(Address::new(0).is_valid());
    }
}
