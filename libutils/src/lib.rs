//! Small helpers shared between the kernel and the userspace support crates.
//!
//! Nothing in here knows about kernel objects; it is alignment math, bit
//! array scanning and byte-cursor utilities used by both sides of the
//! syscall boundary.

#![no_std]

// rustc warnings
#![warn(unused)]
#![warn(missing_debug_implementations)]
#![allow(dead_code)]
#![cfg_attr(test, allow(unused_imports))]

// rustdoc warnings
#![warn(missing_docs)]

use num_traits::Num;
use core::ops::{Not, BitAnd};

mod cursor;
pub use crate::cursor::*;

/// Align the address to the next alignment.
///
/// The given number should be a power of two to get coherent results!
///
/// # Panics
///
/// Panics on underflow if align is 0.
/// Panics on overflow if the expression `addr + (align - 1)` overflows.
pub fn align_up<T: Num + Not<Output = T> + BitAnd<Output = T> + Copy>(addr: T, align: T) -> T {
    align_down(addr + (align - T::one()), align)
}

/// Align the address to the previous alignment.
///
/// The given number should be a power of two to get coherent results!
///
/// # Panics
///
/// Panics on underflow if align is 0.
pub fn align_down<T: Num + Not<Output = T> + BitAnd<Output = T> + Copy>(addr: T, align: T) -> T {
    addr & !(align - T::one())
}

/// align_up, but checks if addr overflows
pub fn align_up_checked(addr: usize, align: usize) -> Option<usize> {
    match addr & (align - 1) {
        0 => Some(addr),
        _ => addr.checked_add(align - (addr % align)),
    }
}

/// Checks that `addr` is a multiple of `align`.
pub fn is_aligned(addr: usize, align: usize) -> bool {
    addr % align == 0
}

/// Counts the numbers of `b` in `a`, rounding the result up.
///
/// Counting the pages needed to store `0x3002` bytes is
/// `div_ceil(0x3002, PAGE_SIZE)`.
pub fn div_ceil<T: Num + Copy>(a: T, b: T) -> T {
    if a % b != T::zero() {
        a / b + T::one()
    } else {
        a / b
    }
}

/// Creates a fake C-like enum, where all bit values are accepted.
///
/// This is mainly useful for FFI constructs. In C, an enum is allowed to take
/// any bit value, not just those defined in the enumeration. In Rust,
/// constructing an enum with a value outside the enumeration is UB. In order
/// to avoid this, we define our enum as a struct with associated variants.
#[macro_export]
macro_rules! enum_with_val {
    ($(#[$meta:meta])* $vis:vis struct $ident:ident($innervis:vis $ty:ty) {
        $($(#[$varmeta:meta])* $variant:ident = $num:expr),* $(,)*
    }) => {
        $(#[$meta])*
        #[repr(transparent)]
        $vis struct $ident($innervis $ty);
        impl $ident {
            $($(#[$varmeta])* $vis const $variant: $ident = $ident($num);)*
        }

        impl ::core::fmt::Debug for $ident {
            fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
                match self {
                    $(&$ident::$variant => write!(f, "{}::{}", stringify!($ident), stringify!($variant)),)*
                    &$ident(v) => write!(f, "{}({})", stringify!($ident), v),
                }
            }
        }
    }
}

/// Returns the index of the first 0 in a bit array.
pub fn bit_array_first_zero(bitarray: &[u8]) -> Option<usize> {
    for (index, &byte) in bitarray.iter().enumerate() {
        if byte == 0xFF {
            // not here
            continue;
        }
        // We've got a zero in this byte
        for offset in 0..8 {
            if (byte & (1 << offset)) == 0 {
                return Some(index * 8 + offset);
            }
        }
    }
    // not found
    None
}

/// Returns the index of the first 1 in a bit array.
pub fn bit_array_first_one(bitarray: &[u8]) -> Option<usize> {
    for (index, &byte) in bitarray.iter().enumerate() {
        if byte == 0x00 {
            // not here
            continue;
        }
        // We've got a one in this byte
        for offset in 0..8 {
            if (byte & (1 << offset)) != 0 {
                return Some(index * 8 + offset);
            }
        }
    }
    // not found
    None
}

/// Gets bit `index` of a bit array.
pub fn bit_array_get(bitarray: &[u8], index: usize) -> bool {
    use bit_field::BitArray;
    bitarray.get_bit(index)
}

/// Sets bit `index` of a bit array to `value`.
pub fn bit_array_set(bitarray: &mut [u8], index: usize, value: bool) {
    use bit_field::BitArray;
    bitarray.set_bit(index, value);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_align() {
        assert_eq!(align_up(0x3002usize, 0x1000), 0x4000);
        assert_eq!(align_up(0x3000usize, 0x1000), 0x3000);
        assert_eq!(align_down(0x3002usize, 0x1000), 0x3000);
        assert_eq!(align_up_checked(usize::max_value(), 0x1000), None);
        assert_eq!(align_up_checked(0x42, 0x1000), Some(0x1000));
    }

    #[test]
    fn test_div_ceil() {
        assert_eq!(div_ceil(0x3002usize, 0x1000), 4);
        assert_eq!(div_ceil(0x3000usize, 0x1000), 3);
    }

    #[test]
    fn test_bit_array() {
        let mut arr = [0u8; 4];
        assert_eq!(bit_array_first_zero(&arr), Some(0));
        assert_eq!(bit_array_first_one(&arr), None);

        bit_array_set(&mut arr, 0, true);
        bit_array_set(&mut arr, 1, true);
        assert_eq!(bit_array_first_zero(&arr), Some(2));
        assert_eq!(bit_array_first_one(&arr), Some(0));
        assert!(bit_array_get(&arr, 1));

        bit_array_set(&mut arr, 1, false);
        assert_eq!(bit_array_first_zero(&arr), Some(1));
        assert!(!bit_array_get(&arr, 1));

        for i in 0..32 {
            bit_array_set(&mut arr, i, true);
        }
        assert_eq!(bit_array_first_zero(&arr), None);
    }
}
