//! Per-element numeric predicates used by the event matcher.
//!
//! The ordering and deadband checks fan out over every numeric base
//! type. Each type implements [`Scalar`] once, with a `Delta` type wide
//! enough to hold the difference of any two values with its sign
//! intact: the signed counterpart of the next wider size for the
//! integers, `f64` for the floats.

use std::cmp::Ordering;

use num_traits::{AsPrimitive, Signed};

use crate::types::BaseType;

pub(crate) trait Scalar: Copy + PartialOrd + 'static {
    const SIZE: usize;
    type Delta: Signed + PartialOrd + Copy + 'static;

    /// Reads one element out of tag memory. Tag payload bytes are
    /// never reinterpreted on the wire, so elements are read with the
    /// server's native byte order, the same order modules wrote them.
    fn read(bytes: &[u8]) -> Self;

    /// Lossless conversion into `Delta`, so differencing cannot wrap.
    fn widen(self) -> Self::Delta;
}

macro_rules! impl_scalar {
    ($($ty:ty => $delta:ty),* $(,)?) => {
        $(
            impl Scalar for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();
                type Delta = $delta;

                fn read(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_ne_bytes(raw)
                }

                fn widen(self) -> $delta {
                    AsPrimitive::<$delta>::as_(self)
                }
            }
        )*
    };
}

impl_scalar!(
    u8 => i16,
    i8 => i16,
    u16 => i32,
    i16 => i32,
    u32 => i64,
    i32 => i64,
    u64 => i128,
    i64 => i128,
    f32 => f64,
    f64 => f64,
);

fn compare<T: Scalar>(comparand: &[u8], current: &[u8]) -> Ordering {
    let comparand = T::read(comparand);
    let current = T::read(current);
    // NaN comparisons are inconclusive and must not fire anything
    comparand.partial_cmp(&current).unwrap_or(Ordering::Equal)
}

fn deadband<T: Scalar>(reference: &[u8], current: &[u8], band: &[u8]) -> bool {
    let diff = T::read(current).widen() - T::read(reference).widen();
    diff.abs() >= T::read(band).widen()
}

/// Orders a stored comparand against one element of tag memory.
pub(crate) fn compare_elements(
    base: BaseType,
    comparand: &[u8],
    current: &[u8],
) -> Ordering {
    match base {
        BaseType::Byte => compare::<u8>(comparand, current),
        BaseType::Sint => compare::<i8>(comparand, current),
        BaseType::Word | BaseType::Uint => compare::<u16>(comparand, current),
        BaseType::Int => compare::<i16>(comparand, current),
        BaseType::Dword | BaseType::Udint | BaseType::Time => {
            compare::<u32>(comparand, current)
        }
        BaseType::Dint => compare::<i32>(comparand, current),
        BaseType::Lword | BaseType::Ulint => compare::<u64>(comparand, current),
        BaseType::Lint => compare::<i64>(comparand, current),
        BaseType::Real => compare::<f32>(comparand, current),
        BaseType::Lreal => compare::<f64>(comparand, current),
        // subscriptions on BOOL never reach the comparison predicates
        BaseType::Bool => unreachable!("BOOL elements are not ordered"),
    }
}

/// True when an element has moved at least `band` away from its stored
/// reference value.
pub(crate) fn deadband_exceeded(
    base: BaseType,
    reference: &[u8],
    current: &[u8],
    band: &[u8],
) -> bool {
    match base {
        BaseType::Byte => deadband::<u8>(reference, current, band),
        BaseType::Sint => deadband::<i8>(reference, current, band),
        BaseType::Word | BaseType::Uint => {
            deadband::<u16>(reference, current, band)
        }
        BaseType::Int => deadband::<i16>(reference, current, band),
        BaseType::Dword | BaseType::Udint | BaseType::Time => {
            deadband::<u32>(reference, current, band)
        }
        BaseType::Dint => deadband::<i32>(reference, current, band),
        BaseType::Lword | BaseType::Ulint => {
            deadband::<u64>(reference, current, band)
        }
        BaseType::Lint => deadband::<i64>(reference, current, band),
        BaseType::Real => deadband::<f32>(reference, current, band),
        BaseType::Lreal => deadband::<f64>(reference, current, band),
        BaseType::Bool => unreachable!("BOOL elements have no deadband"),
    }
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use super::*;

    #[test]
    fn comparand_orders_against_current() {
        let comparand = 42i32.to_ne_bytes();
        assert_eq!(
            compare_elements(BaseType::Dint, &comparand, &41i32.to_ne_bytes()),
            Ordering::Greater
        );
        assert_eq!(
            compare_elements(BaseType::Dint, &comparand, &42i32.to_ne_bytes()),
            Ordering::Equal
        );
        assert_eq!(
            compare_elements(BaseType::Dint, &comparand, &43i32.to_ne_bytes()),
            Ordering::Less
        );
    }

    #[test]
    fn unsigned_comparisons_are_unsigned() {
        let comparand = 1u16.to_ne_bytes();
        let current = 0xFFFFu16.to_ne_bytes();
        assert_eq!(
            compare_elements(BaseType::Uint, &comparand, &current),
            Ordering::Less
        );
    }

    #[test]
    fn nan_comparisons_are_inconclusive() {
        let comparand = 1.0f32.to_ne_bytes();
        let current = f32::NAN.to_ne_bytes();
        assert_eq!(
            compare_elements(BaseType::Real, &comparand, &current),
            Ordering::Equal
        );
    }

    #[test]
    fn unsigned_deltas_keep_their_sign() {
        // 250 -> 2 moves by -248, far outside a band of 10
        let reference = 250u8.to_ne_bytes();
        let current = 2u8.to_ne_bytes();
        let band = 10u8.to_ne_bytes();
        assert!(deadband_exceeded(BaseType::Byte, &reference, &current, &band));

        let band = u8::MAX.to_ne_bytes();
        assert!(!deadband_exceeded(BaseType::Byte, &reference, &current, &band));
    }

    #[test]
    fn wide_integers_do_not_overflow() {
        let reference = u64::MAX.to_ne_bytes();
        let current = 0u64.to_ne_bytes();
        let band = 1u64.to_ne_bytes();
        assert!(deadband_exceeded(BaseType::Lword, &reference, &current, &band));
    }

    #[test]
    fn float_band_is_inclusive() {
        let reference = 0.0f32.to_ne_bytes();
        let band = 1.0f32.to_ne_bytes();
        assert!(!deadband_exceeded(
            BaseType::Real,
            &reference,
            &0.5f32.to_ne_bytes(),
            &band
        ));
        assert!(deadband_exceeded(
            BaseType::Real,
            &reference,
            &1.0f32.to_ne_bytes(),
            &band
        ));
    }
}
