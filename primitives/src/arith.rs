//! Checked 256-bit arithmetic for ledger values.
//!
//! Balances and token amounts never wrap. Every operation that could leave
//! the representable range reports an [`ArithmeticFault`], which unwinds
//! only the enclosing transaction.

use crate::error::ArithmeticFault;
use crate::types::U256;

pub fn checked_add(a: U256, b: U256) -> Result<U256, ArithmeticFault> {
    a.checked_add(b).ok_or(ArithmeticFault::Overflow)
}

pub fn checked_sub(a: U256, b: U256) -> Result<U256, ArithmeticFault> {
    a.checked_sub(b).ok_or(ArithmeticFault::Underflow)
}

pub fn checked_mul(a: U256, b: U256) -> Result<U256, ArithmeticFault> {
    a.checked_mul(b).ok_or(ArithmeticFault::Overflow)
}

pub fn checked_div(a: U256, b: U256) -> Result<U256, ArithmeticFault> {
    if b.is_zero() {
        return Err(ArithmeticFault::DivisionByZero);
    }
    Ok(a / b)
}

/// Narrow to `u64`, failing if the value does not fit.
pub fn to_u64(value: U256) -> Result<u64, ArithmeticFault> {
    if value.bits() > 64 {
        return Err(ArithmeticFault::Overflow);
    }
    Ok(value.low_u64())
}

/// Narrow to `usize`, failing if the value does not fit.
pub fn to_usize(value: U256) -> Result<usize, ArithmeticFault> {
    let narrow = to_u64(value)?;
    usize::try_from(narrow).map_err(|_| ArithmeticFault::Overflow)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_overflow() {
        assert_eq!(checked_add(U256::MAX, U256::one()), Err(ArithmeticFault::Overflow));
        assert_eq!(checked_add(U256::from(2), U256::from(3)), Ok(U256::from(5)));
    }

    #[test]
    fn test_sub_underflow() {
        assert_eq!(checked_sub(U256::from(3), U256::from(4)), Err(ArithmeticFault::Underflow));
        assert_eq!(checked_sub(U256::from(4), U256::from(4)), Ok(U256::zero()));
    }

    #[test]
    fn test_mul_overflow() {
        assert_eq!(checked_mul(U256::MAX, U256::from(2)), Err(ArithmeticFault::Overflow));
        assert_eq!(checked_mul(U256::zero(), U256::MAX), Ok(U256::zero()));
    }

    #[test]
    fn test_div_by_zero() {
        assert_eq!(checked_div(U256::from(1), U256::zero()), Err(ArithmeticFault::DivisionByZero));
        assert_eq!(checked_div(U256::from(9), U256::from(2)), Ok(U256::from(4)));
    }

    #[test]
    fn test_narrowing() {
        assert_eq!(to_u64(U256::from(u64::MAX)), Ok(u64::MAX));
        assert_eq!(to_u64(U256::from(u64::MAX) + 1), Err(ArithmeticFault::Overflow));
        assert_eq!(to_usize(U256::from(42)), Ok(42));
    }
}
