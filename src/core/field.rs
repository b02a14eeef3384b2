//! Circuit field encoding.
//!
//! Every value that enters the membership circuit (item ids, prices, nonces,
//! tree nodes) is an element of the BN254 scalar field. On the wire and in
//! persisted secrets they travel as canonical base-10 strings.

use std::fmt;
use std::str::FromStr;

use ark_bn254::Fr;
use ark_ff::{BigInteger, PrimeField, Zero};
use num_bigint::BigUint;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

// =============================================================================
// ERRORS
// =============================================================================

/// Failure to map a value into the circuit field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
    /// Input is not a plain base-10 integer.
    #[error("not a decimal integer: {0:?}")]
    NotDecimal(String),

    /// Integer does not fit below the field modulus.
    #[error("value {0} is not below the field modulus")]
    OutOfRange(String),

    /// Identifier is neither a decimal integer nor a UUID.
    #[error("identifier {0:?} has no canonical integer encoding")]
    UnencodableIdentifier(String),
}

// =============================================================================
// FIELD ELEMENT
// =============================================================================

/// A BN254 scalar with a canonical decimal representation.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldElement(Fr);

impl FieldElement {
    /// The additive identity. Also the empty Merkle leaf.
    pub fn zero() -> Self {
        Self(Fr::zero())
    }

    /// Embed a small integer.
    pub fn from_u64(value: u64) -> Self {
        Self(Fr::from(value))
    }

    /// Embed a 128-bit integer (used for UUID item ids).
    pub fn from_u128(value: u128) -> Self {
        Self(Fr::from(value))
    }

    /// Interpret big-endian bytes as an integer. The caller keeps the input
    /// short enough (at most 31 bytes) that no reduction happens.
    pub fn from_be_bytes(bytes: &[u8]) -> Self {
        Self(Fr::from_be_bytes_mod_order(bytes))
    }

    /// Parse a canonical decimal string.
    ///
    /// Only ASCII digits are accepted; signs, separators and whitespace are
    /// rejected, as are values at or above the modulus.
    pub fn from_decimal(s: &str) -> Result<Self, FieldError> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(FieldError::NotDecimal(s.to_string()));
        }
        let value = BigUint::parse_bytes(s.as_bytes(), 10)
            .ok_or_else(|| FieldError::NotDecimal(s.to_string()))?;
        if value >= modulus() {
            return Err(FieldError::OutOfRange(s.to_string()));
        }
        Ok(Self(Fr::from_le_bytes_mod_order(&value.to_bytes_le())))
    }

    /// Map a catalog identifier to its integer encoding.
    ///
    /// Decimal identifiers map to their value. UUIDs (hyphenated or simple
    /// form) map to their 128-bit big-endian value. Decimal wins when a
    /// string is ambiguous.
    pub fn from_identifier(id: &str) -> Result<Self, FieldError> {
        if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) {
            return Self::from_decimal(id);
        }
        Uuid::parse_str(id)
            .map(|uuid| Self::from_u128(uuid.as_u128()))
            .map_err(|_| FieldError::UnencodableIdentifier(id.to_string()))
    }

    /// Canonical base-10 string. Zero renders as `"0"`.
    pub fn to_decimal(&self) -> String {
        BigUint::from_bytes_le(&self.0.into_bigint().to_bytes_le()).to_str_radix(10)
    }

    /// Underlying arkworks scalar.
    pub fn inner(&self) -> Fr {
        self.0
    }
}

impl From<Fr> for FieldElement {
    fn from(value: Fr) -> Self {
        Self(value)
    }
}

impl fmt::Debug for FieldElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldElement({})", self.to_decimal())
    }
}

impl fmt::Display for FieldElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_decimal())
    }
}

impl FromStr for FieldElement {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_decimal(s)
    }
}

fn modulus() -> BigUint {
    BigUint::from_bytes_le(&Fr::MODULUS.to_bytes_le())
}

// =============================================================================
// SERDE (decimal strings, integers tolerated on input)
// =============================================================================

impl Serialize for FieldElement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_decimal())
    }
}

impl<'de> Deserialize<'de> for FieldElement {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DecimalVisitor;

        impl<'de> Visitor<'de> for DecimalVisitor {
            type Value = FieldElement;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a decimal field element")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                FieldElement::from_decimal(v).map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(FieldElement::from_u64(v))
            }
        }

        deserializer.deserialize_any(DecimalVisitor)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_renders_as_digit() {
        assert_eq!(FieldElement::zero().to_decimal(), "0");
    }

    #[test]
    fn test_decimal_roundtrip_preserves_text() {
        for text in ["0", "1", "42", "18446744073709551616"] {
            let value = FieldElement::from_decimal(text).unwrap();
            assert_eq!(value.to_decimal(), text);
        }
    }

    #[test]
    fn test_decimal_rejects_noise() {
        for text in ["", "-1", "+1", "1_000", " 1", "0x10", "abc"] {
            assert!(
                matches!(FieldElement::from_decimal(text), Err(FieldError::NotDecimal(_))),
                "{text:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_decimal_rejects_modulus() {
        let modulus = modulus().to_str_radix(10);
        assert!(matches!(
            FieldElement::from_decimal(&modulus),
            Err(FieldError::OutOfRange(_))
        ));

        let below = (super::modulus() - 1u32).to_str_radix(10);
        assert_eq!(FieldElement::from_decimal(&below).unwrap().to_decimal(), below);
    }

    #[test]
    fn test_uuid_identifier_is_big_endian_u128() {
        let id = "00000000-0000-0000-0000-0000000000ff";
        assert_eq!(
            FieldElement::from_identifier(id).unwrap(),
            FieldElement::from_u64(255)
        );

        let full = "123e4567-e89b-12d3-a456-426614174000";
        let expected = u128::from_str_radix("123e4567e89b12d3a456426614174000", 16).unwrap();
        assert_eq!(
            FieldElement::from_identifier(full).unwrap(),
            FieldElement::from_u128(expected)
        );
    }

    #[test]
    fn test_numeric_identifier_is_decimal() {
        assert_eq!(
            FieldElement::from_identifier("17").unwrap(),
            FieldElement::from_u64(17)
        );
    }

    #[test]
    fn test_unencodable_identifier() {
        assert!(matches!(
            FieldElement::from_identifier("the-hobbit"),
            Err(FieldError::UnencodableIdentifier(_))
        ));
    }

    #[test]
    fn test_serde_uses_decimal_strings() {
        let value = FieldElement::from_u64(9000);
        assert_eq!(serde_json::to_string(&value).unwrap(), "\"9000\"");

        let parsed: FieldElement = serde_json::from_str("\"9000\"").unwrap();
        assert_eq!(parsed, value);

        let numeric: FieldElement = serde_json::from_str("9000").unwrap();
        assert_eq!(numeric, value);
    }

    #[test]
    fn test_be_bytes() {
        assert_eq!(FieldElement::from_be_bytes(&[1, 0]), FieldElement::from_u64(256));
    }
}
