//! Postgres log sequence numbers.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// A Postgres log sequence number.
///
/// The wire form is `"H1/H2"` where both segments are hex integers, e.g.
/// `"0/16B3748"`. Ordering compares the numeric segments lexicographically,
/// never the strings. The canonical minimum `"0/0"` means "no data yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn {
	hi: u64,
	lo: u64,
}

impl Lsn {
	/// The canonical zero value, `"0/0"`.
	pub const ZERO: Self = Self { hi: 0, lo: 0 };

	/// Build an LSN from its two numeric segments.
	#[must_use]
	pub const fn new(hi: u64, lo: u64) -> Self {
		Self { hi, lo }
	}

	/// Whether this is the canonical zero value.
	#[must_use]
	pub const fn is_zero(self) -> bool {
		self.hi == 0 && self.lo == 0
	}
}

/// Error produced when a string does not match the `"H1/H2"` grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid LSN `{0}`: expected two hex segments separated by `/`")]
pub struct LsnParseError(pub String);

impl FromStr for Lsn {
	type Err = LsnParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let err = || LsnParseError(s.to_string());
		let (hi, lo) = s.split_once('/').ok_or_else(err)?;
		if hi.is_empty() || lo.is_empty() {
			return Err(err());
		}
		let hi = u64::from_str_radix(hi, 16).map_err(|_| err())?;
		let lo = u64::from_str_radix(lo, 16).map_err(|_| err())?;
		Ok(Self { hi, lo })
	}
}

impl fmt::Display for Lsn {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:X}/{:X}", self.hi, self.lo)
	}
}

impl Serialize for Lsn {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.collect_str(self)
	}
}

impl<'de> Deserialize<'de> for Lsn {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		struct LsnVisitor;

		impl Visitor<'_> for LsnVisitor {
			type Value = Lsn;

			fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str("an LSN string of the form \"H1/H2\"")
			}

			fn visit_str<E: de::Error>(self, v: &str) -> Result<Lsn, E> {
				v.parse().map_err(de::Error::custom)
			}
		}

		deserializer.deserialize_str(LsnVisitor)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_and_displays() {
		let lsn: Lsn = "0/16B3748".parse().unwrap();
		assert_eq!(lsn, Lsn::new(0, 0x16B_3748));
		assert_eq!(lsn.to_string(), "0/16B3748");

		let lsn: Lsn = "2a/0".parse().unwrap();
		assert_eq!(lsn, Lsn::new(0x2A, 0));
		assert_eq!(lsn.to_string(), "2A/0");
	}

	#[test]
	fn zero_is_canonical_minimum() {
		let zero: Lsn = "0/0".parse().unwrap();
		assert!(zero.is_zero());
		assert_eq!(zero, Lsn::ZERO);
		assert!(zero < "0/1".parse().unwrap());
	}

	#[test]
	fn orders_by_numeric_segments() {
		let a: Lsn = "0/A".parse().unwrap();
		let b: Lsn = "0/F".parse().unwrap();
		let c: Lsn = "1/0".parse().unwrap();
		assert!(a < b);
		assert!(b < c);
		// "0/10" is numerically greater than "0/F" despite sorting lower as a string.
		let d: Lsn = "0/10".parse().unwrap();
		assert!(b < d);
	}

	#[test]
	fn rejects_malformed_strings() {
		for bad in ["", "0", "0/", "/0", "0/0/0", "xyz/0", "0/ 1"] {
			assert!(bad.parse::<Lsn>().is_err(), "accepted {bad:?}");
		}
	}

	#[test]
	fn serde_round_trip() {
		let lsn: Lsn = "0/F".parse().unwrap();
		let json = serde_json::to_string(&lsn).unwrap();
		assert_eq!(json, "\"0/F\"");
		let back: Lsn = serde_json::from_str(&json).unwrap();
		assert_eq!(back, lsn);
	}
}
