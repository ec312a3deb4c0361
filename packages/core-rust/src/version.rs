//! Versions: LSNs, lexicographic versions and CVR cookies.
//!
//! A lexi version encodes a `u64` so that string comparison agrees with
//! numeric comparison: one base-36 digit holding `len - 1`, followed by the
//! value in base 36. Longer numbers get a larger length prefix and therefore
//! sort after shorter ones.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::VersionError;

const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn to_base36(mut v: u64) -> String {
    if v == 0 {
        return "0".to_string();
    }
    let mut out = Vec::with_capacity(13);
    while v > 0 {
        // v % 36 < 36, so the index is in range.
        out.push(DIGITS[(v % 36) as usize]);
        v /= 36;
    }
    out.reverse();
    out.into_iter().map(char::from).collect()
}

/// Encodes `v` as a lexi version.
#[must_use]
pub fn version_to_lexi(v: u64) -> String {
    let digits = to_base36(v);
    let mut out = to_base36((digits.len() - 1) as u64);
    out.push_str(&digits);
    out
}

/// Decodes a lexi version.
///
/// # Errors
///
/// [`VersionError::InvalidLexi`] if the string is too short, a character is
/// outside `[0-9a-z]`, the length prefix disagrees with the body, the body has a redundant leading zero, or
/// the value overflows `u64`.
pub fn version_from_lexi(lexi: &str) -> Result<u64, VersionError> {
    let invalid = || VersionError::InvalidLexi(lexi.to_string());
    let mut chars = lexi.chars();
    let prefix = chars
        .next()
        .filter(|c| c.is_ascii_digit() || c.is_ascii_lowercase())
        .and_then(|c| c.to_digit(36))
        .ok_or_else(invalid)?;
    let body = chars.as_str();
    if body.len() != prefix as usize + 1 {
        return Err(invalid());
    }
    if body.len() > 1 && body.starts_with('0') {
        return Err(invalid());
    }
    if !body.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()) {
        return Err(invalid());
    }
    u64::from_str_radix(body, 36).map_err(|_| invalid())
}

/// Parses a Postgres-style LSN `"HI/LO"` (two hex halves) into one integer.
///
/// # Errors
///
/// [`VersionError::InvalidLsn`] for anything else.
pub fn parse_lsn(lsn: &str) -> Result<u64, VersionError> {
    let invalid = || VersionError::InvalidLsn(lsn.to_string());
    let (hi, lo) = lsn.split_once('/').ok_or_else(invalid)?;
    if hi.is_empty() || lo.is_empty() || hi.len() > 8 || lo.len() > 8 {
        return Err(invalid());
    }
    let hi = u32::from_str_radix(hi, 16).map_err(|_| invalid())?;
    let lo = u32::from_str_radix(lo, 16).map_err(|_| invalid())?;
    Ok((u64::from(hi) << 32) | u64::from(lo))
}

/// Formats an integer as an LSN, upper-case hex without padding.
#[must_use]
pub fn format_lsn(v: u64) -> String {
    format!("{:X}/{:X}", v >> 32, v & 0xffff_ffff)
}

/// # Errors
///
/// See [`parse_lsn`].
pub fn lsn_to_lexi(lsn: &str) -> Result<String, VersionError> {
    parse_lsn(lsn).map(version_to_lexi)
}

/// # Errors
///
/// See [`version_from_lexi`].
pub fn lexi_to_lsn(lexi: &str) -> Result<String, VersionError> {
    version_from_lexi(lexi).map(format_lsn)
}

// ---------------------------------------------------------------------------
// CVR versions
// ---------------------------------------------------------------------------

/// Position of a client view: the replica's state version plus an optional
/// minor version for changes that happen between replica versions (desired
/// query updates).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CvrVersion {
    /// Lexi-encoded replica watermark.
    pub state_version: String,
    pub minor_version: Option<u64>,
}

impl CvrVersion {
    #[must_use]
    pub fn new(state_version: impl Into<String>) -> Self {
        Self {
            state_version: state_version.into(),
            minor_version: None,
        }
    }

    /// Version of a brand-new client view: before every replica state.
    #[must_use]
    pub fn initial() -> Self {
        Self::new(version_to_lexi(0))
    }

    /// Next minor version at the same state version.
    #[must_use]
    pub fn bump_minor(&self) -> Self {
        Self {
            state_version: self.state_version.clone(),
            minor_version: Some(self.minor_version.map_or(1, |m| m + 1)),
        }
    }

    #[must_use]
    pub fn cookie(&self) -> String {
        match self.minor_version {
            None => self.state_version.clone(),
            Some(minor) => format!("{}:{}", self.state_version, version_to_lexi(minor)),
        }
    }

    /// # Errors
    ///
    /// [`VersionError::InvalidCookie`] if either part is not a lexi version.
    pub fn from_cookie(cookie: &str) -> Result<Self, VersionError> {
        let invalid = |_| VersionError::InvalidCookie(cookie.to_string());
        let (state, minor) = match cookie.split_once(':') {
            Some((state, minor)) => (state, Some(version_from_lexi(minor).map_err(invalid)?)),
            None => (cookie, None),
        };
        version_from_lexi(state).map_err(invalid)?;
        Ok(Self {
            state_version: state.to_string(),
            minor_version: minor,
        })
    }
}

impl Default for CvrVersion {
    fn default() -> Self {
        Self::initial()
    }
}

impl Ord for CvrVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        // Lexi versions compare correctly as strings. `None < Some(_)`.
        self.state_version
            .cmp(&other.state_version)
            .then(self.minor_version.cmp(&other.minor_version))
    }
}

impl PartialOrd for CvrVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CvrVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cookie())
    }
}

impl FromStr for CvrVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_cookie(s)
    }
}

impl Serialize for CvrVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.cookie())
    }
}

impl<'de> Deserialize<'de> for CvrVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let cookie = String::deserialize(deserializer)?;
        Self::from_cookie(&cookie).map_err(serde::de::Error::custom)
    }
}

/// `true` when `a` is a newer version than the optional `b`.
#[must_use]
pub fn is_newer(a: &CvrVersion, b: Option<&CvrVersion>) -> bool {
    b.map_or(true, |b| a > b)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn known_encodings() {
        assert_eq!(version_to_lexi(0), "00");
        assert_eq!(version_to_lexi(35), "0z");
        assert_eq!(version_to_lexi(36), "110");
        assert_eq!(version_to_lexi(u64::MAX), "c3w5e11264sgsf");
        assert_eq!(version_from_lexi("110"), Ok(36));
    }

    #[test]
    fn uppercase_prefix_is_rejected() {
        // "c3w5e11264sgsf" is u64::MAX; the same digits under "C" must not
        // parse, or two spellings of one version would sort apart.
        assert_eq!(version_from_lexi("c3w5e11264sgsf"), Ok(u64::MAX));
        assert!(version_from_lexi("C3w5e11264sgsf").is_err());
        assert_eq!(version_from_lexi("a10000000000"), Ok(36u64.pow(10)));
        assert!(version_from_lexi("A10000000000").is_err());
    }

    #[test]
    fn malformed_lexi_rejected() {
        for bad in ["", "0", "10", "2zz", "0Z", "100", "czzzzzzzzzzzzz"] {
            assert!(version_from_lexi(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn lsn_halves_combine() {
        assert_eq!(parse_lsn("0/16B3748"), Ok(0x016b_3748));
        assert_eq!(parse_lsn("1/0"), Ok(1 << 32));
        assert_eq!(format_lsn(0x1_0000_00ff), "1/FF");
        assert!(parse_lsn("16B3748").is_err());
        assert!(parse_lsn("x/1").is_err());
        assert!(parse_lsn("123456789/1").is_err());
    }

    #[test]
    fn cookie_format_and_order() {
        let base = CvrVersion::new(version_to_lexi(100));
        let minor = base.bump_minor();
        assert_eq!(base.cookie(), "12s");
        assert_eq!(minor.cookie(), "12s:01");
        assert_eq!(CvrVersion::from_cookie("12s:01"), Ok(minor.clone()));
        assert!(base < minor);
        assert!(minor < CvrVersion::new(version_to_lexi(101)));
        assert!(CvrVersion::from_cookie("12s:").is_err());
        assert!(is_newer(&base, None));
        assert!(!is_newer(&base, Some(&minor)));
    }

    #[test]
    fn serde_uses_cookie_string() {
        let v = CvrVersion::new("12s").bump_minor();
        assert_eq!(serde_json::to_string(&v).unwrap(), "\"12s:01\"");
        let back: CvrVersion = serde_json::from_str("\"12s:01\"").unwrap();
        assert_eq!(back, v);
    }

    proptest! {
        #[test]
        fn lexi_round_trip(v in any::<u64>()) {
            prop_assert_eq!(version_from_lexi(&version_to_lexi(v)), Ok(v));
        }

        #[test]
        fn lexi_order_matches_numeric(a in any::<u64>(), b in any::<u64>()) {
            prop_assert_eq!(version_to_lexi(a).cmp(&version_to_lexi(b)), a.cmp(&b));
        }

        #[test]
        fn lsn_round_trip(hi in any::<u32>(), lo in any::<u32>()) {
            let lsn = format!("{hi:X}/{lo:X}");
            let lexi = lsn_to_lexi(&lsn).unwrap();
            prop_assert_eq!(lexi_to_lsn(&lexi).unwrap(), lsn);
        }
    }
}
