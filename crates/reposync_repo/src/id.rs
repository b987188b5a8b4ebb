//! Record and repository identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of a record within one repository.
///
/// Identifiers are 64-bit values that are:
/// - Unique within their repository
/// - Meaningless across repositories (two repositories number independently)
/// - Rendered as lowercase hex with a `0x` prefix and no leading zeros
///
/// The zero value is the invalid identifier and renders as `"0"`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id64(u64);

impl Id64 {
    /// The invalid identifier.
    pub const INVALID: Self = Self(0);

    /// The root entity present in every repository.
    pub const ROOT_ENTITY: Self = Self(0x1);

    /// The root container, defined by the root entity.
    pub const ROOT_CONTAINER: Self = Self(0x1);

    /// The dictionary entity and the container it defines.
    pub const DICTIONARY: Self = Self(0x10);

    /// The first identifier handed out for user records.
    pub const FIRST_USER_ID: u64 = 0x20;

    /// Creates an identifier from its raw value.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Returns true unless this is the invalid identifier.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Returns true for the identifiers every repository is created with.
    #[must_use]
    pub const fn is_well_known(self) -> bool {
        self.0 != 0 && self.0 < Self::FIRST_USER_ID
    }

    /// Value of the last hex digit of the rendered identifier.
    #[inline]
    #[must_use]
    pub const fn last_hex_digit(self) -> usize {
        (self.0 & 0xf) as usize
    }

    /// Renders the identifier as hex (`0x1f`), or `"0"` when invalid.
    #[must_use]
    pub fn to_hex(self) -> String {
        if self.is_valid() {
            format!("{:#x}", self.0)
        } else {
            "0".to_string()
        }
    }

    /// Parses a hex identifier.
    ///
    /// Accepts `0x`-prefixed hex in either case and `"0"` for the invalid
    /// identifier. Returns `None` for anything else.
    #[must_use]
    pub fn from_hex(text: &str) -> Option<Self> {
        if text == "0" {
            return Some(Self::INVALID);
        }
        let digits = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))?;
        if digits.is_empty() || digits.len() > 16 {
            return None;
        }
        u64::from_str_radix(digits, 16).ok().map(Self)
    }

    /// Returns true if `text` is exactly the canonical rendering of a
    /// valid identifier.
    ///
    /// Provenance written by a repository transformer always carries
    /// canonical identifiers; anything else came from another provenance
    /// source.
    #[must_use]
    pub fn is_canonical_hex(text: &str) -> bool {
        match Self::from_hex(text) {
            Some(id) if id.is_valid() => id.to_hex() == text,
            _ => false,
        }
    }
}

impl fmt::Debug for Id64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id64({})", self.to_hex())
    }
}

impl fmt::Display for Id64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Id64 {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s).ok_or_else(|| format!("not a hex identifier: {s}"))
    }
}

impl From<u64> for Id64 {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Id64> for u64 {
    fn from(id: Id64) -> Self {
        id.0
    }
}

/// Identifier of a whole repository.
///
/// Repository ids are random UUIDs assigned at creation; a copy of a
/// repository gets a fresh id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepositoryId(Uuid);

impl RepositoryId {
    /// Creates a new random repository id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parses the hyphenated form produced by `Display`.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        Uuid::parse_str(text).ok().map(Self)
    }
}

impl Default for RepositoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RepositoryId({})", self.0)
    }
}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
