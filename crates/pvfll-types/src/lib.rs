//! Validated value types shared across the pvfll crates.
//!
//! Everything arriving from outside the process (path segments, JSON bodies, CLI arguments)
//! is parsed into one of these types before it reaches the box store, so the core never
//! has to re-check a box number or worry about a file name escaping its box prefix.

use std::fmt;
use std::str::FromStr;

/// Number of boxes in the garden.
pub const BOX_COUNT: u8 = 4;

/// Longest accepted file name, in bytes.
pub const MAX_FILE_NAME_BYTES: usize = 255;

/// Longest accepted device identifier, in bytes.
pub const MAX_DEVICE_ID_BYTES: usize = 128;

/// Errors that can occur when parsing validated values.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TypesError {
    #[error("invalid box number: {0} (expected 1..={max})", max = BOX_COUNT)]
    InvalidBoxNumber(String),

    #[error("invalid file name: {0}")]
    InvalidFileName(String),

    #[error("invalid device id: {0}")]
    InvalidDeviceId(String),
}

/// One of the numbered boxes, always within `1..=BOX_COUNT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BoxNumber(u8);

impl BoxNumber {
    /// Validates a raw box number.
    ///
    /// # Errors
    ///
    /// Returns [`TypesError::InvalidBoxNumber`] when `n` is outside `1..=BOX_COUNT`.
    pub fn new(n: u8) -> Result<Self, TypesError> {
        if (1..=BOX_COUNT).contains(&n) {
            Ok(Self(n))
        } else {
            Err(TypesError::InvalidBoxNumber(n.to_string()))
        }
    }

    /// All boxes, in ascending order.
    pub fn all() -> impl Iterator<Item = BoxNumber> {
        (1..=BOX_COUNT).map(BoxNumber)
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Storage prefix for this box, e.g. `box3`.
    pub fn prefix(self) -> String {
        format!("box{}", self.0)
    }
}

impl FromStr for BoxNumber {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let n = s
            .trim()
            .parse::<u8>()
            .map_err(|_| TypesError::InvalidBoxNumber(s.to_owned()))?;
        Self::new(n)
    }
}

impl fmt::Display for BoxNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl serde::Serialize for BoxNumber {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u8(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for BoxNumber {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // Clients send the box number either as a JSON number or as a string.
        #[derive(serde::Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => u8::try_from(n)
                .map_err(|_| TypesError::InvalidBoxNumber(n.to_string()))
                .and_then(BoxNumber::new)
                .map_err(serde::de::Error::custom),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// The name of a file sitting in a box.
///
/// A file name is a single object-name segment: it never contains a path separator, so
/// `box{n}/{name}` always addresses exactly one object directly under the box prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileName(String);

impl FileName {
    /// Validates a file name.
    ///
    /// # Errors
    ///
    /// Returns [`TypesError::InvalidFileName`] if the name is empty, `.` or `..`, longer than
    /// [`MAX_FILE_NAME_BYTES`], or contains `/`, `\` or control characters.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TypesError> {
        let raw = input.as_ref();
        let name = raw.trim();
        let invalid = || TypesError::InvalidFileName(raw.to_owned());

        if name.is_empty() || name == "." || name == ".." {
            return Err(invalid());
        }
        if name.len() > MAX_FILE_NAME_BYTES {
            return Err(invalid());
        }
        if name
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control())
        {
            return Err(invalid());
        }

        Ok(Self(name.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for FileName {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for FileName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for FileName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for FileName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FileName::new(&s).map_err(serde::de::Error::custom)
    }
}

/// Identifier a device reports its heartbeat under.
///
/// Restricted to a conservative character set because it becomes part of an object key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    /// Validates a device identifier.
    ///
    /// # Errors
    ///
    /// Returns [`TypesError::InvalidDeviceId`] for empty or over-long ids, ids starting with
    /// `.`, or ids containing anything other than ASCII alphanumerics and `-_.:`.
    pub fn new(input: impl AsRef<str>) -> Result<Self, TypesError> {
        let id = input.as_ref().trim();
        let valid = !id.is_empty()
            && id.len() <= MAX_DEVICE_ID_BYTES
            && !id.starts_with('.')
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));

        if valid {
            Ok(Self(id.to_owned()))
        } else {
            Err(TypesError::InvalidDeviceId(input.as_ref().to_owned()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl serde::Serialize for DeviceId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for DeviceId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        DeviceId::new(&s).map_err(serde::de::Error::custom)
    }
}
