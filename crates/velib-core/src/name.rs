//! Service name parsing.
//!
//! A raw service name looks like `com.victronenergy.battery.My Device`: a
//! dotted namespace, a device class (the second-to-last segment) and a free
//! form device label (the last segment). The label is normalized so it can be
//! used both in the published bus name and as a key in the naming authority.

use crate::{Result, VelibError};
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

/// Minimum number of dot separated segments in a service name.
const MIN_SEGMENTS: usize = 3;

/// Runs of characters that are not allowed in a device label.
static NON_ALNUM_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9]+").expect("label regex must compile"));

/// Allowed characters for the namespace and class segments.
static SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("segment regex must compile"));

/// Normalize a raw device label.
///
/// Every run of non-alphanumeric characters becomes a single `_` and the
/// result is lower-cased.
///
/// ```
/// use velib_core::name::normalize_label;
///
/// assert_eq!(normalize_label("My Device!!"), "my_device_");
/// assert_eq!(normalize_label("ttyUSB0"), "ttyusb0");
/// ```
pub fn normalize_label(raw: &str) -> String {
    NON_ALNUM_RUN.replace_all(raw, "_").to_lowercase()
}

/// A resolved publication name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceName {
    name: String,
    device_class: String,
    device_label: String,
}

impl ServiceName {
    /// Parse and normalize a raw service name.
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: &str| VelibError::InvalidName {
            name: raw.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = raw.split('.').collect();
        if parts.len() < MIN_SEGMENTS {
            return Err(invalid("name must have at least 3 parts"));
        }

        let (raw_label, prefix) = parts
            .split_last()
            .ok_or_else(|| invalid("name is empty"))?;

        if let Some(bad) = prefix.iter().find(|segment| !SEGMENT.is_match(segment)) {
            return Err(invalid(&format!("invalid segment {:?}", bad)));
        }

        let device_label = normalize_label(raw_label);
        if device_label.is_empty() {
            return Err(invalid("device label is empty"));
        }

        let device_class = prefix[prefix.len() - 1].to_string();
        let name = format!("{}.{}", prefix.join("."), device_label);

        Ok(Self {
            name,
            device_class,
            device_label,
        })
    }

    /// The full publication name, e.g. `com.victronenergy.battery.my_device_`.
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// The device class, e.g. `battery`.
    pub fn device_class(&self) -> &str {
        &self.device_class
    }

    /// The canonical device label, e.g. `my_device_`.
    pub fn device_label(&self) -> &str {
        &self.device_label
    }
}

impl FromStr for ServiceName {
    type Err = VelibError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl AsRef<str> for ServiceName {
    fn as_ref(&self) -> &str {
        &self.name
    }
}
