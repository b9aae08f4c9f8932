//! Storage URLs.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// A storage URL (SURL) pointing at a file on some storage endpoint.
///
/// Wraps [`url::Url`] and adds the storage-name derivation used as the
/// scheduling key. Serializes as a plain string on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Surl(Url);

impl Surl {
    /// Parse a raw string containing a URL.
    pub fn parse(raw: &str) -> Result<Self, url::ParseError> {
        Ok(Self(Url::parse(raw)?))
    }

    /// The storage name: `scheme://host`, without the port.
    ///
    /// Two URLs pointing at the same storage through different ports map to
    /// the same storage name, so concurrency caps apply per endpoint.
    pub fn storage_name(&self) -> String {
        format!("{}://{}", self.0.scheme(), self.0.host_str().unwrap_or(""))
    }

    /// Only the hostname, without scheme or port.
    pub fn host_name(&self) -> &str {
        self.0.host_str().unwrap_or("")
    }

    /// URL scheme.
    pub fn scheme(&self) -> &str {
        self.0.scheme()
    }

    /// Path component.
    pub fn path(&self) -> &str {
        self.0.path()
    }

    /// Port, if present in the URL.
    pub fn port(&self) -> Option<u16> {
        self.0.port()
    }

    /// Raw query string, if any.
    pub fn query(&self) -> Option<&str> {
        self.0.query()
    }

    /// Iterate over the query key/value pairs.
    pub fn query_pairs(&self) -> impl Iterator<Item = (String, String)> + '_ {
        self.0
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
    }

    /// Access the underlying URL.
    pub fn as_url(&self) -> &Url {
        &self.0
    }
}

impl fmt::Display for Surl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Surl {
    type Err = url::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Surl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.0.as_str())
    }
}

impl<'de> Deserialize<'de> for Surl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Surl::parse(&raw).map_err(D::Error::custom)
    }
}
