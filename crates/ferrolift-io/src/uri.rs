//! Transfer URIs
//!
//! A transfer URI names a storage system and a path on it: `scheme://system/path`.
//! When the authority is empty (`file:///data/x`) the scheme doubles as the system id.

use ferrolift_types::{Error, Result};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Parsed `scheme://system/path` address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferUri {
    url: Url,
    system: String,
}

impl TransferUri {
    /// Parse a transfer URI
    pub fn parse(input: &str) -> Result<Self> {
        let mut url = Url::parse(input)
            .map_err(|e| Error::invalid_request(format!("Invalid URI '{}': {}", input, e)))?;

        if url.cannot_be_a_base() {
            return Err(Error::invalid_request(format!(
                "URI '{}' has no hierarchical path",
                input
            )));
        }

        if url.path().is_empty() {
            url.set_path("/");
        }

        let system = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => url.scheme().to_string(),
        };

        Ok(Self { url, system })
    }

    /// URI scheme
    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// Storage system identifier used for adapter lookup
    pub fn system(&self) -> &str {
        &self.system
    }

    /// Path on the storage system, always starting with `/`
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// Append a relative path below this URI
    pub fn join(&self, relative: &str) -> Self {
        let relative = relative.trim_start_matches('/');
        if relative.is_empty() {
            return self.clone();
        }

        let base = self.url.path().trim_end_matches('/');
        let mut url = self.url.clone();
        url.set_path(&format!("{}/{}", base, relative));
        Self {
            url,
            system: self.system.clone(),
        }
    }

    /// Path of `path` relative to this URI's path, if it lies below it
    pub fn relative_to<'a>(&self, path: &'a str) -> Option<&'a str> {
        let base = self.url.path().trim_end_matches('/');
        let rest = path.strip_prefix(base)?;
        if rest.is_empty() {
            Some("")
        } else {
            rest.strip_prefix('/')
        }
    }

    /// Same system, different path
    pub fn with_path(&self, path: &str) -> Self {
        let mut url = self.url.clone();
        url.set_path(path);
        Self {
            url,
            system: self.system.clone(),
        }
    }
}

impl FromStr for TransferUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for TransferUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}
