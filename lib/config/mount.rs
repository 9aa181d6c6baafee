use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use typed_path::Utf8UnixPathBuf;

use crate::WarrenError;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A caller-declared directory exposure between host and guest.
///
/// The host tree is copied into the guest path before boot and, unless the
/// mount is read-only, copied back over the host path after the task
/// completes. Mounts are never live-shared; the sandbox only ever sees a
/// private copy.
///
/// ## Format
///
/// Mounts parse from Docker-style strings:
/// - `host:guest` - read-write mapping
/// - `host:guest:ro` - read-only mapping (never written back)
///
/// ## Examples
///
/// ```
/// use warren::config::Mount;
///
/// let rw = "/tmp/src:/workspace".parse::<Mount>().unwrap();
/// assert!(!rw.is_read_only());
///
/// let ro = "/etc/data:/data:ro".parse::<Mount>().unwrap();
/// assert!(ro.is_read_only());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// The host-side directory.
    host: PathBuf,

    /// The guest-side directory.
    guest: Utf8UnixPathBuf,

    /// Whether the mount is excluded from write-back.
    read_only: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Mount {
    /// Creates a new read-write mount.
    pub fn new(host: impl Into<PathBuf>, guest: impl Into<Utf8UnixPathBuf>) -> Self {
        Self {
            host: host.into(),
            guest: guest.into(),
            read_only: false,
        }
    }

    /// Creates a new read-only mount.
    pub fn new_read_only(host: impl Into<PathBuf>, guest: impl Into<Utf8UnixPathBuf>) -> Self {
        Self {
            host: host.into(),
            guest: guest.into(),
            read_only: true,
        }
    }

    /// Returns the host path.
    pub fn get_host(&self) -> &PathBuf {
        &self.host
    }

    /// Returns the guest path.
    pub fn get_guest(&self) -> &Utf8UnixPathBuf {
        &self.guest
    }

    /// Whether the mount is read-only.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl FromStr for Mount {
    type Err = WarrenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');

        let (host, guest) = match (parts.next(), parts.next()) {
            (Some(host), Some(guest)) if !host.is_empty() && !guest.is_empty() => (host, guest),
            _ => return Err(WarrenError::InvalidMount(s.to_string())),
        };

        let read_only = match parts.next() {
            None => false,
            Some("ro") => true,
            Some("rw") => false,
            Some(other) => {
                return Err(WarrenError::InvalidMount(format!(
                    "unknown mount flag `{}` in `{}`",
                    other, s
                )))
            }
        };

        if parts.next().is_some() {
            return Err(WarrenError::InvalidMount(s.to_string()));
        }

        if !guest.starts_with('/') {
            return Err(WarrenError::InvalidMount(format!(
                "guest path must be absolute in `{}`",
                s
            )));
        }

        Ok(Self {
            host: PathBuf::from(host),
            guest: guest.into(),
            read_only,
        })
    }
}

impl fmt::Display for Mount {
    /// Formats the mount following the `host:guest[:ro]` convention.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host.display(), self.guest)?;
        if self.read_only {
            write!(f, ":ro")?;
        }
        Ok(())
    }
}

impl Serialize for Mount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Mount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mount_parses_read_write() -> anyhow::Result<()> {
        let mount: Mount = "/tmp/src:/workspace".parse()?;
        assert_eq!(mount.get_host(), &PathBuf::from("/tmp/src"));
        assert_eq!(mount.get_guest().as_str(), "/workspace");
        assert!(!mount.is_read_only());
        Ok(())
    }

    #[test]
    fn test_mount_parses_read_only_flag() -> anyhow::Result<()> {
        let mount: Mount = "/etc/data:/data:ro".parse()?;
        assert!(mount.is_read_only());

        let mount: Mount = "/etc/data:/data:rw".parse()?;
        assert!(!mount.is_read_only());
        Ok(())
    }

    #[test]
    fn test_mount_rejects_malformed_specs() {
        for spec in ["", "/only-host", ":/guest", "/h:", "/h:/g:bogus", "/h:relative"] {
            assert!(spec.parse::<Mount>().is_err(), "accepted `{}`", spec);
        }
    }

    #[test]
    fn test_mount_display_round_trip() -> anyhow::Result<()> {
        for spec in ["/tmp/src:/workspace", "/etc/data:/data:ro"] {
            let mount: Mount = spec.parse()?;
            assert_eq!(mount.to_string(), spec);
        }
        Ok(())
    }
}
