//! Mirror configuration.
use super::errors::*;
use crate::metadata::{DeviceFlags, NAME_LEN};
use std::fmt;
use std::str::FromStr;

/// Read balance strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Balance {
    /// Rotate through the active disks.
    RoundRobin,
    /// Always read from the first active disk.
    Prefer,
    /// Read from the least loaded disk, favouring sequential locality.
    Load,
    /// Split large reads across all active disks.
    Split,
}

impl Default for Balance {
    fn default() -> Self {
        Balance::Load
    }
}

impl FromStr for Balance {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "round-robin" => Balance::RoundRobin,
            "prefer" => Balance::Prefer,
            "load" => Balance::Load,
            "split" => Balance::Split,
            _ => bail!(ErrorKind::Configuration(format!(
                "unknown balance algorithm {:?}",
                s
            ))),
        })
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            Balance::RoundRobin => "round-robin",
            Balance::Prefer => "prefer",
            Balance::Load => "load",
            Balance::Split => "split",
        })
    }
}

/// `Configuration` of one mirror device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Name of the device, at most 16 bytes.
    pub name: String,
    /// Number of members the device waits for while starting.
    pub ndisks: u32,
    /// Read balance strategy.
    pub balance: Balance,
    /// Reads larger than this are split across disks by `Balance::Split`.
    #[serde(with = "human_size")]
    pub slice: u32,
    /// Synchronize out-of-date disks automatically.
    pub autosync: bool,
    /// Disconnect a synchronizing disk when synchronization fails.
    pub failsync: bool,
    /// Concurrent synchronization requests per disk.
    pub sync_requests: usize,
    /// Size of one synchronization request.
    #[serde(with = "human_size")]
    pub sync_chunk: u32,
    /// Synchronization requests between two checkpoints of the sync offset.
    pub sync_save_interval: u32,
    /// How long a starting device waits for missing members.
    pub discovery_timeout_ms: u64,
    /// How long a device has to be without writes before it is marked clean.
    pub idle_timeout_ms: u64,
    /// Threads executing backend requests.
    pub io_threads: usize,
    /// Size of the device; defaults to the smallest member.
    pub mediasize: Option<u64>,
    /// Sector size of the device; defaults to the largest member's.
    pub sectorsize: Option<u32>,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            name: String::from("mirror"),
            ndisks: 2,
            balance: Balance::default(),
            slice: 4096,
            autosync: true,
            failsync: true,
            sync_requests: 2,
            sync_chunk: 128 * 1024,
            sync_save_interval: 100,
            discovery_timeout_ms: 4000,
            idle_timeout_ms: 5000,
            io_threads: 4,
            mediasize: None,
            sectorsize: None,
        }
    }
}

impl Configuration {
    /// Returns a default configuration for `name` with `ndisks` members.
    pub fn new(name: &str, ndisks: u32, balance: Balance) -> Self {
        Configuration {
            name: name.to_string(),
            ndisks,
            balance,
            ..Default::default()
        }
    }

    /// Parses and validates a TOML representation, e.g.
    ///
    /// ```toml
    /// name = "gm0"
    /// ndisks = 2
    /// balance = "split"
    /// slice = "4K"
    /// ```
    pub fn from_toml(s: &str) -> Result<Self> {
        let cfg: Configuration = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks the configuration for values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        let invalid =
            |reason: String| -> Result<()> { Err(ErrorKind::Configuration(reason).into()) };
        if self.name.is_empty() || self.name.len() > NAME_LEN {
            return invalid(format!("name must be 1 to {} bytes", NAME_LEN));
        }
        if self.ndisks == 0 {
            return invalid(String::from("a mirror needs at least one disk"));
        }
        if self.sync_requests == 0 {
            return invalid(String::from("sync_requests must not be 0"));
        }
        if self.sync_chunk == 0 {
            return invalid(String::from("sync_chunk must not be 0"));
        }
        if self.io_threads == 0 {
            return invalid(String::from("io_threads must not be 0"));
        }
        if let Some(sectorsize) = self.sectorsize {
            if sectorsize == 0 || self.sync_chunk % sectorsize != 0 {
                return invalid(format!(
                    "sync_chunk {} is not a multiple of the sector size {}",
                    self.sync_chunk, sectorsize
                ));
            }
        }
        Ok(())
    }

    /// Returns the on-disk device flags for this configuration.
    pub fn device_flags(&self) -> DeviceFlags {
        let mut flags = DeviceFlags::default();
        flags.set(DeviceFlags::NOAUTOSYNC, !self.autosync);
        flags.set(DeviceFlags::NOFAILSYNC, !self.failsync);
        flags
    }
}

mod human_size {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(u64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> ::std::result::Result<u32, D::Error> {
        let bytes = match Repr::deserialize(deserializer)? {
            Repr::Number(n) => n,
            Repr::Text(s) => unbytify::unbytify(&s)
                .map_err(|_| D::Error::custom(format!("invalid size {:?}", s)))?,
        };
        if bytes > u64::from(u32::max_value()) {
            return Err(D::Error::custom(format!("size {} too large", bytes)));
        }
        Ok(bytes as u32)
    }

    pub fn serialize<S: Serializer>(
        value: &u32,
        serializer: S,
    ) -> ::std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u32(*value)
    }
}
