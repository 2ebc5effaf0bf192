// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A human-authored TOML description of a guest.
//!
//! The TOML shape favors what's convenient to write by hand: sizes are
//! suffixed strings (`"32G"`), CPU affinity uses range notation (`"0-3,8"`),
//! and alternatives such as a drive's kind are written as optional keys of
//! which exactly one is set. [`convert`] turns a [`Config`] into a
//! [`pve_config::Configuration`].

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use pve_config::agent::GuestAgent;
use pve_config::cloudinit::CloudInit;
use pve_config::cpu::CpuFlags;
use pve_config::disk::{
    CloudInitDisk, DiskFormat, DiskOptions, IsoFile, PassthroughDisk,
};
use pve_config::network::NetworkInterface;
use pve_config::pci::PciOptions;
use pve_config::tpm::TpmState;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

pub mod convert;

pub use convert::TomlToConfigError;

/// A guest description.
///
/// As with [`pve_config::Configuration`], every setting is optional and an
/// absent one keeps the guest's current value. Slotted devices are keyed by
/// their slot number.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub name: Option<String>,
    pub description: Option<String>,
    pub pool: Option<String>,
    pub on_boot: Option<bool>,
    pub protection: Option<bool>,
    pub tags: Option<Vec<String>>,
    pub iso: Option<IsoFile>,

    pub agent: Option<GuestAgent>,
    pub cpu: Option<Cpu>,
    pub memory: Option<Memory>,
    pub cloud_init: Option<CloudInit>,
    pub tpm: Option<TpmState>,

    #[serde(rename = "disk")]
    pub disks: Option<Disks>,

    #[serde(rename = "net")]
    pub networks: Option<BTreeMap<String, NetworkInterface>>,

    #[serde(rename = "pci")]
    pub pci_devices: Option<BTreeMap<String, PciDevice>>,

    #[serde(rename = "usb")]
    pub usbs: Option<BTreeMap<String, UsbDevice>>,

    #[serde(rename = "serial")]
    pub serials: Option<BTreeMap<String, SerialPort>>,
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Cpu {
    /// Host CPUs in range notation, e.g. `"0-3,8"`. Empty clears it.
    pub affinity: Option<String>,
    pub cores: Option<u16>,
    pub flags: Option<CpuFlags>,
    pub limit: Option<u8>,
    pub numa: Option<bool>,
    pub sockets: Option<u8>,
    #[serde(rename = "type")]
    pub cpu_type: Option<String>,
    pub units: Option<u32>,
    pub vcpus: Option<u16>,
}

/// A memory size: either a number of mebibytes or a suffixed size string.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum MemorySize {
    Mebibytes(u32),
    Size(String),
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Memory {
    pub capacity: Option<MemorySize>,
    /// The balloon target. Equal to `capacity` to disable ballooning.
    pub minimum: Option<MemorySize>,
    pub shares: Option<u16>,
}

/// Drives per bus, keyed by slot number. An empty table removes every
/// drive on that bus.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Disks {
    pub ide: Option<BTreeMap<String, Drive>>,
    pub sata: Option<BTreeMap<String, Drive>>,
    pub scsi: Option<BTreeMap<String, Drive>>,
    pub virtio: Option<BTreeMap<String, Drive>>,
}

/// One drive. Exactly one key must be set.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Drive {
    pub cdrom: Option<CdRom>,
    pub cloudinit: Option<CloudInitDisk>,
    pub disk: Option<Disk>,
    pub passthrough: Option<PassthroughDisk>,
}

/// A CD-ROM drive. With neither `iso` nor `physical` set, it is empty.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CdRom {
    pub iso: Option<IsoFile>,
    #[serde(default)]
    pub physical: bool,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Disk {
    pub storage: String,
    /// A suffixed size such as `"32G"`; a bare number is in kibibytes.
    pub size: String,
    pub format: Option<DiskFormat>,
    /// The existing volume's ID. Setting a different one moves the disk.
    pub id: Option<u32>,
    #[serde(default)]
    pub options: DiskOptions,
}

/// A host PCI device, given either as a `mapping` or as a `raw` address.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PciDevice {
    pub mapping: Option<String>,
    pub raw: Option<String>,
    /// Mediated device type; raw devices only.
    pub mdev: Option<String>,
    #[serde(default)]
    pub options: PciOptions,
}

/// A USB device. Exactly one of `device`, `mapping`, `port` and `spice`
/// must be set.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct UsbDevice {
    pub device: Option<String>,
    pub mapping: Option<String>,
    pub port: Option<String>,
    #[serde(default)]
    pub spice: bool,
    #[serde(default)]
    pub usb3: bool,
}

/// A serial port backed by either a `socket` or a host device `path`.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SerialPort {
    #[serde(default)]
    pub socket: bool,
    pub path: Option<String>,
}

/// Errors which may be returned when parsing a guest description.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FromStr for Config {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str::<Config>(s)?)
    }
}

/// Parses a TOML file into a guest description.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    contents.parse()
}
