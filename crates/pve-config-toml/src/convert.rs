// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Functions for converting a [`super::Config`] into a [`Configuration`].

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use pve_config::cpu::{self, QemuCpu};
use pve_config::disk::{self, CdRom, DiskSlot, IsoFile, QemuDisks};
use pve_config::memory::QemuMemory;
use pve_config::pci::{self, PciMapping, PciRaw};
use pve_config::serial;
use pve_config::tags::Tag;
use pve_config::usb::{self, UsbSource};
use pve_config::{Configuration, ValidationError, WireError};
use pve_types::units::{self, UnitError, MEBIBYTE};
use pve_types::SlotError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TomlToConfigError {
    #[error("invalid {kind} slot {key:?}")]
    InvalidSlot {
        kind: &'static str,
        key: String,
        #[source]
        source: SlotError,
    },

    #[error("invalid size {value:?} for {field}")]
    InvalidSize {
        field: String,
        value: String,
        #[source]
        source: UnitError,
    },

    #[error("memory size {0:?} isn't a whole number of mebibytes")]
    MemoryNotWholeMebibytes(String),

    #[error("invalid CPU affinity {0:?}")]
    InvalidAffinity(String, #[source] WireError),

    #[error("PCI device {0} has a mediated device type but no raw address")]
    MediatedDeviceWithoutRaw(String),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Converts every `slot => entry` pair, labelling entries `<kind><slot>`
/// (`scsi0`) in errors.
fn slotted<S, T, U>(
    kind: &'static str,
    entries: &BTreeMap<String, T>,
    convert: impl Fn(&str, &T) -> Result<U, TomlToConfigError>,
) -> Result<BTreeMap<S, U>, TomlToConfigError>
where
    S: FromStr<Err = SlotError> + Ord + std::fmt::Display,
{
    entries
        .iter()
        .map(|(key, entry)| {
            let slot: S = key.parse().map_err(|source| {
                TomlToConfigError::InvalidSlot {
                    kind,
                    key: key.clone(),
                    source,
                }
            })?;
            let label = format!("{}{}", kind, slot);
            Ok((slot, convert(&label, entry)?))
        })
        .collect()
}

fn count_set(sources: &[bool]) -> usize {
    sources.iter().filter(|set| **set).count()
}

fn parse_size(field: &str, value: &str) -> Result<u64, TomlToConfigError> {
    units::parse_size(value).map_err(|source| TomlToConfigError::InvalidSize {
        field: field.to_owned(),
        value: value.to_owned(),
        source,
    })
}

fn memory_mib(
    field: &str,
    size: &super::MemorySize,
) -> Result<u32, TomlToConfigError> {
    let value = match size {
        super::MemorySize::Mebibytes(mib) => return Ok(*mib),
        super::MemorySize::Size(value) => value,
    };
    let kib = parse_size(field, value)?;
    if kib % MEBIBYTE != 0 {
        return Err(TomlToConfigError::MemoryNotWholeMebibytes(value.clone()));
    }
    u32::try_from(kib / MEBIBYTE)
        .map_err(|_| TomlToConfigError::MemoryNotWholeMebibytes(value.clone()))
}

impl TryFrom<&super::Cpu> for QemuCpu {
    type Error = TomlToConfigError;

    fn try_from(cpu: &super::Cpu) -> Result<Self, Self::Error> {
        let affinity = cpu
            .affinity
            .as_deref()
            .map(|s| {
                cpu::parse_affinity(s).map_err(|e| {
                    TomlToConfigError::InvalidAffinity(s.to_owned(), e)
                })
            })
            .transpose()?;
        Ok(QemuCpu {
            affinity,
            cores: cpu.cores,
            flags: cpu.flags.clone(),
            limit: cpu.limit,
            numa: cpu.numa,
            sockets: cpu.sockets,
            cpu_type: cpu.cpu_type.clone(),
            units: cpu.units,
            virtual_cores: cpu.vcpus,
        })
    }
}

impl TryFrom<&super::Memory> for QemuMemory {
    type Error = TomlToConfigError;

    fn try_from(memory: &super::Memory) -> Result<Self, Self::Error> {
        Ok(QemuMemory {
            capacity_mib: memory
                .capacity
                .as_ref()
                .map(|size| memory_mib("memory.capacity", size))
                .transpose()?,
            minimum_capacity_mib: memory
                .minimum
                .as_ref()
                .map(|size| memory_mib("memory.minimum", size))
                .transpose()?,
            shares: memory.shares,
        })
    }
}

fn cdrom(label: &str, cdrom: &super::CdRom) -> Result<CdRom, ValidationError> {
    match (&cdrom.iso, cdrom.physical) {
        (None, false) => Ok(CdRom::Empty),
        (Some(iso), false) => Ok(CdRom::Iso(IsoFile {
            size_kib: None,
            ..iso.clone()
        })),
        (None, true) => Ok(CdRom::Physical),
        (Some(_), true) => Err(ValidationError::CdRomSourceCount {
            slot: label.to_owned(),
            count: 2,
        }),
    }
}

fn drive(
    label: &str,
    drive: &super::Drive,
) -> Result<DiskSlot, TomlToConfigError> {
    let slot = match (
        &drive.cdrom,
        &drive.cloudinit,
        &drive.disk,
        &drive.passthrough,
    ) {
        (Some(media), None, None, None) => {
            DiskSlot::CdRom(cdrom(label, media)?)
        }
        (None, Some(cloud_init), None, None) => {
            DiskSlot::CloudInit(cloud_init.clone())
        }
        (None, None, Some(disk), None) => DiskSlot::Disk(disk::Disk {
            storage: disk.storage.clone(),
            size_kib: parse_size(label, &disk.size)?,
            format: disk.format.unwrap_or_default(),
            id: disk.id,
            linked: None,
            syntax: None,
            base_image: false,
            volume: None,
            options: disk.options.clone(),
        }),
        (None, None, None, Some(passthrough)) => {
            DiskSlot::Passthrough(passthrough.clone())
        }
        _ => {
            let count = count_set(&[
                drive.cdrom.is_some(),
                drive.cloudinit.is_some(),
                drive.disk.is_some(),
                drive.passthrough.is_some(),
            ]);
            return Err(ValidationError::DiskSlotVariantCount {
                slot: label.to_owned(),
                count,
            }
            .into());
        }
    };
    Ok(slot)
}

impl TryFrom<&super::Disks> for QemuDisks {
    type Error = TomlToConfigError;

    fn try_from(disks: &super::Disks) -> Result<Self, Self::Error> {
        Ok(QemuDisks {
            ide: disks
                .ide
                .as_ref()
                .map(|d| slotted("ide", d, drive))
                .transpose()?,
            sata: disks
                .sata
                .as_ref()
                .map(|d| slotted("sata", d, drive))
                .transpose()?,
            scsi: disks
                .scsi
                .as_ref()
                .map(|d| slotted("scsi", d, drive))
                .transpose()?,
            virtio: disks
                .virtio
                .as_ref()
                .map(|d| slotted("virtio", d, drive))
                .transpose()?,
        })
    }
}

fn pci_device(
    label: &str,
    device: &super::PciDevice,
) -> Result<pci::PciDevice, TomlToConfigError> {
    let options = device.options.clone();
    match (&device.mapping, &device.raw) {
        (Some(_), None) if device.mdev.is_some() => {
            Err(TomlToConfigError::MediatedDeviceWithoutRaw(label.to_owned()))
        }
        (Some(name), None) => {
            Ok(pci::PciDevice::Mapping(PciMapping {
                name: name.parse()?,
                options,
            }))
        }
        (None, Some(id)) => Ok(pci::PciDevice::Raw(PciRaw {
            id: id.parse()?,
            mdev: device.mdev.as_deref().map(str::parse).transpose()?,
            options,
        })),
        _ => Err(ValidationError::PciSourceCount {
            slot: label.to_owned(),
            count: count_set(&[device.mapping.is_some(), device.raw.is_some()]),
        }
        .into()),
    }
}

fn usb_device(
    label: &str,
    device: &super::UsbDevice,
) -> Result<usb::UsbDevice, TomlToConfigError> {
    let source = match (&device.device, &device.mapping, &device.port) {
        (Some(id), None, None) if !device.spice => {
            UsbSource::Device(id.parse()?)
        }
        (None, Some(name), None) if !device.spice => {
            UsbSource::Mapping(name.parse()?)
        }
        (None, None, Some(port)) if !device.spice => {
            UsbSource::Port(port.parse()?)
        }
        (None, None, None) if device.spice => UsbSource::Spice,
        _ => {
            let count = count_set(&[
                device.device.is_some(),
                device.mapping.is_some(),
                device.port.is_some(),
                device.spice,
            ]);
            return Err(ValidationError::UsbSourceCount {
                slot: label.to_owned(),
                count,
            }
            .into());
        }
    };
    Ok(usb::UsbDevice { source, usb3: device.usb3 })
}

fn serial_port(
    label: &str,
    port: &super::SerialPort,
) -> Result<serial::SerialPort, TomlToConfigError> {
    match (port.socket, &port.path) {
        (true, None) => Ok(serial::SerialPort::Socket),
        (false, Some(path)) => Ok(serial::SerialPort::Device(path.parse()?)),
        (socket, path) => Err(ValidationError::SerialSourceCount {
            slot: label.to_owned(),
            count: count_set(&[socket, path.is_some()]),
        }
        .into()),
    }
}

impl TryFrom<&super::Config> for Configuration {
    type Error = TomlToConfigError;

    fn try_from(config: &super::Config) -> Result<Self, Self::Error> {
        let tags = config
            .tags
            .as_ref()
            .map(|tags| {
                tags.iter()
                    .map(|tag| tag.parse::<Tag>())
                    .collect::<Result<BTreeSet<_>, _>>()
            })
            .transpose()?;

        Ok(Configuration {
            agent: config.agent.clone(),
            cloud_init: config.cloud_init.clone(),
            cpu: config.cpu.as_ref().map(QemuCpu::try_from).transpose()?,
            description: config.description.clone(),
            disks: config.disks.as_ref().map(QemuDisks::try_from).transpose()?,
            iso: config.iso.clone(),
            memory: config
                .memory
                .as_ref()
                .map(QemuMemory::try_from)
                .transpose()?,
            name: config.name.as_deref().map(str::parse).transpose()?,
            networks: config
                .networks
                .as_ref()
                .map(|nets| slotted("net", nets, |_, nic| Ok(nic.clone())))
                .transpose()?,
            on_boot: config.on_boot,
            pci_devices: config
                .pci_devices
                .as_ref()
                .map(|devices| slotted("hostpci", devices, pci_device))
                .transpose()?,
            pool: config.pool.as_deref().map(str::parse).transpose()?,
            protection: config.protection,
            serials: config
                .serials
                .as_ref()
                .map(|ports| slotted("serial", ports, serial_port))
                .transpose()?,
            tags,
            tpm: config.tpm.clone(),
            usbs: config
                .usbs
                .as_ref()
                .map(|devices| slotted("usb", devices, usb_device))
                .transpose()?,
        })
    }
}
