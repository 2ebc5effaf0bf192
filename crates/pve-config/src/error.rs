// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use pve_types::{GuestIdError, NetSlot, PveVersion, SlotError, UnitError};
use thiserror::Error;

use crate::tpm::TpmVersion;

/// Errors that arise while decoding values read from the management API.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("failed to decode wire field {key:?}")]
    Field {
        key: String,
        #[source]
        source: Box<WireError>,
    },

    #[error("expected a {expected} value")]
    UnexpectedType { expected: &'static str },

    #[error("invalid value {value:?} for option {option:?}")]
    InvalidOption { option: String, value: String },

    #[error("unknown {kind} {value:?}")]
    UnknownToken { kind: &'static str, value: String },

    #[error("malformed disk volume {0:?}")]
    MalformedVolume(String),

    #[error("missing required option {0:?}")]
    MissingOption(&'static str),

    #[error("invalid size")]
    Size(#[from] UnitError),

    #[error("invalid slot")]
    Slot(#[from] SlotError),

    #[error("invalid guest ID")]
    GuestId(#[from] GuestIdError),

    #[error("value violates a configuration rule")]
    Invalid(#[from] ValidationError),
}

impl WireError {
    /// Attaches the wire key whose value failed to decode.
    pub fn in_field(self, key: &str) -> Self {
        WireError::Field { key: key.to_owned(), source: Box::new(self) }
    }
}

/// Violations of the structural and semantic rules a desired configuration
/// must satisfy.
///
/// Each rule has its own variant so callers can branch on which rule failed.
/// The messages are written to be shown to end users as-is.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    //
    // General guest settings
    //
    #[error(
        "guest name {0:?} must be 1-128 characters of letters, digits, '-' \
         and '.', and must start and end with a letter or digit"
    )]
    GuestNameInvalid(String),

    #[error(
        "pool name {0:?} must be 1-64 characters of letters, digits, '-' \
         and '_'"
    )]
    PoolNameInvalid(String),

    #[error(
        "tag {0:?} must start with a letter, digit or '_' and contain only \
         letters, digits and '_', '-', '+', '.'"
    )]
    TagInvalid(String),

    #[error("tag {0:?} is longer than 124 characters")]
    TagTooLong(String),

    #[error("an ISO image and disk ide2 can't both be configured")]
    IsoConflictsWithIde2,

    //
    // CPU
    //
    #[error("CPU core count {0} outside range of 1-128")]
    CpuCoresOutOfRange(u16),

    #[error("CPU socket count {0} outside range of 1-4")]
    CpuSocketsOutOfRange(u8),

    #[error("CPU limit {0} outside range of 0-128")]
    CpuLimitOutOfRange(u8),

    #[error("CPU units {0} outside range of 0-262144")]
    CpuUnitsOutOfRange(u32),

    #[error("{vcpus} virtual cores exceed the {total} available cores")]
    CpuVirtualCoresExceedTotal { vcpus: u16, total: u32 },

    #[error("unknown CPU type {0:?}")]
    CpuTypeUnknown(String),

    #[error("CPU type {cpu_type:?} requires a newer version than {version}")]
    CpuTypeUnsupported { cpu_type: String, version: PveVersion },

    //
    // Memory
    //
    #[error("memory capacity {0} MiB outside range of 16-4178944 MiB")]
    MemoryCapacityOutOfRange(u32),

    #[error(
        "minimum memory capacity {minimum} MiB exceeds capacity {capacity} MiB"
    )]
    MemoryMinimumExceedsCapacity { minimum: u32, capacity: u32 },

    #[error("memory shares {0} outside range of 0-50000")]
    MemorySharesOutOfRange(u16),

    #[error(
        "memory shares have no effect unless the minimum capacity is set \
         below the capacity"
    )]
    MemorySharesWithoutBallooning,

    //
    // Disks
    //
    #[error("disk {0} requires a storage")]
    DiskStorageRequired(String),

    #[error(
        "disk {disk} size {size} KiB is below the minimum of {minimum} KiB"
    )]
    DiskSizeTooSmall { disk: String, size: u64, minimum: u64 },

    #[error("disk {disk} doesn't support option {option:?}")]
    DiskOptionUnsupported { disk: String, option: &'static str },

    #[error(
        "disk serial {0:?} must be 1-60 characters of letters, digits, '-' \
         and '_'"
    )]
    DiskSerialInvalid(String),

    #[error("world wide name {0:?} must be '0x' followed by 16 hex digits")]
    DiskWwnInvalid(String),

    #[error("disk {0} has no volume id to update")]
    DiskVolumeUnknown(String),

    #[error("passthrough disk path {0:?} must be an absolute path")]
    DiskPassthroughPathInvalid(String),

    #[error("CD-ROM {0} ISO image requires a storage")]
    CdRomIsoStorageRequired(String),

    #[error("CD-ROM {0} ISO image requires a file name")]
    CdRomIsoFileRequired(String),

    #[error("cloud-init disk {0} requires a storage")]
    CloudInitDiskStorageRequired(String),

    #[error("only one cloud-init disk may be configured")]
    CloudInitDiskDuplicate,

    #[error(
        "disk slot {slot} must populate exactly one variant, found {count}"
    )]
    DiskSlotVariantCount { slot: String, count: usize },

    #[error("CD-ROM {slot} must use at most one media source, found {count}")]
    CdRomSourceCount { slot: String, count: usize },

    //
    // Network interfaces
    //
    #[error("MAC address {0:?} must be six ':'-separated hex octets")]
    MacAddressInvalid(String),

    #[error("MTU {0} outside range of 576-65520")]
    NetworkMtuOutOfRange(u16),

    #[error("network interface {0} may only set an MTU with the virtio model")]
    NetworkMtuRequiresVirtio(String),

    #[error("network queue count {0} outside range of 0-64")]
    NetworkQueuesOutOfRange(u8),

    #[error("network rate limit {0} KB/s exceeds 10240000 KB/s")]
    NetworkRateOutOfRange(u32),

    #[error("VLAN {0} outside range of 1-4094")]
    VlanOutOfRange(u16),

    #[error(
        "bridge name {0:?} must be 1-15 characters of letters, digits, '_', \
         '-' and '.'"
    )]
    NetworkBridgeInvalid(String),

    //
    // Cloud-init
    //
    #[error("{0:?} is not an IPv4 address in CIDR notation")]
    CloudInitIpv4AddressInvalid(String),

    #[error("{0:?} is not an IPv4 gateway address")]
    CloudInitIpv4GatewayInvalid(String),

    #[error("{0:?} is not an IPv6 address in CIDR notation")]
    CloudInitIpv6AddressInvalid(String),

    #[error("{0:?} is not an IPv6 gateway address")]
    CloudInitIpv6GatewayInvalid(String),

    #[error("IPv4 DHCP and a static IPv4 address are mutually exclusive")]
    CloudInitIpv4DhcpWithAddress,

    #[error("an IPv4 gateway can't be combined with IPv4 DHCP")]
    CloudInitIpv4DhcpWithGateway,

    #[error(
        "IPv6 DHCP, SLAAC and a static IPv6 address are mutually exclusive"
    )]
    CloudInitIpv6Exclusive,

    #[error("an IPv6 gateway can't be combined with IPv6 DHCP or SLAAC")]
    CloudInitIpv6AutoWithGateway,

    #[error("cloud-init network settings for slot {0} have no interface")]
    CloudInitNetworkWithoutInterface(NetSlot),

    #[error("snippet path {0:?} must be absolute")]
    CloudInitSnippetPathRelative(String),

    #[error("snippet path {0:?} is longer than 256 characters")]
    CloudInitSnippetPathTooLong(String),

    #[error("snippet requires a storage")]
    CloudInitSnippetStorageRequired,

    #[error(
        "upgrading packages through cloud-init requires version 8.0.0 \
         or newer, found {0}"
    )]
    CloudInitUpgradeUnsupported(PveVersion),

    //
    // PCI, USB and serial devices
    //
    #[error("{field} {value:?} must be '0x' followed by 4 hex digits")]
    PciHexIdInvalid { field: &'static str, value: String },

    #[error(
        "PCI host ID {0:?} must look like '0000:01:00.0' or '01:00' \
         (domain and function optional)"
    )]
    PciRawIdInvalid(String),

    #[error("mediated device type {0:?} is invalid")]
    PciMediatedDeviceInvalid(String),

    #[error(
        "mapping name {0:?} must start with a letter and contain only \
         letters, digits, '-' and '_' (at most 128 characters)"
    )]
    MappingNameInvalid(String),

    #[error("PCI device {slot} must use exactly one source, found {count}")]
    PciSourceCount { slot: String, count: usize },

    #[error("USB device ID {0:?} must be 'vendor:product' in hex")]
    UsbDeviceIdInvalid(String),

    #[error("USB port {0:?} must look like 'bus-port(.port)*'")]
    UsbPortIdInvalid(String),

    #[error("USB device {slot} must use exactly one source, found {count}")]
    UsbSourceCount { slot: String, count: usize },

    #[error("serial device path {0:?} must be a device under /dev/")]
    SerialPathInvalid(String),

    #[error("serial port {slot} must use exactly one backend, found {count}")]
    SerialSourceCount { slot: String, count: usize },

    //
    // TPM
    //
    #[error("TPM state requires a storage")]
    TpmStorageRequired,

    #[error("TPM version can't change from {current} to {desired}")]
    TpmVersionChange { current: TpmVersion, desired: TpmVersion },
}
