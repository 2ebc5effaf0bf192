// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PCI device passthrough (`hostpciN`).

use std::collections::BTreeMap;

use pve_types::PciSlot;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::MappingName;
use crate::plan::{
    plan_slots, Changes, PlanContext, SlotUpdate, SlottedDevice,
};
use crate::wire::segment::{SegmentBuilder, Segments};
use crate::wire::{self, WireConfig};
use crate::{ValidationError, WireError};

const KEY_PREFIX: &str = "hostpci";

fn is_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn validate_hex_id(s: &str) -> Result<(), ValidationError> {
    match s.strip_prefix("0x") {
        Some(digits) if is_hex(digits, 4) => Ok(()),
        _ => Err(ValidationError::PciHexIdInvalid {
            field: "PCI ID",
            value: s.to_owned(),
        }),
    }
}

/// Checks a single host address: `[domain:]bus:device[.function]`.
fn is_host_address(s: &str) -> bool {
    let (address, function) = match s.split_once('.') {
        Some((address, function)) => (address, Some(function)),
        None => (s, None),
    };
    if let Some(function) = function {
        if !matches!(function.as_bytes(), [b'0'..=b'7']) {
            return false;
        }
    }

    match address.split(':').collect::<Vec<_>>().as_slice() {
        [bus, device] => is_hex(bus, 2) && is_hex(device, 2),
        [domain, bus, device] => {
            is_hex(domain, 4) && is_hex(bus, 2) && is_hex(device, 2)
        }
        _ => false,
    }
}

fn validate_raw_id(s: &str) -> Result<(), ValidationError> {
    if s.is_empty() || !s.split(';').all(is_host_address) {
        return Err(ValidationError::PciRawIdInvalid(s.to_owned()));
    }
    Ok(())
}

fn validate_mdev(s: &str) -> Result<(), ValidationError> {
    let valid = !s.is_empty()
        && s.len() <= 128
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if !valid {
        return Err(ValidationError::PciMediatedDeviceInvalid(s.to_owned()));
    }
    Ok(())
}

validated_string!(
    /// A PCI vendor or device ID override, e.g. `0x10de`.
    PciHexId,
    validate_hex_id
);

validated_string!(
    /// One or more host PCI addresses separated by `;`, e.g. `0000:01:00.0`
    /// or `01:00` for every function of a device.
    PciRawId,
    validate_raw_id
);

validated_string!(
    /// A mediated device type such as `nvidia-63`.
    MediatedDevice,
    validate_mdev
);

/// Options shared by mapped and raw PCI devices.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct PciOptions {
    pub device_id: Option<PciHexId>,
    /// Expose the device on a PCI Express port (q35 machines only).
    pub pcie: bool,
    /// Make this device the guest's primary GPU.
    pub primary_gpu: bool,
    /// Map the device's option ROM into guest memory.
    pub rom_bar: bool,
    pub sub_device_id: Option<PciHexId>,
    pub sub_vendor_id: Option<PciHexId>,
    pub vendor_id: Option<PciHexId>,
}

impl Default for PciOptions {
    fn default() -> Self {
        Self {
            device_id: None,
            pcie: false,
            primary_gpu: false,
            rom_bar: true,
            sub_device_id: None,
            sub_vendor_id: None,
            vendor_id: None,
        }
    }
}

impl PciOptions {
    fn decode(segments: &Segments<'_>) -> Result<Self, WireError> {
        Ok(PciOptions {
            device_id: segments.parse_opt("device-id")?,
            pcie: segments.flag("pcie")?.unwrap_or(false),
            primary_gpu: segments.flag("x-vga")?.unwrap_or(false),
            rom_bar: segments.flag("rombar")?.unwrap_or(true),
            sub_device_id: segments.parse_opt("sub-device-id")?,
            sub_vendor_id: segments.parse_opt("sub-vendor-id")?,
            vendor_id: segments.parse_opt("vendor-id")?,
        })
    }

    fn render(
        &self,
        builder: &mut SegmentBuilder,
        mdev: Option<&MediatedDevice>,
    ) {
        builder
            .optional("device-id", self.device_id.as_ref())
            .optional("mdev", mdev)
            .flag("pcie", self.pcie)
            .unset_flag("rombar", self.rom_bar)
            .optional("sub-device-id", self.sub_device_id.as_ref())
            .optional("sub-vendor-id", self.sub_vendor_id.as_ref())
            .optional("vendor-id", self.vendor_id.as_ref())
            .flag("x-vga", self.primary_gpu);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PciMapping {
    pub name: MappingName,
    #[serde(default)]
    pub options: PciOptions,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PciRaw {
    pub id: PciRawId,
    pub mdev: Option<MediatedDevice>,
    #[serde(default)]
    pub options: PciOptions,
}

/// A host PCI device, identified either through a cluster resource mapping
/// or by its address on the host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, tag = "type", content = "device")]
#[serde(rename_all = "snake_case")]
pub enum PciDevice {
    Mapping(PciMapping),
    Raw(PciRaw),
}

impl PciDevice {
    fn decode(value: &str) -> Result<Self, WireError> {
        let segments = Segments::parse(value);
        let options = PciOptions::decode(&segments)?;

        if let Some(name) = segments.get("mapping") {
            return Ok(PciDevice::Mapping(PciMapping {
                name: name.parse()?,
                options,
            }));
        }

        let id = segments
            .get("host")
            .or_else(|| segments.leading())
            .ok_or(WireError::MissingOption("host"))?;
        Ok(PciDevice::Raw(PciRaw {
            id: id.parse()?,
            mdev: segments.parse_opt("mdev")?,
            options,
        }))
    }

    fn render(&self) -> String {
        let mut builder = SegmentBuilder::new();
        match self {
            PciDevice::Mapping(mapping) => {
                builder.pair("mapping", &mapping.name);
                mapping.options.render(&mut builder, None);
            }
            PciDevice::Raw(raw) => {
                builder.positional(&raw.id);
                raw.options.render(&mut builder, raw.mdev.as_ref());
            }
        }
        builder.build()
    }
}

impl SlottedDevice for PciDevice {
    fn render_new(
        &self,
        _ctx: &PlanContext,
    ) -> Result<String, ValidationError> {
        Ok(self.render())
    }

    fn render_update(
        &self,
        current: &Self,
        _ctx: &PlanContext,
    ) -> Result<Option<SlotUpdate>, ValidationError> {
        let value = self.render();
        Ok((value != current.render())
            .then_some(SlotUpdate { value, reboot: true }))
    }

    fn hotplug_requires_reboot(&self) -> bool {
        true
    }
}

pub(crate) fn from_wire(
    cfg: &WireConfig,
) -> Result<Option<BTreeMap<PciSlot, PciDevice>>, WireError> {
    wire::decode_slots(
        cfg,
        |key| PciSlot::from_key(KEY_PREFIX, key),
        PciDevice::decode,
    )
}

pub(crate) fn plan(
    desired: &BTreeMap<PciSlot, PciDevice>,
    current: Option<&BTreeMap<PciSlot, PciDevice>>,
    ctx: &PlanContext,
    changes: &mut Changes,
) -> Result<(), ValidationError> {
    plan_slots(|slot| slot.key(KEY_PREFIX), desired, current, ctx, changes)
}
