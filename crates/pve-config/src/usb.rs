// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! USB device passthrough (`usbN`).

use std::collections::BTreeMap;

use pve_types::UsbSlot;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::MappingName;
use crate::plan::{
    plan_slots, Changes, PlanContext, SlotUpdate, SlottedDevice,
};
use crate::wire::segment::{SegmentBuilder, Segments};
use crate::wire::{self, WireConfig};
use crate::{ValidationError, WireError};

const KEY_PREFIX: &str = "usb";

fn is_hex_id(s: &str) -> bool {
    s.len() == 4 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn validate_device_id(s: &str) -> Result<(), ValidationError> {
    match s.split_once(':') {
        Some((vendor, product)) if is_hex_id(vendor) && is_hex_id(product) => {
            Ok(())
        }
        _ => Err(ValidationError::UsbDeviceIdInvalid(s.to_owned())),
    }
}

fn validate_port_id(s: &str) -> Result<(), ValidationError> {
    let is_number =
        |p: &str| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit());
    let valid = match s.split_once('-') {
        Some((bus, ports)) => is_number(bus) && ports.split('.').all(is_number),
        None => false,
    };
    if !valid {
        return Err(ValidationError::UsbPortIdInvalid(s.to_owned()));
    }
    Ok(())
}

validated_string!(
    /// A host USB device's `vendor:product` ID, e.g. `046d:c52b`.
    UsbDeviceId,
    validate_device_id
);

validated_string!(
    /// A host USB port as `bus-port(.port)*`, e.g. `1-2.3`.
    UsbPortId,
    validate_port_id
);

/// What a guest USB port is connected to.
#[derive(
    Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(deny_unknown_fields, tag = "type", content = "id")]
#[serde(rename_all = "snake_case")]
pub enum UsbSource {
    /// Whichever host device matches the vendor and product ID.
    Device(UsbDeviceId),
    /// A cluster-wide resource mapping.
    Mapping(MappingName),
    /// Whatever is plugged into a specific host port.
    Port(UsbPortId),
    /// USB redirection through a SPICE client.
    Spice,
}

#[derive(
    Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(deny_unknown_fields)]
pub struct UsbDevice {
    pub source: UsbSource,
    /// Attach to a USB 3 controller.
    #[serde(default)]
    pub usb3: bool,
}

impl UsbDevice {
    fn decode(value: &str) -> Result<Self, WireError> {
        let segments = Segments::parse(value);
        let source = match (segments.get("mapping"), segments.get("host")) {
            (Some(mapping), _) => UsbSource::Mapping(mapping.parse()?),
            (None, host) => match host.or_else(|| segments.leading()) {
                Some("spice") => UsbSource::Spice,
                Some(id) if id.contains(':') => {
                    UsbSource::Device(id.parse()?)
                }
                Some(port) => UsbSource::Port(port.parse()?),
                None => return Err(WireError::MissingOption("host")),
            },
        };
        let usb3 = segments.flag("usb3")?.unwrap_or(false);
        Ok(UsbDevice { source, usb3 })
    }

    fn render(&self) -> String {
        let mut builder = SegmentBuilder::new();
        match &self.source {
            UsbSource::Device(id) => builder.pair("host", id),
            UsbSource::Mapping(name) => builder.pair("mapping", name),
            UsbSource::Port(port) => builder.pair("host", port),
            UsbSource::Spice => builder.pair("host", "spice"),
        };
        builder.flag("usb3", self.usb3);
        builder.build()
    }
}

impl SlottedDevice for UsbDevice {
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
            .then_some(SlotUpdate { value, reboot: false }))
    }

    fn hotplug_requires_reboot(&self) -> bool {
        false
    }
}

pub(crate) fn from_wire(
    cfg: &WireConfig,
) -> Result<Option<BTreeMap<UsbSlot, UsbDevice>>, WireError> {
    wire::decode_slots(
        cfg,
        |key| UsbSlot::from_key(KEY_PREFIX, key),
        UsbDevice::decode,
    )
}

pub(crate) fn plan(
    desired: &BTreeMap<UsbSlot, UsbDevice>,
    current: Option<&BTreeMap<UsbSlot, UsbDevice>>,
    ctx: &PlanContext,
    changes: &mut Changes,
) -> Result<(), ValidationError> {
    plan_slots(|slot| slot.key(KEY_PREFIX), desired, current, ctx, changes)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::plan::test::{finish, test_changes, update_ctx, wire};
    use serde_json::{json, Value};

    fn slot(n: u8) -> UsbSlot {
        UsbSlot::new(n).unwrap()
    }

    fn device(source: UsbSource, usb3: bool) -> UsbDevice {
        UsbDevice { source, usb3 }
    }

    fn plan_update(
        desired: &BTreeMap<UsbSlot, UsbDevice>,
        current: &BTreeMap<UsbSlot, UsbDevice>,
    ) -> (Value, bool) {
        let mut changes = test_changes();
        plan(desired, Some(current), &update_ctx(), &mut changes).unwrap();
        let change = finish(changes);
        (Value::Object(change.request_body()), change.reboot_required())
    }

    #[test]
    fn id_grammars() {
        assert!("046d:c52b".parse::<UsbDeviceId>().is_ok());
        assert!("046d:c52".parse::<UsbDeviceId>().is_err());
        assert!("046d-c52b".parse::<UsbDeviceId>().is_err());
        assert!("1-2".parse::<UsbPortId>().is_ok());
        assert!("1-2.3.4".parse::<UsbPortId>().is_ok());
        assert!("1-".parse::<UsbPortId>().is_err());
        assert!("1.2".parse::<UsbPortId>().is_err());
    }

    #[test]
    fn render_sources() {
        const TEST_CASES: &[(&str, &str)] = &[
            ("host=046d:c52b", "host=046d:c52b"),
            ("host=1-2.3,usb3=1", "host=1-2.3,usb3=1"),
            ("mapping=keyboard", "mapping=keyboard"),
            ("spice,usb3=0", "host=spice"),
        ];
        for (input, expected) in TEST_CASES {
            let device = UsbDevice::decode(input).unwrap();
            assert_eq!(device.render(), *expected, "decoding {:?}", input);
        }
    }

    #[test]
    fn removing_a_device() {
        let current: BTreeMap<_, _> =
            [(slot(0), device(UsbSource::Spice, false))].into();
        assert_eq!(
            plan_update(&BTreeMap::new(), &current),
            (json!({ "delete": "usb0" }), false)
        );
    }

    #[test]
    fn replacing_a_device_is_live() {
        let current: BTreeMap<_, _> =
            [(slot(1), device(UsbSource::Spice, false))].into();
        let desired: BTreeMap<_, _> = [(
            slot(1),
            device(UsbSource::Port("2-1".parse().unwrap()), true),
        )]
        .into();
        assert_eq!(
            plan_update(&desired, &current),
            (json!({ "usb1": "host=2-1,usb3=1" }), false)
        );
        assert_eq!(plan_update(&current, &current), (json!({}), false));
    }

    #[test]
    fn decode_from_wire() {
        let cfg = wire(json!({
            "usb0": "host=046d:c52b,usb3=1",
            "usb4": "mapping=yubikey",
        }));
        let usbs = from_wire(&cfg).unwrap().unwrap();
        assert_eq!(
            usbs[&slot(0)],
            device(UsbSource::Device("046d:c52b".parse().unwrap()), true)
        );
        assert_eq!(
            usbs[&slot(4)],
            device(UsbSource::Mapping("yubikey".parse().unwrap()), false)
        );

        assert!(from_wire(&wire(json!({ "usb0": "usb3=1" }))).is_err());
        assert!(from_wire(&wire(json!({ "usb0": "host=bogus" }))).is_err());
    }
}
