// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Serial ports (`serialN`).

use std::collections::BTreeMap;

use pve_types::SerialSlot;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::plan::{
    plan_slots, Changes, PlanContext, SlotUpdate, SlottedDevice,
};
use crate::wire::{self, WireConfig};
use crate::{ValidationError, WireError};

const KEY_PREFIX: &str = "serial";

fn validate_serial_path(s: &str) -> Result<(), ValidationError> {
    let valid = s
        .strip_prefix("/dev/")
        .is_some_and(|rest| !rest.is_empty())
        && !s.contains(|c: char| c == ',' || c.is_whitespace());
    if !valid {
        return Err(ValidationError::SerialPathInvalid(s.to_owned()));
    }
    Ok(())
}

validated_string!(
    /// A host character device such as `/dev/ttyS0`.
    SerialPath,
    validate_serial_path
);

/// The backend a guest serial port is connected to.
#[derive(
    Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(deny_unknown_fields, tag = "type", content = "path")]
#[serde(rename_all = "snake_case")]
pub enum SerialPort {
    /// A UNIX socket on the host, used by the serial console.
    Socket,
    /// A host serial device passed through to the guest.
    Device(SerialPath),
}

impl SerialPort {
    fn decode(value: &str) -> Result<Self, WireError> {
        match value.trim() {
            "socket" => Ok(SerialPort::Socket),
            path => Ok(SerialPort::Device(path.parse()?)),
        }
    }

    fn render(&self) -> String {
        match self {
            SerialPort::Socket => "socket".to_owned(),
            SerialPort::Device(path) => path.to_string(),
        }
    }
}

impl SlottedDevice for SerialPort {
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
        Ok((self != current)
            .then(|| SlotUpdate { value: self.render(), reboot: true }))
    }

    fn hotplug_requires_reboot(&self) -> bool {
        true
    }
}

pub(crate) fn from_wire(
    cfg: &WireConfig,
) -> Result<Option<BTreeMap<SerialSlot, SerialPort>>, WireError> {
    wire::decode_slots(
        cfg,
        |key| SerialSlot::from_key(KEY_PREFIX, key),
        SerialPort::decode,
    )
}

pub(crate) fn plan(
    desired: &BTreeMap<SerialSlot, SerialPort>,
    current: Option<&BTreeMap<SerialSlot, SerialPort>>,
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

    fn slot(n: u8) -> SerialSlot {
        SerialSlot::new(n).unwrap()
    }

    #[test]
    fn serial_paths() {
        assert!("/dev/ttyS0".parse::<SerialPath>().is_ok());
        assert!("/dev/".parse::<SerialPath>().is_err());
        assert!("ttyS0".parse::<SerialPath>().is_err());
        assert!("/dev/tty S0".parse::<SerialPath>().is_err());
    }

    #[test]
    fn changes_need_reboot() {
        let current: BTreeMap<_, _> = [(slot(0), SerialPort::Socket)].into();
        let desired: BTreeMap<_, _> = [
            (slot(0), SerialPort::Device("/dev/ttyS1".parse().unwrap())),
            (slot(3), SerialPort::Socket),
        ]
        .into();

        let mut changes = test_changes();
        plan(&desired, Some(&current), &update_ctx(), &mut changes).unwrap();
        let change = finish(changes);
        assert_eq!(
            Value::Object(change.request_body()),
            json!({ "serial0": "/dev/ttyS1", "serial3": "socket" })
        );
        assert!(change.reboot_required());

        let mut changes = test_changes();
        plan(&BTreeMap::new(), Some(&current), &update_ctx(), &mut changes)
            .unwrap();
        let change = finish(changes);
        assert_eq!(change.delete(), ["serial0"]);
        assert!(change.params().is_empty());
    }

    #[test]
    fn decode_from_wire() {
        let cfg = wire(json!({
            "serial0": "socket",
            "serial2": "/dev/ttyUSB0",
            "serialx": "socket",
        }));
        let serials = from_wire(&cfg).unwrap().unwrap();
        assert_eq!(serials.len(), 2);
        assert_eq!(serials[&slot(0)], SerialPort::Socket);
        assert_eq!(
            serials[&slot(2)],
            SerialPort::Device("/dev/ttyUSB0".parse().unwrap())
        );

        assert!(from_wire(&wire(json!({ "serial1": "pty" }))).is_err());
        assert!(from_wire(&wire(json!({ "serial9": "socket" }))).is_ok());
    }
}
