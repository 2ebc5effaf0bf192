// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Planning the wire payload that moves a guest between configurations.
//!
//! Every configuration category has a codec module exposing a `plan`
//! function that compares a desired entity with the current one (if any) and
//! records the wire fields to set or delete in a [`Changes`] accumulator,
//! along with whether any of them can't be applied to a running guest.
//! [`ChangePlanner`] validates the desired configuration and walks every
//! category in a fixed order.

use std::collections::BTreeMap;

use pve_types::{GuestId, PveVersion};
use serde_json::Value;
use slog::{debug, o, trace, Logger};

use crate::wire::{WireConfig, DELETE_KEY};
use crate::{Configuration, ValidationError};

/// Inputs that codecs need besides the entities being compared.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PlanContext {
    pub version: PveVersion,

    /// The guest being updated. `None` while planning a guest's creation.
    pub guest: Option<GuestId>,
}

/// Accumulates the wire fields produced while planning a change.
pub(crate) struct Changes {
    log: Logger,
    params: WireConfig,
    delete: Vec<String>,
    reboot_required: bool,
}

impl Changes {
    pub fn new(log: Logger) -> Self {
        Self {
            log,
            params: WireConfig::new(),
            delete: Vec::new(),
            reboot_required: false,
        }
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        trace!(self.log, "setting wire field"; "key" => &key);
        self.params.insert(key, value.into());
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        let key = key.into();
        trace!(self.log, "deleting wire field"; "key" => &key);
        if !self.delete.contains(&key) {
            self.delete.push(key);
        }
    }

    /// Records that the change can't take effect without a reboot if
    /// `required` is set. Reboot requirements only ever accumulate.
    pub fn reboot_if(&mut self, required: bool) {
        self.reboot_required |= required;
    }

    fn finish(self) -> ConfigChange {
        ConfigChange {
            params: self.params,
            delete: self.delete,
            reboot_required: self.reboot_required,
        }
    }
}

/// The result of planning: fields to set, fields to delete, and whether the
/// guest must be rebooted for the change to take effect.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConfigChange {
    params: WireConfig,
    delete: Vec<String>,
    reboot_required: bool,
}

impl ConfigChange {
    /// Wire fields to set, keyed by wire key.
    pub fn params(&self) -> &WireConfig {
        &self.params
    }

    /// Wire fields to remove, in the order they were planned.
    pub fn delete(&self) -> &[String] {
        &self.delete
    }

    pub fn reboot_required(&self) -> bool {
        self.reboot_required
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty() && self.delete.is_empty()
    }

    /// Builds the request body for the configuration endpoint: every field to
    /// set, plus a comma-separated `delete` entry if anything is removed.
    pub fn request_body(&self) -> WireConfig {
        let mut body = self.params.clone();
        if !self.delete.is_empty() {
            body.insert(
                DELETE_KEY.to_owned(),
                Value::String(self.delete.join(",")),
            );
        }
        body
    }
}

/// The outcome of re-rendering a device against its current state.
pub(crate) struct SlotUpdate {
    pub value: String,
    pub reboot: bool,
}

/// A device that occupies exactly one numbered wire key (`net0`, `usb2`).
pub(crate) trait SlottedDevice {
    /// Renders the device for a slot that is currently empty.
    fn render_new(&self, ctx: &PlanContext) -> Result<String, ValidationError>;

    /// Renders the device as a replacement for `current`, returning `None` if
    /// the wire value wouldn't change.
    fn render_update(
        &self,
        current: &Self,
        ctx: &PlanContext,
    ) -> Result<Option<SlotUpdate>, ValidationError>;

    /// Whether attaching or detaching this device needs a reboot.
    fn hotplug_requires_reboot(&self) -> bool;

    /// Whether the desired entry explicitly asks for the slot to be cleared.
    fn marked_for_deletion(&self) -> bool {
        false
    }
}

/// Plans a slotted collection. Slots present in `current` but missing from
/// `desired` are deleted.
pub(crate) fn plan_slots<S, D>(
    key: impl Fn(S) -> String,
    desired: &BTreeMap<S, D>,
    current: Option<&BTreeMap<S, D>>,
    ctx: &PlanContext,
    changes: &mut Changes,
) -> Result<(), ValidationError>
where
    S: Ord + Copy,
    D: SlottedDevice,
{
    for (slot, device) in desired {
        let existing = current.and_then(|c| c.get(slot));
        if device.marked_for_deletion() {
            if let Some(existing) = existing {
                changes.delete(key(*slot));
                changes.reboot_if(existing.hotplug_requires_reboot());
            }
            continue;
        }

        match existing {
            None => {
                changes.set(key(*slot), device.render_new(ctx)?);
                changes.reboot_if(device.hotplug_requires_reboot());
            }
            Some(existing) => {
                if let Some(update) = device.render_update(existing, ctx)? {
                    changes.set(key(*slot), update.value);
                    changes.reboot_if(update.reboot);
                }
            }
        }
    }

    for (slot, existing) in current.into_iter().flatten() {
        if !desired.contains_key(slot) {
            changes.delete(key(*slot));
            changes.reboot_if(existing.hotplug_requires_reboot());
        }
    }

    Ok(())
}

/// Compares two optional values and records a set (or delete) when they
/// differ. `None` in `desired` leaves the field alone.
pub(crate) fn plan_scalar<T, V>(
    key: &str,
    desired: Option<&T>,
    current: Option<&T>,
    changes: &mut Changes,
    render: impl Fn(&T) -> Option<V>,
) -> bool
where
    T: PartialEq,
    V: Into<Value>,
{
    let Some(desired) = desired else {
        return false;
    };
    if current == Some(desired) {
        return false;
    }

    match render(desired) {
        Some(value) => changes.set(key, value),
        None if current.is_some() => changes.delete(key),
        None => return false,
    }
    true
}

/// Computes configuration changes for one guest at a time.
///
/// The planner holds no state between calls; it is cheap to construct and
/// may be shared across threads.
pub struct ChangePlanner {
    log: Logger,
    version: PveVersion,
}

impl ChangePlanner {
    pub fn new(log: &Logger, version: PveVersion) -> Self {
        Self { log: log.new(o!("component" => "change-planner")), version }
    }

    pub fn version(&self) -> PveVersion {
        self.version
    }

    /// Plans the parameters for creating a new guest with `desired`.
    pub fn plan_create(
        &self,
        desired: &Configuration,
    ) -> Result<ConfigChange, ValidationError> {
        desired.validate(None, self.version)?;

        let ctx = PlanContext { version: self.version, guest: None };
        let log = self.log.new(o!("operation" => "create"));
        let mut changes = Changes::new(log);
        desired.plan(None, &ctx, &mut changes)?;

        // A guest that doesn't exist yet isn't running.
        let mut change = changes.finish();
        change.reboot_required = false;

        debug!(self.log, "planned guest creation";
            "params" => change.params.len());
        Ok(change)
    }

    /// Plans the update that moves `guest` from `current` to `desired`.
    pub fn plan_update(
        &self,
        guest: GuestId,
        desired: &Configuration,
        current: &Configuration,
    ) -> Result<ConfigChange, ValidationError> {
        desired.validate(Some(current), self.version)?;

        let ctx = PlanContext { version: self.version, guest: Some(guest) };
        let mut changes = Changes::new(
            self.log.new(o!("operation" => "update", "guest" => guest.get())),
        );
        desired.plan(Some(current), &ctx, &mut changes)?;
        let change = changes.finish();

        debug!(self.log, "planned guest update";
            "guest" => guest.get(),
            "params" => change.params.len(),
            "deleted" => change.delete.len(),
            "reboot_required" => change.reboot_required);
        Ok(change)
    }
}
