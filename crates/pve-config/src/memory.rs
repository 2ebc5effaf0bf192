// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest memory size and ballooning.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plan::{plan_scalar, Changes, PlanContext};
use crate::wire::segment::Segments;
use crate::wire::{self, WireConfig};
use crate::{ValidationError, WireError};

const KEY_MEMORY: &str = "memory";
const KEY_BALLOON: &str = "balloon";
const KEY_SHARES: &str = "shares";

pub const MIN_CAPACITY_MIB: u32 = 16;
pub const MAX_CAPACITY_MIB: u32 = 4_178_944;
pub const MAX_SHARES: u16 = 50_000;

/// The capacity the API assigns a guest that doesn't configure one.
pub const DEFAULT_CAPACITY_MIB: u32 = 512;

/// Memory settings, in mebibytes.
///
/// `shares` weighs this guest against others when the host reclaims
/// ballooned memory, so it only has an effect while `minimum_capacity_mib`
/// is below `capacity_mib`. Shares of zero restore the default weight.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(default, deny_unknown_fields)]
pub struct QemuMemory {
    pub capacity_mib: Option<u32>,
    pub minimum_capacity_mib: Option<u32>,
    pub shares: Option<u16>,
}

impl QemuMemory {
    pub(crate) fn from_wire(
        cfg: &WireConfig,
    ) -> Result<Option<Self>, WireError> {
        // Newer API versions report `current=<size>` instead of a number.
        let capacity_mib = match cfg.get(KEY_MEMORY) {
            Some(Value::String(s)) => {
                let segments = Segments::parse(s);
                let size = segments
                    .leading()
                    .or_else(|| segments.get("current"))
                    .ok_or_else(|| {
                        WireError::MissingOption("current").in_field(KEY_MEMORY)
                    })?;
                let size = size.parse().map_err(|_| {
                    WireError::InvalidOption {
                        option: "current".to_owned(),
                        value: size.to_owned(),
                    }
                    .in_field(KEY_MEMORY)
                })?;
                Some(size)
            }
            _ => wire::get_int(cfg, KEY_MEMORY)?,
        };

        let memory = QemuMemory {
            capacity_mib,
            minimum_capacity_mib: wire::get_int(cfg, KEY_BALLOON)?,
            shares: wire::get_int(cfg, KEY_SHARES)?,
        };
        Ok((memory != QemuMemory::default()).then_some(memory))
    }

    /// Returns the capacity and minimum capacity that would be in effect
    /// after applying `self` on top of `current`.
    fn effective(&self, current: Option<&QemuMemory>) -> (u32, Option<u32>) {
        let capacity = self
            .capacity_mib
            .or_else(|| current.and_then(|c| c.capacity_mib))
            .unwrap_or(DEFAULT_CAPACITY_MIB);
        let minimum = self
            .minimum_capacity_mib
            .or_else(|| current.and_then(|c| c.minimum_capacity_mib));
        (capacity, minimum)
    }

    pub(crate) fn validate(
        &self,
        current: Option<&QemuMemory>,
    ) -> Result<(), ValidationError> {
        if let Some(capacity) = self.capacity_mib {
            if !(MIN_CAPACITY_MIB..=MAX_CAPACITY_MIB).contains(&capacity) {
                return Err(ValidationError::MemoryCapacityOutOfRange(
                    capacity,
                ));
            }
        }
        if let Some(shares) = self.shares {
            if shares > MAX_SHARES {
                return Err(ValidationError::MemorySharesOutOfRange(shares));
            }
        }

        let (capacity, minimum) = self.effective(current);
        if let Some(minimum) = minimum {
            if minimum > capacity {
                return Err(ValidationError::MemoryMinimumExceedsCapacity {
                    minimum,
                    capacity,
                });
            }
        }

        if self.shares.is_some_and(|s| s > 0) {
            let ballooning = minimum.is_some_and(|m| m < capacity);
            if !ballooning {
                return Err(ValidationError::MemorySharesWithoutBallooning);
            }
        }

        Ok(())
    }

    pub(crate) fn plan(
        desired: &QemuMemory,
        current: Option<&QemuMemory>,
        _ctx: &PlanContext,
        changes: &mut Changes,
    ) -> Result<(), ValidationError> {
        let current_capacity = current.and_then(|c| c.capacity_mib);
        if plan_scalar(
            KEY_MEMORY,
            desired.capacity_mib.as_ref(),
            current_capacity.as_ref(),
            changes,
            |v| Some(*v),
        ) {
            // Memory can be hot-added but not hot-removed.
            let shrinking = matches!(
                (desired.capacity_mib, current_capacity),
                (Some(d), Some(c)) if d < c
            );
            changes.reboot_if(shrinking);
        }

        plan_scalar(
            KEY_BALLOON,
            desired.minimum_capacity_mib.as_ref(),
            current.and_then(|c| c.minimum_capacity_mib.as_ref()),
            changes,
            |v| Some(*v),
        );

        let current_shares = current.and_then(|c| c.shares).filter(|s| *s > 0);
        match desired.shares {
            Some(_) => {
                plan_scalar(
                    KEY_SHARES,
                    desired.shares.as_ref(),
                    current.and_then(|c| c.shares.as_ref()),
                    changes,
                    |v| (*v > 0).then_some(*v),
                );
            }
            None => {
                // Shares left over from an earlier balloon are meaningless
                // once ballooning is off.
                let (capacity, minimum) = desired.effective(current);
                if current_shares.is_some()
                    && !minimum.is_some_and(|m| m < capacity)
                {
                    changes.delete(KEY_SHARES);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::plan::test::{finish, test_changes, update_ctx, wire};
    use serde_json::json;

    fn plan(desired: &QemuMemory, current: &QemuMemory) -> (Value, bool) {
        let mut changes = test_changes();
        QemuMemory::plan(desired, Some(current), &update_ctx(), &mut changes)
            .unwrap();
        let change = finish(changes);
        (Value::Object(change.request_body()), change.reboot_required())
    }

    fn memory(
        capacity: Option<u32>,
        minimum: Option<u32>,
        shares: Option<u16>,
    ) -> QemuMemory {
        QemuMemory {
            capacity_mib: capacity,
            minimum_capacity_mib: minimum,
            shares,
        }
    }

    #[test]
    fn growing_memory_is_live() {
        let current = memory(Some(1024), None, None);
        let desired = memory(Some(2048), None, None);
        assert_eq!(
            plan(&desired, &current),
            (json!({ "memory": 2048 }), false)
        );
    }

    #[test]
    fn shrinking_memory_needs_reboot() {
        let current = memory(Some(2048), None, None);
        let desired = memory(Some(1024), None, None);
        assert_eq!(
            plan(&desired, &current),
            (json!({ "memory": 1024 }), true)
        );
    }

    #[test]
    fn unchanged_memory_is_empty() {
        let current = memory(Some(4096), Some(2048), Some(500));
        assert_eq!(plan(&current, &current), (json!({}), false));
    }

    #[test]
    fn disabling_balloon_drops_shares() {
        let current = memory(Some(4096), Some(2048), Some(500));
        assert_eq!(
            plan(&memory(None, Some(4096), None), &current),
            (json!({ "balloon": 4096, "delete": "shares" }), false)
        );
    }

    #[test]
    fn zero_shares_are_deleted() {
        let current = memory(Some(4096), Some(2048), Some(500));
        assert_eq!(
            plan(&memory(None, None, Some(0)), &current),
            (json!({ "delete": "shares" }), false)
        );
    }

    #[test]
    fn validation_rules() {
        assert_eq!(
            memory(Some(8), None, None).validate(None),
            Err(ValidationError::MemoryCapacityOutOfRange(8))
        );
        assert_eq!(
            memory(Some(1024), Some(2048), None).validate(None),
            Err(ValidationError::MemoryMinimumExceedsCapacity {
                minimum: 2048,
                capacity: 1024
            })
        );
        assert_eq!(
            memory(Some(1024), None, Some(60_000)).validate(None),
            Err(ValidationError::MemorySharesOutOfRange(60_000))
        );
        assert_eq!(
            memory(Some(1024), Some(1024), Some(100)).validate(None),
            Err(ValidationError::MemorySharesWithoutBallooning)
        );
        assert_eq!(
            memory(Some(1024), Some(512), Some(100)).validate(None),
            Ok(())
        );

        // The balloon may come from the current configuration.
        let current = memory(Some(4096), Some(1024), None);
        let desired = memory(None, None, Some(100));
        assert_eq!(desired.validate(Some(&current)), Ok(()));
    }

    #[test]
    fn decode_from_wire() {
        let cfg = wire(json!({ "memory": "2048", "balloon": 1024.0 }));
        assert_eq!(
            QemuMemory::from_wire(&cfg).unwrap(),
            Some(memory(Some(2048), Some(1024), None))
        );

        let cfg = wire(json!({ "memory": "current=4096" }));
        assert_eq!(
            QemuMemory::from_wire(&cfg).unwrap(),
            Some(memory(Some(4096), None, None))
        );

        let cfg = wire(json!({ "memory": "lots" }));
        assert!(QemuMemory::from_wire(&cfg).is_err());
        assert_eq!(QemuMemory::from_wire(&WireConfig::new()).unwrap(), None);
    }
}
