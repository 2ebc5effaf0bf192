// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The QEMU guest agent channel.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::plan::{Changes, PlanContext};
use crate::wire::segment::{SegmentBuilder, Segments};
use crate::wire::{self, WireConfig};
use crate::{ValidationError, WireError};

const KEY_AGENT: &str = "agent";

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    JsonSchema,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AgentType {
    Isa,
    Virtio,
}

/// Guest agent settings. Absent fields keep their current value.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(default, deny_unknown_fields)]
pub struct GuestAgent {
    pub enabled: Option<bool>,
    pub agent_type: Option<AgentType>,
    /// Freeze guest filesystems while a backup snapshot is taken.
    pub freeze_fs_on_backup: Option<bool>,
    /// Trim disks after they are moved or cloned.
    pub fstrim_cloned_disks: Option<bool>,
}

impl GuestAgent {
    pub(crate) fn from_wire(
        cfg: &WireConfig,
    ) -> Result<Option<Self>, WireError> {
        let Some(value) = wire::get_str(cfg, KEY_AGENT)? else {
            return Ok(None);
        };

        let segments = Segments::parse(&value);
        let decode = || -> Result<GuestAgent, WireError> {
            let enabled = match segments.leading() {
                Some(leading) => Some(wire::parse_bool(leading).ok_or_else(
                    || WireError::InvalidOption {
                        option: "enabled".to_owned(),
                        value: leading.to_owned(),
                    },
                )?),
                None => segments.flag("enabled")?,
            };
            Ok(GuestAgent {
                enabled,
                agent_type: segments.parse_opt("type")?,
                freeze_fs_on_backup: segments.flag("freeze-fs-on-backup")?,
                fstrim_cloned_disks: segments.flag("fstrim_cloned_disks")?,
            })
        };
        decode().map(Some).map_err(|e| e.in_field(KEY_AGENT))
    }

    fn merged(&self, current: Option<&GuestAgent>) -> GuestAgent {
        let current = current.cloned().unwrap_or_default();
        GuestAgent {
            enabled: self.enabled.or(current.enabled),
            agent_type: self.agent_type.or(current.agent_type),
            freeze_fs_on_backup: self
                .freeze_fs_on_backup
                .or(current.freeze_fs_on_backup),
            fstrim_cloned_disks: self
                .fstrim_cloned_disks
                .or(current.fstrim_cloned_disks),
        }
    }

    fn render(&self) -> String {
        let freeze = self.freeze_fs_on_backup.map(u8::from);
        let fstrim = self.fstrim_cloned_disks.map(u8::from);

        let mut builder = SegmentBuilder::new();
        builder
            .positional(u8::from(self.enabled.unwrap_or(false)))
            .optional("freeze-fs-on-backup", freeze)
            .optional("fstrim_cloned_disks", fstrim)
            .optional("type", self.agent_type);
        builder.build()
    }

    /// Any change to the agent channel takes effect on the next boot.
    pub(crate) fn plan(
        desired: &GuestAgent,
        current: Option<&GuestAgent>,
        _ctx: &PlanContext,
        changes: &mut Changes,
    ) -> Result<(), ValidationError> {
        let after = desired.merged(current).render();
        let unchanged = match current {
            Some(current) => current.render() == after,
            None => *desired == GuestAgent::default(),
        };
        if !unchanged {
            changes.set(KEY_AGENT, after);
            changes.reboot_if(true);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::plan::test::{finish, test_changes, update_ctx, wire};
    use serde_json::{json, Value};

    fn plan(
        desired: &GuestAgent,
        current: Option<&GuestAgent>,
    ) -> (Value, bool) {
        let mut changes = test_changes();
        GuestAgent::plan(desired, current, &update_ctx(), &mut changes)
            .unwrap();
        let change = finish(changes);
        (Value::Object(change.request_body()), change.reboot_required())
    }

    #[test]
    fn enable_agent() {
        let agent = GuestAgent {
            enabled: Some(true),
            agent_type: Some(AgentType::Virtio),
            fstrim_cloned_disks: Some(true),
            ..Default::default()
        };
        assert_eq!(
            plan(&agent, None),
            (json!({ "agent": "1,fstrim_cloned_disks=1,type=virtio" }), true)
        );
    }

    #[test]
    fn partial_update_keeps_current_options() {
        let current = GuestAgent {
            enabled: Some(true),
            freeze_fs_on_backup: Some(false),
            ..Default::default()
        };
        let desired = GuestAgent {
            agent_type: Some(AgentType::Isa),
            ..Default::default()
        };
        assert_eq!(
            plan(&desired, Some(&current)),
            (json!({ "agent": "1,freeze-fs-on-backup=0,type=isa" }), true)
        );
        assert_eq!(plan(&current, Some(&current)), (json!({}), false));
    }

    #[test]
    fn decode_from_wire() {
        let cfg = wire(json!({
            "agent": "enabled=1,freeze-fs-on-backup=0,type=virtio"
        }));
        assert_eq!(
            GuestAgent::from_wire(&cfg).unwrap(),
            Some(GuestAgent {
                enabled: Some(true),
                agent_type: Some(AgentType::Virtio),
                freeze_fs_on_backup: Some(false),
                fstrim_cloned_disks: None,
            })
        );

        let cfg = wire(json!({ "agent": "0" }));
        assert_eq!(
            GuestAgent::from_wire(&cfg).unwrap().unwrap().enabled,
            Some(false)
        );

        let cfg = wire(json!({ "agent": "1,type=serial" }));
        assert!(GuestAgent::from_wire(&cfg).is_err());
    }
}
