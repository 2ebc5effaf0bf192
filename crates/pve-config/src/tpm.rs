// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Emulated TPM state volume.
//!
//! The state volume is allocated once when the TPM is added. Moving it to
//! another storage goes through the volume APIs, so an existing TPM is never
//! rewritten here; it can only be added or removed.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::plan::{Changes, PlanContext};
use crate::wire::segment::{SegmentBuilder, Segments};
use crate::wire::{self, WireConfig};
use crate::{ValidationError, WireError};

const KEY_TPM: &str = "tpmstate0";

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    JsonSchema,
    strum::Display,
    strum::EnumString,
)]
pub enum TpmVersion {
    #[serde(rename = "v1.2")]
    #[strum(serialize = "v1.2")]
    V1_2,
    #[default]
    #[serde(rename = "v2.0")]
    #[strum(serialize = "v2.0")]
    V2_0,
}

#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(default, deny_unknown_fields)]
pub struct TpmState {
    pub storage: String,
    pub version: TpmVersion,
    /// Removes the TPM and its state volume.
    pub delete: bool,
}

impl TpmState {
    pub(crate) fn from_wire(
        cfg: &WireConfig,
    ) -> Result<Option<Self>, WireError> {
        let Some(value) = wire::get_str(cfg, KEY_TPM)? else {
            return Ok(None);
        };

        let segments = Segments::parse(&value);
        let storage = segments
            .leading()
            .and_then(|volume| volume.split_once(':'))
            .map(|(storage, _)| storage.to_owned())
            .ok_or_else(|| {
                WireError::MalformedVolume(value.clone()).in_field(KEY_TPM)
            })?;

        // The API predates TPM 2.0 support and omits the version for 1.2.
        let version = segments
            .parse_opt("version")
            .map_err(|e| e.in_field(KEY_TPM))?
            .unwrap_or(TpmVersion::V1_2);

        Ok(Some(TpmState { storage, version, delete: false }))
    }

    pub(crate) fn validate(
        &self,
        current: Option<&TpmState>,
    ) -> Result<(), ValidationError> {
        if self.delete {
            return Ok(());
        }
        if self.storage.is_empty() {
            return Err(ValidationError::TpmStorageRequired);
        }
        match current {
            Some(current) if current.version != self.version => {
                Err(ValidationError::TpmVersionChange {
                    current: current.version,
                    desired: self.version,
                })
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn plan(
        desired: &TpmState,
        current: Option<&TpmState>,
        _ctx: &PlanContext,
        changes: &mut Changes,
    ) -> Result<(), ValidationError> {
        match (desired.delete, current) {
            (true, Some(_)) => {
                changes.delete(KEY_TPM);
                changes.reboot_if(true);
            }
            (false, None) => {
                let mut builder = SegmentBuilder::new();
                builder
                    .positional(format!("{}:1", desired.storage))
                    .pair("version", desired.version);
                changes.set(KEY_TPM, builder.build());
                changes.reboot_if(true);
            }
            (true, None) | (false, Some(_)) => {}
        }
        Ok(())
    }
}
