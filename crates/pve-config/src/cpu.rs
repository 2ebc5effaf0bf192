// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtual CPU topology, model, feature flags and host affinity.

use std::collections::BTreeSet;

use pve_types::PveVersion;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::plan::{plan_scalar, Changes, PlanContext};
use crate::wire::segment::{SegmentBuilder, Segments};
use crate::wire::{self, bool_value, WireConfig};
use crate::{ValidationError, WireError};

const KEY_AFFINITY: &str = "affinity";
const KEY_CORES: &str = "cores";
const KEY_CPU: &str = "cpu";
const KEY_LIMIT: &str = "cpulimit";
const KEY_NUMA: &str = "numa";
const KEY_SOCKETS: &str = "sockets";
const KEY_UNITS: &str = "cpuunits";
const KEY_VCPUS: &str = "vcpus";

pub const MAX_CORES: u16 = 128;
pub const MAX_SOCKETS: u8 = 4;
pub const MAX_LIMIT: u8 = 128;
pub const MAX_UNITS: u32 = 262_144;

/// The CPU settings of a guest.
///
/// Every field is optional: on update, an absent field keeps the guest's
/// current value. A `limit`, `units` or `virtual_cores` of zero clears the
/// setting.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(default, deny_unknown_fields)]
pub struct QemuCpu {
    /// Host CPUs the guest's vCPU threads may run on.
    pub affinity: Option<BTreeSet<u16>>,
    pub cores: Option<u16>,
    pub flags: Option<CpuFlags>,
    pub limit: Option<u8>,
    pub numa: Option<bool>,
    pub sockets: Option<u8>,
    #[serde(rename = "type")]
    pub cpu_type: Option<String>,
    pub units: Option<u32>,
    pub virtual_cores: Option<u16>,
}

/// The state of a single CPU feature flag.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum FlagState {
    Enabled,
    Disabled,
    /// Removes the flag, leaving the CPU model's default in effect.
    Unset,
}

/// The CPU feature flags that may be toggled on a guest's CPU model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuFlag {
    MdClear,
    Pcid,
    SpecCtrl,
    Ssbd,
    Ibpb,
    VirtSsbd,
    AmdSsbd,
    AmdNoSsb,
    Pdpe1gb,
    HvTlbflush,
    HvEvmcs,
    Aes,
}

impl CpuFlag {
    /// Every flag, in the order flags are rendered on the wire.
    pub const ALL: [CpuFlag; 12] = [
        CpuFlag::MdClear,
        CpuFlag::Pcid,
        CpuFlag::SpecCtrl,
        CpuFlag::Ssbd,
        CpuFlag::Ibpb,
        CpuFlag::VirtSsbd,
        CpuFlag::AmdSsbd,
        CpuFlag::AmdNoSsb,
        CpuFlag::Pdpe1gb,
        CpuFlag::HvTlbflush,
        CpuFlag::HvEvmcs,
        CpuFlag::Aes,
    ];

    pub fn name(self) -> &'static str {
        match self {
            CpuFlag::MdClear => "md-clear",
            CpuFlag::Pcid => "pcid",
            CpuFlag::SpecCtrl => "spec-ctrl",
            CpuFlag::Ssbd => "ssbd",
            CpuFlag::Ibpb => "ibpb",
            CpuFlag::VirtSsbd => "virt-ssbd",
            CpuFlag::AmdSsbd => "amd-ssbd",
            CpuFlag::AmdNoSsb => "amd-no-ssb",
            CpuFlag::Pdpe1gb => "pdpe1gb",
            CpuFlag::HvTlbflush => "hv-tlbflush",
            CpuFlag::HvEvmcs => "hv-evmcs",
            CpuFlag::Aes => "aes",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|flag| flag.name() == name)
    }
}

/// Tri-state CPU feature flags. An absent flag keeps its current state.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(default, deny_unknown_fields)]
pub struct CpuFlags {
    pub aes: Option<FlagState>,
    pub amd_no_ssb: Option<FlagState>,
    pub amd_ssbd: Option<FlagState>,
    pub hv_evmcs: Option<FlagState>,
    pub hv_tlbflush: Option<FlagState>,
    pub ibpb: Option<FlagState>,
    pub md_clear: Option<FlagState>,
    pub pcid: Option<FlagState>,
    pub pdpe1gb: Option<FlagState>,
    pub spec_ctrl: Option<FlagState>,
    pub ssbd: Option<FlagState>,
    pub virt_ssbd: Option<FlagState>,
}

impl CpuFlags {
    pub fn get(&self, flag: CpuFlag) -> Option<FlagState> {
        *self.slot(flag)
    }

    pub fn set(&mut self, flag: CpuFlag, state: Option<FlagState>) {
        *self.slot_mut(flag) = state;
    }

    fn slot(&self, flag: CpuFlag) -> &Option<FlagState> {
        match flag {
            CpuFlag::MdClear => &self.md_clear,
            CpuFlag::Pcid => &self.pcid,
            CpuFlag::SpecCtrl => &self.spec_ctrl,
            CpuFlag::Ssbd => &self.ssbd,
            CpuFlag::Ibpb => &self.ibpb,
            CpuFlag::VirtSsbd => &self.virt_ssbd,
            CpuFlag::AmdSsbd => &self.amd_ssbd,
            CpuFlag::AmdNoSsb => &self.amd_no_ssb,
            CpuFlag::Pdpe1gb => &self.pdpe1gb,
            CpuFlag::HvTlbflush => &self.hv_tlbflush,
            CpuFlag::HvEvmcs => &self.hv_evmcs,
            CpuFlag::Aes => &self.aes,
        }
    }

    fn slot_mut(&mut self, flag: CpuFlag) -> &mut Option<FlagState> {
        match flag {
            CpuFlag::MdClear => &mut self.md_clear,
            CpuFlag::Pcid => &mut self.pcid,
            CpuFlag::SpecCtrl => &mut self.spec_ctrl,
            CpuFlag::Ssbd => &mut self.ssbd,
            CpuFlag::Ibpb => &mut self.ibpb,
            CpuFlag::VirtSsbd => &mut self.virt_ssbd,
            CpuFlag::AmdSsbd => &mut self.amd_ssbd,
            CpuFlag::AmdNoSsb => &mut self.amd_no_ssb,
            CpuFlag::Pdpe1gb => &mut self.pdpe1gb,
            CpuFlag::HvTlbflush => &mut self.hv_tlbflush,
            CpuFlag::HvEvmcs => &mut self.hv_evmcs,
            CpuFlag::Aes => &mut self.aes,
        }
    }

    /// Applies every flag set in `other` on top of `self`.
    fn overlay(&mut self, other: &CpuFlags) {
        for flag in CpuFlag::ALL {
            if let Some(state) = other.get(flag) {
                self.set(flag, Some(state));
            }
        }
    }

    /// Renders the `flags=` option value, or `None` if no flag is on or off.
    fn render(&self) -> Option<String> {
        let rendered: Vec<String> = CpuFlag::ALL
            .into_iter()
            .filter_map(|flag| match self.get(flag) {
                Some(FlagState::Enabled) => Some(format!("+{}", flag.name())),
                Some(FlagState::Disabled) => Some(format!("-{}", flag.name())),
                Some(FlagState::Unset) | None => None,
            })
            .collect();
        if rendered.is_empty() {
            None
        } else {
            Some(rendered.join(";"))
        }
    }

    fn parse(s: &str) -> Self {
        let mut flags = CpuFlags::default();
        for item in s.split(';').map(str::trim).filter(|i| !i.is_empty()) {
            let (state, name) = if let Some(name) = item.strip_prefix('+') {
                (FlagState::Enabled, name)
            } else if let Some(name) = item.strip_prefix('-') {
                (FlagState::Disabled, name)
            } else {
                (FlagState::Enabled, item)
            };
            // Flags this crate doesn't model are dropped.
            if let Some(flag) = CpuFlag::from_name(name) {
                flags.set(flag, Some(state));
            }
        }
        flags
    }
}

const ANY_VERSION: PveVersion = PveVersion::new(0, 0, 0);
const X86_64_LEVELS: PveVersion = PveVersion::new(8, 0, 0);

/// Known CPU models and the first version that offers each.
const CPU_TYPES: &[(&str, PveVersion)] = &[
    ("486", ANY_VERSION),
    ("athlon", ANY_VERSION),
    ("Broadwell", ANY_VERSION),
    ("Broadwell-IBRS", ANY_VERSION),
    ("Broadwell-noTSX", ANY_VERSION),
    ("Broadwell-noTSX-IBRS", ANY_VERSION),
    ("Cascadelake-Server", ANY_VERSION),
    ("Cascadelake-Server-noTSX", ANY_VERSION),
    ("Cascadelake-Server-v2", ANY_VERSION),
    ("Cascadelake-Server-v4", ANY_VERSION),
    ("Cascadelake-Server-v5", ANY_VERSION),
    ("Conroe", ANY_VERSION),
    ("Cooperlake", ANY_VERSION),
    ("Cooperlake-v2", ANY_VERSION),
    ("core2duo", ANY_VERSION),
    ("coreduo", ANY_VERSION),
    ("EPYC", ANY_VERSION),
    ("EPYC-Genoa", PveVersion::new(8, 2, 0)),
    ("EPYC-IBPB", ANY_VERSION),
    ("EPYC-Milan", ANY_VERSION),
    ("EPYC-Milan-v2", ANY_VERSION),
    ("EPYC-Rome", ANY_VERSION),
    ("EPYC-Rome-v2", ANY_VERSION),
    ("EPYC-Rome-v3", ANY_VERSION),
    ("EPYC-Rome-v4", ANY_VERSION),
    ("EPYC-v3", ANY_VERSION),
    ("EPYC-v4", ANY_VERSION),
    ("GraniteRapids", PveVersion::new(8, 2, 0)),
    ("Haswell", ANY_VERSION),
    ("Haswell-IBRS", ANY_VERSION),
    ("Haswell-noTSX", ANY_VERSION),
    ("Haswell-noTSX-IBRS", ANY_VERSION),
    ("host", ANY_VERSION),
    ("Icelake-Client", ANY_VERSION),
    ("Icelake-Client-noTSX", ANY_VERSION),
    ("Icelake-Server", ANY_VERSION),
    ("Icelake-Server-noTSX", ANY_VERSION),
    ("Icelake-Server-v3", ANY_VERSION),
    ("Icelake-Server-v4", ANY_VERSION),
    ("Icelake-Server-v5", ANY_VERSION),
    ("Icelake-Server-v6", ANY_VERSION),
    ("IvyBridge", ANY_VERSION),
    ("IvyBridge-IBRS", ANY_VERSION),
    ("KnightsMill", ANY_VERSION),
    ("kvm32", ANY_VERSION),
    ("kvm64", ANY_VERSION),
    ("max", ANY_VERSION),
    ("Nehalem", ANY_VERSION),
    ("Nehalem-IBRS", ANY_VERSION),
    ("Opteron_G1", ANY_VERSION),
    ("Opteron_G2", ANY_VERSION),
    ("Opteron_G3", ANY_VERSION),
    ("Opteron_G4", ANY_VERSION),
    ("Opteron_G5", ANY_VERSION),
    ("Penryn", ANY_VERSION),
    ("pentium", ANY_VERSION),
    ("pentium2", ANY_VERSION),
    ("pentium3", ANY_VERSION),
    ("phenom", ANY_VERSION),
    ("qemu32", ANY_VERSION),
    ("qemu64", ANY_VERSION),
    ("SandyBridge", ANY_VERSION),
    ("SandyBridge-IBRS", ANY_VERSION),
    ("SapphireRapids", ANY_VERSION),
    ("SapphireRapids-v2", PveVersion::new(8, 2, 0)),
    ("Skylake-Client", ANY_VERSION),
    ("Skylake-Client-IBRS", ANY_VERSION),
    ("Skylake-Client-noTSX-IBRS", ANY_VERSION),
    ("Skylake-Client-v4", ANY_VERSION),
    ("Skylake-Server", ANY_VERSION),
    ("Skylake-Server-IBRS", ANY_VERSION),
    ("Skylake-Server-noTSX-IBRS", ANY_VERSION),
    ("Skylake-Server-v4", ANY_VERSION),
    ("Skylake-Server-v5", ANY_VERSION),
    ("x86-64-v2", X86_64_LEVELS),
    ("x86-64-v2-AES", X86_64_LEVELS),
    ("x86-64-v3", X86_64_LEVELS),
    ("x86-64-v4", X86_64_LEVELS),
];

fn normalize_cpu_type(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Maps a CPU model name, in any of its informal spellings (`EPYC_ROME`,
/// `x86_64_v2_aes`), to its canonical name.
pub fn canonical_cpu_type(
    name: &str,
    version: PveVersion,
) -> Result<&'static str, ValidationError> {
    let wanted = normalize_cpu_type(name);
    let (canonical, since) = CPU_TYPES
        .iter()
        .find(|(candidate, _)| normalize_cpu_type(candidate) == wanted)
        .ok_or_else(|| ValidationError::CpuTypeUnknown(name.to_owned()))?;

    if !version.at_least(*since) {
        return Err(ValidationError::CpuTypeUnsupported {
            cpu_type: (*canonical).to_owned(),
            version,
        });
    }
    Ok(canonical)
}

/// The model the API assigns when none is configured.
pub fn default_cpu_type(version: PveVersion) -> &'static str {
    if version.at_least(X86_64_LEVELS) {
        "x86-64-v2-AES"
    } else {
        "kvm64"
    }
}

/// Renders a set of host CPU numbers in range notation, e.g. `0-3,8,10-11`.
pub fn compress_affinity(cpus: &BTreeSet<u16>) -> String {
    let mut ranges: Vec<(u16, u16)> = Vec::new();
    for &cpu in cpus {
        match ranges.last_mut() {
            Some((_, end)) if u32::from(*end) + 1 == u32::from(cpu) => {
                *end = cpu;
            }
            _ => ranges.push((cpu, cpu)),
        }
    }

    ranges
        .into_iter()
        .map(|(start, end)| {
            if start == end {
                start.to_string()
            } else {
                format!("{}-{}", start, end)
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Parses range notation into a set of host CPU numbers.
pub fn parse_affinity(s: &str) -> Result<BTreeSet<u16>, WireError> {
    let invalid = || WireError::InvalidOption {
        option: KEY_AFFINITY.to_owned(),
        value: s.to_owned(),
    };

    let mut cpus = BTreeSet::new();
    for item in s.split(',').map(str::trim).filter(|i| !i.is_empty()) {
        match item.split_once('-') {
            Some((start, end)) => {
                let start: u16 = start.trim().parse().map_err(|_| invalid())?;
                let end: u16 = end.trim().parse().map_err(|_| invalid())?;
                if start > end {
                    return Err(invalid());
                }
                cpus.extend(start..=end);
            }
            None => {
                cpus.insert(item.parse().map_err(|_| invalid())?);
            }
        }
    }
    Ok(cpus)
}

impl QemuCpu {
    pub(crate) fn from_wire(
        cfg: &WireConfig,
    ) -> Result<Option<Self>, WireError> {
        let affinity = wire::get_str(cfg, KEY_AFFINITY)?
            .map(|s| parse_affinity(&s))
            .transpose()
            .map_err(|e| e.in_field(KEY_AFFINITY))?;

        let (cpu_type, flags) = match wire::get_str(cfg, KEY_CPU)? {
            Some(value) => {
                let segments = Segments::parse(&value);
                let cpu_type = segments
                    .leading()
                    .or_else(|| segments.get("cputype"))
                    .map(str::to_owned);
                let flags = segments.get("flags").map(CpuFlags::parse);
                (cpu_type, flags)
            }
            None => (None, None),
        };

        let cpu = QemuCpu {
            affinity,
            cores: wire::get_int(cfg, KEY_CORES)?,
            flags,
            limit: wire::get_int(cfg, KEY_LIMIT)?,
            numa: wire::get_bool(cfg, KEY_NUMA)?,
            sockets: wire::get_int(cfg, KEY_SOCKETS)?,
            cpu_type,
            units: wire::get_int(cfg, KEY_UNITS)?,
            virtual_cores: wire::get_int(cfg, KEY_VCPUS)?,
        };

        Ok((cpu != QemuCpu::default()).then_some(cpu))
    }

    pub(crate) fn validate(
        &self,
        current: Option<&QemuCpu>,
        version: PveVersion,
    ) -> Result<(), ValidationError> {
        if let Some(cores) = self.cores {
            if !(1..=MAX_CORES).contains(&cores) {
                return Err(ValidationError::CpuCoresOutOfRange(cores));
            }
        }
        if let Some(sockets) = self.sockets {
            if !(1..=MAX_SOCKETS).contains(&sockets) {
                return Err(ValidationError::CpuSocketsOutOfRange(sockets));
            }
        }
        if let Some(limit) = self.limit {
            if limit > MAX_LIMIT {
                return Err(ValidationError::CpuLimitOutOfRange(limit));
            }
        }
        if let Some(units) = self.units {
            if units > MAX_UNITS {
                return Err(ValidationError::CpuUnitsOutOfRange(units));
            }
        }
        if let Some(cpu_type) = &self.cpu_type {
            canonical_cpu_type(cpu_type, version)?;
        }

        if let Some(vcpus) = self.virtual_cores.filter(|v| *v > 0) {
            let cores = self
                .cores
                .or_else(|| current.and_then(|c| c.cores))
                .unwrap_or(1);
            let sockets = self
                .sockets
                .or_else(|| current.and_then(|c| c.sockets))
                .unwrap_or(1);
            let total = u32::from(cores) * u32::from(sockets);
            if u32::from(vcpus) > total {
                return Err(ValidationError::CpuVirtualCoresExceedTotal {
                    vcpus,
                    total,
                });
            }
        }

        Ok(())
    }

    /// Renders the `cpu` field for a model and set of flags.
    fn render_model(
        cpu_type: Option<&str>,
        flags: &CpuFlags,
        version: PveVersion,
    ) -> Option<String> {
        let flags = flags.render();
        if cpu_type.is_none() && flags.is_none() {
            return None;
        }

        let mut builder = SegmentBuilder::new();
        builder
            .positional(cpu_type.unwrap_or(default_cpu_type(version)))
            .optional("flags", flags);
        Some(builder.build())
    }

    pub(crate) fn plan(
        desired: &QemuCpu,
        current: Option<&QemuCpu>,
        ctx: &PlanContext,
        changes: &mut Changes,
    ) -> Result<(), ValidationError> {
        fn nonzero<T: Copy + Default + PartialEq>(value: &T) -> Option<T> {
            (*value != T::default()).then_some(*value)
        }

        let reboot = plan_scalar(
            KEY_CORES,
            desired.cores.as_ref(),
            current.and_then(|c| c.cores.as_ref()),
            changes,
            |v| Some(*v),
        );
        changes.reboot_if(reboot);

        let reboot = plan_scalar(
            KEY_SOCKETS,
            desired.sockets.as_ref(),
            current.and_then(|c| c.sockets.as_ref()),
            changes,
            |v| Some(*v),
        );
        changes.reboot_if(reboot);

        let reboot = plan_scalar(
            KEY_NUMA,
            desired.numa.as_ref(),
            current.and_then(|c| c.numa.as_ref()),
            changes,
            |v| Some(bool_value(*v)),
        );
        changes.reboot_if(reboot);

        plan_scalar(
            KEY_LIMIT,
            desired.limit.as_ref(),
            current.and_then(|c| c.limit.as_ref()),
            changes,
            nonzero,
        );
        plan_scalar(
            KEY_UNITS,
            desired.units.as_ref(),
            current.and_then(|c| c.units.as_ref()),
            changes,
            nonzero,
        );
        plan_scalar(
            KEY_VCPUS,
            desired.virtual_cores.as_ref(),
            current.and_then(|c| c.virtual_cores.as_ref()),
            changes,
            nonzero,
        );

        if let Some(affinity) = &desired.affinity {
            // An empty set clears the affinity of an existing guest.
            let unchanged = match current.and_then(|c| c.affinity.as_ref()) {
                Some(current) => current == affinity,
                None => affinity.is_empty(),
            };
            if !unchanged {
                changes.set(KEY_AFFINITY, compress_affinity(affinity));
            }
        }

        if desired.cpu_type.is_some() || desired.flags.is_some() {
            let current_type = current.and_then(|c| c.cpu_type.as_deref()).map(
                |t| canonical_cpu_type(t, ctx.version).unwrap_or(t),
            );
            let current_flags = current
                .and_then(|c| c.flags.clone())
                .unwrap_or_default();

            let desired_type = match &desired.cpu_type {
                Some(t) => Some(canonical_cpu_type(t, ctx.version)?),
                None => current_type,
            };
            let mut desired_flags = current_flags.clone();
            if let Some(flags) = &desired.flags {
                desired_flags.overlay(flags);
            }

            let before =
                Self::render_model(current_type, &current_flags, ctx.version);
            let after =
                Self::render_model(desired_type, &desired_flags, ctx.version);
            if before != after {
                match after {
                    Some(value) => changes.set(KEY_CPU, value),
                    None => changes.delete(KEY_CPU),
                }
                changes.reboot_if(true);
            }
        }

        Ok(())
    }
}
