// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The root configuration aggregate.

use std::collections::{BTreeMap, BTreeSet};

use pve_types::{NetSlot, PciSlot, PveVersion, SerialSlot, UsbSlot};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::trace;

use crate::agent::GuestAgent;
use crate::cloudinit::CloudInit;
use crate::cpu::QemuCpu;
use crate::disk::{self, IsoFile, QemuDisks};
use crate::memory::QemuMemory;
use crate::network::{self, NetworkInterface};
use crate::pci::{self, PciDevice};
use crate::plan::{plan_scalar, Changes, PlanContext};
use crate::serial::{self, SerialPort};
use crate::tags::{self, Tag};
use crate::tpm::TpmState;
use crate::usb::{self, UsbDevice};
use crate::wire::{self, bool_value, WireConfig};
use crate::{ValidationError, WireError};

const KEY_DESCRIPTION: &str = "description";
const KEY_NAME: &str = "name";
const KEY_ON_BOOT: &str = "onboot";
const KEY_POOL: &str = "pool";
const KEY_PROTECTION: &str = "protection";

const MAX_GUEST_NAME: usize = 128;
const MAX_POOL_NAME: usize = 64;
const MAX_MAPPING_NAME: usize = 128;

fn validate_guest_name(s: &str) -> Result<(), ValidationError> {
    let edge = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
    let valid = s.len() <= MAX_GUEST_NAME
        && edge(s.chars().next())
        && edge(s.chars().last())
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if !valid {
        return Err(ValidationError::GuestNameInvalid(s.to_owned()));
    }
    Ok(())
}

fn validate_pool_name(s: &str) -> Result<(), ValidationError> {
    let valid = !s.is_empty()
        && s.len() <= MAX_POOL_NAME
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(ValidationError::PoolNameInvalid(s.to_owned()));
    }
    Ok(())
}

fn validate_mapping_name(s: &str) -> Result<(), ValidationError> {
    let valid = s.len() <= MAX_MAPPING_NAME
        && s.starts_with(|c: char| c.is_ascii_alphabetic())
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(ValidationError::MappingNameInvalid(s.to_owned()));
    }
    Ok(())
}

validated_string!(
    /// A guest's DNS-style host name.
    GuestName,
    validate_guest_name
);

validated_string!(
    /// The resource pool a guest is placed in when created.
    PoolName,
    validate_pool_name
);

validated_string!(
    /// The name of a cluster-wide PCI or USB resource mapping.
    MappingName,
    validate_mapping_name
);

/// A guest's configuration.
///
/// Every field is optional: when planning an update, an absent field keeps
/// the guest's current setting for that category.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(default, deny_unknown_fields)]
pub struct Configuration {
    pub agent: Option<GuestAgent>,
    pub cloud_init: Option<CloudInit>,
    pub cpu: Option<QemuCpu>,
    /// Free-form notes. An empty string removes them.
    pub description: Option<String>,
    pub disks: Option<QemuDisks>,
    /// Installation media, attached as a CD-ROM on `ide2`.
    pub iso: Option<IsoFile>,
    pub memory: Option<QemuMemory>,
    pub name: Option<GuestName>,
    pub networks: Option<BTreeMap<NetSlot, NetworkInterface>>,
    pub on_boot: Option<bool>,
    pub pci_devices: Option<BTreeMap<PciSlot, PciDevice>>,
    /// Only applied when the guest is created.
    pub pool: Option<PoolName>,
    /// Prevents the guest and its disks from being removed.
    pub protection: Option<bool>,
    pub serials: Option<BTreeMap<SerialSlot, SerialPort>>,
    pub tags: Option<BTreeSet<Tag>>,
    pub tpm: Option<TpmState>,
    pub usbs: Option<BTreeMap<UsbSlot, UsbDevice>>,
}

impl Configuration {
    /// Decodes a guest's configuration as reported by the API.
    ///
    /// Keys this crate doesn't model are ignored. The result never has
    /// `iso` or `pool` set: installation media decodes as an `ide2` CD-ROM,
    /// and pool membership isn't part of a guest's configuration.
    pub fn from_wire(cfg: &WireConfig) -> Result<Self, WireError> {
        let name = wire::get_str(cfg, KEY_NAME)?
            .map(|name| name.parse::<GuestName>())
            .transpose()
            .map_err(|e| WireError::from(e).in_field(KEY_NAME))?;

        Ok(Configuration {
            agent: GuestAgent::from_wire(cfg)?,
            cloud_init: CloudInit::from_wire(cfg)?,
            cpu: QemuCpu::from_wire(cfg)?,
            description: wire::get_str(cfg, KEY_DESCRIPTION)?,
            disks: QemuDisks::from_wire(cfg)?,
            iso: None,
            memory: QemuMemory::from_wire(cfg)?,
            name,
            networks: network::from_wire(cfg)?,
            on_boot: wire::get_bool(cfg, KEY_ON_BOOT)?,
            pci_devices: pci::from_wire(cfg)?,
            pool: None,
            protection: wire::get_bool(cfg, KEY_PROTECTION)?,
            serials: serial::from_wire(cfg)?,
            tags: tags::from_wire(cfg)?,
            tpm: TpmState::from_wire(cfg)?,
            usbs: usb::from_wire(cfg)?,
        })
    }

    /// Checks the configuration, as a whole, against every rule. `current`
    /// is the configuration being updated; settings the desired
    /// configuration leaves out are taken from it where a rule spans
    /// several settings.
    pub fn validate(
        &self,
        current: Option<&Configuration>,
        version: PveVersion,
    ) -> Result<(), ValidationError> {
        if let Some(cpu) = &self.cpu {
            cpu.validate(current.and_then(|c| c.cpu.as_ref()), version)?;
        }
        if let Some(memory) = &self.memory {
            memory.validate(current.and_then(|c| c.memory.as_ref()))?;
        }
        if let Some(iso) = &self.iso {
            iso.validate("ide2")?;
        }
        if let Some(disks) = &self.disks {
            disks.validate()?;
            if self.iso.is_some() && disks.uses_media_slot() {
                return Err(ValidationError::IsoConflictsWithIde2);
            }
        }
        if let Some(networks) = &self.networks {
            let current = current.and_then(|c| c.networks.as_ref());
            for (slot, nic) in networks {
                nic.validate(*slot, current.and_then(|c| c.get(slot)))?;
            }
        }
        if let Some(cloud_init) = &self.cloud_init {
            cloud_init.validate(version)?;
            for slot in cloud_init.ipconfig.iter().flat_map(|m| m.keys()) {
                if !self.has_interface(*slot, current) {
                    return Err(
                        ValidationError::CloudInitNetworkWithoutInterface(
                            *slot,
                        ),
                    );
                }
            }
        }
        if let Some(tpm) = &self.tpm {
            tpm.validate(current.and_then(|c| c.tpm.as_ref()))?;
        }
        Ok(())
    }

    /// Whether the guest will have a network interface in `slot` once this
    /// configuration is applied on top of `current`.
    fn has_interface(
        &self,
        slot: NetSlot,
        current: Option<&Configuration>,
    ) -> bool {
        match self.networks.as_ref() {
            Some(networks) => {
                networks.get(&slot).is_some_and(|nic| !nic.delete)
            }
            None => current
                .and_then(|c| c.networks.as_ref())
                .is_some_and(|networks| networks.contains_key(&slot)),
        }
    }

    /// Records every wire change needed to move from `current` (or nothing,
    /// for a new guest) to this configuration.
    pub(crate) fn plan(
        &self,
        current: Option<&Configuration>,
        ctx: &PlanContext,
        changes: &mut Changes,
    ) -> Result<(), ValidationError> {
        if let Some(agent) = &self.agent {
            let current = current.and_then(|c| c.agent.as_ref());
            GuestAgent::plan(agent, current, ctx, changes)?;
        }
        if let Some(cloud_init) = &self.cloud_init {
            let current = current.and_then(|c| c.cloud_init.as_ref());
            CloudInit::plan(cloud_init, current, ctx, changes)?;
        }
        if let Some(cpu) = &self.cpu {
            let current = current.and_then(|c| c.cpu.as_ref());
            QemuCpu::plan(cpu, current, ctx, changes)?;
        }

        plan_scalar(
            KEY_DESCRIPTION,
            self.description.as_ref(),
            current.and_then(|c| c.description.as_ref()),
            changes,
            |description| {
                (!description.is_empty()).then(|| description.clone())
            },
        );

        disk::plan(
            self.disks.as_ref(),
            current.and_then(|c| c.disks.as_ref()),
            self.iso.as_ref(),
            ctx,
            changes,
        )?;

        if let Some(memory) = &self.memory {
            let current = current.and_then(|c| c.memory.as_ref());
            QemuMemory::plan(memory, current, ctx, changes)?;
        }

        plan_scalar(
            KEY_NAME,
            self.name.as_ref(),
            current.and_then(|c| c.name.as_ref()),
            changes,
            |name| Some(name.to_string()),
        );

        if let Some(networks) = &self.networks {
            let current = current.and_then(|c| c.networks.as_ref());
            network::plan(networks, current, ctx, changes)?;
        }

        plan_scalar(
            KEY_ON_BOOT,
            self.on_boot.as_ref(),
            current.and_then(|c| c.on_boot.as_ref()),
            changes,
            |on_boot| Some(bool_value(*on_boot)),
        );

        if let Some(pci_devices) = &self.pci_devices {
            let current = current.and_then(|c| c.pci_devices.as_ref());
            pci::plan(pci_devices, current, ctx, changes)?;
        }

        // Existing guests move between pools through the pool API.
        if let Some(pool) = &self.pool {
            if ctx.guest.is_none() {
                changes.set(KEY_POOL, pool.to_string());
            } else {
                trace!(changes.log(), "ignoring pool of existing guest";
                    "pool" => pool.as_str());
            }
        }

        plan_scalar(
            KEY_PROTECTION,
            self.protection.as_ref(),
            current.and_then(|c| c.protection.as_ref()),
            changes,
            |protection| Some(bool_value(*protection)),
        );

        if let Some(serials) = &self.serials {
            let current = current.and_then(|c| c.serials.as_ref());
            serial::plan(serials, current, ctx, changes)?;
        }
        if let Some(tags) = &self.tags {
            tags::plan(tags, current.and_then(|c| c.tags.as_ref()), changes);
        }
        if let Some(tpm) = &self.tpm {
            let current = current.and_then(|c| c.tpm.as_ref());
            TpmState::plan(tpm, current, ctx, changes)?;
        }
        if let Some(usbs) = &self.usbs {
            let current = current.and_then(|c| c.usbs.as_ref());
            usb::plan(usbs, current, ctx, changes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cloudinit::CloudInitIpConfig;
    use crate::disk::{CdRom, Disk, DiskFormat, DiskOptions, DiskSlot};
    use crate::plan::test::{test_log, wire};
    use crate::usb::UsbSource;
    use crate::{ChangePlanner, ConfigChange, GuestId};
    use pve_types::{units, IdeSlot};
    use serde_json::{json, Value};

    fn planner() -> ChangePlanner {
        ChangePlanner::new(&test_log(), PveVersion::new(8, 1, 0))
    }

    fn guest() -> GuestId {
        GuestId::new(100).unwrap()
    }

    fn body(change: &ConfigChange) -> Value {
        Value::Object(change.request_body())
    }

    fn update(
        desired: &Configuration,
        current: &Configuration,
    ) -> (Value, bool) {
        let change = planner().plan_update(guest(), desired, current).unwrap();
        (body(&change), change.reboot_required())
    }

    #[test]
    fn guest_names() {
        const TEST_CASES: &[(&str, bool)] = &[
            ("web", true),
            ("web-01.example.com", true),
            ("9lives", true),
            ("", false),
            ("-web", false),
            ("web.", false),
            ("web_01", false),
        ];
        for (name, valid) in TEST_CASES {
            assert_eq!(name.parse::<GuestName>().is_ok(), *valid, "{}", name);
        }
        assert!("a".repeat(MAX_GUEST_NAME).parse::<GuestName>().is_ok());
        assert!("a".repeat(MAX_GUEST_NAME + 1).parse::<GuestName>().is_err());
    }

    #[test]
    fn pool_and_mapping_names() {
        assert!("prod_pool-2".parse::<PoolName>().is_ok());
        assert_eq!(
            "prod.pool".parse::<PoolName>(),
            Err(ValidationError::PoolNameInvalid("prod.pool".to_owned()))
        );
        assert!("a".repeat(MAX_POOL_NAME + 1).parse::<PoolName>().is_err());

        assert!("gpu-0".parse::<MappingName>().is_ok());
        assert!("0gpu".parse::<MappingName>().is_err());
        assert!("gpu 0".parse::<MappingName>().is_err());
    }

    #[test]
    fn memory_increase() {
        let current = Configuration {
            memory: Some(QemuMemory {
                capacity_mib: Some(1024),
                ..Default::default()
            }),
            ..Default::default()
        };
        let desired = Configuration {
            memory: Some(QemuMemory {
                capacity_mib: Some(2048),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            update(&desired, &current),
            (json!({ "memory": 2048 }), false)
        );
    }

    #[test]
    fn create_with_disk_and_affinity() {
        let desired = Configuration {
            cpu: Some(QemuCpu {
                affinity: Some([0, 1, 2, 2, 3].into_iter().collect()),
                ..Default::default()
            }),
            disks: Some(QemuDisks {
                ide: Some(
                    [(
                        IdeSlot::new(0).unwrap(),
                        DiskSlot::Disk(Disk {
                            storage: "Test".to_owned(),
                            size_kib: 33_554_432,
                            format: DiskFormat::Raw,
                            id: None,
                            linked: None,
                            syntax: None,
                            base_image: false,
                            volume: None,
                            options: DiskOptions::default(),
                        }),
                    )]
                    .into(),
                ),
                ..Default::default()
            }),
            pool: Some("prod".parse().unwrap()),
            ..Default::default()
        };
        let change = planner().plan_create(&desired).unwrap();
        assert_eq!(
            body(&change),
            json!({
                "affinity": "0-3",
                "ide0": "Test:32,backup=0,replicate=0",
                "pool": "prod",
            })
        );
        assert!(!change.reboot_required());
    }

    #[test]
    fn removing_usb_device() {
        let current = Configuration::from_wire(&wire(json!({
            "usb0": "host=046d:c52b",
        })))
        .unwrap();
        let desired =
            Configuration { usbs: Some(BTreeMap::new()), ..Default::default() };
        assert_eq!(
            update(&desired, &current),
            (json!({ "delete": "usb0" }), false)
        );
    }

    #[test]
    fn general_fields() {
        let current = Configuration::from_wire(&wire(json!({
            "name": "web",
            "description": "front end",
            "onboot": 1,
            "protection": 0,
        })))
        .unwrap();
        assert_eq!(current.name, Some("web".parse().unwrap()));
        assert_eq!(current.on_boot, Some(true));
        assert_eq!(current.protection, Some(false));

        let desired = Configuration {
            description: Some(String::new()),
            name: Some("web-2".parse().unwrap()),
            on_boot: Some(true),
            pool: Some("prod".parse().unwrap()),
            protection: Some(true),
            ..Default::default()
        };
        assert_eq!(
            update(&desired, &current),
            (
                json!({
                    "name": "web-2",
                    "protection": 1,
                    "delete": "description",
                }),
                false
            )
        );
    }

    #[test]
    fn iso_and_ide2_conflict() {
        let iso = IsoFile {
            storage: "local".to_owned(),
            file: "install.iso".to_owned(),
            size_kib: None,
        };
        let mut desired = Configuration {
            iso: Some(iso),
            disks: Some(QemuDisks {
                ide: Some(
                    [(IdeSlot::MEDIA, DiskSlot::CdRom(CdRom::Physical))].into(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            planner().plan_create(&desired),
            Err(ValidationError::IsoConflictsWithIde2)
        );

        desired.disks = None;
        let change = planner().plan_create(&desired).unwrap();
        assert_eq!(
            body(&change),
            json!({ "ide2": "local:iso/install.iso,media=cdrom" })
        );
    }

    #[test]
    fn ipconfig_needs_an_interface() {
        let slot = NetSlot::new(1).unwrap();
        let desired = Configuration {
            cloud_init: Some(CloudInit {
                ipconfig: Some(
                    [(
                        slot,
                        CloudInitIpConfig {
                            ipv4_dhcp: true,
                            ..Default::default()
                        },
                    )]
                    .into(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            planner().plan_create(&desired),
            Err(ValidationError::CloudInitNetworkWithoutInterface(slot))
        );

        let current = Configuration::from_wire(&wire(json!({
            "net1": "virtio=BC:24:11:AA:00:01,bridge=vmbr0",
        })))
        .unwrap();
        assert_eq!(
            update(&desired, &current),
            (json!({ "ipconfig1": "ip=dhcp" }), false)
        );

        let mut removing = desired.clone();
        removing.networks = Some(
            [(slot, NetworkInterface { delete: true, ..Default::default() })]
                .into(),
        );
        assert_eq!(
            planner().plan_update(guest(), &removing, &current),
            Err(ValidationError::CloudInitNetworkWithoutInterface(slot))
        );
    }

    #[test]
    fn reboot_is_or_reduced() {
        let current = Configuration::from_wire(&wire(json!({
            "memory": 2048,
            "tags": "a",
        })))
        .unwrap();
        let desired = Configuration {
            memory: Some(QemuMemory {
                capacity_mib: Some(1024),
                ..Default::default()
            }),
            tags: Some(BTreeSet::new()),
            ..Default::default()
        };
        assert_eq!(
            update(&desired, &current),
            (json!({ "memory": 1024, "delete": "tags" }), true)
        );
    }

    #[test]
    fn decoded_configuration_has_no_self_diff() {
        let current = Configuration::from_wire(&wire(json!({
            "affinity": "0-3,8",
            "agent": "1,type=virtio",
            "balloon": 1024,
            "boot": "order=scsi0;ide2",
            "ciuser": "admin",
            "cores": 4,
            "cpu": "host",
            "description": "front end",
            "digest": "4b6f1cbbc3cb3ad5f6ff3b1b1d2a4f2bbd8e0f14",
            "ide2": "local:iso/debian-12.iso,media=cdrom,size=614400K",
            "ide3": "local-lvm:vm-100-cloudinit,media=cdrom",
            "ipconfig0": "ip=10.0.0.5/24,gw=10.0.0.1",
            "memory": "4096",
            "name": "web",
            "net0": "virtio=BC:24:11:AA:00:01,bridge=vmbr0,firewall=1",
            "onboot": 1,
            "scsi0": "local-lvm:vm-100-disk-0,iothread=1,size=32G",
            "scsihw": "virtio-scsi-single",
            "serial0": "socket",
            "smbios1": "uuid=0b3c5d5e-3b5e-4bb6-8f4b-3d7e3b1e0c52",
            "sockets": 1,
            "tags": "prod;web",
            "tpmstate0": "local-lvm:vm-100-disk-1,size=4M,version=v2.0",
            "usb0": "host=046d:c52b,usb3=1",
        })))
        .unwrap();
        assert!(current.disks.is_some());
        assert!(current.cloud_init.is_some());

        assert_eq!(update(&current, &current), (json!({}), false));
        assert!(planner()
            .plan_update(guest(), &Configuration::default(), &current)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn template_disks_decode_with_the_rest() {
        let current = Configuration::from_wire(&wire(json!({
            "memory": 2048,
            "scsi0": "local-lvm:base-100-disk-0,size=8G",
            "scsi1": "local:custom-name.qcow2,size=8G",
            "template": 1,
        })))
        .unwrap();
        let memory = current.memory.as_ref().and_then(|m| m.capacity_mib);
        assert_eq!(memory, Some(2048));
        let scsi = current
            .disks
            .as_ref()
            .and_then(|d| d.scsi.as_ref())
            .unwrap();
        assert_eq!(scsi.len(), 2);

        assert_eq!(update(&current, &current), (json!({}), false));
    }

    #[test]
    fn json_shape() {
        let desired: Configuration = serde_json::from_value(json!({
            "name": "web",
            "memory": { "capacity_mib": 2048 },
            "disks": {
                "scsi": {
                    "0": {
                        "type": "disk",
                        "drive": {
                            "storage": "local-lvm",
                            "size_kib": units::GIBIBYTE,
                            "id": null,
                            "linked": null,
                            "syntax": null,
                        },
                    },
                },
            },
            "usbs": {
                "1": { "source": { "type": "spice" } },
            },
        }))
        .unwrap();
        let usbs = desired.usbs.as_ref().unwrap();
        assert_eq!(usbs[&UsbSlot::new(1).unwrap()].source, UsbSource::Spice);

        let change = planner().plan_create(&desired).unwrap();
        assert_eq!(
            body(&change),
            json!({
                "memory": 2048,
                "name": "web",
                "scsi0": "local-lvm:1,backup=0,replicate=0",
                "usb1": "host=spice",
            })
        );

        let unknown = serde_json::from_value::<Configuration>(json!({
            "hostname": "web",
        }));
        assert!(unknown.is_err());
        let bad_name = serde_json::from_value::<Configuration>(json!({
            "name": "web_01",
        }));
        assert!(bad_name.is_err());
    }
}
