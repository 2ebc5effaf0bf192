// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drives on the IDE, SATA, SCSI and VirtIO buses (`ide0`, `scsi3`, ...).
//!
//! Every bus slot holds one of four kinds of drive. New disks are requested
//! as `<storage>:<size in GiB>` and the API allocates a volume for them;
//! existing disks are referred to by their volume name, which is re-derived
//! from the volume's naming syntax and ID when the disk is updated.

use std::collections::BTreeMap;

use pve_types::units;
use pve_types::{IdeSlot, SataSlot, ScsiSlot, VirtioSlot};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::plan::{Changes, PlanContext, SlotUpdate};
use crate::wire::segment::{SegmentBuilder, Segments};
use crate::wire::{self, WireConfig};
use crate::{ValidationError, WireError};

mod options;
mod volume;

pub use options::{
    AsyncIo, DiskBandwidth, DiskCache, DiskFormat, DiskOptions, DiskSerial,
    Mbps, Wwn,
};
pub use volume::{DiskSyntax, LinkedDisk};

use volume::Volume;

/// The smallest disk the API will allocate, in kibibytes.
pub const MIN_DISK_SIZE_KIB: u64 = 4097;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DiskBus {
    Ide,
    Sata,
    Scsi,
    Virtio,
}

impl DiskBus {
    pub fn prefix(self) -> &'static str {
        match self {
            DiskBus::Ide => "ide",
            DiskBus::Sata => "sata",
            DiskBus::Scsi => "scsi",
            DiskBus::Virtio => "virtio",
        }
    }

    /// Whether drives on this bus can be attached, detached and retuned
    /// while the guest is running.
    pub fn hotplug(self) -> bool {
        matches!(self, DiskBus::Scsi | DiskBus::Virtio)
    }
}

fn validate_passthrough_path(s: &str) -> Result<(), ValidationError> {
    let valid = s.len() > 1
        && s.starts_with('/')
        && !s.contains(|c: char| c == ',' || c.is_whitespace());
    if !valid {
        return Err(ValidationError::DiskPassthroughPathInvalid(s.to_owned()));
    }
    Ok(())
}

validated_string!(
    /// A host block device, e.g. `/dev/disk/by-id/ata-ST1000DM003-1CH162`.
    PassthroughPath,
    validate_passthrough_path
);

/// An ISO image on a storage's `iso` content directory.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(deny_unknown_fields)]
pub struct IsoFile {
    pub storage: String,
    pub file: String,
    /// The image size as reported by the API. Ignored when comparing.
    #[serde(default)]
    pub size_kib: Option<u64>,
}

impl IsoFile {
    fn decode(
        volume: &str,
        segments: &Segments<'_>,
    ) -> Result<Self, WireError> {
        let malformed = || WireError::MalformedVolume(volume.to_owned());
        let (storage, path) = volume.split_once(':').ok_or_else(malformed)?;
        let file = path.strip_prefix("iso/").ok_or_else(malformed)?;
        let size_kib = segments
            .get("size")
            .map(units::parse_size)
            .transpose()?;
        Ok(IsoFile {
            storage: storage.to_owned(),
            file: file.to_owned(),
            size_kib,
        })
    }

    fn same_image(&self, other: &IsoFile) -> bool {
        self.storage == other.storage && self.file == other.file
    }

    pub(crate) fn validate(&self, drive: &str) -> Result<(), ValidationError> {
        if self.storage.is_empty() {
            return Err(ValidationError::CdRomIsoStorageRequired(
                drive.to_owned(),
            ));
        }
        if self.file.is_empty() {
            return Err(ValidationError::CdRomIsoFileRequired(
                drive.to_owned(),
            ));
        }
        Ok(())
    }
}

/// The media in a CD-ROM drive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, tag = "media", content = "image")]
#[serde(rename_all = "snake_case")]
pub enum CdRom {
    /// An empty drive.
    #[serde(rename = "none")]
    Empty,
    Iso(IsoFile),
    /// The host's physical drive.
    Physical,
}

impl CdRom {
    fn render(&self) -> String {
        let mut builder = SegmentBuilder::new();
        match self {
            CdRom::Empty => {
                builder.positional("none").pair("media", "cdrom");
            }
            CdRom::Iso(iso) => {
                let size = iso.size_kib.map(units::format_size);
                builder
                    .positional(format!("{}:iso/{}", iso.storage, iso.file))
                    .pair("media", "cdrom")
                    .optional("size", size);
            }
            CdRom::Physical => {
                builder.positional("cdrom").pair("media", "cdrom");
            }
        }
        builder.build()
    }

    fn same_media(&self, other: &CdRom) -> bool {
        match (self, other) {
            (CdRom::Iso(a), CdRom::Iso(b)) => a.same_image(b),
            (a, b) => a == b,
        }
    }
}

/// The drive holding the generated cloud-init configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CloudInitDisk {
    pub storage: String,
    #[serde(default)]
    pub format: DiskFormat,
}

impl CloudInitDisk {
    fn render(&self) -> String {
        let mut builder = SegmentBuilder::new();
        builder
            .positional(format!("{}:cloudinit", self.storage))
            .pair("format", self.format);
        builder.build()
    }
}

/// A disk image on a storage.
///
/// `id`, `linked`, `syntax`, `base_image` and `volume` describe an existing
/// volume and are filled in when a configuration is decoded. When updating,
/// they are taken from the current disk; setting `id` or `storage` to
/// something else moves the disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Disk {
    pub storage: String,
    pub size_kib: u64,
    #[serde(default)]
    pub format: DiskFormat,
    pub id: Option<u32>,
    pub linked: Option<LinkedDisk>,
    pub syntax: Option<DiskSyntax>,
    /// The disk is a template's base image (`base-<guest>-disk-<id>`).
    #[serde(default)]
    pub base_image: bool,
    /// The full volume name, kept only when it doesn't follow the usual
    /// naming and so can't be re-derived from `id`.
    #[serde(default)]
    pub volume: Option<String>,
    #[serde(default)]
    pub options: DiskOptions,
}

impl Disk {
    fn decode(
        volume: &str,
        segments: &Segments<'_>,
    ) -> Result<Self, WireError> {
        let size_kib = segments
            .get("size")
            .map(units::parse_size)
            .transpose()?
            .unwrap_or(0);
        let options = DiskOptions::decode(segments)?;

        let Ok(parsed) = Volume::parse(volume) else {
            let (storage, name) = volume.split_once(':').ok_or_else(|| {
                WireError::MalformedVolume(volume.to_owned())
            })?;
            return Ok(Disk {
                storage: storage.to_owned(),
                size_kib,
                format: image_format(name, segments)?,
                id: None,
                linked: None,
                syntax: None,
                base_image: false,
                volume: Some(volume.to_owned()),
                options,
            });
        };
        let format = match parsed.format {
            Some(format) => format,
            None => segments.parse_opt("format")?.unwrap_or_default(),
        };
        Ok(Disk {
            storage: parsed.storage,
            size_kib,
            format,
            id: Some(parsed.disk_id),
            linked: parsed.linked,
            syntax: Some(parsed.syntax),
            base_image: parsed.base_image,
            volume: None,
            options,
        })
    }

    /// Requests a new volume of the given size.
    fn render_new(&self) -> String {
        let format = (self.format != DiskFormat::Raw).then_some(self.format);
        let mut builder = SegmentBuilder::new();
        builder.positional(format!(
            "{}:{}",
            self.storage,
            units::format_gibibytes(self.size_kib)
        ));
        self.options.render(&mut builder, format, None);
        builder.build()
    }

    fn render_existing(&self, volume: &str, size_kib: u64) -> String {
        let mut builder = SegmentBuilder::new();
        builder.positional(volume);
        self.options.render(&mut builder, None, Some(size_kib));
        builder.build()
    }

    /// Re-renders the disk against `current`. A smaller size shrinks the
    /// disk; growing one isn't possible through a configuration update, so
    /// a larger size is ignored. A volume kept verbatim is re-rendered as
    /// is, and can only be moved when `id` names its new volume.
    fn render_update(
        &self,
        bus: DiskBus,
        drive: &str,
        current: &Disk,
        ctx: &PlanContext,
    ) -> Result<Option<SlotUpdate>, ValidationError> {
        let unknown = || ValidationError::DiskVolumeUnknown(drive.to_owned());
        let guest = || ctx.guest.ok_or_else(unknown);
        let syntax =
            current.syntax.or(self.syntax).unwrap_or(DiskSyntax::Volume);

        let before = match (&current.volume, current.id) {
            (Some(volume), _) => volume.clone(),
            (None, Some(disk_id)) => Volume {
                storage: current.storage.clone(),
                guest: guest()?,
                disk_id,
                syntax,
                linked: current.linked,
                base_image: current.base_image,
                format: Some(current.format),
            }
            .to_string(),
            (None, None) => return Err(unknown()),
        };
        let migrate = self.storage != current.storage
            || self.id.is_some_and(|id| Some(id) != current.id);
        let after = if migrate {
            Volume {
                storage: self.storage.clone(),
                guest: guest()?,
                disk_id: self.id.or(current.id).ok_or_else(unknown)?,
                syntax,
                linked: None,
                base_image: current.base_image,
                format: Some(current.format),
            }
            .to_string()
        } else {
            before.clone()
        };

        let size_kib = self.size_kib.min(current.size_kib);
        let value = self.render_existing(&after, size_kib);
        if value == current.render_existing(&before, current.size_kib) {
            return Ok(None);
        }

        let reboot = migrate
            || !bus.hotplug()
            || !self.options.differ_only_live(&current.options);
        Ok(Some(SlotUpdate { value, reboot }))
    }

    fn validate(
        &self,
        bus: DiskBus,
        drive: &str,
    ) -> Result<(), ValidationError> {
        if self.storage.is_empty() {
            return Err(ValidationError::DiskStorageRequired(drive.to_owned()));
        }
        if self.size_kib < MIN_DISK_SIZE_KIB {
            return Err(ValidationError::DiskSizeTooSmall {
                disk: drive.to_owned(),
                size: self.size_kib,
                minimum: MIN_DISK_SIZE_KIB,
            });
        }
        self.options.validate(bus, drive)
    }
}

/// The format named by an image's extension, else by `format=`.
fn image_format(
    name: &str,
    segments: &Segments<'_>,
) -> Result<DiskFormat, WireError> {
    let extension = name
        .rsplit_once('.')
        .and_then(|(_, ext)| ext.parse::<DiskFormat>().ok());
    match extension {
        Some(format) => Ok(format),
        None => Ok(segments.parse_opt("format")?.unwrap_or_default()),
    }
}

/// Whether a volume path names a cloud-init image, `vm-<guest>-cloudinit`
/// with an optional extension.
fn is_cloud_init_image(path: &str) -> bool {
    let image = path.rsplit('/').next().unwrap_or(path);
    let stem = image.split_once('.').map_or(image, |(stem, _)| stem);
    stem.strip_prefix("vm-")
        .and_then(|rest| rest.strip_suffix("-cloudinit"))
        .is_some_and(|guest| {
            !guest.is_empty() && guest.bytes().all(|b| b.is_ascii_digit())
        })
}

/// A host block device handed to the guest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PassthroughDisk {
    pub path: PassthroughPath,
    #[serde(default)]
    pub options: DiskOptions,
}

impl PassthroughDisk {
    fn render(&self) -> String {
        let mut builder = SegmentBuilder::new();
        builder.positional(&self.path);
        self.options.render(&mut builder, None, None);
        builder.build()
    }
}

/// The drive attached to one bus slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, tag = "type", content = "drive")]
#[serde(rename_all = "snake_case")]
pub enum DiskSlot {
    #[serde(rename = "cdrom")]
    CdRom(CdRom),
    CloudInit(CloudInitDisk),
    Disk(Disk),
    Passthrough(PassthroughDisk),
}

impl DiskSlot {
    fn decode(value: &str) -> Result<Self, WireError> {
        let segments = Segments::parse(value);
        let volume = segments
            .get("file")
            .or_else(|| segments.leading())
            .ok_or(WireError::MissingOption("file"))?;

        if segments.get("media") == Some("cdrom") {
            let cdrom = match volume {
                "none" => CdRom::Empty,
                "cdrom" => CdRom::Physical,
                _ => match volume.split_once(':') {
                    Some((storage, name)) if is_cloud_init_image(name) => {
                        return Ok(DiskSlot::CloudInit(CloudInitDisk {
                            storage: storage.to_owned(),
                            format: image_format(name, &segments)?,
                        }));
                    }
                    _ => CdRom::Iso(IsoFile::decode(volume, &segments)?),
                },
            };
            return Ok(DiskSlot::CdRom(cdrom));
        }

        if volume.starts_with('/') {
            return Ok(DiskSlot::Passthrough(PassthroughDisk {
                path: volume.parse()?,
                options: DiskOptions::decode(&segments)?,
            }));
        }

        Disk::decode(volume, &segments).map(DiskSlot::Disk)
    }

    fn render_new(&self) -> String {
        match self {
            DiskSlot::CdRom(cdrom) => cdrom.render(),
            DiskSlot::CloudInit(disk) => disk.render(),
            DiskSlot::Disk(disk) => disk.render_new(),
            DiskSlot::Passthrough(disk) => disk.render(),
        }
    }

    fn render_update(
        &self,
        bus: DiskBus,
        drive: &str,
        current: &DiskSlot,
        ctx: &PlanContext,
    ) -> Result<Option<SlotUpdate>, ValidationError> {
        let update = match (self, current) {
            // Media can always be swapped while the guest runs.
            (DiskSlot::CdRom(desired), DiskSlot::CdRom(current)) => {
                (!desired.same_media(current)).then(|| SlotUpdate {
                    value: desired.render(),
                    reboot: false,
                })
            }
            (DiskSlot::Disk(desired), DiskSlot::Disk(current)) => {
                return desired.render_update(bus, drive, current, ctx);
            }
            (
                DiskSlot::Passthrough(desired),
                DiskSlot::Passthrough(current),
            ) => {
                let value = desired.render();
                (value != current.render()).then(|| SlotUpdate {
                    value,
                    reboot: !bus.hotplug()
                        || desired.path != current.path
                        || !desired.options.differ_only_live(&current.options),
                })
            }
            (DiskSlot::CloudInit(desired), DiskSlot::CloudInit(current)) => {
                (desired != current).then(|| SlotUpdate {
                    value: desired.render(),
                    reboot: true,
                })
            }
            (desired, _) => Some(SlotUpdate {
                value: desired.render_new(),
                reboot: true,
            }),
        };
        Ok(update)
    }

    fn validate(
        &self,
        bus: DiskBus,
        drive: &str,
    ) -> Result<(), ValidationError> {
        match self {
            DiskSlot::CdRom(CdRom::Iso(iso)) => iso.validate(drive),
            DiskSlot::CdRom(_) => Ok(()),
            DiskSlot::CloudInit(disk) if disk.storage.is_empty() => Err(
                ValidationError::CloudInitDiskStorageRequired(drive.to_owned()),
            ),
            DiskSlot::CloudInit(_) => Ok(()),
            DiskSlot::Disk(disk) => disk.validate(bus, drive),
            DiskSlot::Passthrough(disk) => disk.options.validate(bus, drive),
        }
    }
}

/// Drives on every bus. A bus left as `None` isn't changed.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(default, deny_unknown_fields)]
pub struct QemuDisks {
    pub ide: Option<BTreeMap<IdeSlot, DiskSlot>>,
    pub sata: Option<BTreeMap<SataSlot, DiskSlot>>,
    pub scsi: Option<BTreeMap<ScsiSlot, DiskSlot>>,
    pub virtio: Option<BTreeMap<VirtioSlot, DiskSlot>>,
}

impl QemuDisks {
    pub(crate) fn from_wire(
        cfg: &WireConfig,
    ) -> Result<Option<Self>, WireError> {
        let disks = QemuDisks {
            ide: wire::decode_slots(
                cfg,
                |key| IdeSlot::from_key(DiskBus::Ide.prefix(), key),
                DiskSlot::decode,
            )?,
            sata: wire::decode_slots(
                cfg,
                |key| SataSlot::from_key(DiskBus::Sata.prefix(), key),
                DiskSlot::decode,
            )?,
            scsi: wire::decode_slots(
                cfg,
                |key| ScsiSlot::from_key(DiskBus::Scsi.prefix(), key),
                DiskSlot::decode,
            )?,
            virtio: wire::decode_slots(
                cfg,
                |key| VirtioSlot::from_key(DiskBus::Virtio.prefix(), key),
                DiskSlot::decode,
            )?,
        };
        Ok((disks != QemuDisks::default()).then_some(disks))
    }

    /// Every populated slot with its bus and wire key.
    fn drives(
        &self,
    ) -> impl Iterator<Item = (DiskBus, String, &DiskSlot)> + '_ {
        fn on<'a, S: Copy + 'a>(
            bus: DiskBus,
            slots: &'a Option<BTreeMap<S, DiskSlot>>,
            key: impl Fn(S, &str) -> String + 'a,
        ) -> impl Iterator<Item = (DiskBus, String, &'a DiskSlot)> + 'a {
            slots
                .iter()
                .flat_map(|slots| slots.iter())
                .map(move |(slot, drive)| {
                    (bus, key(*slot, bus.prefix()), drive)
                })
        }

        on(DiskBus::Ide, &self.ide, IdeSlot::key)
            .chain(on(DiskBus::Sata, &self.sata, SataSlot::key))
            .chain(on(DiskBus::Scsi, &self.scsi, ScsiSlot::key))
            .chain(on(DiskBus::Virtio, &self.virtio, VirtioSlot::key))
    }

    /// Whether `ide2`, where the top-level ISO goes, is in use.
    pub(crate) fn uses_media_slot(&self) -> bool {
        self.ide
            .as_ref()
            .is_some_and(|ide| ide.contains_key(&IdeSlot::MEDIA))
    }

    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        let mut cloud_init = 0;
        for (bus, drive, slot) in self.drives() {
            slot.validate(bus, &drive)?;
            if matches!(slot, DiskSlot::CloudInit(_)) {
                cloud_init += 1;
            }
        }
        if cloud_init > 1 {
            return Err(ValidationError::CloudInitDiskDuplicate);
        }
        Ok(())
    }
}

fn plan_drive(
    bus: DiskBus,
    drive: &str,
    desired: Option<&DiskSlot>,
    current: Option<&DiskSlot>,
    ctx: &PlanContext,
    changes: &mut Changes,
) -> Result<(), ValidationError> {
    match (desired, current) {
        (None, None) => {}
        (None, Some(_)) => {
            changes.delete(drive);
            changes.reboot_if(!bus.hotplug());
        }
        (Some(desired), None) => {
            changes.set(drive, desired.render_new());
            changes.reboot_if(!bus.hotplug());
        }
        (Some(desired), Some(current)) => {
            if let Some(update) =
                desired.render_update(bus, drive, current, ctx)?
            {
                changes.set(drive, update.value);
                changes.reboot_if(update.reboot);
            }
        }
    }
    Ok(())
}

fn plan_bus<S>(
    bus: DiskBus,
    key: impl Fn(S, &str) -> String,
    desired: &BTreeMap<S, DiskSlot>,
    current: Option<&BTreeMap<S, DiskSlot>>,
    ctx: &PlanContext,
    changes: &mut Changes,
) -> Result<(), ValidationError>
where
    S: Ord + Copy,
{
    for (slot, drive) in desired {
        let existing = current.and_then(|c| c.get(slot));
        let key = key(*slot, bus.prefix());
        plan_drive(bus, &key, Some(drive), existing, ctx, changes)?;
    }
    for (slot, existing) in current.into_iter().flatten() {
        if !desired.contains_key(slot) {
            let key = key(*slot, bus.prefix());
            plan_drive(bus, &key, None, Some(existing), ctx, changes)?;
        }
    }
    Ok(())
}

/// Plans every bus. `iso`, if set, is placed in `ide2`; it can't be combined
/// with a desired `ide2` drive.
pub(crate) fn plan(
    desired: Option<&QemuDisks>,
    current: Option<&QemuDisks>,
    iso: Option<&IsoFile>,
    ctx: &PlanContext,
    changes: &mut Changes,
) -> Result<(), ValidationError> {
    let current_ide = current.and_then(|c| c.ide.as_ref());
    let desired_ide = desired.and_then(|d| d.ide.as_ref());
    let media = iso.map(|iso| DiskSlot::CdRom(CdRom::Iso(iso.clone())));

    match (desired_ide, media) {
        (Some(ide), Some(media)) => {
            let mut ide = ide.clone();
            ide.insert(IdeSlot::MEDIA, media);
            let bus = DiskBus::Ide;
            plan_bus(bus, IdeSlot::key, &ide, current_ide, ctx, changes)?;
        }
        (Some(ide), None) => {
            let bus = DiskBus::Ide;
            plan_bus(bus, IdeSlot::key, ide, current_ide, ctx, changes)?;
        }
        (None, Some(media)) => {
            let existing = current_ide.and_then(|c| c.get(&IdeSlot::MEDIA));
            let key = IdeSlot::MEDIA.key(DiskBus::Ide.prefix());
            let bus = DiskBus::Ide;
            plan_drive(bus, &key, Some(&media), existing, ctx, changes)?;
        }
        (None, None) => {}
    }

    let Some(desired) = desired else {
        return Ok(());
    };
    if let Some(sata) = &desired.sata {
        let current = current.and_then(|c| c.sata.as_ref());
        plan_bus(DiskBus::Sata, SataSlot::key, sata, current, ctx, changes)?;
    }
    if let Some(scsi) = &desired.scsi {
        let current = current.and_then(|c| c.scsi.as_ref());
        plan_bus(DiskBus::Scsi, ScsiSlot::key, scsi, current, ctx, changes)?;
    }
    if let Some(virtio) = &desired.virtio {
        let current = current.and_then(|c| c.virtio.as_ref());
        let bus = DiskBus::Virtio;
        plan_bus(bus, VirtioSlot::key, virtio, current, ctx, changes)?;
    }
    Ok(())
}
