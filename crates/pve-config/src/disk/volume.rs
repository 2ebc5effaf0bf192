// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Names of existing disk volumes.
//!
//! Storages either name images by path (file syntax, with the format as the
//! extension) or by a flat volume name (volume syntax):
//!
//! ```text
//! local:100/vm-100-disk-0.qcow2                        file
//! local:101/base-101-disk-0.qcow2/100/vm-100-disk-1.qcow2  linked file
//! local-lvm:vm-100-disk-0                              volume
//! local-lvm:base-101-disk-0/vm-100-disk-1              linked volume
//! ```
//!
//! A template's own images are named `base-` instead of `vm-`.

use std::fmt;

use pve_types::GuestId;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::options::DiskFormat;
use crate::WireError;

/// How a storage names disk images.
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
pub enum DiskSyntax {
    File,
    Volume,
}

/// The base image a linked clone was created from.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(deny_unknown_fields)]
pub struct LinkedDisk {
    pub guest: GuestId,
    pub disk_id: u32,
}

/// A parsed volume name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Volume {
    pub storage: String,
    pub guest: GuestId,
    pub disk_id: u32,
    pub syntax: DiskSyntax,
    pub linked: Option<LinkedDisk>,
    /// Whether this is a template's base image.
    pub base_image: bool,
    /// The image format, taken from the extension in file syntax.
    pub format: Option<DiskFormat>,
}

struct ImageName {
    guest: GuestId,
    disk_id: u32,
    format: Option<DiskFormat>,
}

/// Parses `<kind>-<guest>-disk-<id>[.<ext>]`.
fn parse_image(name: &str, kind: &str) -> Option<ImageName> {
    let rest = name.strip_prefix(kind)?.strip_prefix('-')?;
    let (guest, rest) = rest.split_once("-disk-")?;
    let (disk_id, format) = match rest.split_once('.') {
        Some((id, ext)) => (id, Some(ext.parse().ok()?)),
        None => (rest, None),
    };
    Some(ImageName {
        guest: GuestId::new(guest.parse().ok()?).ok()?,
        disk_id: disk_id.parse().ok()?,
        format,
    })
}

/// Parses a guest's own image, which is a base image for templates.
fn parse_own_image(name: &str) -> Option<(ImageName, bool)> {
    match parse_image(name, "vm") {
        Some(image) => Some((image, false)),
        None => parse_image(name, "base").map(|image| (image, true)),
    }
}

impl Volume {
    pub fn parse(s: &str) -> Result<Self, WireError> {
        Self::try_parse(s)
            .ok_or_else(|| WireError::MalformedVolume(s.to_owned()))
    }

    fn try_parse(s: &str) -> Option<Self> {
        let (storage, path) = s.split_once(':')?;
        let parts: Vec<&str> = path.split('/').collect();

        let (syntax, base, (image, base_image)) = match parts.as_slice() {
            [image] => (DiskSyntax::Volume, None, parse_own_image(image)?),
            [base, image] if base.starts_with("base-") => (
                DiskSyntax::Volume,
                Some(parse_image(base, "base")?),
                (parse_image(image, "vm")?, false),
            ),
            [dir, image] => {
                let image = parse_own_image(image)?;
                if dir.parse::<u32>().ok() != Some(image.0.guest.get()) {
                    return None;
                }
                (DiskSyntax::File, None, image)
            }
            [base_dir, base, dir, image] => {
                let base = parse_image(base, "base")?;
                let image = parse_image(image, "vm")?;
                if base_dir.parse::<u32>().ok() != Some(base.guest.get())
                    || dir.parse::<u32>().ok() != Some(image.guest.get())
                {
                    return None;
                }
                (DiskSyntax::File, Some(base), (image, false))
            }
            _ => return None,
        };

        if syntax == DiskSyntax::File && image.format.is_none() {
            return None;
        }

        Some(Volume {
            storage: storage.to_owned(),
            guest: image.guest,
            disk_id: image.disk_id,
            syntax,
            linked: base.map(|base| LinkedDisk {
                guest: base.guest,
                disk_id: base.disk_id,
            }),
            base_image,
            format: image.format,
        })
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.storage)?;
        let kind = if self.base_image { "base" } else { "vm" };
        match self.syntax {
            DiskSyntax::File => {
                let ext = self.format.unwrap_or_default();
                if let Some(base) = &self.linked {
                    write!(
                        f,
                        "{0}/base-{0}-disk-{1}.{2}/",
                        base.guest.get(),
                        base.disk_id,
                        ext
                    )?;
                }
                write!(
                    f,
                    "{0}/{1}-{0}-disk-{2}.{3}",
                    self.guest.get(),
                    kind,
                    self.disk_id,
                    ext
                )
            }
            DiskSyntax::Volume => {
                if let Some(base) = &self.linked {
                    write!(
                        f,
                        "base-{}-disk-{}/",
                        base.guest.get(),
                        base.disk_id
                    )?;
                }
                write!(f, "{}-{}-disk-{}", kind, self.guest.get(), self.disk_id)
            }
        }
    }
}
