// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-disk options shared by every bus.

use std::fmt;
use std::str::FromStr;

use pve_types::units::{self, UnitError};
use schemars::JsonSchema;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use super::DiskBus;
use crate::wire::segment::{SegmentBuilder, Segments};
use crate::{ValidationError, WireError};

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
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DiskFormat {
    Cow,
    Qcow,
    Qcow2,
    Qed,
    #[default]
    Raw,
    Vdi,
    Vmdk,
}

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
pub enum DiskCache {
    DirectSync,
    #[serde(rename = "none")]
    #[strum(serialize = "none")]
    NoCache,
    Unsafe,
    WriteBack,
    WriteThrough,
}

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
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AsyncIo {
    IoUring,
    Native,
    Threads,
}

fn validate_serial(s: &str) -> Result<(), ValidationError> {
    let allowed = |b: u8| b.is_ascii_alphanumeric() || b == b'-' || b == b'_';
    if !(1..=60).contains(&s.len()) || !s.bytes().all(allowed) {
        return Err(ValidationError::DiskSerialInvalid(s.to_owned()));
    }
    Ok(())
}

fn validate_wwn(s: &str) -> Result<(), ValidationError> {
    match s.strip_prefix("0x") {
        Some(digits)
            if digits.len() == 16
                && digits.bytes().all(|b| b.is_ascii_hexdigit()) =>
        {
            Ok(())
        }
        _ => Err(ValidationError::DiskWwnInvalid(s.to_owned())),
    }
}

validated_string!(
    /// The serial number reported to the guest.
    DiskSerial,
    validate_serial
);

validated_string!(
    /// A world wide name, `0x` followed by 16 hex digits.
    Wwn,
    validate_wwn
);

/// A throughput limit in megabytes per second, with two decimal places.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Mbps(u64);

impl Mbps {
    const PLACES: u32 = 2;

    pub fn from_hundredths(hundredths: u64) -> Self {
        Self(hundredths)
    }

    pub fn hundredths(self) -> u64 {
        self.0
    }

    pub fn from_f64(value: f64) -> Option<Self> {
        units::scale_float(value, Self::PLACES).map(Self)
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 10f64.powi(Self::PLACES as i32)
    }

    fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl FromStr for Mbps {
    type Err = UnitError;

    /// Accepts up to two decimals exactly; the API may report more, which
    /// are rounded.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        units::parse_decimal(s, Self::PLACES).map(Self).or_else(|e| {
            s.trim()
                .parse::<f64>()
                .ok()
                .and_then(Self::from_f64)
                .ok_or(e)
        })
    }
}

impl fmt::Display for Mbps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&units::format_decimal(self.0, Self::PLACES))
    }
}

impl Serialize for Mbps {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for Mbps {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = f64::deserialize(deserializer)?;
        Mbps::from_f64(value).ok_or_else(|| {
            de::Error::invalid_value(
                de::Unexpected::Float(value),
                &"a non-negative throughput",
            )
        })
    }
}

impl JsonSchema for Mbps {
    fn schema_name() -> String {
        "Mbps".to_owned()
    }

    fn json_schema(
        _: &mut schemars::gen::SchemaGenerator,
    ) -> schemars::schema::Schema {
        use schemars::schema::*;

        SchemaObject {
            instance_type: Some(InstanceType::Number.into()),
            number: Some(
                NumberValidation {
                    minimum: Some(0.0),
                    multiple_of: Some(0.01),
                    ..Default::default()
                }
                .into(),
            ),
            ..Default::default()
        }
        .into()
    }
}

/// Throughput and IOPS limits. Unset and zero limits are unlimited.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(default, deny_unknown_fields)]
pub struct DiskBandwidth {
    pub iops_read: Option<u32>,
    pub iops_read_burst: Option<u32>,
    /// How long a read burst may last, in seconds.
    pub iops_read_burst_secs: Option<u32>,
    pub iops_write: Option<u32>,
    pub iops_write_burst: Option<u32>,
    pub iops_write_burst_secs: Option<u32>,
    pub mbps_read: Option<Mbps>,
    pub mbps_read_burst: Option<Mbps>,
    pub mbps_write: Option<Mbps>,
    pub mbps_write_burst: Option<Mbps>,
}

fn limit(value: Option<u32>) -> Option<u32> {
    value.filter(|v| *v > 0)
}

fn mbps(value: Option<Mbps>) -> Option<Mbps> {
    value.filter(|v| !v.is_zero())
}

impl DiskBandwidth {
    fn decode(segments: &Segments<'_>) -> Result<Self, WireError> {
        Ok(DiskBandwidth {
            iops_read: segments.parse_opt("iops_rd")?,
            iops_read_burst: segments.parse_opt("iops_rd_max")?,
            iops_read_burst_secs: segments.parse_opt("iops_rd_max_length")?,
            iops_write: segments.parse_opt("iops_wr")?,
            iops_write_burst: segments.parse_opt("iops_wr_max")?,
            iops_write_burst_secs: segments.parse_opt("iops_wr_max_length")?,
            mbps_read: segments.parse_opt("mbps_rd")?,
            mbps_read_burst: segments.parse_opt("mbps_rd_max")?,
            mbps_write: segments.parse_opt("mbps_wr")?,
            mbps_write_burst: segments.parse_opt("mbps_wr_max")?,
        })
    }

    fn render_iops(&self, builder: &mut SegmentBuilder) {
        builder
            .optional("iops_rd", limit(self.iops_read))
            .optional("iops_rd_max", limit(self.iops_read_burst))
            .optional("iops_rd_max_length", limit(self.iops_read_burst_secs))
            .optional("iops_wr", limit(self.iops_write))
            .optional("iops_wr_max", limit(self.iops_write_burst))
            .optional("iops_wr_max_length", limit(self.iops_write_burst_secs));
    }

    fn render_mbps(&self, builder: &mut SegmentBuilder) {
        builder
            .optional("mbps_rd", mbps(self.mbps_read))
            .optional("mbps_rd_max", mbps(self.mbps_read_burst))
            .optional("mbps_wr", mbps(self.mbps_write))
            .optional("mbps_wr_max", mbps(self.mbps_write_burst));
    }
}

/// Options common to disks and passthrough devices.
///
/// `backup` and `replicate` are enabled by the API when omitted, so they
/// are always written out when disabled.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(default, deny_unknown_fields)]
pub struct DiskOptions {
    pub async_io: Option<AsyncIo>,
    /// Include the disk in backups.
    pub backup: bool,
    pub bandwidth: DiskBandwidth,
    pub cache: Option<DiskCache>,
    /// Pass discard (TRIM) requests through to the storage.
    pub discard: bool,
    /// Report the disk as a solid state drive. Not available on VirtIO.
    pub emulate_ssd: bool,
    /// Give the disk its own I/O thread. SCSI and VirtIO only.
    pub io_thread: bool,
    /// SCSI and VirtIO only.
    pub read_only: bool,
    /// Include the disk in storage replication jobs.
    pub replicate: bool,
    pub serial: Option<DiskSerial>,
    pub wwn: Option<Wwn>,
}

impl DiskOptions {
    pub(super) fn decode(segments: &Segments<'_>) -> Result<Self, WireError> {
        Ok(DiskOptions {
            async_io: segments.parse_opt("aio")?,
            backup: segments.flag("backup")?.unwrap_or(true),
            bandwidth: DiskBandwidth::decode(segments)?,
            cache: segments.parse_opt("cache")?,
            // The alternative is `ignore`, which isn't a boolean.
            discard: segments.get("discard") == Some("on"),
            emulate_ssd: segments.flag("ssd")?.unwrap_or(false),
            io_thread: segments.flag("iothread")?.unwrap_or(false),
            read_only: segments.flag("ro")?.unwrap_or(false),
            replicate: segments.flag("replicate")?.unwrap_or(true),
            serial: segments.parse_opt("serial")?,
            wwn: segments.parse_opt("wwn")?,
        })
    }

    /// Appends the options in the API's alphabetical order. `format` and
    /// `size` are interleaved where they sort.
    pub(super) fn render(
        &self,
        builder: &mut SegmentBuilder,
        format: Option<DiskFormat>,
        size_kib: Option<u64>,
    ) {
        builder
            .optional("aio", self.async_io)
            .unset_flag("backup", self.backup)
            .optional("cache", self.cache)
            .optional("discard", self.discard.then_some("on"))
            .optional("format", format);
        self.bandwidth.render_iops(builder);
        builder.flag("iothread", self.io_thread);
        self.bandwidth.render_mbps(builder);
        let size = size_kib.filter(|s| *s > 0).map(units::format_size);
        builder
            .unset_flag("replicate", self.replicate)
            .flag("ro", self.read_only)
            .optional("serial", self.serial.as_ref())
            .optional("size", size)
            .flag("ssd", self.emulate_ssd)
            .optional("wwn", self.wwn.as_ref());
    }

    /// Checks the options against what `bus` supports.
    pub(super) fn validate(
        &self,
        bus: DiskBus,
        disk: &str,
    ) -> Result<(), ValidationError> {
        let unsupported = |option| ValidationError::DiskOptionUnsupported {
            disk: disk.to_owned(),
            option,
        };
        if self.emulate_ssd && bus == DiskBus::Virtio {
            return Err(unsupported("ssd"));
        }
        if !bus.hotplug() {
            if self.io_thread {
                return Err(unsupported("iothread"));
            }
            if self.read_only {
                return Err(unsupported("ro"));
            }
        }
        Ok(())
    }

    /// Whether the two differ only in options that can change while the
    /// guest runs.
    pub(super) fn differ_only_live(&self, other: &DiskOptions) -> bool {
        let strip = |options: &DiskOptions| DiskOptions {
            backup: false,
            bandwidth: DiskBandwidth::default(),
            replicate: false,
            ..options.clone()
        };
        strip(self) == strip(other)
    }
}
