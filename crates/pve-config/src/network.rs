// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Network interfaces (`netN`).

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use pve_types::units;
use pve_types::NetSlot;
use schemars::JsonSchema;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::plan::{
    plan_slots, Changes, PlanContext, SlotUpdate, SlottedDevice,
};
use crate::wire::segment::{SegmentBuilder, Segments};
use crate::wire::{self, WireConfig};
use crate::{ValidationError, WireError};

pub(crate) const KEY_PREFIX: &str = "net";

pub const MIN_MTU: u16 = 576;
pub const MAX_MTU: u16 = 65_520;
pub const MAX_QUEUES: u8 = 64;
pub const MAX_RATE_KBPS: u32 = 10_240_000;
pub const MAX_VLAN: u16 = 4094;

/// A MAC address as six `:`-separated hex octets.
///
/// Addresses compare equal regardless of case, but keep the spelling they
/// were created with so an address read from the API is written back
/// verbatim.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(try_from = "String")]
pub struct MacAddress(String);

impl MacAddress {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for MacAddress {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for MacAddress {}

impl TryFrom<String> for MacAddress {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let octets: Vec<&str> = value.split(':').collect();
        let valid = octets.len() == 6
            && octets.iter().all(|octet| {
                octet.len() == 2
                    && octet.bytes().all(|b| b.is_ascii_hexdigit())
            });
        if !valid {
            return Err(ValidationError::MacAddressInvalid(value));
        }
        Ok(Self(value))
    }
}

impl FromStr for MacAddress {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_owned())
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_bridge(s: &str) -> Result<(), ValidationError> {
    let allowed =
        |b: u8| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.');
    let valid = (1..=15).contains(&s.len()) && s.bytes().all(allowed);
    if !valid {
        return Err(ValidationError::NetworkBridgeInvalid(s.to_owned()));
    }
    Ok(())
}

validated_string!(
    /// A host bridge name such as `vmbr0`.
    BridgeName,
    validate_bridge
);

/// Emulated network card models.
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
pub enum NetworkModel {
    #[serde(rename = "e1000")]
    #[strum(serialize = "e1000")]
    E1000,
    #[serde(rename = "e1000-82540em")]
    #[strum(serialize = "e1000-82540em")]
    E1000_82540em,
    #[serde(rename = "e1000-82544gc")]
    #[strum(serialize = "e1000-82544gc")]
    E1000_82544gc,
    #[serde(rename = "e1000-82545em")]
    #[strum(serialize = "e1000-82545em")]
    E1000_82545em,
    #[serde(rename = "e1000e")]
    #[strum(serialize = "e1000e")]
    E1000e,
    #[serde(rename = "i82551")]
    #[strum(serialize = "i82551")]
    I82551,
    #[serde(rename = "i82557b")]
    #[strum(serialize = "i82557b")]
    I82557b,
    #[serde(rename = "i82559er")]
    #[strum(serialize = "i82559er")]
    I82559er,
    #[serde(rename = "ne2k_isa")]
    #[strum(serialize = "ne2k_isa")]
    Ne2kIsa,
    #[serde(rename = "ne2k_pci")]
    #[strum(serialize = "ne2k_pci")]
    Ne2kPci,
    #[serde(rename = "pcnet")]
    #[strum(serialize = "pcnet")]
    Pcnet,
    #[serde(rename = "rtl8139")]
    #[strum(serialize = "rtl8139")]
    Rtl8139,
    #[default]
    #[serde(rename = "virtio")]
    #[strum(serialize = "virtio")]
    Virtio,
    #[serde(rename = "vmxnet3")]
    #[strum(serialize = "vmxnet3")]
    Vmxnet3,
}

/// The MTU of a VirtIO interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkMtu {
    /// Use the bridge's MTU.
    Inherit,
    Value(u16),
}

impl NetworkMtu {
    fn wire_value(self) -> u16 {
        match self {
            NetworkMtu::Inherit => 1,
            NetworkMtu::Value(mtu) => mtu,
        }
    }

    fn from_wire_value(mtu: u16) -> Self {
        match mtu {
            1 => NetworkMtu::Inherit,
            mtu => NetworkMtu::Value(mtu),
        }
    }
}

impl Serialize for NetworkMtu {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            NetworkMtu::Inherit => serializer.serialize_str("inherit"),
            NetworkMtu::Value(mtu) => serializer.serialize_u16(*mtu),
        }
    }
}

impl<'de> Deserialize<'de> for NetworkMtu {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct MtuVisitor;

        impl<'de> de::Visitor<'de> for MtuVisitor {
            type Value = NetworkMtu;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an MTU or \"inherit\"")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                u16::try_from(v).map(NetworkMtu::Value).map_err(|_| {
                    E::invalid_value(de::Unexpected::Unsigned(v), &self)
                })
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                u16::try_from(v).map(NetworkMtu::Value).map_err(|_| {
                    E::invalid_value(de::Unexpected::Signed(v), &self)
                })
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                match v {
                    "inherit" => Ok(NetworkMtu::Inherit),
                    _ => v.parse().map(NetworkMtu::Value).map_err(|_| {
                        E::invalid_value(de::Unexpected::Str(v), &self)
                    }),
                }
            }
        }

        deserializer.deserialize_any(MtuVisitor)
    }
}

// Written out by hand so the schema matches the custom serde encoding: either
// the string "inherit" or an integer.
impl JsonSchema for NetworkMtu {
    fn schema_name() -> String {
        "NetworkMtu".to_owned()
    }

    fn json_schema(
        generator: &mut schemars::gen::SchemaGenerator,
    ) -> schemars::schema::Schema {
        use schemars::schema::*;

        let inherit = SchemaObject {
            instance_type: Some(InstanceType::String.into()),
            enum_values: Some(vec!["inherit".into()]),
            ..Default::default()
        };
        SchemaObject {
            subschemas: Some(
                SubschemaValidation {
                    one_of: Some(vec![
                        inherit.into(),
                        generator.subschema_for::<u16>(),
                    ]),
                    ..Default::default()
                }
                .into(),
            ),
            ..Default::default()
        }
        .into()
    }
}

/// A guest network interface.
///
/// On update, absent fields keep the interface's current value.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkInterface {
    pub bridge: Option<BridgeName>,
    /// Whether the virtual link is up.
    pub connected: Option<bool>,
    /// Removes the interface.
    pub delete: bool,
    pub firewall: Option<bool>,
    pub mac: Option<MacAddress>,
    pub model: Option<NetworkModel>,
    pub mtu: Option<NetworkMtu>,
    /// Multiqueue count; zero disables multiqueue.
    pub queues: Option<u8>,
    /// Bandwidth limit in KB/s; zero removes the limit.
    pub rate_limit_kbps: Option<u32>,
    /// Untagged VLAN; zero removes the tag.
    pub native_vlan: Option<u16>,
    /// VLANs passed through to the guest tagged.
    pub tagged_vlans: Option<BTreeSet<u16>>,
}

impl NetworkInterface {
    fn decode(value: &str) -> Result<Self, WireError> {
        let segments = Segments::parse(value);
        let (model, mac) = match segments.first() {
            Some((Some(model), mac)) => (model, Some(mac.parse()?)),
            Some((None, model)) => (model, None),
            None => return Err(WireError::MissingOption("model")),
        };
        let model = model.parse().map_err(|_| WireError::UnknownToken {
            kind: "network model",
            value: model.to_owned(),
        })?;

        let trunks = match segments.get("trunks") {
            Some(trunks) => Some(
                trunks
                    .split(';')
                    .filter(|t| !t.is_empty())
                    .map(|t| {
                        t.trim().parse().map_err(|_| WireError::InvalidOption {
                            option: "trunks".to_owned(),
                            value: trunks.to_owned(),
                        })
                    })
                    .collect::<Result<BTreeSet<u16>, _>>()?,
            ),
            None => None,
        };

        let rate = segments
            .get("rate")
            .map(|rate| units::parse_decimal(rate, 3))
            .transpose()?
            .map(|rate| {
                u32::try_from(rate).map_err(|_| WireError::InvalidOption {
                    option: "rate".to_owned(),
                    value: rate.to_string(),
                })
            })
            .transpose()?;

        Ok(NetworkInterface {
            bridge: segments
                .get("bridge")
                .map(BridgeName::from_str)
                .transpose()?,
            connected: segments.flag("link_down")?.map(|down| !down),
            delete: false,
            firewall: segments.flag("firewall")?,
            mac,
            model: Some(model),
            mtu: segments
                .parse_opt::<u16>("mtu")?
                .map(NetworkMtu::from_wire_value),
            queues: segments.parse_opt("queues")?,
            rate_limit_kbps: rate,
            native_vlan: segments.parse_opt("tag")?,
            tagged_vlans: trunks,
        })
    }

    /// Applies `self` on top of `current`.
    fn merged(&self, current: &NetworkInterface) -> NetworkInterface {
        // Keep the address's current spelling unless it really changed.
        let mac = match (&self.mac, &current.mac) {
            (Some(desired), Some(current)) if desired == current => {
                Some(current.clone())
            }
            (Some(desired), _) => Some(desired.clone()),
            (None, current) => current.clone(),
        };

        NetworkInterface {
            bridge: self.bridge.clone().or_else(|| current.bridge.clone()),
            connected: self.connected.or(current.connected),
            delete: false,
            firewall: self.firewall.or(current.firewall),
            mac,
            model: self.model.or(current.model),
            mtu: self.mtu.or(current.mtu),
            queues: self.queues.or(current.queues),
            rate_limit_kbps: self.rate_limit_kbps.or(current.rate_limit_kbps),
            native_vlan: self.native_vlan.or(current.native_vlan),
            tagged_vlans: self
                .tagged_vlans
                .clone()
                .or_else(|| current.tagged_vlans.clone()),
        }
    }

    fn render(&self) -> String {
        let model = self.model.unwrap_or_default();
        let rate = self
            .rate_limit_kbps
            .filter(|r| *r > 0)
            .map(|r| units::format_decimal(u64::from(r), 3));
        let trunks = self
            .tagged_vlans
            .as_ref()
            .filter(|t| !t.is_empty())
            .map(|t| {
                t.iter().map(u16::to_string).collect::<Vec<_>>().join(";")
            });

        let mut builder = SegmentBuilder::new();
        match &self.mac {
            Some(mac) => builder.pair(&model.to_string(), mac),
            None => builder.positional(model),
        };
        builder
            .optional("bridge", self.bridge.as_ref())
            .flag("firewall", self.firewall == Some(true))
            .flag("link_down", self.connected == Some(false))
            .optional("mtu", self.mtu.map(NetworkMtu::wire_value))
            .optional("queues", self.queues.filter(|q| *q > 0))
            .optional("rate", rate)
            .optional("tag", self.native_vlan.filter(|t| *t > 0))
            .optional("trunks", trunks);
        builder.build()
    }

    pub(crate) fn validate(
        &self,
        slot: NetSlot,
        current: Option<&NetworkInterface>,
    ) -> Result<(), ValidationError> {
        if self.delete {
            return Ok(());
        }

        if let Some(mtu) = self.mtu {
            if let NetworkMtu::Value(value) = mtu {
                if !(MIN_MTU..=MAX_MTU).contains(&value) {
                    return Err(ValidationError::NetworkMtuOutOfRange(value));
                }
            }
            let model = self
                .model
                .or_else(|| current.and_then(|c| c.model))
                .unwrap_or_default();
            if model != NetworkModel::Virtio {
                return Err(ValidationError::NetworkMtuRequiresVirtio(
                    slot.key(KEY_PREFIX),
                ));
            }
        }
        if let Some(queues) = self.queues {
            if queues > MAX_QUEUES {
                return Err(ValidationError::NetworkQueuesOutOfRange(queues));
            }
        }
        if let Some(rate) = self.rate_limit_kbps {
            if rate > MAX_RATE_KBPS {
                return Err(ValidationError::NetworkRateOutOfRange(rate));
            }
        }
        if let Some(tag) = self.native_vlan.filter(|t| *t > 0) {
            if tag > MAX_VLAN {
                return Err(ValidationError::VlanOutOfRange(tag));
            }
        }
        for &vlan in self.tagged_vlans.iter().flatten() {
            if !(1..=MAX_VLAN).contains(&vlan) {
                return Err(ValidationError::VlanOutOfRange(vlan));
            }
        }

        Ok(())
    }
}

impl SlottedDevice for NetworkInterface {
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
        let merged = self.merged(current);
        let value = merged.render();
        if value == current.render() {
            return Ok(None);
        }

        let reboot = merged.model.unwrap_or_default()
            != current.model.unwrap_or_default()
            || merged.mtu != current.mtu
            || merged.queues.unwrap_or(0) != current.queues.unwrap_or(0);
        Ok(Some(SlotUpdate { value, reboot }))
    }

    fn hotplug_requires_reboot(&self) -> bool {
        false
    }

    fn marked_for_deletion(&self) -> bool {
        self.delete
    }
}

pub(crate) fn from_wire(
    cfg: &WireConfig,
) -> Result<Option<BTreeMap<NetSlot, NetworkInterface>>, WireError> {
    wire::decode_slots(
        cfg,
        |key| NetSlot::from_key(KEY_PREFIX, key),
        NetworkInterface::decode,
    )
}

pub(crate) fn plan(
    desired: &BTreeMap<NetSlot, NetworkInterface>,
    current: Option<&BTreeMap<NetSlot, NetworkInterface>>,
    ctx: &PlanContext,
    changes: &mut Changes,
) -> Result<(), ValidationError> {
    plan_slots(|slot| slot.key(KEY_PREFIX), desired, current, ctx, changes)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::plan::test::{
        create_ctx, finish, test_changes, update_ctx, wire,
    };
    use serde_json::{json, Value};

    fn slot(n: u8) -> NetSlot {
        NetSlot::new(n).unwrap()
    }

    fn plan_net(
        desired: &BTreeMap<NetSlot, NetworkInterface>,
        current: Option<&BTreeMap<NetSlot, NetworkInterface>>,
    ) -> (Value, bool) {
        let ctx = if current.is_some() { update_ctx() } else { create_ctx() };
        let mut changes = test_changes();
        plan(desired, current, &ctx, &mut changes).unwrap();
        let change = finish(changes);
        (Value::Object(change.request_body()), change.reboot_required())
    }

    #[test]
    fn mac_addresses() {
        let upper: MacAddress = "BC:24:11:AA:00:01".parse().unwrap();
        let lower: MacAddress = "bc:24:11:aa:00:01".parse().unwrap();
        assert_eq!(upper, lower);
        assert_eq!(lower.as_str(), "bc:24:11:aa:00:01");

        const BAD: &[&str] =
            &["BC:24:11:AA:00", "BC-24-11-AA-00-01", "BC:24:11:AA:00:0G"];
        for bad in BAD {
            assert_eq!(
                bad.parse::<MacAddress>(),
                Err(ValidationError::MacAddressInvalid(bad.to_string()))
            );
        }
    }

    #[test]
    fn render_on_create() {
        let nic = NetworkInterface {
            bridge: Some("vmbr0".parse().unwrap()),
            firewall: Some(true),
            connected: Some(false),
            mtu: Some(NetworkMtu::Inherit),
            queues: Some(4),
            rate_limit_kbps: Some(1500),
            native_vlan: Some(10),
            tagged_vlans: Some([30, 20].into_iter().collect()),
            ..Default::default()
        };
        let desired: BTreeMap<_, _> = [(slot(0), nic)].into();
        assert_eq!(
            plan_net(&desired, None).0,
            json!({
                "net0": "virtio,bridge=vmbr0,firewall=1,link_down=1,mtu=1,\
                         queues=4,rate=1.5,tag=10,trunks=20;30"
            })
        );
    }

    #[test]
    fn mac_case_is_not_a_change() {
        let current: BTreeMap<_, _> = [(
            slot(1),
            NetworkInterface::decode("virtio=BC:24:11:AA:00:01,bridge=vmbr0")
                .unwrap(),
        )]
        .into();
        let desired: BTreeMap<_, _> = [(
            slot(1),
            NetworkInterface {
                mac: Some("bc:24:11:aa:00:01".parse().unwrap()),
                ..Default::default()
            },
        )]
        .into();
        assert_eq!(plan_net(&desired, Some(&current)), (json!({}), false));
    }

    #[test]
    fn live_and_reboot_changes() {
        let current: BTreeMap<_, _> = [(
            slot(0),
            NetworkInterface::decode("e1000=BC:24:11:AA:00:01,bridge=vmbr0")
                .unwrap(),
        )]
        .into();

        let bridge_change: BTreeMap<_, _> = [(
            slot(0),
            NetworkInterface {
                bridge: Some("vmbr1".parse().unwrap()),
                ..Default::default()
            },
        )]
        .into();
        assert_eq!(
            plan_net(&bridge_change, Some(&current)),
            (json!({ "net0": "e1000=BC:24:11:AA:00:01,bridge=vmbr1" }), false)
        );

        let model_change: BTreeMap<_, _> = [(
            slot(0),
            NetworkInterface {
                model: Some(NetworkModel::Virtio),
                ..Default::default()
            },
        )]
        .into();
        assert_eq!(
            plan_net(&model_change, Some(&current)),
            (json!({ "net0": "virtio=BC:24:11:AA:00:01,bridge=vmbr0" }), true)
        );
    }

    #[test]
    fn delete_flag_and_absent_slots() {
        let current: BTreeMap<_, _> = [
            (slot(0), NetworkInterface::decode("virtio,bridge=vmbr0").unwrap()),
            (slot(3), NetworkInterface::decode("virtio,bridge=vmbr1").unwrap()),
        ]
        .into();
        let desired: BTreeMap<_, _> = [
            (slot(0), NetworkInterface { delete: true, ..Default::default() }),
            (slot(5), NetworkInterface { delete: true, ..Default::default() }),
        ]
        .into();
        assert_eq!(
            plan_net(&desired, Some(&current)),
            (json!({ "delete": "net0,net3" }), false)
        );
    }

    #[test]
    fn validation_rules() {
        let e1000 = NetworkInterface {
            model: Some(NetworkModel::E1000),
            ..Default::default()
        };
        let nic = NetworkInterface {
            mtu: Some(NetworkMtu::Value(9000)),
            ..Default::default()
        };
        assert_eq!(nic.validate(slot(2), None), Ok(()));
        assert_eq!(
            nic.validate(slot(2), Some(&e1000)),
            Err(ValidationError::NetworkMtuRequiresVirtio("net2".to_owned()))
        );

        let nic = NetworkInterface {
            mtu: Some(NetworkMtu::Value(100)),
            ..Default::default()
        };
        assert_eq!(
            nic.validate(slot(0), None),
            Err(ValidationError::NetworkMtuOutOfRange(100))
        );

        let nic = NetworkInterface { queues: Some(65), ..Default::default() };
        assert!(nic.validate(slot(0), None).is_err());

        let nic = NetworkInterface {
            tagged_vlans: Some([0].into_iter().collect()),
            ..Default::default()
        };
        assert_eq!(
            nic.validate(slot(0), None),
            Err(ValidationError::VlanOutOfRange(0))
        );

        assert!("vmbr0.100".parse::<BridgeName>().is_ok());
        assert!("a-very-long-bridge-name".parse::<BridgeName>().is_err());
    }

    #[test]
    fn mtu_serialization() {
        let nic: NetworkInterface =
            serde_json::from_value(json!({ "mtu": "inherit" })).unwrap();
        assert_eq!(nic.mtu, Some(NetworkMtu::Inherit));
        let nic: NetworkInterface =
            serde_json::from_value(json!({ "mtu": 1400 })).unwrap();
        assert_eq!(nic.mtu, Some(NetworkMtu::Value(1400)));
        assert_eq!(
            serde_json::to_value(NetworkMtu::Inherit).unwrap(),
            json!("inherit")
        );
    }

    #[test]
    fn decode_from_wire() {
        let cfg = wire(json!({
            "net0": "virtio=BC:24:11:AA:00:01,bridge=vmbr0,firewall=1,\
                     link_down=1,mtu=1,queues=2,rate=0.25,tag=5,trunks=7;8",
            "net31": "vmxnet3,bridge=vmbr9",
        }));
        let nics = from_wire(&cfg).unwrap().unwrap();
        let nic = &nics[&slot(0)];
        assert_eq!(nic.model, Some(NetworkModel::Virtio));
        assert_eq!(nic.connected, Some(false));
        assert_eq!(nic.firewall, Some(true));
        assert_eq!(nic.mtu, Some(NetworkMtu::Inherit));
        assert_eq!(nic.rate_limit_kbps, Some(250));
        assert_eq!(nic.tagged_vlans, Some([7, 8].into_iter().collect()));
        assert_eq!(nics[&slot(31)].mac, None);

        assert_eq!(plan_net(&nics, Some(&nics)), (json!({}), false));

        assert!(from_wire(&wire(json!({ "net0": "bogus=x" }))).is_err());
        assert!(from_wire(&wire(json!({ "net0": "virtio=zz" }))).is_err());
    }
}
