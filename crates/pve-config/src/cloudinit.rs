// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cloud-init settings.
//!
//! These are spread over several top-level wire keys (`cicustom`,
//! `ipconfigN`, `sshkeys`, ...). All of them are read by the guest when the
//! cloud-init drive is regenerated, so every change here applies without a
//! reboot of the guest configuration itself.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use percent_encoding::{percent_decode_str, utf8_percent_encode};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC};
use pve_types::{NetSlot, PveVersion};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::plan::{plan_scalar, Changes, PlanContext};
use crate::wire::segment::{SegmentBuilder, Segments};
use crate::wire::{self, WireConfig};
use crate::{ValidationError, WireError};

const KEY_CUSTOM: &str = "cicustom";
const KEY_PASSWORD: &str = "cipassword";
const KEY_SEARCH_DOMAIN: &str = "searchdomain";
const KEY_NAME_SERVER: &str = "nameserver";
const KEY_SSH_KEYS: &str = "sshkeys";
const KEY_UPGRADE: &str = "ciupgrade";
const KEY_USER: &str = "ciuser";
const IPCONFIG_PREFIX: &str = "ipconfig";

pub const MAX_SNIPPET_PATH: usize = 256;

/// First version that understands `ciupgrade`.
pub const UPGRADE_PACKAGES_VERSION: PveVersion = PveVersion::new(8, 0, 0);

/// Everything except unreserved characters is escaped, matching what the API
/// expects for `sshkeys`.
const SSH_KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// A reference to a file on a snippets-enabled storage.
///
/// A snippet with neither a storage nor a path clears the reference.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(default, deny_unknown_fields)]
pub struct Snippet {
    pub storage: String,
    /// Absolute path within the storage, e.g. `/snippets/user.yml`.
    pub path: String,
}

impl Snippet {
    fn is_cleared(&self) -> bool {
        self.storage.is_empty() && self.path.is_empty()
    }

    fn decode(value: &str) -> Result<Self, WireError> {
        let (storage, path) = value
            .split_once(':')
            .ok_or_else(|| WireError::MalformedVolume(value.to_owned()))?;
        Ok(Snippet {
            storage: storage.to_owned(),
            path: format!("/{}", path.trim_start_matches('/')),
        })
    }

    fn render(&self) -> String {
        format!("{}:{}", self.storage, self.path.trim_start_matches('/'))
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.is_cleared() {
            return Ok(());
        }
        if self.storage.is_empty() {
            return Err(ValidationError::CloudInitSnippetStorageRequired);
        }
        if !self.path.starts_with('/') {
            return Err(ValidationError::CloudInitSnippetPathRelative(
                self.path.clone(),
            ));
        }
        if self.path.len() > MAX_SNIPPET_PATH {
            return Err(ValidationError::CloudInitSnippetPathTooLong(
                self.path.clone(),
            ));
        }
        Ok(())
    }
}

/// Snippets that replace the generated cloud-init sections.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(default, deny_unknown_fields)]
pub struct CloudInitCustom {
    pub meta: Option<Snippet>,
    pub network: Option<Snippet>,
    pub user: Option<Snippet>,
    pub vendor: Option<Snippet>,
}

impl CloudInitCustom {
    fn decode(value: &str) -> Result<Self, WireError> {
        let segments = Segments::parse(value);
        let snippet = |key| {
            segments
                .get(key)
                .map(Snippet::decode)
                .transpose()
                .map_err(|e| e.in_field(key))
        };
        Ok(CloudInitCustom {
            meta: snippet("meta")?,
            network: snippet("network")?,
            user: snippet("user")?,
            vendor: snippet("vendor")?,
        })
    }

    fn sections(&self) -> [(&'static str, Option<&Snippet>); 4] {
        [
            ("meta", self.meta.as_ref()),
            ("network", self.network.as_ref()),
            ("user", self.user.as_ref()),
            ("vendor", self.vendor.as_ref()),
        ]
    }

    fn merged(&self, current: Option<&CloudInitCustom>) -> CloudInitCustom {
        let current = current.cloned().unwrap_or_default();
        CloudInitCustom {
            meta: self.meta.clone().or(current.meta),
            network: self.network.clone().or(current.network),
            user: self.user.clone().or(current.user),
            vendor: self.vendor.clone().or(current.vendor),
        }
    }

    fn render(&self) -> String {
        let mut builder = SegmentBuilder::new();
        for (key, snippet) in self.sections() {
            let snippet = snippet.filter(|s| !s.is_cleared());
            builder.optional(key, snippet.map(Snippet::render));
        }
        builder.build()
    }

    fn validate(&self) -> Result<(), ValidationError> {
        self.sections()
            .into_iter()
            .filter_map(|(_, snippet)| snippet)
            .try_for_each(Snippet::validate)
    }
}

#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(default, deny_unknown_fields)]
pub struct CloudInitDns {
    /// An empty string removes the search domain.
    pub search_domain: Option<String>,
    /// An empty list removes the name servers.
    pub name_servers: Option<Vec<String>>,
}

/// Addressing for one network interface.
///
/// Addresses are in CIDR notation. On update, an address or gateway set to
/// the empty string removes that part of the current configuration, and an
/// absent one keeps it.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(default, deny_unknown_fields)]
pub struct CloudInitIpConfig {
    pub ipv4_address: Option<String>,
    pub ipv4_dhcp: bool,
    pub ipv4_gateway: Option<String>,
    pub ipv6_address: Option<String>,
    pub ipv6_dhcp: bool,
    /// Stateless autoconfiguration.
    pub ipv6_slaac: bool,
    pub ipv6_gateway: Option<String>,
}

fn non_empty(s: &Option<String>) -> Option<&str> {
    s.as_deref().filter(|s| !s.is_empty())
}

fn is_cidr<A: std::str::FromStr>(s: &str, max_prefix: u8) -> bool {
    match s.split_once('/') {
        Some((address, prefix)) => {
            address.parse::<A>().is_ok()
                && prefix.parse::<u8>().is_ok_and(|p| p <= max_prefix)
        }
        None => false,
    }
}

impl CloudInitIpConfig {
    fn decode(value: &str) -> Result<Self, WireError> {
        let segments = Segments::parse(value);
        let mut config = CloudInitIpConfig::default();
        match segments.get("ip") {
            Some("dhcp") => config.ipv4_dhcp = true,
            Some(address) => config.ipv4_address = Some(address.to_owned()),
            None => {}
        }
        match segments.get("ip6") {
            Some("dhcp") => config.ipv6_dhcp = true,
            Some("auto") => config.ipv6_slaac = true,
            Some(address) => config.ipv6_address = Some(address.to_owned()),
            None => {}
        }
        config.ipv4_gateway = segments.get("gw").map(str::to_owned);
        config.ipv6_gateway = segments.get("gw6").map(str::to_owned);
        Ok(config)
    }

    fn merged(&self, current: Option<&CloudInitIpConfig>) -> Self {
        let current = current.cloned().unwrap_or_default();
        let mut merged = current.clone();

        if self.ipv4_dhcp {
            merged.ipv4_dhcp = true;
            merged.ipv4_address = None;
            // A static gateway means nothing once DHCP hands one out.
            merged.ipv4_gateway = None;
        } else if self.ipv4_address.is_some() {
            merged.ipv4_dhcp = false;
            merged.ipv4_address = self.ipv4_address.clone();
        }
        if !self.ipv4_dhcp && self.ipv4_gateway.is_some() {
            merged.ipv4_gateway = self.ipv4_gateway.clone();
        }

        let ipv6_auto = self.ipv6_dhcp || self.ipv6_slaac;
        if ipv6_auto {
            merged.ipv6_dhcp = self.ipv6_dhcp;
            merged.ipv6_slaac = self.ipv6_slaac;
            merged.ipv6_address = None;
            merged.ipv6_gateway = None;
        } else if self.ipv6_address.is_some() {
            merged.ipv6_dhcp = false;
            merged.ipv6_slaac = false;
            merged.ipv6_address = self.ipv6_address.clone();
        }
        if !ipv6_auto && self.ipv6_gateway.is_some() {
            merged.ipv6_gateway = self.ipv6_gateway.clone();
        }

        merged
    }

    fn render(&self) -> String {
        let ip = if self.ipv4_dhcp {
            Some("dhcp")
        } else {
            non_empty(&self.ipv4_address)
        };
        let ip6 = if self.ipv6_dhcp {
            Some("dhcp")
        } else if self.ipv6_slaac {
            Some("auto")
        } else {
            non_empty(&self.ipv6_address)
        };

        let mut builder = SegmentBuilder::new();
        builder
            .optional("ip", ip)
            .optional("gw", non_empty(&self.ipv4_gateway))
            .optional("ip6", ip6)
            .optional("gw6", non_empty(&self.ipv6_gateway));
        builder.build()
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let ipv4_address = non_empty(&self.ipv4_address);
        let ipv4_gateway = non_empty(&self.ipv4_gateway);
        let ipv6_address = non_empty(&self.ipv6_address);
        let ipv6_gateway = non_empty(&self.ipv6_gateway);

        if self.ipv4_dhcp && ipv4_address.is_some() {
            return Err(ValidationError::CloudInitIpv4DhcpWithAddress);
        }
        if self.ipv4_dhcp && ipv4_gateway.is_some() {
            return Err(ValidationError::CloudInitIpv4DhcpWithGateway);
        }
        let ipv6_modes =
            [self.ipv6_dhcp, self.ipv6_slaac, ipv6_address.is_some()];
        if ipv6_modes.into_iter().filter(|set| *set).count() > 1 {
            return Err(ValidationError::CloudInitIpv6Exclusive);
        }
        if (self.ipv6_dhcp || self.ipv6_slaac) && ipv6_gateway.is_some() {
            return Err(ValidationError::CloudInitIpv6AutoWithGateway);
        }

        if let Some(address) = ipv4_address {
            if !is_cidr::<Ipv4Addr>(address, 32) {
                return Err(ValidationError::CloudInitIpv4AddressInvalid(
                    address.to_owned(),
                ));
            }
        }
        if let Some(gateway) = ipv4_gateway {
            if gateway.parse::<Ipv4Addr>().is_err() {
                return Err(ValidationError::CloudInitIpv4GatewayInvalid(
                    gateway.to_owned(),
                ));
            }
        }
        if let Some(address) = ipv6_address {
            if !is_cidr::<Ipv6Addr>(address, 128) {
                return Err(ValidationError::CloudInitIpv6AddressInvalid(
                    address.to_owned(),
                ));
            }
        }
        if let Some(gateway) = ipv6_gateway {
            if gateway.parse::<Ipv6Addr>().is_err() {
                return Err(ValidationError::CloudInitIpv6GatewayInvalid(
                    gateway.to_owned(),
                ));
            }
        }
        Ok(())
    }
}

/// Cloud-init settings. Absent fields keep their current value.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(default, deny_unknown_fields)]
pub struct CloudInit {
    pub custom: Option<CloudInitCustom>,
    pub dns: Option<CloudInitDns>,
    /// Per-interface addressing, keyed by the interface's network slot.
    pub ipconfig: Option<BTreeMap<NetSlot, CloudInitIpConfig>>,
    /// An empty string removes the password.
    pub password: Option<String>,
    /// An empty list removes every key.
    pub public_ssh_keys: Option<Vec<String>>,
    /// Upgrade packages on first boot. Needs version 8.0.0 or newer.
    pub upgrade_packages: Option<bool>,
    /// An empty string removes the user name.
    pub username: Option<String>,
}

fn encode_ssh_keys(keys: &[String]) -> String {
    keys.iter()
        .map(|key| utf8_percent_encode(key.trim(), SSH_KEY_ENCODE_SET))
        .map(|key| key.to_string())
        .collect::<Vec<_>>()
        .join("%0A")
}

fn decode_ssh_keys(value: &str) -> Result<Vec<String>, WireError> {
    let decoded = percent_decode_str(value).decode_utf8().map_err(|_| {
        WireError::InvalidOption {
            option: KEY_SSH_KEYS.to_owned(),
            value: value.to_owned(),
        }
    })?;
    Ok(decoded
        .lines()
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_owned)
        .collect())
}

fn non_empty_string(s: &String) -> Option<String> {
    (!s.is_empty()).then(|| s.clone())
}

impl CloudInit {
    pub(crate) fn from_wire(
        cfg: &WireConfig,
    ) -> Result<Option<Self>, WireError> {
        let custom = wire::get_str(cfg, KEY_CUSTOM)?
            .map(|value| CloudInitCustom::decode(&value))
            .transpose()
            .map_err(|e| e.in_field(KEY_CUSTOM))?;

        let search_domain = wire::get_str(cfg, KEY_SEARCH_DOMAIN)?;
        let name_servers = wire::get_str(cfg, KEY_NAME_SERVER)?.map(|v| {
            v.split_whitespace().map(str::to_owned).collect::<Vec<_>>()
        });
        let dns = (search_domain.is_some() || name_servers.is_some())
            .then_some(CloudInitDns { search_domain, name_servers });

        let public_ssh_keys = wire::get_str(cfg, KEY_SSH_KEYS)?
            .map(|value| decode_ssh_keys(&value))
            .transpose()
            .map_err(|e| e.in_field(KEY_SSH_KEYS))?;

        let cloud_init = CloudInit {
            custom,
            dns,
            ipconfig: wire::decode_slots(
                cfg,
                |key| NetSlot::from_key(IPCONFIG_PREFIX, key),
                CloudInitIpConfig::decode,
            )?,
            password: wire::get_str(cfg, KEY_PASSWORD)?,
            public_ssh_keys,
            upgrade_packages: wire::get_bool(cfg, KEY_UPGRADE)?,
            username: wire::get_str(cfg, KEY_USER)?,
        };
        Ok((cloud_init != CloudInit::default()).then_some(cloud_init))
    }

    /// Checks the settings on their own. Whether each `ipconfig` slot has a
    /// matching interface is checked with the whole configuration.
    pub(crate) fn validate(
        &self,
        version: PveVersion,
    ) -> Result<(), ValidationError> {
        if let Some(custom) = &self.custom {
            custom.validate()?;
        }
        for config in self.ipconfig.iter().flat_map(|m| m.values()) {
            config.validate()?;
        }
        if self.upgrade_packages.is_some()
            && !version.at_least(UPGRADE_PACKAGES_VERSION)
        {
            return Err(ValidationError::CloudInitUpgradeUnsupported(version));
        }
        Ok(())
    }

    pub(crate) fn plan(
        desired: &CloudInit,
        current: Option<&CloudInit>,
        _ctx: &PlanContext,
        changes: &mut Changes,
    ) -> Result<(), ValidationError> {
        if let Some(custom) = &desired.custom {
            let current = current.and_then(|c| c.custom.as_ref());
            plan_rendered(
                KEY_CUSTOM,
                custom.merged(current).render(),
                current.map(CloudInitCustom::render),
                changes,
            );
        }

        if let Some(dns) = &desired.dns {
            let current = current.and_then(|c| c.dns.as_ref());
            plan_scalar(
                KEY_SEARCH_DOMAIN,
                dns.search_domain.as_ref(),
                current.and_then(|c| c.search_domain.as_ref()),
                changes,
                non_empty_string,
            );
            plan_scalar(
                KEY_NAME_SERVER,
                dns.name_servers.as_ref(),
                current.and_then(|c| c.name_servers.as_ref()),
                changes,
                |servers| (!servers.is_empty()).then(|| servers.join(" ")),
            );
        }

        if let Some(ipconfig) = &desired.ipconfig {
            let current = current.and_then(|c| c.ipconfig.as_ref());
            plan_ipconfig(ipconfig, current, changes);
        }

        plan_scalar(
            KEY_SSH_KEYS,
            desired.public_ssh_keys.as_ref(),
            current.and_then(|c| c.public_ssh_keys.as_ref()),
            changes,
            |keys| (!keys.is_empty()).then(|| encode_ssh_keys(keys)),
        );
        plan_scalar(
            KEY_USER,
            desired.username.as_ref(),
            current.and_then(|c| c.username.as_ref()),
            changes,
            non_empty_string,
        );
        plan_scalar(
            KEY_PASSWORD,
            desired.password.as_ref(),
            current.and_then(|c| c.password.as_ref()),
            changes,
            non_empty_string,
        );
        plan_scalar(
            KEY_UPGRADE,
            desired.upgrade_packages.as_ref(),
            current.and_then(|c| c.upgrade_packages.as_ref()),
            changes,
            |upgrade| Some(wire::bool_value(*upgrade)),
        );
        Ok(())
    }
}

/// Sets `key` to `after` if it differs from the current rendering, deleting
/// the key instead when nothing is left to send.
fn plan_rendered(
    key: &str,
    after: String,
    before: Option<String>,
    changes: &mut Changes,
) {
    let before = before.filter(|b| !b.is_empty());
    if before.as_deref() == Some(after.as_str()) {
        return;
    }
    if !after.is_empty() {
        changes.set(key, after);
    } else if before.is_some() {
        changes.delete(key);
    }
}

fn plan_ipconfig(
    desired: &BTreeMap<NetSlot, CloudInitIpConfig>,
    current: Option<&BTreeMap<NetSlot, CloudInitIpConfig>>,
    changes: &mut Changes,
) {
    for (slot, config) in desired {
        let existing = current.and_then(|c| c.get(slot));
        plan_rendered(
            &slot.key(IPCONFIG_PREFIX),
            config.merged(existing).render(),
            existing.map(CloudInitIpConfig::render),
            changes,
        );
    }
    for slot in current.into_iter().flat_map(|c| c.keys()) {
        if !desired.contains_key(slot) {
            changes.delete(slot.key(IPCONFIG_PREFIX));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::plan::test::{finish, test_changes, update_ctx, wire};
    use serde_json::{json, Value};

    fn slot(n: u8) -> NetSlot {
        NetSlot::new(n).unwrap()
    }

    fn plan(
        desired: &CloudInit,
        current: Option<&CloudInit>,
    ) -> (Value, bool) {
        let mut changes = test_changes();
        CloudInit::plan(desired, current, &update_ctx(), &mut changes)
            .unwrap();
        let change = finish(changes);
        (Value::Object(change.request_body()), change.reboot_required())
    }

    fn snippet(storage: &str, path: &str) -> Snippet {
        Snippet { storage: storage.to_owned(), path: path.to_owned() }
    }

    fn ipconfig(
        configs: impl IntoIterator<Item = (u8, CloudInitIpConfig)>,
    ) -> CloudInit {
        CloudInit {
            ipconfig: Some(
                configs.into_iter().map(|(n, c)| (slot(n), c)).collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn custom_snippets_in_fixed_order() {
        let desired = CloudInit {
            custom: Some(CloudInitCustom {
                vendor: Some(snippet("local", "/snippets/vendor.yml")),
                meta: Some(snippet("local", "/snippets/meta.yml")),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            plan(&desired, None),
            (
                json!({
                    "cicustom": "meta=local:snippets/meta.yml,\
                                 vendor=local:snippets/vendor.yml"
                }),
                false
            )
        );
    }

    #[test]
    fn clearing_every_snippet_deletes_cicustom() {
        let current = CloudInit {
            custom: Some(CloudInitCustom {
                user: Some(snippet("local", "/snippets/user.yml")),
                ..Default::default()
            }),
            ..Default::default()
        };
        let desired = CloudInit {
            custom: Some(CloudInitCustom {
                user: Some(Snippet::default()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            plan(&desired, Some(&current)),
            (json!({ "delete": "cicustom" }), false)
        );
        assert_eq!(plan(&current, Some(&current)), (json!({}), false));
    }

    #[test]
    fn snippet_rules() {
        assert_eq!(snippet("", "").validate(), Ok(()));
        assert_eq!(snippet("local", "/a.yml").validate(), Ok(()));
        assert_eq!(
            snippet("", "/a.yml").validate(),
            Err(ValidationError::CloudInitSnippetStorageRequired)
        );
        assert_eq!(
            snippet("local", "a.yml").validate(),
            Err(ValidationError::CloudInitSnippetPathRelative(
                "a.yml".to_owned()
            ))
        );
        let long = format!("/{}", "a".repeat(MAX_SNIPPET_PATH));
        assert!(matches!(
            snippet("local", &long).validate(),
            Err(ValidationError::CloudInitSnippetPathTooLong(_))
        ));
    }

    #[test]
    fn ipconfig_render() {
        let desired = ipconfig([
            (
                0,
                CloudInitIpConfig {
                    ipv4_address: Some("10.0.0.5/24".to_owned()),
                    ipv4_gateway: Some("10.0.0.1".to_owned()),
                    ipv6_slaac: true,
                    ..Default::default()
                },
            ),
            (1, CloudInitIpConfig { ipv4_dhcp: true, ..Default::default() }),
            (2, CloudInitIpConfig::default()),
        ]);
        assert_eq!(
            plan(&desired, None),
            (
                json!({
                    "ipconfig0": "ip=10.0.0.5/24,gw=10.0.0.1,ip6=auto",
                    "ipconfig1": "ip=dhcp",
                }),
                false
            )
        );
    }

    #[test]
    fn ipconfig_updates() {
        let current = ipconfig([(
            0,
            CloudInitIpConfig {
                ipv4_address: Some("10.0.0.5/24".to_owned()),
                ipv4_gateway: Some("10.0.0.1".to_owned()),
                ipv6_dhcp: true,
                ..Default::default()
            },
        )]);

        // Switching to DHCP drops the static gateway.
        let desired = ipconfig([(
            0,
            CloudInitIpConfig { ipv4_dhcp: true, ..Default::default() },
        )]);
        assert_eq!(
            plan(&desired, Some(&current)),
            (json!({ "ipconfig0": "ip=dhcp,ip6=dhcp" }), false)
        );

        // Removing one part keeps the rest.
        let desired = ipconfig([(
            0,
            CloudInitIpConfig {
                ipv4_gateway: Some(String::new()),
                ..Default::default()
            },
        )]);
        assert_eq!(
            plan(&desired, Some(&current)),
            (json!({ "ipconfig0": "ip=10.0.0.5/24,ip6=dhcp" }), false)
        );

        // Removing every part deletes the key.
        let desired = ipconfig([(
            0,
            CloudInitIpConfig {
                ipv4_address: Some(String::new()),
                ipv4_gateway: Some(String::new()),
                ipv6_address: Some(String::new()),
                ..Default::default()
            },
        )]);
        assert_eq!(
            plan(&desired, Some(&current)),
            (json!({ "delete": "ipconfig0" }), false)
        );

        // Dropping the slot deletes it too.
        assert_eq!(
            plan(&ipconfig([]), Some(&current)),
            (json!({ "delete": "ipconfig0" }), false)
        );
        assert_eq!(plan(&current, Some(&current)), (json!({}), false));
    }

    #[test]
    fn ipconfig_rules() {
        let dhcp_with_address = CloudInitIpConfig {
            ipv4_dhcp: true,
            ipv4_address: Some("10.0.0.5/24".to_owned()),
            ..Default::default()
        };
        assert_eq!(
            dhcp_with_address.validate(),
            Err(ValidationError::CloudInitIpv4DhcpWithAddress)
        );

        let dhcp_with_gateway = CloudInitIpConfig {
            ipv4_dhcp: true,
            ipv4_gateway: Some("10.0.0.1".to_owned()),
            ..Default::default()
        };
        assert_eq!(
            dhcp_with_gateway.validate(),
            Err(ValidationError::CloudInitIpv4DhcpWithGateway)
        );

        let v6_both = CloudInitIpConfig {
            ipv6_dhcp: true,
            ipv6_slaac: true,
            ..Default::default()
        };
        assert_eq!(
            v6_both.validate(),
            Err(ValidationError::CloudInitIpv6Exclusive)
        );

        let slaac_with_gateway = CloudInitIpConfig {
            ipv6_slaac: true,
            ipv6_gateway: Some("fe80::1".to_owned()),
            ..Default::default()
        };
        assert_eq!(
            slaac_with_gateway.validate(),
            Err(ValidationError::CloudInitIpv6AutoWithGateway)
        );

        let bad_address = CloudInitIpConfig {
            ipv4_address: Some("10.0.0.5".to_owned()),
            ..Default::default()
        };
        assert_eq!(
            bad_address.validate(),
            Err(ValidationError::CloudInitIpv4AddressInvalid(
                "10.0.0.5".to_owned()
            ))
        );

        let empty_parts_are_fine = CloudInitIpConfig {
            ipv4_dhcp: true,
            ipv4_address: Some(String::new()),
            ipv6_address: Some("2001:db8::5/64".to_owned()),
            ipv6_gateway: Some("2001:db8::1".to_owned()),
            ..Default::default()
        };
        assert_eq!(empty_parts_are_fine.validate(), Ok(()));
    }

    #[test]
    fn ssh_keys_are_url_encoded() {
        let desired = CloudInit {
            public_ssh_keys: Some(vec![
                "ssh-ed25519 AAAA+b/c= alice@host".to_owned(),
                "ssh-rsa AAAB bob".to_owned(),
            ]),
            ..Default::default()
        };
        let expected = "ssh-ed25519%20AAAA%2Bb%2Fc%3D%20alice%40host\
                        %0Assh-rsa%20AAAB%20bob";
        assert_eq!(
            plan(&desired, None),
            (json!({ "sshkeys": expected }), false)
        );

        let cfg = wire(json!({ "sshkeys": expected }));
        let decoded = CloudInit::from_wire(&cfg).unwrap().unwrap();
        assert_eq!(decoded.public_ssh_keys, desired.public_ssh_keys);
    }

    #[test]
    fn scalar_fields() {
        let current = CloudInit {
            dns: Some(CloudInitDns {
                search_domain: Some("example.com".to_owned()),
                name_servers: Some(vec!["1.1.1.1".to_owned()]),
            }),
            username: Some("admin".to_owned()),
            ..Default::default()
        };
        let desired = CloudInit {
            dns: Some(CloudInitDns {
                search_domain: Some(String::new()),
                name_servers: Some(vec![
                    "1.1.1.1".to_owned(),
                    "9.9.9.9".to_owned(),
                ]),
            }),
            username: Some("root".to_owned()),
            password: Some("hunter2".to_owned()),
            upgrade_packages: Some(false),
            ..Default::default()
        };
        assert_eq!(
            plan(&desired, Some(&current)),
            (
                json!({
                    "nameserver": "1.1.1.1 9.9.9.9",
                    "ciuser": "root",
                    "cipassword": "hunter2",
                    "ciupgrade": 0,
                    "delete": "searchdomain",
                }),
                false
            )
        );
    }

    #[test]
    fn upgrade_packages_needs_version_8() {
        let desired = CloudInit {
            upgrade_packages: Some(true),
            ..Default::default()
        };
        let old = PveVersion::new(7, 4, 3);
        assert_eq!(
            desired.validate(old),
            Err(ValidationError::CloudInitUpgradeUnsupported(old))
        );
        assert_eq!(desired.validate(UPGRADE_PACKAGES_VERSION), Ok(()));
    }

    #[test]
    fn decode_from_wire() {
        let cfg = wire(json!({
            "cicustom": "user=local:snippets/user.yml",
            "ipconfig0": "ip=dhcp,ip6=auto",
            "ipconfig3": "ip=10.0.0.5/24,gw=10.0.0.1",
            "nameserver": "1.1.1.1 9.9.9.9",
            "searchdomain": "example.com",
            "ciuser": "admin",
            "ciupgrade": 1,
            "memory": 2048,
        }));
        let decoded = CloudInit::from_wire(&cfg).unwrap().unwrap();
        assert_eq!(
            decoded.custom.unwrap().user,
            Some(snippet("local", "/snippets/user.yml"))
        );
        let ipconfig = decoded.ipconfig.unwrap();
        assert_eq!(
            ipconfig[&slot(0)],
            CloudInitIpConfig {
                ipv4_dhcp: true,
                ipv6_slaac: true,
                ..Default::default()
            }
        );
        assert_eq!(
            ipconfig[&slot(3)].ipv4_gateway.as_deref(),
            Some("10.0.0.1")
        );
        assert_eq!(
            decoded.dns.unwrap().name_servers.unwrap(),
            ["1.1.1.1", "9.9.9.9"]
        );
        assert_eq!(decoded.upgrade_packages, Some(true));

        let cfg = wire(json!({ "memory": 2048 }));
        assert_eq!(CloudInit::from_wire(&cfg).unwrap(), None);
    }

    #[test]
    fn decoded_config_has_no_self_diff() {
        let cfg = wire(json!({
            "cicustom": "meta=local:snippets/m.yml,user=local:snippets/u.yml",
            "ipconfig0": "ip=10.0.0.5/24,gw=10.0.0.1,ip6=dhcp",
            "nameserver": "1.1.1.1",
            "sshkeys": "ssh-ed25519%20AAAA",
        }));
        let current = CloudInit::from_wire(&cfg).unwrap().unwrap();
        assert_eq!(plan(&current, Some(&current)), (json!({}), false));
    }
}
