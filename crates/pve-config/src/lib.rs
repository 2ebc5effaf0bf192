// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed guest configurations and their translation to and from the
//! management API's flat key/value configuration format.
//!
//! A [`Configuration`] describes a guest's desired (or current) hardware and
//! provisioning settings. This crate
//!
//! - decodes the API's wire representation of a guest's configuration into a
//!   [`Configuration`] ([`Configuration::from_wire`]),
//! - validates a desired configuration, optionally against the guest's
//!   current configuration ([`Configuration::validate`]), and
//! - computes the minimal set of wire fields that moves a guest from its
//!   current configuration to a desired one, along with whether the change
//!   needs a reboot to take effect ([`ChangePlanner`]).
//!
//! Nothing here performs I/O. Callers fetch the current configuration and
//! transmit the resulting [`ConfigChange`] themselves.

#[macro_use]
mod macros;

pub mod agent;
pub mod cloudinit;
mod config;
pub mod cpu;
pub mod disk;
mod error;
pub mod memory;
pub mod network;
pub mod pci;
mod plan;
pub mod serial;
pub mod tags;
pub mod tpm;
pub mod usb;
pub mod wire;

pub use config::{Configuration, GuestName, MappingName, PoolName};
pub use error::{ValidationError, WireError};
pub use plan::{ChangePlanner, ConfigChange};
pub use wire::WireConfig;

pub use pve_types::{
    GuestId, IdeSlot, NetSlot, PciSlot, PveVersion, SataSlot, ScsiSlot,
    SerialSlot, UsbSlot, VirtioSlot,
};
