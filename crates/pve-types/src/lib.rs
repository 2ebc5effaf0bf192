// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fundamental types shared by the guest configuration crates.
//!
//! This crate defines the small validated types that both the configuration
//! model (`pve_config`) and its front ends (such as `pve-config-toml`) need to
//! agree on: bounded device slot numbers, guest IDs, the management API's
//! product version, and conversions between suffixed size strings and
//! kibibyte counts.

mod guest;
mod slot;
pub mod units;
mod version;

pub use guest::{GuestId, GuestIdError};
pub use slot::{
    IdeSlot, NetSlot, PciSlot, SataSlot, ScsiSlot, SerialSlot, SlotError,
    UsbSlot, VirtioSlot,
};
pub use units::UnitError;
pub use version::{PveVersion, VersionError};
