// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The management API's flat configuration format.
//!
//! A guest's configuration is a JSON object mapping wire keys (`memory`,
//! `scsi0`, `net1`, ...) to scalars. Most string values are themselves
//! comma-separated option lists; see [`segment`]. Numeric fields may arrive as
//! JSON integers, JSON floats, or numeric strings depending on the API
//! endpoint, so the accessors here accept all three.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde_json::Value;

use crate::WireError;

pub mod segment;

/// A guest configuration in wire form.
pub type WireConfig = serde_json::Map<String, Value>;

/// The reserved key listing fields to remove in an update request.
pub const DELETE_KEY: &str = "delete";

/// Reads a string-valued field. Numbers are rendered back into strings, since
/// some fields (such as `name`) may have been coerced by the API.
pub(crate) fn get_str(
    cfg: &WireConfig,
    key: &str,
) -> Result<Option<String>, WireError> {
    match cfg.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(WireError::UnexpectedType { expected: "string" }
            .in_field(key)),
    }
}

/// Reads an unsigned integer field.
pub(crate) fn get_u64(
    cfg: &WireConfig,
    key: &str,
) -> Result<Option<u64>, WireError> {
    let value = match cfg.get(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(value) => value,
    };

    value_to_u64(value).map(Some).map_err(|e| e.in_field(key))
}

/// Reads an unsigned integer field that must fit in `T`.
pub(crate) fn get_int<T: TryFrom<u64>>(
    cfg: &WireConfig,
    key: &str,
) -> Result<Option<T>, WireError> {
    get_u64(cfg, key)?
        .map(|v| {
            T::try_from(v).map_err(|_| {
                WireError::InvalidOption {
                    option: key.to_owned(),
                    value: v.to_string(),
                }
                .in_field(key)
            })
        })
        .transpose()
}

/// Reads a boolean field encoded as `0`/`1` (or a JSON boolean).
pub(crate) fn get_bool(
    cfg: &WireConfig,
    key: &str,
) -> Result<Option<bool>, WireError> {
    match cfg.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::String(s)) => parse_bool(s).map(Some).ok_or_else(|| {
            WireError::InvalidOption {
                option: key.to_owned(),
                value: s.clone(),
            }
            .in_field(key)
        }),
        Some(value) => value_to_u64(value)
            .map(|v| Some(v != 0))
            .map_err(|e| e.in_field(key)),
    }
}

fn value_to_u64(value: &Value) -> Result<u64, WireError> {
    match value {
        Value::Number(n) => {
            if let Some(v) = n.as_u64() {
                return Ok(v);
            }
            match n.as_f64() {
                Some(f) if f.is_finite() && f >= 0.0 && f.fract() == 0.0 => {
                    Ok(f as u64)
                }
                _ => Err(WireError::UnexpectedType {
                    expected: "unsigned integer",
                }),
            }
        }
        Value::String(s) => u64::from_str(s.trim()).map_err(|_| {
            WireError::UnexpectedType { expected: "unsigned integer" }
        }),
        _ => Err(WireError::UnexpectedType { expected: "unsigned integer" }),
    }
}

/// Decodes every `<prefix><slot>` field (`net0`, `usb3`) with `decode`.
/// Returns `None` if no slot in the category is populated.
pub(crate) fn decode_slots<S, T>(
    cfg: &WireConfig,
    from_key: impl Fn(&str) -> Option<S>,
    decode: impl Fn(&str) -> Result<T, WireError>,
) -> Result<Option<BTreeMap<S, T>>, WireError>
where
    S: Ord,
{
    let mut slots = BTreeMap::new();
    for key in cfg.keys() {
        let Some(slot) = from_key(key) else {
            continue;
        };
        if let Some(value) = get_str(cfg, key)? {
            let device = decode(&value).map_err(|e| e.in_field(key))?;
            slots.insert(slot, device);
        }
    }
    Ok((!slots.is_empty()).then_some(slots))
}

/// Interprets the boolean spellings the API accepts inside option lists.
pub(crate) fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "yes" | "true" => Some(true),
        "0" | "off" | "no" | "false" => Some(false),
        _ => None,
    }
}

/// Renders a boolean the way the API expects numeric booleans.
pub(crate) fn bool_value(b: bool) -> Value {
    Value::from(u8::from(b))
}
