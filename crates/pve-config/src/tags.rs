// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Free-form guest tags.

use std::collections::BTreeSet;

use crate::plan::Changes;
use crate::wire::{self, WireConfig};
use crate::{ValidationError, WireError};

const KEY_TAGS: &str = "tags";

pub const MAX_TAG_LENGTH: usize = 124;

fn validate_tag(s: &str) -> Result<(), ValidationError> {
    if s.len() > MAX_TAG_LENGTH {
        return Err(ValidationError::TagTooLong(s.to_owned()));
    }

    let leading = |c: char| c.is_ascii_alphanumeric() || c == '_';
    let trailing = |c: char| leading(c) || matches!(c, '-' | '+' | '.');

    let mut chars = s.chars();
    let valid = match chars.next() {
        Some(first) => leading(first) && chars.all(trailing),
        None => false,
    };
    if !valid {
        return Err(ValidationError::TagInvalid(s.to_owned()));
    }
    Ok(())
}

validated_string!(
    /// A guest tag such as `prod` or `db.primary`.
    Tag,
    validate_tag
);

/// Splits the wire form of a tag list. Older API versions separate tags with
/// `,` or spaces instead of `;`.
pub(crate) fn from_wire(
    cfg: &WireConfig,
) -> Result<Option<BTreeSet<Tag>>, WireError> {
    let Some(value) = wire::get_str(cfg, KEY_TAGS)? else {
        return Ok(None);
    };

    let tags = value
        .split(|c: char| matches!(c, ';' | ',' | ' '))
        .filter(|t| !t.is_empty())
        .map(|t| t.parse::<Tag>())
        .collect::<Result<BTreeSet<_>, _>>()
        .map_err(|e| WireError::from(e).in_field(KEY_TAGS))?;
    Ok((!tags.is_empty()).then_some(tags))
}

fn render(tags: &BTreeSet<Tag>) -> String {
    tags.iter().map(Tag::as_str).collect::<Vec<_>>().join(";")
}

/// Tags are replaced as a whole; an empty set removes them.
pub(crate) fn plan(
    desired: &BTreeSet<Tag>,
    current: Option<&BTreeSet<Tag>>,
    changes: &mut Changes,
) {
    let current_empty = current.map_or(true, BTreeSet::is_empty);
    if desired.is_empty() {
        if !current_empty {
            changes.delete(KEY_TAGS);
        }
    } else if current != Some(desired) {
        changes.set(KEY_TAGS, render(desired));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::plan::test::{finish, test_changes, wire};
    use serde_json::{json, Value};

    fn tags(names: &[&str]) -> BTreeSet<Tag> {
        names.iter().map(|n| n.parse().unwrap()).collect()
    }

    #[test]
    fn tag_grammar() {
        const TEST_CASES: &[(&str, bool)] = &[
            ("prod", true),
            ("_internal", true),
            ("db.primary+replica", true),
            ("2024-q1", true),
            ("Web", true),
            ("", false),
            ("-leading", false),
            (".leading", false),
            ("has space", false),
            ("semi;colon", false),
        ];
        for (tag, valid) in TEST_CASES {
            assert_eq!(tag.parse::<Tag>().is_ok(), *valid, "tag {:?}", tag);
        }

        let long = "a".repeat(MAX_TAG_LENGTH + 1);
        assert_eq!(
            long.parse::<Tag>(),
            Err(ValidationError::TagTooLong(long.clone()))
        );
    }

    #[test]
    fn tags_are_sorted_and_joined() {
        let mut changes = test_changes();
        plan(&tags(&["web", "prod", "web"]), None, &mut changes);
        assert_eq!(
            Value::Object(finish(changes).request_body()),
            json!({ "tags": "prod;web" })
        );
    }

    #[test]
    fn empty_set_deletes_tags() {
        let mut changes = test_changes();
        plan(&BTreeSet::new(), Some(&tags(&["prod"])), &mut changes);
        assert_eq!(finish(changes).delete(), ["tags"]);

        let mut changes = test_changes();
        plan(&BTreeSet::new(), None, &mut changes);
        assert!(finish(changes).is_empty());
    }

    #[test]
    fn unchanged_tags_are_empty() {
        let current = tags(&["a", "b"]);
        let mut changes = test_changes();
        plan(&tags(&["b", "a"]), Some(&current), &mut changes);
        assert!(finish(changes).is_empty());
    }

    #[test]
    fn decode_from_wire() {
        let cfg = wire(json!({ "tags": "prod;web,db ops" }));
        assert_eq!(
            from_wire(&cfg).unwrap(),
            Some(tags(&["db", "ops", "prod", "web"]))
        );
        assert_eq!(from_wire(&wire(json!({ "tags": "" }))).unwrap(), None);
        assert!(from_wire(&wire(json!({ "tags": "-bad" }))).is_err());
    }
}
