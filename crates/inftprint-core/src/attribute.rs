// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Attribute engine: building, filtering, and validating IPP attribute
// groups on top of the wire types the `ipp` crate already provides.

use std::collections::HashSet;

use ipp::attribute::{IppAttribute, IppAttributes};
use ipp::model::DelimiterTag;
use ipp::value::IppValue;

/// The set of attribute names a client asked for via `requested-attributes`.
#[derive(Debug, Clone)]
pub enum Requested {
    /// `requested-attributes` contained `"all"`, or was absent (server default).
    All,
    /// An explicit set of attribute names.
    Names(HashSet<String>),
}

impl Requested {
    pub fn from_values(values: &[IppValue]) -> Self {
        let mut names = HashSet::new();
        for v in values {
            if let IppValue::Keyword(k) = v {
                if k == "all" {
                    return Requested::All;
                }
                names.insert(k.clone());
            }
        }
        if names.is_empty() {
            Requested::All
        } else {
            Requested::Names(names)
        }
    }

    pub fn wants(&self, name: &str) -> bool {
        match self {
            Requested::All => true,
            Requested::Names(names) => names.contains(name),
        }
    }
}

/// The permitted IPP value syntax for an attribute, checked by
/// [`valid_values`] alongside the name/cardinality constraints.
/// `Any` opts an attribute out of tag checking (e.g. `job-hold-until`,
/// which accepts either a keyword or a date-time).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueTag {
    Any,
    Integer,
    Enum,
    Boolean,
    Keyword,
    Uri,
    UriScheme,
    Charset,
    NaturalLanguage,
    MimeMediaType,
    NameWithoutLanguage,
    TextWithoutLanguage,
}

impl ValueTag {
    fn permits(&self, value: &IppValue) -> bool {
        match (self, value) {
            (ValueTag::Any, _) => true,
            (ValueTag::Integer, IppValue::Integer(_)) => true,
            (ValueTag::Enum, IppValue::Enum(_)) => true,
            (ValueTag::Boolean, IppValue::Boolean(_)) => true,
            (ValueTag::Keyword, IppValue::Keyword(_)) => true,
            (ValueTag::Uri, IppValue::Uri(_)) => true,
            (ValueTag::UriScheme, IppValue::UriScheme(_)) => true,
            (ValueTag::Charset, IppValue::Charset(_)) => true,
            (ValueTag::NaturalLanguage, IppValue::NaturalLanguage(_)) => true,
            (ValueTag::MimeMediaType, IppValue::MimeMediaType(_)) => true,
            (ValueTag::NameWithoutLanguage, IppValue::NameWithoutLanguage(_)) => true,
            (ValueTag::TextWithoutLanguage, IppValue::TextWithoutLanguage(_)) => true,
            _ => false,
        }
    }
}

/// A descriptor for one permitted attribute in a request, used by
/// [`valid_values`] to check cardinality and tag constraints.
pub struct AttributeDescriptor {
    pub name: &'static str,
    pub multi_allowed: bool,
    pub value_tag: ValueTag,
}

impl AttributeDescriptor {
    pub const fn new(name: &'static str, multi_allowed: bool, value_tag: ValueTag) -> Self {
        Self {
            name,
            multi_allowed,
            value_tag,
        }
    }
}

/// Validate that every attribute present at `group` in `attrs` belongs to
/// `allowed`, respects its cardinality constraint, and carries a permitted
/// value tag.
///
/// Returns the offending attributes (to be copied into the `unsupported`
/// group of the response) when any are rejected.
pub fn valid_values(
    attrs: &IppAttributes,
    group: DelimiterTag,
    allowed: &[AttributeDescriptor],
) -> Vec<IppAttribute> {
    let mut unsupported = Vec::new();
    for attr in attrs.groups_of(group).flat_map(|g| g.attributes().values()) {
        match allowed.iter().find(|d| d.name == attr.name()) {
            None => unsupported.push(attr.clone()),
            Some(d) => {
                let values: Vec<&IppValue> = match attr.value() {
                    IppValue::Array(values) => values.iter().collect(),
                    other => vec![other],
                };
                let bad_cardinality = !d.multi_allowed && values.len() > 1;
                let bad_tag = values.iter().any(|v| !d.value_tag.permits(v));
                if bad_cardinality || bad_tag {
                    unsupported.push(attr.clone());
                }
            }
        }
    }
    unsupported
}

/// Number of elements a (possibly `ListOf`) value represents.
pub fn value_count(value: &IppValue) -> usize {
    match value {
        IppValue::Array(values) => values.len(),
        _ => 1,
    }
}

/// Copy the subset of `source`'s attributes in `group` that the requester
/// asked for and is authorized to see.
///
/// `redacted` holds the names that must be omitted for an unauthorized
/// caller; `authorized` indicates whether the caller passed the object's
/// privacy check.
pub fn filter_group(
    source: &IppAttributes,
    group: DelimiterTag,
    requested: &Requested,
    redacted: &HashSet<String>,
    authorized: bool,
) -> Vec<IppAttribute> {
    source
        .groups_of(group)
        .flat_map(|g| g.attributes().values())
        .filter(|attr| requested.wants(attr.name()))
        .filter(|attr| authorized || !redacted.contains(attr.name()))
        .cloned()
        .collect()
}

/// Find the named attribute's raw value in `group` (may be `ListOf` for a
/// multi-valued attribute).
pub fn find<'a>(attrs: &'a IppAttributes, group: DelimiterTag, name: &str) -> Option<&'a IppValue> {
    attrs
        .groups_of(group)
        .flat_map(|g| g.attributes().values())
        .find(|a| a.name() == name)
        .map(|a| a.value())
}

/// Find the first scalar value of a named attribute in `group`, flattening
/// `ListOf`.
pub fn first_value<'a>(
    attrs: &'a IppAttributes,
    group: DelimiterTag,
    name: &str,
) -> Option<&'a IppValue> {
    find(attrs, group, name).map(flatten_first).unwrap_or(None)
}

/// Find all scalar values of a named attribute in `group`, flattening
/// `ListOf`.
pub fn all_values<'a>(attrs: &'a IppAttributes, group: DelimiterTag, name: &str) -> Vec<&'a IppValue> {
    match find(attrs, group, name) {
        Some(IppValue::Array(values)) => values.iter().collect(),
        Some(other) => vec![other],
        None => Vec::new(),
    }
}

fn flatten_first(value: &IppValue) -> Option<&IppValue> {
    match value {
        IppValue::Array(values) => values.first(),
        other => Some(other),
    }
}

/// Extract a keyword or name-without-language value as an owned `String`.
pub fn as_text(value: &IppValue) -> Option<String> {
    match value {
        IppValue::Keyword(s)
        | IppValue::NameWithoutLanguage(s)
        | IppValue::TextWithoutLanguage(s)
        | IppValue::Uri(s)
        | IppValue::UriScheme(s)
        | IppValue::MimeMediaType(s)
        | IppValue::Charset(s)
        | IppValue::NaturalLanguage(s) => Some(s.clone()),
        _ => None,
    }
}

/// Extract an integer-like value (`Integer`, `Enum`).
pub fn as_i32(value: &IppValue) -> Option<i32> {
    match value {
        IppValue::Integer(i) | IppValue::Enum(i) => Some(*i),
        _ => None,
    }
}

/// Extract a boolean value.
pub fn as_bool(value: &IppValue) -> Option<bool> {
    match value {
        IppValue::Boolean(b) => Some(*b),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requested_all_when_keyword_all_present() {
        let req = Requested::from_values(&[IppValue::Keyword("all".into())]);
        assert!(matches!(req, Requested::All));
        assert!(req.wants("anything"));
    }

    #[test]
    fn requested_names_filters_precisely() {
        let req = Requested::from_values(&[
            IppValue::Keyword("job-id".into()),
            IppValue::Keyword("job-state".into()),
        ]);
        assert!(req.wants("job-id"));
        assert!(!req.wants("job-name"));
    }

    #[test]
    fn empty_requested_attributes_means_all() {
        let req = Requested::from_values(&[]);
        assert!(matches!(req, Requested::All));
    }
}
