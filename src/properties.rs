//! Core value types shared by the property tree, the stores, the cache and the watcher.
//!
//! - [PropertyNode]: one addressed element of a contact document
//! - [NodeKind] / [PropertyKind]: structural kind and value kind of a node
//! - [PropertyAttributes]: the metadata snapshot returned by attribute queries
//! - [ContactId] / [ElementId]: GUID newtypes for records and array nodes
//! - [ContactType]: the record file classes tracked on disk

use chrono::{DateTime, Utc};
use enumset::{EnumSet, EnumSetType};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter},
    path::Path,
    str::FromStr,
};
use uuid::Uuid;

use crate::{codec::xml::XmlId, error::ContactError};

/// Logical identity of a contact record: the GUID held by its first live
/// `ContactIDCollection/ContactID[n]/Value`. Stable across renames of the backing file.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ContactId(Uuid);

impl ContactId {
    pub fn new() -> Self {
        ContactId(Uuid::new_v4())
    }

    pub fn nil() -> Self {
        ContactId(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ContactId {
    fn default() -> Self {
        ContactId::nil()
    }
}

impl From<Uuid> for ContactId {
    fn from(id: Uuid) -> Self {
        ContactId(id)
    }
}

impl FromStr for ContactId {
    type Err = ContactError;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        Ok(ContactId(parse_guid(string)?))
    }
}

impl Display for ContactId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// The `ElementID` attribute carried by every array node.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ElementId(Uuid);

impl ElementId {
    pub fn new() -> Self {
        ElementId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ElementId {
    fn default() -> Self {
        ElementId::new()
    }
}

impl FromStr for ElementId {
    type Err = ContactError;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        Ok(ElementId(parse_guid(string)?))
    }
}

impl Display for ElementId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// GUIDs are accepted with or without surrounding braces.
pub(crate) fn parse_guid(string: &str) -> Result<Uuid, ContactError> {
    let trimmed = string.trim();
    let bare = trimmed
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .unwrap_or(trimmed);
    Ok(Uuid::parse_str(bare)?)
}

/// Structural kind of a [PropertyNode].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// The document root or the top-level extension container
    RootElement,
    /// Named container of repeatable array nodes
    ElementCollection,
    /// One repeatable entry of a collection
    ElementNode,
    /// A value-bearing leaf
    LeafProperty,
}

/// Value kind reported by attribute queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyKind {
    String,
    DateTime,
    Binary,
    ArrayNode,
}

impl PropertyKind {
    /// The `type` attribute value written on simple-extension leaves.
    pub fn type_attribute(&self) -> &'static str {
        match self {
            PropertyKind::String => "string",
            PropertyKind::DateTime => "dateTime",
            PropertyKind::Binary => "binary",
            PropertyKind::ArrayNode => "arrayNode",
        }
    }
}

/// Arena index of a [PropertyNode] inside a [crate::store::tree::ContactTree].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropId(pub(crate) usize);

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyNode {
    /// Full property address, empty for root elements
    pub name: String,
    pub local_name: String,
    pub kind: NodeKind,
    /// Short simple-extension namespace, e.g. `WOW` for `[WOW]Server`
    pub namespace: Option<String>,
    pub value: Option<String>,
    pub content_type: Option<String>,
    /// Explicit `type` attribute, only carried by simple extensions
    pub type_hint: Option<String>,
    pub version: u32,
    pub element_id: Option<ElementId>,
    pub modified: Option<DateTime<Utc>>,
    pub nil: bool,
    pub labels: Vec<String>,
    pub children: Vec<PropId>,
    pub parent: Option<PropId>,
    pub(crate) element: Option<XmlId>,
}

impl PropertyNode {
    pub fn new(local_name: &str, kind: NodeKind) -> Self {
        PropertyNode {
            name: String::new(),
            local_name: local_name.to_string(),
            kind,
            namespace: None,
            value: None,
            content_type: None,
            type_hint: None,
            version: 1,
            element_id: None,
            modified: None,
            nil: false,
            labels: Vec::new(),
            children: Vec::new(),
            parent: None,
            element: None,
        }
    }

    pub fn is_addressable(&self) -> bool {
        !matches!(self.kind, NodeKind::RootElement)
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.kind, NodeKind::ElementCollection)
    }

    pub fn is_array_node(&self) -> bool {
        matches!(self.kind, NodeKind::ElementNode)
    }

    /// Value kind, deciding by explicit type hint, then content type, then structure, then by
    /// whether the value reads as a date.
    pub fn property_kind(&self) -> Option<PropertyKind> {
        match self.kind {
            NodeKind::RootElement | NodeKind::ElementCollection => return None,
            NodeKind::ElementNode => return Some(PropertyKind::ArrayNode),
            NodeKind::LeafProperty => {}
        }
        if let Some(hint) = self.type_hint.as_deref() {
            match hint {
                "dateTime" => return Some(PropertyKind::DateTime),
                "binary" => return Some(PropertyKind::Binary),
                "string" => return Some(PropertyKind::String),
                _ => {}
            }
        }
        if self.content_type.is_some() {
            return Some(PropertyKind::Binary);
        }
        match self.value.as_deref() {
            Some(value) if crate::codec::values::parse_date(value).is_ok() => {
                Some(PropertyKind::DateTime)
            }
            _ => Some(PropertyKind::String),
        }
    }

    /// Label filter match. An empty filter always matches. Comparison is case-insensitive.
    pub fn matches_labels<S: AsRef<str>>(&self, filter: &[S], match_any: bool) -> bool {
        if filter.is_empty() {
            return true;
        }
        let has = |wanted: &S| {
            self.labels
                .iter()
                .any(|label| label.eq_ignore_ascii_case(wanted.as_ref().trim()))
        };
        if match_any {
            filter.iter().any(has)
        } else {
            filter.iter().all(has)
        }
    }
}

/// Metadata snapshot of an addressable, non-collection property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyAttributes {
    pub name: String,
    pub kind: PropertyKind,
    pub version: u32,
    pub element_id: Option<ElementId>,
    pub modified: DateTime<Utc>,
    pub nil: bool,
}

/// Record file classes. Each is tracked by file extension.
#[derive(Debug, Serialize, Deserialize, PartialOrd, Ord, Hash, EnumSetType)]
#[enumset(serialize_repr = "list")]
pub enum ContactType {
    Contact,
    Group,
    Organization,
}

impl ContactType {
    pub fn extension(&self) -> &'static str {
        match self {
            ContactType::Contact => "contact",
            ContactType::Group => "group",
            ContactType::Organization => "organization",
        }
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Option<ContactType> {
        let ext = path.as_ref().extension()?.to_str()?;
        EnumSet::<ContactType>::all()
            .iter()
            .find(|kind| ext.eq_ignore_ascii_case(kind.extension()))
    }

    /// True when `path` carries the extension of one of the types in `types`.
    pub fn matches<P: AsRef<Path>>(types: EnumSet<ContactType>, path: P) -> bool {
        ContactType::from_path(path)
            .map(|kind| types.contains(kind))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guid_parsing_accepts_braces() {
        let id = ContactId::new();
        let braced = format!("{{{id}}}");
        assert_eq!(braced.parse::<ContactId>().unwrap(), id);
        assert!("not-a-guid".parse::<ContactId>().is_err());
    }

    #[test]
    fn test_contact_type_from_path() {
        assert_eq!(
            ContactType::from_path("/tmp/Bob.CONTACT"),
            Some(ContactType::Contact)
        );
        assert_eq!(
            ContactType::from_path("team.group"),
            Some(ContactType::Group)
        );
        assert_eq!(ContactType::from_path("notes.txt"), None);
        assert!(!ContactType::matches(
            EnumSet::only(ContactType::Group),
            "a.contact"
        ));
        assert!(!ContactType::matches(EnumSet::empty(), "a.contact"));
    }

    #[test]
    fn test_label_matching() {
        let mut node = PropertyNode::new("EmailAddress", NodeKind::ElementNode);
        node.labels = vec!["Business".to_string(), "Preferred".to_string()];
        assert!(node.matches_labels(&["business"], false));
        assert!(node.matches_labels(&["Business", "Personal"], true));
        assert!(!node.matches_labels(&["Business", "Personal"], false));
        assert!(node.matches_labels::<&str>(&[], false));
    }

    #[test]
    fn test_property_kind_resolution() {
        let mut leaf = PropertyNode::new("Notes", NodeKind::LeafProperty);
        leaf.value = Some("hello".to_string());
        assert_eq!(leaf.property_kind(), Some(PropertyKind::String));
        leaf.value = Some("2008-01-01T12:00:00Z".to_string());
        assert_eq!(leaf.property_kind(), Some(PropertyKind::DateTime));
        leaf.content_type = Some("image/png".to_string());
        leaf.value = Some("AAAA".to_string());
        assert_eq!(leaf.property_kind(), Some(PropertyKind::Binary));

        let collection = PropertyNode::new("NameCollection", NodeKind::ElementCollection);
        assert_eq!(collection.property_kind(), None);
    }
}
