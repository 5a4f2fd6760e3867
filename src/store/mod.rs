//! Property stores over a single contact record.
//!
//! Both [ReadonlyStore] and [WriteableStore] expose the same query surface through the
//! [ContactProperties] trait: existence checks, typed getters, label lookups and enumeration.
//! [WriteableStore] adds rollback-safe mutation. Every edit is checked against the [Schema]
//! before the property tree changes, and a failed edit leaves the store exactly as it was.
//!
//! ```rust
//! use contact_core::{codec::schema::Schema, store::{ContactProperties, WriteableStore}};
//!
//! let schema = Schema::contact()?;
//! let mut contact = WriteableStore::new_contact(schema)?;
//! let email = contact.create_array_node("EmailAddressCollection", true)?;
//! contact.set_string(&format!("{email}/Address"), "someone@example.com")?;
//! contact.add_labels(&email, &["Business"])?;
//! assert_eq!(
//!     contact.get_labeled_node("EmailAddressCollection", &["Business"])?,
//!     Some(email)
//! );
//! # Ok::<(), contact_core::ContactError>(())
//! ```

pub mod labels;
pub mod readonly;
pub(crate) mod transaction;
pub mod tree;
pub mod writeable;


use chrono::{DateTime, Utc};

use crate::{
    codec::{
        schema::{names, Schema},
        values::{decode_binary, parse_date},
        xml::XmlDocument,
    },
    error::ContactError,
    properties::{ContactId, NodeKind, PropId, PropertyAttributes},
};

pub use readonly::ReadonlyStore;
pub use tree::ContactTree;
pub use writeable::WriteableStore;

/// Parse, validate and build the property tree for one record.
pub(crate) fn load_document(
    text: &str,
    schema: &Schema,
) -> Result<(XmlDocument, ContactTree), ContactError> {
    let doc = XmlDocument::parse(text)?;
    schema.validate(&doc).map_err(|err| match err {
        ContactError::SchemaViolation(msg) => ContactError::MalformedDocument(msg),
        other => other,
    })?;
    let tree = ContactTree::build(&doc, schema)?;
    Ok((doc, tree))
}

/// The read surface shared by every contact store.
pub trait ContactProperties {
    /// The property tree, or [ContactError::ObjectUnusable] once the store is poisoned.
    fn tree(&self) -> Result<&ContactTree, ContactError>;

    fn schema(&self) -> &Schema;

    fn exists(&self, name: &str) -> Result<bool, ContactError> {
        Ok(self.tree()?.find(name).is_some())
    }

    fn get_attributes(&self, name: &str) -> Result<PropertyAttributes, ContactError> {
        self.tree()?.attributes(name)
    }

    /// Leaf text. Missing or tombstoned leaves read as the empty string.
    fn get_string(&self, name: &str) -> Result<String, ContactError> {
        let tree = self.tree()?;
        match tree.node(name) {
            None => Ok(String::new()),
            Some(node) if node.kind != NodeKind::LeafProperty => Err(
                ContactError::SchemaViolation(format!("'{name}' does not hold a value")),
            ),
            Some(node) if node.nil => Ok(String::new()),
            Some(node) => Ok(node.value.clone().unwrap_or_default()),
        }
    }

    fn get_date(&self, name: &str) -> Result<Option<DateTime<Utc>>, ContactError> {
        let tree = self.tree()?;
        match tree.node(name) {
            None => Ok(None),
            Some(node) if node.nil => Ok(None),
            Some(node) => match node.value.as_deref() {
                Some(value) => parse_date(value).map(Some),
                None => Ok(None),
            },
        }
    }

    /// Binary leaf content and its content type.
    fn get_binary(&self, name: &str) -> Result<Option<(Vec<u8>, String)>, ContactError> {
        let tree = self.tree()?;
        let node = match tree.node(name) {
            None => return Ok(None),
            Some(node) if node.nil => return Ok(None),
            Some(node) => node,
        };
        let content_type = node.content_type.clone().ok_or_else(|| {
            ContactError::SchemaViolation(format!("'{name}' has no {}", names::CONTENT_TYPE))
        })?;
        let bytes = decode_binary(node.value.as_deref().unwrap_or_default())?;
        Ok(Some((bytes, content_type)))
    }

    /// Labels on an array node, `None` when the node does not exist.
    fn get_labels(&self, node: &str) -> Result<Option<Vec<String>>, ContactError> {
        Ok(self.tree()?.node(node).map(|n| n.labels.clone()))
    }

    /// First node of `collection` carrying every label in `filter`, preferring one that is
    /// also labelled `Preferred`.
    fn get_labeled_node(
        &self,
        collection: &str,
        filter: &[&str],
    ) -> Result<Option<String>, ContactError> {
        let mut preferred: Vec<&str> = filter.to_vec();
        preferred.push(names::PREFERRED);
        if let Some(first) = self.enumerate(Some(collection), &preferred, false)?.next() {
            return Ok(Some(first.name));
        }
        Ok(self
            .enumerate(Some(collection), filter, false)?
            .next()
            .map(|attrs| attrs.name))
    }

    /// Depth-first walk of properties, skipping collections and roots. With `collection` set,
    /// only that collection is walked. A missing collection yields nothing.
    fn enumerate<'a>(
        &'a self,
        collection: Option<&str>,
        filter: &[&str],
        match_any: bool,
    ) -> Result<PropertyIter<'a>, ContactError> {
        let tree = self.tree()?;
        let start = match collection {
            None => Some(tree.root()),
            Some(name) => match tree.find(name) {
                None => None,
                Some(id) => {
                    let is_collection = tree.get(id).map(|n| n.is_collection()).unwrap_or(false);
                    if !is_collection {
                        return Err(ContactError::SchemaViolation(format!(
                            "'{name}' is not a collection"
                        )));
                    }
                    Some(id)
                }
            },
        };
        Ok(PropertyIter::new(
            tree,
            start,
            filter.iter().map(|s| s.to_string()).collect(),
            match_any,
        ))
    }

    /// Every live ContactID value, in document order.
    fn contact_ids(&self) -> Result<Vec<ContactId>, ContactError> {
        let mut ids = Vec::new();
        for attrs in self.enumerate(Some(names::CONTACT_ID_COLLECTION), &[], false)? {
            if attrs.kind != crate::properties::PropertyKind::ArrayNode || attrs.nil {
                continue;
            }
            let value = self.get_string(&format!("{}/{}", attrs.name, names::VALUE))?;
            if let Ok(id) = value.parse::<ContactId>() {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// The record's logical id.
    fn contact_id(&self) -> Result<ContactId, ContactError> {
        self.contact_ids()?.into_iter().next().ok_or_else(|| {
            ContactError::SchemaViolation(format!(
                "Record has no live {}",
                names::CONTACT_ID
            ))
        })
    }
}

/// Lazy, finite walk over a store's properties. Borrowing the store keeps it from being
/// written while the walk is in progress.
pub struct PropertyIter<'a> {
    tree: &'a ContactTree,
    stack: Vec<PropId>,
    filter: Vec<String>,
    match_any: bool,
}

impl<'a> PropertyIter<'a> {
    fn new(
        tree: &'a ContactTree,
        start: Option<PropId>,
        filter: Vec<String>,
        match_any: bool,
    ) -> Self {
        let mut stack = start
            .and_then(|id| tree.get(id))
            .map(|node| node.children.clone())
            .unwrap_or_default();
        stack.reverse();
        PropertyIter {
            tree,
            stack,
            filter,
            match_any,
        }
    }
}

impl Iterator for PropertyIter<'_> {
    type Item = PropertyAttributes;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.stack.pop() {
            let node = match self.tree.get(id) {
                Some(node) => node,
                None => continue,
            };
            self.stack.extend(node.children.iter().rev().copied());
            if !node.is_addressable() || node.is_collection() {
                continue;
            }
            if !node.matches_labels(&self.filter, self.match_any) {
                continue;
            }
            match self.tree.attributes(&node.name) {
                Ok(attrs) => return Some(attrs),
                Err(err) => tracing::debug!("[PropertyIter] skipping '{}': {err}", node.name),
            }
        }
        None
    }
}
