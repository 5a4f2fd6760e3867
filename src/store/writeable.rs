//! [WriteableStore]: rollback-safe edits over one contact record.
//!
//! Each public mutation runs inside [WriteableStore::transact]. Replacement elements are built off
//! to the side, spliced into the document, and the whole record is re-validated before the
//! property tree is touched. Any failure replays the undo log. A store whose rollback fails is
//! poisoned and answers every later call with [ContactError::ObjectUnusable].

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::{path::Path, sync::Arc};

use crate::{
    codec::{
        schema::{is_nil, names, Schema, CONTACT_PREFIX, XSI_NAMESPACE, XSI_PREFIX},
        values::{encode_binary, format_date, DEFAULT_MIME_TYPE},
        xml::{
            with_attribute, without_attribute, QualifiedName, XmlAttribute, XmlDocument,
            XmlElement, XmlId, XmlNode,
        },
    },
    error::ContactError,
    paths::{AddressKind, PropertyAddress},
    properties::{ContactId, ElementId, NodeKind, PropId, PropertyNode},
    store::{
        labels::new_labels, load_document, readonly::ReadonlyStore, transaction::Transaction,
        tree::ContactTree, ContactProperties,
    },
};

#[derive(Debug)]
pub struct WriteableStore {
    schema: Arc<Schema>,
    document: XmlDocument,
    tree: ContactTree,
    unusable: bool,
    unchanged: bool,
}

impl WriteableStore {
    /// A fresh record with a new ContactID and a creation date of now.
    pub fn new_contact(schema: Arc<Schema>) -> Result<WriteableStore, ContactError> {
        let now = format_date(&Utc::now());
        let text = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<{c}:{root} {c}:{version}="1" xmlns:{c}="{ns}" xmlns:{xsi}="{xsi_ns}">
  <{c}:{created}>{now}</{c}:{created}>
  <{c}:{extended} {xsi}:{nil}="true"/>
  <{c}:{ids}>
    <{c}:{id} {c}:{element_id}="{element}" {c}:{version}="1" {c}:{modified}="{now}">
      <{c}:{value}>{contact}</{c}:{value}>
    </{c}:{id}>
  </{c}:{ids}>
</{c}:{root}>"#,
            c = CONTACT_PREFIX,
            xsi = XSI_PREFIX,
            ns = schema.contact_namespace(),
            xsi_ns = XSI_NAMESPACE,
            root = names::ROOT,
            version = names::VERSION,
            created = names::CREATION_DATE,
            extended = names::EXTENDED,
            nil = names::NIL,
            ids = names::CONTACT_ID_COLLECTION,
            id = names::CONTACT_ID,
            element_id = names::ELEMENT_ID,
            element = ElementId::new(),
            modified = names::MODIFICATION_DATE,
            value = names::VALUE,
            contact = ContactId::new(),
        );
        WriteableStore::parse(&text, schema)
    }

    pub fn parse(text: &str, schema: Arc<Schema>) -> Result<WriteableStore, ContactError> {
        let (document, tree) = load_document(text, &schema)?;
        Ok(WriteableStore {
            schema,
            document,
            tree,
            unusable: false,
            unchanged: true,
        })
    }

    pub fn load<P: AsRef<Path>>(
        path: P,
        schema: Arc<Schema>,
    ) -> Result<WriteableStore, ContactError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        WriteableStore::parse(&text, schema)
    }

    /// An editable copy of a shared record.
    pub fn from_readonly(store: &ReadonlyStore) -> Result<WriteableStore, ContactError> {
        WriteableStore::parse(store.source(), store.schema_arc())
    }

    /// True until the first successful mutation.
    pub fn is_unchanged(&self) -> bool {
        self.unchanged
    }

    pub fn save_to_string(&self) -> Result<String, ContactError> {
        self.ensure_usable()?;
        self.document.to_xml_string()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ContactError> {
        let text = self.save_to_string()?;
        std::fs::write(path.as_ref(), text)?;
        Ok(())
    }

    /// SHA-256 of the serialized record, hex encoded.
    pub fn content_hash(&self) -> Result<String, ContactError> {
        let text = self.save_to_string()?;
        Ok(hex::encode(Sha256::digest(text.as_bytes())))
    }

    fn ensure_usable(&self) -> Result<(), ContactError> {
        if self.unusable {
            return Err(ContactError::ObjectUnusable);
        }
        Ok(())
    }

    /// Run `op` against an undo-logged transaction. Errors roll every recorded write back.
    pub(crate) fn transact<T, F>(&mut self, op: F) -> Result<T, ContactError>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, ContactError>,
    {
        self.ensure_usable()?;
        let mut tx = Transaction::new(&mut self.document, &mut self.tree, &self.schema);
        match op(&mut tx) {
            Ok(value) => {
                let writes = tx.commit();
                tracing::trace!("[WriteableStore] committed {writes} writes");
                self.unchanged = false;
                Ok(value)
            }
            Err(err) => {
                match tx.rollback() {
                    Ok(()) => tracing::debug!("[WriteableStore] rolled back: {err}"),
                    Err(rollback_err) => {
                        tracing::error!(
                            "[WriteableStore] rollback failed ({rollback_err}); store is unusable"
                        );
                        self.unusable = true;
                    }
                }
                Err(err)
            }
        }
    }

    /// Insert a new, empty array node into `collection` and return its address.
    ///
    /// `collection` is either a schematized collection (`EmailAddressCollection`) or the
    /// extension creation form `[ns:Node]Collection`.
    pub fn create_array_node(
        &mut self,
        collection: &str,
        append: bool,
    ) -> Result<String, ContactError> {
        self.ensure_usable()?;
        let address = PropertyAddress::parse(collection, &self.schema)?;
        let target = match address.kind {
            AddressKind::SchematizedCollection => {
                let node = self.schema.node_name(&address.level1).ok_or_else(|| {
                    ContactError::SchemaViolation(format!("Unknown collection '{collection}'"))
                })?;
                NodeTarget {
                    collection: address.level1.clone(),
                    node: node.to_string(),
                    namespace: None,
                }
            }
            AddressKind::ExtensionCreation => NodeTarget {
                collection: address.level1.clone(),
                node: address.level2.clone().unwrap_or_default(),
                namespace: address.namespace.clone(),
            },
            _ => {
                return Err(ContactError::SchemaViolation(format!(
                    "'{collection}' is not a collection"
                )))
            }
        };
        let name = self.transact(|tx| create_node(tx, &target, append))?;
        tracing::debug!("[WriteableStore] created {name}");
        Ok(name)
    }

    /// Tombstone an array node. `Ok(false)` when it is missing or already empty.
    pub fn delete_array_node(&mut self, name: &str) -> Result<bool, ContactError> {
        self.delete(name, true)
    }

    /// Tombstone a leaf or collection. `Ok(false)` when it is missing or already empty.
    pub fn delete_property(&mut self, name: &str) -> Result<bool, ContactError> {
        self.delete(name, false)
    }

    fn delete(&mut self, name: &str, array_node: bool) -> Result<bool, ContactError> {
        self.ensure_usable()?;
        let id = match self.tree.find(name) {
            Some(id) => id,
            None => return Ok(false),
        };
        let node = self.tree.get(id).ok_or_else(|| unknown_node(id))?;
        match node.kind {
            NodeKind::RootElement => {
                return Err(ContactError::SchemaViolation(format!(
                    "'{name}' cannot be deleted"
                )))
            }
            NodeKind::ElementNode if !array_node => {
                return Err(ContactError::SchemaViolation(format!(
                    "'{name}' is an array node"
                )))
            }
            kind if array_node && kind != NodeKind::ElementNode => {
                return Err(ContactError::SchemaViolation(format!(
                    "'{name}' is not an array node"
                )))
            }
            _ => {}
        }
        let empty = node.nil
            && node.children.is_empty()
            && node.labels.is_empty()
            && node.value.as_deref().map_or(true, str::is_empty);
        if empty {
            return Ok(false);
        }
        self.transact(|tx| tombstone(tx, id))?;
        tracing::debug!("[WriteableStore] deleted {name}");
        Ok(true)
    }

    pub fn set_string(&mut self, name: &str, value: &str) -> Result<(), ContactError> {
        if value.is_empty() {
            return Err(ContactError::InvalidArgument(format!(
                "Empty value for '{name}'; use delete_property to clear it"
            )));
        }
        self.set_leaf(
            name,
            LeafWrite {
                text: value.to_string(),
                content_type: None,
                type_hint: "string",
            },
        )
    }

    pub fn set_date(&mut self, name: &str, value: DateTime<Utc>) -> Result<(), ContactError> {
        self.set_leaf(
            name,
            LeafWrite {
                text: format_date(&value),
                content_type: None,
                type_hint: "dateTime",
            },
        )
    }

    /// Store `bytes` base64 encoded. `content_type` defaults to `binary`.
    pub fn set_binary(
        &mut self,
        name: &str,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<(), ContactError> {
        if bytes.is_empty() {
            return Err(ContactError::InvalidArgument(format!(
                "Empty binary value for '{name}'"
            )));
        }
        let content_type = content_type
            .map(str::trim)
            .filter(|ct| !ct.is_empty())
            .unwrap_or(DEFAULT_MIME_TYPE);
        self.set_leaf(
            name,
            LeafWrite {
                text: encode_binary(bytes),
                content_type: Some(content_type.to_string()),
                type_hint: "binary",
            },
        )
    }

    fn set_leaf(&mut self, name: &str, write: LeafWrite) -> Result<(), ContactError> {
        self.ensure_usable()?;
        let address = PropertyAddress::parse(name, &self.schema)?;
        if !address.kind.is_writable_leaf() {
            return Err(ContactError::SchemaViolation(format!(
                "'{name}' is not a writable property"
            )));
        }
        let parent = match address.kind {
            AddressKind::SchematizedTopLevel => LeafParent::Node(self.tree.root()),
            AddressKind::ExtensionTopLevel => match self.tree.extended_root() {
                Some(id) => LeafParent::Node(id),
                None => LeafParent::NewExtended,
            },
            _ => {
                let node_path = address.node_path().unwrap_or_default();
                let id = self
                    .tree
                    .find(&node_path)
                    .ok_or_else(|| ContactError::PropertyNotFound(node_path.clone()))?;
                if !self.tree.get(id).map_or(false, PropertyNode::is_array_node) {
                    return Err(ContactError::SchemaViolation(format!(
                        "'{node_path}' is not an array node"
                    )));
                }
                LeafParent::Node(id)
            }
        };
        let existing = self.tree.find(&address.to_string());
        if let Some(id) = existing {
            if self.tree.get(id).map(|n| n.kind) != Some(NodeKind::LeafProperty) {
                return Err(ContactError::SchemaViolation(format!(
                    "'{name}' does not hold a value"
                )));
            }
        }
        self.transact(|tx| write_leaf(tx, &address, parent, existing, &write))
    }

    /// Attach labels to an array node. Labels it already carries are skipped.
    pub fn add_labels<S: AsRef<str>>(
        &mut self,
        node: &str,
        labels: &[S],
    ) -> Result<(), ContactError> {
        self.ensure_usable()?;
        let id = self.array_node(node)?;
        let existing = self.tree.get(id).map(|n| n.labels.clone()).unwrap_or_default();
        let added = new_labels(&existing, labels)?;
        if added.is_empty() {
            return Ok(());
        }
        self.transact(|tx| append_labels(tx, id, &added))
    }

    /// Remove every label equal to `label`, ignoring case. `Ok(false)` when none matched.
    pub fn remove_label(&mut self, node: &str, label: &str) -> Result<bool, ContactError> {
        self.ensure_usable()?;
        let id = self.array_node(node)?;
        let label = label.trim().to_string();
        let present = self
            .tree
            .get(id)
            .map_or(false, |n| n.labels.iter().any(|l| l.eq_ignore_ascii_case(&label)));
        if !present {
            return Ok(false);
        }
        self.transact(|tx| drop_label(tx, id, &label))?;
        Ok(true)
    }

    pub fn clear_labels(&mut self, node: &str) -> Result<(), ContactError> {
        self.ensure_usable()?;
        let id = self.array_node(node)?;
        if self.tree.get(id).map_or(true, |n| n.labels.is_empty()) {
            return Ok(());
        }
        self.transact(|tx| tombstone_labels(tx, id))
    }

    fn array_node(&self, name: &str) -> Result<PropId, ContactError> {
        let id = self
            .tree
            .find(name)
            .ok_or_else(|| ContactError::PropertyNotFound(name.to_string()))?;
        match self.tree.get(id) {
            Some(node) if node.is_array_node() => Ok(id),
            _ => Err(ContactError::SchemaViolation(format!(
                "'{name}' is not an array node"
            ))),
        }
    }
}

impl ContactProperties for WriteableStore {
    fn tree(&self) -> Result<&ContactTree, ContactError> {
        self.ensure_usable()?;
        Ok(&self.tree)
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }
}

struct NodeTarget {
    collection: String,
    node: String,
    namespace: Option<String>,
}

impl NodeTarget {
    fn collection_address(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("[{ns}]{}", self.collection),
            None => self.collection.clone(),
        }
    }
}

struct LeafWrite {
    text: String,
    content_type: Option<String>,
    /// `type` attribute carried by extension leaves
    type_hint: &'static str,
}

#[derive(Clone, Copy)]
enum LeafParent {
    Node(PropId),
    NewExtended,
}

fn unknown_node(id: PropId) -> ContactError {
    ContactError::Custom(format!("Unknown property node {}", id.0))
}

fn xml_of(tx: &Transaction<'_>, id: PropId) -> Result<XmlId, ContactError> {
    tx.tree
        .get(id)
        .and_then(|n| n.element)
        .ok_or_else(|| unknown_node(id))
}

fn extension_prefix(short: &str) -> String {
    let prefix: String = short
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    let reserved = prefix == CONTACT_PREFIX
        || prefix == XSI_PREFIX
        || prefix.to_ascii_lowercase().starts_with("xml");
    if reserved {
        format!("{prefix}_")
    } else {
        prefix
    }
}

/// Element name in the contact namespace, or in the simple-extension namespace `short`.
fn element_name(tx: &Transaction<'_>, short: Option<&str>, local: &str) -> QualifiedName {
    let (namespace, fallback) = match short {
        None => (
            tx.schema().contact_namespace().to_string(),
            CONTACT_PREFIX.to_string(),
        ),
        Some(short) => (
            tx.schema().extension_namespace_for(short),
            extension_prefix(short),
        ),
    };
    let prefix = tx.doc.declared_prefix(&namespace).unwrap_or(Some(fallback));
    QualifiedName::new(prefix.as_deref(), local, Some(&namespace))
}

/// Attributes need an explicit prefix to carry a namespace.
fn prefixed_attribute(
    tx: &Transaction<'_>,
    namespace: &str,
    fallback: &str,
    local: &str,
) -> QualifiedName {
    let prefix = match tx.doc.declared_prefix(namespace) {
        Some(Some(prefix)) => prefix,
        _ => fallback.to_string(),
    };
    QualifiedName::new(Some(&prefix), local, Some(namespace))
}

fn contact_attribute(tx: &Transaction<'_>, local: &str) -> QualifiedName {
    let namespace = tx.schema().contact_namespace().to_string();
    prefixed_attribute(tx, &namespace, CONTACT_PREFIX, local)
}

fn nil_attribute(tx: &Transaction<'_>) -> QualifiedName {
    prefixed_attribute(tx, XSI_NAMESPACE, XSI_PREFIX, names::NIL)
}

fn type_attribute() -> QualifiedName {
    QualifiedName::new(None, names::TYPE, None)
}

fn stamp(
    tx: &Transaction<'_>,
    attributes: Vec<XmlAttribute>,
    version: u32,
    now: &DateTime<Utc>,
) -> Vec<XmlAttribute> {
    let attributes = with_attribute(
        attributes,
        contact_attribute(tx, names::VERSION),
        version.to_string(),
    );
    with_attribute(
        attributes,
        contact_attribute(tx, names::MODIFICATION_DATE),
        format_date(now),
    )
}

fn attributes_of(tx: &Transaction<'_>, xml: XmlId) -> Vec<XmlAttribute> {
    tx.doc
        .element(xml)
        .map(|el| el.attributes.clone())
        .unwrap_or_default()
}

fn clear_nil_xml(tx: &mut Transaction<'_>, xml: XmlId) -> Result<(), ContactError> {
    let nil = tx.doc.element(xml).map_or(false, is_nil);
    if nil {
        let attributes = without_attribute(attributes_of(tx, xml), Some(XSI_NAMESPACE), names::NIL);
        tx.set_xml_attributes(xml, attributes)?;
    }
    Ok(())
}

fn clear_nil_tree(tx: &mut Transaction<'_>, id: PropId) -> Result<(), ContactError> {
    if tx.tree.get(id).map_or(false, |n| n.nil) {
        tx.update_tree_node(id, |n| n.nil = false)?;
    }
    Ok(())
}

fn insert_tree_child(
    tx: &mut Transaction<'_>,
    parent: PropId,
    child: PropId,
    at_head: bool,
) -> Result<(), ContactError> {
    let mut children = tx
        .tree
        .get(parent)
        .map(|n| n.children.clone())
        .ok_or_else(|| unknown_node(parent))?;
    if at_head {
        children.insert(0, child);
    } else {
        children.push(child);
    }
    tx.set_tree_children(parent, children)
}

/// `start` and everything beneath it, depth first.
fn subtree(tree: &ContactTree, start: PropId) -> Vec<PropId> {
    let mut out = Vec::new();
    let mut stack = vec![start];
    while let Some(id) = stack.pop() {
        out.push(id);
        if let Some(node) = tree.get(id) {
            stack.extend(node.children.iter().rev().copied());
        }
    }
    out
}

/// Re-key every array node of `collection` to its 1-based position.
fn renumber(tx: &mut Transaction<'_>, collection: PropId) -> Result<(), ContactError> {
    let children = tx
        .tree
        .get(collection)
        .map(|n| n.children.clone())
        .unwrap_or_default();
    let mut index = 0;
    for child in children {
        let node = match tx.tree.get(child) {
            Some(node) if node.is_array_node() => node.clone(),
            _ => continue,
        };
        index += 1;
        let name = tx.tree.child_name(collection, &node, index);
        if name != node.name {
            rename_subtree(tx, child, &node.name, &name)?;
        }
    }
    Ok(())
}

fn rename_subtree(
    tx: &mut Transaction<'_>,
    start: PropId,
    old: &str,
    new: &str,
) -> Result<(), ContactError> {
    let mut renamed = Vec::new();
    for id in subtree(tx.tree, start) {
        let current = tx.tree.get(id).map(|n| n.name.clone()).unwrap_or_default();
        // A key already taken over by a shifted sibling is left alone.
        if !current.is_empty() && tx.tree.find(&current) == Some(id) {
            tx.set_lookup(&current, None)?;
        }
        let name = if id == start {
            new.to_string()
        } else {
            match current.strip_prefix(old) {
                Some(rest) if !old.is_empty() => format!("{new}{rest}"),
                _ => continue,
            }
        };
        let assigned = name.clone();
        tx.update_tree_node(id, move |n| n.name = assigned)?;
        renamed.push((name, id));
    }
    for (name, id) in renamed {
        tx.set_lookup(&name, Some(id))?;
    }
    Ok(())
}

/// Extension container element appended to the record root.
fn new_extended_xml(tx: &mut Transaction<'_>) -> Result<XmlId, ContactError> {
    let root_xml = xml_of(tx, tx.tree.root())?;
    let element = XmlElement::new(element_name(tx, None, names::EXTENDED));
    let xml = tx.doc.alloc_element(element);
    tx.insert_xml_child(root_xml, xml, false)?;
    Ok(xml)
}

fn attach_extended(
    tx: &mut Transaction<'_>,
    xml: XmlId,
    now: &DateTime<Utc>,
) -> Result<PropId, ContactError> {
    let root = tx.tree.root();
    let mut node = PropertyNode::new(names::EXTENDED, NodeKind::RootElement);
    node.modified = Some(*now);
    node.parent = Some(root);
    node.element = Some(xml);
    let id = tx.tree.alloc(node);
    insert_tree_child(tx, root, id, false)?;
    tx.set_extended_root(Some(id));
    Ok(id)
}

fn create_node(
    tx: &mut Transaction<'_>,
    target: &NodeTarget,
    append: bool,
) -> Result<String, ContactError> {
    let now = Utc::now();
    let root = tx.tree.root();
    let short = target.namespace.as_deref();

    let mut new_extended = None;
    let container_xml = match short {
        None => xml_of(tx, root)?,
        Some(_) => match tx.tree.extended_root() {
            Some(ext) => {
                let xml = xml_of(tx, ext)?;
                clear_nil_xml(tx, xml)?;
                xml
            }
            None => {
                let xml = new_extended_xml(tx)?;
                new_extended = Some(xml);
                xml
            }
        },
    };

    let existing_collection = tx.tree.find(&target.collection_address());
    let collection_xml = match existing_collection {
        Some(id) => {
            let node = tx.tree.get(id).ok_or_else(|| unknown_node(id))?;
            if !node.is_collection() {
                return Err(ContactError::SchemaViolation(format!(
                    "'{}' is not a collection",
                    node.name
                )));
            }
            let xml = xml_of(tx, id)?;
            clear_nil_xml(tx, xml)?;
            xml
        }
        None => {
            let mut element = XmlElement::new(element_name(tx, short, &target.collection));
            if short.is_some() {
                element
                    .attributes
                    .push(XmlAttribute::new(type_attribute(), names::ARRAY_ELEMENT));
            }
            let xml = tx.doc.alloc_element(element);
            tx.insert_xml_child(container_xml, xml, false)?;
            xml
        }
    };

    let element_id = ElementId::new();
    let mut attributes = vec![XmlAttribute::new(
        contact_attribute(tx, names::ELEMENT_ID),
        element_id.to_string(),
    )];
    attributes = stamp(tx, attributes, 1, &now);
    attributes.push(XmlAttribute::new(nil_attribute(tx), "true"));
    if short.is_some() {
        attributes.push(XmlAttribute::new(type_attribute(), names::ARRAY_NODE));
    }
    let mut element = XmlElement::new(element_name(tx, short, &target.node));
    element.attributes = attributes;
    let node_xml = tx.doc.alloc_element(element);
    tx.insert_xml_child(collection_xml, node_xml, !append)?;

    tx.validate()?;

    let container = match (short, new_extended) {
        (None, _) => root,
        (Some(_), Some(xml)) => attach_extended(tx, xml, &now)?,
        (Some(_), None) => {
            let ext = tx.tree.extended_root().ok_or_else(|| {
                ContactError::Custom("Extension container vanished".to_string())
            })?;
            clear_nil_tree(tx, ext)?;
            ext
        }
    };

    let collection = match existing_collection {
        Some(id) => {
            clear_nil_tree(tx, id)?;
            id
        }
        None => {
            let mut node = PropertyNode::new(&target.collection, NodeKind::ElementCollection);
            node.namespace = target.namespace.clone();
            node.modified = Some(now);
            node.parent = Some(container);
            node.element = Some(collection_xml);
            if short.is_some() {
                node.type_hint = Some(names::ARRAY_ELEMENT.to_string());
            }
            node.name = tx.tree.child_name(container, &node, 0);
            let name = node.name.clone();
            let id = tx.tree.alloc(node);
            insert_tree_child(tx, container, id, false)?;
            tx.set_lookup(&name, Some(id))?;
            id
        }
    };

    let mut node = PropertyNode::new(&target.node, NodeKind::ElementNode);
    node.namespace = target.namespace.clone();
    node.element_id = Some(element_id);
    node.modified = Some(now);
    node.nil = true;
    node.parent = Some(collection);
    node.element = Some(node_xml);
    if short.is_some() {
        node.type_hint = Some(names::ARRAY_NODE.to_string());
    }
    let id = tx.tree.alloc(node);
    insert_tree_child(tx, collection, id, !append)?;
    renumber(tx, collection)?;

    tx.tree
        .get(id)
        .map(|n| n.name.clone())
        .ok_or_else(|| unknown_node(id))
}

/// Swap the element for an empty nil copy, keeping its position and ElementID.
fn tombstone(tx: &mut Transaction<'_>, id: PropId) -> Result<(), ContactError> {
    let now = Utc::now();
    let node = tx.tree.get(id).cloned().ok_or_else(|| unknown_node(id))?;
    let old_xml = node.element.ok_or_else(|| unknown_node(id))?;
    let parent = node.parent.ok_or_else(|| unknown_node(id))?;
    let parent_xml = xml_of(tx, parent)?;
    let version = node.version.saturating_add(1);

    let copy = tx.doc.shallow_clone(old_xml)?;
    let contact_ns = tx.schema().contact_namespace().to_string();
    let attributes = without_attribute(
        attributes_of(tx, copy),
        Some(&contact_ns),
        names::CONTENT_TYPE,
    );
    let attributes = stamp(tx, attributes, version, &now);
    let attributes = with_attribute(attributes, nil_attribute(tx), "true");
    tx.doc.set_attributes(copy, attributes)?;
    tx.replace_xml_child(parent_xml, old_xml, copy)?;

    tx.validate()?;

    for descendant in subtree(tx.tree, id).into_iter().skip(1) {
        let name = tx
            .tree
            .get(descendant)
            .map(|n| n.name.clone())
            .unwrap_or_default();
        if tx.tree.find(&name) == Some(descendant) {
            tx.set_lookup(&name, None)?;
        }
    }
    tx.update_tree_node(id, move |n| {
        n.children.clear();
        n.labels.clear();
        n.value = None;
        n.content_type = None;
        n.nil = true;
        n.version = version;
        n.modified = Some(now);
        n.element = Some(copy);
    })
}

fn write_leaf(
    tx: &mut Transaction<'_>,
    address: &PropertyAddress,
    parent: LeafParent,
    existing: Option<PropId>,
    write: &LeafWrite,
) -> Result<(), ContactError> {
    let now = Utc::now();
    let short = address.namespace.as_deref();

    let (parent_xml, new_extended) = match parent {
        LeafParent::Node(id) => (xml_of(tx, id)?, None),
        LeafParent::NewExtended => {
            let xml = new_extended_xml(tx)?;
            (xml, Some(xml))
        }
    };
    clear_nil_xml(tx, parent_xml)?;

    let (leaf_xml, old_xml, version) = match existing {
        Some(id) => {
            let old = xml_of(tx, id)?;
            let version = tx.tree.get(id).map_or(1, |n| n.version.saturating_add(1));
            (tx.doc.shallow_clone(old)?, Some(old), version)
        }
        None => {
            let element = XmlElement::new(element_name(tx, short, address.local_name()));
            (tx.doc.alloc_element(element), None, 1)
        }
    };

    let contact_ns = tx.schema().contact_namespace().to_string();
    let mut attributes = without_attribute(
        attributes_of(tx, leaf_xml),
        Some(XSI_NAMESPACE),
        names::NIL,
    );
    attributes = stamp(tx, attributes, version, &now);
    attributes = match &write.content_type {
        Some(content_type) => with_attribute(
            attributes,
            contact_attribute(tx, names::CONTENT_TYPE),
            content_type.clone(),
        ),
        None => without_attribute(attributes, Some(&contact_ns), names::CONTENT_TYPE),
    };
    if short.is_some() {
        attributes = with_attribute(attributes, type_attribute(), write.type_hint);
    }
    let text = tx.doc.alloc(XmlNode::Text(write.text.clone()));
    tx.doc.set_attributes(leaf_xml, attributes)?;
    tx.doc.set_children(leaf_xml, vec![text])?;
    match old_xml {
        Some(old) => tx.replace_xml_child(parent_xml, old, leaf_xml)?,
        None => tx.insert_xml_child(parent_xml, leaf_xml, true)?,
    }

    tx.validate()?;

    let parent_id = match (parent, new_extended) {
        (LeafParent::Node(id), _) => {
            clear_nil_tree(tx, id)?;
            id
        }
        (LeafParent::NewExtended, Some(xml)) => attach_extended(tx, xml, &now)?,
        (LeafParent::NewExtended, None) => {
            return Err(ContactError::Custom(
                "Extension container was not created".to_string(),
            ))
        }
    };
    let type_hint = short.map(|_| write.type_hint.to_string());
    match existing {
        Some(id) => {
            let value = write.text.clone();
            let content_type = write.content_type.clone();
            tx.update_tree_node(id, move |n| {
                n.value = Some(value);
                n.content_type = content_type;
                n.type_hint = type_hint.or(n.type_hint.take());
                n.nil = false;
                n.version = version;
                n.modified = Some(now);
                n.element = Some(leaf_xml);
            })
        }
        None => {
            let mut node = PropertyNode::new(address.local_name(), NodeKind::LeafProperty);
            node.namespace = address.namespace.clone();
            node.value = Some(write.text.clone());
            node.content_type = write.content_type.clone();
            node.type_hint = type_hint;
            node.modified = Some(now);
            node.parent = Some(parent_id);
            node.element = Some(leaf_xml);
            node.name = tx.tree.child_name(parent_id, &node, 0);
            let name = node.name.clone();
            let id = tx.tree.alloc(node);
            insert_tree_child(tx, parent_id, id, true)?;
            tx.set_lookup(&name, Some(id))
        }
    }
}

fn label_collection(tx: &Transaction<'_>, node_xml: XmlId) -> Option<XmlId> {
    tx.doc.child_elements(node_xml).into_iter().find(|child| {
        tx.doc
            .element(*child)
            .map_or(false, |el| tx.schema().is_contact_element(el, names::LABEL_COLLECTION))
    })
}

fn append_labels(
    tx: &mut Transaction<'_>,
    id: PropId,
    added: &[String],
) -> Result<(), ContactError> {
    let node_xml = xml_of(tx, id)?;
    let mut label_ids = Vec::with_capacity(added.len());
    for label in added {
        let text = tx.doc.alloc(XmlNode::Text(label.clone()));
        let mut element = XmlElement::new(element_name(tx, None, names::LABEL));
        element.children.push(text);
        label_ids.push(tx.doc.alloc_element(element));
    }

    match label_collection(tx, node_xml) {
        Some(old) => {
            let nil = tx.doc.element(old).map_or(false, is_nil);
            let mut children = if nil {
                Vec::new()
            } else {
                tx.doc.element(old).map(|el| el.children.clone()).unwrap_or_default()
            };
            children.extend(label_ids);
            let copy = tx.doc.shallow_clone(old)?;
            let attributes =
                without_attribute(attributes_of(tx, copy), Some(XSI_NAMESPACE), names::NIL);
            tx.doc.set_attributes(copy, attributes)?;
            tx.doc.set_children(copy, children)?;
            tx.replace_xml_child(node_xml, old, copy)?;
        }
        None => {
            let mut element = XmlElement::new(element_name(tx, None, names::LABEL_COLLECTION));
            element.children = label_ids;
            let xml = tx.doc.alloc_element(element);
            tx.insert_xml_child(node_xml, xml, false)?;
        }
    }
    clear_nil_xml(tx, node_xml)?;
    let collection = tx.tree.get(id).and_then(|n| n.parent);
    if let Some(collection) = collection {
        let collection_xml = xml_of(tx, collection)?;
        clear_nil_xml(tx, collection_xml)?;
    }

    tx.validate()?;

    let added = added.to_vec();
    tx.update_tree_node(id, move |n| {
        n.labels.extend(added);
        n.nil = false;
    })?;
    if let Some(collection) = collection {
        clear_nil_tree(tx, collection)?;
    }
    Ok(())
}

fn drop_label(tx: &mut Transaction<'_>, id: PropId, label: &str) -> Result<(), ContactError> {
    let node_xml = xml_of(tx, id)?;
    let old = label_collection(tx, node_xml).ok_or_else(|| {
        ContactError::Custom(format!("Node {} has no {}", id.0, names::LABEL_COLLECTION))
    })?;
    let kept: Vec<XmlId> = tx
        .doc
        .element(old)
        .map(|el| el.children.clone())
        .unwrap_or_default()
        .into_iter()
        .filter(|child| {
            let is_label = tx
                .doc
                .element(*child)
                .map_or(false, |el| tx.schema().is_contact_element(el, names::LABEL));
            let matches = tx
                .doc
                .text(*child)
                .map_or(false, |text| text.trim().eq_ignore_ascii_case(label));
            !(is_label && matches)
        })
        .collect();
    let copy = tx.doc.shallow_clone(old)?;
    tx.doc.set_children(copy, kept)?;
    tx.replace_xml_child(node_xml, old, copy)?;

    tx.validate()?;

    let label = label.to_string();
    tx.update_tree_node(id, move |n| {
        n.labels.retain(|l| !l.eq_ignore_ascii_case(&label))
    })
}

fn tombstone_labels(tx: &mut Transaction<'_>, id: PropId) -> Result<(), ContactError> {
    let node_xml = xml_of(tx, id)?;
    let old = label_collection(tx, node_xml).ok_or_else(|| {
        ContactError::Custom(format!("Node {} has no {}", id.0, names::LABEL_COLLECTION))
    })?;
    let copy = tx.doc.shallow_clone(old)?;
    let attributes = with_attribute(attributes_of(tx, copy), nil_attribute(tx), "true");
    tx.doc.set_attributes(copy, attributes)?;
    tx.replace_xml_child(node_xml, old, copy)?;

    tx.validate()?;

    tx.update_tree_node(id, |n| n.labels.clear())
}
