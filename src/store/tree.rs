//! [ContactTree]: the addressed property tree built over a parsed contact document.
//!
//! Nodes live in an arena and are addressed by [PropId]. Mutable stores never edit a node in
//! place. They push a replacement and swap it into its parent's child list, so a rolled-back
//! edit only has to restore the slots it wrote.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::{
    codec::{
        schema::{is_nil, names, Schema},
        values::parse_date,
        xml::{XmlDocument, XmlElement, XmlId},
    },
    error::ContactError,
    properties::{NodeKind, PropId, PropertyAttributes, PropertyNode},
};

#[derive(Debug, Clone, PartialEq)]
pub struct ContactTree {
    nodes: Vec<PropertyNode>,
    root: PropId,
    extended_root: Option<PropId>,
    lookup: HashMap<String, PropId>,
}

impl ContactTree {
    /// Build the tree with one depth-first walk over `doc`, then settle version and modification
    /// metadata against the record's creation date.
    pub fn build(doc: &XmlDocument, schema: &Schema) -> Result<ContactTree, ContactError> {
        let root_xml = doc.root().ok_or_else(|| {
            ContactError::MalformedDocument("Document has no root element".to_string())
        })?;
        let root_el = doc.element(root_xml).ok_or_else(|| {
            ContactError::MalformedDocument("Document root is not an element".to_string())
        })?;
        if !schema.is_contact_element(root_el, names::ROOT) {
            return Err(ContactError::MalformedDocument(format!(
                "Expected a '{}' root element, found '{}'",
                names::ROOT,
                root_el.name.local
            )));
        }

        let mut root = PropertyNode::new(names::ROOT, NodeKind::RootElement);
        read_attributes(&mut root, root_el, schema);
        root.element = Some(root_xml);

        let mut tree = ContactTree {
            nodes: vec![root],
            root: PropId(0),
            extended_root: None,
            lookup: HashMap::new(),
        };
        tree.walk(doc, schema, root_xml, PropId(0))?;
        tree.settle_metadata();
        Ok(tree)
    }

    fn walk(
        &mut self,
        doc: &XmlDocument,
        schema: &Schema,
        xml: XmlId,
        parent: PropId,
    ) -> Result<(), ContactError> {
        for child in doc.child_elements(xml) {
            let el = match doc.element(child) {
                Some(el) => el,
                None => continue,
            };
            let parent_kind = self.nodes[parent.0].kind;

            if schema.is_contact_element(el, names::LABEL_COLLECTION) {
                if parent_kind == NodeKind::ElementNode {
                    let labels = read_labels(doc, child, schema);
                    self.nodes[parent.0].labels = labels;
                }
                continue;
            }

            if schema.is_contact_element(el, names::EXTENDED) {
                if parent == self.root {
                    if self.extended_root.is_some() {
                        return Err(ContactError::MalformedDocument(
                            "More than one extension container".to_string(),
                        ));
                    }
                    let mut ext = PropertyNode::new(names::EXTENDED, NodeKind::RootElement);
                    read_attributes(&mut ext, el, schema);
                    ext.element = Some(child);
                    ext.parent = Some(parent);
                    let id = self.alloc(ext);
                    self.nodes[parent.0].children.push(id);
                    self.extended_root = Some(id);
                    self.walk(doc, schema, child, id)?;
                }
                // Nested extension blocks stay in the document but are not addressable.
                continue;
            }

            let namespace = match el.name.namespace.as_deref() {
                Some(ns) if ns == schema.contact_namespace() => None,
                Some(ns) => match schema.extension_short_name(ns) {
                    Some(short) => Some(short.to_string()),
                    None => continue,
                },
                None => continue,
            };

            let local = el.name.local.clone();
            let kind = self.resolve_kind(el, parent, namespace.is_some(), schema);
            let mut node = PropertyNode::new(&local, kind);
            read_attributes(&mut node, el, schema);
            node.namespace = namespace;
            node.parent = Some(parent);
            node.element = Some(child);
            if kind == NodeKind::LeafProperty {
                node.value = doc.text(child);
            }

            let siblings = self.nodes[parent.0]
                .children
                .iter()
                .filter(|c| self.nodes[c.0].kind == NodeKind::ElementNode)
                .count();
            node.name = self.child_name(parent, &node, siblings + 1);

            let name = node.name.clone();
            let id = self.alloc(node);
            self.nodes[parent.0].children.push(id);
            if self.lookup.contains_key(&name) {
                tracing::debug!("[ContactTree] duplicate property '{name}' is not addressable");
            } else {
                self.lookup.insert(name, id);
            }

            if kind != NodeKind::LeafProperty {
                self.walk(doc, schema, child, id)?;
            }
        }
        Ok(())
    }

    fn resolve_kind(
        &self,
        el: &XmlElement,
        parent: PropId,
        is_extension: bool,
        schema: &Schema,
    ) -> NodeKind {
        match el.attribute(None, names::TYPE) {
            Some(names::ARRAY_ELEMENT) => return NodeKind::ElementCollection,
            Some(names::ARRAY_NODE) => return NodeKind::ElementNode,
            Some(_) => return NodeKind::LeafProperty,
            None => {}
        }
        if self.nodes[parent.0].kind == NodeKind::ElementCollection {
            return NodeKind::ElementNode;
        }
        if el
            .attribute(Some(schema.contact_namespace()), names::ELEMENT_ID)
            .is_some()
        {
            return NodeKind::ElementNode;
        }
        if parent == self.root && !is_extension && schema.is_collection(&el.name.local) {
            return NodeKind::ElementCollection;
        }
        NodeKind::LeafProperty
    }

    /// Address of a node placed under `parent`. `index` is the 1-based position among the
    /// parent's array nodes and only applies to [NodeKind::ElementNode].
    pub(crate) fn child_name(&self, parent: PropId, node: &PropertyNode, index: usize) -> String {
        let parent_node = &self.nodes[parent.0];
        let prefix = match &node.namespace {
            Some(ns) if parent_node.namespace.as_ref() != Some(ns) => format!("[{ns}]"),
            _ => String::new(),
        };
        let mut name = if parent_node.name.is_empty() {
            format!("{prefix}{}", node.local_name)
        } else {
            format!("{}/{prefix}{}", parent_node.name, node.local_name)
        };
        if node.kind == NodeKind::ElementNode {
            name.push_str(&format!("[{index}]"));
        }
        name
    }

    fn settle_metadata(&mut self) {
        let created = self
            .lookup
            .get(names::CREATION_DATE)
            .and_then(|id| self.nodes[id.0].value.as_deref())
            .and_then(|value| parse_date(value).ok())
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        for node in self.nodes.iter_mut() {
            if node.version == 0 {
                node.version = 1;
            }
            if node.modified.is_none() {
                node.modified = Some(created);
            }
        }
    }

    pub fn root(&self) -> PropId {
        self.root
    }

    pub fn extended_root(&self) -> Option<PropId> {
        self.extended_root
    }

    pub fn get(&self, id: PropId) -> Option<&PropertyNode> {
        self.nodes.get(id.0)
    }

    pub fn find(&self, name: &str) -> Option<PropId> {
        self.lookup.get(name).copied()
    }

    pub fn node(&self, name: &str) -> Option<&PropertyNode> {
        self.find(name).and_then(|id| self.get(id))
    }

    /// Number of live addresses.
    pub fn len(&self) -> usize {
        self.lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.lookup.keys().map(String::as_str)
    }

    pub fn attributes(&self, name: &str) -> Result<PropertyAttributes, ContactError> {
        let node = self
            .node(name)
            .ok_or_else(|| ContactError::PropertyNotFound(name.to_string()))?;
        let kind = node.property_kind().ok_or_else(|| {
            ContactError::SchemaViolation(format!("'{name}' is a collection, not a property"))
        })?;
        Ok(PropertyAttributes {
            name: node.name.clone(),
            kind,
            version: node.version,
            element_id: node.element_id,
            modified: node.modified.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            nil: node.nil,
        })
    }

    /// Depth-first walk below `start`, excluding `start` itself.
    pub fn descendants(&self, start: PropId) -> Descendants<'_> {
        let mut stack = self
            .get(start)
            .map(|n| n.children.clone())
            .unwrap_or_default();
        stack.reverse();
        Descendants { tree: self, stack }
    }

    pub(crate) fn alloc(&mut self, node: PropertyNode) -> PropId {
        self.nodes.push(node);
        PropId(self.nodes.len() - 1)
    }

    pub(crate) fn replace_node(
        &mut self,
        id: PropId,
        node: PropertyNode,
    ) -> Result<PropertyNode, ContactError> {
        let slot = self
            .nodes
            .get_mut(id.0)
            .ok_or_else(|| ContactError::Custom(format!("Unknown property node {}", id.0)))?;
        Ok(std::mem::replace(slot, node))
    }

    pub(crate) fn set_children(
        &mut self,
        id: PropId,
        children: Vec<PropId>,
    ) -> Result<Vec<PropId>, ContactError> {
        if let Some(bad) = children.iter().find(|c| c.0 >= self.nodes.len()) {
            return Err(ContactError::Custom(format!(
                "Unknown property node {}",
                bad.0
            )));
        }
        let slot = self
            .nodes
            .get_mut(id.0)
            .ok_or_else(|| ContactError::Custom(format!("Unknown property node {}", id.0)))?;
        Ok(std::mem::replace(&mut slot.children, children))
    }

    pub(crate) fn set_lookup(
        &mut self,
        name: &str,
        id: Option<PropId>,
    ) -> Result<Option<PropId>, ContactError> {
        match id {
            Some(id) if id.0 >= self.nodes.len() => Err(ContactError::Custom(format!(
                "Unknown property node {}",
                id.0
            ))),
            Some(id) => Ok(self.lookup.insert(name.to_string(), id)),
            None => Ok(self.lookup.remove(name)),
        }
    }

    pub(crate) fn set_extended_root(&mut self, id: Option<PropId>) -> Option<PropId> {
        std::mem::replace(&mut self.extended_root, id)
    }
}

pub struct Descendants<'a> {
    tree: &'a ContactTree,
    stack: Vec<PropId>,
}

impl<'a> Iterator for Descendants<'a> {
    type Item = &'a PropertyNode;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        let node = self.tree.get(id)?;
        self.stack.extend(node.children.iter().rev().copied());
        Some(node)
    }
}

/// Copy the metadata attributes of `el` onto `node`.
pub(crate) fn read_attributes(node: &mut PropertyNode, el: &XmlElement, schema: &Schema) {
    let ns = Some(schema.contact_namespace());
    node.version = el
        .attribute(ns, names::VERSION)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(1);
    node.element_id = el
        .attribute(ns, names::ELEMENT_ID)
        .and_then(|v| v.parse().ok());
    node.modified = el
        .attribute(ns, names::MODIFICATION_DATE)
        .and_then(|v| parse_date(v).ok());
    node.content_type = el.attribute(ns, names::CONTENT_TYPE).map(str::to_string);
    node.type_hint = el.attribute(None, names::TYPE).map(str::to_string);
    node.nil = is_nil(el);
}

pub(crate) fn read_labels(doc: &XmlDocument, collection: XmlId, schema: &Schema) -> Vec<String> {
    let nil = doc.element(collection).map(is_nil).unwrap_or(false);
    if nil {
        return Vec::new();
    }
    doc.child_elements(collection)
        .into_iter()
        .filter(|id| {
            doc.element(*id)
                .map(|el| schema.is_contact_element(el, names::LABEL))
                .unwrap_or(false)
        })
        .filter_map(|id| doc.text(id))
        .map(|label| label.trim().to_string())
        .filter(|label| !label.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::schema::{CONTACT_NAMESPACE, XSI_NAMESPACE},
        properties::PropertyKind,
    };

    fn sample() -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<c:contact c:Version="1" xmlns:c="{CONTACT_NAMESPACE}" xmlns:xsi="{XSI_NAMESPACE}">
  <c:CreationDate>2008-01-01T12:00:00Z</c:CreationDate>
  <c:Notes c:Version="3" c:ModificationDate="2008-02-01T00:00:00Z">hello</c:Notes>
  <c:ContactIDCollection>
    <c:ContactID c:ElementID="6f9619ff-8b86-d011-b42d-00cf4fc964ff">
      <c:Value>5b6d2b7a-0c1e-4b5e-9d0b-3c8e41f0b1a2</c:Value>
    </c:ContactID>
  </c:ContactIDCollection>
  <c:EmailAddressCollection>
    <c:EmailAddress c:ElementID="11111111-8b86-d011-b42d-00cf4fc964ff">
      <c:Address>one@example.com</c:Address>
      <c:LabelCollection><c:Label>Business</c:Label><c:Label>Preferred</c:Label></c:LabelCollection>
    </c:EmailAddress>
    <c:EmailAddress c:ElementID="22222222-8b86-d011-b42d-00cf4fc964ff" xsi:nil="true"/>
  </c:EmailAddressCollection>
  <c:Extended>
    <w:Realm xmlns:w="{CONTACT_NAMESPACE}/Extended/WOW" type="string">Azeroth</w:Realm>
    <w:ServerCollection xmlns:w="{CONTACT_NAMESPACE}/Extended/WOW" type="arrayElement">
      <w:Server type="arrayNode"><w:Host>eu-1</w:Host></w:Server>
    </w:ServerCollection>
  </c:Extended>
</c:contact>"#
        )
    }

    fn build(text: &str) -> Result<ContactTree, ContactError> {
        let schema = Schema::contact()?;
        let doc = XmlDocument::parse(text)?;
        ContactTree::build(&doc, &schema)
    }

    #[test]
    fn test_addresses_follow_document_structure() {
        let tree = build(&sample()).unwrap();
        for name in [
            "CreationDate",
            "Notes",
            "ContactIDCollection",
            "ContactIDCollection/ContactID[1]",
            "ContactIDCollection/ContactID[1]/Value",
            "EmailAddressCollection/EmailAddress[1]",
            "EmailAddressCollection/EmailAddress[1]/Address",
            "EmailAddressCollection/EmailAddress[2]",
            "[WOW]Realm",
            "[WOW]ServerCollection",
            "[WOW]ServerCollection/Server[1]",
            "[WOW]ServerCollection/Server[1]/Host",
        ] {
            assert!(tree.find(name).is_some(), "missing {name}");
        }
        assert!(tree
            .find("EmailAddressCollection/EmailAddress[1]/LabelCollection")
            .is_none());
        assert_eq!(tree.len(), 13);
    }

    #[test]
    fn test_node_kinds_labels_and_values() {
        let tree = build(&sample()).unwrap();
        let email = tree.node("EmailAddressCollection/EmailAddress[1]").unwrap();
        assert_eq!(email.kind, NodeKind::ElementNode);
        assert_eq!(email.labels, vec!["Business", "Preferred"]);
        assert!(tree.node("EmailAddressCollection/EmailAddress[2]").unwrap().nil);
        assert_eq!(
            tree.node("EmailAddressCollection").unwrap().kind,
            NodeKind::ElementCollection
        );
        assert_eq!(
            tree.node("[WOW]ServerCollection").unwrap().kind,
            NodeKind::ElementCollection
        );
        assert_eq!(
            tree.node("[WOW]Realm").unwrap().value.as_deref(),
            Some("Azeroth")
        );
        assert_eq!(
            tree.attributes("EmailAddressCollection/EmailAddress[1]")
                .unwrap()
                .kind,
            PropertyKind::ArrayNode
        );
    }

    #[test]
    fn test_metadata_defaults_to_creation_date() {
        let tree = build(&sample()).unwrap();
        let created = parse_date("2008-01-01T12:00:00Z").unwrap();
        let notes = tree.attributes("Notes").unwrap();
        assert_eq!(notes.version, 3);
        assert_eq!(notes.modified, parse_date("2008-02-01T00:00:00Z").unwrap());
        let address = tree
            .attributes("EmailAddressCollection/EmailAddress[1]/Address")
            .unwrap();
        assert_eq!(address.version, 1);
        assert_eq!(address.modified, created);
    }

    #[test]
    fn test_collections_and_missing_names() {
        let tree = build(&sample()).unwrap();
        assert!(matches!(
            tree.attributes("EmailAddressCollection"),
            Err(ContactError::SchemaViolation(_))
        ));
        assert!(matches!(
            tree.attributes("NameCollection"),
            Err(ContactError::PropertyNotFound(_))
        ));
    }

    #[test]
    fn test_malformed_roots() {
        assert!(matches!(
            build("<other/>"),
            Err(ContactError::MalformedDocument(_))
        ));
        let twice = sample().replace("</c:contact>", "<c:Extended/></c:contact>");
        assert!(matches!(
            build(&twice),
            Err(ContactError::MalformedDocument(_))
        ));
    }

    #[test]
    fn test_descendants_are_depth_first() {
        let tree = build(&sample()).unwrap();
        let collection = tree.find("EmailAddressCollection").unwrap();
        let names: Vec<&str> = tree
            .descendants(collection)
            .map(|n| n.name.as_str())
            .collect();
        assert_eq!(
            names,
            vec![
                "EmailAddressCollection/EmailAddress[1]",
                "EmailAddressCollection/EmailAddress[1]/Address",
                "EmailAddressCollection/EmailAddress[2]",
            ]
        );
    }
}
