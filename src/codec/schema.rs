//! Contact schema tables and the structural validator.
//!
//! A [Schema] carries everything the stores need to know about the record format: namespace
//! URIs, the collection → array node table, the leaves each node may hold, and the compiled
//! address grammar. It is built once and handed to stores and caches as an `Arc<Schema>`;
//! [Schema::contact] returns the shared instance describing the standard contact format.

use once_cell::sync::Lazy;
use std::{collections::BTreeMap, sync::Arc};

use crate::{
    codec::{
        values::parse_date,
        xml::{XmlDocument, XmlElement, XmlId},
    },
    error::ContactError,
    paths::AddressGrammar,
    properties::{parse_guid, PropertyKind},
};

pub const CONTACT_NAMESPACE: &str = "http://schemas.microsoft.com/Contact";
pub const EXTENDED_NAMESPACE: &str = "http://schemas.microsoft.com/Contact/Extended";
pub const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";

/// Element and attribute names of the record format.
pub mod names {
    pub const ROOT: &str = "contact";
    pub const EXTENDED: &str = "Extended";
    pub const LABEL_COLLECTION: &str = "LabelCollection";
    pub const LABEL: &str = "Label";
    pub const CONTACT_ID_COLLECTION: &str = "ContactIDCollection";
    pub const CONTACT_ID: &str = "ContactID";
    pub const VALUE: &str = "Value";
    pub const CREATION_DATE: &str = "CreationDate";
    pub const NOTES: &str = "Notes";
    pub const GENDER: &str = "Gender";
    pub const MAILER: &str = "Mailer";

    pub const ELEMENT_ID: &str = "ElementID";
    pub const VERSION: &str = "Version";
    pub const MODIFICATION_DATE: &str = "ModificationDate";
    pub const CONTENT_TYPE: &str = "ContentType";
    pub const NIL: &str = "nil";
    pub const TYPE: &str = "type";

    pub const ARRAY_ELEMENT: &str = "arrayElement";
    pub const ARRAY_NODE: &str = "arrayNode";

    pub const PREFERRED: &str = "Preferred";
}

/// Prefixes used when new elements need a namespace the document never declared.
pub const CONTACT_PREFIX: &str = "c";
pub const XSI_PREFIX: &str = "xsi";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafKind {
    Text,
    Date,
    Binary,
}

impl From<LeafKind> for PropertyKind {
    fn from(kind: LeafKind) -> Self {
        match kind {
            LeafKind::Text => PropertyKind::String,
            LeafKind::Date => PropertyKind::DateTime,
            LeafKind::Binary => PropertyKind::Binary,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollectionSpec {
    pub node: String,
    pub leaves: BTreeMap<String, LeafKind>,
}

static CONTACT_SCHEMA: Lazy<Result<Arc<Schema>, ContactError>> =
    Lazy::new(|| Schema::standard().map(Arc::new));

#[derive(Debug, Clone)]
pub struct Schema {
    contact_namespace: String,
    extension_namespace: String,
    collections: BTreeMap<String, CollectionSpec>,
    top_level: BTreeMap<String, LeafKind>,
    grammar: AddressGrammar,
}

impl Schema {
    /// The shared standard contact schema.
    pub fn contact() -> Result<Arc<Schema>, ContactError> {
        (*CONTACT_SCHEMA).clone()
    }

    /// An empty schema over the given namespaces. Use the `with_*` builders to populate it.
    pub fn new(contact_namespace: &str, extension_namespace: &str) -> Result<Schema, ContactError> {
        Ok(Schema {
            contact_namespace: contact_namespace.to_string(),
            extension_namespace: extension_namespace.to_string(),
            collections: BTreeMap::new(),
            top_level: BTreeMap::new(),
            grammar: AddressGrammar::new()?,
        })
    }

    pub fn with_top_level(mut self, name: &str, kind: LeafKind) -> Self {
        self.top_level.insert(name.to_string(), kind);
        self
    }

    pub fn with_collection(
        mut self,
        collection: &str,
        node: &str,
        leaves: &[(&str, LeafKind)],
    ) -> Self {
        self.collections.insert(
            collection.to_string(),
            CollectionSpec {
                node: node.to_string(),
                leaves: leaves
                    .iter()
                    .map(|(name, kind)| (name.to_string(), *kind))
                    .collect(),
            },
        );
        self
    }

    fn standard() -> Result<Schema, ContactError> {
        use LeafKind::*;
        Ok(Schema::new(CONTACT_NAMESPACE, EXTENDED_NAMESPACE)?
            .with_top_level(names::CREATION_DATE, Date)
            .with_top_level(names::NOTES, Text)
            .with_top_level(names::GENDER, Text)
            .with_top_level(names::MAILER, Text)
            .with_collection(
                names::CONTACT_ID_COLLECTION,
                names::CONTACT_ID,
                &[(names::VALUE, Text)],
            )
            .with_collection(
                "NameCollection",
                "Name",
                &[
                    ("FormattedName", Text),
                    ("Phonetic", Text),
                    ("Prefix", Text),
                    ("Title", Text),
                    ("GivenName", Text),
                    ("FamilyName", Text),
                    ("MiddleName", Text),
                    ("Generation", Text),
                    ("Suffix", Text),
                    ("NickName", Text),
                ],
            )
            .with_collection(
                "PositionCollection",
                "Position",
                &[
                    ("Organization", Text),
                    ("Company", Text),
                    ("Department", Text),
                    ("Office", Text),
                    ("JobTitle", Text),
                    ("Profession", Text),
                    ("Role", Text),
                ],
            )
            .with_collection(
                "PersonCollection",
                "Person",
                &[("FormattedName", Text), ("PersonID", Text)],
            )
            .with_collection("DateCollection", "Date", &[(names::VALUE, Date)])
            .with_collection(
                "EmailAddressCollection",
                "EmailAddress",
                &[("Address", Text), ("Type", Text)],
            )
            .with_collection(
                "CertificateCollection",
                "Certificate",
                &[(names::VALUE, Binary), ("ThumbPrint", Binary)],
            )
            .with_collection(
                "PhoneNumberCollection",
                "PhoneNumber",
                &[("Number", Text), ("Alternate", Text)],
            )
            .with_collection(
                "PhysicalAddressCollection",
                "PhysicalAddress",
                &[
                    ("AddressLabel", Text),
                    ("Street", Text),
                    ("Locality", Text),
                    ("Region", Text),
                    ("PostalCode", Text),
                    ("Country", Text),
                    ("POBox", Text),
                    ("ExtendedAddress", Text),
                ],
            )
            .with_collection(
                "IMAddressCollection",
                "IMAddress",
                &[(names::VALUE, Text), ("Protocol", Text)],
            )
            .with_collection("UrlCollection", "Url", &[(names::VALUE, Text)])
            .with_collection(
                "PhotoCollection",
                "Photo",
                &[(names::VALUE, Binary), ("Url", Text)],
            ))
    }

    pub fn contact_namespace(&self) -> &str {
        &self.contact_namespace
    }

    pub fn extension_namespace(&self) -> &str {
        &self.extension_namespace
    }

    pub fn grammar(&self) -> &AddressGrammar {
        &self.grammar
    }

    pub fn is_collection(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }

    /// Array node element name for a schematized collection.
    pub fn node_name(&self, collection: &str) -> Option<&str> {
        self.collections.get(collection).map(|c| c.node.as_str())
    }

    /// Full namespace URI for a simple-extension short name.
    pub fn extension_namespace_for(&self, short: &str) -> String {
        format!("{}/{short}", self.extension_namespace)
    }

    /// Short name of a simple-extension namespace URI.
    pub fn extension_short_name<'a>(&self, namespace: &'a str) -> Option<&'a str> {
        namespace
            .strip_prefix(self.extension_namespace.as_str())?
            .strip_prefix('/')
            .filter(|short| !short.is_empty() && !short.contains('/'))
    }

    pub fn is_contact_element(&self, el: &XmlElement, local: &str) -> bool {
        el.name.is(&self.contact_namespace, local)
    }

    /// Structural validation of a whole record.
    pub fn validate(&self, doc: &XmlDocument) -> Result<(), ContactError> {
        let root = doc
            .root()
            .ok_or_else(|| ContactError::SchemaViolation("Document has no root".to_string()))?;
        let root_el = self.element(doc, root)?;
        if !self.is_contact_element(root_el, names::ROOT) {
            return Err(ContactError::SchemaViolation(format!(
                "Root element must be '{}' in namespace '{}'",
                names::ROOT,
                self.contact_namespace
            )));
        }
        self.check_attributes(root_el)?;

        let mut extended = 0;
        let mut contact_ids = 0;
        let mut creation_date = false;
        for child in doc.child_elements(root) {
            let el = self.element(doc, child)?;
            if el.name.namespace.as_deref() != Some(self.contact_namespace.as_str()) {
                return Err(ContactError::SchemaViolation(format!(
                    "Unexpected element '{}' outside the extension container",
                    el.name.local
                )));
            }
            self.check_attributes(el)?;
            let local = el.name.local.as_str();
            if local == names::EXTENDED {
                extended += 1;
                continue;
            }
            if let Some(spec) = self.collections.get(local) {
                self.validate_collection(doc, child, local, spec)?;
                if local == names::CONTACT_ID_COLLECTION {
                    contact_ids += 1;
                    self.validate_contact_ids(doc, child)?;
                }
                continue;
            }
            match self.top_level.get(local) {
                Some(kind) => {
                    self.validate_leaf(doc, child, *kind)?;
                    if local == names::CREATION_DATE {
                        creation_date = true;
                    }
                }
                None => {
                    return Err(ContactError::SchemaViolation(format!(
                        "Unknown top-level element '{local}'"
                    )))
                }
            }
        }

        if extended > 1 {
            return Err(ContactError::SchemaViolation(
                "Only one extension container is allowed".to_string(),
            ));
        }
        if contact_ids != 1 {
            return Err(ContactError::SchemaViolation(format!(
                "Expected exactly one {}, found {contact_ids}",
                names::CONTACT_ID_COLLECTION
            )));
        }
        if !creation_date {
            return Err(ContactError::SchemaViolation(format!(
                "Missing {}",
                names::CREATION_DATE
            )));
        }
        Ok(())
    }

    fn element<'a>(&self, doc: &'a XmlDocument, id: XmlId) -> Result<&'a XmlElement, ContactError> {
        doc.element(id)
            .ok_or_else(|| ContactError::SchemaViolation(format!("Dangling element {}", id.0)))
    }

    fn validate_collection(
        &self,
        doc: &XmlDocument,
        id: XmlId,
        name: &str,
        spec: &CollectionSpec,
    ) -> Result<(), ContactError> {
        let el = self.element(doc, id)?;
        let nodes = doc.child_elements(id);
        if nodes.is_empty() && !is_nil(el) {
            return Err(ContactError::SchemaViolation(format!(
                "Collection '{name}' is empty"
            )));
        }
        for node in nodes {
            let node_el = self.element(doc, node)?;
            if !self.is_contact_element(node_el, &spec.node) {
                return Err(ContactError::SchemaViolation(format!(
                    "'{name}' may only hold '{}' elements, found '{}'",
                    spec.node, node_el.name.local
                )));
            }
            self.check_attributes(node_el)?;
            self.validate_node(doc, node, spec)?;
        }
        Ok(())
    }

    fn validate_node(
        &self,
        doc: &XmlDocument,
        id: XmlId,
        spec: &CollectionSpec,
    ) -> Result<(), ContactError> {
        let mut label_collections = 0;
        for child in doc.child_elements(id) {
            let el = self.element(doc, child)?;
            if el.name.namespace.as_deref() != Some(self.contact_namespace.as_str()) {
                return Err(ContactError::SchemaViolation(format!(
                    "Unexpected element '{}' in '{}'",
                    el.name.local, spec.node
                )));
            }
            self.check_attributes(el)?;
            let local = el.name.local.as_str();
            if local == names::EXTENDED {
                continue;
            }
            if local == names::LABEL_COLLECTION {
                label_collections += 1;
                self.validate_labels(doc, child)?;
                continue;
            }
            match spec.leaves.get(local) {
                Some(kind) => self.validate_leaf(doc, child, *kind)?,
                None => {
                    return Err(ContactError::SchemaViolation(format!(
                        "'{}' has no property '{local}'",
                        spec.node
                    )))
                }
            }
        }
        if label_collections > 1 {
            return Err(ContactError::SchemaViolation(format!(
                "'{}' has more than one {}",
                spec.node,
                names::LABEL_COLLECTION
            )));
        }
        Ok(())
    }

    fn validate_labels(&self, doc: &XmlDocument, id: XmlId) -> Result<(), ContactError> {
        for label in doc.child_elements(id) {
            let el = self.element(doc, label)?;
            if !self.is_contact_element(el, names::LABEL) {
                return Err(ContactError::SchemaViolation(format!(
                    "{} may only hold {} elements",
                    names::LABEL_COLLECTION,
                    names::LABEL
                )));
            }
            let text = doc.text(label).unwrap_or_default();
            if text.trim().is_empty() {
                return Err(ContactError::SchemaViolation("Empty label".to_string()));
            }
        }
        Ok(())
    }

    fn validate_leaf(
        &self,
        doc: &XmlDocument,
        id: XmlId,
        kind: LeafKind,
    ) -> Result<(), ContactError> {
        let el = self.element(doc, id)?;
        let text = doc.text(id).ok_or_else(|| {
            ContactError::SchemaViolation(format!(
                "Property '{}' may not contain elements",
                el.name.local
            ))
        })?;
        if is_nil(el) {
            return Ok(());
        }
        match kind {
            LeafKind::Text => Ok(()),
            LeafKind::Date => parse_date(&text).map(|_| ()),
            LeafKind::Binary => match el.attribute(
                Some(&self.contact_namespace),
                names::CONTENT_TYPE,
            ) {
                Some(_) => Ok(()),
                None => Err(ContactError::SchemaViolation(format!(
                    "Binary property '{}' has no {}",
                    el.name.local,
                    names::CONTENT_TYPE
                ))),
            },
        }
    }

    fn validate_contact_ids(&self, doc: &XmlDocument, id: XmlId) -> Result<(), ContactError> {
        for node in doc.child_elements(id) {
            let node_el = self.element(doc, node)?;
            if is_nil(node_el) {
                continue;
            }
            for leaf in doc.child_elements(node) {
                let leaf_el = self.element(doc, leaf)?;
                if self.is_contact_element(leaf_el, names::VALUE) && !is_nil(leaf_el) {
                    if let Some(text) = doc.text(leaf) {
                        parse_guid(&text)?;
                        return Ok(());
                    }
                }
            }
        }
        Err(ContactError::SchemaViolation(format!(
            "{} has no live {} with a {}",
            names::CONTACT_ID_COLLECTION,
            names::CONTACT_ID,
            names::VALUE
        )))
    }

    fn check_attributes(&self, el: &XmlElement) -> Result<(), ContactError> {
        let ns = Some(self.contact_namespace.as_str());
        if let Some(version) = el.attribute(ns, names::VERSION) {
            match version.trim().parse::<u32>() {
                Ok(v) if v > 0 => {}
                _ => {
                    return Err(ContactError::SchemaViolation(format!(
                        "Bad {} '{version}' on '{}'",
                        names::VERSION,
                        el.name.local
                    )))
                }
            }
        }
        if let Some(date) = el.attribute(ns, names::MODIFICATION_DATE) {
            parse_date(date)?;
        }
        if let Some(id) = el.attribute(ns, names::ELEMENT_ID) {
            parse_guid(id)?;
        }
        if let Some(nil) = el.attribute(Some(XSI_NAMESPACE), names::NIL) {
            parse_nil(nil).ok_or_else(|| {
                ContactError::SchemaViolation(format!("Bad nil value '{nil}'"))
            })?;
        }
        Ok(())
    }
}

pub fn parse_nil(value: &str) -> Option<bool> {
    match value.trim() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

pub fn is_nil(el: &XmlElement) -> bool {
    el.attribute(Some(XSI_NAMESPACE), names::NIL)
        .and_then(parse_nil)
        .unwrap_or(false)
}
