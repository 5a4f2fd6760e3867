//! Property address grammar.
//!
//! An address names one property of a contact document. There are eight shapes:
//!
//! | Kind                       | Shape              | Example                              |
//! |----------------------------|--------------------|--------------------------------------|
//! | SchematizedTopLevel        | `L1`               | `Notes`                              |
//! | SchematizedCollection      | `L1`               | `EmailAddressCollection`             |
//! | SchematizedNode            | `L1/L2[i]`         | `EmailAddressCollection/EmailAddress[2]` |
//! | SchematizedHierarchical    | `L1/L2[i]/L3`      | `NameCollection/Name[1]/GivenName`   |
//! | ExtensionTopLevel          | `[ns]L1`           | `[WOW]Realm`                         |
//! | ExtensionNode              | `[ns]L1/L2[i]`     | `[WOW]ServerCollection/Server[1]`    |
//! | ExtensionHierarchical      | `[ns]L1/L2[i]/L3`  | `[WOW]ServerCollection/Server[1]/Host` |
//! | ExtensionCreation          | `[ns:L2]L1`        | `[WOW:Server]ServerCollection`       |
//!
//! Indices are 1-based in addresses and 0-based everywhere else. Indices beyond `i32::MAX` are
//! rejected rather than saturated.

use regex::{Captures, Regex};
use std::fmt::{Display, Formatter};

use crate::{codec::schema::Schema, error::ContactError};

const TOKEN: &str = r"[a-zA-Z][a-zA-Z0-9_,]*";
const INDEX: &str = r"[1-9][0-9]*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKind {
    SchematizedTopLevel,
    SchematizedCollection,
    SchematizedNode,
    SchematizedHierarchical,
    ExtensionTopLevel,
    ExtensionNode,
    ExtensionHierarchical,
    ExtensionCreation,
}

impl AddressKind {
    pub fn is_extension(&self) -> bool {
        matches!(
            self,
            AddressKind::ExtensionTopLevel
                | AddressKind::ExtensionNode
                | AddressKind::ExtensionHierarchical
                | AddressKind::ExtensionCreation
        )
    }

    pub fn is_array_node(&self) -> bool {
        matches!(
            self,
            AddressKind::SchematizedNode | AddressKind::ExtensionNode
        )
    }

    /// Leaves that may be written directly: top-level ones and the deepest hierarchy level.
    pub fn is_writable_leaf(&self) -> bool {
        matches!(
            self,
            AddressKind::SchematizedTopLevel
                | AddressKind::SchematizedHierarchical
                | AddressKind::ExtensionTopLevel
                | AddressKind::ExtensionHierarchical
        )
    }
}

/// Compiled address patterns. Built once per [Schema].
#[derive(Debug, Clone)]
pub struct AddressGrammar {
    extension_top_level: Regex,
    extension_node: Regex,
    extension_hierarchical: Regex,
    extension_creation: Regex,
    node: Regex,
    hierarchical: Regex,
    top_level: Regex,
}

impl AddressGrammar {
    pub fn new() -> Result<Self, ContactError> {
        Ok(AddressGrammar {
            extension_top_level: Regex::new(&format!(r"^\[({TOKEN})\]({TOKEN})$"))?,
            extension_node: Regex::new(&format!(
                r"^\[({TOKEN})\]({TOKEN})/({TOKEN})\[({INDEX})\]$"
            ))?,
            extension_hierarchical: Regex::new(&format!(
                r"^\[({TOKEN})\]({TOKEN})/({TOKEN})\[({INDEX})\]/({TOKEN})$"
            ))?,
            extension_creation: Regex::new(&format!(r"^\[({TOKEN}):({TOKEN})\]({TOKEN})$"))?,
            node: Regex::new(&format!(r"^({TOKEN})/({TOKEN})\[({INDEX})\]$"))?,
            hierarchical: Regex::new(&format!(r"^({TOKEN})/({TOKEN})\[({INDEX})\]/({TOKEN})$"))?,
            top_level: Regex::new(&format!(r"^({TOKEN})$"))?,
        })
    }
}

/// A parsed property address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyAddress {
    pub kind: AddressKind,
    /// Simple-extension namespace short name
    pub namespace: Option<String>,
    /// Top-level name or collection name
    pub level1: String,
    /// Array node name
    pub level2: Option<String>,
    /// Leaf name beneath an array node
    pub level3: Option<String>,
    /// 1-based array node index
    pub index: Option<u32>,
}

impl PropertyAddress {
    pub fn parse(path: &str, schema: &Schema) -> Result<PropertyAddress, ContactError> {
        let grammar = schema.grammar();
        if path.is_empty() {
            return Err(ContactError::SchemaViolation(
                "Empty property address".to_string(),
            ));
        }

        if path.starts_with('[') {
            if let Some(caps) = grammar.extension_top_level.captures(path) {
                return Ok(Self::from_parts(
                    AddressKind::ExtensionTopLevel,
                    Some(&caps[1]),
                    &caps[2],
                    None,
                    None,
                    None,
                ));
            }
            if let Some(caps) = grammar.extension_node.captures(path) {
                let index = parse_index(&caps, 4, path)?;
                return Ok(Self::from_parts(
                    AddressKind::ExtensionNode,
                    Some(&caps[1]),
                    &caps[2],
                    Some(&caps[3]),
                    None,
                    Some(index),
                ));
            }
            if let Some(caps) = grammar.extension_hierarchical.captures(path) {
                let index = parse_index(&caps, 4, path)?;
                return Ok(Self::from_parts(
                    AddressKind::ExtensionHierarchical,
                    Some(&caps[1]),
                    &caps[2],
                    Some(&caps[3]),
                    Some(&caps[5]),
                    Some(index),
                ));
            }
            if let Some(caps) = grammar.extension_creation.captures(path) {
                return Ok(Self::from_parts(
                    AddressKind::ExtensionCreation,
                    Some(&caps[1]),
                    &caps[3],
                    Some(&caps[2]),
                    None,
                    None,
                ));
            }
        } else {
            if let Some(caps) = grammar.node.captures(path) {
                let index = parse_index(&caps, 3, path)?;
                return Ok(Self::from_parts(
                    AddressKind::SchematizedNode,
                    None,
                    &caps[1],
                    Some(&caps[2]),
                    None,
                    Some(index),
                ));
            }
            if let Some(caps) = grammar.hierarchical.captures(path) {
                let index = parse_index(&caps, 3, path)?;
                return Ok(Self::from_parts(
                    AddressKind::SchematizedHierarchical,
                    None,
                    &caps[1],
                    Some(&caps[2]),
                    Some(&caps[4]),
                    Some(index),
                ));
            }
            if let Some(caps) = grammar.top_level.captures(path) {
                let kind = if schema.is_collection(&caps[1]) {
                    AddressKind::SchematizedCollection
                } else {
                    AddressKind::SchematizedTopLevel
                };
                return Ok(Self::from_parts(kind, None, &caps[1], None, None, None));
            }
        }

        Err(ContactError::SchemaViolation(format!(
            "'{path}' is not a valid property address"
        )))
    }

    fn from_parts(
        kind: AddressKind,
        namespace: Option<&str>,
        level1: &str,
        level2: Option<&str>,
        level3: Option<&str>,
        index: Option<u32>,
    ) -> PropertyAddress {
        PropertyAddress {
            kind,
            namespace: namespace.map(str::to_string),
            level1: level1.to_string(),
            level2: level2.map(str::to_string),
            level3: level3.map(str::to_string),
            index,
        }
    }

    pub fn is_array_node(path: &str, schema: &Schema) -> bool {
        PropertyAddress::parse(path, schema)
            .map(|address| address.kind.is_array_node())
            .unwrap_or(false)
    }

    /// 0-based index of an array node address, `None` for anything else.
    pub fn index_of(path: &str, schema: &Schema) -> Option<usize> {
        let address = PropertyAddress::parse(path, schema).ok()?;
        if !address.kind.is_array_node() {
            return None;
        }
        address.index.map(|i| i as usize - 1)
    }

    fn prefix(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("[{ns}]"),
            None => String::new(),
        }
    }

    /// Address of the collection holding this array node or leaf.
    pub fn collection_path(&self) -> Option<String> {
        match self.kind {
            AddressKind::SchematizedNode
            | AddressKind::SchematizedHierarchical
            | AddressKind::ExtensionNode
            | AddressKind::ExtensionHierarchical
            | AddressKind::ExtensionCreation => Some(format!("{}{}", self.prefix(), self.level1)),
            AddressKind::SchematizedCollection => Some(self.level1.clone()),
            _ => None,
        }
    }

    /// Address of the array node a hierarchical leaf hangs from.
    pub fn node_path(&self) -> Option<String> {
        let node = self.level2.as_deref()?;
        let index = self.index?;
        Some(format!(
            "{}{}/{}[{}]",
            self.prefix(),
            self.level1,
            node,
            index
        ))
    }

    /// Local name of the element this address denotes.
    pub fn local_name(&self) -> &str {
        match self.kind {
            AddressKind::SchematizedHierarchical | AddressKind::ExtensionHierarchical => {
                self.level3.as_deref().unwrap_or(&self.level1)
            }
            AddressKind::SchematizedNode | AddressKind::ExtensionNode => {
                self.level2.as_deref().unwrap_or(&self.level1)
            }
            _ => &self.level1,
        }
    }
}

impl Display for PropertyAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            AddressKind::ExtensionCreation => write!(
                f,
                "[{}:{}]{}",
                self.namespace.as_deref().unwrap_or_default(),
                self.level2.as_deref().unwrap_or_default(),
                self.level1
            ),
            AddressKind::SchematizedHierarchical | AddressKind::ExtensionHierarchical => write!(
                f,
                "{}/{}",
                self.node_path().unwrap_or_default(),
                self.level3.as_deref().unwrap_or_default()
            ),
            AddressKind::SchematizedNode | AddressKind::ExtensionNode => {
                write!(f, "{}", self.node_path().unwrap_or_default())
            }
            _ => write!(f, "{}{}", self.prefix(), self.level1),
        }
    }
}

fn parse_index(caps: &Captures<'_>, group: usize, path: &str) -> Result<u32, ContactError> {
    caps[group]
        .parse::<u32>()
        .ok()
        .filter(|i| *i <= i32::MAX as u32)
        .ok_or_else(|| {
            ContactError::SchemaViolation(format!("Array index out of range in '{path}'"))
        })
}

/// `collection/node[index]` with a 1-based index. `collection` may carry an extension prefix.
pub fn node_address(collection: &str, node: &str, index: usize) -> String {
    format!("{collection}/{node}[{index}]")
}

pub fn leaf_address(node_address: &str, leaf: &str) -> String {
    format!("{node_address}/{leaf}")
}
