//! Undo-logged edits over a document and its property tree.
//!
//! Every slot write made through a [Transaction] first records `{target, previous value}`.
//! [Transaction::rollback] replays the log in reverse. A rollback that cannot restore every slot
//! reports the first failure, and the owning store treats that as fatal.

use crate::{
    codec::{
        schema::Schema,
        xml::{XmlAttribute, XmlDocument, XmlId},
    },
    error::ContactError,
    properties::{PropId, PropertyNode},
    store::tree::ContactTree,
};

#[derive(Debug, Clone)]
pub(crate) enum Undo {
    XmlChildren {
        element: XmlId,
        previous: Vec<XmlId>,
    },
    XmlAttributes {
        element: XmlId,
        previous: Vec<XmlAttribute>,
    },
    TreeChildren {
        node: PropId,
        previous: Vec<PropId>,
    },
    TreeNode {
        node: PropId,
        previous: Box<PropertyNode>,
    },
    Lookup {
        name: String,
        previous: Option<PropId>,
    },
    ExtendedRoot {
        previous: Option<PropId>,
    },
}

pub(crate) struct Transaction<'a> {
    pub(crate) doc: &'a mut XmlDocument,
    pub(crate) tree: &'a mut ContactTree,
    schema: &'a Schema,
    log: Vec<Undo>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(
        doc: &'a mut XmlDocument,
        tree: &'a mut ContactTree,
        schema: &'a Schema,
    ) -> Self {
        Transaction {
            doc,
            tree,
            schema,
            log: Vec::new(),
        }
    }

    pub(crate) fn schema(&self) -> &Schema {
        self.schema
    }

    #[cfg(test)]
    pub(crate) fn record(&mut self, undo: Undo) {
        self.log.push(undo);
    }

    pub(crate) fn set_xml_children(
        &mut self,
        element: XmlId,
        children: Vec<XmlId>,
    ) -> Result<(), ContactError> {
        let previous = self.doc.set_children(element, children)?;
        self.log.push(Undo::XmlChildren { element, previous });
        Ok(())
    }

    pub(crate) fn set_xml_attributes(
        &mut self,
        element: XmlId,
        attributes: Vec<XmlAttribute>,
    ) -> Result<(), ContactError> {
        let previous = self.doc.set_attributes(element, attributes)?;
        self.log.push(Undo::XmlAttributes { element, previous });
        Ok(())
    }

    /// Swap `old` for `new` in `parent`'s child list, keeping its position.
    pub(crate) fn replace_xml_child(
        &mut self,
        parent: XmlId,
        old: XmlId,
        new: XmlId,
    ) -> Result<(), ContactError> {
        let mut children = self.xml_children(parent)?;
        let slot = children.iter_mut().find(|c| **c == old).ok_or_else(|| {
            ContactError::Custom(format!("Element {} is not a child of {}", old.0, parent.0))
        })?;
        *slot = new;
        self.set_xml_children(parent, children)
    }

    pub(crate) fn insert_xml_child(
        &mut self,
        parent: XmlId,
        child: XmlId,
        at_head: bool,
    ) -> Result<(), ContactError> {
        let mut children = self.xml_children(parent)?;
        if at_head {
            children.insert(0, child);
        } else {
            children.push(child);
        }
        self.set_xml_children(parent, children)
    }

    fn xml_children(&self, parent: XmlId) -> Result<Vec<XmlId>, ContactError> {
        self.doc
            .element(parent)
            .map(|el| el.children.clone())
            .ok_or_else(|| ContactError::Custom(format!("Element {} not found", parent.0)))
    }

    pub(crate) fn set_tree_children(
        &mut self,
        node: PropId,
        children: Vec<PropId>,
    ) -> Result<(), ContactError> {
        let previous = self.tree.set_children(node, children)?;
        self.log.push(Undo::TreeChildren { node, previous });
        Ok(())
    }

    pub(crate) fn replace_tree_node(
        &mut self,
        node: PropId,
        replacement: PropertyNode,
    ) -> Result<(), ContactError> {
        let previous = self.tree.replace_node(node, replacement)?;
        self.log.push(Undo::TreeNode {
            node,
            previous: Box::new(previous),
        });
        Ok(())
    }

    /// Copy-on-write edit of a single node's fields.
    pub(crate) fn update_tree_node<F>(&mut self, node: PropId, edit: F) -> Result<(), ContactError>
    where
        F: FnOnce(&mut PropertyNode),
    {
        let mut copy = self
            .tree
            .get(node)
            .cloned()
            .ok_or_else(|| ContactError::Custom(format!("Unknown property node {}", node.0)))?;
        edit(&mut copy);
        self.replace_tree_node(node, copy)
    }

    pub(crate) fn set_lookup(
        &mut self,
        name: &str,
        id: Option<PropId>,
    ) -> Result<(), ContactError> {
        let previous = self.tree.set_lookup(name, id)?;
        self.log.push(Undo::Lookup {
            name: name.to_string(),
            previous,
        });
        Ok(())
    }

    pub(crate) fn set_extended_root(&mut self, id: Option<PropId>) {
        let previous = self.tree.set_extended_root(id);
        self.log.push(Undo::ExtendedRoot { previous });
    }

    pub(crate) fn validate(&self) -> Result<(), ContactError> {
        self.schema.validate(&*self.doc)
    }

    pub(crate) fn rollback(mut self) -> Result<(), ContactError> {
        let mut first_failure = None;
        while let Some(entry) = self.log.pop() {
            if let Err(err) = self.undo(entry) {
                tracing::warn!("[Transaction] undo step failed: {err}");
                first_failure.get_or_insert(err);
            }
        }
        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn undo(&mut self, entry: Undo) -> Result<(), ContactError> {
        match entry {
            Undo::XmlChildren { element, previous } => {
                self.doc.set_children(element, previous)?;
            }
            Undo::XmlAttributes { element, previous } => {
                self.doc.set_attributes(element, previous)?;
            }
            Undo::TreeChildren { node, previous } => {
                self.tree.set_children(node, previous)?;
            }
            Undo::TreeNode { node, previous } => {
                self.tree.replace_node(node, *previous)?;
            }
            Undo::Lookup { name, previous } => {
                self.tree.set_lookup(&name, previous)?;
            }
            Undo::ExtendedRoot { previous } => {
                self.tree.set_extended_root(previous);
            }
        }
        Ok(())
    }

    pub(crate) fn commit(self) -> usize {
        self.log.len()
    }
}
