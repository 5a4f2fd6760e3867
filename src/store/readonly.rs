use std::{path::Path, sync::Arc};

use crate::{
    codec::schema::Schema,
    error::ContactError,
    store::{load_document, tree::ContactTree, ContactProperties},
};

/// An immutable, validated view of one contact record. Cheap to share behind an [Arc].
#[derive(Debug, Clone)]
pub struct ReadonlyStore {
    schema: Arc<Schema>,
    tree: ContactTree,
    source: String,
}

impl ReadonlyStore {
    /// Any document that fails validation is reported as [ContactError::MalformedDocument].
    pub fn parse(text: &str, schema: Arc<Schema>) -> Result<ReadonlyStore, ContactError> {
        let (_doc, tree) = load_document(text, &schema)?;
        Ok(ReadonlyStore {
            schema,
            tree,
            source: text.to_string(),
        })
    }

    pub fn load<P: AsRef<Path>>(
        path: P,
        schema: Arc<Schema>,
    ) -> Result<ReadonlyStore, ContactError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        ReadonlyStore::parse(&text, schema)
    }

    /// The document text this store was parsed from.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn schema_arc(&self) -> Arc<Schema> {
        self.schema.clone()
    }
}

impl ContactProperties for ReadonlyStore {
    fn tree(&self) -> Result<&ContactTree, ContactError> {
        Ok(&self.tree)
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }
}
