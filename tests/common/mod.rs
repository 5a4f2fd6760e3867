//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use contact_core::{
    codec::schema::Schema,
    properties::ContactId,
    store::{ContactProperties, WriteableStore},
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times; later calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

#[allow(dead_code)]
pub fn schema() -> Arc<Schema> {
    Schema::contact().expect("built-in schema")
}

/// A new contact with a formatted name.
#[allow(dead_code)]
pub fn new_contact(name: &str) -> WriteableStore {
    let mut contact = WriteableStore::new_contact(schema()).unwrap();
    let node = contact.create_array_node("NameCollection", true).unwrap();
    contact
        .set_string(&format!("{node}/FormattedName"), name)
        .unwrap();
    contact
}

/// Write a new contact named `name` to `dir/file` and return its path and id.
#[allow(dead_code)]
pub fn write_contact(dir: &Path, file: &str, name: &str) -> (PathBuf, ContactId) {
    let contact = new_contact(name);
    let path = dir.join(file);
    contact.save(&path).unwrap();
    (path, contact.contact_id().unwrap())
}
