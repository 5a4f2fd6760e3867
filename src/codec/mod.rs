//! On-disk record format.
//!
//! - [`xml`]: an arena DOM over `quick-xml`. Edits replace whole child or attribute slots so
//!   they can be undone by putting the old slot back.
//! - [`schema`]: the contact grammar. It covers namespaces, known collections with their node and
//!   leaf names, and whole-document validation.
//! - [`values`]: the text encodings of leaf values (ISO-8601 dates, base64 binaries).

pub mod schema;
pub mod values;
pub mod xml;

pub use schema::{Schema, CONTACT_NAMESPACE, EXTENDED_NAMESPACE};
pub use xml::{XmlDocument, XmlId};
