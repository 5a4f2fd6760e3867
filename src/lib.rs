//! # contact-core
//!
//! Typed access to a directory of contact records, one XML document per file.
//!
//! ## Overview
//!
//! Every property in a record is named by a slash-separated [address](paths::PropertyAddress)
//! such as `EmailAddressCollection/EmailAddress[2]/Address` or `[WOW]Realm` for properties in a
//! caller-defined extension namespace. On top of that addressing the crate provides:
//!
//! - **[`store`]**: a read-only store and a writeable store over one record. Writes are checked
//!   against the schema and rolled back completely on failure. Deleted nodes become tombstones
//!   so that positions and element ids stay stable.
//! - **[`cache`]**: a path-keyed loader that shares parsed records, retires idle entries to weak
//!   handles and reloads anything modified on disk.
//! - **[`watch`]** (feature `service`): turns filesystem notifications into logical
//!   [`ContactEvent`](event::ContactEvent)s (`Added`, `Updated`, `Removed`, `Moved`) keyed by
//!   contact id rather than path.
//! - **[`service`]** (feature `service`): bundles cache and watcher under one owner, optionally
//!   on its own thread.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use contact_core::{
//!     cache::ContactCache,
//!     codec::schema::Schema,
//!     config::CacheSettings,
//!     properties::ContactType,
//!     store::ContactProperties,
//! };
//! use enumset::EnumSet;
//!
//! let schema = Schema::contact()?;
//! let mut cache = ContactCache::new("/srv/contacts", schema, CacheSettings::default());
//! for (path, contact) in cache.get_all(EnumSet::only(ContactType::Contact)) {
//!     let name = contact.get_string("NameCollection/Name[1]/FormattedName")?;
//!     println!("{path:?}: {name}");
//! }
//! # Ok::<(), contact_core::ContactError>(())
//! ```
//!
//! ## Threading
//!
//! Stores, the cache and the watcher have a single owner and take no locks. Parsed read-only
//! records are immutable and shared through `Arc`. To use the directory from several threads,
//! run it behind [`service::ContactService::spawn`].

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod paths;
pub mod properties;
#[cfg(feature = "service")]
pub mod service;
pub mod store;
#[cfg(test)]
mod tests;
#[cfg(feature = "service")]
pub mod watch;

pub use error::*;
