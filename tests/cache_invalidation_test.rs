//! Cache invalidation integration tests
//!
//! These tests verify that modification time tracking keeps the loader from ever returning a
//! stale record, including after entries have aged out to weak handles.

mod common;

use common::{init_logging, new_contact, schema, write_contact};
use contact_core::{
    cache::ContactCache,
    config::{CacheSettings, ContactsConfig},
    properties::ContactType,
    store::ContactProperties,
    ContactError,
};
use enumset::EnumSet;
use filetime::{set_file_mtime, FileTime};
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;

const NAME: &str = "NameCollection/Name[1]/FormattedName";

fn set_mtime(path: &std::path::Path, secs: i64) {
    set_file_mtime(path, FileTime::from_unix_time(1_600_000_000 + secs, 0)).unwrap();
}

#[test]
fn test_unmodified_file_gives_identical_snapshots() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let (path, _) = write_contact(temp_dir.path(), "ada.contact", "Ada Lovelace");
    let mut cache = ContactCache::new(temp_dir.path(), schema(), CacheSettings::default());

    let first = cache.get(&path).unwrap();
    let second = cache.get(&path).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    for name in [NAME, "NameCollection/Name[1]", "CreationDate"] {
        assert_eq!(
            first.get_attributes(name).unwrap(),
            second.get_attributes(name).unwrap()
        );
    }
}

#[test]
fn test_external_modification_after_idle_ticks() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let (path, id) = write_contact(temp_dir.path(), "ada.contact", "Ada Lovelace");
    set_mtime(&path, 0);
    let mut cache = ContactCache::new(temp_dir.path(), schema(), CacheSettings::default());

    // Keep a handle alive so the entry survives as a weak reference.
    let stale = cache.get(&path).unwrap();
    cache.tick();
    cache.tick();
    assert!(!cache.is_retained(&path));

    let mut edited = contact_core::store::WriteableStore::from_readonly(&stale).unwrap();
    edited.set_string(NAME, "Augusta Ada King").unwrap();
    edited.save(&path).unwrap();
    set_mtime(&path, 60);

    let fresh = cache.get(&path).unwrap();
    assert!(!Arc::ptr_eq(&stale, &fresh));
    assert_eq!(fresh.get_string(NAME).unwrap(), "Augusta Ada King");
    assert_eq!(fresh.contact_id().unwrap(), id);
    assert_eq!(stale.get_string(NAME).unwrap(), "Ada Lovelace");
}

#[test]
fn test_modification_without_ticks_is_seen() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let (path, _) = write_contact(temp_dir.path(), "ada.contact", "Ada");
    set_mtime(&path, 0);
    let mut cache = ContactCache::new(temp_dir.path(), schema(), CacheSettings::default());
    assert_eq!(cache.get(&path).unwrap().get_string(NAME).unwrap(), "Ada");

    new_contact("Grace").save(&path).unwrap();
    set_mtime(&path, 1);
    assert_eq!(cache.get(&path).unwrap().get_string(NAME).unwrap(), "Grace");
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_deleted_file_is_evicted() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let (path, _) = write_contact(temp_dir.path(), "ada.contact", "Ada");
    let mut cache = ContactCache::new(temp_dir.path(), schema(), CacheSettings::default());
    cache.get(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert!(matches!(cache.get(&path), Err(ContactError::NotFound(_))));
    assert!(cache.is_empty());
}

#[test]
fn test_configured_types_and_ticks() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    write_contact(temp_dir.path(), "ada.contact", "Ada");
    write_contact(temp_dir.path(), "team.group", "Team");
    let mut config = ContactsConfig::new(temp_dir.path());
    config.types = EnumSet::only(ContactType::Group);
    config.cache.ttl_ticks = 1;
    let mut cache = ContactCache::from_config(&config, schema());

    let all: Vec<_> = cache.get_all(cache.types()).collect();
    assert_eq!(all.len(), 1);
    assert!(all[0].0.ends_with("team.group"));
    drop(all);

    assert!(!cache.maybe_tick(std::time::Instant::now()));
    assert!(cache.maybe_tick(std::time::Instant::now() + Duration::from_secs(3600)));
    assert!(cache.is_empty());
}
