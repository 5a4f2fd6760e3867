//! Directory watcher integration tests
//!
//! These drive a real OS watch through [ContactService] and check the logical events produced
//! for a create, modify, rename and delete sequence.

#![cfg(feature = "service")]

mod common;

use common::{init_logging, schema, write_contact};
use contact_core::{
    config::ContactsConfig,
    event::ContactEvent,
    service::ContactService,
    store::{ContactProperties, WriteableStore},
};
use std::{
    cell::RefCell,
    rc::Rc,
    time::{Duration, Instant},
};
use tempfile::TempDir;

const SETTLE: Duration = Duration::from_millis(500);
const PATIENCE: Duration = Duration::from_secs(10);

/// Pump until at least one event arrives, then keep pumping for a short while to catch
/// duplicates. Returns everything delivered.
fn collect(
    service: &mut ContactService,
    seen: &Rc<RefCell<Vec<ContactEvent>>>,
) -> Vec<ContactEvent> {
    let start = Instant::now();
    while seen.borrow().is_empty() && start.elapsed() < PATIENCE {
        service.pump(Duration::from_millis(100)).unwrap();
    }
    let settle = Instant::now();
    while settle.elapsed() < SETTLE {
        service.pump(Duration::from_millis(50)).unwrap();
    }
    std::mem::take(&mut *seen.borrow_mut())
}

#[test]
fn test_watcher_lifecycle_scenario() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    let mut service = ContactService::with_schema(&ContactsConfig::new(root), schema());
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    service
        .subscribe(Box::new(move |event| {
            sink.borrow_mut().push(*event);
            Ok(())
        }))
        .unwrap();

    // (a) create
    let (a_path, id) = write_contact(root, "a.contact", "Ada");
    assert_eq!(collect(&mut service, &seen), vec![ContactEvent::Added(id)]);

    // (b) modify
    let mut edited = WriteableStore::load(&a_path, schema()).unwrap();
    edited
        .set_string("NameCollection/Name[1]/FormattedName", "Ada Lovelace")
        .unwrap();
    std::thread::sleep(Duration::from_millis(20));
    edited.save(&a_path).unwrap();
    let new_id = edited.contact_id().unwrap();
    assert_eq!(
        collect(&mut service, &seen),
        vec![ContactEvent::Updated(id, new_id)]
    );

    // (c) rename
    let b_path = root.join("b.contact");
    std::fs::rename(&a_path, &b_path).unwrap();
    assert_eq!(
        collect(&mut service, &seen),
        vec![ContactEvent::Moved(new_id, new_id)]
    );

    // (d) delete
    std::fs::remove_file(&b_path).unwrap();
    assert_eq!(collect(&mut service, &seen), vec![ContactEvent::Removed(new_id)]);

    assert_eq!(service.unsubscribe().unwrap(), 0);
}

#[test]
fn test_untracked_files_produce_no_events() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let mut service =
        ContactService::with_schema(&ContactsConfig::new(temp_dir.path()), schema());
    let seen = Rc::new(RefCell::new(Vec::<ContactEvent>::new()));
    let sink = seen.clone();
    service
        .subscribe(Box::new(move |event| {
            sink.borrow_mut().push(*event);
            Ok(())
        }))
        .unwrap();

    std::fs::write(temp_dir.path().join("notes.txt"), "hello").unwrap();
    std::fs::write(temp_dir.path().join("broken.contact"), "<contact").unwrap();
    let deadline = Instant::now() + Duration::from_secs(1);
    while Instant::now() < deadline {
        service.pump(Duration::from_millis(50)).unwrap();
    }
    assert!(seen.borrow().is_empty());
}

#[test]
fn test_spawned_service_forwards_events() {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let handle = ContactService::spawn(ContactsConfig::new(temp_dir.path())).unwrap();
    handle.subscribe().unwrap();

    let (path, id) = write_contact(temp_dir.path(), "a.contact", "Ada");
    assert_eq!(
        handle.events().recv_timeout(PATIENCE).unwrap(),
        ContactEvent::Added(id)
    );
    assert_eq!(
        handle.get(&path).unwrap().contact_id().unwrap(),
        id
    );
    handle.shutdown().unwrap();
}
