use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::properties::ContactId;

/// Logical record-lifecycle notifications produced by the directory watcher.
///
/// Ids are the record's logical [ContactId], not its path: a rename keeps the id and reports
/// [ContactEvent::Moved].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContactEvent {
    Added(ContactId),
    /// Old ID, new ID
    Updated(ContactId, ContactId),
    Removed(ContactId),
    /// From ID, To ID
    Moved(ContactId, ContactId),
}

impl ContactEvent {
    /// The id of the record as it stands after the event.
    pub fn current_id(&self) -> ContactId {
        match self {
            ContactEvent::Added(id) | ContactEvent::Removed(id) => *id,
            ContactEvent::Updated(_, id) | ContactEvent::Moved(_, id) => *id,
        }
    }
}

impl Display for ContactEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ContactEvent::Added(id) => write!(f, "Added({id})"),
            ContactEvent::Updated(old, new) => write!(f, "Updated({old} -> {new})"),
            ContactEvent::Removed(id) => write!(f, "Removed({id})"),
            ContactEvent::Moved(old, new) => write!(f, "Moved({old} -> {new})"),
        }
    }
}
