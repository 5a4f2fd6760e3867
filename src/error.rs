use std::{io, path::StripPrefixError, sync::mpsc::SendError};

use base64::DecodeError as Base64DecodeError;
use quick_xml::{events::attributes::AttrError, Error as XmlError};
use regex::Error as RegexError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::ParseError as UrlParseError;

#[cfg(feature = "service")]
use notify::{Error as NotifyError, ErrorKind as NotifyErrorKind};

use crate::event::ContactEvent;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum ContactError {
    #[error("Custom error: {0}")]
    Custom(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("Malformed contact document: {0}")]
    MalformedDocument(String),
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("This object is no longer usable after a failed rollback")]
    ObjectUnusable,
    #[error("You do not have permission to access this resource")]
    PermissionDenied,
    #[error("Property not found: {0}")]
    PropertyNotFound(String),
    #[error("Schema violation: {0}")]
    SchemaViolation(String),
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
    #[error("Event subscriber failed: {0}")]
    Subscriber(String),
    #[error("File watch error: {0}")]
    Watch(String),
}

impl ContactError {
    /// I/O failures worth an immediate retry. Missing files, permission problems and bad record
    /// content are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, ContactError::Io(_))
    }
}

impl From<StripPrefixError> for ContactError {
    fn from(src: StripPrefixError) -> ContactError {
        ContactError::NotFound(format!("Strip prefix failed for path. Error: {src}"))
    }
}

impl From<toml::de::Error> for ContactError {
    fn from(src: toml::de::Error) -> ContactError {
        ContactError::Serialization(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for ContactError {
    fn from(src: toml::ser::Error) -> ContactError {
        ContactError::Serialization(format!("Toml serialization error: {src}"))
    }
}

impl From<uuid::Error> for ContactError {
    fn from(src: uuid::Error) -> ContactError {
        ContactError::SchemaViolation(format!("Invalid GUID: {src}"))
    }
}

impl From<chrono::ParseError> for ContactError {
    fn from(src: chrono::ParseError) -> ContactError {
        ContactError::SchemaViolation(format!("Invalid date: {src}"))
    }
}

impl From<UrlParseError> for ContactError {
    fn from(src: UrlParseError) -> ContactError {
        ContactError::InvalidArgument(format!("Invalid URI: {src}"))
    }
}

impl From<Base64DecodeError> for ContactError {
    fn from(src: Base64DecodeError) -> ContactError {
        ContactError::MalformedDocument(format!("Invalid base64 content: {src}"))
    }
}

impl From<XmlError> for ContactError {
    fn from(src: XmlError) -> ContactError {
        match src {
            XmlError::Io(err) => ContactError::from(io::Error::new(err.kind(), err.to_string())),
            other => ContactError::MalformedDocument(format!("{other}")),
        }
    }
}

impl From<AttrError> for ContactError {
    fn from(src: AttrError) -> ContactError {
        ContactError::MalformedDocument(format!("Bad attribute: {src}"))
    }
}

impl From<std::string::FromUtf8Error> for ContactError {
    fn from(src: std::string::FromUtf8Error) -> ContactError {
        ContactError::MalformedDocument(format!("Document is not UTF-8: {src}"))
    }
}

impl From<std::str::Utf8Error> for ContactError {
    fn from(src: std::str::Utf8Error) -> ContactError {
        ContactError::MalformedDocument(format!("Document is not UTF-8: {src}"))
    }
}

impl From<io::Error> for ContactError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => ContactError::NotFound(format!("{x}")),
            io::ErrorKind::PermissionDenied => ContactError::PermissionDenied,
            io::ErrorKind::InvalidData => ContactError::MalformedDocument(format!("{x}")),
            _ => ContactError::Io(format!("IOError: {}", x.kind())),
        }
    }
}

impl From<RegexError> for ContactError {
    fn from(x: RegexError) -> Self {
        ContactError::Serialization(format!("Regex parse failed: {x}"))
    }
}

impl From<SendError<ContactEvent>> for ContactError {
    fn from(x: SendError<ContactEvent>) -> Self {
        ContactError::Subscriber(format!("event receiver hung up: {x}"))
    }
}

#[cfg(feature = "service")]
impl From<NotifyError> for ContactError {
    fn from(src: NotifyError) -> ContactError {
        match src.kind {
            NotifyErrorKind::Io(io_err) => ContactError::from(io_err),
            NotifyErrorKind::PathNotFound => ContactError::NotFound(format!(
                "Watch path not found: {:?}",
                src.paths
            )),
            other => ContactError::Watch(format!("{other:?} for {:?}", src.paths)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_map_by_kind() {
        let missing = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert!(matches!(
            ContactError::from(missing),
            ContactError::NotFound(_)
        ));

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(ContactError::from(denied), ContactError::PermissionDenied);

        let busy = io::Error::new(io::ErrorKind::WouldBlock, "locked");
        let err = ContactError::from(busy);
        assert!(err.is_transient());
        assert!(!ContactError::ObjectUnusable.is_transient());
    }
}
