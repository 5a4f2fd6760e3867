//! Shared fixtures for contact store tests

use std::sync::Arc;

use crate::codec::schema::{Schema, CONTACT_NAMESPACE, XSI_NAMESPACE};

/// ContactID value carried by [sample_contact].
pub const SAMPLE_ID: &str = "5b6d2b7a-0c1e-4b5e-9d0b-3c8e41f0b1a2";

/// Initialize logging for tests
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

pub fn schema() -> Arc<Schema> {
    Schema::contact().expect("standard schema builds")
}

/// A record exercising names, labelled email addresses, a tombstone and a simple extension.
pub fn sample_contact() -> String {
    contact_with_id(SAMPLE_ID)
}

pub fn contact_with_id(id: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<c:contact c:Version="1" xmlns:c="{CONTACT_NAMESPACE}" xmlns:xsi="{XSI_NAMESPACE}">
  <c:CreationDate>2008-01-01T12:00:00Z</c:CreationDate>
  <c:Notes c:Version="2" c:ModificationDate="2008-02-01T00:00:00Z">Met at the conference</c:Notes>
  <c:ContactIDCollection>
    <c:ContactID c:ElementID="6f9619ff-8b86-d011-b42d-00cf4fc964ff">
      <c:Value>{id}</c:Value>
    </c:ContactID>
  </c:ContactIDCollection>
  <c:NameCollection>
    <c:Name c:ElementID="a1b2c3d4-8b86-d011-b42d-00cf4fc964ff">
      <c:FormattedName>Ada Lovelace</c:FormattedName>
      <c:GivenName>Ada</c:GivenName>
      <c:FamilyName>Lovelace</c:FamilyName>
    </c:Name>
  </c:NameCollection>
  <c:EmailAddressCollection>
    <c:EmailAddress c:ElementID="11111111-8b86-d011-b42d-00cf4fc964ff">
      <c:Address>ada@home.example</c:Address>
      <c:LabelCollection><c:Label>Personal</c:Label></c:LabelCollection>
    </c:EmailAddress>
    <c:EmailAddress c:ElementID="22222222-8b86-d011-b42d-00cf4fc964ff">
      <c:Address>ada@work.example</c:Address>
      <c:LabelCollection><c:Label>Business</c:Label><c:Label>Preferred</c:Label></c:LabelCollection>
    </c:EmailAddress>
    <c:EmailAddress c:ElementID="33333333-8b86-d011-b42d-00cf4fc964ff" xsi:nil="true"/>
  </c:EmailAddressCollection>
  <c:Extended>
    <w:Realm xmlns:w="{CONTACT_NAMESPACE}/Extended/WOW" type="string">Azeroth</w:Realm>
  </c:Extended>
</c:contact>"#
    )
}
