//! Arena-backed XML document model for contact records.
//!
//! Parsing and serialization go through `quick-xml`; everything else works on [XmlDocument], a flat
//! arena of nodes addressed by [XmlId]. Nodes are never freed while a document lives. Editing a
//! document means allocating new nodes and then rewriting one slot of an existing element (its
//! children list or its attribute list). Each slot write hands back the previous value so callers
//! can undo it.
//!
//! Namespace prefixes are resolved at parse time by quick-xml's `NsReader` and stored alongside
//! each name. On output the writer re-declares any prefix that is not in scope, so freshly
//! created elements only need a namespace and a preferred prefix.

use quick_xml::{
    events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
    name::ResolveResult,
    NsReader, Writer,
};

use crate::error::ContactError;

pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";
pub const XMLNS_NAMESPACE: &str = "http://www.w3.org/2000/xmlns/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct XmlId(pub(crate) usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifiedName {
    pub prefix: Option<String>,
    pub local: String,
    pub namespace: Option<String>,
}

impl QualifiedName {
    pub fn new(prefix: Option<&str>, local: &str, namespace: Option<&str>) -> Self {
        QualifiedName {
            prefix: prefix.filter(|p| !p.is_empty()).map(str::to_string),
            local: local.to_string(),
            namespace: namespace.map(str::to_string),
        }
    }

    pub fn is(&self, namespace: &str, local: &str) -> bool {
        self.local == local && self.namespace.as_deref() == Some(namespace)
    }

    fn qualified(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}:{}", self.local),
            None => self.local.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlAttribute {
    pub name: QualifiedName,
    pub value: String,
}

impl XmlAttribute {
    pub fn new(name: QualifiedName, value: impl Into<String>) -> Self {
        XmlAttribute {
            name,
            value: value.into(),
        }
    }

    /// `xmlns` or `xmlns:prefix` declaration, returning the declared prefix.
    fn declaration(&self) -> Option<Option<&str>> {
        match (self.name.prefix.as_deref(), self.name.local.as_str()) {
            (Some("xmlns"), prefix) => Some(Some(prefix)),
            (None, "xmlns") => Some(None),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlElement {
    pub name: QualifiedName,
    pub attributes: Vec<XmlAttribute>,
    pub children: Vec<XmlId>,
}

impl XmlElement {
    pub fn new(name: QualifiedName) -> Self {
        XmlElement {
            name,
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn attribute(&self, namespace: Option<&str>, local: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attr| attr.name.local == local && attr.name.namespace.as_deref() == namespace)
            .map(|attr| attr.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlDocument {
    nodes: Vec<XmlNode>,
    root: Option<XmlId>,
}

/// Prefix bindings declared on one element, tracked by the writer.
type Scope = Vec<(Option<String>, String)>;

impl XmlDocument {
    pub fn parse(text: &str) -> Result<XmlDocument, ContactError> {
        let mut reader = NsReader::from_str(text);
        let mut doc = XmlDocument::default();
        let mut open: Vec<XmlId> = Vec::new();

        loop {
            let (resolved, event) = reader.read_resolved_event()?;
            let namespace = namespace_of(resolved)?;
            match event {
                Event::Start(start) => {
                    let id = doc.open_element(&reader, namespace, &start)?;
                    doc.attach(open.last().copied(), id)?;
                    open.push(id);
                }
                Event::Empty(start) => {
                    let id = doc.open_element(&reader, namespace, &start)?;
                    doc.attach(open.last().copied(), id)?;
                }
                Event::End(_) => {
                    let closed = open.pop().ok_or_else(|| {
                        ContactError::MalformedDocument("Unbalanced end tag".to_string())
                    })?;
                    doc.drop_ignorable_whitespace(closed);
                }
                Event::Text(text) => {
                    let value = text.unescape()?.into_owned();
                    doc.append_text(open.last().copied(), value)?;
                }
                Event::CData(data) => {
                    let value = String::from_utf8(data.into_inner().into_owned())?;
                    doc.append_text(open.last().copied(), value)?;
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !open.is_empty() {
            return Err(ContactError::MalformedDocument(
                "Document ended inside an open element".to_string(),
            ));
        }
        if doc.root.is_none() {
            return Err(ContactError::MalformedDocument(
                "Document has no root element".to_string(),
            ));
        }
        Ok(doc)
    }

    /// Allocate the element for `start`. The reader still has the element's own declarations
    /// in scope, so its attributes resolve against them.
    fn open_element(
        &mut self,
        reader: &NsReader<&[u8]>,
        namespace: Option<String>,
        start: &BytesStart<'_>,
    ) -> Result<XmlId, ContactError> {
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr?;
            let value = attr.unescape_value()?.into_owned();
            let (local, prefix) = attr.key.decompose();
            let prefix = prefix.map(|p| std::str::from_utf8(p.into_inner())).transpose()?;
            let local = std::str::from_utf8(local.into_inner())?;
            let attr_namespace = match (prefix, local) {
                (Some("xmlns"), _) | (None, "xmlns") => Some(XMLNS_NAMESPACE.to_string()),
                (Some("xml"), _) => Some(XML_NAMESPACE.to_string()),
                _ => namespace_of(reader.resolve_attribute(attr.key).0)?,
            };
            attributes.push(XmlAttribute::new(
                QualifiedName::new(prefix, local, attr_namespace.as_deref()),
                value,
            ));
        }

        let (local, prefix) = start.name().decompose();
        let prefix = prefix.map(|p| std::str::from_utf8(p.into_inner())).transpose()?;
        let local = std::str::from_utf8(local.into_inner())?;
        let element = XmlElement {
            name: QualifiedName::new(prefix, local, namespace.as_deref()),
            attributes,
            children: Vec::new(),
        };
        Ok(self.alloc(XmlNode::Element(element)))
    }

    fn attach(&mut self, parent: Option<XmlId>, id: XmlId) -> Result<(), ContactError> {
        match parent {
            Some(parent) => {
                if let Some(XmlNode::Element(el)) = self.nodes.get_mut(parent.0) {
                    el.children.push(id);
                }
                Ok(())
            }
            None if self.root.is_some() => Err(ContactError::MalformedDocument(
                "Document has more than one root element".to_string(),
            )),
            None => {
                self.root = Some(id);
                Ok(())
            }
        }
    }

    fn append_text(&mut self, parent: Option<XmlId>, value: String) -> Result<(), ContactError> {
        match parent {
            Some(parent) => {
                let id = self.alloc(XmlNode::Text(value));
                if let Some(XmlNode::Element(el)) = self.nodes.get_mut(parent.0) {
                    el.children.push(id);
                }
                Ok(())
            }
            None if value.trim().is_empty() => Ok(()),
            None => Err(ContactError::MalformedDocument(
                "Text content outside of the root element".to_string(),
            )),
        }
    }

    /// Whitespace between child elements is formatting, not content.
    fn drop_ignorable_whitespace(&mut self, id: XmlId) {
        let children = match self.element(id) {
            Some(el) => el.children.clone(),
            None => return,
        };
        let has_elements = children.iter().any(|c| self.element(*c).is_some());
        if !has_elements {
            return;
        }
        let kept: Vec<XmlId> = children
            .into_iter()
            .filter(|c| match self.node(*c) {
                Some(XmlNode::Text(text)) => !text.trim().is_empty(),
                _ => true,
            })
            .collect();
        if let Some(XmlNode::Element(el)) = self.nodes.get_mut(id.0) {
            el.children = kept;
        }
    }

    pub fn root(&self) -> Option<XmlId> {
        self.root
    }

    pub fn node(&self, id: XmlId) -> Option<&XmlNode> {
        self.nodes.get(id.0)
    }

    pub fn element(&self, id: XmlId) -> Option<&XmlElement> {
        match self.nodes.get(id.0) {
            Some(XmlNode::Element(el)) => Some(el),
            _ => None,
        }
    }

    fn element_mut(&mut self, id: XmlId) -> Result<&mut XmlElement, ContactError> {
        match self.nodes.get_mut(id.0) {
            Some(XmlNode::Element(el)) => Ok(el),
            _ => Err(ContactError::Custom(format!(
                "Document node {} is not an element",
                id.0
            ))),
        }
    }

    pub fn alloc(&mut self, node: XmlNode) -> XmlId {
        self.nodes.push(node);
        XmlId(self.nodes.len() - 1)
    }

    pub fn alloc_element(&mut self, element: XmlElement) -> XmlId {
        self.alloc(XmlNode::Element(element))
    }

    pub fn child_elements(&self, id: XmlId) -> Vec<XmlId> {
        self.element(id)
            .map(|el| {
                el.children
                    .iter()
                    .copied()
                    .filter(|c| self.element(*c).is_some())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Text content of an element without element children.
    pub fn text(&self, id: XmlId) -> Option<String> {
        let el = self.element(id)?;
        let mut out = String::new();
        for child in &el.children {
            match self.node(*child) {
                Some(XmlNode::Text(text)) => out.push_str(text),
                Some(XmlNode::Element(_)) => return None,
                None => {}
            }
        }
        Some(out)
    }

    /// Copy of the element's name and attributes, without children.
    pub fn shallow_clone(&mut self, id: XmlId) -> Result<XmlId, ContactError> {
        let el = self.element(id).ok_or_else(|| {
            ContactError::Custom(format!("Document node {} is not an element", id.0))
        })?;
        let copy = XmlElement {
            name: el.name.clone(),
            attributes: el.attributes.clone(),
            children: Vec::new(),
        };
        Ok(self.alloc_element(copy))
    }

    /// Replace an element's children, returning the previous list.
    pub fn set_children(
        &mut self,
        id: XmlId,
        children: Vec<XmlId>,
    ) -> Result<Vec<XmlId>, ContactError> {
        if let Some(bad) = children.iter().find(|c| c.0 >= self.nodes.len()) {
            return Err(ContactError::Custom(format!(
                "Unknown document node {}",
                bad.0
            )));
        }
        let el = self.element_mut(id)?;
        Ok(std::mem::replace(&mut el.children, children))
    }

    /// Replace an element's attributes, returning the previous list.
    pub fn set_attributes(
        &mut self,
        id: XmlId,
        attributes: Vec<XmlAttribute>,
    ) -> Result<Vec<XmlAttribute>, ContactError> {
        let el = self.element_mut(id)?;
        Ok(std::mem::replace(&mut el.attributes, attributes))
    }

    /// The prefix the root element binds to `namespace`, if any. `Some(None)` is the default
    /// namespace.
    pub fn declared_prefix(&self, namespace: &str) -> Option<Option<String>> {
        let root = self.element(self.root?)?;
        root.attributes
            .iter()
            .filter(|attr| attr.value == namespace)
            .find_map(|attr| attr.declaration().map(|p| p.map(str::to_string)))
    }

    pub fn to_xml_string(&self) -> Result<String, ContactError> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        if let Some(root) = self.root {
            let mut scopes = Vec::new();
            self.write_element(&mut writer, root, &mut scopes)?;
        }
        Ok(String::from_utf8(writer.into_inner())?)
    }

    fn write_element(
        &self,
        writer: &mut Writer<Vec<u8>>,
        id: XmlId,
        scopes: &mut Vec<Scope>,
    ) -> Result<(), ContactError> {
        let el = match self.element(id) {
            Some(el) => el,
            None => return Ok(()),
        };

        let mut scope: Scope = el
            .attributes
            .iter()
            .filter_map(|attr| {
                attr.declaration()
                    .map(|p| (p.map(str::to_string), attr.value.clone()))
            })
            .collect();
        let mut declarations = Vec::new();
        let mut bind = |prefix: &Option<String>, namespace: &str, scope: &mut Scope| {
            let bound = scope
                .iter()
                .rev()
                .find(|(p, _)| p == prefix)
                .map(|(_, ns)| ns.clone())
                .or_else(|| lookup(scopes, prefix.as_deref()));
            if bound.as_deref() != Some(namespace) {
                scope.push((prefix.clone(), namespace.to_string()));
                let key = match prefix {
                    Some(p) => format!("xmlns:{p}"),
                    None => "xmlns".to_string(),
                };
                declarations.push((key, namespace.to_string()));
            }
        };

        match el.name.namespace.as_deref() {
            Some(ns) => bind(&el.name.prefix, ns, &mut scope),
            None if el.name.prefix.is_none() => bind(&None, "", &mut scope),
            None => {}
        }
        for attr in &el.attributes {
            if attr.declaration().is_some() || attr.name.prefix.is_none() {
                continue;
            }
            if let Some(ns) = attr.name.namespace.as_deref() {
                if ns != XML_NAMESPACE {
                    bind(&attr.name.prefix, ns, &mut scope);
                }
            }
        }
        // An unbound default namespace needs no `xmlns=""`.
        let default_unbound = lookup(scopes, None).unwrap_or_default().is_empty();
        declarations.retain(|(key, ns)| !(key == "xmlns" && ns.is_empty() && default_unbound));

        let qname = el.name.qualified();
        let mut start = BytesStart::new(qname.as_str());
        for attr in &el.attributes {
            let key = attr.name.qualified();
            start.push_attribute((key.as_str(), attr.value.as_str()));
        }
        for (key, ns) in &declarations {
            start.push_attribute((key.as_str(), ns.as_str()));
        }

        if el.children.is_empty() {
            writer.write_event(Event::Empty(start))?;
            return Ok(());
        }

        writer.write_event(Event::Start(start))?;
        scopes.push(scope);
        for child in &el.children {
            match self.node(*child) {
                Some(XmlNode::Text(text)) => {
                    writer.write_event(Event::Text(BytesText::new(text)))?;
                }
                Some(XmlNode::Element(_)) => self.write_element(writer, *child, scopes)?,
                None => {}
            }
        }
        scopes.pop();
        writer.write_event(Event::End(BytesEnd::new(qname.as_str())))?;
        Ok(())
    }
}

fn lookup(scopes: &[Scope], prefix: Option<&str>) -> Option<String> {
    if prefix == Some("xml") {
        return Some(XML_NAMESPACE.to_string());
    }
    scopes.iter().rev().find_map(|scope| {
        scope
            .iter()
            .rev()
            .find(|(p, _)| p.as_deref() == prefix)
            .map(|(_, ns)| ns.clone())
    })
}

/// Namespace of a resolved name. An empty binding (`xmlns=""`) counts as none.
fn namespace_of(resolved: ResolveResult<'_>) -> Result<Option<String>, ContactError> {
    match resolved {
        ResolveResult::Bound(ns) => {
            let ns = std::str::from_utf8(ns.into_inner())?;
            Ok((!ns.is_empty()).then(|| ns.to_string()))
        }
        ResolveResult::Unbound => Ok(None),
        ResolveResult::Unknown(prefix) => Err(ContactError::MalformedDocument(format!(
            "Unbound prefix '{}'",
            String::from_utf8_lossy(&prefix)
        ))),
    }
}

/// Attribute-list edits used when building replacement elements.
pub fn with_attribute(
    mut attributes: Vec<XmlAttribute>,
    name: QualifiedName,
    value: impl Into<String>,
) -> Vec<XmlAttribute> {
    let value = value.into();
    match attributes
        .iter_mut()
        .find(|attr| attr.name.local == name.local && attr.name.namespace == name.namespace)
    {
        Some(existing) => existing.value = value,
        None => attributes.push(XmlAttribute::new(name, value)),
    }
    attributes
}

pub fn without_attribute(
    mut attributes: Vec<XmlAttribute>,
    namespace: Option<&str>,
    local: &str,
) -> Vec<XmlAttribute> {
    attributes
        .retain(|attr| !(attr.name.local == local && attr.name.namespace.as_deref() == namespace));
    attributes
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<c:contact xmlns:c="urn:c" xmlns:x="urn:x">
  <c:Notes>a &amp; b</c:Notes>
  <c:Empty/>
  <x:Other c:Version="2">text</x:Other>
</c:contact>"#;

    #[test]
    fn test_parse_resolves_namespaces() {
        let doc = XmlDocument::parse(SAMPLE).unwrap();
        let root = doc.root().unwrap();
        let root_el = doc.element(root).unwrap();
        assert!(root_el.name.is("urn:c", "contact"));

        let children = doc.child_elements(root);
        assert_eq!(children.len(), 3);
        assert_eq!(doc.text(children[0]).unwrap(), "a & b");
        assert_eq!(doc.text(children[1]).unwrap(), "");

        let other = doc.element(children[2]).unwrap();
        assert!(other.name.is("urn:x", "Other"));
        assert_eq!(other.attribute(Some("urn:c"), "Version"), Some("2"));
        assert_eq!(doc.declared_prefix("urn:x"), Some(Some("x".to_string())));
    }

    #[test]
    fn test_nested_declarations_shadow_outer_ones() {
        let doc = XmlDocument::parse(
            r#"<c:contact xmlns:c="urn:c" xmlns="urn:d">
  <Plain xml:lang="en"/>
  <c:Inner xmlns:c="urn:inner" c:Kind="k"><Reset xmlns=""/></c:Inner>
  <c:After/>
</c:contact>"#,
        )
        .unwrap();
        let root = doc.root().unwrap();
        let children = doc.child_elements(root);
        let plain = doc.element(children[0]).unwrap();
        assert!(plain.name.is("urn:d", "Plain"));
        assert_eq!(plain.attribute(Some(XML_NAMESPACE), "lang"), Some("en"));

        let inner = doc.element(children[1]).unwrap();
        assert!(inner.name.is("urn:inner", "Inner"));
        assert_eq!(inner.attribute(Some("urn:inner"), "Kind"), Some("k"));
        let reset = doc.element(doc.child_elements(children[1])[0]).unwrap();
        assert_eq!(reset.name.namespace, None);

        assert!(doc.element(children[2]).unwrap().name.is("urn:c", "After"));
    }

    #[test]
    fn test_malformed_input_is_rejected() {
        assert!(matches!(
            XmlDocument::parse("<a><b></a>"),
            Err(ContactError::MalformedDocument(_))
        ));
        assert!(matches!(
            XmlDocument::parse("   "),
            Err(ContactError::MalformedDocument(_))
        ));
        assert!(matches!(
            XmlDocument::parse("<p:a/>"),
            Err(ContactError::MalformedDocument(_))
        ));
    }

    #[test]
    fn test_written_elements_get_missing_declarations() {
        let mut doc = XmlDocument::parse(SAMPLE).unwrap();
        let root = doc.root().unwrap();
        let fresh = doc.alloc_element(XmlElement::new(QualifiedName::new(
            Some("n"),
            "Fresh",
            Some("urn:new"),
        )));
        let mut children = doc.element(root).unwrap().children.clone();
        children.push(fresh);
        let previous = doc.set_children(root, children).unwrap();
        assert_eq!(previous.len(), 3);

        let text = doc.to_xml_string().unwrap();
        assert!(text.contains("xmlns:n=\"urn:new\""));

        let reparsed = XmlDocument::parse(&text).unwrap();
        let last = *reparsed
            .child_elements(reparsed.root().unwrap())
            .last()
            .unwrap();
        assert!(reparsed.element(last).unwrap().name.is("urn:new", "Fresh"));
        assert_eq!(
            reparsed.text(reparsed.child_elements(reparsed.root().unwrap())[0]),
            Some("a & b".to_string())
        );
    }

    #[test]
    fn test_slot_writes_return_previous_values() {
        let mut doc = XmlDocument::parse(SAMPLE).unwrap();
        let root = doc.root().unwrap();
        let attrs = doc.element(root).unwrap().attributes.clone();
        let updated = with_attribute(
            attrs.clone(),
            QualifiedName::new(Some("c"), "Version", Some("urn:c")),
            "3",
        );
        let previous = doc.set_attributes(root, updated).unwrap();
        assert_eq!(previous, attrs);
        assert_eq!(
            doc.element(root).unwrap().attribute(Some("urn:c"), "Version"),
            Some("3")
        );
        let restored = without_attribute(
            doc.element(root).unwrap().attributes.clone(),
            Some("urn:c"),
            "Version",
        );
        assert_eq!(restored, attrs);
        assert!(doc.set_children(XmlId(9999), vec![]).is_err());
    }
}
