//! Canonical XML documents and desired-vs-live comparison.
//!
//! Libvirt echoes back definitions with extra detail of its own (PCI
//! addresses, generated MACs, controllers, expanded machine types). A rendered
//! definition therefore never equals the live one byte for byte; instead the
//! desired document must be *covered* by the live one:
//!
//! - every attribute and non-empty text in the desired tree is present and
//!   equal in the live tree
//! - for every child element name appearing in the desired tree, or listed in
//!   [`OWNED_ELEMENTS`], both trees have the same number of such children and
//!   they cover each other pairwise in order
//!
//! Attribute order, quoting and whitespace are not significant.

use std::collections::{BTreeMap, BTreeSet};

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use crate::error::{HypervisorError, Result};

/// Elements whose full set is controlled by the renderer.
///
/// Their absence from a desired document is significant: a live definition
/// that still has one is out of date.
pub const OWNED_ELEMENTS: &[&str] = &[
    "forward",
    "dhcp",
    "range",
    "disk",
    "interface",
    "filesystem",
    "tpm",
    "loader",
    "nvram",
    "memoryBacking",
    "smm",
    "readonly",
];

/// An XML element in canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    pub name: String,
    pub attributes: BTreeMap<String, String>,
    /// Concatenated, trimmed text content
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    fn from_start(start: &BytesStart<'_>) -> Result<Self> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut attributes = BTreeMap::new();

        for attr in start.attributes() {
            let attr = attr.map_err(|e| HypervisorError::XmlError(e.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| HypervisorError::XmlError(e.to_string()))?
                .into_owned();
            attributes.insert(key, value);
        }

        Ok(Self {
            name,
            attributes,
            text: String::new(),
            children: Vec::new(),
        })
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// First child with the given name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All children with the given name, in document order.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Descend through a path of child names.
    pub fn find(&self, path: &[&str]) -> Option<&Element> {
        path.iter().try_fold(self, |element, name| element.child(name))
    }

    /// Whether this (desired) element is covered by `live`.
    pub fn covered_by(&self, live: &Element) -> bool {
        self.name == live.name
            && self.attributes.iter().all(|(key, value)| {
                live.attr(key)
                    .is_some_and(|live_value| attribute_matches(key, value, live_value))
            })
            && (self.text.is_empty() || self.text == live.text)
            && self.children_covered_by(live)
    }

    fn children_covered_by(&self, live: &Element) -> bool {
        let names: BTreeSet<&str> = self
            .children
            .iter()
            .map(|c| c.name.as_str())
            .chain(
                live.children
                    .iter()
                    .map(|c| c.name.as_str())
                    .filter(|name| OWNED_ELEMENTS.contains(name)),
            )
            .collect();

        names.into_iter().all(|name| {
            let desired: Vec<&Element> = self.children_named(name).collect();
            let actual: Vec<&Element> = live.children_named(name).collect();
            desired.len() == actual.len()
                && desired.iter().zip(actual).all(|(d, l)| d.covered_by(l))
        })
    }

    /// Copy of this element with every descendant named `name` removed.
    pub fn without(&self, name: &str) -> Element {
        Element {
            name: self.name.clone(),
            attributes: self.attributes.clone(),
            text: self.text.clone(),
            children: self
                .children
                .iter()
                .filter(|c| c.name != name)
                .map(|c| c.without(name))
                .collect(),
        }
    }
}

/// Values libvirt rewrites into an equivalent longer form.
fn attribute_matches(key: &str, desired: &str, live: &str) -> bool {
    if desired == live {
        return true;
    }
    match key {
        // 'q35' is expanded to a versioned machine type such as 'pc-q35-8.2'
        "machine" => live.starts_with(&format!("pc-{}-", desired)),
        // MAC addresses are case-insensitive
        "address" => desired.eq_ignore_ascii_case(live),
        _ => false,
    }
}

/// A parsed XML document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    root: Element,
}

impl Document {
    /// Parse an XML document into canonical form.
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(start)) => stack.push(Element::from_start(&start)?),
                Ok(Event::Empty(start)) => {
                    let element = Element::from_start(&start)?;
                    attach(&mut stack, &mut root, element)?;
                }
                Ok(Event::End(_)) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| HypervisorError::XmlError("unbalanced end tag".to_string()))?;
                    attach(&mut stack, &mut root, element)?;
                }
                Ok(Event::Text(text)) => {
                    let text = text
                        .unescape()
                        .map_err(|e| HypervisorError::XmlError(e.to_string()))?;
                    append_text(&mut stack, text.trim());
                }
                Ok(Event::CData(data)) => {
                    let data = String::from_utf8_lossy(&data.into_inner()).into_owned();
                    append_text(&mut stack, data.trim());
                }
                Ok(Event::Eof) => break,
                // Declarations, comments, processing instructions
                Ok(_) => {}
                Err(e) => {
                    return Err(HypervisorError::XmlError(format!(
                        "at position {}: {}",
                        reader.buffer_position(),
                        e
                    )))
                }
            }
        }

        if !stack.is_empty() {
            return Err(HypervisorError::XmlError(format!(
                "unclosed element <{}>",
                stack[stack.len() - 1].name
            )));
        }

        root.map(|root| Self { root })
            .ok_or_else(|| HypervisorError::XmlError("empty document".to_string()))
    }

    pub fn root(&self) -> &Element {
        &self.root
    }

    /// Text of the root's `<name>` child.
    pub fn name(&self) -> Option<&str> {
        self.root.child("name").map(|e| e.text.as_str())
    }

    /// Whether this desired document is satisfied by the `live` one.
    pub fn covered_by(&self, live: &Document) -> bool {
        self.root.covered_by(&live.root)
    }

    /// Domain network interfaces in device order.
    pub fn interfaces(&self) -> Vec<&Element> {
        self.root
            .child("devices")
            .map(|devices| devices.children_named("interface").collect())
            .unwrap_or_default()
    }

    /// Copy with every element named `name` removed.
    pub fn without(&self, name: &str) -> Document {
        Document { root: self.root.without(name) }
    }
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_none() => *root = Some(element),
        None => {
            return Err(HypervisorError::XmlError(
                "multiple root elements".to_string(),
            ))
        }
    }
    Ok(())
}

fn append_text(stack: &mut [Element], text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(current) = stack.last_mut() {
        current.text.push_str(text);
    }
}

/// Compare a desired definition against a live one.
///
/// Unparseable documents never match, which makes the reconciler redefine
/// the resource.
pub fn definitions_match(desired: &str, live: &str) -> bool {
    match (Document::parse(desired), Document::parse(live)) {
        (Ok(desired), Ok(live)) => desired.covered_by(&live),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonicalizes() {
        let a = Document::parse(r#"<pool type="dir"><name>p</name><target><path>/x</path></target></pool>"#).unwrap();
        let b = Document::parse(
            "<?xml version='1.0'?>\n<pool type='dir'>\n  <name> p </name>\n  <!-- c -->\n  <target>\n    <path>/x</path>\n  </target>\n</pool>\n",
        )
        .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.name(), Some("p"));
    }

    #[test]
    fn test_attribute_order_is_insignificant() {
        assert!(definitions_match(
            "<bridge name='virbr0' stp='on'/>",
            r#"<bridge stp="on" name="virbr0"/>"#
        ));
    }

    #[test]
    fn test_live_extras_are_ignored() {
        let desired = "<domain><devices><interface type='network'><source network='lab'/></interface></devices></domain>";
        let live = "<domain id='3'><devices><controller type='pci'/><interface type='network'><mac address='52:54:00:aa:bb:cc'/><source network='lab' bridge='virbr10'/><address type='pci'/></interface></devices></domain>";
        assert!(definitions_match(desired, live));
    }

    #[test]
    fn test_changed_attribute_mismatches() {
        assert!(!definitions_match(
            "<network><forward mode='nat'/></network>",
            "<network><forward mode='route'/></network>"
        ));
    }

    #[test]
    fn test_removed_owned_element_mismatches() {
        // A live-only interface means the desired definition dropped one.
        let desired = "<domain><devices><interface type='network'/></devices></domain>";
        let live = "<domain><devices><interface type='network'/><interface type='network'/></devices></domain>";
        assert!(!definitions_match(desired, live));

        // Same for an element kind absent from the desired tree altogether.
        assert!(!definitions_match("<network><name>n</name></network>", "<network><name>n</name><forward mode='nat'/></network>"));
    }

    #[test]
    fn test_reordered_children_mismatch() {
        let desired = "<d><devices><interface><source network='a'/></interface><interface><source network='b'/></interface></devices></d>";
        let live = "<d><devices><interface><source network='b'/></interface><interface><source network='a'/></interface></devices></d>";
        assert!(!definitions_match(desired, live));
    }

    #[test]
    fn test_machine_alias() {
        assert!(definitions_match(
            "<os><type machine='q35'>hvm</type></os>",
            "<os><type arch='x86_64' machine='pc-q35-8.2'>hvm</type></os>"
        ));
        assert!(!definitions_match(
            "<os><type machine='q35'>hvm</type></os>",
            "<os><type machine='pc-i440fx-8.2'>hvm</type></os>"
        ));
    }

    #[test]
    fn test_text_mismatch() {
        assert!(!definitions_match("<v><capacity>10</capacity></v>", "<v><capacity>20</capacity></v>"));
    }

    #[test]
    fn test_invalid_xml() {
        assert!(Document::parse("<a><b></a>").is_err());
        assert!(Document::parse("").is_err());
        assert!(Document::parse("<a/><b/>").is_err());
        assert!(!definitions_match("<a>", "<a/>"));
    }

    #[test]
    fn test_interfaces_and_without() {
        let doc = Document::parse(
            "<domain><devices><disk/><interface><source network='a'/></interface><interface/></devices></domain>",
        )
        .unwrap();
        assert_eq!(doc.interfaces().len(), 2);
        assert_eq!(doc.interfaces()[0].find(&["source"]).and_then(|s| s.attr("network")), Some("a"));

        let stripped = doc.without("interface");
        assert!(stripped.interfaces().is_empty());
        assert!(stripped.root().find(&["devices", "disk"]).is_some());
    }
}
