//! Minimal read-only XML element tree built on quick-xml.
//!
//! Capabilities documents, service exception reports and GML responses are
//! small enough to load completely, and walking a tree keeps the parsers
//! close to the structure of the documents they read.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// Parse failure with the position it was detected at.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message} at line {line} column {column}")]
pub struct XmlError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

/// One element with its attributes, child elements and text content.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlElement {
    /// Qualified name as written, including any prefix.
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlElement>,
    text: String,
}

impl XmlElement {
    /// Parse a document and return its root element.
    pub fn parse(input: &str) -> Result<XmlElement, XmlError> {
        let input = input.trim_start_matches('\u{feff}');
        let mut reader = Reader::from_str(input);
        reader.trim_text(true);

        let mut buf = Vec::new();
        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root: Option<XmlElement> = None;

        loop {
            let event = reader
                .read_event_into(&mut buf)
                .map_err(|e| position_error(input, reader.buffer_position(), e.to_string()))?;

            match event {
                Event::Start(e) => {
                    stack.push(Self::from_start(&e));
                }
                Event::Empty(e) => {
                    let element = Self::from_start(&e);
                    Self::attach(&mut stack, &mut root, element);
                }
                Event::End(_) => {
                    if let Some(element) = stack.pop() {
                        Self::attach(&mut stack, &mut root, element);
                    }
                }
                Event::Text(t) => {
                    if let Some(current) = stack.last_mut() {
                        match t.unescape() {
                            Ok(s) => current.text.push_str(&s),
                            Err(_) => current.text.push_str(&String::from_utf8_lossy(&t)),
                        }
                    }
                }
                Event::CData(c) => {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&String::from_utf8_lossy(&c));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        if !stack.is_empty() {
            return Err(position_error(
                input,
                input.len(),
                "unexpected end of file".to_string(),
            ));
        }

        root.ok_or_else(|| position_error(input, input.len(), "no root element".to_string()))
    }

    fn from_start(e: &BytesStart<'_>) -> XmlElement {
        let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
        let attributes = e
            .attributes()
            .flatten()
            .map(|a| {
                let key = String::from_utf8_lossy(a.key.as_ref()).into_owned();
                let value = match a.unescape_value() {
                    Ok(v) => v.into_owned(),
                    Err(_) => String::from_utf8_lossy(&a.value).into_owned(),
                };
                (key, value)
            })
            .collect();
        XmlElement {
            name,
            attributes,
            children: Vec::new(),
            text: String::new(),
        }
    }

    fn attach(stack: &mut [XmlElement], root: &mut Option<XmlElement>, element: XmlElement) {
        match stack.last_mut() {
            Some(parent) => parent.children.push(element),
            None => {
                if root.is_none() {
                    *root = Some(element);
                }
            }
        }
    }

    /// Element name with a leading "wms:" prefix removed.
    pub fn tag(&self) -> &str {
        self.name.strip_prefix("wms:").unwrap_or(&self.name)
    }

    /// Element name without any namespace prefix.
    pub fn local_name(&self) -> &str {
        self.name.rsplit(':').next().unwrap_or(&self.name)
    }

    /// Trimmed text content of this element (not of its children).
    pub fn text(&self) -> &str {
        self.text.trim()
    }

    /// Attribute by exact name.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Attribute by name, falling back to a case-insensitive match.
    pub fn attr_ignore_case(&self, name: &str) -> Option<&str> {
        self.attr(name).or_else(|| {
            self.attributes
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        })
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attr(name).is_some()
    }

    /// First child whose `tag()` equals `tag`.
    pub fn child(&self, tag: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.tag() == tag)
    }

    /// All children whose `tag()` equals `tag`.
    pub fn children_named<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.children.iter().filter(move |c| c.tag() == tag)
    }

    /// Text of the first child named `tag`, empty if absent.
    pub fn child_text(&self, tag: &str) -> &str {
        self.child(tag).map(|c| c.text()).unwrap_or("")
    }

    /// Follow a path of child tags.
    pub fn path(&self, tags: &[&str]) -> Option<&XmlElement> {
        tags.iter().try_fold(self, |e, tag| e.child(tag))
    }

    /// Depth-first iterator over this element and all descendants.
    pub fn descendants(&self) -> Vec<&XmlElement> {
        let mut out = vec![self];
        let mut i = 0;
        while i < out.len() {
            let current = out[i];
            out.extend(current.children.iter());
            i += 1;
        }
        out
    }
}

fn position_error(input: &str, offset: usize, message: String) -> XmlError {
    let offset = offset.min(input.len());
    let before = input.as_bytes().get(..offset).unwrap_or_default();
    let line = before.iter().filter(|&&b| b == b'\n').count() + 1;
    let column = before.iter().rev().take_while(|&&b| b != b'\n').count() + 1;
    XmlError {
        message,
        line,
        column,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tree() {
        let doc = r#"<?xml version="1.0"?>
            <wms:Root version="1.3.0" xmlns:wms="x">
              <wms:Title>Demo &amp; more</wms:Title>
              <Layer queryable="1"><Name>a</Name></Layer>
              <Layer><Name><![CDATA[b]]></Name></Layer>
              <Empty/>
            </wms:Root>"#;
        let root = XmlElement::parse(doc).unwrap();
        assert_eq!(root.tag(), "Root");
        assert_eq!(root.attr("version"), Some("1.3.0"));
        assert_eq!(root.child_text("Title"), "Demo & more");
        let names: Vec<&str> = root
            .children_named("Layer")
            .map(|l| l.child_text("Name"))
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(root.child("Empty").is_some());
        assert_eq!(root.path(&["Layer", "Name"]).unwrap().text(), "a");
        assert_eq!(root.descendants().len(), 7);
    }

    #[test]
    fn test_mismatched_tag_reports_position() {
        let err = XmlElement::parse("<a>\n  <b></c>\n</a>").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.column > 1);
    }

    #[test]
    fn test_truncated_document() {
        let err = XmlElement::parse("<a><b>text</b>").unwrap_err();
        assert_eq!(err.message, "unexpected end of file");
    }

    #[test]
    fn test_attr_ignore_case() {
        let root = XmlElement::parse(r#"<ResourceURL Format="image/png" template="t"/>"#).unwrap();
        assert_eq!(root.attr("format"), None);
        assert_eq!(root.attr_ignore_case("format"), Some("image/png"));
        assert_eq!(root.local_name(), "ResourceURL");
    }
}
