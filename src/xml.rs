//! A small element tree over xml-rs.
//!
//! Listings from the launcher and test result files are small, so they are
//! read whole into [`Element`]s and queried with simple slash paths.

use crate::core::error::{Error, Result};
use std::io::{Read, Write};
use xml::reader::{EventReader, ParserConfig, XmlEvent as ReadEvent};
use xml::writer::{EmitterConfig, XmlEvent as WriteEvent};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub text: String,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    /// Parse a document and return its root element.
    pub fn parse<R: Read>(reader: R) -> Result<Element> {
        let config = ParserConfig::new()
            .trim_whitespace(true)
            .cdata_to_characters(true)
            .ignore_comments(true);
        let mut stack: Vec<Element> = Vec::new();
        let mut root = None;

        for event in EventReader::new_with_config(reader, config) {
            match event? {
                ReadEvent::StartElement {
                    name, attributes, ..
                } => {
                    let mut element = Element::new(name.local_name);
                    element.attributes = attributes
                        .into_iter()
                        .map(|a| (a.name.local_name, a.value))
                        .collect();
                    stack.push(element);
                }
                ReadEvent::EndElement { .. } => {
                    let Some(done) = stack.pop() else {
                        return Err(Error::xml("unbalanced end element"));
                    };
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(done),
                        None => root = Some(done),
                    }
                }
                ReadEvent::Characters(text) => {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&text);
                    }
                }
                _ => {}
            }
        }

        root.ok_or_else(|| Error::xml("document has no root element"))
    }

    pub fn parse_str(s: &str) -> Result<Element> {
        Self::parse(s.as_bytes())
    }

    pub fn parse_file(path: &std::path::Path) -> Result<Element> {
        let file = std::fs::File::open(path)?;
        Self::parse(std::io::BufReader::new(file))
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((name, value)),
        }
    }

    /// Attribute parsed as a number, 0 if missing or malformed.
    pub fn attr_i64(&self, name: &str) -> i64 {
        self.attr(name)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Children called `name`; they borrow from `self`, not from `name`.
    pub fn children_named<'a, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a Element> + use<'a, 'n> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Trimmed text of the first child called `name`.
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.trim())
    }

    /// Elements at `path` (e.g. `/MTouch/Device`), where the first segment
    /// names this element.
    pub fn select(&self, path: &str) -> Vec<&Element> {
        let mut segments = path.trim_matches('/').split('/');
        if segments.next() != Some(self.name.as_str()) {
            return Vec::new();
        }
        let mut current = vec![self];
        for segment in segments {
            current = current
                .into_iter()
                .flat_map(|e| e.children_named(segment))
                .collect();
        }
        current
    }

    /// Every descendant called `name`, depth first.
    pub fn descendants<'a>(&'a self, name: &str) -> Vec<&'a Element> {
        let mut found = Vec::new();
        for child in &self.children {
            if child.name == name {
                found.push(child);
            }
            found.extend(child.descendants(name));
        }
        found
    }

    /// Visit this element and every descendant mutably, depth first.
    pub fn visit_mut(&mut self, f: &mut impl FnMut(&mut Element)) {
        f(self);
        for child in &mut self.children {
            child.visit_mut(f);
        }
    }

    pub fn write<W: Write>(&self, sink: W) -> Result<()> {
        let mut writer = EmitterConfig::new()
            .line_separator("\n")
            .indent_string("  ")
            .perform_indent(true)
            .write_document_declaration(true)
            .normalize_empty_elements(true)
            .create_writer(sink);
        self.write_events(&mut writer)
    }

    fn write_events<W: Write>(&self, writer: &mut xml::writer::EventWriter<W>) -> Result<()> {
        let mut start = WriteEvent::start_element(self.name.as_str());
        for (name, value) in &self.attributes {
            start = start.attr(name.as_str(), value.as_str());
        }
        writer.write(start)?;
        if !self.text.is_empty() {
            writer.write(WriteEvent::characters(&self.text))?;
        }
        for child in &self.children {
            child.write_events(writer)?;
        }
        writer.write(WriteEvent::end_element())?;
        Ok(())
    }

    pub fn write_file(&self, path: &std::path::Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        self.write(std::io::BufWriter::new(file))
    }

    pub fn to_xml_string(&self) -> Result<String> {
        let mut buf = Vec::new();
        self.write(&mut buf)?;
        String::from_utf8(buf).map_err(|e| Error::xml(e.to_string()))
    }
}
