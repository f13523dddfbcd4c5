//! Element trees built from event streams.
//!
//! Handlers stream responses; the tree form exists for inspecting finished
//! responses (logging, administration tools, tests).

use crate::codec::Element;
use crate::error::{ProtocolError, ProtocolResult};
use crate::tags::Tag;
use std::fmt;

/// A parsed element with its children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// The element tag.
    pub tag: Tag,
    /// Concatenated text content.
    pub text: Option<String>,
    /// Opaque payload, if any.
    pub opaque: Option<Vec<u8>>,
    /// Child elements in document order.
    pub children: Vec<Node>,
}

impl Node {
    fn new(tag: Tag) -> Self {
        Self {
            tag,
            text: None,
            opaque: None,
            children: Vec::new(),
        }
    }

    /// Builds the top-level nodes of an event stream.
    pub fn parse(events: &[Element]) -> ProtocolResult<Vec<Node>> {
        let mut roots = Vec::new();
        let mut stack: Vec<Node> = Vec::new();

        for event in events {
            match event {
                Element::Start(tag) => stack.push(Node::new(*tag)),
                Element::Empty(tag) => attach(&mut stack, &mut roots, Node::new(*tag)),
                Element::Content(text) => {
                    let node = stack.last_mut().ok_or(ProtocolError::UnexpectedEnd)?;
                    node.text.get_or_insert_with(String::new).push_str(text);
                }
                Element::Opaque(data) => {
                    let node = stack.last_mut().ok_or(ProtocolError::UnexpectedEnd)?;
                    node.opaque = Some(data.clone());
                }
                Element::End => {
                    let node = stack.pop().ok_or(ProtocolError::UnexpectedEnd)?;
                    attach(&mut stack, &mut roots, node);
                }
            }
        }

        match stack.last() {
            Some(open) => Err(ProtocolError::MissingEndTag(open.tag)),
            None => Ok(roots),
        }
    }

    /// Returns the first child with the given tag.
    pub fn child(&self, tag: Tag) -> Option<&Node> {
        self.children.iter().find(|c| c.tag == tag)
    }

    /// Returns every child with the given tag.
    pub fn children(&self, tag: Tag) -> impl Iterator<Item = &Node> {
        self.children.iter().filter(move |c| c.tag == tag)
    }

    /// Returns true if a child with the given tag exists.
    pub fn has(&self, tag: Tag) -> bool {
        self.child(tag).is_some()
    }

    /// Returns the text of the first child with the given tag.
    pub fn child_text(&self, tag: Tag) -> Option<&str> {
        self.child(tag).and_then(|c| c.text.as_deref())
    }

    /// Follows a path of first-matching children.
    pub fn path(&self, tags: &[Tag]) -> Option<&Node> {
        tags.iter().try_fold(self, |node, tag| node.child(*tag))
    }

    fn write_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let indent = "  ".repeat(depth);
        let name = self.tag.name();
        if self.children.is_empty() && self.text.is_none() && self.opaque.is_none() {
            return writeln!(f, "{indent}<{name}/>");
        }
        if self.children.is_empty() {
            let body = match (&self.text, &self.opaque) {
                (Some(text), _) => text.clone(),
                (None, Some(data)) => format!("[{} bytes]", data.len()),
                (None, None) => String::new(),
            };
            return writeln!(f, "{indent}<{name}>{body}</{name}>");
        }
        writeln!(f, "{indent}<{name}>")?;
        for child in &self.children {
            child.write_indented(f, depth + 1)?;
        }
        writeln!(f, "{indent}</{name}>")
    }
}

fn attach(stack: &mut [Node], roots: &mut Vec<Node>, node: Node) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => roots.push(node),
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}

/// Renders an event stream as indented XML for logs.
///
/// Streams that do not nest properly are rendered as an error marker.
pub fn render(events: &[Element]) -> String {
    match Node::parse(events) {
        Ok(nodes) => nodes.iter().map(|n| n.to_string()).collect(),
        Err(err) => format!("<!-- unbalanced stream: {err} -->"),
    }
}
