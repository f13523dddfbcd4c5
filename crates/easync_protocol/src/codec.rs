//! Element-event codec traits.
//!
//! Requests and responses are streams of [`Element`] events. The binary
//! WBXML codec sits behind [`Decoder`] and [`Encoder`]; the request handlers
//! only ever see tags, text content and opaque item payloads.
//!
//! [`EventReader`] and [`EventWriter`] are the in-memory implementations used
//! by the server facade and by tests.

use crate::error::{ProtocolError, ProtocolResult};
use crate::tags::Tag;
use std::collections::VecDeque;

/// One event of an element stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    /// Opening tag of an element with content; a matching [`Element::End`]
    /// follows.
    Start(Tag),
    /// Self-closing element; no end event follows.
    Empty(Tag),
    /// Text content.
    Content(String),
    /// Opaque payload (item data).
    Opaque(Vec<u8>),
    /// Closes the innermost open element.
    End,
}

/// An opening tag consumed from a [`Decoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartTag {
    /// The tag.
    pub tag: Tag,
    /// True if the element was self-closing.
    pub empty: bool,
}

/// Reads element events.
///
/// Implementors only provide [`next_element`](Decoder::next_element),
/// [`peek`](Decoder::peek) and [`unget`](Decoder::unget); the element-level
/// helpers are derived from those.
pub trait Decoder {
    /// Consumes and returns the next event.
    fn next_element(&mut self) -> Option<Element>;

    /// Returns the next event without consuming it.
    fn peek(&mut self) -> Option<&Element>;

    /// Pushes an event back so it is returned by the next read.
    fn unget(&mut self, element: Element);

    /// Consumes the opening tag of `tag` if it is next.
    fn get_element_start_tag(&mut self, tag: Tag) -> Option<StartTag> {
        let empty = match self.peek() {
            Some(Element::Start(t)) if *t == tag => false,
            Some(Element::Empty(t)) if *t == tag => true,
            _ => return None,
        };
        self.next_element();
        Some(StartTag { tag, empty })
    }

    /// Consumes the next opening tag, whatever it is.
    fn next_start_tag(&mut self) -> Option<StartTag> {
        let start = match self.peek() {
            Some(Element::Start(t)) => StartTag {
                tag: *t,
                empty: false,
            },
            Some(Element::Empty(t)) => StartTag {
                tag: *t,
                empty: true,
            },
            _ => return None,
        };
        self.next_element();
        Some(start)
    }

    /// Consumes text content if it is next.
    fn get_element_content(&mut self) -> Option<String> {
        if !matches!(self.peek(), Some(Element::Content(_))) {
            return None;
        }
        match self.next_element() {
            Some(Element::Content(text)) => Some(text),
            _ => None,
        }
    }

    /// Consumes an opaque payload if it is next.
    fn get_element_opaque(&mut self) -> Option<Vec<u8>> {
        if !matches!(self.peek(), Some(Element::Opaque(_))) {
            return None;
        }
        match self.next_element() {
            Some(Element::Opaque(data)) => Some(data),
            _ => None,
        }
    }

    /// Consumes an end event if it is next.
    fn get_element_end_tag(&mut self) -> bool {
        if matches!(self.peek(), Some(Element::End)) {
            self.next_element();
            true
        } else {
            false
        }
    }

    /// Consumes the end event closing `tag`, failing if it is not next.
    fn expect_end_tag(&mut self, tag: Tag) -> ProtocolResult<()> {
        if self.get_element_end_tag() {
            Ok(())
        } else if self.peek().is_none() {
            Err(ProtocolError::UnexpectedEnd)
        } else {
            Err(ProtocolError::MissingEndTag(tag))
        }
    }

    /// Reads the text of an element whose opening tag was just consumed.
    ///
    /// Self-closing elements read as the empty string.
    fn read_text(&mut self, start: StartTag) -> ProtocolResult<String> {
        if start.empty {
            return Ok(String::new());
        }
        let text = self.get_element_content().unwrap_or_default();
        self.expect_end_tag(start.tag)?;
        Ok(text)
    }

    /// Reads `<tag>text</tag>` if `tag` is next.
    fn read_value(&mut self, tag: Tag) -> ProtocolResult<Option<String>> {
        match self.get_element_start_tag(tag) {
            Some(start) => self.read_text(start).map(Some),
            None => Ok(None),
        }
    }

    /// Reads the numeric text of an element whose opening tag was consumed.
    fn read_number(&mut self, start: StartTag) -> ProtocolResult<i64> {
        let text = self.read_text(start)?;
        text.trim()
            .parse()
            .map_err(|_| ProtocolError::invalid_value(start.tag, text))
    }

    /// Skips the remainder of an element whose opening tag was consumed,
    /// including any nested elements.
    fn skip_element(&mut self, start: StartTag) -> ProtocolResult<()> {
        if start.empty {
            return Ok(());
        }
        let mut depth = 1usize;
        while depth > 0 {
            match self.next_element() {
                Some(Element::Start(_)) => depth += 1,
                Some(Element::End) => depth -= 1,
                Some(_) => {}
                None => return Err(ProtocolError::UnexpectedEnd),
            }
        }
        Ok(())
    }
}

/// Writes element events.
pub trait Encoder {
    /// Opens an element.
    fn start_tag(&mut self, tag: Tag);

    /// Writes a self-closing element.
    fn empty_tag(&mut self, tag: Tag);

    /// Writes text content.
    fn content(&mut self, text: &str);

    /// Writes an opaque payload.
    fn opaque(&mut self, data: &[u8]);

    /// Closes the innermost open element.
    fn end_tag(&mut self);

    /// Writes `<tag>text</tag>`.
    fn element(&mut self, tag: Tag, text: &str) {
        self.start_tag(tag);
        self.content(text);
        self.end_tag();
    }
}

/// In-memory [`Decoder`] over a list of events.
#[derive(Debug, Clone, Default)]
pub struct EventReader {
    events: VecDeque<Element>,
}

impl EventReader {
    /// Creates a reader over the given events.
    pub fn new(events: impl IntoIterator<Item = Element>) -> Self {
        Self {
            events: events.into_iter().collect(),
        }
    }

    /// Returns true if every event has been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.events.is_empty()
    }
}

impl From<Vec<Element>> for EventReader {
    fn from(events: Vec<Element>) -> Self {
        Self::new(events)
    }
}

impl Decoder for EventReader {
    fn next_element(&mut self) -> Option<Element> {
        self.events.pop_front()
    }

    fn peek(&mut self) -> Option<&Element> {
        self.events.front()
    }

    fn unget(&mut self, element: Element) {
        self.events.push_front(element);
    }
}

/// In-memory [`Encoder`] collecting events.
///
/// Tracks open elements so that [`Encoder::end_tag`] never emits an
/// unbalanced end event.
#[derive(Debug, Clone, Default)]
pub struct EventWriter {
    events: Vec<Element>,
    open: Vec<Tag>,
}

impl EventWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the events written so far.
    pub fn elements(&self) -> &[Element] {
        &self.events
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Returns the number of elements still open.
    pub fn depth(&self) -> usize {
        self.open.len()
    }

    /// Closes any elements left open and returns the events.
    pub fn into_elements(mut self) -> Vec<Element> {
        while self.open.pop().is_some() {
            self.events.push(Element::End);
        }
        self.events
    }

    /// Turns the written events into a reader.
    pub fn into_reader(self) -> EventReader {
        EventReader::new(self.into_elements())
    }
}

impl Encoder for EventWriter {
    fn start_tag(&mut self, tag: Tag) {
        self.open.push(tag);
        self.events.push(Element::Start(tag));
    }

    fn empty_tag(&mut self, tag: Tag) {
        self.events.push(Element::Empty(tag));
    }

    fn content(&mut self, text: &str) {
        self.events.push(Element::Content(text.to_string()));
    }

    fn opaque(&mut self, data: &[u8]) {
        self.events.push(Element::Opaque(data.to_vec()));
    }

    fn end_tag(&mut self) {
        if self.open.pop().is_some() {
            self.events.push(Element::End);
        }
    }
}
