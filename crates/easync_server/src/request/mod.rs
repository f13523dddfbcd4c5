//! Command handlers.
//!
//! Each handler reads its request from a [`Decoder`], writes its response
//! to an [`Encoder`] and returns whether the request was handled. A request
//! that stepped aside for a newer one from the same device returns `false`
//! with nothing written.

pub(crate) mod foldersync;
pub(crate) mod ping;
pub(crate) mod sync;

use easync_protocol::{Decoder, Element, Encoder, ProtocolError, ProtocolResult, StartTag, Tag};

/// Consumes the next child of `parent`, or its end tag.
///
/// Returns `None` once `parent` is closed.
pub(crate) fn next_child(decoder: &mut dyn Decoder, parent: Tag) -> ProtocolResult<Option<StartTag>> {
    if decoder.get_element_end_tag() {
        return Ok(None);
    }
    let is_tag = match decoder.peek() {
        None => return Err(ProtocolError::UnexpectedEnd),
        Some(element) => matches!(element, Element::Start(_) | Element::Empty(_)),
    };
    if !is_tag {
        return Err(ProtocolError::MissingEndTag(parent));
    }
    Ok(decoder.next_start_tag())
}

/// Reads a boolean element. A self-closing element reads as true.
pub(crate) fn read_flag(decoder: &mut dyn Decoder, start: StartTag) -> ProtocolResult<bool> {
    if start.empty {
        return Ok(true);
    }
    let text = decoder.read_text(start)?;
    match text.trim() {
        "" | "1" => Ok(true),
        "0" => Ok(false),
        other => Err(ProtocolError::invalid_value(start.tag, other)),
    }
}

/// Reads a numeric element that must fit in a `u8`.
pub(crate) fn read_u8(decoder: &mut dyn Decoder, start: StartTag) -> ProtocolResult<u8> {
    let value = decoder.read_number(start)?;
    u8::try_from(value).map_err(|_| ProtocolError::invalid_value(start.tag, value.to_string()))
}

/// Rejects an element that has no place inside `context`.
pub(crate) fn unexpected(context: Tag, found: Tag) -> ProtocolError {
    ProtocolError::UnexpectedElement { context, found }
}

/// Copies buffered events to an encoder.
pub(crate) fn write_elements(encoder: &mut dyn Encoder, elements: Vec<Element>) {
    for element in elements {
        match element {
            Element::Start(tag) => encoder.start_tag(tag),
            Element::Empty(tag) => encoder.empty_tag(tag),
            Element::Content(text) => encoder.content(&text),
            Element::Opaque(data) => encoder.opaque(&data),
            Element::End => encoder.end_tag(),
        }
    }
}
