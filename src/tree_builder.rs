//! Push-based XML decoder
//!
//! Bytes are fed in arrival order with no alignment guarantees. The builder
//! keeps the unconsumed tail of the last fragment, hands every complete
//! markup/text prefix to `quick-xml`, and grows a [`NodeTree`] against an
//! explicit stack of open nodes. Feeding a document in any number of pieces
//! produces the same tree as feeding it whole.

use std::collections::BTreeMap;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tracing::trace;

use crate::error::{Result, SoapError};
use crate::node::{NodeId, NodeTree};

/// Receives structural events while a tree is being built
pub trait TreeObserver {
    fn element_opened(&mut self, _tree: &NodeTree, _id: NodeId) {}

    fn text_appended(&mut self, _tree: &NodeTree, _id: NodeId, _text: &str) {}

    fn element_closed(&mut self, _tree: &NodeTree, _id: NodeId) {}
}

impl TreeObserver for () {}

/// Notified once when decoding fails, with the partial tree
pub trait ParseErrorHandler {
    fn parse_failed(&mut self, partial: &NodeTree, error: &SoapError);
}

impl<F> ParseErrorHandler for F
where
    F: FnMut(&NodeTree, &SoapError),
{
    fn parse_failed(&mut self, partial: &NodeTree, error: &SoapError) {
        self(partial, error)
    }
}

/// Incremental tree builder
#[derive(Debug)]
pub struct TreeBuilder {
    tree: NodeTree,
    stack: Vec<NodeId>,
    pending: Vec<u8>,
    scan: MarkupScan,
    consumed: u64,
    document_element_seen: bool,
    failure: Option<(u64, String)>,
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self {
            tree: NodeTree::new(),
            stack: vec![NodeId::ROOT],
            pending: Vec::new(),
            scan: MarkupScan::default(),
            consumed: 0,
            document_element_seen: false,
            failure: None,
        }
    }

    /// Tree built so far
    pub fn tree(&self) -> &NodeTree {
        &self.tree
    }

    /// Number of currently open elements (the synthetic root excluded)
    pub fn depth(&self) -> usize {
        self.stack.len() - 1
    }

    /// Innermost open node
    pub fn current(&self) -> NodeId {
        self.stack[self.stack.len() - 1]
    }

    /// Bytes received but not decoded yet
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Feed the next fragment of the document
    pub fn feed<O>(&mut self, fragment: &[u8], observer: &mut O) -> Result<()>
    where
        O: TreeObserver + ?Sized,
    {
        if let Some((position, message)) = &self.failure {
            return Err(self.malformed(*position, message.clone()));
        }

        self.pending.extend_from_slice(fragment);
        let ready = complete_prefix_len(&self.pending, &mut self.scan);
        if ready == 0 {
            return Ok(());
        }

        let chunk: Vec<u8> = self.pending.drain(..ready).collect();
        self.process(&chunk, observer)
    }

    /// Signal the end of the document and take the completed tree
    pub fn finish<O>(&mut self, observer: &mut O) -> Result<NodeTree>
    where
        O: TreeObserver + ?Sized,
    {
        if let Some((position, message)) = &self.failure {
            return Err(self.malformed(*position, message.clone()));
        }

        if !self.pending.is_empty() {
            if self.pending.contains(&b'<') {
                return Err(self.fail(self.consumed, "unexpected end of document inside markup"));
            }
            let rest = std::mem::take(&mut self.pending);
            self.process(&rest, observer)?;
        }

        if self.stack.len() > 1 {
            let open = self.tree.node(self.current()).name().to_string();
            return Err(self.fail(
                self.consumed,
                format!("unexpected end of document: element '{}' is not closed", open),
            ));
        }
        if !self.document_element_seen {
            return Err(self.fail(self.consumed, "document has no root element"));
        }

        trace!(bytes = self.consumed, nodes = self.tree.node_count(), "document complete");
        Ok(std::mem::take(&mut self.tree))
    }

    fn process<O>(&mut self, chunk: &[u8], observer: &mut O) -> Result<()>
    where
        O: TreeObserver + ?Sized,
    {
        let mut reader = Reader::from_reader(chunk);
        {
            let config = reader.config_mut();
            config.trim_text(false);
            config.check_end_names = false;
            config.allow_unmatched_ends = true;
            config.expand_empty_elements = false;
        }

        loop {
            let position = self.consumed + reader.buffer_position() as u64;
            let event = match reader.read_event() {
                Ok(event) => event,
                Err(e) => return Err(self.fail(position, e.to_string())),
            };

            match event {
                Event::Start(start) => {
                    self.open(&start, position, observer)?;
                }
                Event::Empty(start) => {
                    let id = self.open(&start, position, observer)?;
                    self.stack.pop();
                    observer.element_closed(&self.tree, id);
                }
                Event::End(end) => {
                    let name = match std::str::from_utf8(end.name().as_ref()) {
                        Ok(name) => name.to_string(),
                        Err(e) => return Err(self.fail(position, e.to_string())),
                    };
                    self.close(&name, position, observer)?;
                }
                Event::Text(text) => {
                    let text = match text.unescape() {
                        Ok(text) => text.into_owned(),
                        Err(e) => return Err(self.fail(position, e.to_string())),
                    };
                    self.characters(&text, position, observer)?;
                }
                Event::CData(cdata) => {
                    let text = match std::str::from_utf8(&cdata) {
                        Ok(text) => text.to_string(),
                        Err(e) => return Err(self.fail(position, e.to_string())),
                    };
                    self.characters(&text, position, observer)?;
                }
                Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => {}
                Event::Eof => break,
            }
        }

        self.consumed += chunk.len() as u64;
        Ok(())
    }

    fn open<O>(&mut self, start: &BytesStart<'_>, position: u64, observer: &mut O) -> Result<NodeId>
    where
        O: TreeObserver + ?Sized,
    {
        if self.stack.len() == 1 && self.document_element_seen {
            return Err(self.fail(position, "extra content after the document element"));
        }

        let name = match std::str::from_utf8(start.name().as_ref()) {
            Ok(name) if !name.is_empty() => name.to_string(),
            Ok(_) => return Err(self.fail(position, "element without a name")),
            Err(e) => return Err(self.fail(position, e.to_string())),
        };

        let mut attributes = BTreeMap::new();
        for attribute in start.attributes() {
            let parsed = attribute.map_err(|e| e.to_string()).and_then(|attribute| {
                let key = std::str::from_utf8(attribute.key.as_ref())
                    .map_err(|e| e.to_string())?
                    .to_string();
                let value = attribute
                    .unescape_value()
                    .map_err(|e| e.to_string())?
                    .into_owned();
                Ok((key, value))
            });
            match parsed {
                Ok((key, value)) => {
                    attributes.insert(key, value);
                }
                Err(message) => return Err(self.fail(position, message)),
            }
        }

        let parent = self.current();
        let id = self.tree.append_element(parent, name, attributes);
        self.stack.push(id);
        self.document_element_seen = true;
        observer.element_opened(&self.tree, id);
        Ok(id)
    }

    fn close<O>(&mut self, name: &str, position: u64, observer: &mut O) -> Result<()>
    where
        O: TreeObserver + ?Sized,
    {
        if self.stack.len() == 1 {
            return Err(self.fail(position, format!("unexpected closing tag '</{}>'", name)));
        }

        let current = self.current();
        let open = self.tree.node(current).name();
        if open != name {
            let message = format!("mismatched closing tag: expected '</{}>', found '</{}>'", open, name);
            return Err(self.fail(position, message));
        }

        self.stack.pop();
        observer.element_closed(&self.tree, current);
        Ok(())
    }

    fn characters<O>(&mut self, text: &str, position: u64, observer: &mut O) -> Result<()>
    where
        O: TreeObserver + ?Sized,
    {
        if text.is_empty() {
            return Ok(());
        }
        if self.stack.len() == 1 {
            // Whitespace around the document element is not content
            if text.trim().is_empty() {
                return Ok(());
            }
            return Err(self.fail(position, "character data outside the document element"));
        }

        let current = self.current();
        self.tree.append_text(current, text);
        observer.text_appended(&self.tree, current, text);
        Ok(())
    }

    fn fail(&mut self, position: u64, message: impl Into<String>) -> SoapError {
        let message = message.into();
        self.failure = Some((position, message.clone()));
        self.malformed(position, message)
    }

    fn malformed(&self, position: u64, message: String) -> SoapError {
        SoapError::MalformedDocument {
            position,
            message,
            partial: Box::new(self.tree.clone()),
        }
    }
}

/// Decode a whole document in one shot
pub fn node_tree_from_data(data: &[u8]) -> Result<NodeTree> {
    node_tree_from_data_with_handler(data, &mut |_: &NodeTree, _: &SoapError| {})
}

/// Decode a whole document, notifying `handler` once if it is malformed
pub fn node_tree_from_data_with_handler(
    data: &[u8],
    handler: &mut dyn ParseErrorHandler,
) -> Result<NodeTree> {
    let mut builder = TreeBuilder::new();
    let result = builder
        .feed(data, &mut ())
        .and_then(|_| builder.finish(&mut ()));

    match result {
        Ok(mut tree) => {
            tree.set_tree_data(data.to_vec());
            Ok(tree)
        }
        Err(error) => {
            if let Some(partial) = error.partial_tree() {
                handler.parse_failed(partial, &error);
            }
            Err(error)
        }
    }
}

/// Progress through the incomplete construct at the head of `pending`
///
/// Lets the next fragment continue the search where the last one stopped,
/// so a long comment, CDATA section or tag costs one pass overall.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct MarkupScan {
    /// Bytes of the construct already searched
    searched: usize,
    quote: Option<u8>,
    depth: usize,
}

/// Longest run after `&` still held back as a possibly split entity reference
const MAX_ENTITY_LEN: usize = 64;

/// Length of the longest prefix that can be decoded without seeing more bytes
///
/// Markup is only released once its closing delimiter has arrived. Text is
/// released up to the next `<`, or to the end of the buffer minus any
/// unterminated entity reference or partial UTF-8 sequence.
///
/// `resume` describes the construct at the start of `buf`. When the buffer
/// ends inside markup, the prefix stops right before it and `resume` is left
/// describing how far that construct was searched.
fn complete_prefix_len(buf: &[u8], resume: &mut MarkupScan) -> usize {
    let mut scan = std::mem::take(resume);
    let mut i = 0;
    let mut ready = 0;

    while i < buf.len() {
        if buf[i] == b'<' {
            match markup_end(&buf[i..], &mut scan) {
                Some(len) => {
                    i += len;
                    ready = i;
                    scan = MarkupScan::default();
                }
                None => {
                    *resume = scan;
                    break;
                }
            }
        } else {
            match buf[i..].iter().position(|&b| b == b'<') {
                Some(offset) => {
                    i += offset;
                    ready = i;
                }
                None => {
                    ready = text_end(buf, i);
                    break;
                }
            }
        }
    }

    ready
}

const COMMENT_OPEN: &[u8] = b"<!--";
const CDATA_OPEN: &[u8] = b"<![CDATA[";

/// Length of the markup construct at the start of `rest`, if complete
fn markup_end(rest: &[u8], scan: &mut MarkupScan) -> Option<usize> {
    if rest.starts_with(COMMENT_OPEN) {
        return resume_find(rest, b"-->", COMMENT_OPEN.len(), scan).map(|at| at + 3);
    }
    if rest.starts_with(CDATA_OPEN) {
        return resume_find(rest, b"]]>", CDATA_OPEN.len(), scan).map(|at| at + 3);
    }
    // Too short to tell a comment or CDATA section from other markup yet
    if COMMENT_OPEN.starts_with(rest) || CDATA_OPEN.starts_with(rest) {
        return None;
    }
    if rest.starts_with(b"<?") {
        return resume_find(rest, b"?>", 2, scan).map(|at| at + 2);
    }
    if rest.starts_with(b"<!") {
        return doctype_end(rest, scan);
    }
    tag_end(rest, scan)
}

/// Find `needle` in `rest`, skipping what an earlier call already searched
fn resume_find(
    rest: &[u8],
    needle: &[u8],
    body_start: usize,
    scan: &mut MarkupScan,
) -> Option<usize> {
    // A needle may straddle the old end of the buffer
    let from = scan
        .searched
        .saturating_sub(needle.len() - 1)
        .max(body_start);
    let found = find(rest, needle, from);
    if found.is_none() {
        scan.searched = rest.len();
    }
    found
}

fn tag_end(rest: &[u8], scan: &mut MarkupScan) -> Option<usize> {
    let from = scan.searched.max(1);
    for (offset, &byte) in rest.iter().enumerate().skip(from) {
        match (scan.quote, byte) {
            (None, b'"' | b'\'') => scan.quote = Some(byte),
            (Some(q), _) if q == byte => scan.quote = None,
            (None, b'>') => return Some(offset + 1),
            _ => {}
        }
    }
    scan.searched = rest.len();
    None
}

fn doctype_end(rest: &[u8], scan: &mut MarkupScan) -> Option<usize> {
    let from = scan.searched.max(2);
    for (offset, &byte) in rest.iter().enumerate().skip(from) {
        match (scan.quote, byte) {
            (None, b'"' | b'\'') => scan.quote = Some(byte),
            (Some(q), _) if q == byte => scan.quote = None,
            (None, b'[') => scan.depth += 1,
            (None, b']') => scan.depth = scan.depth.saturating_sub(1),
            (None, b'>') if scan.depth == 0 => return Some(offset + 1),
            _ => {}
        }
    }
    scan.searched = rest.len();
    None
}

/// Safe cut point for trailing text that has no following `<` yet
fn text_end(buf: &[u8], start: usize) -> usize {
    let mut end = buf.len();

    if let Some(amp) = buf[start..].iter().rposition(|&b| b == b'&') {
        let amp = start + amp;
        // Anything longer is no entity reference and is left to the decoder to reject
        if buf.len() - amp <= MAX_ENTITY_LEN && !buf[amp..].contains(&b';') {
            end = amp;
        }
    }

    // Step back over an incomplete trailing UTF-8 sequence
    let mut lead = end;
    while lead > start && buf[lead - 1] & 0xC0 == 0x80 {
        lead -= 1;
    }
    if lead > start {
        let width = match buf[lead - 1] {
            b if b < 0x80 => 1,
            b if b & 0xE0 == 0xC0 => 2,
            b if b & 0xF0 == 0xE0 => 3,
            b if b & 0xF8 == 0xF0 => 4,
            _ => 1,
        };
        if end - (lead - 1) < width {
            end = lead - 1;
        }
    }

    end
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|at| from + at)
}
