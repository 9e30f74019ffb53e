//! Unit, streaming and ordered tag extraction
//!
//! [`TagExtractor`] observes a [`TreeBuilder`] and turns the open/close events
//! of configured tags into [`Extraction`] events without interrupting the tree
//! build. Events are queued in the order the document produces them.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::node::{NodeId, NodeTree};
use crate::tree_builder::{TreeBuilder, TreeObserver};

/// The three watched tag sets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TagSets {
    /// Closed subtrees of these tags are delivered as standalone units
    pub unit_tags: Vec<String>,
    /// Character data inside these tags is delivered chunk by chunk
    pub streaming_tags: Vec<String>,
    /// Closed subtrees delivered strictly in close order
    pub ordered_special_tags: Vec<String>,
}

impl TagSets {
    pub fn is_empty(&self) -> bool {
        self.unit_tags.is_empty()
            && self.streaming_tags.is_empty()
            && self.ordered_special_tags.is_empty()
    }

    /// All configured names across the three sets
    pub fn all_tags(&self) -> impl Iterator<Item = &str> {
        self.unit_tags
            .iter()
            .chain(&self.streaming_tags)
            .chain(&self.ordered_special_tags)
            .map(String::as_str)
    }
}

/// Event produced by the extractor
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    /// A unit tag closed; the tree's synthetic root holds the unit element
    Unit(NodeTree),
    /// Character data observed inside a streaming tag
    Content {
        text: String,
        tag: String,
        last_chunk: bool,
    },
    /// An ordered special tag closed
    OrderedTag { tag: String, unit: NodeTree },
}

#[derive(Debug)]
struct StreamingTag {
    id: NodeId,
    tag: String,
    buffer: String,
}

/// Tag watcher layered on the tree builder's events
#[derive(Debug, Default)]
pub struct TagExtractor {
    unit_tags: HashSet<String>,
    streaming_tags: HashSet<String>,
    ordered_tags: HashSet<String>,
    open_streams: Vec<StreamingTag>,
    queue: VecDeque<Extraction>,
    units_recognized: usize,
    ordered_recognized: usize,
}

impl TagExtractor {
    pub fn new(tags: &TagSets) -> Self {
        Self {
            unit_tags: tags.unit_tags.iter().cloned().collect(),
            streaming_tags: tags.streaming_tags.iter().cloned().collect(),
            ordered_tags: tags.ordered_special_tags.iter().cloned().collect(),
            ..Self::default()
        }
    }

    /// Units queued so far
    pub fn units_recognized(&self) -> usize {
        self.units_recognized
    }

    /// Ordered special tags queued so far
    pub fn ordered_recognized(&self) -> usize {
        self.ordered_recognized
    }

    /// Streaming tags currently open
    pub fn open_streaming_tags(&self) -> usize {
        self.open_streams.len()
    }

    /// Emit buffered content of still-open streaming tags as non-final chunks
    pub fn flush_streaming(&mut self) {
        for stream in &mut self.open_streams {
            if stream.buffer.is_empty() {
                continue;
            }
            self.queue.push_back(Extraction::Content {
                text: std::mem::take(&mut stream.buffer),
                tag: stream.tag.clone(),
                last_chunk: false,
            });
        }
    }

    /// Take every queued event in document order
    pub fn drain(&mut self) -> Vec<Extraction> {
        self.queue.drain(..).collect()
    }

    /// Drop open streaming state after a decoding failure
    pub fn abort(&mut self) {
        self.open_streams.clear();
    }
}

impl TreeObserver for TagExtractor {
    fn element_opened(&mut self, tree: &NodeTree, id: NodeId) {
        let name = tree.node(id).name();
        if self.streaming_tags.contains(name) {
            self.open_streams.push(StreamingTag {
                id,
                tag: name.to_string(),
                buffer: String::new(),
            });
        }
    }

    fn text_appended(&mut self, _tree: &NodeTree, _id: NodeId, text: &str) {
        // Every open streaming tag encloses the node receiving text
        for stream in &mut self.open_streams {
            stream.buffer.push_str(text);
        }
    }

    fn element_closed(&mut self, tree: &NodeTree, id: NodeId) {
        let closing = if self.open_streams.last().is_some_and(|stream| stream.id == id) {
            self.open_streams.pop()
        } else {
            None
        };

        let name = tree.node(id).name();
        let is_unit = self.unit_tags.contains(name);
        let is_ordered = self.ordered_tags.contains(name);

        // Text read before this close goes out ahead of the events it triggers
        if closing.is_some() || is_unit || is_ordered {
            self.flush_streaming();
        }

        if let Some(stream) = closing {
            self.queue.push_back(Extraction::Content {
                text: stream.buffer,
                tag: stream.tag,
                last_chunk: true,
            });
        }
        if is_unit {
            self.units_recognized += 1;
            self.queue.push_back(Extraction::Unit(tree.extract_subtree(id)));
        }
        if is_ordered {
            self.ordered_recognized += 1;
            self.queue.push_back(Extraction::OrderedTag {
                tag: name.to_string(),
                unit: tree.extract_subtree(id),
            });
        }
    }
}

/// Tree builder and tag extractor driven together
#[derive(Debug)]
pub struct ExtractingDecoder {
    builder: TreeBuilder,
    extractor: TagExtractor,
}

impl ExtractingDecoder {
    pub fn new(tags: &TagSets) -> Self {
        Self {
            builder: TreeBuilder::new(),
            extractor: TagExtractor::new(tags),
        }
    }

    pub fn builder(&self) -> &TreeBuilder {
        &self.builder
    }

    pub fn extractor(&self) -> &TagExtractor {
        &self.extractor
    }

    /// Decode one fragment and return the events it completed
    ///
    /// On failure, events for tags that closed before the error are still
    /// returned by the next [`ExtractingDecoder::drain`]; nothing further is
    /// extracted for this document.
    pub fn feed(&mut self, fragment: &[u8]) -> Result<Vec<Extraction>> {
        if let Err(error) = self.builder.feed(fragment, &mut self.extractor) {
            self.extractor.abort();
            return Err(error);
        }
        self.extractor.flush_streaming();
        Ok(self.extractor.drain())
    }

    /// Finish the document, returning the tree and any last events
    pub fn finish(&mut self) -> Result<(NodeTree, Vec<Extraction>)> {
        match self.builder.finish(&mut self.extractor) {
            Ok(tree) => Ok((tree, self.extractor.drain())),
            Err(error) => {
                self.extractor.abort();
                Err(error)
            }
        }
    }

    /// Events queued before a failure
    pub fn drain(&mut self) -> Vec<Extraction> {
        self.extractor.drain()
    }
}
