//! XML node tree
//!
//! Nodes live in an arena owned by [`NodeTree`] and are addressed by [`NodeId`].
//! Parent links are plain indices, so the tree has no ownership cycles and a
//! child can only ever be attached once.

use std::collections::BTreeMap;
use std::fmt;

use quick_xml::escape::escape;
use serde_json::{Map, Value};

use crate::error::{Result, SoapError};

/// Name of the synthetic root node that sits above the document element
pub const ROOT_NODE_NAME: &str = "root";

/// Key prefix used for attributes in dictionary projections
pub const ATTRIBUTE_PREFIX: &str = "@";

/// Key used for non-blank text of mixed-content nodes in dictionary projections
pub const TEXT_KEY: &str = "#text";

/// Compact node identifier (index into the arena)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    /// The synthetic root of every tree
    pub const ROOT: NodeId = NodeId(0);

    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
struct NodeData {
    name: String,
    value: String,
    attributes: BTreeMap<String, String>,
    children: Vec<NodeId>,
    parent: Option<NodeId>,
    user_info: BTreeMap<String, Value>,
}

impl NodeData {
    fn new(name: String, attributes: BTreeMap<String, String>) -> Self {
        assert!(!name.is_empty(), "node name must not be empty");
        Self {
            name,
            value: String::new(),
            attributes,
            children: Vec::new(),
            parent: None,
            user_info: BTreeMap::new(),
        }
    }
}

/// Arena-backed tree of named XML nodes
#[derive(Debug, Clone)]
pub struct NodeTree {
    nodes: Vec<NodeData>,
    tree_data: Option<Vec<u8>>,
}

impl Default for NodeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for NodeTree {
    /// Trees are equal when their nodes are; raw source bytes are ignored
    fn eq(&self, other: &Self) -> bool {
        self.nodes == other.nodes
    }
}

impl NodeTree {
    /// Create a tree holding only the synthetic root node
    pub fn new() -> Self {
        Self::with_root_name(ROOT_NODE_NAME)
    }

    /// Create a tree whose root has the given name
    pub fn with_root_name(name: impl Into<String>) -> Self {
        Self {
            nodes: vec![NodeData::new(name.into(), BTreeMap::new())],
            tree_data: None,
        }
    }

    /// Root node of the tree
    pub fn root(&self) -> Node<'_> {
        Node {
            tree: self,
            id: NodeId::ROOT,
        }
    }

    /// Node view for an id; panics if the id does not belong to this tree
    pub fn node(&self, id: NodeId) -> Node<'_> {
        self.get(id)
            .unwrap_or_else(|| panic!("node id {} is out of range for this tree", id.0))
    }

    /// Node view for an id, if it exists
    pub fn get(&self, id: NodeId) -> Option<Node<'_>> {
        (id.0 < self.nodes.len()).then_some(Node { tree: self, id })
    }

    /// Total number of nodes including the synthetic root
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Create a detached node; attach it with [`NodeTree::add_child`]
    pub fn create_node(
        &mut self,
        name: impl Into<String>,
        attributes: BTreeMap<String, String>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(NodeData::new(name.into(), attributes));
        id
    }

    /// Attach a detached node as the last child of `parent`
    ///
    /// Attaching a node that already has a parent, the root, or an ancestor of
    /// `parent` is a caller bug and panics.
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) {
        assert!(parent.0 < self.nodes.len(), "parent node id out of range");
        assert!(child.0 < self.nodes.len(), "child node id out of range");
        assert!(child != NodeId::ROOT, "the root node cannot become a child");
        assert!(
            self.nodes[child.0].parent.is_none(),
            "node '{}' is already attached to a parent",
            self.nodes[child.0].name
        );

        let mut cursor = Some(parent);
        while let Some(id) = cursor {
            assert!(id != child, "attaching node would create a cycle");
            cursor = self.nodes[id.0].parent;
        }

        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
    }

    /// Create a node and attach it under `parent` in one step
    pub fn append_element(
        &mut self,
        parent: NodeId,
        name: impl Into<String>,
        attributes: BTreeMap<String, String>,
    ) -> NodeId {
        let id = self.create_node(name, attributes);
        self.add_child(parent, id);
        id
    }

    /// Append character data to a node's value
    pub fn append_text(&mut self, id: NodeId, text: &str) {
        self.nodes[id.0].value.push_str(text);
    }

    /// Replace a node's value
    pub fn set_value(&mut self, id: NodeId, value: impl Into<String>) {
        self.nodes[id.0].value = value.into();
    }

    /// Attach caller metadata to a node
    pub fn set_user_info(&mut self, id: NodeId, key: impl Into<String>, value: Value) {
        self.nodes[id.0].user_info.insert(key.into(), value);
    }

    /// Raw bytes the tree was decoded from, kept only for one-shot decoding
    pub fn tree_data(&self) -> Option<&[u8]> {
        self.tree_data.as_deref()
    }

    pub(crate) fn set_tree_data(&mut self, data: Vec<u8>) {
        self.tree_data = Some(data);
    }

    /// Copy the subtree rooted at `id` into a standalone tree under a fresh synthetic root
    pub fn extract_subtree(&self, id: NodeId) -> NodeTree {
        let mut unit = NodeTree::new();
        self.copy_into(id, &mut unit, NodeId::ROOT);
        unit
    }

    fn copy_into(&self, source: NodeId, target: &mut NodeTree, parent: NodeId) {
        let data = &self.nodes[source.0];
        let copy = target.append_element(parent, data.name.clone(), data.attributes.clone());
        target.nodes[copy.0].value = data.value.clone();
        target.nodes[copy.0].user_info = data.user_info.clone();
        for &child in &data.children {
            self.copy_into(child, target, copy);
        }
    }
}

/// Borrowed view of a single node
#[derive(Clone, Copy)]
pub struct Node<'a> {
    tree: &'a NodeTree,
    id: NodeId,
}

impl<'a> Node<'a> {
    fn data(&self) -> &'a NodeData {
        &self.tree.nodes[self.id.0]
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn tree(&self) -> &'a NodeTree {
        self.tree
    }

    pub fn name(&self) -> &'a str {
        &self.data().name
    }

    pub fn value(&self) -> &'a str {
        &self.data().value
    }

    pub fn attributes(&self) -> &'a BTreeMap<String, String> {
        &self.data().attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&'a str> {
        self.data().attributes.get(name).map(String::as_str)
    }

    pub fn user_info(&self) -> &'a BTreeMap<String, Value> {
        &self.data().user_info
    }

    pub fn child_count(&self) -> usize {
        self.data().children.len()
    }

    /// Children in document order
    pub fn children(&self) -> impl DoubleEndedIterator<Item = Node<'a>> + ExactSizeIterator + use<'a> {
        let tree = self.tree;
        self.data()
            .children
            .iter()
            .map(move |&id| Node { tree, id })
    }

    pub fn parent(&self) -> Option<Node<'a>> {
        self.data().parent.map(|id| Node {
            tree: self.tree,
            id,
        })
    }

    /// The ancestor without a parent
    pub fn root_node(&self) -> Node<'a> {
        let mut node = *self;
        while let Some(parent) = node.parent() {
            node = parent;
        }
        node
    }

    /// This node and all its descendants in document order
    pub fn descendants(&self) -> Descendants<'a> {
        Descendants {
            tree: self.tree,
            stack: vec![self.id],
        }
    }

    /// Depth-first search for the first node with the given name (self included)
    pub fn search_node_by_name(&self, name: &str) -> Option<Node<'a>> {
        self.descendants().find(|node| node.name() == name)
    }

    /// Count of nodes with the given name in this subtree (self included)
    pub fn count_of_nodes_by_name(&self, name: &str) -> usize {
        self.descendants().filter(|node| node.name() == name).count()
    }

    /// First node down the single-child chain that has more than one child
    ///
    /// Responses are often wrapped in several single-child elements; this skips
    /// them. Returns `None` when the chain ends without branching.
    pub fn first_nonsingle_parent(&self) -> Option<Node<'a>> {
        let mut node = *self;
        loop {
            match node.child_count() {
                0 => return None,
                1 => node = node.children().next()?,
                _ => return Some(node),
            }
        }
    }

    /// Project this node's content (attributes, children, text) to a mapping
    ///
    /// Fails with [`SoapError::NotProjectable`] when any level holds two
    /// siblings with the same name.
    pub fn to_dictionary(&self) -> Result<Map<String, Value>> {
        let mut map = Map::new();
        for (key, value) in self.attributes() {
            map.insert(
                format!("{ATTRIBUTE_PREFIX}{key}"),
                Value::String(value.clone()),
            );
        }
        let text = self.value().trim();
        if !text.is_empty() && (self.child_count() > 0 || !self.attributes().is_empty()) {
            map.insert(TEXT_KEY.to_string(), Value::String(text.to_string()));
        }
        for child in self.children() {
            if map.contains_key(child.name()) {
                return Err(SoapError::NotProjectable {
                    name: child.name().to_string(),
                });
            }
            map.insert(child.name().to_string(), child.project()?);
        }
        Ok(map)
    }

    fn project(&self) -> Result<Value> {
        if self.child_count() == 0 && self.attributes().is_empty() {
            return Ok(Value::String(self.value().to_string()));
        }
        self.to_dictionary().map(Value::Object)
    }

    /// Serialize the subtree back to XML text
    ///
    /// The synthetic root is transparent: only its children are written.
    pub fn to_xml_string(&self) -> String {
        let mut out = String::new();
        if self.id == NodeId::ROOT && self.tree.root().name() == ROOT_NODE_NAME {
            for child in self.children() {
                child.write_xml(&mut out);
            }
        } else {
            self.write_xml(&mut out);
        }
        out
    }

    fn write_xml(&self, out: &mut String) {
        out.push('<');
        out.push_str(self.name());
        for (key, value) in self.attributes() {
            out.push(' ');
            out.push_str(key);
            out.push_str("=\"");
            out.push_str(&escape(value.as_str()));
            out.push('"');
        }
        if self.child_count() == 0 && self.value().is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        out.push_str(&escape(self.value()));
        for child in self.children() {
            child.write_xml(out);
        }
        out.push_str("</");
        out.push_str(self.name());
        out.push('>');
    }
}

impl fmt::Debug for Node<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("value", &self.value())
            .field("attributes", self.attributes())
            .field("children", &self.child_count())
            .finish()
    }
}

/// Pre-order iterator over a subtree
pub struct Descendants<'a> {
    tree: &'a NodeTree,
    stack: Vec<NodeId>,
}

impl<'a> Iterator for Descendants<'a> {
    type Item = Node<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        let node = Node {
            tree: self.tree,
            id,
        };
        self.stack
            .extend(self.tree.nodes[id.0].children.iter().rev().copied());
        Some(node)
    }
}
