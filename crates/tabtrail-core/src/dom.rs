//! In-memory page DOM
//!
//! Nodes live in an arena and are addressed by [`NodeId`]. Removing a node
//! detaches its subtree but keeps the ids valid, so stale ids held by the
//! recorder or a test can still be asked whether they are attached.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};

/// A document shared between a page context and whatever drives it
pub type SharedDocument = Arc<Mutex<Document>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub usize);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub tag: String,
    pub attrs: BTreeMap<String, String>,
    pub text: Option<String>,
    pub value: Option<String>,
    pub checked: bool,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    attached: bool,
}

/// Element description used to build documents and to (de)serialize page
/// snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub tag: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub checked: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            ..Default::default()
        }
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn id(self, id: &str) -> Self {
        self.attr("id", id)
    }

    pub fn class(mut self, class: &str) -> Self {
        let entry = self.attrs.entry("class".to_string()).or_default();
        if !entry.is_empty() {
            entry.push(' ');
        }
        entry.push_str(class);
        self
    }

    pub fn role(self, role: &str) -> Self {
        self.attr("role", role)
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }

    pub fn value(mut self, value: &str) -> Self {
        self.value = Some(value.to_string());
        self
    }

    pub fn child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }
}

/// A serialized page: its URL and element tree. Node ids of a document built
/// from a snapshot follow pre-order, so `#0` is the root element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub url: String,
    pub root: Element,
}

impl PageSnapshot {
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn to_document(&self) -> Document {
        Document::from_snapshot(&self.url, &self.root)
    }
}

#[derive(Debug, Clone)]
pub struct Document {
    url: String,
    nodes: Vec<Node>,
    root: NodeId,
    revision: u64,
}

impl Document {
    /// Empty `<html><body></body></html>` document
    pub fn new(url: &str) -> Self {
        Self::from_snapshot(url, &Element::new("html").child(Element::new("body")))
    }

    pub fn from_snapshot(url: &str, root: &Element) -> Self {
        let mut doc = Self {
            url: url.to_string(),
            nodes: Vec::new(),
            root: NodeId(0),
            revision: 0,
        };
        doc.root = doc.insert(None, root);
        doc
    }

    pub fn snapshot(&self) -> Element {
        self.snapshot_node(self.root)
    }

    fn snapshot_node(&self, id: NodeId) -> Element {
        let node = &self.nodes[id.0];
        Element {
            tag: node.tag.clone(),
            attrs: node.attrs.clone(),
            text: node.text.clone(),
            value: node.value.clone(),
            checked: node.checked,
            children: node.children.iter().map(|c| self.snapshot_node(*c)).collect(),
        }
    }

    pub fn page_snapshot(&self) -> PageSnapshot {
        PageSnapshot {
            url: self.url.clone(),
            root: self.snapshot(),
        }
    }

    pub fn into_shared(self) -> SharedDocument {
        Arc::new(Mutex::new(self))
    }

    fn insert(&mut self, parent: Option<NodeId>, el: &Element) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            tag: el.tag.to_ascii_lowercase(),
            attrs: el.attrs.clone(),
            text: el.text.clone(),
            value: el.value.clone(),
            checked: el.checked,
            parent,
            children: Vec::new(),
            attached: true,
        });
        for child in &el.children {
            let child_id = self.insert(Some(id), child);
            self.nodes[id.0].children.push(child_id);
        }
        id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn body(&self) -> NodeId {
        self.nodes[self.root.0]
            .children
            .iter()
            .copied()
            .find(|c| self.nodes[c.0].tag == "body")
            .unwrap_or(self.root)
    }

    /// Bumped on every mutation; replay uses it to detect a settled page
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Add `el` as the last child of `parent`. Fails for ids this document
    /// never issued.
    pub fn append(&mut self, parent: NodeId, el: Element) -> Result<NodeId> {
        if parent.0 >= self.nodes.len() {
            return Err(Error::invalid_input(format!("no node {} in this document", parent)));
        }
        let id = self.insert(Some(parent), &el);
        if let Some(node) = self.nodes.get_mut(parent.0) {
            node.children.push(id);
        }
        if !self.is_attached(parent) {
            self.set_attached(id, false);
        }
        self.revision += 1;
        Ok(id)
    }

    /// Detach `id` and its subtree. Returns false for the root or an already
    /// detached node.
    pub fn remove(&mut self, id: NodeId) -> bool {
        if id == self.root || !self.is_attached(id) {
            return false;
        }
        if let Some(parent) = self.nodes[id.0].parent {
            self.nodes[parent.0].children.retain(|c| *c != id);
        }
        self.set_attached(id, false);
        self.revision += 1;
        true
    }

    fn set_attached(&mut self, id: NodeId, attached: bool) {
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            self.nodes[n.0].attached = attached;
            stack.extend(self.nodes[n.0].children.iter().copied());
        }
    }

    /// Replace the whole document, as a navigation does
    pub fn replace(&mut self, url: &str, root: &Element) {
        let revision = self.revision + 1;
        *self = Self::from_snapshot(url, root);
        self.revision = revision;
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub fn is_attached(&self, id: NodeId) -> bool {
        self.nodes.get(id.0).map(|n| n.attached).unwrap_or(false)
    }

    pub fn tag(&self, id: NodeId) -> Option<&str> {
        self.node(id).map(|n| n.tag.as_str())
    }

    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        self.node(id)?.attrs.get(name).map(String::as_str)
    }

    pub fn set_attr(&mut self, id: NodeId, name: &str, value: &str) {
        if let Some(node) = self.nodes.get_mut(id.0) {
            node.attrs.insert(name.to_string(), value.to_string());
            self.revision += 1;
        }
    }

    pub fn classes(&self, id: NodeId) -> Vec<&str> {
        self.attr(id, "class")
            .map(|c| c.split_whitespace().collect())
            .unwrap_or_default()
    }

    pub fn value(&self, id: NodeId) -> Option<&str> {
        self.node(id)?.value.as_deref()
    }

    pub fn set_value(&mut self, id: NodeId, value: &str) {
        if let Some(node) = self.nodes.get_mut(id.0) {
            node.value = Some(value.to_string());
            self.revision += 1;
        }
    }

    pub fn is_checked(&self, id: NodeId) -> bool {
        self.node(id).map(|n| n.checked).unwrap_or(false)
    }

    pub fn set_checked(&mut self, id: NodeId, checked: bool) {
        if let Some(node) = self.nodes.get_mut(id.0) {
            node.checked = checked;
            self.revision += 1;
        }
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id)?.parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.node(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    /// Ancestors of `id`, nearest first
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cur = self.parent(id);
        while let Some(p) = cur {
            out.push(p);
            cur = self.parent(p);
        }
        out
    }

    /// All attached nodes in document order
    pub fn descendants(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.nodes[id.0].children.iter().rev().copied());
        }
        out
    }

    /// Text of the node and its descendants, whitespace collapsed
    pub fn text_content(&self, id: NodeId) -> String {
        let mut parts = Vec::new();
        self.collect_text(id, &mut parts);
        parts.join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
    }

    fn collect_text<'a>(&'a self, id: NodeId, parts: &mut Vec<&'a str>) {
        let Some(node) = self.node(id) else { return };
        if let Some(t) = &node.text {
            parts.push(t);
        }
        for c in &node.children {
            self.collect_text(*c, parts);
        }
    }

    /// 1-based position of `id` among its parent's children with the same tag
    pub fn nth_of_type(&self, id: NodeId) -> usize {
        let Some(node) = self.node(id) else { return 1 };
        let Some(parent) = node.parent else { return 1 };
        self.children(parent)
            .iter()
            .filter(|c| self.nodes[c.0].tag == node.tag)
            .position(|c| *c == id)
            .map(|p| p + 1)
            .unwrap_or(1)
    }

    /// Attached nodes whose attribute `name` equals `value`
    pub fn find_by_attr(&self, name: &str, value: &str) -> Vec<NodeId> {
        self.descendants()
            .into_iter()
            .filter(|id| self.attr(*id, name) == Some(value))
            .collect()
    }

    /// First attached node with `id="…"`; mostly a test convenience
    pub fn by_id(&self, id: &str) -> Option<NodeId> {
        self.find_by_attr("id", id).into_iter().next()
    }
}

pub fn is_form_control(tag: &str) -> bool {
    matches!(tag, "input" | "textarea" | "select")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Document {
        let mut doc = Document::new("https://example.com/login");
        let body = doc.body();
        doc.append(
            body,
            Element::new("form")
                .id("login")
                .child(Element::new("input").attr("name", "email"))
                .child(Element::new("input").attr("name", "password"))
                .child(Element::new("button").text("Sign in")),
        ).unwrap();
        doc
    }

    #[test]
    fn remove_detaches_subtree() {
        let mut doc = sample();
        let form = doc.by_id("login").unwrap();
        let email = doc.find_by_attr("name", "email")[0];
        let before = doc.revision();

        assert!(doc.remove(form));
        assert!(!doc.is_attached(form));
        assert!(!doc.is_attached(email));
        assert!(doc.find_by_attr("name", "email").is_empty());
        assert!(doc.revision() > before);
        assert!(!doc.remove(form));
    }

    #[test]
    fn append_rejects_foreign_ids() {
        let mut doc = sample();
        let before = doc.revision();
        let err = doc.append(NodeId(10_000), Element::new("p")).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::InvalidInput);
        assert_eq!(doc.revision(), before);

        let form = doc.by_id("login").unwrap();
        doc.remove(form);
        let late = doc.append(form, Element::new("input")).unwrap();
        assert!(!doc.is_attached(late));
    }

    #[test]
    fn nth_of_type_counts_same_tag_only() {
        let doc = sample();
        let form = doc.by_id("login").unwrap();
        let kids = doc.children(form).to_vec();
        assert_eq!(doc.nth_of_type(kids[0]), 1);
        assert_eq!(doc.nth_of_type(kids[1]), 2);
        assert_eq!(doc.nth_of_type(kids[2]), 1);
    }

    #[test]
    fn text_content_collapses_whitespace() {
        let mut doc = Document::new("https://example.com");
        let body = doc.body();
        let p = doc.append(
            body,
            Element::new("p")
                .text("  Hello \n")
                .child(Element::new("b").text("world ")),
        ).unwrap();
        assert_eq!(doc.text_content(p), "Hello world");
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let doc = sample();
        let json = serde_json::to_string(&doc.snapshot()).unwrap();
        let el: Element = serde_json::from_str(&json).unwrap();
        let copy = Document::from_snapshot(doc.url(), &el);
        assert_eq!(copy.snapshot(), doc.snapshot());
    }
}
