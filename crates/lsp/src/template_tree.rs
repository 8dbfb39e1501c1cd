//! Key-path index over JSON and YAML templates.
//!
//! Records every mapping key and sequence item together with the span of
//! its whole entry, so a path such as `Resources/Bucket/Properties/Tags/0`
//! resolves to the text an editor should underline. Both encodings are
//! parsed with tree-sitter grammars; block and flow YAML collections are
//! indexed alike, and aliases resolve through their anchors. Columns are
//! counted in UTF-16 code units.

use std::collections::HashMap;

use lsp_types::{Position, Range};
use stackward_engine::{DocumentType, SyntaxTree};
use tree_sitter::{Language, Node as SyntaxNode, Parser, Point};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Mapping(Vec<Entry>),
    Sequence(Vec<Entry>),
    Scalar,
}

/// A mapping entry or sequence item. Items are keyed by their index.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    key: String,
    range: Range,
    node: Node,
}

impl Node {
    fn child(&self, segment: &str) -> Option<&Entry> {
        match self {
            Node::Mapping(entries) | Node::Sequence(entries) => {
                entries.iter().find(|entry| entry.key == segment)
            }
            Node::Scalar => None,
        }
    }
}

/// Parsed key-path index of one template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateTree {
    root: Node,
}

impl TemplateTree {
    /// Index `text`. Returns `None` for malformed JSON; YAML with syntax
    /// errors is indexed as far as the grammar recovered it.
    pub fn parse(text: &str, doc_type: DocumentType) -> Option<Self> {
        let language: Language = match doc_type {
            DocumentType::Json => tree_sitter_json::LANGUAGE.into(),
            DocumentType::Yaml => tree_sitter_yaml::LANGUAGE.into(),
        };
        let mut parser = Parser::new();
        if let Err(e) = parser.set_language(&language) {
            tracing::warn!(?doc_type, "failed to load template grammar: {}", e);
            return None;
        }
        let tree = parser.parse(text, None)?;
        let root = tree.root_node();

        let mut indexer = Indexer::new(text);
        let root = match doc_type {
            DocumentType::Json => {
                if root.has_error() {
                    return None;
                }
                named_children(root)
                    .into_iter()
                    .find(|node| node.kind() != "comment")
                    .map_or(Node::Mapping(Vec::new()), |value| indexer.json(value))
            }
            DocumentType::Yaml => named_children(root)
                .into_iter()
                .find(|node| node.kind() == "document")
                .map_or(Node::Mapping(Vec::new()), |document| indexer.yaml(document)),
        };
        Some(Self { root })
    }
}

impl SyntaxTree for TemplateTree {
    fn resolve_path(&self, segments: &[&str]) -> Option<Range> {
        let (last, parents) = segments.split_last()?;
        let mut node = &self.root;
        for segment in parents {
            node = &node.child(segment)?.node;
        }
        node.child(last).map(|entry| entry.range)
    }
}

/// Guess the template encoding from the uri, then the content.
pub fn detect_document_type(uri: &str, text: &str) -> DocumentType {
    let lower = uri.to_ascii_lowercase();
    if lower.ends_with(".json")
        || (lower.ends_with(".template") && text.trim_start().starts_with('{'))
    {
        DocumentType::Json
    } else if lower.ends_with(".yaml") || lower.ends_with(".yml") {
        DocumentType::Yaml
    } else if text.trim_start().starts_with('{') {
        DocumentType::Json
    } else {
        DocumentType::Yaml
    }
}

fn utf16_len(s: &str) -> u32 {
    s.chars().map(|c| c.len_utf16() as u32).sum()
}

fn named_children(node: SyntaxNode<'_>) -> Vec<SyntaxNode<'_>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor).collect()
}

/// Walks a syntax tree into the owned index.
struct Indexer<'a> {
    text: &'a str,
    lines: Vec<&'a str>,
    anchors: HashMap<String, Node>,
}

impl<'a> Indexer<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            lines: text.split('\n').collect(),
            anchors: HashMap::new(),
        }
    }

    fn source(&self, node: SyntaxNode<'_>) -> &'a str {
        self.text.get(node.byte_range()).unwrap_or_default()
    }

    /// tree-sitter columns are bytes.
    fn position(&self, point: Point) -> Position {
        let line = self.lines.get(point.row).copied().unwrap_or_default();
        let prefix = line.get(..point.column).unwrap_or(line);
        Position::new(point.row as u32, utf16_len(prefix))
    }

    fn range(&self, node: SyntaxNode<'_>) -> Range {
        Range::new(
            self.position(node.start_position()),
            self.position(node.end_position()),
        )
    }

    // ── JSON ─────────────────────────────────────────────────────────

    fn json(&mut self, node: SyntaxNode<'_>) -> Node {
        match node.kind() {
            "object" => {
                let mut entries = Vec::new();
                for pair in named_children(node) {
                    if pair.kind() != "pair" {
                        continue;
                    }
                    let Some(key) = pair.child_by_field_name("key") else {
                        continue;
                    };
                    let node = pair
                        .child_by_field_name("value")
                        .map_or(Node::Scalar, |value| self.json(value));
                    entries.push(Entry {
                        key: unquote_double(self.source(key)),
                        range: self.range(pair),
                        node,
                    });
                }
                Node::Mapping(entries)
            }
            "array" => {
                let mut items = Vec::new();
                for value in named_children(node) {
                    if value.kind() == "comment" {
                        continue;
                    }
                    let range = self.range(value);
                    let node = self.json(value);
                    items.push(Entry {
                        key: items.len().to_string(),
                        range,
                        node,
                    });
                }
                Node::Sequence(items)
            }
            _ => Node::Scalar,
        }
    }

    // ── YAML ─────────────────────────────────────────────────────────

    fn yaml(&mut self, node: SyntaxNode<'_>) -> Node {
        match node.kind() {
            "document" | "block_node" | "flow_node" => {
                let mut anchor = None;
                let mut content = None;
                for child in named_children(node) {
                    match child.kind() {
                        "anchor" => anchor = Some(self.source(child).trim_start_matches('&')),
                        "tag" | "comment" | "yaml_directive" | "tag_directive"
                        | "reserved_directive" => {}
                        _ => {
                            content = Some(child);
                            break;
                        }
                    }
                }
                let indexed = content.map_or(Node::Scalar, |content| self.yaml(content));
                if let Some(anchor) = anchor {
                    self.anchors.insert(anchor.to_string(), indexed.clone());
                }
                indexed
            }
            "alias" => {
                let name = self.source(node).trim_start_matches('*');
                self.anchors.get(name).cloned().unwrap_or(Node::Scalar)
            }
            "block_mapping" | "flow_mapping" => {
                let mut entries = Vec::new();
                for pair in named_children(node) {
                    if !matches!(pair.kind(), "block_mapping_pair" | "flow_pair") {
                        continue;
                    }
                    let Some(key) = pair
                        .child_by_field_name("key")
                        .and_then(|key| self.yaml_key(key))
                    else {
                        continue;
                    };
                    let node = pair
                        .child_by_field_name("value")
                        .map_or(Node::Scalar, |value| self.yaml(value));
                    entries.push(Entry {
                        key,
                        range: self.range(pair),
                        node,
                    });
                }
                Node::Mapping(entries)
            }
            "block_sequence" | "flow_sequence" => {
                let mut items = Vec::new();
                for item in named_children(node) {
                    let node = match item.kind() {
                        "block_sequence_item" => named_children(item)
                            .into_iter()
                            .find(|child| child.kind() != "comment")
                            .map_or(Node::Scalar, |value| self.yaml(value)),
                        "flow_node" => self.yaml(item),
                        "flow_pair" => {
                            let mut entries = Vec::new();
                            if let Some(key) = item
                                .child_by_field_name("key")
                                .and_then(|key| self.yaml_key(key))
                            {
                                let node = item
                                    .child_by_field_name("value")
                                    .map_or(Node::Scalar, |value| self.yaml(value));
                                entries.push(Entry {
                                    key,
                                    range: self.range(item),
                                    node,
                                });
                            }
                            Node::Mapping(entries)
                        }
                        _ => continue,
                    };
                    items.push(Entry {
                        key: items.len().to_string(),
                        range: self.range(item),
                        node,
                    });
                }
                Node::Sequence(items)
            }
            _ => Node::Scalar,
        }
    }

    fn yaml_key(&self, node: SyntaxNode<'_>) -> Option<String> {
        match node.kind() {
            "block_node" | "flow_node" => named_children(node)
                .into_iter()
                .filter(|child| !matches!(child.kind(), "anchor" | "tag" | "comment"))
                .find_map(|child| self.yaml_key(child)),
            "plain_scalar" => Some(self.source(node).trim().to_string()),
            "double_quote_scalar" => Some(unquote_double(self.source(node))),
            "single_quote_scalar" => {
                let text = self.source(node);
                let inner = text
                    .strip_prefix('\'')
                    .and_then(|t| t.strip_suffix('\''))
                    .unwrap_or(text);
                Some(inner.replace("''", "'"))
            }
            _ => None,
        }
    }
}

/// Decode a double-quoted key, falling back to the raw text between the
/// quotes when it carries escapes JSON does not know.
fn unquote_double(text: &str) -> String {
    serde_json::from_str(text).unwrap_or_else(|_| {
        text.strip_prefix('"')
            .and_then(|t| t.strip_suffix('"'))
            .unwrap_or(text)
            .to_string()
    })
}
