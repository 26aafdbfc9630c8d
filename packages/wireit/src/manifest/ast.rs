//! Owned, spanned JSON values.
//!
//! `jsonc-parser` produces an AST borrowing the source text; manifests are
//! cached for the life of the process, so this module converts that AST
//! into an owned tree carrying byte ranges. All contact with the external
//! parser happens here.

use jsonc_parser::{CollectOptions, ParseOptions, ast as jsonc, common::Ranged, parse_to_ast};

use crate::diagnostic::Span;

#[derive(Clone, Debug)]
pub enum Node {
    Object(ObjectNode),
    Array(ArrayNode),
    String(StringNode),
    Bool(BoolNode),
    Number(NumberNode),
    Null(Span),
}

#[derive(Clone, Debug)]
pub struct ObjectNode {
    pub span: Span,
    pub entries: Vec<Entry>,
}

#[derive(Clone, Debug)]
pub struct Entry {
    pub key: StringNode,
    pub value: Node,
}

#[derive(Clone, Debug)]
pub struct ArrayNode {
    pub span: Span,
    pub elements: Vec<Node>,
}

#[derive(Clone, Debug)]
pub struct StringNode {
    pub span: Span,
    pub value: String,
}

#[derive(Clone, Debug)]
pub struct BoolNode {
    pub span: Span,
    pub value: bool,
}

#[derive(Clone, Debug)]
pub struct NumberNode {
    pub span: Span,
    pub text: String,
}

impl Node {
    pub fn span(&self) -> Span {
        match self {
            Node::Object(node) => node.span,
            Node::Array(node) => node.span,
            Node::String(node) => node.span,
            Node::Bool(node) => node.span,
            Node::Number(node) => node.span,
            Node::Null(span) => *span,
        }
    }

    /// Human-readable type name for "expected X, got Y" diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Node::Object(_) => "object",
            Node::Array(_) => "array",
            Node::String(_) => "string",
            Node::Bool(_) => "boolean",
            Node::Number(_) => "number",
            Node::Null(_) => "null",
        }
    }

    pub fn as_object(&self) -> Option<&ObjectNode> {
        match self {
            Node::Object(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayNode> {
        match self {
            Node::Array(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&StringNode> {
        match self {
            Node::String(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<&BoolNode> {
        match self {
            Node::Bool(node) => Some(node),
            _ => None,
        }
    }
}

impl ObjectNode {
    /// The last entry with the given key, mirroring how JSON parsers
    /// resolve duplicate keys.
    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.iter().rev().find(|entry| entry.key.value == key)
    }

    pub fn get_value(&self, key: &str) -> Option<&Node> {
        self.get(key).map(|entry| &entry.value)
    }
}

/// Parse strict-ish JSON into an owned spanned tree.
///
/// Returns the parser's message on malformed input; an empty document is
/// also malformed.
pub fn parse(text: &str) -> Result<Node, String> {
    let parsed = parse_to_ast(text, &CollectOptions::default(), &ParseOptions::default())
        .map_err(|err| err.to_string())?;
    match parsed.value {
        Some(value) => Ok(convert(value)),
        None => Err(String::from("file is empty")),
    }
}

fn convert(value: jsonc::Value<'_>) -> Node {
    match value {
        jsonc::Value::StringLit(lit) => Node::String(StringNode {
            span: span_of(&lit),
            value: lit.value.into_owned(),
        }),
        jsonc::Value::NumberLit(lit) => Node::Number(NumberNode {
            span: span_of(&lit),
            text: lit.value.to_string(),
        }),
        jsonc::Value::BooleanLit(lit) => Node::Bool(BoolNode {
            span: span_of(&lit),
            value: lit.value,
        }),
        jsonc::Value::NullKeyword(keyword) => Node::Null(span_of(&keyword)),
        jsonc::Value::Array(array) => {
            let span = span_of(&array);
            Node::Array(ArrayNode {
                span,
                elements: array.elements.into_iter().map(convert).collect(),
            })
        }
        jsonc::Value::Object(object) => {
            let span = span_of(&object);
            Node::Object(ObjectNode {
                span,
                entries: object.properties.into_iter().map(convert_prop).collect(),
            })
        }
    }
}

fn convert_prop(prop: jsonc::ObjectProp<'_>) -> Entry {
    let key = match prop.name {
        jsonc::ObjectPropName::String(lit) => StringNode {
            span: span_of(&lit),
            value: lit.value.into_owned(),
        },
        jsonc::ObjectPropName::Word(word) => StringNode {
            span: span_of(&word),
            value: word.value.to_string(),
        },
    };
    Entry {
        key,
        value: convert(prop.value),
    }
}

fn span_of(ranged: &impl Ranged) -> Span {
    let range = ranged.range();
    Span::new(range.start, range.end)
}
