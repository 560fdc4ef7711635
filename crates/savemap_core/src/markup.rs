//! Minimal wikitext scanner.
//!
//! Only the constructs that show up inside game data templates are
//! recognised: templates, code blocks, comments, HTML-like tags and internal
//! links. Anything that does not terminate degrades to plain text.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

/// Nesting limit for templates and tags; deeper markup is kept as text.
pub const MAX_DEPTH: usize = 32;

const CODE_TAGS: &[&str] = &["code", "pre"];
const VOID_TAGS: &[&str] = &["br", "hr", "wbr", "img"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkupNode {
    Text(String),
    Template(Template),
    CodeBlock {
        tag: String,
        attributes: String,
        content: String,
    },
    Comment(String),
    Tag {
        name: String,
        attributes: String,
        content: Vec<MarkupNode>,
        form: TagForm,
    },
    Link {
        target: String,
        label: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagForm {
    Paired,
    SelfClosing,
    /// No closing tag before the end of the enclosing parameter or document.
    Unclosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    /// Name as written, including surrounding whitespace.
    pub name: String,
    pub params: Vec<TemplateParam>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateParam {
    pub name: Option<String>,
    pub value: Vec<MarkupNode>,
}

impl Template {
    pub fn key(&self) -> String {
        template_key(&self.name)
    }

    pub fn is(&self, name: &str) -> bool {
        self.key() == template_key(name)
    }

    pub fn positional(&self) -> Vec<&[MarkupNode]> {
        self.params
            .iter()
            .filter(|param| param.name.is_none())
            .map(|param| param.value.as_slice())
            .collect()
    }

    pub fn named(&self, key: &str) -> Option<&[MarkupNode]> {
        let wanted = template_key(key);
        self.params
            .iter()
            .rev()
            .find(|param| {
                param
                    .name
                    .as_deref()
                    .is_some_and(|name| template_key(name) == wanted)
            })
            .map(|param| param.value.as_slice())
    }
}

impl TemplateParam {
    fn from_nodes(mut nodes: Vec<MarkupNode>) -> Self {
        if let Some(MarkupNode::Text(first)) = nodes.first()
            && let Some((name, rest)) = first.split_once('=')
            && !name.trim().is_empty()
        {
            let name = name.trim().to_string();
            let rest = rest.to_string();
            if rest.is_empty() {
                nodes.remove(0);
            } else {
                nodes[0] = MarkupNode::Text(rest);
            }
            return Self {
                name: Some(name),
                value: nodes,
            };
        }
        Self {
            name: None,
            value: nodes,
        }
    }
}

/// Case-insensitive template name with underscores read as spaces.
pub fn template_key(name: &str) -> String {
    name.replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

static HTML_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("valid regex"));
static REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<ref(?:\s[^>]*)?>.*?</ref\s*>").expect("valid regex"));
static REFERENCE_SHORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<ref(?:\s[^>]*)?/>").expect("valid regex"));

/// Removes comments and citations, which annotate paths but are never part of them.
pub fn strip_annotations(raw: &str) -> String {
    let mut out = raw.to_string();
    for pattern in [&HTML_COMMENT, &REFERENCE, &REFERENCE_SHORT] {
        out = pattern.replace_all(&out, "").into_owned();
    }
    out
}

pub fn parse_wikitext(raw: &str) -> Vec<MarkupNode> {
    let mut parser = Parser {
        src: raw,
        pos: 0,
        failed_templates: HashSet::new(),
    };
    let (nodes, _) = parser.parse_nodes(&Context::top());
    nodes
}

pub fn render_wikitext(nodes: &[MarkupNode]) -> String {
    let mut out = String::new();
    render_into(&mut out, nodes);
    out
}

/// Every template in document order, including ones nested in parameters and tags.
pub fn templates(nodes: &[MarkupNode]) -> Vec<&Template> {
    let mut out = Vec::new();
    collect_templates(nodes, &mut out);
    out
}

fn collect_templates<'a>(nodes: &'a [MarkupNode], out: &mut Vec<&'a Template>) {
    for node in nodes {
        match node {
            MarkupNode::Template(template) => {
                out.push(template);
                for param in &template.params {
                    collect_templates(&param.value, out);
                }
            }
            MarkupNode::Tag { content, .. } => collect_templates(content, out),
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Eof,
    Pipe,
    CloseBraces,
    CloseTag,
}

#[derive(Debug, Clone)]
struct Context {
    in_template: bool,
    close_tag: Option<String>,
    depth: usize,
}

impl Context {
    fn top() -> Self {
        Self {
            in_template: false,
            close_tag: None,
            depth: 0,
        }
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    failed_templates: HashSet<usize>,
}

impl Parser<'_> {
    fn rest(&self) -> &str {
        &self.src[self.pos..]
    }

    fn parse_nodes(&mut self, context: &Context) -> (Vec<MarkupNode>, Stop) {
        let mut nodes = Vec::new();
        let mut text = String::new();

        let stop = loop {
            let rest = self.rest();
            if rest.is_empty() {
                break Stop::Eof;
            }
            if context.in_template {
                if rest.starts_with("}}") {
                    break Stop::CloseBraces;
                }
                if rest.starts_with('|') {
                    break Stop::Pipe;
                }
            }
            if let Some(tag) = context.close_tag.as_deref()
                && closing_tag_len(rest, tag).is_some()
            {
                break Stop::CloseTag;
            }

            let node = if rest.starts_with("{{") && context.depth < MAX_DEPTH {
                self.parse_template(context.depth + 1)
            } else if rest.starts_with("<!--") {
                self.parse_comment()
            } else if rest.starts_with("[[") {
                self.parse_link()
            } else if rest.starts_with('<') && context.depth < MAX_DEPTH {
                self.parse_tag(context)
            } else {
                None
            };

            match node {
                Some(node) => {
                    flush_text(&mut text, &mut nodes);
                    nodes.push(node);
                }
                None => {
                    let Some(ch) = self.rest().chars().next() else {
                        break Stop::Eof;
                    };
                    text.push(ch);
                    self.pos += ch.len_utf8();
                }
            }
        };

        flush_text(&mut text, &mut nodes);
        (nodes, stop)
    }

    fn parse_template(&mut self, depth: usize) -> Option<MarkupNode> {
        let start = self.pos;
        if self.failed_templates.contains(&start) {
            return None;
        }

        let after_open = &self.src[start + 2..];
        let name_end = after_open.find(['|', '}']);
        let name = match name_end {
            Some(end) if !after_open[..end].contains('{') && !after_open[..end].contains('<') => {
                after_open[..end].to_string()
            }
            _ => {
                self.failed_templates.insert(start);
                return None;
            }
        };
        self.pos = start + 2 + name.len();

        let mut params = Vec::new();
        loop {
            let rest = self.rest();
            if rest.starts_with("}}") {
                self.pos += 2;
                return Some(MarkupNode::Template(Template { name, params }));
            }
            if !rest.starts_with('|') {
                break;
            }
            self.pos += 1;
            let context = Context {
                in_template: true,
                close_tag: None,
                depth,
            };
            let (nodes, stop) = self.parse_nodes(&context);
            match stop {
                Stop::Pipe | Stop::CloseBraces => params.push(TemplateParam::from_nodes(nodes)),
                Stop::Eof | Stop::CloseTag => break,
            }
        }

        self.failed_templates.insert(start);
        self.pos = start;
        None
    }

    fn parse_comment(&mut self) -> Option<MarkupNode> {
        let rest = self.rest();
        let end = rest[4..].find("-->")?;
        let content = rest[4..4 + end].to_string();
        self.pos += 4 + end + 3;
        Some(MarkupNode::Comment(content))
    }

    fn parse_link(&mut self) -> Option<MarkupNode> {
        let rest = self.rest();
        let end = rest[2..].find("]]")?;
        let inner = &rest[2..2 + end];
        let (target, label) = match inner.split_once('|') {
            Some((target, label)) => (target.to_string(), Some(label.to_string())),
            None => (inner.to_string(), None),
        };
        self.pos += 2 + end + 2;
        Some(MarkupNode::Link { target, label })
    }

    fn parse_tag(&mut self, context: &Context) -> Option<MarkupNode> {
        let rest = self.rest();
        let name_len = rest[1..]
            .char_indices()
            .find(|(_, ch)| !ch.is_ascii_alphanumeric())
            .map(|(index, _)| index)
            .unwrap_or(rest.len() - 1);
        let name = &rest[1..1 + name_len];
        if !name.starts_with(|ch: char| ch.is_ascii_alphabetic()) {
            return None;
        }
        let after_name = &rest[1 + name_len..];
        if !after_name.starts_with(|ch: char| ch == '>' || ch == '/' || ch.is_whitespace()) {
            return None;
        }
        let close = after_name.find('>')?;
        if after_name[..close].contains('<') {
            return None;
        }

        let name = name.to_string();
        let lower = name.to_ascii_lowercase();
        let raw_attributes = &after_name[..close];
        let self_closing = raw_attributes.ends_with('/') || VOID_TAGS.contains(&lower.as_str());
        let attributes = raw_attributes.trim_end_matches('/').trim().to_string();
        self.pos += 1 + name_len + close + 1;

        if self_closing {
            return Some(MarkupNode::Tag {
                name,
                attributes,
                content: Vec::new(),
                form: TagForm::SelfClosing,
            });
        }

        if CODE_TAGS.contains(&lower.as_str())
            && let Some((content_len, close_len)) = find_closing_tag(self.rest(), &lower)
        {
            let content = self.rest()[..content_len].to_string();
            self.pos += content_len + close_len;
            return Some(MarkupNode::CodeBlock {
                tag: name,
                attributes,
                content,
            });
        }

        let inner = Context {
            in_template: context.in_template,
            close_tag: Some(lower.clone()),
            depth: context.depth + 1,
        };
        let (content, stop) = self.parse_nodes(&inner);
        let form = if stop == Stop::CloseTag {
            if let Some(len) = closing_tag_len(self.rest(), &lower) {
                self.pos += len;
            }
            TagForm::Paired
        } else {
            TagForm::Unclosed
        };

        Some(MarkupNode::Tag {
            name,
            attributes,
            content,
            form,
        })
    }
}

fn flush_text(text: &mut String, nodes: &mut Vec<MarkupNode>) {
    if !text.is_empty() {
        nodes.push(MarkupNode::Text(std::mem::take(text)));
    }
}

/// Length of `</tag>` (case-insensitive, optional trailing whitespace) at the start of `rest`.
fn closing_tag_len(rest: &str, tag: &str) -> Option<usize> {
    let name = rest.strip_prefix("</")?.get(..tag.len())?;
    if !name.eq_ignore_ascii_case(tag) {
        return None;
    }
    let after = &rest[2 + tag.len()..];
    let trimmed = after.trim_start();
    if !trimmed.starts_with('>') {
        return None;
    }
    Some(2 + tag.len() + (after.len() - trimmed.len()) + 1)
}

/// Content length and closing tag length of the first `</tag>` in `rest`.
fn find_closing_tag(rest: &str, tag: &str) -> Option<(usize, usize)> {
    let lowered = rest.to_ascii_lowercase();
    let needle = format!("</{tag}");
    let mut cursor = 0;
    while let Some(offset) = lowered[cursor..].find(&needle) {
        let start = cursor + offset;
        if let Some(len) = closing_tag_len(&rest[start..], tag) {
            return Some((start, len));
        }
        cursor = start + needle.len();
    }
    None
}

fn render_into(out: &mut String, nodes: &[MarkupNode]) {
    for node in nodes {
        match node {
            MarkupNode::Text(text) => out.push_str(text),
            MarkupNode::Template(template) => {
                out.push_str("{{");
                out.push_str(&template.name);
                for param in &template.params {
                    out.push('|');
                    if let Some(name) = &param.name {
                        out.push_str(name);
                        out.push('=');
                    }
                    render_into(out, &param.value);
                }
                out.push_str("}}");
            }
            MarkupNode::CodeBlock {
                tag,
                attributes,
                content,
            } => {
                push_open_tag(out, tag, attributes);
                out.push('>');
                out.push_str(content);
                out.push_str(&format!("</{tag}>"));
            }
            MarkupNode::Comment(content) => {
                out.push_str("<!--");
                out.push_str(content);
                out.push_str("-->");
            }
            MarkupNode::Tag {
                name,
                attributes,
                content,
                form,
            } => {
                push_open_tag(out, name, attributes);
                match form {
                    TagForm::SelfClosing => out.push_str("/>"),
                    TagForm::Paired => {
                        out.push('>');
                        render_into(out, content);
                        out.push_str(&format!("</{name}>"));
                    }
                    TagForm::Unclosed => {
                        out.push('>');
                        render_into(out, content);
                    }
                }
            }
            MarkupNode::Link { target, label } => {
                out.push_str("[[");
                out.push_str(target);
                if let Some(label) = label {
                    out.push('|');
                    out.push_str(label);
                }
                out.push_str("]]");
            }
        }
    }
}

fn push_open_tag(out: &mut String, name: &str, attributes: &str) {
    out.push('<');
    out.push_str(name);
    if !attributes.is_empty() {
        out.push(' ');
        out.push_str(attributes);
    }
}
