//! Reduces a path cell's markup to a single path string.

use crate::markup::{MAX_DEPTH, MarkupNode, Template};

/// Result of flattening a path cell.
///
/// `regular` is false when some construct had no plain-text reading and the
/// text is only an approximation of what the wiki displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flattened {
    pub text: String,
    pub regular: bool,
}

pub fn flatten(nodes: &[MarkupNode]) -> Flattened {
    let (text, regular) = flatten_at(nodes, 0);
    Flattened {
        text: text.trim().to_string(),
        regular,
    }
}

fn flatten_at(nodes: &[MarkupNode], depth: usize) -> (String, bool) {
    if depth > MAX_DEPTH {
        return (String::new(), false);
    }

    let mut out = String::new();
    let mut regular = true;

    for node in nodes {
        match node {
            MarkupNode::Text(text) => out.push_str(text),
            MarkupNode::CodeBlock { .. } => out.push('*'),
            MarkupNode::Comment(_) => {}
            MarkupNode::Template(template) => {
                let (text, template_regular) = flatten_template(template, depth);
                out.push_str(&text);
                regular &= template_regular;
            }
            MarkupNode::Tag { content, .. } => {
                let (inner, inner_regular) = flatten_at(content, depth + 1);
                regular &= inner_regular;
                let inner = inner.trim();
                if inner.contains(['/', '\\']) {
                    out.push_str("*/");
                    out.push_str(inner);
                } else if !inner.is_empty() {
                    out.push('*');
                }
            }
            MarkupNode::Link { .. } => regular = false,
        }
    }

    (out, regular)
}

fn flatten_template(template: &Template, depth: usize) -> (String, bool) {
    let first = template.positional().first().copied().unwrap_or_default();
    match template.key().as_str() {
        "p" | "path" => {
            let (inner, regular) = flatten_at(first, depth + 1);
            (format!("{{{{p|{}}}}}", inner.trim()), regular)
        }
        "code" | "file" => ("*".to_string(), true),
        "localizedpath" => flatten_at(first, depth + 1),
        _ => (String::new(), true),
    }
}

#[cfg(test)]
mod tests {
    use super::{Flattened, flatten};
    use crate::markup::parse_wikitext;

    fn flat(raw: &str) -> Flattened {
        flatten(&parse_wikitext(raw))
    }

    #[test]
    fn text_and_path_templates_are_kept() {
        assert_eq!(
            flat(" {{P| Game }}\\saves "),
            Flattened {
                text: "{{p|Game}}\\saves".to_string(),
                regular: true,
            }
        );
        assert_eq!(flat("{{path|hkcu}}\\Software").text, "{{p|hkcu}}\\Software");
    }

    #[test]
    fn variable_parts_become_wildcards() {
        assert_eq!(flat("{{p|game}}/<code>slot</code>.sav").text, "{{p|game}}/*.sav");
        assert_eq!(flat("{{p|game}}/{{code|[[x]]}}.sav"), Flattened {
            text: "{{p|game}}/*.sav".to_string(),
            regular: true,
        });
        assert_eq!(flat("{{p|game}}/{{file|name}}").text, "{{p|game}}/*");
    }

    #[test]
    fn localized_path_contributes_its_first_parameter() {
        assert_eq!(
            flat("{{p|game}}/{{LocalizedPath|Saves|Spielstände}}").text,
            "{{p|game}}/Saves"
        );
    }

    #[test]
    fn unrelated_templates_and_comments_vanish() {
        assert_eq!(
            flat("{{p|game}}/saves{{note|see talk}}<!--x-->"),
            Flattened {
                text: "{{p|game}}/saves".to_string(),
                regular: true,
            }
        );
    }

    #[test]
    fn tags_collapse_to_wildcards() {
        assert_eq!(flat("{{p|game}}/saves<sup>1</sup>").text, "{{p|game}}/saves*");
        assert_eq!(flat("<span>{{p|game}}/saves</span>").text, "*/{{p|game}}/saves");
        assert_eq!(flat("{{p|game}}<br/>").text, "{{p|game}}");
    }

    #[test]
    fn links_make_the_result_irregular() {
        let result = flat("{{p|game}}/[[Profile]]/saves");
        assert_eq!(result.text, "{{p|game}}//saves");
        assert!(!result.regular);
        assert!(!flat("{{p|[[Link]]}}").regular);
    }
}
