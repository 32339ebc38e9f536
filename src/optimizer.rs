//! Post-render HTML optimizer.
//!
//! A pure transformation that strips nodes and attributes with no SEO value
//! from a rendered snapshot while preserving structured data, meta tags and
//! the minimal icon/manifest set. Operates on a parsed node tree; only the
//! final whitespace collapse is string work. Any failure inside the
//! transform returns the input unchanged.

use crate::config::OptimizerOptions;
use ego_tree::NodeId;
use regex::Regex;
use scraper::{Html, Node};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::LazyLock;
use tracing::warn;

static MULTI_SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" {2,}").unwrap());

/// `<link rel>` values that never survive optimization.
const REMOVED_LINK_RELS: &[&str] = &[
    "preload",
    "prefetch",
    "dns-prefetch",
    "modulepreload",
    "preconnect",
    "stylesheet",
    "mask-icon",
];

/// Tags exempt from empty-element removal inside `<body>`.
const EMPTY_KEEP_TAGS: &[&str] = &[
    "script", "style", "meta", "link", "img", "br", "hr", "input", "source", "track", "area",
    "col", "embed", "param", "wbr",
];

/// Optimize a rendered snapshot. Returns the input unchanged if the
/// transform fails for any reason.
pub fn optimize(html: &str, options: &OptimizerOptions) -> String {
    match catch_unwind(AssertUnwindSafe(|| transform(html, options))) {
        Ok(out) => out,
        Err(_) => {
            warn!("html optimization failed, returning original document");
            html.to_string()
        }
    }
}

fn transform(html: &str, options: &OptimizerOptions) -> String {
    let mut doc = Html::parse_document(html);

    remove_scripts(&mut doc);
    prune_links(&mut doc, options);
    remove_meta_noise(&mut doc);
    remove_comments_and_noscript(&mut doc);
    remove_hidden_elements(&mut doc);
    strip_attributes(&mut doc, options);
    remove_empty_body_elements(&mut doc);
    collapse_text_nodes(&mut doc);

    collapse_document(&serialize(&doc))
}

fn serialize(doc: &Html) -> String {
    let has_doctype = doc
        .tree
        .root()
        .children()
        .any(|n| matches!(n.value(), Node::Doctype(_)));
    let markup = doc.root_element().html();
    if has_doctype {
        format!("<!DOCTYPE html>{markup}")
    } else {
        markup
    }
}

fn detach_all(doc: &mut Html, ids: Vec<NodeId>) {
    for id in ids {
        if let Some(mut node) = doc.tree.get_mut(id) {
            node.detach();
        }
    }
}

fn element_ids(doc: &Html) -> Vec<NodeId> {
    doc.tree
        .root()
        .descendants()
        .filter(|n| n.value().is_element())
        .map(|n| n.id())
        .collect()
}

/// Scripts are removed except JSON-LD structured data.
fn remove_scripts(doc: &mut Html) {
    let doomed: Vec<NodeId> = doc
        .tree
        .root()
        .descendants()
        .filter(|n| {
            n.value().as_element().is_some_and(|el| {
                el.name() == "script"
                    && !el
                        .attr("type")
                        .is_some_and(|t| t.trim().eq_ignore_ascii_case("application/ld+json"))
            })
        })
        .map(|n| n.id())
        .collect();
    detach_all(doc, doomed);
}

/// Resource-hint and stylesheet links go away entirely; manifest and icon
/// links are reduced to a single survivor each. For apple-touch-icon the
/// 180x180 variant wins when present.
fn prune_links(doc: &mut Html, options: &OptimizerOptions) {
    let mut doomed = Vec::new();
    let mut manifest_seen = false;
    let mut icon_seen = false;
    let mut apple_icons: Vec<(NodeId, bool)> = Vec::new();

    for node in doc.tree.root().descendants() {
        let Some(el) = node.value().as_element() else {
            continue;
        };
        if el.name() == "style" {
            if options.remove_inline_styles {
                doomed.push(node.id());
            }
            continue;
        }
        if el.name() != "link" {
            continue;
        }
        let rel = el
            .attr("rel")
            .map(|r| r.trim().to_ascii_lowercase())
            .unwrap_or_default();
        if REMOVED_LINK_RELS.contains(&rel.as_str()) {
            doomed.push(node.id());
        } else if rel == "manifest" {
            if manifest_seen {
                doomed.push(node.id());
            }
            manifest_seen = true;
        } else if rel == "icon" {
            if icon_seen {
                doomed.push(node.id());
            }
            icon_seen = true;
        } else if rel == "apple-touch-icon" {
            let preferred = el.attr("sizes").is_some_and(|s| s.contains("180x180"));
            apple_icons.push((node.id(), preferred));
        }
    }

    if apple_icons.len() > 1 {
        let keep = apple_icons
            .iter()
            .position(|(_, preferred)| *preferred)
            .unwrap_or(0);
        for (i, (id, _)) in apple_icons.iter().enumerate() {
            if i != keep {
                doomed.push(*id);
            }
        }
    }

    detach_all(doc, doomed);
}

fn remove_meta_noise(doc: &mut Html) {
    let doomed: Vec<NodeId> = doc
        .tree
        .root()
        .descendants()
        .filter(|n| {
            n.value().as_element().is_some_and(|el| {
                el.name() == "meta"
                    && el.attr("name").is_some_and(|name| {
                        let name = name.trim().to_ascii_lowercase();
                        name.starts_with("msapplication-") || name == "next-head-count"
                    })
            })
        })
        .map(|n| n.id())
        .collect();
    detach_all(doc, doomed);
}

fn remove_comments_and_noscript(doc: &mut Html) {
    let doomed: Vec<NodeId> = doc
        .tree
        .root()
        .descendants()
        .filter(|n| match n.value() {
            Node::Comment(_) => true,
            Node::Element(el) => el.name() == "noscript",
            _ => false,
        })
        .map(|n| n.id())
        .collect();
    detach_all(doc, doomed);
}

/// Elements invisible to a crawler carry no content worth indexing.
fn remove_hidden_elements(doc: &mut Html) {
    let doomed: Vec<NodeId> = doc
        .tree
        .root()
        .descendants()
        .filter(|n| {
            n.value().as_element().is_some_and(|el| {
                el.attr("hidden").is_some()
                    || el.attr("style").is_some_and(|style| {
                        style.contains("display:none")
                            || style.contains("display: none")
                            || style.contains("visibility:hidden")
                    })
            })
        })
        .map(|n| n.id())
        .collect();
    detach_all(doc, doomed);
}

fn strip_attributes(doc: &mut Html, options: &OptimizerOptions) {
    let ids = element_ids(doc);
    for id in ids {
        let Some(mut node) = doc.tree.get_mut(id) else {
            continue;
        };
        if let Node::Element(el) = node.value() {
            let is_meta = &*el.name.local == "meta";
            el.attrs.retain(|name, _| {
                let name = &*name.local;
                if name == "data-testid" {
                    return false;
                }
                if options.remove_data_attributes && !is_meta && name.starts_with("data-") {
                    return false;
                }
                if options.remove_aria_attributes && name.starts_with("aria-") {
                    return false;
                }
                if name.starts_with("on") {
                    return false;
                }
                if options.remove_style_attributes && name == "style" {
                    return false;
                }
                true
            });
        }
    }
}

/// Remove attribute-less, childless, textless elements under `<body>`.
/// Processed children-first so a wrapper emptied by the removal of its
/// children is itself removed in the same pass.
fn remove_empty_body_elements(doc: &mut Html) {
    let Some(body) = doc
        .tree
        .root()
        .descendants()
        .find(|n| n.value().as_element().is_some_and(|el| el.name() == "body"))
    else {
        return;
    };
    let candidates: Vec<NodeId> = body
        .descendants()
        .skip(1)
        .filter(|n| n.value().is_element())
        .map(|n| n.id())
        .collect();

    for id in candidates.into_iter().rev() {
        let Some(node) = doc.tree.get(id) else {
            continue;
        };
        let Some(el) = node.value().as_element() else {
            continue;
        };
        if EMPTY_KEEP_TAGS.contains(&el.name()) {
            continue;
        }
        if !el.attrs.is_empty() {
            continue;
        }
        if node.children().any(|c| c.value().is_element()) {
            continue;
        }
        let has_text = node
            .descendants()
            .filter_map(|n| n.value().as_text())
            .any(|t| !t.trim().is_empty());
        if has_text {
            continue;
        }
        if let Some(mut node) = doc.tree.get_mut(id) {
            node.detach();
        }
    }
}

fn collapse_text_nodes(doc: &mut Html) {
    let text_ids: Vec<NodeId> = doc
        .tree
        .root()
        .descendants()
        .filter(|n| n.value().as_text().is_some())
        .map(|n| n.id())
        .collect();

    for id in text_ids {
        let Some(mut node) = doc.tree.get_mut(id) else {
            continue;
        };
        let collapsed = if let Node::Text(text) = node.value() {
            let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
            if collapsed.is_empty() {
                None
            } else {
                text.text = collapsed.into();
                Some(())
            }
        } else {
            continue;
        };
        if collapsed.is_none() {
            node.detach();
        }
    }
}

/// Final string pass over the serialized document.
fn collapse_document(html: &str) -> String {
    let html = html.replace("> <", "><");
    let lines: Vec<String> = html
        .lines()
        .map(|line| MULTI_SPACE.replace_all(line.trim(), " ").into_owned())
        .collect();
    lines.join("\n")
}
