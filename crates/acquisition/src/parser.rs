use scraper::{ElementRef, Html, Node, Selector};

use crate::{AcquisitionError, Result};

const SKIPPED_TAGS: &[&str] = &["script", "style", "noscript", "template"];

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "br", "li", "ul", "ol", "h1", "h2", "h3", "h4", "h5", "h6", "tr", "td", "th", "table",
    "section", "article", "header", "footer", "blockquote", "pre",
];

// scraper::Html is not Send, so build and drop it between awaits
pub struct PageDocument {
    html: Html,
}

impl PageDocument {
    pub fn parse(markup: &str) -> Self {
        Self {
            html: Html::parse_document(markup),
        }
    }

    pub fn select_text(&self, selector: &str) -> Result<Vec<String>> {
        let selector = parse_selector(selector)?;

        Ok(self.html
            .select(&selector)
            .map(|el| visible_text(&el))
            .collect())
    }

    // Keeps script bodies, for embedded JSON payloads
    pub fn select_raw(&self, selector: &str) -> Result<Vec<String>> {
        let selector = parse_selector(selector)?;

        Ok(self.html
            .select(&selector)
            .map(|el| el.text().collect::<String>())
            .collect())
    }

    pub fn text(&self) -> String {
        visible_text(&self.html.root_element())
    }

    pub fn title(&self) -> Option<String> {
        self.select_text("title")
            .ok()?
            .into_iter()
            .map(|t| t.trim().to_string())
            .find(|t| !t.is_empty())
    }
}

pub fn parse_selector(selector: &str) -> Result<Selector> {
    Selector::parse(selector)
        .map_err(|e| AcquisitionError::ParseError(format!("Invalid selector {}: {:?}", selector, e)))
}

pub fn visible_text(element: &ElementRef) -> String {
    let mut raw = String::new();
    collect_text(element, &mut raw);
    normalize_whitespace(&raw)
}

fn collect_text(element: &ElementRef, output: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => {
                output.push_str(text);
            }
            Node::Element(el) => {
                let name = el.name();
                if SKIPPED_TAGS.contains(&name) {
                    continue;
                }
                if let Some(elem) = ElementRef::wrap(child) {
                    let block = BLOCK_TAGS.contains(&name);
                    if block {
                        output.push('\n');
                    }
                    collect_text(&elem, output);
                    if block {
                        output.push('\n');
                    }
                }
            }
            _ => {}
        }
    }
}

// Titles arrive with <em> highlight markup
pub fn fragment_text(markup: &str) -> String {
    if !markup.contains('<') {
        return normalize_whitespace(markup);
    }
    let fragment = Html::parse_fragment(markup);
    visible_text(&fragment.root_element())
}

pub fn normalize_whitespace(text: &str) -> String {
    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
