//! HTML parsing primitive exposed to extensions.
//!
//! Pure function of its input: no network, no resource loading.

use std::collections::BTreeMap;

use scraper::{ElementRef, Html, Selector};
use serde::Serialize;

use super::error::{ExtensionError, ExtensionResult};

/// A matched element, flattened for transport into the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HtmlElement {
    pub tag: String,
    pub text: String,
    /// Inner HTML.
    pub html: String,
    pub outer_html: String,
    pub attributes: BTreeMap<String, String>,
}

impl HtmlElement {
    fn from_ref(element: ElementRef<'_>) -> Self {
        Self {
            tag: element.value().name().to_string(),
            text: element.text().collect::<String>().trim().to_string(),
            html: element.inner_html(),
            outer_html: element.html(),
            attributes: element
                .value()
                .attrs()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

fn parse_selector(selector: &str) -> ExtensionResult<Selector> {
    Selector::parse(selector)
        .map_err(|e| ExtensionError::JavaScript(format!("Invalid selector '{}': {}", selector, e)))
}

/// Select every element matching a CSS selector.
pub fn select(html: &str, selector: &str) -> ExtensionResult<Vec<HtmlElement>> {
    let selector = parse_selector(selector)?;
    let document = Html::parse_document(html);
    Ok(document.select(&selector).map(HtmlElement::from_ref).collect())
}

/// Select the first element matching a CSS selector.
pub fn select_first(html: &str, selector: &str) -> ExtensionResult<Option<HtmlElement>> {
    let selector = parse_selector(selector)?;
    let document = Html::parse_document(html);
    Ok(document.select(&selector).next().map(HtmlElement::from_ref))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
          <div class="manga" data-id="1"><a href="/m/1">One <b>Piece</b></a></div>
          <div class="manga" data-id="2"><a href="/m/2">Two</a></div>
          <img src="https://cdn.demo.test/cover.jpg">
        </body></html>
    "#;

    #[test]
    fn test_select_all() {
        let items = select(PAGE, "div.manga").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].attributes.get("data-id").map(String::as_str), Some("1"));
        assert_eq!(items[0].text, "One Piece");
        assert!(items[0].html.contains("<b>Piece</b>"));
        assert!(items[1].outer_html.starts_with("<div"));
    }

    #[test]
    fn test_select_first() {
        let img = select_first(PAGE, "img").unwrap().unwrap();
        assert_eq!(img.tag, "img");
        assert_eq!(
            img.attributes.get("src").map(String::as_str),
            Some("https://cdn.demo.test/cover.jpg")
        );
        assert!(select_first(PAGE, "table").unwrap().is_none());
    }

    #[test]
    fn test_invalid_selector() {
        assert!(matches!(
            select(PAGE, "div[["),
            Err(ExtensionError::JavaScript(_))
        ));
    }
}
