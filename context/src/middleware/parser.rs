use std::any::Any;

use errors::{Error, Result};
use scraper::{Html, Selector};

use common::interface::Middleware;

/// Functional middleware: no request or response hooks, just HTML parsing
/// helpers that handlers reach through the context by name:
///
/// ```ignore
/// let parser: &ParserMiddleware = ctx.middleware("parser").unwrap();
/// let titles = parser.select_text(&body, "h2.title")?;
/// ```
pub struct ParserMiddleware;

impl ParserMiddleware {
    pub fn new() -> Self {
        ParserMiddleware
    }

    fn selector(selector: &str) -> Result<Selector> {
        Selector::parse(selector)
            .map_err(|e| Error::validation(format!("invalid selector '{selector}': {e}")))
    }

    /// Text content of every element matching the selector.
    pub fn select_text(&self, html: &str, selector: &str) -> Result<Vec<String>> {
        let selector = Self::selector(selector)?;
        let document = Html::parse_document(html);
        Ok(document
            .select(&selector)
            .map(|element| element.text().collect::<Vec<_>>().join("").trim().to_string())
            .collect())
    }

    /// Values of `attr` on every element matching the selector.
    pub fn select_attr(&self, html: &str, selector: &str, attr: &str) -> Result<Vec<String>> {
        let selector = Self::selector(selector)?;
        let document = Html::parse_document(html);
        Ok(document
            .select(&selector)
            .filter_map(|element| element.value().attr(attr).map(|v| v.to_string()))
            .collect())
    }

    /// All link targets in the document.
    pub fn links(&self, html: &str) -> Vec<String> {
        self.select_attr(html, "a[href]", "href").unwrap_or_default()
    }
}

impl Default for ParserMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl Middleware for ParserMiddleware {
    fn name(&self) -> String {
        "parser".into()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HTML: &str = r#"
        <html><body>
            <h2 class="title">First</h2>
            <h2 class="title">Second</h2>
            <a href="/one">one</a>
            <a href="https://example.com/two">two</a>
        </body></html>
    "#;

    #[test]
    fn test_select_text() {
        let parser = ParserMiddleware::new();
        let titles = parser.select_text(HTML, "h2.title").unwrap();
        assert_eq!(titles, vec!["First", "Second"]);
    }

    #[test]
    fn test_select_attr_and_links() {
        let parser = ParserMiddleware::new();
        let links = parser.links(HTML);
        assert_eq!(links, vec!["/one", "https://example.com/two"]);
    }

    #[test]
    fn test_invalid_selector() {
        let parser = ParserMiddleware::new();
        assert!(parser.select_text(HTML, "???").is_err());
    }
}
