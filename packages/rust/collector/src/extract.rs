//! HTML → plain document text.
//!
//! Uses readability heuristics to find the main content area, strips page
//! chrome, and converts what remains to Markdown-flavoured text via `htmd`.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};

use intelhub_shared::{IntelHubError, Result};

/// Extract the main content HTML of a full page.
///
/// Tries `<main>`, `<article>`, `[role=main]`, `.content`, then falls back to
/// `<body>`. Navigation, headers, footers and scripts are stripped.
pub(crate) fn main_content_html(doc: &Html) -> String {
    let selectors = ["main", "article", r#"[role="main"]"#, ".content", "body"];

    for sel_str in selectors {
        let Ok(sel) = Selector::parse(sel_str) else {
            continue;
        };
        if let Some(el) = doc.select(&sel).next() {
            return strip_chrome(&el.inner_html());
        }
    }
    String::new()
}

/// Page title: first `<h1>`, else `<title>`.
pub(crate) fn page_title(doc: &Html) -> Option<String> {
    for sel_str in ["h1", "title"] {
        let Ok(sel) = Selector::parse(sel_str) else {
            continue;
        };
        let title = doc
            .select(&sel)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty());
        if title.is_some() {
            return title;
        }
    }
    None
}

/// Strip common navigation/chrome elements from HTML content.
fn strip_chrome(html: &str) -> String {
    let doc = Html::parse_fragment(html);
    let Ok(chrome_sel) =
        Selector::parse("nav, header, footer, aside, script, style, .sidebar, .nav, .ad")
    else {
        return html.to_string();
    };

    let mut result = html.to_string();
    for el in doc.select(&chrome_sel) {
        let outer = el.html();
        result = result.replace(&outer, "");
    }
    result
}

/// Convert an HTML fragment to text suitable for analysis.
pub(crate) fn html_to_text(html: &str) -> Result<String> {
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(vec!["script", "style", "nav", "iframe", "noscript", "svg", "img"])
        .build();

    let text = converter
        .convert(html)
        .map_err(|e| IntelHubError::Conversion(format!("htmd conversion failed: {e}")))?;

    Ok(MULTI_BLANK_RE.replace_all(text.trim(), "\n\n").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head><title>Fallback Title</title>
        <script>window.analytics = 1;</script></head>
        <body>
            <nav><a href="/">Home</a></nav>
            <article>
                <h1>Port Strike Enters Second Week</h1>
                <p>Dock workers in the northern harbour continued their strike.</p>
                <aside>Related: subscribe now</aside>
            </article>
            <footer>Copyright 2025</footer>
        </body></html>"#;

    #[test]
    fn extracts_article_without_chrome() {
        let doc = Html::parse_document(PAGE);
        let html = main_content_html(&doc);
        assert!(html.contains("Dock workers"));
        assert!(!html.contains("subscribe now"));
        assert!(!html.contains("Copyright"));
    }

    #[test]
    fn title_prefers_h1() {
        let doc = Html::parse_document(PAGE);
        assert_eq!(page_title(&doc).as_deref(), Some("Port Strike Enters Second Week"));

        let bare = Html::parse_document("<html><head><title> Only Title </title></head><body></body></html>");
        assert_eq!(page_title(&bare).as_deref(), Some("Only Title"));
    }

    #[test]
    fn converts_html_to_text() {
        let text = html_to_text("<p>First</p>\n\n\n\n<p>Second <strong>bold</strong></p>").unwrap();
        assert!(text.contains("First"));
        assert!(text.contains("**bold**"));
        assert!(!text.contains("<p>"));
        assert!(!text.contains("\n\n\n"));
    }
}
