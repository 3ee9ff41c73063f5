//! Page fetching and HTML-to-text extraction.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use super::RetrievalError;

/// Largest page body read from the network.
const MAX_PAGE_BYTES: usize = 2 * 1024 * 1024;

pub const DEFAULT_MAX_DOCUMENT_CHARS: usize = 4000;

#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    /// Readable text of the page at `url`.
    async fn fetch(&self, url: &str) -> Result<String, RetrievalError>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    max_document_chars: usize,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_document_chars: usize) -> Result<Self, RetrievalError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("crossprompt/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            max_document_chars: max_document_chars.max(1),
        })
    }
}

#[async_trait]
impl DocumentFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<String, RetrievalError> {
        let mut response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RetrievalError::Fetch {
                url: url.to_string(),
                reason: format!("HTTP {}", status.as_u16()),
            });
        }

        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(true, |ct| ct.contains("html"));

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let room = MAX_PAGE_BYTES.saturating_sub(bytes.len());
            if room == 0 {
                break;
            }
            bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
        }

        let raw = String::from_utf8_lossy(&bytes);
        let text = if is_html {
            html_to_text(&raw)
        } else {
            collapse_whitespace(&raw)
        };
        Ok(truncate_chars(&text, self.max_document_chars))
    }
}

static DROPPED_BLOCKS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(script|style|noscript|svg|head)\b[^>]*>.*?</(script|style|noscript|svg|head)\s*>")
        .unwrap()
});
static COMMENTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static BLOCK_BREAKS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)</?(p|div|br|li|ul|ol|h[1-6]|tr|table|section|article|header|footer|blockquote|pre)\b[^>]*>")
        .unwrap()
});
static TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]+>").unwrap());
static NUMERIC_ENTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&#(?:x([0-9a-fA-F]+)|([0-9]+));").unwrap());
static SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\u{a0}]+").unwrap());

/// Strip markup down to readable text, one block per line.
pub fn html_to_text(html: &str) -> String {
    let text = DROPPED_BLOCKS.replace_all(html, " ");
    let text = COMMENTS.replace_all(&text, " ");
    let text = BLOCK_BREAKS.replace_all(&text, "\n");
    let text = TAGS.replace_all(&text, " ");
    collapse_whitespace(&decode_entities(&text))
}

fn decode_entities(text: &str) -> String {
    let text = NUMERIC_ENTITY.replace_all(text, |caps: &regex::Captures<'_>| {
        let code = match (caps.get(1), caps.get(2)) {
            (Some(hex), _) => u32::from_str_radix(hex.as_str(), 16).ok(),
            (None, Some(dec)) => dec.as_str().parse::<u32>().ok(),
            _ => None,
        };
        code.and_then(char::from_u32)
            .map(|c| c.to_string())
            .unwrap_or_default()
    });
    // &amp; last so "&amp;lt;" stays "&lt;"
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn collapse_whitespace(text: &str) -> String {
    text.lines()
        .map(|line| SPACES.replace_all(line, " ").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_scripts_tags_and_entities() {
        let html = r#"<html><head><title>T</title><style>p{}</style></head>
            <body><script>alert(1)</script><h1>Rust &amp; Tokio</h1>
            <p>Async&nbsp;runtime <b>docs</b></p><!-- hidden --><p>caf&#233; &#x41;</p></body></html>"#;
        assert_eq!(html_to_text(html), "Rust & Tokio\nAsync runtime docs\ncafé A");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("ação", 2), "aç");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn plain_text_is_whitespace_normalized() {
        assert_eq!(collapse_whitespace("  a \t b \n\n  c  "), "a b\nc");
    }
}
