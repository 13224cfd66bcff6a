use crate::canonical;
use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashSet;
use tracing::debug;

/// Best-effort excerpt enrichment. An absent excerpt never blocks the
/// pipeline; callers fall back to whatever the feed itself provided.
#[async_trait]
pub trait ExcerptScraper: Send + Sync {
    async fn excerpt(&self, link: &str) -> Option<String>;
}

/// Scraper that never fetches anything.
pub struct NoopScraper;

#[async_trait]
impl ExcerptScraper for NoopScraper {
    async fn excerpt(&self, _link: &str) -> Option<String> {
        None
    }
}

/// Pulls the linked page and extracts the first substantial paragraph.
pub struct HttpExcerptScraper {
    client: Client,
    skip_hosts: HashSet<String>,
}

impl HttpExcerptScraper {
    pub fn new(client: Client, skip_hosts: HashSet<String>) -> Self {
        Self { client, skip_hosts }
    }
}

#[async_trait]
impl ExcerptScraper for HttpExcerptScraper {
    async fn excerpt(&self, link: &str) -> Option<String> {
        let host = canonical::host_of(link);
        if self.skip_hosts.contains(&host) {
            return None;
        }

        let response = match self.client.get(link).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("Excerpt fetch failed for {}: {}", link, e);
                return None;
            }
        };
        if !response.status().is_success() {
            debug!("Excerpt fetch for {} returned {}", link, response.status());
            return None;
        }
        let html = response.text().await.ok()?;
        first_paragraph(&html)
    }
}

const MIN_EXCERPT_CHARS: usize = 40;
const MAX_EXCERPT_CHARS: usize = 500;

/// Case-insensitive ASCII substring search. Byte offsets of matches are
/// always char boundaries because the needle starts with an ASCII byte.
fn find_ci(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    let hay = haystack.as_bytes();
    let ned = needle.as_bytes();
    if ned.is_empty() || from + ned.len() > hay.len() {
        return None;
    }
    (from..=hay.len() - ned.len()).find(|&i| hay[i..i + ned.len()].eq_ignore_ascii_case(ned))
}

/// First paragraph of body text long enough to be a real description,
/// truncated at a word boundary.
pub(crate) fn first_paragraph(html: &str) -> Option<String> {
    let bytes = html.as_bytes();
    let mut cursor = 0;

    while let Some(open) = find_ci(html, "<p", cursor) {
        // "<p>" or "<p ...>", not "<pre>" or "<path>".
        match bytes.get(open + 2) {
            Some(b'>') | Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'\r') => {}
            _ => {
                cursor = open + 2;
                continue;
            }
        }
        let content_start = match html[open..].find('>') {
            Some(offset) => open + offset + 1,
            None => return None,
        };
        let content_end = match find_ci(html, "</p", content_start) {
            Some(end) => end,
            None => return None,
        };

        let text = collapse_whitespace(&strip_tags(&html[content_start..content_end]));
        if text.chars().count() > MIN_EXCERPT_CHARS {
            return Some(truncate_at_word(&text, MAX_EXCERPT_CHARS));
        }
        cursor = content_end + 1;
    }
    None
}

fn strip_tags(fragment: &str) -> String {
    fragment
        .chars()
        .fold((String::new(), false), |(mut text, in_tag), c| match c {
            '<' => (text, true),
            '>' => (text, false),
            _ if !in_tag => {
                text.push(c);
                (text, in_tag)
            }
            _ => (text, in_tag),
        })
        .0
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_at_word(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut = text
        .char_indices()
        .nth(max_chars)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    let head = &text[..cut];
    match head.rfind(' ') {
        Some(space) => format!("{}...", &head[..space]),
        None => format!("{head}..."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_first_substantial_paragraph() {
        let html = r#"
            <html><body>
            <p class="meta">short</p>
            <p>This <b>great</b> offer takes you to Lisbon and back for a price we have not seen in years.</p>
            <p>Another paragraph.</p>
            </body></html>
        "#;
        let excerpt = first_paragraph(html).unwrap();
        assert!(excerpt.starts_with("This great offer takes you to Lisbon"));
        assert!(!excerpt.contains('<'));
    }

    #[test]
    fn returns_none_without_long_paragraph() {
        assert_eq!(first_paragraph("<p>too short</p>"), None);
        assert_eq!(first_paragraph("no markup at all"), None);
    }

    #[test]
    fn truncates_long_text_at_word_boundary() {
        let word = "word ";
        let long = word.repeat(200);
        let html = format!("<p>{long}</p>");
        let excerpt = first_paragraph(&html).unwrap();
        assert!(excerpt.ends_with("..."));
        assert!(excerpt.chars().count() <= MAX_EXCERPT_CHARS + 3);
        assert!(!excerpt.trim_end_matches("...").ends_with("wor"));
    }
}
