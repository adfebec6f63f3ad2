//! Text extraction helpers shared by ingest and the analyzers

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

static URL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bhttps?://[^\s<>"'\)\]]+"#).expect("valid url pattern"));

static QUOTE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r">>(\d+)").expect("valid quote pattern"));

static TAG_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("valid tag pattern"));

/// Convert a board HTML comment to plain text
///
/// `<wbr>` is dropped without a space so long URLs survive; `<br>` becomes a
/// newline. Entities are decoded after the tags are gone so `&gt;&gt;123`
/// turns into a quote reference instead of a tag.
pub fn strip_html(text: &str) -> String {
    let text = text
        .replace("<wbr>", "")
        .replace("<br>", "\n")
        .replace("<br/>", "\n")
        .replace("<br />", "\n");

    let without_tags = TAG_PATTERN.replace_all(&text, "");
    let decoded = html_escape::decode_html_entities(&without_tags);

    decoded
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Every URL in the text, trailing punctuation trimmed
pub fn extract_urls(text: &str) -> Vec<String> {
    URL_PATTERN
        .find_iter(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?']).to_string())
        .collect()
}

/// Bare lowercase host of a URL with any `www.` prefix removed
pub fn normalize_domain(link: &str) -> Option<String> {
    let parsed = url::Url::parse(link).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Post ids referenced with `>>123` quote links, deduplicated
pub fn quote_references(text: &str) -> BTreeSet<u64> {
    QUOTE_PATTERN
        .captures_iter(text)
        .filter_map(|cap| cap[1].parse().ok())
        .collect()
}

/// Build a case-insensitive whole-word matcher for a term
pub fn term_pattern(term: &str) -> Option<Regex> {
    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(term))).ok()
}

/// Whether the text contains a "check"-style keyword
pub fn mentions_checking(text: &str) -> bool {
    text.to_lowercase().contains("check")
}

/// Shorten text to at most `max_chars` characters on a char boundary
pub fn excerpt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_html() {
        assert_eq!(
            strip_html("<a href=\"#p123\" class=\"quotelink\">&gt;&gt;123</a><br>reply"),
            ">>123\nreply"
        );
        assert_eq!(
            strip_html("<span class=\"quote\">&gt;greentext</span>"),
            ">greentext"
        );
        assert_eq!(strip_html("https://example.com/a<wbr>bc"), "https://example.com/abc");
        assert_eq!(strip_html("normal   text"), "normal text");
    }

    #[test]
    fn test_extract_urls() {
        let urls = extract_urls("see https://www.bbc.co.uk/news/1. and http://imgur.com/x, ok");
        assert_eq!(urls, vec!["https://www.bbc.co.uk/news/1", "http://imgur.com/x"]);
        assert!(extract_urls("no links here").is_empty());
    }

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain("https://www.Reuters.com/a").as_deref(), Some("reuters.com"));
        assert_eq!(normalize_domain("http://i.imgur.com/x.png").as_deref(), Some("i.imgur.com"));
        assert_eq!(normalize_domain("not a url"), None);
    }

    #[test]
    fn test_quote_references() {
        let refs = quote_references(">>100 agreed\n>>200 >>100");
        assert_eq!(refs.into_iter().collect::<Vec<_>>(), vec![100, 200]);
    }

    #[test]
    fn test_term_pattern_whole_word() {
        let re = term_pattern("soros").unwrap();
        assert_eq!(re.find_iter("Soros, SOROS and sorosfan").count(), 2);
    }

    #[test]
    fn test_excerpt() {
        assert_eq!(excerpt("short", 10), "short");
        assert_eq!(excerpt("abcdefghij", 5), "abcd…");
    }
}
