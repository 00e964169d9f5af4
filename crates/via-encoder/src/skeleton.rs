//! Message skeletonization: variable lexemes become class placeholders.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// One token class: the pattern, its placeholder, and whether a bare match
/// additionally needs both a digit and a hex letter to count (guards hex
/// against ordinary English words like "dead" and against plain numbers).
struct TokenClass {
    pattern: Regex,
    placeholder: &'static str,
    requires_mixed_hex: bool,
}

/// Classes applied in priority order; earlier classes win on overlap.
static CLASSES: Lazy<Vec<TokenClass>> = Lazy::new(|| {
    vec![
        // ISO timestamps before anything that could eat their separators.
        TokenClass {
            pattern: Regex::new(
                r"\d{4}-\d{2}-\d{2}[Tt ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
            )
            .unwrap(),
            placeholder: "<ts>",
            requires_mixed_hex: false,
        },
        TokenClass {
            pattern: Regex::new(
                r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b",
            )
            .unwrap(),
            placeholder: "<uuid>",
            requires_mixed_hex: false,
        },
        // Quoted text swallows whole literals, URLs included.
        TokenClass {
            pattern: Regex::new(r#""[^"]*"|'[^'\s]*'"#).unwrap(),
            placeholder: "<str>",
            requires_mixed_hex: false,
        },
        TokenClass {
            pattern: Regex::new(r"[A-Za-z][A-Za-z0-9+.\-]*://[^\s\x22']+").unwrap(),
            placeholder: "<url>",
            requires_mixed_hex: false,
        },
        TokenClass {
            pattern: Regex::new(r"\b(?:[0-9a-fA-F]{1,4}:){2,7}[0-9a-fA-F]{1,4}\b").unwrap(),
            placeholder: "<ip>",
            requires_mixed_hex: false,
        },
        TokenClass {
            pattern: Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap(),
            placeholder: "<ip>",
            requires_mixed_hex: false,
        },
        TokenClass {
            pattern: Regex::new(r"(?:/[A-Za-z0-9_][A-Za-z0-9_.\-]*)+/?").unwrap(),
            placeholder: "<path>",
            requires_mixed_hex: false,
        },
        TokenClass {
            pattern: Regex::new(r"\b0x[0-9a-fA-F]+\b|\b[0-9a-fA-F]{4,}\b").unwrap(),
            placeholder: "<hex>",
            requires_mixed_hex: true,
        },
        TokenClass {
            pattern: Regex::new(r"\b\d+(?:\.\d+)?\b").unwrap(),
            placeholder: "<num>",
            requires_mixed_hex: false,
        },
    ]
});

/// Reduce a message to its structural skeleton.
///
/// Variable lexemes (timestamps, uuids, quoted strings, URLs, addresses,
/// paths, hex ids, numbers) are rewritten to fixed placeholders in priority
/// order; the remainder is lowercased and whitespace-normalized. The result
/// is deterministic for a given input.
pub fn skeletonize(message: &str) -> String {
    let mut text = message.to_string();
    for class in CLASSES.iter() {
        text = class
            .pattern
            .replace_all(&text, |caps: &Captures<'_>| {
                let matched = &caps[0];
                let bare_hex_ok = matched.starts_with("0x")
                    || (matched.bytes().any(|b| b.is_ascii_digit())
                        && matched.bytes().any(|b| b.is_ascii_alphabetic()));
                if class.requires_mixed_hex && !bare_hex_ok {
                    matched.to_string()
                } else {
                    class.placeholder.to_string()
                }
            })
            .into_owned();
    }
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_each_token_class() {
        assert_eq!(skeletonize("retry after 250 ms"), "retry after <num> ms");
        assert_eq!(
            skeletonize("request 9f3a2b7c failed"),
            "request <hex> failed"
        );
        assert_eq!(
            skeletonize("trace 550e8400-e29b-41d4-a716-446655440000 done"),
            "trace <uuid> done"
        );
        assert_eq!(
            skeletonize("peer 10.2.3.4 disconnected"),
            "peer <ip> disconnected"
        );
        assert_eq!(
            skeletonize("bind fe80:0:0:0:202:b3ff:fe1e:8329 ok"),
            "bind <ip> ok"
        );
        assert_eq!(
            skeletonize("wrote /var/log/app/current.log"),
            "wrote <path>"
        );
        assert_eq!(
            skeletonize("GET https://example.com/a?b=1 served"),
            "get <url> served"
        );
        assert_eq!(
            skeletonize(r#"config key "max_conns" missing"#),
            "config key <str> missing"
        );
        assert_eq!(
            skeletonize("started at 2026-08-01T12:30:45Z exactly"),
            "started at <ts> exactly"
        );
    }

    #[test]
    fn bare_hex_needs_digits_and_letters() {
        assert_eq!(skeletonize("dead connection added"), "dead connection added");
        assert_eq!(skeletonize("id 0xdead released"), "id <hex> released");
        assert_eq!(skeletonize("id deadb33f released"), "id <hex> released");
        // All-digit runs are numbers, not hex ids.
        assert_eq!(skeletonize("code 5432 returned"), "code <num> returned");
    }

    #[test]
    fn literal_spec_skeletons() {
        assert_eq!(
            skeletonize("connection established from 10.2.3.4:5432"),
            "connection established from <ip>:<num>"
        );
        assert_eq!(
            skeletonize("assertion failed at /src/io.c:42"),
            "assertion failed at <path>:<num>"
        );
    }

    #[test]
    fn lowercases_and_collapses_whitespace() {
        assert_eq!(
            skeletonize("  Cache   MISS   for  tenant  "),
            "cache miss for tenant"
        );
    }

    #[test]
    fn ipv4_wins_over_plain_numbers() {
        assert_eq!(skeletonize("src 10.0.0.1 dst 10.0.0.2"), "src <ip> dst <ip>");
    }
}
