//! Derived attributes: traffic source, channel bucket, screen size
//!
//! These are computed from raw session attributes and used both by the
//! breakdown cards (as grouping keys) and by the filter compiler (as equality
//! targets), so a click on a row always filters to exactly that row.

use super::types::HydratedEvent;
use serde::Serialize;

/// Sentinel shown for visits without a referrer; never stripped or matched
pub const DIRECT: &str = "Direct";

const SEARCH_DOMAINS: &[&str] = &[
    "google",
    "bing.com",
    "duckduckgo.com",
    "search.yahoo.com",
    "yahoo.com",
    "yandex.ru",
    "yandex.com",
    "baidu.com",
    "ecosia.org",
    "search.brave.com",
    "startpage.com",
    "qwant.com",
];

const SOCIAL_DOMAINS: &[&str] = &[
    "facebook.com",
    "m.facebook.com",
    "l.facebook.com",
    "instagram.com",
    "l.instagram.com",
    "twitter.com",
    "t.co",
    "x.com",
    "linkedin.com",
    "lnkd.in",
    "reddit.com",
    "old.reddit.com",
    "news.ycombinator.com",
    "youtube.com",
    "pinterest.com",
    "tiktok.com",
    "threads.net",
    "bsky.app",
    "mastodon.social",
];

const EMAIL_DOMAINS: &[&str] = &[
    "mail.google.com",
    "outlook.live.com",
    "mail.yahoo.com",
    "mail.proton.me",
    "app.fastmail.com",
];

/// Channel buckets a visit is classified into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Channel {
    Direct,
    OrganicSearch,
    Social,
    Email,
    PaidSearch,
    Referral,
    Unknown,
}

impl Channel {
    pub fn label(&self) -> &'static str {
        match self {
            Channel::Direct => "Direct",
            Channel::OrganicSearch => "Organic Search",
            Channel::Social => "Social",
            Channel::Email => "Email",
            Channel::PaidSearch => "Paid Search",
            Channel::Referral => "Referral",
            Channel::Unknown => "Unknown",
        }
    }
}

/// Strip a leading `www.`; the direct sentinel passes through untouched
pub fn normalize_domain(domain: &str) -> String {
    if domain == DIRECT {
        return DIRECT.to_string();
    }
    let lower = domain.trim().to_ascii_lowercase();
    match lower.strip_prefix("www.") {
        Some(rest) => rest.to_string(),
        None => lower,
    }
}

/// Host part of a referrer URL (`https://www.x.com/a?b` -> `www.x.com`)
pub fn host_of(referrer: &str) -> Option<&str> {
    let trimmed = referrer.trim();
    if trimmed.is_empty() {
        return None;
    }
    let without_scheme = match trimmed.find("://") {
        Some(idx) => &trimmed[idx + 3..],
        None => trimmed,
    };
    let end = without_scheme
        .find(|c| c == '/' || c == '?' || c == '#')
        .unwrap_or(without_scheme.len());
    let authority = &without_scheme[..end];
    let host = authority.rsplit('@').next().unwrap_or(authority);
    let host = host.split(':').next().unwrap_or(host);
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Resolved referrer domain for a row
///
/// - `None`: the deployment carries no referrer columns at all
/// - `Some(DIRECT)`: referrer column present but empty
/// - `Some(domain)`: normalized domain
pub fn resolve_referrer_domain(row: &HydratedEvent) -> Option<String> {
    let domain_col = row.column("referrer_domain");
    let referrer_col = row.column("referrer");

    if domain_col.is_none() && referrer_col.is_none() {
        return None;
    }

    if let Some(domain) = row.column_text("referrer_domain") {
        if !domain.trim().is_empty() {
            return Some(normalize_domain(&domain));
        }
    }

    if let Some(referrer) = row.column_text("referrer") {
        if let Some(host) = host_of(&referrer) {
            return Some(normalize_domain(host));
        }
    }

    Some(DIRECT.to_string())
}

/// Source label used by the Sources tab and the `source` segment kind
pub fn source_label(row: &HydratedEvent) -> Option<String> {
    resolve_referrer_domain(row)
}

/// Full referrer label (host + path, no scheme/query) for the `referrer` kind
pub fn referrer_label(row: &HydratedEvent) -> Option<String> {
    let referrer = row.column("referrer")?;
    let referrer = super::types::value_text(&referrer).unwrap_or_default();
    let trimmed = referrer.trim();
    if trimmed.is_empty() {
        return Some(DIRECT.to_string());
    }
    let without_scheme = match trimmed.find("://") {
        Some(idx) => &trimmed[idx + 3..],
        None => trimmed,
    };
    let end = without_scheme
        .find(|c| c == '?' || c == '#')
        .unwrap_or(without_scheme.len());
    let cleaned = without_scheme[..end].trim_end_matches('/');
    Some(normalize_domain(cleaned))
}

fn domain_in(domain: &str, table: &[&str]) -> bool {
    table.iter().any(|known| {
        if known.contains('.') {
            domain == *known || domain.ends_with(&format!(".{}", known))
        } else {
            is_registrable_name(domain, known)
        }
    })
}

/// `name.<tld>` or `name.co.<cc>` / `name.com.<cc>`; subdomains never match
fn is_registrable_name(domain: &str, name: &str) -> bool {
    let Some(suffix) = domain.strip_prefix(name).and_then(|rest| rest.strip_prefix('.')) else {
        return false;
    };
    let labels: Vec<&str> = suffix.split('.').collect();
    match labels.as_slice() {
        [tld] => !tld.is_empty(),
        [second, country] => matches!(*second, "co" | "com") && country.len() == 2,
        _ => false,
    }
}

/// Classify a row into its channel bucket
///
/// Medium codes win over domains: a paid click from google.com is Paid Search.
pub fn classify_channel(row: &HydratedEvent) -> Channel {
    if let Some(medium) = row.column_text("utm_medium") {
        match medium.trim().to_ascii_lowercase().as_str() {
            "cpc" | "ppc" => return Channel::PaidSearch,
            "email" => return Channel::Email,
            _ => {}
        }
    }

    let Some(domain) = resolve_referrer_domain(row) else {
        return Channel::Unknown;
    };

    if domain == DIRECT {
        return Channel::Direct;
    }
    // Webmail hosts live under search domains (mail.google.com)
    if domain_in(&domain, EMAIL_DOMAINS) {
        return Channel::Email;
    }
    if domain_in(&domain, SEARCH_DOMAINS) {
        return Channel::OrganicSearch;
    }
    if domain_in(&domain, SOCIAL_DOMAINS) {
        return Channel::Social;
    }
    Channel::Referral
}

/// `"{width}x{height}"`, `None` when either dimension is missing
pub fn screen_size_label(row: &HydratedEvent) -> Option<String> {
    let width = row.column_text("screen_width")?;
    let height = row.column_text("screen_height")?;
    Some(format!("{}x{}", width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{AttributeMap, SessionContext, PAGE_VIEW};
    use chrono::Utc;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn make_row(pairs: &[(&str, Value)]) -> HydratedEvent {
        let mut attributes = AttributeMap::new();
        for (k, v) in pairs {
            attributes.insert(k.to_string(), v.clone());
        }
        HydratedEvent {
            event: PAGE_VIEW.to_string(),
            pathname: "/".to_string(),
            timestamp: Utc::now(),
            properties: AttributeMap::new(),
            is_initial: true,
            session: Arc::new(SessionContext {
                session_id: "s".to_string(),
                attributes,
                entry_page: None,
                exit_page: None,
            }),
        }
    }

    #[test]
    fn test_normalize_domain() {
        assert_eq!(normalize_domain("www.Example.com"), "example.com");
        assert_eq!(normalize_domain("news.ycombinator.com"), "news.ycombinator.com");
        assert_eq!(normalize_domain(DIRECT), DIRECT);
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("https://www.google.com/search?q=x"), Some("www.google.com"));
        assert_eq!(host_of("http://user@t.co:8080/abc"), Some("t.co"));
        assert_eq!(host_of("bing.com"), Some("bing.com"));
        assert_eq!(host_of(""), None);
    }

    #[test]
    fn test_channel_classification() {
        let cases = vec![
            (vec![("referrer", json!(""))], Channel::Direct),
            (vec![("referrer", json!("https://www.google.co.uk/"))], Channel::OrganicSearch),
            (vec![("referrer_domain", json!("duckduckgo.com"))], Channel::OrganicSearch),
            (vec![("referrer", json!("https://t.co/xyz"))], Channel::Social),
            (vec![("referrer_domain", json!("mail.google.com"))], Channel::Email),
            (
                vec![("referrer", json!("https://google.com")), ("utm_medium", json!("CPC"))],
                Channel::PaidSearch,
            ),
            (
                vec![("referrer", json!("")), ("utm_medium", json!("email"))],
                Channel::Email,
            ),
            (vec![("referrer", json!("https://blog.example.org/post"))], Channel::Referral),
            (vec![("referrer_domain", json!("google.com.au"))], Channel::OrganicSearch),
            (vec![("referrer_domain", json!("google.de"))], Channel::OrganicSearch),
            (vec![("referrer", json!("https://docs.google.com/document/d/1"))], Channel::Referral),
            (vec![("referrer_domain", json!("google.evil.com"))], Channel::Referral),
            (vec![("referrer_domain", json!("notgoogle.com"))], Channel::Referral),
            (vec![("country", json!("US"))], Channel::Unknown),
        ];

        for (pairs, expected) in cases {
            let row = make_row(&pairs);
            assert_eq!(classify_channel(&row), expected, "pairs: {:?}", pairs);
        }
    }

    #[test]
    fn test_source_and_referrer_labels() {
        let row = make_row(&[("referrer", json!("https://www.example.com/blog/?utm=1"))]);
        assert_eq!(source_label(&row).as_deref(), Some("example.com"));
        assert_eq!(referrer_label(&row).as_deref(), Some("example.com/blog"));

        let direct = make_row(&[("referrer", Value::Null)]);
        assert_eq!(source_label(&direct).as_deref(), Some(DIRECT));
        assert_eq!(referrer_label(&direct).as_deref(), Some(DIRECT));

        let none = make_row(&[]);
        assert_eq!(source_label(&none), None);
    }

    #[test]
    fn test_screen_size_label() {
        let row = make_row(&[("screen_width", json!(1920)), ("screen_height", json!(1080.0))]);
        assert_eq!(screen_size_label(&row).as_deref(), Some("1920x1080"));
        let partial = make_row(&[("screen_width", json!(1920))]);
        assert_eq!(screen_size_label(&partial), None);
    }
}
