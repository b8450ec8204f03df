//! Domains known not to carry news content, so fetches to them are
//! discarded immediately rather than counted against a story's retry
//! budget. A small, hand-curated stand-in for the much larger embargoed
//! domain list this crate's fetched-content counterpart maintains
//! upstream; entries here are ones seen often enough in RSS feeds to be
//! worth skipping explicitly.
pub const NON_NEWS_DOMAINS: &[&str] = &[
    "doubleclick.net",
    "googlesyndication.com",
    "googleadservices.com",
    "google-analytics.com",
    "facebook.com",
    "twitter.com",
    "x.com",
    "t.co",
    "instagram.com",
    "linkedin.com",
    "pinterest.com",
    "youtube.com",
    "youtu.be",
    "amazon.com",
    "amzn.to",
    "bit.ly",
    "tinyurl.com",
];

/// True if `fqdn` is, or is a subdomain of, an embargoed non-news domain.
pub fn non_news_fqdn(fqdn: &str) -> bool {
    let fqdn = fqdn.to_ascii_lowercase();
    NON_NEWS_DOMAINS
        .iter()
        .any(|nnd| fqdn == *nnd || fqdn.ends_with(&format!(".{nnd}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_subdomain_match() {
        assert!(non_news_fqdn("facebook.com"));
        assert!(non_news_fqdn("www.facebook.com"));
        assert!(non_news_fqdn("FACEBOOK.com"));
    }

    #[test]
    fn unrelated_domain_does_not_match() {
        assert!(!non_news_fqdn("notfacebook.com"));
        assert!(!non_news_fqdn("example.org"));
    }
}
