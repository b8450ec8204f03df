//! The Story record: the immutable-on-wire unit of work carried through the
//! pipeline, with four independently populated sub-views.
//!
//! Each view is mutated only through a typed update struct passed to a
//! `Story::update_*` method. An update struct has no open field-name string
//! to get wrong: every field it can touch is declared on the struct, so
//! "unknown field" is a compile error rather than a runtime one. Applying an
//! update is the write-back point — there is nothing left to flush on exit.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RssEntry {
    pub link: String,
    pub title: String,
    pub domain: String,
    pub pub_date: String,
    pub fetch_date: String,
    pub via: String,
    pub source_feed_id: Option<i64>,
    pub source_source_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpMetadata {
    pub final_url: String,
    pub response_code: Option<u16>,
    pub fetch_timestamp: Option<f64>,
    pub encoding: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawHtml {
    pub html: Vec<u8>,
    pub encoding: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentMetadata {
    pub url: String,
    pub normalized_url: String,
    pub canonical_domain: String,
    pub publication_date: String,
    pub language: String,
    pub full_language: String,
    pub article_title: String,
    pub normalized_article_title: String,
    pub text_content: String,
    pub text_extraction_method: String,
    pub is_homepage: bool,
    pub is_shortened: bool,
}

/// Typed update for the RSS entry view. Every field the view declares has a
/// slot here; there is no other way to name a field.
#[derive(Debug, Clone, Default)]
pub struct RssEntryUpdate {
    pub link: Option<String>,
    pub title: Option<String>,
    pub domain: Option<String>,
    pub pub_date: Option<String>,
    pub fetch_date: Option<String>,
    pub via: Option<String>,
    pub source_feed_id: Option<i64>,
    pub source_source_id: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct HttpMetadataUpdate {
    pub final_url: Option<String>,
    pub response_code: Option<u16>,
    pub fetch_timestamp: Option<f64>,
    pub encoding: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RawHtmlUpdate {
    pub html: Option<Vec<u8>>,
    pub encoding: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ContentMetadataUpdate {
    pub url: Option<String>,
    pub normalized_url: Option<String>,
    pub canonical_domain: Option<String>,
    pub publication_date: Option<String>,
    pub language: Option<String>,
    pub full_language: Option<String>,
    pub article_title: Option<String>,
    pub normalized_article_title: Option<String>,
    pub text_content: Option<String>,
    pub text_extraction_method: Option<String>,
    pub is_homepage: Option<bool>,
    pub is_shortened: Option<bool>,
}

/// Which views have been written to since the story was loaded or created.
/// Exists so callers (and tests) can observe the "dirty exactly once per
/// transaction" property without re-serializing to check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirtyViews {
    pub rss: bool,
    pub http_metadata: bool,
    pub raw_html: bool,
    pub content_metadata: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Story {
    #[serde(default)]
    schema_version: u32,
    rss: RssEntry,
    http_metadata: HttpMetadata,
    raw_html: RawHtml,
    content_metadata: ContentMetadata,
    #[serde(skip)]
    dirty: DirtyViews,
}

impl Story {
    pub fn new() -> Self {
        Story {
            schema_version: SCHEMA_VERSION,
            ..Default::default()
        }
    }

    pub fn rss(&self) -> &RssEntry {
        &self.rss
    }

    pub fn http_metadata(&self) -> &HttpMetadata {
        &self.http_metadata
    }

    pub fn raw_html(&self) -> &RawHtml {
        &self.raw_html
    }

    pub fn content_metadata(&self) -> &ContentMetadata {
        &self.content_metadata
    }

    pub fn dirty(&self) -> DirtyViews {
        self.dirty
    }

    pub fn update_rss(&mut self, update: RssEntryUpdate) {
        let RssEntryUpdate {
            link,
            title,
            domain,
            pub_date,
            fetch_date,
            via,
            source_feed_id,
            source_source_id,
        } = update;
        if let Some(v) = link {
            self.rss.link = v;
        }
        if let Some(v) = title {
            self.rss.title = v;
        }
        if let Some(v) = domain {
            self.rss.domain = v;
        }
        if let Some(v) = pub_date {
            self.rss.pub_date = v;
        }
        if let Some(v) = fetch_date {
            self.rss.fetch_date = v;
        }
        if let Some(v) = via {
            self.rss.via = v;
        }
        if source_feed_id.is_some() {
            self.rss.source_feed_id = source_feed_id;
        }
        if source_source_id.is_some() {
            self.rss.source_source_id = source_source_id;
        }
        self.dirty.rss = true;
    }

    pub fn update_http_metadata(&mut self, update: HttpMetadataUpdate) {
        let HttpMetadataUpdate {
            final_url,
            response_code,
            fetch_timestamp,
            encoding,
        } = update;
        if let Some(v) = final_url {
            self.http_metadata.final_url = v;
        }
        if response_code.is_some() {
            self.http_metadata.response_code = response_code;
        }
        if fetch_timestamp.is_some() {
            self.http_metadata.fetch_timestamp = fetch_timestamp;
        }
        if let Some(v) = encoding {
            self.http_metadata.encoding = v;
        }
        self.dirty.http_metadata = true;
    }

    pub fn update_raw_html(&mut self, update: RawHtmlUpdate) {
        let RawHtmlUpdate { html, encoding } = update;
        if let Some(v) = html {
            self.raw_html.html = v;
        }
        if let Some(v) = encoding {
            self.raw_html.encoding = v;
        }
        self.dirty.raw_html = true;
    }

    pub fn update_content_metadata(&mut self, update: ContentMetadataUpdate) {
        macro_rules! apply {
            ($field:ident) => {
                if let Some(v) = update.$field {
                    self.content_metadata.$field = v;
                }
            };
        }
        apply!(url);
        apply!(normalized_url);
        apply!(canonical_domain);
        apply!(publication_date);
        apply!(language);
        apply!(full_language);
        apply!(article_title);
        apply!(normalized_article_title);
        apply!(text_content);
        apply!(text_extraction_method);
        apply!(is_homepage);
        apply!(is_shortened);
        self.dirty.content_metadata = true;
    }

    pub fn dump(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn load(body: &[u8]) -> Result<Story> {
        let mut story: Story = serde_json::from_slice(body)?;
        if story.schema_version == 0 {
            story.schema_version = SCHEMA_VERSION;
        } else if story.schema_version > SCHEMA_VERSION {
            return Err(Error::Corrupt("story schema version newer than supported"));
        }
        Ok(story)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_all_views() {
        let mut s = Story::new();
        s.update_rss(RssEntryUpdate {
            link: Some("https://example.org/a".into()),
            title: Some("headline".into()),
            ..Default::default()
        });
        s.update_http_metadata(HttpMetadataUpdate {
            final_url: Some("https://example.org/a".into()),
            response_code: Some(200),
            ..Default::default()
        });
        s.update_raw_html(RawHtmlUpdate {
            html: Some(b"<html></html>".to_vec()),
            encoding: Some("utf-8".into()),
        });
        s.update_content_metadata(ContentMetadataUpdate {
            article_title: Some("headline".into()),
            is_homepage: Some(false),
            ..Default::default()
        });

        let bytes = s.dump().unwrap();
        let loaded = Story::load(&bytes).unwrap();
        assert_eq!(s.rss(), loaded.rss());
        assert_eq!(s.http_metadata(), loaded.http_metadata());
        assert_eq!(s.raw_html(), loaded.raw_html());
        assert_eq!(s.content_metadata(), loaded.content_metadata());
    }

    #[test]
    fn fresh_story_has_empty_views() {
        let s = Story::new();
        assert_eq!(s.rss(), &RssEntry::default());
        assert_eq!(s.http_metadata(), &HttpMetadata::default());
        assert_eq!(s.raw_html(), &RawHtml::default());
        assert_eq!(s.content_metadata(), &ContentMetadata::default());
    }

    #[test]
    fn update_marks_exactly_its_own_view_dirty() {
        let mut s = Story::new();
        s.update_rss(RssEntryUpdate {
            link: Some("https://example.org/a".into()),
            ..Default::default()
        });
        assert_eq!(
            s.dirty(),
            DirtyViews {
                rss: true,
                ..Default::default()
            }
        );
    }

    #[test]
    fn load_rejects_bogus_bytes() {
        assert!(Story::load(b"not json").is_err());
    }
}
