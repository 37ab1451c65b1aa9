// src/ingest/providers/feed.rs
//! Atom / RSS 2.0 feed provider.
//!
//! Understands YouTube channel feeds (`yt:videoId`, `media:group/media:description`)
//! as well as plain RSS items (`guid`, `link`, `description`, `pubDate`).
//! Element matching uses local names so namespace prefixes don't matter.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::time::Duration;
use time::format_description::well_known::{Rfc2822, Rfc3339};
use time::OffsetDateTime;

use crate::config::sources::{youtube_watch_url, SourceConfig};
use crate::ingest::types::{FeedSource, Item};
use crate::ingest::{normalize_text, MAX_DESCRIPTION_CHARS, MAX_TITLE_CHARS};

const USER_AGENT: &str = concat!("feedgate/", env!("CARGO_PKG_VERSION"));

pub struct FeedProvider {
    name: String,
    category: String,
    mode: Mode,
}

enum Mode {
    Fixture(String),
    Http { url: String, client: reqwest::Client },
}

impl FeedProvider {
    /// Serve a fixed XML document (tests, offline runs).
    pub fn from_fixture_str(name: &str, category: &str, xml: &str) -> Self {
        Self {
            name: name.to_string(),
            category: category.to_string(),
            mode: Mode::Fixture(xml.to_string()),
        }
    }

    pub fn from_url(name: &str, category: &str, url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .context("building feed http client")?;
        Ok(Self {
            name: name.to_string(),
            category: category.to_string(),
            mode: Mode::Http {
                url: url.to_string(),
                client,
            },
        })
    }

    pub fn from_source(src: &SourceConfig, timeout: Duration) -> Result<Self> {
        let url = src.feed_url()?;
        Self::from_url(&src.name, &src.category, &url, timeout)
    }

    /// Parse a feed document into items stamped with `discovered_at`.
    pub fn parse_items(&self, xml: &str, discovered_at: DateTime<Utc>) -> Result<Vec<Item>> {
        let t0 = std::time::Instant::now();
        let entries = parse_entries(xml).with_context(|| format!("parsing feed `{}`", self.name))?;

        let mut out = Vec::with_capacity(entries.len());
        for e in entries {
            let Some(id) = e.resolve_id() else {
                continue;
            };
            let url = match (e.link.trim(), e.video_id.trim()) {
                (link, _) if !link.is_empty() => link.to_string(),
                (_, vid) if !vid.is_empty() => youtube_watch_url(vid),
                _ => String::new(),
            };
            out.push(Item {
                title: normalize_text(&e.title, MAX_TITLE_CHARS),
                description: normalize_text(&e.description, MAX_DESCRIPTION_CHARS),
                url,
                source_name: self.name.clone(),
                source_category: self.category.clone(),
                published_at: parse_feed_date(&e.published),
                discovered_at,
                id,
            });
        }

        let ms = t0.elapsed().as_secs_f64() * 1_000.0;
        histogram!("feed_parse_ms").record(ms);
        counter!("feed_entries_total").increment(out.len() as u64);
        Ok(out)
    }
}

#[async_trait]
impl FeedSource for FeedProvider {
    async fn list_new_items(&self) -> Result<Vec<Item>> {
        let now = Utc::now();
        match &self.mode {
            Mode::Fixture(s) => self.parse_items(s, now),
            Mode::Http { url, client } => {
                let resp = client
                    .get(url.as_str())
                    .send()
                    .await
                    .with_context(|| format!("GET {url}"))?
                    .error_for_status()
                    .with_context(|| format!("GET {url}"))?;
                let body = resp.text().await.context("feed http .text()")?;
                self.parse_items(&body, now)
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Default)]
struct RawEntry {
    video_id: String,
    atom_id: String,
    guid: String,
    title: String,
    link: String,
    description: String,
    summary: String,
    published: String,
    updated: String,
}

impl RawEntry {
    fn resolve_id(&self) -> Option<String> {
        let atom = self.atom_id.trim();
        let candidates = [
            self.video_id.trim(),
            atom.strip_prefix("yt:video:").unwrap_or(atom),
            self.guid.trim(),
            self.link.trim(),
        ];
        candidates
            .into_iter()
            .find(|c| !c.is_empty())
            .map(str::to_string)
    }

    fn finish(mut self) -> Self {
        if self.description.trim().is_empty() {
            self.description = std::mem::take(&mut self.summary);
        }
        if self.published.trim().is_empty() {
            self.published = std::mem::take(&mut self.updated);
        }
        self
    }
}

fn is_entry(name: &[u8]) -> bool {
    name == b"entry" || name == b"item"
}

fn href_of(e: &BytesStart<'_>) -> Result<Option<String>> {
    let rel = match e.try_get_attribute("rel")? {
        Some(a) => Some(a.unescape_value()?.into_owned()),
        None => None,
    };
    if rel.as_deref().is_some_and(|r| r != "alternate") {
        return Ok(None);
    }
    match e.try_get_attribute("href")? {
        Some(a) => Ok(Some(a.unescape_value()?.into_owned())),
        None => Ok(None),
    }
}

fn parse_entries(xml: &str) -> Result<Vec<RawEntry>> {
    let xml = scrub_html_entities_for_xml(xml);
    let mut reader = Reader::from_str(&xml);
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut current: Option<RawEntry> = None;
    let mut out = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                if is_entry(&name) {
                    current = Some(RawEntry::default());
                } else if name == b"link" {
                    if let (Some(entry), Some(href)) = (current.as_mut(), href_of(&e)?) {
                        if entry.link.is_empty() {
                            entry.link = href;
                        }
                    }
                }
                stack.push(name);
            }
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"link" {
                    if let (Some(entry), Some(href)) = (current.as_mut(), href_of(&e)?) {
                        if entry.link.is_empty() {
                            entry.link = href;
                        }
                    }
                }
            }
            Event::End(e) => {
                stack.pop();
                if is_entry(e.local_name().as_ref()) {
                    if let Some(entry) = current.take() {
                        out.push(entry.finish());
                    }
                }
            }
            Event::Text(t) => {
                if let Some(entry) = current.as_mut() {
                    let text = t
                        .unescape()
                        .map(|c| c.into_owned())
                        .unwrap_or_else(|_| String::from_utf8_lossy(&t).into_owned());
                    assign_text(entry, &stack, &text);
                }
            }
            Event::CData(c) => {
                if let Some(entry) = current.as_mut() {
                    let text = String::from_utf8_lossy(&c).into_owned();
                    assign_text(entry, &stack, &text);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(out)
}

fn assign_text(entry: &mut RawEntry, stack: &[Vec<u8>], text: &str) {
    let Some(name) = stack.last() else {
        return;
    };
    let parent_is_entry = stack
        .len()
        .checked_sub(2)
        .and_then(|i| stack.get(i))
        .is_some_and(|p| is_entry(p));

    let slot = match name.as_slice() {
        b"videoId" => &mut entry.video_id,
        b"id" if parent_is_entry => &mut entry.atom_id,
        b"guid" => &mut entry.guid,
        b"title" if parent_is_entry => &mut entry.title,
        b"link" if parent_is_entry => &mut entry.link,
        // media:group/media:description or RSS item/description
        b"description" => &mut entry.description,
        b"summary" | b"content" if parent_is_entry => &mut entry.summary,
        b"published" | b"pubDate" => &mut entry.published,
        b"updated" if parent_is_entry => &mut entry.updated,
        _ => return,
    };
    slot.push_str(text);
}

/// RFC 3339 (Atom) first, then RFC 2822 (RSS).
pub fn parse_feed_date(ts: &str) -> Option<DateTime<Utc>> {
    let ts = ts.trim();
    if ts.is_empty() {
        return None;
    }
    let odt = OffsetDateTime::parse(ts, &Rfc3339)
        .or_else(|_| OffsetDateTime::parse(ts, &Rfc2822))
        .ok()?;
    DateTime::<Utc>::from_timestamp(odt.unix_timestamp(), odt.nanosecond())
}

fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}
