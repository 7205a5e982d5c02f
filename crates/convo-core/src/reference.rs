//! Conversation-scoped source ordinals and `[sourceN]` citation rewriting.
//!
//! Ordinals are assigned in first-seen order across the whole conversation
//! and persisted under `_sources`, so a chunk cited as `[source0]` in one turn
//! is still `[source0]` in the next. Nothing here is cached between requests:
//! the registry is rebuilt from message history every time.

use std::collections::{BTreeMap, HashMap};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::message::{DebugInfo, MessageList};

static CITATION_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[source(\d+)\]").expect("Failed to compile citation regex"));
static CITATION_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(\d+)\]\([^)\s]*\)").expect("Failed to compile link regex"));
static SOURCE_OPEN_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<source(\d+)((?:\s+[\w-]+="[^"]*")*)\s*>"#).expect("Failed to compile source tag regex")
});
static SOURCE_CLOSE_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"</source(\d+)>").expect("Failed to compile source tag regex"));
static TAG_ATTRIBUTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([\w-]+)="([^"]*)""#).expect("Failed to compile attribute regex"));

/// Locator used when a source carries no URL of its own.
pub const DEFAULT_CONTENT_SCHEME: &str = "convo://content";

/// A citable chunk as the model saw it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    /// File identifier.
    pub id: String,
    pub chunk_id: String,
    /// Display label, usually `"{file} : pages a-b"`.
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<u32>,
}

impl SourceRef {
    pub fn new(id: impl Into<String>, chunk_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            chunk_id: chunk_id.into(),
            key: key.into(),
            url: None,
            start_page: None,
            end_page: None,
            order: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_pages(mut self, start: Option<u32>, end: Option<u32>) -> Self {
        self.start_page = start;
        self.end_page = end;
        self
    }

    pub fn locator(&self) -> String {
        self.url
            .clone()
            .unwrap_or_else(|| format!("{}/{}", DEFAULT_CONTENT_SCHEME, self.id))
    }

    /// Link target for a citation, anchored to the first page when known.
    pub fn link(&self) -> String {
        match self.start_page {
            Some(page) => format!("{}#page={}", self.locator(), page),
            None => self.locator(),
        }
    }

    fn registry_key(&self) -> (String, String) {
        (self.id.clone(), self.chunk_id.clone())
    }
}

/// Ordinal assignment for every source seen in a conversation.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    sources: Vec<SourceRef>,
    index: HashMap<(String, String), usize>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sources(sources: impl IntoIterator<Item = SourceRef>) -> Self {
        let mut registry = Self::new();
        for source in sources {
            registry.register(source);
        }
        registry
    }

    /// Rebuild ordinals from the `_sources` snapshots carried by history.
    pub fn from_history(history: &MessageList) -> Self {
        let mut registry = Self::new();
        for message in history {
            for source in &message.sources {
                registry.register(source.clone());
            }
        }
        registry
    }

    /// Ordinal of `source`, assigning the next free one if it is new.
    pub fn register(&mut self, source: SourceRef) -> usize {
        let key = source.registry_key();
        if let Some(ordinal) = self.index.get(&key) {
            return *ordinal;
        }
        let ordinal = self.sources.len();
        self.sources.push(source);
        self.index.insert(key, ordinal);
        ordinal
    }

    pub fn ordinal_of(&self, id: &str, chunk_id: &str) -> Option<usize> {
        self.index.get(&(id.to_string(), chunk_id.to_string())).copied()
    }

    pub fn get(&self, ordinal: usize) -> Option<&SourceRef> {
        self.sources.get(ordinal)
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn sources(&self) -> &[SourceRef] {
        &self.sources
    }

    pub fn into_sources(self) -> Vec<SourceRef> {
        self.sources
    }

    /// Store the full snapshot under `_sources`.
    pub fn save_to(&self, debug: &mut DebugInfo) -> serde_json::Result<()> {
        debug.set_as(DebugInfo::SOURCES, &self.sources)
    }
}

/// Replace `[sourceN]` markers with `[k](link)` footnotes.
///
/// `k` counts distinct cited sources in order of first use within `text`.
/// Markers whose ordinal has no source stay as plain text. Returns the new
/// text and the marker to footnote mapping.
pub fn rewrite_citations(text: &str, sources: &[SourceRef]) -> (String, BTreeMap<String, usize>) {
    let mut citations: BTreeMap<String, usize> = BTreeMap::new();
    let rewritten = CITATION_MARKER.replace_all(text, |caps: &Captures| {
        let marker = caps[0].to_string();
        let source = caps[1].parse::<usize>().ok().and_then(|n| sources.get(n));
        match source {
            Some(source) => {
                let next = citations.len() + 1;
                let footnote = *citations.entry(marker).or_insert(next);
                format!("[{}]({})", footnote, source.link())
            }
            None => marker,
        }
    });
    (rewritten.into_owned(), citations)
}

/// Undo [`rewrite_citations`] using the stored marker mapping.
pub fn restore_citations(text: &str, citations: &BTreeMap<String, usize>) -> String {
    let markers: HashMap<usize, &str> = citations.iter().map(|(m, k)| (*k, m.as_str())).collect();
    CITATION_LINK
        .replace_all(text, |caps: &Captures| {
            caps[1]
                .parse::<usize>()
                .ok()
                .and_then(|k| markers.get(&k))
                .map(|m| m.to_string())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

pub(crate) fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn source_from_tag(attributes: &str) -> Option<SourceRef> {
    let mut attrs: HashMap<&str, String> = HashMap::new();
    for caps in TAG_ATTRIBUTE.captures_iter(attributes) {
        if let (Some(name), Some(value)) = (caps.get(1), caps.get(2)) {
            attrs.insert(name.as_str(), unescape_xml(value.as_str()));
        }
    }
    let chunk_id = attrs.get("id")?.clone();
    let file_id = attrs.get("file_id").cloned().unwrap_or_else(|| chunk_id.clone());
    let label = attrs.get("label").cloned().unwrap_or_else(|| format!("source_{}", chunk_id));
    let page = |name: &str| attrs.get(name).and_then(|v| v.parse::<u32>().ok());

    let mut source = SourceRef::new(file_id, chunk_id, label).with_pages(page("start_page"), page("end_page"));
    source.order = page("order");
    source.url = attrs.get("url").cloned();
    Some(source)
}

/// Renumber `<sourceN id="…">` tags in `context` to conversation ordinals.
///
/// Sources already in `registry` keep their ordinal; unseen ones are
/// registered. Tags without an `id` attribute are left alone.
pub fn rereference(context: &MessageList, registry: &mut SourceRegistry) -> MessageList {
    let mut renumbered = context.clone();
    for message in renumbered.iter_mut() {
        let updated = {
            let Some(content) = message.content.as_deref() else {
                continue;
            };
            if !content.contains("<source") {
                continue;
            }

            let mut mapping: HashMap<String, usize> = HashMap::new();
            let opened = SOURCE_OPEN_TAG.replace_all(content, |caps: &Captures| {
                match source_from_tag(&caps[2]) {
                    Some(source) => {
                        let ordinal = registry.register(source);
                        mapping.insert(caps[1].to_string(), ordinal);
                        format!("<source{}{}>", ordinal, &caps[2])
                    }
                    None => caps[0].to_string(),
                }
            });
            let closed = SOURCE_CLOSE_TAG.replace_all(&opened, |caps: &Captures| match mapping.get(&caps[1]) {
                Some(ordinal) => format!("</source{}>", ordinal),
                None => caps[0].to_string(),
            });
            closed.into_owned()
        };
        message.content = Some(updated);
    }
    renumbered
}
