//! Retrieved files and their chunks.
//!
//! Chunks render as `<sourceN …>` tags for prompting. `N` is the chunk's
//! ordinal in the conversation's [`SourceRegistry`], never its `order`.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::message::{Message, Role};
use crate::reference::{escape_xml, SourceRef, SourceRegistry, DEFAULT_CONTENT_SCHEME};
use crate::tokenizer::{truncate_text, Tokenizer};

static DOCUMENT_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<\|document\|>.*?<\|/document\|>").expect("Failed to compile document regex"));
static INFO_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<\|info\|>.*?<\|/info\|>").expect("Failed to compile info regex"));

fn clean_content(content: &str) -> String {
    let without_document = DOCUMENT_BLOCK.replace_all(content, "");
    INFO_BLOCK.replace_all(&without_document, "").into_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub file_id: String,
    pub file_name: String,
    /// Position of the chunk within its file.
    pub order: u32,
    pub content: String,
    #[serde(default)]
    pub start_page: Option<u32>,
    #[serde(default)]
    pub end_page: Option<u32>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub url: Option<String>,
}

impl Chunk {
    /// Build a chunk; embedded `<|document|>` and `<|info|>` blocks are stripped.
    pub fn new(
        id: impl Into<String>,
        file_id: impl Into<String>,
        file_name: impl Into<String>,
        order: u32,
        content: &str,
    ) -> Self {
        Self {
            id: id.into(),
            file_id: file_id.into(),
            file_name: file_name.into(),
            order,
            content: clean_content(content),
            start_page: None,
            end_page: None,
            created_at: None,
            updated_at: None,
            url: None,
        }
    }

    pub fn with_pages(mut self, start: u32, end: u32) -> Self {
        self.start_page = Some(start);
        self.end_page = Some(end.max(start));
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn locator(&self) -> String {
        self.url
            .clone()
            .unwrap_or_else(|| format!("{}/{}", DEFAULT_CONTENT_SCHEME, self.file_id))
    }

    /// `"{file} : p1,p2"` when pages are known, the file name otherwise.
    pub fn label(&self) -> String {
        match (self.start_page, self.end_page) {
            (Some(start), Some(end)) => {
                let pages: Vec<String> = (start..=end).map(|p| p.to_string()).collect();
                format!("{} : {}", self.file_name, pages.join(","))
            }
            (Some(start), None) => format!("{} : {}", self.file_name, start),
            _ => self.file_name.clone(),
        }
    }

    pub fn as_source(&self) -> SourceRef {
        let mut source = SourceRef::new(self.file_id.clone(), self.id.clone(), self.label())
            .with_url(self.locator())
            .with_pages(self.start_page, self.end_page);
        source.order = Some(self.order);
        source
    }

    pub fn tokens(&self, tokenizer: &dyn Tokenizer) -> Vec<u32> {
        tokenizer.encode(&self.content)
    }

    pub fn token_count(&self, tokenizer: &dyn Tokenizer) -> usize {
        tokenizer.count(&self.content)
    }

    /// Copy with the content cut to `budget` tokens, keeping the tail.
    pub fn truncated(&self, budget: usize, tokenizer: &dyn Tokenizer) -> Self {
        let mut copy = self.clone();
        copy.content = truncate_text(&self.content, budget, tokenizer);
        copy
    }

    pub fn xml(&self, ordinal: usize) -> String {
        let page = |p: Option<u32>| p.map(|v| v.to_string()).unwrap_or_default();
        format!(
            r#"<source{n} id="{id}" file_id="{file_id}" order="{order}" start_page="{start}" end_page="{end}" label="{label}" url="{url}">{content}</source{n}>"#,
            n = ordinal,
            id = escape_xml(&self.id),
            file_id = escape_xml(&self.file_id),
            order = self.order,
            start = page(self.start_page),
            end = page(self.end_page),
            label = escape_xml(&self.label()),
            url = escape_xml(&self.locator()),
            content = escape_xml(&self.content),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkList(Vec<Chunk>);

impl ChunkList {
    pub fn new(chunks: Vec<Chunk>) -> Self {
        Self(chunks)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Chunk> {
        self.0.iter()
    }

    pub fn push(&mut self, chunk: Chunk) {
        self.0.push(chunk);
    }

    pub fn first(&self) -> Option<&Chunk> {
        self.0.first()
    }

    pub fn last(&self) -> Option<&Chunk> {
        self.0.last()
    }

    pub fn filter(&self, predicate: impl Fn(&Chunk) -> bool) -> Self {
        Self(self.0.iter().filter(|c| predicate(c)).cloned().collect())
    }

    /// Stable sort by `order`.
    pub fn sorted(&self) -> Self {
        let mut chunks = self.0.clone();
        chunks.sort_by_key(|c| c.order);
        Self(chunks)
    }

    pub fn content(&self) -> String {
        self.0.iter().map(|c| c.content.as_str()).collect()
    }

    pub fn token_count(&self, tokenizer: &dyn Tokenizer) -> usize {
        self.0.iter().map(|c| c.token_count(tokenizer)).sum()
    }

    /// Keep the trailing `budget` tokens across chunks.
    ///
    /// Chunks are walked from the end, each taking what it can from the
    /// remaining budget; the first chunk to overflow is cut from the front and
    /// everything before it is dropped. Empty chunks are removed.
    pub fn truncate(&self, budget: usize, tokenizer: &dyn Tokenizer) -> Self {
        let mut remaining = budget;
        let mut kept: Vec<Chunk> = Vec::new();
        for chunk in self.0.iter().rev() {
            if remaining == 0 {
                break;
            }
            let count = chunk.token_count(tokenizer);
            if count <= remaining {
                remaining -= count;
                kept.push(chunk.clone());
            } else {
                kept.push(chunk.truncated(remaining, tokenizer));
                remaining = 0;
            }
        }
        kept.reverse();
        kept.retain(|c| !c.content.is_empty());
        Self(kept)
    }

    /// Tags numbered from `offset` in list order.
    pub fn xml(&self, offset: usize) -> String {
        self.0
            .iter()
            .enumerate()
            .map(|(i, c)| c.xml(offset + i))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Tags numbered by conversation ordinal, registering unseen chunks.
    pub fn xml_with(&self, registry: &mut SourceRegistry) -> String {
        self.0
            .iter()
            .map(|c| c.xml(registry.register(c.as_source())))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn as_sources(&self) -> Vec<SourceRef> {
        self.0.iter().map(Chunk::as_source).collect()
    }

    /// Group chunks back into files, in order of first appearance.
    pub fn as_files(&self) -> FileList {
        let mut files: Vec<File> = Vec::new();
        for chunk in &self.0 {
            match files.iter_mut().find(|f| f.id == chunk.file_id) {
                Some(file) => file.chunks.push(chunk.clone()),
                None => {
                    let mut file = File::new(chunk.file_id.clone(), chunk.file_name.clone(), "text/plain");
                    file.chunks.push(chunk.clone());
                    files.push(file);
                }
            }
        }
        FileList::new(files)
    }

    pub fn as_message(&self, registry: &mut SourceRegistry, role: Role) -> Message {
        let sources = self.as_sources();
        let content = self.xml_with(registry);
        message_with_role(role, content).with_sources(sources)
    }
}

impl IntoIterator for ChunkList {
    type Item = Chunk;
    type IntoIter = std::vec::IntoIter<Chunk>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a ChunkList {
    type Item = &'a Chunk;
    type IntoIter = std::slice::Iter<'a, Chunk>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<Chunk> for ChunkList {
    fn from_iter<T: IntoIterator<Item = Chunk>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn message_with_role(role: Role, content: String) -> Message {
    match role {
        Role::User => Message::user(content),
        Role::Assistant => Message::assistant(content),
        _ => Message::system(content),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct File {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub chunks: ChunkList,
    #[serde(default)]
    pub read_url: Option<String>,
    #[serde(default)]
    pub write_url: Option<String>,
}

impl File {
    pub fn new(id: impl Into<String>, name: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            mime_type: mime_type.into(),
            chunks: ChunkList::default(),
            read_url: None,
            write_url: None,
        }
    }

    /// A file whose text is split into chunks of `chunk_chars` characters,
    /// one page per chunk.
    pub fn from_text(id: impl Into<String>, name: impl Into<String>, text: &str, chunk_chars: usize) -> Self {
        let mut file = Self::new(id, name, "text/plain");
        let chars: Vec<char> = text.chars().collect();
        for (i, piece) in chars.chunks(chunk_chars.max(1)).enumerate() {
            let content: String = piece.iter().collect();
            let page = i as u32 + 1;
            let chunk = Chunk::new(format!("{}_{}", file.id, i), file.id.clone(), file.name.clone(), i as u32, &content)
                .with_pages(page, page);
            file.chunks.push(chunk);
        }
        file
    }

    pub fn with_chunks(mut self, chunks: ChunkList) -> Self {
        self.chunks = chunks;
        self
    }

    pub fn content(&self) -> String {
        self.chunks.content()
    }

    pub fn token_count(&self, tokenizer: &dyn Tokenizer) -> usize {
        self.chunks.token_count(tokenizer)
    }

    pub fn truncate(&self, budget: usize, tokenizer: &dyn Tokenizer) -> Self {
        let mut copy = self.clone();
        copy.chunks = self.chunks.truncate(budget, tokenizer);
        copy
    }

    pub fn xml(&self, offset: usize) -> String {
        self.chunks.xml(offset)
    }

    pub fn xml_with(&self, registry: &mut SourceRegistry) -> String {
        self.chunks.xml_with(registry)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileList(Vec<File>);

impl FileList {
    pub fn new(files: Vec<File>) -> Self {
        Self(files)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, File> {
        self.0.iter()
    }

    pub fn push(&mut self, file: File) {
        self.0.push(file);
    }

    pub fn first(&self) -> Option<&File> {
        self.0.first()
    }

    pub fn last(&self) -> Option<&File> {
        self.0.last()
    }

    pub fn filter(&self, predicate: impl Fn(&File) -> bool) -> Self {
        Self(self.0.iter().filter(|f| predicate(f)).cloned().collect())
    }

    pub fn sorted_by_key<K: Ord>(&self, key: impl FnMut(&File) -> K) -> Self {
        let mut files = self.0.clone();
        files.sort_by_key(key);
        Self(files)
    }

    pub fn chunks(&self) -> ChunkList {
        self.0.iter().flat_map(|f| f.chunks.iter().cloned()).collect()
    }

    /// Every file gets an equal share of `budget`.
    pub fn truncate(&self, budget: usize, tokenizer: &dyn Tokenizer) -> Self {
        if self.0.is_empty() {
            return self.clone();
        }
        let share = budget / self.0.len();
        Self(self.0.iter().map(|f| f.truncate(share, tokenizer)).collect())
    }

    /// Tags numbered from `offset`, continuing across file boundaries.
    pub fn xml(&self, offset: usize) -> String {
        let mut next = offset;
        let mut parts = Vec::with_capacity(self.0.len());
        for file in &self.0 {
            parts.push(file.xml(next));
            next += file.chunks.len();
        }
        parts.retain(|p| !p.is_empty());
        parts.join("\n")
    }

    pub fn xml_with(&self, registry: &mut SourceRegistry) -> String {
        self.chunks().xml_with(registry)
    }

    pub fn as_sources(&self) -> Vec<SourceRef> {
        self.chunks().as_sources()
    }

    /// Render as a system message carrying the chunks as sources.
    pub fn as_message(&self, registry: &mut SourceRegistry) -> Message {
        self.chunks().as_message(registry, Role::System)
    }

    pub fn as_message_with_role(&self, registry: &mut SourceRegistry, role: Role) -> Message {
        self.chunks().as_message(registry, role)
    }
}

impl IntoIterator for FileList {
    type Item = File;
    type IntoIter = std::vec::IntoIter<File>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a FileList {
    type Item = &'a File;
    type IntoIter = std::slice::Iter<'a, File>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::{BpeTokenizer, CharTokenizer};

    #[test]
    fn chunk_content_is_cleaned() {
        let chunk = Chunk::new("c", "f", "doc.pdf", 0, "<|document|>doc.pdf<|/document|>\n<|info|>meta<|/info|>Body");
        assert_eq!(chunk.content, "\nBody");
    }

    #[test]
    fn label_lists_pages() {
        let chunk = Chunk::new("c", "f", "doc.pdf", 0, "x").with_pages(2, 4);
        assert_eq!(chunk.label(), "doc.pdf : 2,3,4");
        assert_eq!(Chunk::new("c", "f", "doc.pdf", 0, "x").label(), "doc.pdf");
    }

    #[test]
    fn xml_uses_ordinal_not_order() {
        let chunk = Chunk::new("c7", "f1", "a<b>.txt", 7, "x < y").with_pages(1, 1);
        let xml = chunk.xml(0);
        assert!(xml.starts_with(r#"<source0 id="c7" file_id="f1" order="7""#));
        assert!(xml.contains(r#"label="a&lt;b&gt;.txt : 1""#));
        assert!(xml.ends_with("x &lt; y</source0>"));
    }

    #[test]
    fn file_list_xml_offsets_across_files() {
        let files = FileList::new(vec![
            File::from_text("a", "a.txt", "aaaa", 2),
            File::from_text("b", "b.txt", "bb", 2),
        ]);
        let xml = files.xml(5);
        assert!(xml.contains("<source5 id=\"a_0\""));
        assert!(xml.contains("<source6 id=\"a_1\""));
        assert!(xml.contains("<source7 id=\"b_0\""));
    }

    #[test]
    fn xml_with_reuses_registry_ordinals() {
        let file = File::from_text("a", "a.txt", "aaaa", 2);
        let mut registry = SourceRegistry::new();
        registry.register(SourceRef::new("other", "o", "o"));
        registry.register(file.chunks.last().unwrap().as_source());

        let xml = file.xml_with(&mut registry);
        assert!(xml.contains("<source2 id=\"a_0\""));
        assert!(xml.contains("<source1 id=\"a_1\""));
    }

    #[test]
    fn truncating_large_file_keeps_tail_in_order() {
        let tokenizer = CharTokenizer;
        let text: String = (0..5000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let file = File::from_text("big", "big.txt", &text, 300);
        assert_eq!(file.token_count(&tokenizer), 5000);

        let truncated = file.truncate(100, &tokenizer);
        let content = truncated.content();
        assert!(tokenizer.count(&content) <= 100);
        assert!(text.ends_with(&content));

        let orders: Vec<u32> = truncated.chunks.iter().map(|c| c.order).collect();
        assert!(orders.windows(2).all(|w| w[0] <= w[1]));
        assert!(!orders.is_empty());
    }

    #[test]
    fn truncating_with_bpe_tokenizer_stays_within_budget() {
        let tokenizer = BpeTokenizer::o200k().unwrap();
        let text = "lorem ipsum dolor sit amet ".repeat(400);
        let file = File::from_text("f", "f.txt", &text, 500);
        let truncated = file.truncate(100, &tokenizer);
        assert!(truncated.token_count(&tokenizer) <= 100);
        assert!(text.ends_with(&truncated.content()));
    }

    #[test]
    fn file_list_splits_budget_evenly() {
        let tokenizer = CharTokenizer;
        let files = FileList::new(vec![
            File::from_text("a", "a.txt", &"a".repeat(100), 10),
            File::from_text("b", "b.txt", &"b".repeat(100), 10),
        ]);
        let truncated = files.truncate(50, &tokenizer);
        for file in &truncated {
            assert_eq!(file.token_count(&tokenizer), 25);
        }
    }

    #[test]
    fn as_files_groups_by_file() {
        let chunks = ChunkList::new(vec![
            Chunk::new("1", "a", "a.txt", 0, "x"),
            Chunk::new("2", "b", "b.txt", 0, "y"),
            Chunk::new("3", "a", "a.txt", 1, "z"),
        ]);
        let files = chunks.as_files();
        assert_eq!(files.len(), 2);
        assert_eq!(files.first().unwrap().content(), "xz");
    }

    #[test]
    fn as_message_defaults_to_system_with_sources() {
        let files = FileList::new(vec![File::from_text("a", "a.txt", "hello", 10)]);
        let mut registry = SourceRegistry::new();
        let message = files.as_message(&mut registry);
        assert_eq!(message.role, Role::System);
        assert_eq!(message.sources.len(), 1);
        assert_eq!(registry.len(), 1);
    }
}
