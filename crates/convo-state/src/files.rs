use std::fmt;
use std::sync::Arc;

use convo_core::{ChunkList, ContentSearch, FileList, SearchQuery, SharedTokenizer};

use crate::error::Result;

/// Immutable query over the content search. Each builder call returns a
/// new query; only [`search`](Self::search) and [`fetch`](Self::fetch) do I/O.
#[derive(Clone)]
pub struct FileQuery {
    search: Arc<dyn ContentSearch>,
    tokenizer: SharedTokenizer,
    query: SearchQuery,
    budget: Option<usize>,
}

impl fmt::Debug for FileQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileQuery")
            .field("query", &self.query)
            .field("budget", &self.budget)
            .finish()
    }
}

impl FileQuery {
    pub fn new(search: Arc<dyn ContentSearch>, tokenizer: SharedTokenizer) -> Self {
        Self {
            search,
            tokenizer,
            query: SearchQuery::default(),
            budget: None,
        }
    }

    pub fn query(&self) -> &SearchQuery {
        &self.query
    }

    /// Restrict to these file ids.
    pub fn ids<I, S>(&self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut next = self.clone();
        next.query.file_ids.extend(ids.into_iter().map(Into::into));
        next
    }

    /// Restrict to files whose name contains `fragment`, case-insensitively.
    pub fn named(&self, fragment: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.query.name_contains = Some(fragment.into());
        next
    }

    pub fn limit(&self, limit: usize) -> Self {
        let mut next = self.clone();
        next.query.limit = Some(limit);
        next
    }

    /// Truncate results to `budget` tokens.
    pub fn within(&self, budget: usize) -> Self {
        let mut next = self.clone();
        next.budget = Some(budget);
        next
    }

    pub async fn search(&self, text: impl Into<String>) -> Result<ChunkList> {
        let mut query = self.query.clone();
        query.text = Some(text.into());
        let chunks = self.search.search(&query).await?;
        log::debug!("Search returned {} chunks", chunks.len());
        Ok(match self.budget {
            Some(budget) => chunks.truncate(budget, self.tokenizer.as_ref()),
            None => chunks,
        })
    }

    pub async fn fetch(&self) -> Result<FileList> {
        let files = self.search.fetch(&self.query).await?;
        log::debug!("Fetched {} files", files.len());
        Ok(match self.budget {
            Some(budget) => files.truncate(budget, self.tokenizer.as_ref()),
            None => files,
        })
    }
}
