//! Keyset-paged lazy cursor over ordered query results.
//!
//! A [`PageSource`] returns rows strictly after a given row in key order. The
//! cursor asks for one more row than it emits per page; that lookahead row
//! only tells the cursor whether another page exists, so a result of `N > 0`
//! rows with page size `K` costs exactly `ceil(N / K)` fetches and an empty
//! result costs one.
//!
//! ```text
//! fetch(after = None,    limit = K + 1) -> K + 1 rows -> emit K, more pending
//! fetch(after = row[K],  limit = K + 1) -> r <= K rows -> emit r, exhausted
//! ```

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::Stream;

use crate::error::{Error, Result};

/// Ordered keyset query the cursor pages through.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Row type.
    type Item: Clone + Send + Sync;

    /// Returns up to `limit` rows ordered by key, strictly after `after`.
    async fn fetch_page(&self, after: Option<&Self::Item>, limit: usize)
    -> Result<Vec<Self::Item>>;
}

/// Lazy, finite, non-restartable sequence of rows from a [`PageSource`].
pub struct PagedCursor<S: PageSource> {
    source: Option<S>,
    page_size: usize,
    buffer: VecDeque<S::Item>,
    last_emitted: Option<S::Item>,
    more_pending: bool,
    fetches: usize,
}

impl<S: PageSource> PagedCursor<S> {
    /// Creates a cursor; no query is issued until the first [`next`](Self::next).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `page_size` is zero.
    pub fn new(source: S, page_size: usize) -> Result<Self> {
        if page_size == 0 {
            return Err(Error::InvalidInput("page size must be positive".into()));
        }
        Ok(Self {
            source: Some(source),
            page_size,
            buffer: VecDeque::new(),
            last_emitted: None,
            more_pending: true,
            fetches: 0,
        })
    }

    /// Returns the next row, fetching a page when the buffer is empty.
    ///
    /// Returns `Ok(None)` once exhausted or closed.
    ///
    /// # Errors
    ///
    /// Propagates page fetch failures; the cursor stays usable for a retry.
    pub async fn next(&mut self) -> Result<Option<S::Item>> {
        if self.buffer.is_empty() && self.more_pending {
            self.fetch_next_page().await?;
        }

        let item = self.buffer.pop_front();
        if let Some(item) = &item {
            self.last_emitted = Some(item.clone());
        }
        Ok(item)
    }

    /// Releases the underlying source. Further calls to `next` return `None`.
    pub fn close(&mut self) {
        self.source = None;
        self.buffer.clear();
        self.more_pending = false;
    }

    /// Number of page fetches issued so far.
    #[must_use]
    pub const fn fetch_count(&self) -> usize {
        self.fetches
    }

    /// Page size used for fetches.
    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    /// Converts the cursor into a stream; a fetch error ends the stream after
    /// being yielded once.
    pub fn into_stream(self) -> impl Stream<Item = Result<S::Item>> + Send
    where
        S: 'static,
    {
        futures::stream::unfold(self, |mut cursor| async move {
            match cursor.next().await {
                Ok(Some(item)) => Some((Ok(item), cursor)),
                Ok(None) => None,
                Err(e) => {
                    cursor.close();
                    Some((Err(e), cursor))
                }
            }
        })
    }

    /// Drains the remaining rows into a vector.
    ///
    /// # Errors
    ///
    /// Propagates the first fetch failure.
    pub async fn collect_remaining(mut self) -> Result<Vec<S::Item>> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await? {
            out.push(item);
        }
        Ok(out)
    }

    async fn fetch_next_page(&mut self) -> Result<()> {
        let Some(source) = &self.source else {
            self.more_pending = false;
            return Ok(());
        };

        let mut page = source
            .fetch_page(self.last_emitted.as_ref(), self.page_size + 1)
            .await?;
        self.fetches += 1;

        if page.len() > self.page_size {
            page.truncate(self.page_size);
        } else {
            self.more_pending = false;
            self.source = None;
        }
        self.buffer.extend(page);
        Ok(())
    }
}
