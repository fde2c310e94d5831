//! Offset and cursor paging behind one strategy type.
//!
//! A [`PageStrategy`] knows which query parameters to send for the next page
//! and, given the page that came back, whether another page exists. It does no
//! I/O; [`crate::RemoteClient::paginate`] drives it and enforces the record cap.

use concord_core::Dialect;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::remote::ApiVersion;

/// Paging metadata. Either dialect may leave every field out.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageMeta {
    pub total: Option<usize>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageLinks {
    pub next: Option<String>,
}

/// One page of a collection listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub data: Vec<Value>,
    #[serde(default)]
    pub meta: PageMeta,
    #[serde(default)]
    pub links: PageLinks,
}

/// `limit`/`offset` paging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetStrategy {
    limit: usize,
    offset: usize,
}

impl OffsetStrategy {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            offset: 0,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    fn query(&self) -> Vec<(String, String)> {
        vec![
            ("limit".to_string(), self.limit.to_string()),
            ("offset".to_string(), self.offset.to_string()),
        ]
    }

    /// Moves past `page`. Returns false when the collection is exhausted.
    ///
    /// A page shorter than `limit` always ends the listing. Otherwise the
    /// server-reported total decides; without a total, the presence of a
    /// `next` link does.
    fn advance(&mut self, page: &Page) -> bool {
        if page.data.len() < self.limit {
            return false;
        }
        let next_offset = self.offset + self.limit;
        let more = match page.meta.total {
            Some(total) => next_offset < total,
            None => page.links.next.is_some(),
        };
        if more {
            self.offset = next_offset;
        }
        more
    }
}

/// Opaque-cursor paging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorStrategy {
    limit: usize,
    cursor: Option<String>,
}

impl CursorStrategy {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            cursor: None,
        }
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    fn query(&self) -> Vec<(String, String)> {
        let mut query = vec![("limit".to_string(), self.limit.to_string())];
        if let Some(cursor) = &self.cursor {
            query.push(("cursor".to_string(), cursor.clone()));
        }
        query
    }

    /// Takes the next cursor from `meta.next_cursor`, or from the `cursor`
    /// parameter of the `next` link. Returns false when there is none.
    fn advance(&mut self, page: &Page) -> bool {
        let next = page
            .meta
            .next_cursor
            .clone()
            .filter(|c| !c.is_empty())
            .or_else(|| page.links.next.as_deref().and_then(cursor_from_link));

        match next {
            // A repeated cursor would loop forever.
            Some(cursor) if self.cursor.as_deref() != Some(cursor.as_str()) => {
                self.cursor = Some(cursor);
                true
            }
            _ => false,
        }
    }
}

fn cursor_from_link(link: &str) -> Option<String> {
    let url = Url::parse(link).ok()?;
    url.query_pairs()
        .find(|(key, _)| key == "cursor")
        .map(|(_, value)| value.into_owned())
        .filter(|c| !c.is_empty())
}

/// Paging strategy for one collection listing.
///
/// # Examples
///
/// ```
/// use concord_client::pagination::{Page, PageStrategy};
/// use concord_core::Dialect;
///
/// let mut strategy = PageStrategy::new(Dialect::Offset, 2);
/// let page: Page = serde_json::from_value(serde_json::json!({
///     "data": [{"id": "a"}, {"id": "b"}],
///     "meta": {"total": 3}
/// })).unwrap();
///
/// assert!(strategy.advance(&page));
/// assert!(strategy.query().contains(&("offset".to_string(), "2".to_string())));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageStrategy {
    Offset(OffsetStrategy),
    Cursor(CursorStrategy),
}

impl PageStrategy {
    pub fn new(dialect: Dialect, page_size: usize) -> Self {
        match dialect {
            Dialect::Offset => Self::Offset(OffsetStrategy::new(page_size)),
            Dialect::Cursor => Self::Cursor(CursorStrategy::new(page_size)),
        }
    }

    /// API version serving this dialect.
    pub fn version(&self) -> ApiVersion {
        match self {
            Self::Offset(_) => ApiVersion::V1,
            Self::Cursor(_) => ApiVersion::V2,
        }
    }

    /// Query parameters for the next request.
    pub fn query(&self) -> Vec<(String, String)> {
        match self {
            Self::Offset(s) => s.query(),
            Self::Cursor(s) => s.query(),
        }
    }

    /// Consumes the continuation signals of `page`; false means stop.
    pub fn advance(&mut self, page: &Page) -> bool {
        if page.data.is_empty() {
            return false;
        }
        match self {
            Self::Offset(s) => s.advance(page),
            Self::Cursor(s) => s.advance(page),
        }
    }
}
