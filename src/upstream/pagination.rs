//! Paginated aggregation
//!
//! Walks a cursor-paged list endpoint page by page until the collection is
//! complete, the page ceiling is hit, or the upstream cursor starts
//! repeating. Pages are fetched strictly in cursor order.

use std::{collections::HashSet, future::Future};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::UpstreamError;

pub const DEFAULT_MAX_PAGES: usize = 50;
pub const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub cursor: Option<String>,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<Value>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Completeness {
    Complete,
    /// Stopped at the page ceiling with more pages still available.
    Truncated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub items: Vec<Value>,
    pub pages: usize,
    pub completeness: Completeness,
}

impl Aggregation {
    pub fn is_complete(&self) -> bool {
        self.completeness == Completeness::Complete
    }

    pub fn truncated_reason(&self) -> Option<&'static str> {
        match self.completeness {
            Completeness::Complete => None,
            Completeness::Truncated => Some("ceiling reached"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageProgress {
    pub pages: usize,
    pub items: usize,
}

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("duplicate page detected: cursor {cursor:?} repeated after {pages} pages")]
    DuplicateCursor {
        cursor: String,
        pages: usize,
        items: Vec<Value>,
    },
    #[error("page {page} failed: {source}")]
    Upstream {
        page: usize,
        #[source]
        source: UpstreamError,
        items: Vec<Value>,
    },
    #[error("aggregation cancelled after {pages} pages")]
    Cancelled { pages: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Paginator {
    pub max_pages: usize,
    pub page_size: u32,
}

impl Default for Paginator {
    fn default() -> Self {
        Self {
            max_pages: DEFAULT_MAX_PAGES,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Paginator {
    pub fn new(max_pages: usize, page_size: u32) -> Self {
        Self {
            max_pages: max_pages.max(1),
            page_size: page_size.max(1),
        }
    }

    /// Collects every page produced by `fetch`. `on_page` is told about
    /// progress after each page lands.
    pub async fn collect<F, Fut, P, PFut>(
        &self,
        cancel: &CancellationToken,
        mut fetch: F,
        mut on_page: P,
    ) -> Result<Aggregation, AggregationError>
    where
        F: FnMut(PageRequest) -> Fut,
        Fut: Future<Output = Result<Page, UpstreamError>>,
        P: FnMut(PageProgress) -> PFut,
        PFut: Future<Output = ()>,
    {
        let mut items = Vec::new();
        let mut consumed = HashSet::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0;

        loop {
            if pages >= self.max_pages {
                warn!(
                    pages,
                    items = items.len(),
                    "aggregation stopped at page ceiling"
                );
                return Ok(Aggregation {
                    items,
                    pages,
                    completeness: Completeness::Truncated,
                });
            }
            if cancel.is_cancelled() {
                return Err(AggregationError::Cancelled { pages });
            }

            if let Some(current) = &cursor {
                consumed.insert(current.clone());
            }

            let request = PageRequest {
                cursor: cursor.clone(),
                limit: self.page_size,
            };
            let page = match fetch(request).await {
                Ok(page) => page,
                Err(UpstreamError::Cancelled) => return Err(AggregationError::Cancelled { pages }),
                Err(source) => {
                    return Err(AggregationError::Upstream {
                        page: pages + 1,
                        source,
                        items,
                    })
                }
            };

            pages += 1;
            let full = page.items.len() >= self.page_size as usize;
            items.extend(page.items);
            on_page(PageProgress {
                pages,
                items: items.len(),
            })
            .await;

            match page.next_cursor {
                Some(next) if full => {
                    if consumed.contains(&next) {
                        warn!(pages, cursor = %next, "upstream repeated a page cursor");
                        return Err(AggregationError::DuplicateCursor {
                            cursor: next,
                            pages,
                            items,
                        });
                    }
                    cursor = Some(next);
                }
                _ => {
                    info!(pages, items = items.len(), "aggregation complete");
                    return Ok(Aggregation {
                        items,
                        pages,
                        completeness: Completeness::Complete,
                    });
                }
            }
        }
    }
}
