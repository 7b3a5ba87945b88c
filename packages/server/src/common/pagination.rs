//! Offset pagination for job queries.

use serde::{Deserialize, Serialize};

const DEFAULT_LIMIT: i64 = 25;
const MAX_LIMIT: i64 = 200;

/// Page request with clamped limit/offset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    pub fn new(limit: i64, offset: i64) -> Self {
        Self {
            limit: limit.clamp(1, MAX_LIMIT),
            offset: offset.max(0),
        }
    }

    pub fn first(limit: i64) -> Self {
        Self::new(limit, 0)
    }

    /// SQL LIMIT value: one extra row to detect whether more remain.
    pub fn fetch_limit(&self) -> i64 {
        self.limit + 1
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

/// One page of results plus the total match count.
#[derive(Debug, Clone, Serialize)]
pub struct PageResult<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
    pub has_more: bool,
}

impl<T> PageResult<T> {
    /// Build a page from `fetch_limit()`-sized results, trimming the
    /// sentinel row.
    pub fn from_rows(mut rows: Vec<T>, total: i64, page: &Page) -> Self {
        let has_more = rows.len() as i64 > page.limit;
        if has_more {
            rows.truncate(page.limit as usize);
        }
        Self {
            items: rows,
            total,
            limit: page.limit,
            offset: page.offset,
            has_more,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_clamps_limit_and_offset() {
        let page = Page::new(1000, -5);
        assert_eq!(page.limit, MAX_LIMIT);
        assert_eq!(page.offset, 0);

        let page = Page::new(0, 10);
        assert_eq!(page.limit, 1);
    }

    #[test]
    fn default_page_is_first_25() {
        let page = Page::default();
        assert_eq!(page.limit, 25);
        assert_eq!(page.offset, 0);
    }

    #[test]
    fn from_rows_trims_sentinel_row() {
        let page = Page::first(3);
        let result = PageResult::from_rows(vec![1, 2, 3, 4], 10, &page);
        assert_eq!(result.items, vec![1, 2, 3]);
        assert!(result.has_more);

        let result = PageResult::from_rows(vec![1, 2], 2, &page);
        assert_eq!(result.items.len(), 2);
        assert!(!result.has_more);
    }
}
