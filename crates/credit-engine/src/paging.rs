//! Pagination helpers shared by the listing operations.

use serde::Serialize;

use crate::error::{EngineError, Result};

/// Largest page size any listing accepts.
pub const MAX_PAGE_SIZE: usize = 1000;

/// One page of a listing together with the total number of matches.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    /// Total number of matching items across all pages.
    pub total: u64,

    /// Items on this page.
    pub items: Vec<T>,
}

/// Translate a 1-based page number and page size into `(limit, offset)`.
pub(crate) fn bounds(page: usize, limit: usize) -> Result<(usize, usize)> {
    if page == 0 {
        return Err(EngineError::Validation("page numbers start at 1".into()));
    }
    if limit == 0 || limit > MAX_PAGE_SIZE {
        return Err(EngineError::Validation(format!(
            "page size must be between 1 and {MAX_PAGE_SIZE}"
        )));
    }
    Ok((limit, (page - 1).saturating_mul(limit)))
}
