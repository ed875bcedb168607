//! In-memory pagination of query results.

use serde::Serialize;

/// Largest page size a caller may ask for.
pub const MAX_LIMIT: i64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pagination {
    /// Zero-based page actually returned, after clamping.
    pub page: i64,
    /// Page size; 0 means "everything on one page".
    pub limit: i64,
    pub total: i64,
    pub total_pages: i64,
}

/// Slice `items` into the requested page.
///
/// `limit <= 0` returns everything as one page; otherwise `page` is clamped
/// into `[0, total_pages - 1]`.
pub fn paginate<T>(items: Vec<T>, page: i64, limit: i64) -> (Vec<T>, Pagination) {
    let total = items.len() as i64;

    if limit <= 0 {
        let pagination = Pagination {
            page: 0,
            limit: 0,
            total,
            total_pages: if total == 0 { 0 } else { 1 },
        };
        return (items, pagination);
    }

    let total_pages = (total + limit - 1) / limit;
    let page = page.clamp(0, (total_pages - 1).max(0));
    let offset = (page * limit).min(total) as usize;

    let slice = items
        .into_iter()
        .skip(offset)
        .take(limit as usize)
        .collect();

    (
        slice,
        Pagination {
            page,
            limit,
            total,
            total_pages,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_count_and_slice_length() {
        for total in 0..40i64 {
            for limit in 1..12i64 {
                let pages = (total + limit - 1) / limit;
                for page in 0..pages.max(1) {
                    let (slice, p) = paginate((0..total).collect::<Vec<_>>(), page, limit);
                    assert_eq!(p.total_pages, pages);
                    assert_eq!(p.total, total);
                    let expected = limit.min(total - page * limit).max(0);
                    assert_eq!(slice.len() as i64, expected, "total={} limit={} page={}", total, limit, page);
                }
            }
        }
    }

    #[test]
    fn test_page_is_clamped() {
        let (slice, p) = paginate((0..10).collect::<Vec<_>>(), 99, 4);
        assert_eq!(p.page, 2);
        assert_eq!(slice, vec![8, 9]);

        let (slice, p) = paginate((0..10).collect::<Vec<_>>(), -3, 4);
        assert_eq!(p.page, 0);
        assert_eq!(slice, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_non_positive_limit_returns_everything() {
        let (slice, p) = paginate((0..7).collect::<Vec<_>>(), 3, 0);
        assert_eq!(slice.len(), 7);
        assert_eq!((p.page, p.limit, p.total_pages), (0, 0, 1));

        let (slice, p) = paginate(Vec::<i32>::new(), 0, 0);
        assert!(slice.is_empty());
        assert_eq!(p.total_pages, 0);
    }
}
