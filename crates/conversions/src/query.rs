//! Listing types: filters, pagination and result pages.
//!
//! All listings are owner-scoped and paginated by default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fitswap_core::UserId;

use crate::record::{ConversionRecord, ConversionStatus};

const DEFAULT_LIMIT: u32 = 20;
const MAX_LIMIT: u32 = 100;

/// Pagination parameters for conversion listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of records to return.
    pub limit: u32,
    /// Offset for pagination (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

/// Filter criteria for conversion listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionFilter {
    /// Owner; listings never cross users.
    pub user_id: UserId,
    pub status: Option<ConversionStatus>,
    pub created_after: Option<DateTime<Utc>>,
}

impl ConversionFilter {
    pub fn for_user(user_id: UserId) -> Self {
        Self {
            user_id,
            status: None,
            created_after: None,
        }
    }

    pub fn with_status(mut self, status: ConversionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn created_after(mut self, at: DateTime<Utc>) -> Self {
        self.created_after = Some(at);
        self
    }

    pub fn matches(&self, record: &ConversionRecord) -> bool {
        record.user_id == self.user_id
            && self.status.is_none_or(|s| record.status == s)
            && self.created_after.is_none_or(|at| record.created_at > at)
    }
}

/// One page of a listing, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionPage {
    pub items: Vec<ConversionRecord>,
    /// Total number of records matching the filter (across all pages).
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

impl ConversionPage {
    /// Sort `matching` newest first and cut the requested page out of it.
    pub fn paginate(mut matching: Vec<ConversionRecord>, pagination: Pagination) -> Self {
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len() as u64;
        let offset = pagination.offset as usize;
        let items: Vec<_> = matching
            .into_iter()
            .skip(offset)
            .take(pagination.limit as usize)
            .collect();
        let has_more = (offset + items.len()) < total as usize;

        Self {
            items,
            total,
            pagination,
            has_more,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::NewConversion;
    use chrono::Duration;
    use fitswap_core::{ConversionId, ImageId};

    fn record_at(user: UserId, minutes_ago: i64) -> ConversionRecord {
        let new = NewConversion::new(user, ImageId::new(), ImageId::new(), None);
        ConversionRecord::new(
            ConversionId::new(),
            new,
            Utc::now() - Duration::minutes(minutes_ago),
        )
    }

    #[test]
    fn pagination_is_capped() {
        assert_eq!(Pagination::new(Some(10_000), None).limit, MAX_LIMIT);
        assert_eq!(Pagination::new(Some(0), None).limit, 1);
        assert_eq!(Pagination::new(None, Some(7)), Pagination { limit: DEFAULT_LIMIT, offset: 7 });
    }

    #[test]
    fn filter_is_owner_scoped() {
        let alice = UserId::new();
        let bob = UserId::new();
        let filter = ConversionFilter::for_user(alice).with_status(ConversionStatus::Pending);

        assert!(filter.matches(&record_at(alice, 1)));
        assert!(!filter.matches(&record_at(bob, 1)));
    }

    #[test]
    fn pages_are_newest_first_with_has_more() {
        let user = UserId::new();
        let records: Vec<_> = (0..5).map(|m| record_at(user, m)).collect();
        let newest = records[0].id;

        let page = ConversionPage::paginate(records.clone(), Pagination::new(Some(2), None));
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].id, newest);
        assert!(page.has_more);

        let last = ConversionPage::paginate(records, Pagination::new(Some(2), Some(4)));
        assert_eq!(last.items.len(), 1);
        assert!(!last.has_more);
    }
}
