//! Merge-query layer: consistent paginated views across both stores.
//!
//! The archive supplies the base set and the FastStore the overlay; an
//! overlay record replaces its base counterpart only when its timestamp is
//! greater-or-equal, so the freshest copy wins regardless of which store it
//! lives in. Search, sort and pagination are applied to the merged set.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::record::HistoryRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    Timestamp,
    Title,
    WatchedTime,
    Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Parameters for one page of the merged history view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRequest {
    /// 1-based page number; out-of-range values are clamped, never an error.
    pub page: usize,
    pub page_size: usize,
    /// Case-insensitive substring matched against titles.
    #[serde(default)]
    pub search: Option<String>,
    pub sort_field: SortField,
    pub sort_order: SortOrder,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 20,
            search: None,
            sort_field: SortField::Timestamp,
            sort_order: SortOrder::Descending,
        }
    }
}

/// One page of merged results plus pagination metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub records: Vec<HistoryRecord>,
    /// The clamped page actually returned.
    pub page: usize,
    pub total_pages: usize,
    pub total_records: usize,
    pub page_size: usize,
    pub has_next: bool,
    pub has_prev: bool,
}

impl HistoryPage {
    fn empty(page_size: usize) -> Self {
        Self {
            records: Vec::new(),
            page: 1,
            total_pages: 0,
            total_records: 0,
            page_size,
            has_next: false,
            has_prev: false,
        }
    }
}

/// Merge the archive base set with the FastStore overlay by id.
///
/// The overlay copy wins on a greater-or-equal timestamp; a strictly newer
/// base copy (e.g. hydrated elsewhere after a stale local write) survives.
pub(crate) fn merge_sets(
    base: Vec<HistoryRecord>,
    overlay: Vec<HistoryRecord>,
) -> Vec<HistoryRecord> {
    let mut merged: HashMap<String, HistoryRecord> =
        base.into_iter().map(|r| (r.id().to_string(), r)).collect();

    for record in overlay {
        match merged.get(record.id()) {
            Some(existing) if record.timestamp() < existing.timestamp() => {}
            _ => {
                merged.insert(record.id().to_string(), record);
            }
        }
    }

    merged.into_values().collect()
}

pub(crate) fn sort_records(records: &mut [HistoryRecord], field: SortField, order: SortOrder) {
    records.sort_by(|a, b| {
        let ordering = match field {
            SortField::Timestamp => a.timestamp().cmp(&b.timestamp()),
            SortField::Title => a.title().to_lowercase().cmp(&b.title().to_lowercase()),
            SortField::WatchedTime => a.watched_seconds().cmp(&b.watched_seconds()),
            SortField::Duration => a.duration_seconds().cmp(&b.duration_seconds()),
        };
        // Ties fall back to id so paging is stable across calls.
        let ordering = ordering.then_with(|| a.id().cmp(b.id()));
        match order {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        }
    });
}

/// Slice a fully merged, sorted result set into the requested page, clamping
/// the page number into `[1, total_pages]`.
pub(crate) fn paginate(mut records: Vec<HistoryRecord>, request: &PageRequest) -> HistoryPage {
    let page_size = request.page_size.max(1);
    let total_records = records.len();

    if total_records == 0 {
        return HistoryPage::empty(page_size);
    }

    let total_pages = total_records.div_ceil(page_size);
    let page = request.page.clamp(1, total_pages);

    let start = (page - 1) * page_size;
    let end = (start + page_size).min(total_records);
    let records = records.drain(start..end).collect();

    HistoryPage {
        records,
        page,
        total_pages,
        total_records,
        page_size,
        has_next: page < total_pages,
        has_prev: page > 1,
    }
}

impl super::HistoryEngine {
    /// Paginated merged view over the archive base set and the FastStore
    /// overlay.
    ///
    /// Archive unavailability degrades to an empty base set rather than an
    /// error, so the FastStore contents always remain reachable. Tombstoned
    /// ids are suppressed from the merged set regardless of which store still
    /// holds a copy.
    #[tracing::instrument(skip(self, request), fields(kind = %kind, page = request.page))]
    pub async fn query_history(
        &self,
        kind: crate::record::RecordKind,
        request: &PageRequest,
    ) -> Result<HistoryPage, crate::storage::traits::StorageError> {
        let _timer = crate::metrics::LatencyTimer::new("engine", "query");
        let search = request.search.as_deref();

        let base = match self.archive {
            Some(ref archive) => match archive.query_records(kind, search).await {
                Ok(records) => records,
                Err(e) => {
                    tracing::warn!(error = %e, "archive query failed, serving FastStore only");
                    crate::metrics::record_operation("archive", "query", "error");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let overlay = self.fast_records(kind).await?;
        let tombstoned = self.fast_tombstoned_ids(kind).await?;

        let mut merged: Vec<HistoryRecord> = merge_sets(base, overlay)
            .into_iter()
            .filter(|r| !tombstoned.contains(r.id()))
            .filter(|r| search.map_or(true, |needle| r.title_matches(needle)))
            .collect();

        sort_records(&mut merged, request.sort_field, request.sort_order);
        crate::metrics::record_operation("engine", "query", "success");
        Ok(paginate(merged, request))
    }

    /// Ids with a live tombstone in the FastStore, per kind.
    pub(super) async fn fast_tombstoned_ids(
        &self,
        kind: crate::record::RecordKind,
    ) -> Result<std::collections::HashSet<String>, crate::storage::traits::StorageError> {
        Ok(self
            .fast
            .keys()
            .await?
            .into_iter()
            .filter_map(|key| {
                crate::record::keys::parse_tombstone(&key)
                    .and_then(|(k, id)| (k == kind).then(|| id.to_string()))
            })
            .collect())
    }
}
