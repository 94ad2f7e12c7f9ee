//! Query builder for the reading log.
//!
//! # Example
//!
//! ```
//! use tempstat_store::{Store, ReadingQuery};
//! use time::{OffsetDateTime, Duration};
//!
//! let store = Store::open_in_memory()?;
//! let yesterday = OffsetDateTime::now_utc() - Duration::hours(24);
//!
//! let query = ReadingQuery::new()
//!     .device("0b6a3a52-4a5e-4f3c-9d1e-1f2a3b4c5d6e")
//!     .since(yesterday)
//!     .limit(50);
//!
//! let readings = store.query_readings(&query)?;
//! assert!(readings.is_empty());
//! # Ok::<(), tempstat_store::Error>(())
//! ```

use time::OffsetDateTime;

use crate::store::to_millis;

/// Fluent query builder for stored readings.
///
/// By default results are ordered by `recorded_at` descending (newest first).
#[derive(Debug, Default, Clone)]
pub struct ReadingQuery {
    /// Filter by device ID.
    pub device_id: Option<String>,
    /// Readings at or after this instant.
    pub since: Option<OffsetDateTime>,
    /// Readings strictly before this instant.
    pub until: Option<OffsetDateTime>,
    /// Maximum number of results.
    pub limit: Option<u32>,
    /// Offset for pagination.
    pub offset: Option<u32>,
    /// Order by recorded_at descending.
    pub newest_first: bool,
}

impl ReadingQuery {
    /// Create a new query: all devices, no time range, newest first.
    pub fn new() -> Self {
        Self {
            newest_first: true,
            ..Default::default()
        }
    }

    pub fn device(mut self, device_id: &str) -> Self {
        self.device_id = Some(device_id.to_string());
        self
    }

    pub fn since(mut self, time: OffsetDateTime) -> Self {
        self.since = Some(time);
        self
    }

    /// Exclusive upper bound, so `since(start).until(end)` selects `[start, end)`.
    pub fn until(mut self, time: OffsetDateTime) -> Self {
        self.until = Some(time);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Order results chronologically.
    pub fn oldest_first(mut self) -> Self {
        self.newest_first = false;
        self
    }

    pub(crate) fn build_where(&self) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(ref device_id) = self.device_id {
            conditions.push("device_id = ?");
            params.push(Box::new(device_id.clone()));
        }

        if let Some(since) = self.since {
            conditions.push("recorded_at_ms >= ?");
            params.push(Box::new(to_millis(since)));
        }

        if let Some(until) = self.until {
            conditions.push("recorded_at_ms < ?");
            params.push(Box::new(to_millis(until)));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    pub(crate) fn build_sql(&self) -> String {
        let (where_clause, _) = self.build_where();
        let order = if self.newest_first { "DESC" } else { "ASC" };

        let mut sql = format!(
            "SELECT id, device_id, temperature, recorded_at_ms FROM readings {} \
             ORDER BY recorded_at_ms {}, id {}",
            where_clause, order, order
        );

        // SQLite only accepts OFFSET after a LIMIT.
        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset)),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {}", limit)),
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
            (None, None) => {}
        }

        sql
    }
}
