//! Incremental daily statistics.
//!
//! A [`DailyAggregate`] is folded one reading at a time. The running mean is
//! count-weighted, so after `n` applications the mean equals the arithmetic
//! mean of all `n` values no matter the order they arrived in. That only holds
//! if `prior_count` is the exact number of readings already folded in, and if
//! updates to the same bucket never interleave.

/// High, low and mean temperature over one bucket, plus how many readings were folded in.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DailyAggregate {
    pub high: f64,
    pub low: f64,
    pub avg: f64,
    pub count: u64,
}

impl DailyAggregate {
    /// Aggregate of a single reading.
    pub fn first(value: f64) -> Self {
        Self {
            high: value,
            low: value,
            avg: value,
            count: 1,
        }
    }

    /// Fold one more reading into the aggregate.
    ///
    /// `prior_count` is the number of readings already represented by `self`.
    /// An existing aggregate always represents at least one reading, so a count
    /// of zero is treated as one.
    pub fn apply(&self, value: f64, prior_count: u64) -> Self {
        let prior = prior_count.max(1);
        let weight = prior as f64;

        Self {
            high: self.high.max(value),
            low: self.low.min(value),
            avg: (self.avg * weight + value) / (weight + 1.0),
            count: prior + 1,
        }
    }

    /// Aggregate over a full set of values, or `None` if there are none.
    pub fn from_values<I>(values: I) -> Option<Self>
    where
        I: IntoIterator<Item = f64>,
    {
        let mut values = values.into_iter();
        let first = values.next()?;
        let mut sum = first;
        let mut agg = Self::first(first);

        for value in values {
            sum += value;
            agg.high = agg.high.max(value);
            agg.low = agg.low.min(value);
            agg.count += 1;
        }

        agg.avg = sum / agg.count as f64;
        Some(agg)
    }

    /// Whether two aggregates agree within `tolerance` on every statistic.
    pub fn approx_eq(&self, other: &Self, tolerance: f64) -> bool {
        self.count == other.count
            && (self.high - other.high).abs() <= tolerance
            && (self.low - other.low).abs() <= tolerance
            && (self.avg - other.avg).abs() <= tolerance
    }
}

/// What the store has to do with a bucket after a reading is applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatsChange {
    /// No aggregate existed; create this one.
    Insert(DailyAggregate),
    /// Replace the existing aggregate with this one.
    Update(DailyAggregate),
}

impl StatsChange {
    /// The aggregate to persist.
    pub fn aggregate(&self) -> &DailyAggregate {
        match self {
            StatsChange::Insert(agg) | StatsChange::Update(agg) => agg,
        }
    }
}

/// Compute the next aggregate for a bucket and decide insert vs update.
pub fn next_aggregate(
    existing: Option<&DailyAggregate>,
    value: f64,
    prior_count: u64,
) -> StatsChange {
    match existing {
        Some(agg) => StatsChange::Update(agg.apply(value, prior_count)),
        None => StatsChange::Insert(DailyAggregate::first(value)),
    }
}
