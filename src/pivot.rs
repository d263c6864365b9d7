//! Temporal Pivot
//!
//! Reshapes long (category, period, value) rows into one row per category and one
//! column per period over a fixed contiguous range. Absent combinations are zero.
//! Rounding to display units happens here and nowhere upstream.

use crate::aggregator::{BucketRow, ColumnKey};
use crate::error::{AttributionError, Result};
use crate::model::Period;
use polars::prelude::*;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Header of the single value column in an overall table.
pub const OVERALL_COLUMN: &str = "Total";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "layout", rename_all = "snake_case")]
pub enum ColumnLayout {
    /// One value column summed over every period.
    Overall,
    /// One column per period, `start..=end`.
    Periods { start: Period, end: Period },
}

impl ColumnLayout {
    pub fn validate(&self) -> Result<()> {
        match self {
            ColumnLayout::Periods { start, end } if start > end => Err(AttributionError::Config(
                format!("period range {}..={} is empty", start, end),
            )),
            _ => Ok(()),
        }
    }

    /// Column a credit stamped with `period` lands in; `None` if outside the range.
    pub fn column_for(&self, period: Period) -> Option<ColumnKey> {
        match self {
            ColumnLayout::Overall => Some(None),
            ColumnLayout::Periods { start, end } => {
                (*start..=*end).contains(&period).then_some(Some(period))
            }
        }
    }

    pub fn columns(&self) -> Vec<ColumnKey> {
        match self {
            ColumnLayout::Overall => vec![None],
            ColumnLayout::Periods { start, end } => (*start..=*end).map(Some).collect(),
        }
    }

    pub fn headers(&self) -> Vec<String> {
        self.columns()
            .into_iter()
            .map(|c| match c {
                Some(period) => period.to_string(),
                None => OVERALL_COLUMN.to_string(),
            })
            .collect()
    }
}

/// Round to the nearest whole display unit, ties to even.
pub fn round_display(value: Decimal) -> i64 {
    value
        .round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven)
        .to_i64()
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRow {
    pub labels: Vec<String>,
    pub values: Vec<i64>,
}

/// A finished report table: fixed row order, rounded display values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Table {
    pub title: String,
    pub label_headers: Vec<String>,
    pub columns: Vec<String>,
    pub rows: Vec<TableRow>,
}

impl Table {
    /// Row whose first label is `label`.
    pub fn row(&self, label: &str) -> Option<&TableRow> {
        self.rows
            .iter()
            .find(|r| r.labels.first().map(String::as_str) == Some(label))
    }

    pub fn value(&self, label: &str, column: &str) -> Option<i64> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.row(label).and_then(|r| r.values.get(index).copied())
    }

    pub fn row_labels(&self) -> Vec<String> {
        self.rows.iter().map(|r| r.labels.join(" / ")).collect()
    }

    pub fn to_dataframe(&self) -> Result<DataFrame> {
        let mut series = Vec::with_capacity(self.label_headers.len() + self.columns.len());
        for (i, header) in self.label_headers.iter().enumerate() {
            let labels: Vec<&str> = self
                .rows
                .iter()
                .map(|r| r.labels.get(i).map(String::as_str).unwrap_or(""))
                .collect();
            series.push(Series::new(header, labels));
        }
        for (i, header) in self.columns.iter().enumerate() {
            let values: Vec<i64> = self
                .rows
                .iter()
                .map(|r| r.values.get(i).copied().unwrap_or_default())
                .collect();
            series.push(Series::new(header, values));
        }
        Ok(DataFrame::new(series)?)
    }
}

/// One cell of the long relation; `row` indexes the table's row list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongRow {
    pub row: usize,
    pub column: ColumnKey,
    pub value: Decimal,
}

/// Pivot long rows into a wide table with one row per entry of `row_labels`.
///
/// Cells are addressed by row position, never by label, so two rows sharing a
/// label keep their own values. Values are summed exactly per cell before
/// rounding. Cells outside `layout` or past the last row are ignored.
pub fn pivot(
    title: &str,
    label_headers: Vec<String>,
    long: &[LongRow],
    row_labels: &[Vec<String>],
    layout: &ColumnLayout,
) -> Table {
    let columns = layout.columns();
    let column_index: HashMap<ColumnKey, usize> =
        columns.iter().enumerate().map(|(i, c)| (*c, i)).collect();

    let mut cells = vec![vec![Decimal::ZERO; columns.len()]; row_labels.len()];
    for cell in long {
        if let (Some(row), Some(i)) = (cells.get_mut(cell.row), column_index.get(&cell.column)) {
            row[*i] += cell.value;
        }
    }

    let rows = row_labels
        .iter()
        .zip(cells)
        .map(|(labels, cell)| TableRow {
            labels: labels.clone(),
            values: cell.into_iter().map(round_display).collect(),
        })
        .collect();

    Table {
        title: title.to_string(),
        label_headers,
        columns: layout.headers(),
        rows,
    }
}

/// Pivot bucketized rows, keeping their order.
pub fn pivot_buckets(title: &str, label_header: &str, buckets: &[BucketRow], layout: &ColumnLayout) -> Table {
    let long: Vec<LongRow> = buckets
        .iter()
        .enumerate()
        .flat_map(|(row, b)| {
            b.values.iter().map(move |(column, value)| LongRow {
                row,
                column: *column,
                value: *value,
            })
        })
        .collect();
    let labels: Vec<Vec<String>> = buckets.iter().map(|b| vec![b.label.clone()]).collect();
    pivot(title, vec![label_header.to_string()], &long, &labels, layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::BucketKind;
    use std::collections::BTreeMap;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_round_display_ties_to_even() {
        assert_eq!(round_display(dec("0.5")), 0);
        assert_eq!(round_display(dec("1.5")), 2);
        assert_eq!(round_display(dec("2.5")), 2);
        assert_eq!(round_display(dec("2.500000000001")), 3);
        assert_eq!(round_display(dec("0.75")), 1);
    }

    #[test]
    fn test_pivot_zero_fills_absent_periods() {
        let layout = ColumnLayout::Periods { start: 2015, end: 2018 };
        let long = vec![
            LongRow { row: 0, column: Some(2015), value: dec("3.4") },
            LongRow { row: 0, column: Some(2017), value: dec("1.6") },
            LongRow { row: 0, column: Some(2030), value: dec("9") },
        ];
        let table = pivot("t", vec!["Country".into()], &long, &[vec!["US".into()], vec!["CA".into()]], &layout);
        assert_eq!(table.columns, vec!["2015", "2016", "2017", "2018"]);
        assert_eq!(table.rows[0].values, vec![3, 0, 2, 0]);
        assert_eq!(table.rows[1].values, vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_rounding_happens_after_summing() {
        let layout = ColumnLayout::Overall;
        let long: Vec<LongRow> = (0..4)
            .map(|_| LongRow { row: 0, column: None, value: dec("0.375") })
            .collect();
        let table = pivot("t", vec!["Country".into()], &long, &[vec!["US".into()]], &layout);
        // 4 * 0.375 = 1.5 -> 2; rounding each cell first would give 0
        assert_eq!(table.value("US", OVERALL_COLUMN), Some(2));
    }

    #[test]
    fn test_pivot_buckets_and_dataframe() {
        let layout = ColumnLayout::Periods { start: 2015, end: 2016 };
        let buckets = vec![
            BucketRow::new("Total", BucketKind::Total)
                .with_values(BTreeMap::from([(Some(2015), dec("2")), (Some(2016), dec("1"))])),
            BucketRow::new("US", BucketKind::Named).with_values(BTreeMap::from([(Some(2016), dec("1"))])),
        ];
        let table = pivot_buckets("Repos by Country", "Country", &buckets, &layout);
        assert_eq!(table.row_labels(), vec!["Total", "US"]);
        assert_eq!(table.value("US", "2015"), Some(0));
        let df = table.to_dataframe().unwrap();
        assert_eq!(df.shape(), (2, 3));
    }

    #[test]
    fn test_rows_sharing_a_label_keep_their_own_values() {
        let layout = ColumnLayout::Overall;
        let buckets = vec![
            BucketRow::new("All Other", BucketKind::Named).with_values(BTreeMap::from([(None, dec("1"))])),
            BucketRow::new("All Other", BucketKind::AllOther).with_values(BTreeMap::from([(None, dec("3"))])),
        ];
        let table = pivot_buckets("t", "Organization", &buckets, &layout);
        assert_eq!(table.rows[0].values, vec![1]);
        assert_eq!(table.rows[1].values, vec![3]);
    }

    #[test]
    fn test_layout_validation_and_serde() {
        assert!(ColumnLayout::Periods { start: 2020, end: 2019 }.validate().is_err());
        let layout: ColumnLayout =
            serde_json::from_str(r#"{"layout":"periods","start":2015,"end":2017}"#).unwrap();
        assert_eq!(layout.column_for(2016), Some(Some(2016)));
        assert_eq!(layout.column_for(2014), None);
        assert_eq!(ColumnLayout::Overall.column_for(1999), Some(None));
    }
}
