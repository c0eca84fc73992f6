//! Downsampling strategies
//!
//! Reducing a high-detail block of columns to one coarse column is a policy
//! decision, so it lives behind a trait instead of being baked into the
//! storage type. Strategies must be deterministic: aggregating the same
//! block twice has to produce the same column.

use crate::datapoint::DataPoint;
use crate::source::accessor::{ColumnAccessor, SourceView};

/// Aggregates one block of source columns into a single target column.
/// Output points are in the *source's* id space; the caller remaps them.
pub trait DownsampleStrategy: Send + Sync {
    fn aggregate(&self, block: &SourceView<'_>) -> Vec<DataPoint>;
}

/// Picks the first populated column of the block as the representative.
///
/// This is a deliberate simplification: a weighted aggregate over the whole
/// block would be more faithful at steep terrain transitions. Swap in a
/// different strategy to change the policy.
#[derive(Debug, Default)]
pub struct RepresentativeColumn;

impl DownsampleStrategy for RepresentativeColumn {
    fn aggregate(&self, block: &SourceView<'_>) -> Vec<DataPoint> {
        for z in 0..block.width() {
            for x in 0..block.width() {
                let column = block.get(x, z);
                if !column.is_empty() {
                    return column.to_vec();
                }
            }
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datapoint::IdMap;

    #[test]
    fn test_representative_skips_empty_columns() {
        let id_map = IdMap::new();
        let mut columns: Vec<Vec<DataPoint>> = vec![Vec::new(); 4];
        columns[2] = vec![DataPoint::new(1, 80, 0, 15, 0, 3)];
        let view = SourceView::new(&columns, 2, &id_map, 0, 0, 2);

        let strategy = RepresentativeColumn;
        let out = strategy.aggregate(&view);
        assert_eq!(out, columns[2]);
        // deterministic
        assert_eq!(strategy.aggregate(&view), out);
    }

    #[test]
    fn test_all_empty_block_yields_empty_column() {
        let id_map = IdMap::new();
        let columns: Vec<Vec<DataPoint>> = vec![Vec::new(); 4];
        let view = SourceView::new(&columns, 2, &id_map, 0, 0, 2);
        assert!(RepresentativeColumn.aggregate(&view).is_empty());
    }
}
