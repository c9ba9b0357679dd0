use std::collections::BTreeMap;

use crate::validator::ValidationResult;

use super::protocol::{AggregatedStatsData, TopFile};

const TOP_FILES: usize = 10;

/// Running totals over every validation batch seen so far.
#[derive(Debug, Default)]
pub struct Aggregator {
    total_validations: u64,
    total_errors: u64,
    total_warnings: u64,
    by_file: BTreeMap<String, u64>,
    by_type: BTreeMap<String, u64>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one batch into the totals and return the updated rollup.
    pub fn record_batch(&mut self, results: &[ValidationResult]) -> AggregatedStatsData {
        for result in results {
            self.total_validations += 1;
            self.total_errors += result.errors.len() as u64;
            self.total_warnings += result.warnings.len() as u64;
            *self
                .by_file
                .entry(result.file_path.display().to_string())
                .or_default() += 1;
            *self
                .by_type
                .entry(result.validation_type.as_str().to_owned())
                .or_default() += 1;
        }
        self.snapshot()
    }

    pub fn snapshot(&self) -> AggregatedStatsData {
        let mut top: Vec<TopFile> = self
            .by_file
            .iter()
            .map(|(path, count)| TopFile {
                path: path.clone(),
                validation_count: *count,
            })
            .collect();
        // BTreeMap iteration is path-ordered, so a stable sort breaks ties by path.
        top.sort_by(|a, b| b.validation_count.cmp(&a.validation_count));
        top.truncate(TOP_FILES);

        AggregatedStatsData {
            total_validations: self.total_validations,
            total_errors: self.total_errors,
            total_warnings: self.total_warnings,
            file_path_stats: self.by_file.clone(),
            validation_type_stats: self.by_type.clone(),
            top_error_files: top,
        }
    }
}
