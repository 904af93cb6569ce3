//! Combine per-node results of a clustered run.

use rowflow_types::PipelineResult;

/// Sum counters, concatenate rows, files and step statuses, AND the success
/// flags, keep the first failure and the longest duration.
#[must_use]
pub fn aggregate_results<I>(results: I) -> PipelineResult
where
    I: IntoIterator<Item = PipelineResult>,
{
    let mut total = PipelineResult::default();
    for result in results {
        total.nr_errors += result.nr_errors;
        total.lines_input += result.lines_input;
        total.lines_output += result.lines_output;
        total.lines_updated += result.lines_updated;
        total.lines_read += result.lines_read;
        total.lines_written += result.lines_written;
        total.lines_rejected += result.lines_rejected;
        total.result_rows.extend(result.result_rows);
        total.result_files.extend(result.result_files);
        total.steps.extend(result.steps);
        total.success &= result.success;
        total.stopped |= result.stopped;
        total.duration_secs = total.duration_secs.max(result.duration_secs);
        if total.failure.is_none() {
            total.failure = result.failure;
        }
    }
    if total.nr_errors > 0 {
        total.success = false;
    }
    total
}
