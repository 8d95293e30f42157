//! Parallel chunk access: fan one task per chunk out onto a scheduler,
//! wait for all of them, report the wall-clock time of the pass.
//!
//! Chunks are never shared between tasks, so a pass needs no locking
//! on the data path. Completion is a wait group: every task owns a
//! clone that is dropped whatever happens to the task, so one failing
//! chunk can never hang the join. Failures are collected and re-raised
//! to the caller once every peer has finished.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_utils::sync::WaitGroup;
use log::{info, warn};

use crate::chunk::DirectChunk;
use crate::column::Column;
use crate::error::AccessError;
use crate::sched::NodeScheduler;

/// Rows assigned to each of `chunks` tasks, split as evenly as
/// possible: every chunk receives `ceil(rows / chunks)` rows except
/// the last assigned one, which absorbs whatever remains. The counts
/// sum to `rows` exactly.
pub fn split_rows(rows: usize, chunks: usize) -> Vec<usize> {
    if chunks == 0 {
        return Vec::new();
    }
    let per_chunk = rows.div_ceil(chunks);
    let mut remaining = rows;
    (0..chunks)
        .map(|_| {
            let n = per_chunk.min(remaining);
            remaining -= n;
            n
        })
        .collect()
}

/// Writes `rows` ones into the column, one task per chunk: each chunk
/// receives its ceiling-division share and fills it from the chunk's
/// own start. Capacity is ensured up front on the calling thread; the
/// growth must never race the pass itself. Returns the elapsed time of
/// the fan-out/fan-in only.
pub fn generate(
    column: &mut Column,
    rows: usize,
    scheduler: &NodeScheduler,
) -> Result<Duration, AccessError> {
    column.ensure_capacity(rows)?;
    let counts = split_rows(rows, column.chunk_count());
    let expected_node = scheduler.node();

    let elapsed = run_pass(column, scheduler, move |index, chunk| {
        fill_chunk(chunk, counts[index], expected_node)
    })?;

    info!("generated {rows} rows in {elapsed:?}");
    Ok(elapsed)
}

/// Scans every chunk of the column, one task per chunk. The scan only
/// exists to produce memory traffic; its sentinel result is discarded.
pub fn read_pass(column: &Column, scheduler: &NodeScheduler) -> Result<Duration, AccessError> {
    run_pass(column, scheduler, |_, chunk| {
        scan_chunk(chunk);
        Ok(())
    })
}

/// Fan-out/fan-in skeleton shared by the pass kinds.
fn run_pass<F>(column: &Column, scheduler: &NodeScheduler, body: F) -> Result<Duration, AccessError>
where
    F: Fn(usize, &DirectChunk) -> Result<(), AccessError> + Send + Sync + 'static,
{
    let submitted = column.chunk_count();
    let failures: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let body = Arc::new(body);

    let start = Instant::now();
    let wg = WaitGroup::new();

    for (index, chunk) in column.chunks().iter().enumerate() {
        let chunk = Arc::clone(chunk);
        let failures = Arc::clone(&failures);
        let body = Arc::clone(&body);
        let wg = wg.clone();
        scheduler.submit(move || {
            // Dropped on every path out of this task, including panics
            // unwinding through it; the join below cannot hang.
            let _completion = wg;
            if let Err(e) = body(index, &chunk) {
                if let Ok(mut failures) = failures.lock() {
                    failures.push(format!("chunk {index}: {e}"));
                }
            }
        });
    }

    wg.wait();
    let elapsed = start.elapsed();

    let failures = std::mem::take(&mut *failures.lock().unwrap_or_else(|e| e.into_inner()));
    if failures.is_empty() {
        Ok(elapsed)
    } else {
        Err(AccessError::TaskFailed {
            submitted,
            failures,
        })
    }
}

fn fill_chunk(
    chunk: &DirectChunk,
    rows: usize,
    expected_node: Option<usize>,
) -> Result<(), AccessError> {
    if rows > chunk.capacity() {
        return Err(AccessError::OutOfBounds {
            position: rows,
            capacity: chunk.capacity(),
        });
    }

    // Observability only: a generation task running off-node means the
    // first-touch placement may not be what the caller asked for. The
    // affinity verification after the pass is the authoritative check.
    if let Some(node) = expected_node {
        let current = chunk.platform().current_node();
        if current != node {
            warn!("generation task for node {node} is running on node {current}");
        }
    }

    for r in 0..rows {
        // SAFETY: r < rows <= capacity, and this task is the chunk's
        // only writer during the pass.
        unsafe { chunk.write_unchecked(r, 1.0) };
    }
    Ok(())
}

fn scan_chunk(chunk: &DirectChunk) {
    let mut sentinel = false;
    for r in 0..chunk.capacity() {
        // SAFETY: r < capacity by loop bound; read-only pass.
        sentinel = std::hint::black_box(unsafe { chunk.read_unchecked(r) }) == 0.0;
    }
    std::hint::black_box(sentinel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{mmap_factory, node_alloc_factory};
    use crate::sched::{NodeScheduler, SchedulerRegistry};
    use crate::testing::MockPlatform;
    use strata_io::Platform;

    #[test]
    fn splitter_covers_every_row_exactly_once() {
        for (rows, chunks) in [(4096, 4), (10, 3), (1, 8), (0, 4), (7, 7), (100, 1)] {
            let counts = split_rows(rows, chunks);
            assert_eq!(counts.len(), chunks);
            assert_eq!(counts.iter().sum::<usize>(), rows);
            let per_chunk = rows.div_ceil(chunks);
            // Full share everywhere except a smaller final remainder.
            let mut seen_partial = false;
            for &n in &counts {
                assert!(n <= per_chunk);
                if seen_partial {
                    assert_eq!(n, 0);
                }
                if n < per_chunk {
                    seen_partial = true;
                }
            }
        }
    }

    #[test]
    fn splitter_handles_no_chunks() {
        assert!(split_rows(100, 0).is_empty());
    }

    #[test]
    fn generate_then_sum_is_exact() {
        let platform: Arc<dyn Platform> = MockPlatform::shared(2, 8);
        let scheduler = NodeScheduler::new(Arc::clone(&platform), Some(0), Some(2)).unwrap();
        let mut column = Column::new(1024, node_alloc_factory(platform, 0));

        let elapsed = generate(&mut column, 4096, &scheduler).unwrap();
        assert!(elapsed > Duration::ZERO);
        assert_eq!(column.chunk_count(), 4);
        assert_eq!(column.sum(), 4096.0);
        column.verify_node_affinity(Some(0)).unwrap();
    }

    #[test]
    fn generate_with_partial_last_chunk() {
        let platform: Arc<dyn Platform> = MockPlatform::shared(1, 4);
        let scheduler = NodeScheduler::new(Arc::clone(&platform), None, Some(2)).unwrap();
        let mut column = Column::new(16, mmap_factory(platform));

        // 40 rows over 3 chunks of 16: counts 14,14,12, each task
        // filling its own chunk from offset 0.
        generate(&mut column, 40, &scheduler).unwrap();
        assert_eq!(column.sum(), 40.0);
        let counts = split_rows(40, column.chunk_count());
        for (chunk, &count) in column.chunks().iter().zip(&counts) {
            for r in 0..chunk.capacity() {
                let expected = if r < count { 1.0 } else { 0.0 };
                assert_eq!(chunk.read(r).unwrap(), expected);
            }
        }
    }

    #[test]
    fn read_pass_completes_and_reports_time() {
        let platform: Arc<dyn Platform> = MockPlatform::shared(1, 4);
        let scheduler = NodeScheduler::new(Arc::clone(&platform), None, Some(2)).unwrap();
        let mut column = Column::new(64, mmap_factory(platform));
        generate(&mut column, 256, &scheduler).unwrap();

        let elapsed = read_pass(&column, &scheduler).unwrap();
        assert!(elapsed > Duration::ZERO);
    }

    #[test]
    fn failing_task_does_not_hang_the_join() {
        let platform: Arc<dyn Platform> = MockPlatform::shared(1, 4);
        let scheduler = NodeScheduler::new(Arc::clone(&platform), None, Some(2)).unwrap();
        let mut column = Column::new(16, mmap_factory(platform));
        column.ensure_capacity(64).unwrap();

        let err = run_pass(&column, &scheduler, |index, _chunk| {
            if index == 2 {
                Err(AccessError::OutOfBounds {
                    position: 99,
                    capacity: 16,
                })
            } else {
                Ok(())
            }
        })
        .unwrap_err();

        match err {
            AccessError::TaskFailed {
                submitted,
                failures,
            } => {
                assert_eq!(submitted, 4);
                assert_eq!(failures.len(), 1);
                assert!(failures[0].starts_with("chunk 2:"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn end_to_end_on_a_two_node_mock() {
        // 2 nodes, 4 chunks x 1024 on node 0, 4096 rows of 1.0:
        // exact sum and a passing affinity check.
        let platform: Arc<dyn Platform> = MockPlatform::shared(2, 8);
        let registry = SchedulerRegistry::new(Arc::clone(&platform));
        let scheduler = registry.scheduler_for(0).unwrap();
        let mut column = Column::new(1024, node_alloc_factory(platform, 0));

        generate(&mut column, 4096, &scheduler).unwrap();
        assert_eq!(column.sum(), 4096.0);
        column.verify_node_affinity(Some(0)).unwrap();
        read_pass(&column, &scheduler).unwrap();
    }
}
