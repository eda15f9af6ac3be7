//! Bounded concurrent execution of section kernels.
//!
//! Sections are pulled from a shared queue by at most `max_workers` scoped
//! threads. Each worker sends its `SectionResult` over one channel to the
//! calling thread, which is the only writer of the result map. A section
//! that errors or panics becomes a failed result; it never stops its
//! siblings.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Instant;

use super::kernel::SectionRunner;
use super::types::SectionResult;
use crate::pipeline::chunks::Chunk;
use crate::pipeline::sections::Section;

/// Error recorded for sections never started because the run was cancelled.
pub const CANCELLED_ERROR: &str = "cancelled";

/// Cooperative cancellation at the scheduler boundary.
///
/// In-flight kernel calls are not interrupted; sections not yet started are
/// reported as failed.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    Started { total: usize, workers: usize },
    SectionFinished {
        section_id: usize,
        success: bool,
        completed: usize,
        total: usize,
    },
    Completed { succeeded: usize, failed: usize },
}

type ProgressFn = dyn Fn(&SchedulerEvent) + Send + Sync;

pub struct SectionScheduler {
    max_workers: usize,
    progress: Option<Box<ProgressFn>>,
    cancellation: Option<CancellationToken>,
}

impl SectionScheduler {
    /// `max_workers` of 0 is treated as 1.
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
            progress: None,
            cancellation: None,
        }
    }

    /// Progress callback, invoked on the calling thread.
    pub fn with_progress<F>(mut self, progress: F) -> Self
    where
        F: Fn(&SchedulerEvent) + Send + Sync + 'static,
    {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Run every section and return one result per section id.
    pub fn run_all(
        &self,
        runner: &dyn SectionRunner,
        sections: &[Section],
        chunks: &[Chunk],
        transcript: &str,
    ) -> BTreeMap<usize, SectionResult> {
        let total = sections.len();
        let mut results: BTreeMap<usize, SectionResult> = BTreeMap::new();
        if total == 0 {
            self.emit(&SchedulerEvent::Completed {
                succeeded: 0,
                failed: 0,
            });
            return results;
        }

        let workers = self.max_workers.min(total);
        let _span = tracing::info_span!("schedule", sections = total, workers).entered();
        let start = Instant::now();
        self.emit(&SchedulerEvent::Started { total, workers });

        let queue: Mutex<VecDeque<&Section>> = Mutex::new(sections.iter().collect());
        let cancellation = self.cancellation.as_ref();
        let (tx, rx) = mpsc::channel::<SectionResult>();

        std::thread::scope(|scope| {
            for worker in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                scope.spawn(move || {
                    while let Some(section) = next_section(queue) {
                        let result = if cancellation.is_some_and(|c| c.is_cancelled()) {
                            SectionResult::failed(section, CANCELLED_ERROR, 0)
                        } else {
                            run_isolated(runner, section, chunks, transcript)
                        };
                        tracing::debug!(worker, section_id = section.id, "Worker finished section");
                        if tx.send(result).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);

            for result in rx {
                let section_id = result.section_id;
                let success = result.is_success();
                results.insert(section_id, result);
                self.emit(&SchedulerEvent::SectionFinished {
                    section_id,
                    success,
                    completed: results.len(),
                    total,
                });
            }
        });

        // Every section is reported, even if a worker vanished.
        for section in sections {
            results
                .entry(section.id)
                .or_insert_with(|| SectionResult::failed(section, "no result produced", 0));
        }

        let succeeded = results.values().filter(|r| r.is_success()).count();
        let failed = results.len() - succeeded;
        tracing::info!(
            succeeded,
            failed,
            elapsed_ms = %start.elapsed().as_millis(),
            "All sections processed"
        );
        self.emit(&SchedulerEvent::Completed { succeeded, failed });
        results
    }

    fn emit(&self, event: &SchedulerEvent) {
        if let Some(progress) = &self.progress {
            progress(event);
        }
    }
}

fn next_section<'a>(queue: &Mutex<VecDeque<&'a Section>>) -> Option<&'a Section> {
    match queue.lock() {
        Ok(mut q) => q.pop_front(),
        Err(poisoned) => poisoned.into_inner().pop_front(),
    }
}

fn run_isolated(
    runner: &dyn SectionRunner,
    section: &Section,
    chunks: &[Chunk],
    transcript: &str,
) -> SectionResult {
    let start = Instant::now();
    catch_unwind(AssertUnwindSafe(|| runner.run(section, chunks, transcript))).unwrap_or_else(
        |payload| {
            let message = panic_message(payload.as_ref());
            tracing::error!(section_id = section.id, panic = %message, "Section worker panicked");
            SectionResult::failed(
                section,
                format!("section worker panicked: {message}"),
                start.elapsed().as_millis() as u64,
            )
        },
    )
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
