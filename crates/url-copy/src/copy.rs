//! Running the transfers of one batch.
//!
//! One transfer runs at a time. The running copy is raced against a timeout
//! timer and the cancellation token armed by the signal handler; whichever
//! finishes first decides the outcome.
//!
//! Two schemes are understood natively: `file://` does a real streaming
//! copy, and `mock://` simulates one, driven by query parameters on the
//! URLs (`size`, `time` and `errno` on the source; `errno` on the
//! destination). Everything else fails with EPROTONOSUPPORT — protocol
//! plugins live outside this binary.

use crate::heuristics;
use crate::reporter::Reporter;
use fts_types::{
    Batch, BatchType, ErrorScope, Interval, PerfMarker, Surl, Transfer, TransferError,
    TransferInfo, TransferIntervals, TransferState, TransferStats,
};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const CANCELED_DESCRIPTION: &str = "Transfer canceled";
const PREVIOUS_HOP_DESCRIPTION: &str = "Transfer canceled because a previous hop failed";

/// Copy chunk size for `file://` transfers.
const CHUNK: usize = 64 * 1024;
/// Emit a performance marker every this many chunks (16 MiB).
const MARKER_EVERY: u64 = 256;

struct CopyResult {
    stats: TransferStats,
    filesize: u64,
}

/// The whole batch execution: state bookkeeping, per-type short-circuits,
/// start/end reporting.
pub struct UrlCopy {
    batch: Batch,
    reporter: Reporter,
    cancel: CancellationToken,
    log_path: Option<String>,
}

impl UrlCopy {
    pub fn new(
        batch: Batch,
        reporter: Reporter,
        cancel: CancellationToken,
        log_path: Option<String>,
    ) -> Self {
        Self {
            batch,
            reporter,
            cancel,
            log_path,
        }
    }

    /// Run every transfer according to the batch type and return the final
    /// batch, after the terminal message was written.
    pub async fn run(mut self) -> Batch {
        if let Err(e) = self.reporter.batch_start(&mut self.batch) {
            error!(error = %e, "failed to report the batch start");
        }

        let total = self.batch.transfers.len();
        match self.batch.batch_type {
            BatchType::Simple | BatchType::Bulk => {
                for index in 0..total {
                    if self.cancel.is_cancelled() {
                        self.mark_remaining_canceled(index);
                        break;
                    }
                    self.run_one(index).await;
                }
            }
            BatchType::Multihop => {
                for index in 0..total {
                    if self.cancel.is_cancelled() {
                        self.mark_remaining_canceled(index);
                        break;
                    }
                    if self.run_one(index).await != TransferState::Finished {
                        self.mark_remaining_hops_failed(index + 1);
                        break;
                    }
                }
            }
            BatchType::Multisource => {
                for index in 0..total {
                    if self.cancel.is_cancelled() {
                        self.mark_remaining_canceled(index);
                        break;
                    }
                    if self.run_one(index).await == TransferState::Finished {
                        self.mark_remaining_unused(index + 1);
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.reporter.batch_end(&mut self.batch) {
            error!(error = %e, "failed to report the batch end");
        }
        self.batch
    }

    /// Run one transfer and settle its terminal state.
    async fn run_one(&mut self, index: usize) -> TransferState {
        let log_path = self.log_path.clone();
        let transfer = &mut self.batch.transfers[index];
        transfer.info = Some(TransferInfo {
            state: Some(TransferState::Active),
            error: None,
            message: "Starting transfer".to_string(),
            stats: Some(TransferStats {
                intervals: TransferIntervals {
                    total: Interval::started(),
                    ..Default::default()
                },
                ..Default::default()
            }),
            log: log_path,
        });

        info!(
            transfer_id = %transfer.transfer_id,
            source = %transfer.source,
            destination = %transfer.destination,
            checksum = transfer.checksum.as_deref().unwrap_or(""),
            "transfer accepted"
        );

        let started = Instant::now();
        let outcome = execute(transfer, &self.cancel, &self.reporter).await;

        let transfer = &mut self.batch.transfers[index];
        let state = match outcome {
            Ok(result) => {
                transfer.filesize = Some(result.filesize);
                let info = transfer.info.as_mut().unwrap();
                // Keep the interval opened when the transfer started.
                let total = info
                    .stats
                    .as_ref()
                    .map(|s| s.intervals.total)
                    .unwrap_or_default();
                let mut stats = result.stats;
                stats.intervals.total = total;
                info.stats = Some(stats);
                info.message = "Transfer finished successfully".to_string();
                info!(transfer_id = %transfer.transfer_id, "transfer finished successfully");
                TransferState::Finished
            }
            Err(transfer_error) => {
                let state = if transfer_error.code == libc::ECANCELED {
                    TransferState::Canceled
                } else {
                    TransferState::Failed
                };
                if transfer_error.recoverable {
                    error!(
                        code = transfer_error.code,
                        "recoverable error: {}", transfer_error.description
                    );
                } else {
                    error!(
                        code = transfer_error.code,
                        "non recoverable error: {}", transfer_error.description
                    );
                }
                let info = transfer.info.as_mut().unwrap();
                info.message = transfer_error.description.clone();
                info.error = Some(transfer_error);
                state
            }
        };

        let info = transfer.info.as_mut().unwrap();
        info.state = Some(state);
        if let Some(stats) = info.stats.as_mut() {
            stats.intervals.total.finish();
            if state == TransferState::Finished && stats.throughput == 0.0 {
                let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
                stats.throughput = stats.transferred as f64 / elapsed;
            }
        }
        state
    }

    fn mark_remaining_canceled(&mut self, from: usize) {
        self.mark_remaining(
            from,
            TransferState::Canceled,
            Some(TransferError {
                scope: ErrorScope::Transfer,
                code: libc::ECANCELED,
                description: CANCELED_DESCRIPTION.to_string(),
                recoverable: false,
            }),
        );
    }

    fn mark_remaining_hops_failed(&mut self, from: usize) {
        self.mark_remaining(
            from,
            TransferState::Failed,
            Some(TransferError {
                scope: ErrorScope::Transfer,
                code: libc::ECANCELED,
                description: PREVIOUS_HOP_DESCRIPTION.to_string(),
                recoverable: false,
            }),
        );
    }

    fn mark_remaining_unused(&mut self, from: usize) {
        self.mark_remaining(from, TransferState::Unused, None);
    }

    fn mark_remaining(&mut self, from: usize, state: TransferState, error: Option<TransferError>) {
        for transfer in self.batch.transfers.iter_mut().skip(from) {
            let info = transfer.info.get_or_insert_with(Default::default);
            info.state = Some(state);
            info.error = error.clone();
        }
    }
}

/// Race the copy against the timeout and the cancellation token.
async fn execute(
    transfer: &Transfer,
    cancel: &CancellationToken,
    reporter: &Reporter,
) -> Result<CopyResult, TransferError> {
    let source_size = stat_source(&transfer.source)?;
    info!(filesize = source_size, "source file size");

    if let Some(expected) = transfer.filesize {
        if expected != 0 && expected != source_size {
            return Err(TransferError {
                scope: ErrorScope::Source,
                code: libc::EINVAL,
                description: format!(
                    "Source and user provided file sizes do not match: {source_size} != {expected}"
                ),
                recoverable: false,
            });
        }
    }

    let timeout = if transfer.params.timeout > 0 {
        Duration::from_secs(transfer.params.timeout)
    } else {
        heuristics::timeout_for_size(source_size)
    };
    info!(timeout_secs = timeout.as_secs(), "timeout");

    let started = Instant::now();
    let copy = run_copy(transfer, source_size, reporter);

    let stats = tokio::select! {
        result = copy => result?,
        _ = tokio::time::sleep(timeout) => {
            return Err(TransferError {
                scope: ErrorScope::Transfer,
                code: libc::ETIMEDOUT,
                description: "Transfer timed out".to_string(),
                recoverable: true,
            });
        }
        _ = cancel.cancelled() => {
            return Err(TransferError {
                scope: ErrorScope::Transfer,
                code: libc::ECANCELED,
                description: CANCELED_DESCRIPTION.to_string(),
                recoverable: false,
            });
        }
    };

    // Protocols without markers leave the statistics blank; fill them from
    // what is known.
    let mut stats = stats;
    if stats.transferred == 0 {
        stats.transferred = source_size;
    }
    if stats.throughput == 0.0 {
        let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
        stats.throughput = source_size as f64 / elapsed;
    }

    Ok(CopyResult {
        stats,
        filesize: source_size,
    })
}

/// Mock query parameter, if present and parsable.
fn mock_param<T: std::str::FromStr>(surl: &Surl, name: &str) -> Option<T> {
    surl.query_pairs()
        .find(|(k, _)| k == name)
        .and_then(|(_, v)| v.parse().ok())
}

fn errno_error(scope: ErrorScope, code: i32, context: &str) -> TransferError {
    let description = format!(
        "{context}: {}",
        std::io::Error::from_raw_os_error(code)
    );
    TransferError {
        scope,
        code,
        recoverable: heuristics::is_recoverable(scope, code),
        description,
    }
}

fn io_error(scope: ErrorScope, error: &std::io::Error, context: &str) -> TransferError {
    let code = error.raw_os_error().unwrap_or(libc::EIO);
    TransferError {
        scope,
        code,
        recoverable: heuristics::is_recoverable(scope, code),
        description: format!("{context}: {error}"),
    }
}

/// Size of the source, or the error that makes it unreadable.
fn stat_source(source: &Surl) -> Result<u64, TransferError> {
    match source.scheme() {
        "mock" => {
            if let Some(code) = mock_param::<i32>(source, "errno") {
                return Err(errno_error(ErrorScope::Source, code, "Could not stat source"));
            }
            Ok(mock_param(source, "size").unwrap_or(0))
        }
        "file" => std::fs::metadata(source.path())
            .map(|m| m.len())
            .map_err(|e| io_error(ErrorScope::Source, &e, "Could not stat source")),
        other => Err(TransferError {
            scope: ErrorScope::Source,
            code: libc::EPROTONOSUPPORT,
            description: format!("Protocol not supported: {other}"),
            recoverable: false,
        }),
    }
}

async fn run_copy(
    transfer: &Transfer,
    source_size: u64,
    reporter: &Reporter,
) -> Result<TransferStats, TransferError> {
    match (transfer.source.scheme(), transfer.destination.scheme()) {
        ("mock", "mock") => mock_copy(transfer, source_size, reporter).await,
        ("file", "file") => file_copy(transfer, reporter).await,
        (_, other) => Err(TransferError {
            scope: ErrorScope::Destination,
            code: libc::EPROTONOSUPPORT,
            description: format!("Protocol not supported: {other}"),
            recoverable: false,
        }),
    }
}

/// Simulated copy: takes `time` seconds, reports one mid-way marker, and
/// fails with the destination's `errno` if one is set.
async fn mock_copy(
    transfer: &Transfer,
    source_size: u64,
    reporter: &Reporter,
) -> Result<TransferStats, TransferError> {
    let duration = mock_param::<f64>(&transfer.source, "time").unwrap_or(0.0);
    if duration > 0.0 {
        tokio::time::sleep(Duration::from_secs_f64(duration / 2.0)).await;
        report_marker(transfer, source_size / 2, reporter);
        tokio::time::sleep(Duration::from_secs_f64(duration / 2.0)).await;
    }

    if let Some(code) = mock_param::<i32>(&transfer.destination, "errno") {
        return Err(errno_error(
            ErrorScope::Destination,
            code,
            "Could not write to the destination",
        ));
    }

    Ok(TransferStats {
        transferred: source_size,
        throughput: if duration > 0.0 {
            source_size as f64 / duration
        } else {
            0.0
        },
        ..Default::default()
    })
}

/// Real streaming copy between local files.
async fn file_copy(
    transfer: &Transfer,
    reporter: &Reporter,
) -> Result<TransferStats, TransferError> {
    let mut source = tokio::fs::File::open(transfer.source.path())
        .await
        .map_err(|e| io_error(ErrorScope::Source, &e, "Could not open the source"))?;

    if !transfer.params.overwrite
        && tokio::fs::try_exists(transfer.destination.path())
            .await
            .unwrap_or(false)
    {
        return Err(errno_error(
            ErrorScope::Transfer,
            libc::EEXIST,
            "Destination exists and overwrite is disabled",
        ));
    }
    if let Some(parent) = std::path::Path::new(transfer.destination.path()).parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| io_error(ErrorScope::Destination, &e, "Could not create the parent"))?;
    }
    let mut destination = tokio::fs::File::create(transfer.destination.path())
        .await
        .map_err(|e| io_error(ErrorScope::Destination, &e, "Could not create the destination"))?;

    let mut buffer = vec![0u8; CHUNK];
    let mut transferred = 0u64;
    let mut chunks = 0u64;
    loop {
        let read = source
            .read(&mut buffer)
            .await
            .map_err(|e| io_error(ErrorScope::Source, &e, "Read failed"))?;
        if read == 0 {
            break;
        }
        destination
            .write_all(&buffer[..read])
            .await
            .map_err(|e| io_error(ErrorScope::Destination, &e, "Write failed"))?;
        transferred += read as u64;
        chunks += 1;
        if chunks % MARKER_EVERY == 0 {
            report_marker(transfer, transferred, reporter);
        }
    }
    destination
        .flush()
        .await
        .map_err(|e| io_error(ErrorScope::Destination, &e, "Flush failed"))?;

    Ok(TransferStats {
        transferred,
        ..Default::default()
    })
}

fn report_marker(transfer: &Transfer, transferred: u64, reporter: &Reporter) {
    let mut marker = PerfMarker {
        timestamp: fts_types::Timestamp::now(),
        job_id: transfer.job_id.clone(),
        transfer_id: transfer.transfer_id.clone(),
        source_se: transfer.source.storage_name(),
        dest_se: transfer.destination.storage_name(),
        throughput: 0,
        transferred,
    };
    if let Err(e) = reporter.performance(&mut marker) {
        error!(error = %e, "failed to report a performance marker");
    }
}
