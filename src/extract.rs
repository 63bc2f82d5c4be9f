//! Concurrent extraction of TCP records from many captures into one CSV table.

use std::{
    fs::File,
    io::{BufWriter, Write},
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
    thread,
};

use parking_lot::Mutex;
use tracing::{debug, info, info_span, trace, warn};

use crate::{
    error::{Error, Result},
    header::parse_frame,
    record::{format_row, header_row},
    source::{open_capture, VisitError},
};

/// Append-only CSV file shared by every worker of one run.
///
/// Each append writes one whole line while holding the lock, so lines from
/// different workers never interleave.
#[derive(Debug)]
pub struct OutputTable {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl OutputTable {
    /// Creates or truncates `path` and writes the header line.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|source| Error::CreateOutput {
            path: path.to_owned(),
            source,
        })?;
        let table = Self {
            path: path.to_owned(),
            writer: Mutex::new(BufWriter::new(file)),
        };
        table.append(&header_row()?)?;
        Ok(table)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes one newline terminated line.
    pub fn append(&self, line: &[u8]) -> Result<()> {
        self.writer
            .lock()
            .write_all(line)
            .map_err(|source| self.write_error(source))
    }

    pub fn flush(&self) -> Result<()> {
        self.writer
            .lock()
            .flush()
            .map_err(|source| self.write_error(source))
    }

    fn write_error(&self, source: std::io::Error) -> Error {
        Error::WriteOutput {
            path: self.path.clone(),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub output: PathBuf,
    /// Upper bound on worker threads, one thread per input when unset.
    pub workers: Option<NonZeroUsize>,
}

impl ExtractOptions {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            workers: None,
        }
    }

    pub fn workers(mut self, workers: NonZeroUsize) -> Self {
        self.workers = Some(workers);
        self
    }
}

/// Frame counts for one input file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStats {
    pub frames: u64,
    pub records: u64,
    pub skipped: u64,
}

#[derive(Debug)]
pub struct FileReport {
    pub path: PathBuf,
    pub outcome: Result<FileStats>,
}

/// Per-file outcomes of a run, in input order.
#[derive(Debug)]
pub struct RunSummary {
    pub files: Vec<FileReport>,
}

impl RunSummary {
    pub fn records(&self) -> u64 {
        self.succeeded().map(|stats| stats.records).sum()
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &FileStats> {
        self.files.iter().filter_map(|file| file.outcome.as_ref().ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = &FileReport> {
        self.files.iter().filter(|file| file.outcome.is_err())
    }
}

/// Extracts every TCP frame of `inputs` into the CSV table at
/// `options.output`.
///
/// A file that cannot be opened or read is reported in the summary and does
/// not stop the others. The run fails only when there are no inputs, the
/// table cannot be written, or every input failed.
pub fn extract(inputs: &[PathBuf], options: &ExtractOptions) -> Result<RunSummary> {
    if inputs.is_empty() {
        return Err(Error::NoInputs);
    }

    let table = OutputTable::create(&options.output)?;
    let workers = options
        .workers
        .map_or(inputs.len(), |n| n.get().min(inputs.len()));
    debug!(inputs = inputs.len(), workers, output = %table.path().display(), "starting extraction");

    let next = AtomicUsize::new(0);
    let mut outcomes: Vec<(usize, Result<FileStats>)> = thread::scope(|scope| {
        let (next, table) = (&next, &table);
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                scope.spawn(move || {
                    let mut done = Vec::new();
                    loop {
                        let index = next.fetch_add(1, Ordering::Relaxed);
                        let Some(path) = inputs.get(index) else {
                            break;
                        };
                        done.push((index, extract_file(path, table)));
                    }
                    done
                })
            })
            .collect();

        handles
            .into_iter()
            .flat_map(|handle| match handle.join() {
                Ok(done) => done,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    });
    outcomes.sort_by_key(|(index, _)| *index);

    table.flush()?;

    let mut files: Vec<FileReport> = inputs
        .iter()
        .zip(outcomes)
        .map(|(path, (_, outcome))| FileReport {
            path: path.clone(),
            outcome,
        })
        .collect();

    // A write failure on the shared table ends the run even if only one
    // worker saw it.
    if let Some(pos) = files
        .iter()
        .position(|file| matches!(file.outcome, Err(Error::WriteOutput { .. })))
    {
        if let Err(err) = files.swap_remove(pos).outcome {
            return Err(err);
        }
    }

    let summary = RunSummary { files };
    if summary.succeeded().next().is_none() {
        return Err(Error::AllInputsFailed(summary.files.len()));
    }
    debug!(records = summary.records(), "extraction finished");
    Ok(summary)
}

/// Streams one capture into `table`.
fn extract_file(path: &Path, table: &OutputTable) -> Result<FileStats> {
    let _span = info_span!("capture", path = %path.display()).entered();
    let outcome = stream_file(path, table);
    match &outcome {
        Ok(stats) => info!(
            frames = stats.frames,
            records = stats.records,
            skipped = stats.skipped,
            "finished capture"
        ),
        Err(err) => warn!("{err}"),
    }
    outcome
}

fn stream_file(path: &Path, table: &OutputTable) -> Result<FileStats> {
    let mut reader = open_capture(path)?;
    debug!(format = ?reader.format(), "opened capture");

    let mut stats = FileStats::default();
    reader
        .for_each_frame(|link, frame| {
            stats.frames += 1;
            match link.and_then(|link| parse_frame(&frame, link)) {
                Some(record) => {
                    table.append(&format_row(&record)?)?;
                    stats.records += 1;
                }
                None => {
                    trace!(frame = stats.frames, "skipped frame");
                    stats.skipped += 1;
                }
            }
            Ok::<_, Error>(())
        })
        .map_err(|err| match err {
            VisitError::Read(source) => Error::ReadCapture {
                path: path.to_owned(),
                source,
            },
            VisitError::Visit(err) => err,
        })?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use std::{fs, time::Duration};

    use super::*;

    #[test]
    fn table_starts_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let table = OutputTable::create(&path).unwrap();
        table.flush().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("timestamp,src_ip,"));
        assert_eq!(text.lines().count(), 1);
    }

    #[test]
    fn create_truncates_previous_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        fs::write(&path, "stale\nrows\n").unwrap();

        OutputTable::create(&path).unwrap().flush().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 1);
    }

    #[test]
    fn concurrent_appends_keep_lines_whole() {
        const WORKERS: usize = 8;
        const LINES: usize = 200;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let table = OutputTable::create(&path).unwrap();

        thread::scope(|scope| {
            for worker in 0..WORKERS {
                let table = &table;
                scope.spawn(move || {
                    let line = format!("{}\n", worker.to_string().repeat(64 + worker * 97));
                    for i in 0..LINES {
                        table.append(line.as_bytes()).unwrap();
                        if i % 7 == worker % 7 {
                            thread::sleep(Duration::from_micros(50));
                        } else {
                            thread::yield_now();
                        }
                    }
                });
            }
        });
        table.flush().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let mut per_worker = [0usize; WORKERS];
        for line in text.lines().skip(1) {
            let worker: usize = line[..1].parse().unwrap();
            assert_eq!(line, worker.to_string().repeat(64 + worker * 97));
            per_worker[worker] += 1;
        }
        assert_eq!(per_worker, [LINES; WORKERS]);
    }

    #[test]
    fn no_inputs_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let options = ExtractOptions::new(dir.path().join("out.csv"));
        assert!(matches!(extract(&[], &options), Err(Error::NoInputs)));
    }

    #[test]
    fn all_inputs_missing_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = vec![dir.path().join("a.pcap"), dir.path().join("b.pcap")];
        let options = ExtractOptions::new(dir.path().join("out.csv"));
        assert!(matches!(
            extract(&inputs, &options),
            Err(Error::AllInputsFailed(2))
        ));
    }

    #[test]
    fn unwritable_output_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let options = ExtractOptions::new(dir.path().join("missing").join("out.csv"));
        let inputs = vec![dir.path().join("a.pcap")];
        assert!(matches!(
            extract(&inputs, &options),
            Err(Error::CreateOutput { .. })
        ));
    }
}
