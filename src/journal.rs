//! Per-run attempt journal.
//!
//! Every run writes its own `geocode-run-<started>-<seq>.jsonl` file: one
//! `run_started` line, one `record` line per processed registry row and a
//! closing `run_finished` line. Lines go to disk as they are written, so a
//! crashed or interrupted run still leaves every record it finished. Only the
//! newest `keep_runs` files are kept.

use std::fs::{self, File, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::errors::AppResult;
use crate::pipeline::RunSummary;
use crate::registry::SkippedRow;
use crate::resolver::{Attempt, GeocodeResult, ResolutionSource};
use crate::scoring::QualityScore;

const RUN_FILE_PREFIX: &str = "geocode-run-";
const RUN_FILE_SUFFIX: &str = ".jsonl";

/// Directory of run journals.
#[derive(Debug, Clone)]
pub struct AttemptJournal {
    dir: PathBuf,
    keep_runs: usize,
}

impl AttemptJournal {
    pub fn open<P: AsRef<Path>>(dir: P, keep_runs: usize) -> AppResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            keep_runs: keep_runs.max(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates the file for a new run, writes its `run_started` line and drops
    /// the oldest run files beyond the retention limit.
    pub fn start_run(&self, records: usize, skipped: &[SkippedRow]) -> AppResult<RunJournal> {
        let started_at = Utc::now();
        let (path, file) = self.create_run_file(started_at)?;
        let run = RunJournal {
            path,
            writer: Mutex::new(LineWriter::new(file)),
        };
        run.write(&JournalEntry::RunStarted {
            at: started_at,
            records,
            skipped,
        })?;
        self.prune()?;
        Ok(run)
    }

    /// Run files oldest first.
    pub fn runs(&self) -> AppResult<Vec<PathBuf>> {
        let mut runs = fs::read_dir(&self.dir)?
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let name = entry.file_name().to_string_lossy().to_string();
                (name.starts_with(RUN_FILE_PREFIX) && name.ends_with(RUN_FILE_SUFFIX))
                    .then(|| entry.path())
            })
            .collect::<Vec<_>>();
        // start timestamp then sequence, both zero-padded
        runs.sort();
        Ok(runs)
    }

    fn create_run_file(&self, started_at: DateTime<Utc>) -> AppResult<(PathBuf, File)> {
        let stamp = started_at.format("%Y%m%d%H%M%S%3f");
        let mut seq = 0_u32;
        loop {
            let path = self
                .dir
                .join(format!("{RUN_FILE_PREFIX}{stamp}-{seq:03}{RUN_FILE_SUFFIX}"));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists && seq < 999 => seq += 1,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn prune(&self) -> AppResult<()> {
        let runs = self.runs()?;
        let excess = runs.len().saturating_sub(self.keep_runs);
        for path in runs.into_iter().take(excess) {
            debug!(path = %path.display(), "removing old run journal");
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Open journal of the run in progress.
#[derive(Debug)]
pub struct RunJournal {
    path: PathBuf,
    writer: Mutex<LineWriter<File>>,
}

impl RunJournal {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, line: RecordLine<'_>) -> AppResult<()> {
        self.write(&JournalEntry::Record(line))
    }

    /// Writes the closing summary line and returns the journal path.
    pub fn finish(self, summary: &RunSummary) -> AppResult<PathBuf> {
        self.write(&JournalEntry::RunFinished {
            at: Utc::now(),
            summary,
        })?;
        self.writer.lock().flush()?;
        Ok(self.path)
    }

    fn write(&self, entry: &JournalEntry<'_>) -> AppResult<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.writer.lock().write_all(&line)?;
        Ok(())
    }
}

/// What the run learned about one registry row.
#[derive(Debug, Serialize)]
pub struct RecordLine<'a> {
    pub row: usize,
    pub fingerprint: String,
    pub search_query: &'a str,
    pub source: ResolutionSource,
    pub result: Option<&'a GeocodeResult>,
    pub score: Option<QualityScore>,
    pub attempts: &'a [Attempt],
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum JournalEntry<'a> {
    RunStarted {
        at: DateTime<Utc>,
        records: usize,
        skipped: &'a [SkippedRow],
    },
    Record(RecordLine<'a>),
    RunFinished {
        at: DateTime<Utc>,
        summary: &'a RunSummary,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    fn lines(path: &Path) -> Vec<serde_json::Value> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn writes_run_boundaries_and_records() {
        let dir = tempdir().unwrap();
        let journal = AttemptJournal::open(dir.path(), 5).unwrap();
        let skipped = vec![SkippedRow {
            row: 4,
            reason: "missing name".into(),
        }];
        let run = journal.start_run(2, &skipped).unwrap();
        run.record(RecordLine {
            row: 2,
            fingerprint: "abc".into(),
            search_query: "Пловдив, Bulgaria",
            source: ResolutionSource::Unresolved,
            result: None,
            score: None,
            attempts: &[],
        })
        .unwrap();

        // record lines are on disk before the run finishes
        let partial = lines(run.path());
        assert_eq!(partial.len(), 2);
        assert_eq!(partial[1]["event"], "record");
        assert_eq!(partial[1]["source"], "unresolved");

        let path = run.finish(&RunSummary::default()).unwrap();
        let events = lines(&path);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0]["event"], "run_started");
        assert_eq!(events[0]["skipped"][0]["row"], 4);
        assert_eq!(events[2]["event"], "run_finished");
    }

    #[test]
    fn each_run_gets_its_own_file() {
        let dir = tempdir().unwrap();
        let journal = AttemptJournal::open(dir.path(), 5).unwrap();
        let first = journal.start_run(0, &[]).unwrap();
        let second = journal.start_run(0, &[]).unwrap();
        assert_ne!(first.path(), second.path());
        first.finish(&RunSummary::default()).unwrap();
        second.finish(&RunSummary::default()).unwrap();
        assert_eq!(journal.runs().unwrap().len(), 2);
    }

    #[test]
    fn keeps_only_newest_runs() {
        let dir = tempdir().unwrap();
        let journal = AttemptJournal::open(dir.path(), 2).unwrap();
        let mut paths = Vec::new();
        for _ in 0..4 {
            let run = journal.start_run(0, &[]).unwrap();
            paths.push(run.finish(&RunSummary::default()).unwrap());
        }
        assert_eq!(journal.runs().unwrap(), paths[2..].to_vec());
    }

    #[test]
    fn unwritable_directory_is_an_error() {
        let file = NamedTempFile::new().unwrap();
        assert!(AttemptJournal::open(file.path().join("journal"), 5).is_err());
    }
}
