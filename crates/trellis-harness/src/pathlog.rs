//! Per-path event logging and reference comparison.
//!
//! Scenarios that subscribe to path events write a delimited text log —
//! one row per event, with optional quality metrics — which can then be
//! compared line by line against a reference file. The comparison ignores
//! trailing whitespace and line-ending differences but nothing else; the
//! first divergent line is reported.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use trellis_netsim::Micros;

/// Path lifecycle events worth logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathEvent {
    Created,
    Validated,
    Standby,
    Available,
    Suspended,
    Deleted,
}

impl fmt::Display for PathEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PathEvent::Created => "path_created",
            PathEvent::Validated => "path_validated",
            PathEvent::Standby => "path_standby",
            PathEvent::Available => "path_available",
            PathEvent::Suspended => "path_suspended",
            PathEvent::Deleted => "path_deleted",
        };
        f.write_str(name)
    }
}

/// Optional quality metrics attached to a row, when the collaborator
/// exposes them.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathQuality {
    pub pacing_rate: u64,
    pub receive_rate: u64,
    pub cwin: u64,
    pub rtt: u64,
}

/// Buffered writer for one scenario's path event log.
#[derive(Debug)]
pub struct PathEventLog {
    out: BufWriter<File>,
    path: PathBuf,
    with_quality: bool,
}

impl PathEventLog {
    /// Create the log file and write the header row.
    pub fn create(path: impl Into<PathBuf>, with_quality: bool) -> Result<Self> {
        let path = path.into();
        let file =
            File::create(&path).with_context(|| format!("creating event log {}", path.display()))?;
        let mut log = PathEventLog {
            out: BufWriter::new(file),
            path,
            with_quality,
        };
        if with_quality {
            writeln!(log.out, "Time, Path-ID, Event, Pacing_rate, Receive Rate, CWIN, RTT")?;
        } else {
            writeln!(log.out, "Time, Path-ID, Event,")?;
        }
        Ok(log)
    }

    /// Append one event row.
    pub fn record(
        &mut self,
        time: Micros,
        path_id: u64,
        event: PathEvent,
        quality: Option<PathQuality>,
    ) -> Result<()> {
        match (self.with_quality, quality) {
            (true, Some(q)) => writeln!(
                self.out,
                "{time}, {path_id}, {event}, {}, {}, {}, {}",
                q.pacing_rate, q.receive_rate, q.cwin, q.rtt
            )?,
            (true, None) => writeln!(self.out, "{time}, {path_id}, {event}, 0, 0, 0, 0")?,
            (false, _) => writeln!(self.out, "{time}, {path_id}, {event},")?,
        }
        Ok(())
    }

    /// Flush and close, returning the log's path for comparison.
    pub fn finish(mut self) -> Result<PathBuf> {
        self.out.flush().context("flushing event log")?;
        Ok(self.path)
    }
}

/// Compare a generated log against a reference, line by line. Trailing
/// whitespace is ignored; the first divergent line fails the comparison.
pub fn compare_text_files(actual: &Path, reference: &Path) -> Result<()> {
    let open = |p: &Path| -> Result<BufReader<File>> {
        Ok(BufReader::new(
            File::open(p).with_context(|| format!("opening {}", p.display()))?,
        ))
    };
    let mut actual_lines = open(actual)?.lines();
    let mut reference_lines = open(reference)?.lines();
    let mut line_no = 0usize;

    loop {
        line_no += 1;
        match (actual_lines.next(), reference_lines.next()) {
            (None, None) => return Ok(()),
            (Some(a), Some(r)) => {
                let (a, r) = (a?, r?);
                if a.trim_end() != r.trim_end() {
                    bail!(
                        "line {line_no} differs:\n  actual:    {a}\n  reference: {r}",
                    );
                }
            }
            (Some(_), None) => bail!("actual log has extra lines past line {line_no}"),
            (None, Some(_)) => bail!("actual log is truncated at line {line_no}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("trellis-pathlog-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn log_rows_have_expected_shape() {
        let path = scratch("events.csv");
        let mut log = PathEventLog::create(&path, false).unwrap();
        log.record(0, 0, PathEvent::Created, None).unwrap();
        log.record(12_345, 1, PathEvent::Validated, None).unwrap();
        let written = log.finish().unwrap();

        let text = fs::read_to_string(written).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Time, Path-ID, Event,");
        assert_eq!(lines[1], "0, 0, path_created,");
        assert_eq!(lines[2], "12345, 1, path_validated,");
    }

    #[test]
    fn quality_rows_carry_metrics() {
        let path = scratch("quality.csv");
        let mut log = PathEventLog::create(&path, true).unwrap();
        log.record(
            5,
            0,
            PathEvent::Available,
            Some(PathQuality {
                pacing_rate: 50_000,
                receive_rate: 40_000,
                cwin: 12_000,
                rtt: 20_000,
            }),
        )
        .unwrap();
        let written = log.finish().unwrap();
        let text = fs::read_to_string(written).unwrap();
        assert!(text.contains("5, 0, path_available, 50000, 40000, 12000, 20000"));
    }

    #[test]
    fn comparison_accepts_identical_and_rejects_divergent() {
        let a = scratch("cmp_a.csv");
        let b = scratch("cmp_b.csv");
        let c = scratch("cmp_c.csv");
        fs::write(&a, "x, 1\ny, 2\n").unwrap();
        fs::write(&b, "x, 1\ny, 2\n").unwrap();
        fs::write(&c, "x, 1\ny, 3\n").unwrap();

        compare_text_files(&a, &b).unwrap();
        let err = compare_text_files(&a, &c).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn comparison_ignores_trailing_whitespace_only() {
        let a = scratch("ws_a.csv");
        let b = scratch("ws_b.csv");
        fs::write(&a, "x, 1\n").unwrap();
        fs::write(&b, "x, 1   \n").unwrap();
        compare_text_files(&a, &b).unwrap();
    }

    #[test]
    fn truncated_actual_is_reported() {
        let a = scratch("tr_a.csv");
        let b = scratch("tr_b.csv");
        fs::write(&a, "x, 1\n").unwrap();
        fs::write(&b, "x, 1\ny, 2\n").unwrap();
        let err = compare_text_files(&a, &b).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }
}
