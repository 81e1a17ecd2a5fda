// sink.rs - Output destinations for per-probe samples and run summaries
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;

use crate::clock::WallTime;
use crate::sampler::DelaySample;
use crate::sequence::LossRun;
use crate::wire::OpMode;

/// Receives sample lines while a run is in progress and the summary at the end.
pub trait SampleSink: Send {
    fn write_sample(&mut self, line: &dyn fmt::Display) -> io::Result<()>;

    fn write_summary(&mut self, header: &str, summary: &dyn fmt::Display) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl SampleSink for NullSink {
    fn write_sample(&mut self, _line: &dyn fmt::Display) -> io::Result<()> {
        Ok(())
    }

    fn write_summary(&mut self, _header: &str, _summary: &dyn fmt::Display) -> io::Result<()> {
        Ok(())
    }
}

/// Line-oriented sink over any writer (stdout, a file, a buffer).
pub struct WriterSink<W: Write + Send> {
    writer: W,
    samples: bool,
}

impl<W: Write + Send> WriterSink<W> {
    /// Writes both sample lines and the summary.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            samples: true,
        }
    }

    /// Writes only the summary.
    pub fn summary_only(writer: W) -> Self {
        Self {
            writer,
            samples: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> SampleSink for WriterSink<W> {
    fn write_sample(&mut self, line: &dyn fmt::Display) -> io::Result<()> {
        if self.samples {
            writeln!(self.writer, "{}", line)?;
        }
        Ok(())
    }

    fn write_summary(&mut self, header: &str, summary: &dyn fmt::Display) -> io::Result<()> {
        writeln!(self.writer, "{}", header)?;
        writeln!(self.writer, "{}", summary)?;
        self.writer.flush()
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Server per-probe line:
/// `wall mode size largest seq send_secs.send_nanos owd smoothed`.
#[derive(Debug, Clone, Copy)]
pub struct OwdSampleLine {
    pub mode: OpMode,
    pub size: usize,
    pub largest_sequence: u32,
    pub sequence: u32,
    pub sent: WallTime,
    pub sample: DelaySample,
}

impl fmt::Display for OwdSampleLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.6} {} {} {} {} {}.{:09} {:.9} {:.9}",
            self.sample.timestamp,
            self.mode.as_u16(),
            self.size,
            self.largest_sequence,
            self.sequence,
            self.sent.secs,
            self.sent.nanos,
            self.sample.raw,
            self.sample.smoothed,
        )
    }
}

/// Client per-echo line: `wall mode size rtt smoothed received samples`.
#[derive(Debug, Clone, Copy)]
pub struct RttSampleLine {
    pub mode: OpMode,
    pub size: usize,
    pub sample: DelaySample,
    pub received: u64,
    pub samples: u64,
}

impl fmt::Display for RttSampleLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.6} {} {} {:.9} {:.9} {} {}",
            self.sample.timestamp,
            self.mode.as_u16(),
            self.size,
            self.sample.raw,
            self.sample.smoothed,
            self.received,
            self.samples,
        )
    }
}

/// Appends one summary line to a results log, creating it if needed.
pub fn append_results(path: &Path, summary: &dyn fmt::Display) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", summary)
}

/// Writes closed loss runs as `end_time length start_sequence`, one per line.
pub fn write_loss_runs<'a, W, I>(writer: &mut W, runs: I) -> io::Result<()>
where
    W: Write,
    I: IntoIterator<Item = &'a LossRun>,
{
    for run in runs {
        writeln!(
            writer,
            "{:.9} {} {}",
            run.end_timestamp, run.length, run.start_sequence
        )?;
    }
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DelaySample {
        DelaySample {
            raw: 0.0015,
            smoothed: 0.002,
            timestamp: 1700000000.5,
        }
    }

    #[test]
    fn test_owd_line_format() {
        let line = OwdSampleLine {
            mode: OpMode::OneWay,
            size: 56,
            largest_sequence: 9,
            sequence: 9,
            sent: WallTime::new(1700000000, 42),
            sample: sample(),
        };
        assert_eq!(
            line.to_string(),
            "1700000000.500000 1 56 9 9 1700000000.000000042 0.001500000 0.002000000"
        );
    }

    #[test]
    fn test_writer_sink_summary_only_skips_samples() {
        let mut sink = WriterSink::summary_only(Vec::new());
        sink.write_sample(&"sample").unwrap();
        sink.write_summary("h", &"s").unwrap();
        assert_eq!(String::from_utf8(sink.into_inner()).unwrap(), "h\ns\n");
    }

    #[test]
    fn test_writer_sink_writes_samples() {
        let mut sink = WriterSink::new(Vec::new());
        sink.write_sample(&"a").unwrap();
        sink.write_sample(&"b").unwrap();
        assert_eq!(String::from_utf8(sink.into_inner()).unwrap(), "a\nb\n");
    }

    #[test]
    fn test_loss_run_lines() {
        let runs = [
            LossRun {
                start_sequence: 3,
                length: 1,
                end_timestamp: 2.5,
            },
            LossRun {
                start_sequence: 7,
                length: 4,
                end_timestamp: 3.0,
            },
        ];
        let mut out = Vec::new();
        write_loss_runs(&mut out, runs.iter()).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "2.500000000 1 3\n3.000000000 4 7\n"
        );
    }

    #[test]
    fn test_append_results_appends() {
        let path = std::env::temp_dir().join(format!("udpprobe-results-{}.dat", std::process::id()));
        let _ = std::fs::remove_file(&path);
        append_results(&path, &"first").unwrap();
        append_results(&path, &"second").unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(contents, "first\nsecond\n");
    }
}
