use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::Arc;

use crate::backtrace::{NativeSymbolizer, Symbolizer};
use crate::error::{Error, Result};
use crate::profile::{Profile, Snapshot};
use crate::sample::{CallSite, CodeUnit};
use crate::session::configuration::{Output, ReportFormat};

pub const SELF_HEADER: &str = "=== time ===";
pub const CUMULATIVE_HEADER: &str = "== cumulative time ==";

/// A symbolized call site. Ordering (file, line, function) breaks ties
/// between entries with equal counts.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    /// Basename of the source file.
    pub file: String,
    pub line: u32,
    pub function: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    #[serde(flatten)]
    pub location: Location,
    pub count: u64,
    /// `100 * count / total_samples`.
    pub percentage: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub total_samples: u64,
    pub dropped_samples: u64,
    #[serde(rename = "time")]
    pub self_time: Vec<ReportEntry>,
    pub cumulative_time: Vec<ReportEntry>,
}

impl Report {
    pub fn build<S: Symbolizer + ?Sized>(snapshot: &Snapshot, symbolizer: &mut S) -> Self {
        let total_samples = snapshot.total();
        let mut report = Report {
            total_samples,
            dropped_samples: snapshot.dropped_samples,
            ..Report::default()
        };
        if total_samples == 0 {
            return report;
        }
        report.self_time = Self::rank(&snapshot.self_counts, total_samples, symbolizer);
        report.cumulative_time =
            Self::rank(&snapshot.cumulative_counts, total_samples, symbolizer);
        report
    }

    /// Merge call sites of one code unit that symbolize to the same location,
    /// then order by count descending and location ascending.
    ///
    /// Distinct code units are never merged, even when their locations read
    /// the same (generic instantiations do): each was counted separately in
    /// the same samples, so adding them up would count a sample twice.
    fn rank<S: Symbolizer + ?Sized>(
        counts: &[(CallSite, u64)],
        total: u64,
        symbolizer: &mut S,
    ) -> Vec<ReportEntry> {
        let mut merged: HashMap<(Location, CodeUnit), u64> = HashMap::new();
        for (call_site, count) in counts {
            let key = (symbolizer.locate(call_site), call_site.code_unit);
            *merged.entry(key).or_insert(0) += count;
        }

        let mut ranked: Vec<((Location, CodeUnit), u64)> = merged.into_iter().collect();
        ranked.sort_by(|(a_key, a_count), (b_key, b_count)| {
            b_count.cmp(a_count).then_with(|| a_key.cmp(b_key))
        });
        ranked
            .into_iter()
            .map(|((location, _), count)| ReportEntry {
                location,
                count,
                percentage: 100.0 * count as f64 / total as f64,
            })
            .collect()
    }

    pub fn write_text<W: Write + ?Sized>(&self, sink: &mut W) -> io::Result<()> {
        writeln!(sink, "{}", SELF_HEADER)?;
        Self::write_entries(sink, &self.self_time)?;
        writeln!(sink, "{}", CUMULATIVE_HEADER)?;
        Self::write_entries(sink, &self.cumulative_time)?;
        Ok(())
    }

    fn write_entries<W: Write + ?Sized>(sink: &mut W, entries: &[ReportEntry]) -> io::Result<()> {
        for entry in entries {
            writeln!(
                sink,
                "{:>20}:{:<4} {:>20} {:.6}",
                entry.location.file, entry.location.line, entry.location.function, entry.percentage
            )?;
        }
        Ok(())
    }

    pub fn write_json<W: Write + ?Sized>(&self, sink: &mut W) -> io::Result<()> {
        serde_json::to_writer_pretty(&mut *sink, self)?;
        writeln!(sink)
    }
}

/// Renders the shared `Profile` to a sink or to the configured destination.
/// Cheap to clone; clones are handed to the exit hook and signal watcher.
#[derive(Clone, Debug)]
pub struct Reporter {
    profile: Arc<Profile>,
    output: Output,
    format: ReportFormat,
}

impl Reporter {
    pub fn new(profile: Arc<Profile>, output: Output, format: ReportFormat) -> Self {
        Self {
            profile,
            output,
            format,
        }
    }

    pub fn output(&self) -> &Output {
        &self.output
    }

    pub fn report(&self) -> Report {
        let snapshot = self.profile.snapshot();
        Report::build(&snapshot, &mut NativeSymbolizer::new())
    }

    pub fn generate_report<W: Write + ?Sized>(&self, sink: &mut W) -> io::Result<()> {
        let report = self.report();
        log::debug!(
            "Writing report: {} samples, {} dropped",
            report.total_samples,
            report.dropped_samples
        );
        match self.format {
            ReportFormat::Text => report.write_text(sink)?,
            ReportFormat::Json => report.write_json(sink)?,
        }
        sink.flush()
    }

    /// Write a report to the configured output. A file is truncated first and
    /// closed before returning, also when writing fails.
    pub fn trigger_report(&self) -> Result<()> {
        let sink_error = |source| Error::SinkWrite {
            destination: self.output.to_string(),
            source,
        };
        match &self.output {
            Output::Stderr => self
                .generate_report(&mut io::stderr().lock())
                .map_err(sink_error),
            Output::File(path) => {
                let file = File::create(path).map_err(sink_error)?;
                let mut writer = BufWriter::new(file);
                self.generate_report(&mut writer).map_err(sink_error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::Sample;

    /// Maps code units to synthetic names; the line is the address's low
    /// digits.
    struct TableSymbolizer;

    impl Symbolizer for TableSymbolizer {
        fn locate(&mut self, call_site: &CallSite) -> Location {
            Location {
                file: "prog.rs".to_owned(),
                line: (call_site.address % 1000) as u32,
                function: format!("f{}", call_site.code_unit.0),
            }
        }
    }

    fn site(code_unit: usize, line: usize) -> CallSite {
        CallSite::new(code_unit, code_unit * 1000 + line)
    }

    fn profile_with(stacks: &[&[CallSite]]) -> Profile {
        let profile = Profile::new(64);
        for stack in stacks {
            profile.record(&Sample::from_call_sites(stack.iter().copied()));
        }
        profile
    }

    fn text(report: &Report) -> String {
        let mut out = Vec::new();
        report.write_text(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_empty_profile_writes_headers_only() {
        let report = Report::build(&Profile::default().snapshot(), &mut TableSymbolizer);
        assert_eq!(report.total_samples, 0);
        assert!(report.self_time.is_empty());
        assert!(report.cumulative_time.is_empty());
        assert_eq!(text(&report), "=== time ===\n== cumulative time ==\n");
    }

    #[test]
    fn test_reset_then_report_is_empty() {
        let profile = profile_with(&[&[site(1, 1)], &[site(2, 2), site(1, 5)]]);
        profile.reset();
        let report = Report::build(&profile.snapshot(), &mut TableSymbolizer);
        assert_eq!(report.total_samples, 0);
        assert_eq!(text(&report).lines().count(), 2);
    }

    #[test]
    fn test_entries_sorted_with_percentages() {
        let hot = site(1, 10);
        let cold = site(2, 20);
        let main = site(3, 30);
        let profile = profile_with(&[
            &[hot, main],
            &[hot, main],
            &[hot, main],
            &[cold, main],
        ]);
        let report = Report::build(&profile.snapshot(), &mut TableSymbolizer);

        assert_eq!(report.total_samples, 4);
        let self_names: Vec<_> = report
            .self_time
            .iter()
            .map(|e| e.location.function.as_str())
            .collect();
        assert_eq!(self_names, ["f1", "f2"]);
        assert_eq!(report.self_time[0].percentage, 75.0);
        assert_eq!(report.self_time[1].percentage, 25.0);

        assert_eq!(report.cumulative_time[0].location.function, "f3");
        assert_eq!(report.cumulative_time[0].percentage, 100.0);
    }

    #[test]
    fn test_equal_counts_break_ties_by_location() {
        let profile = profile_with(&[&[site(2, 7)], &[site(1, 9)], &[site(1, 3)]]);
        let report = Report::build(&profile.snapshot(), &mut TableSymbolizer);
        let order: Vec<_> = report
            .self_time
            .iter()
            .map(|e| (e.location.line, e.location.function.as_str()))
            .collect();
        assert_eq!(order, [(3, "f1"), (7, "f2"), (9, "f1")]);
    }

    #[test]
    fn test_call_sites_with_same_location_merge() {
        // Two addresses on the same line.
        let profile = profile_with(&[
            &[CallSite::new(1, 1005)],
            &[CallSite::new(1, 2005)],
        ]);
        let report = Report::build(&profile.snapshot(), &mut TableSymbolizer);
        assert_eq!(report.self_time.len(), 1);
        assert_eq!(report.self_time[0].count, 2);
        assert_eq!(report.self_time[0].percentage, 100.0);
    }

    #[test]
    fn test_same_location_in_distinct_code_units_stays_separate() {
        /// Every code unit reads as the same generic function.
        struct GenericSymbolizer;

        impl Symbolizer for GenericSymbolizer {
            fn locate(&mut self, _call_site: &CallSite) -> Location {
                Location {
                    file: "function.rs".to_owned(),
                    line: 250,
                    function: "call_once".to_owned(),
                }
            }
        }

        let leaf = site(1, 1);
        let first = site(2, 2);
        let second = site(3, 3);
        let profile = profile_with(&[&[leaf, first, second], &[leaf, first, second]]);
        let report = Report::build(&profile.snapshot(), &mut GenericSymbolizer);

        assert_eq!(report.total_samples, 2);
        assert_eq!(report.cumulative_time.len(), 3);
        for entry in &report.cumulative_time {
            assert_eq!(entry.count, 2);
            assert_eq!(entry.percentage, 100.0);
        }
    }

    #[test]
    fn test_text_line_format() {
        let profile = profile_with(&[&[site(1, 42)], &[site(1, 42)], &[site(3, 7)]]);
        let report = Report::build(&profile.snapshot(), &mut TableSymbolizer);
        let text = text(&report);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], SELF_HEADER);
        assert_eq!(
            lines[1],
            format!("{:>20}:{:<4} {:>20} {:.6}", "prog.rs", 42, "f1", 200.0 / 3.0)
        );
        assert_eq!(lines[3], CUMULATIVE_HEADER);
        assert_eq!(lines.len(), 6);
    }

    #[test]
    fn test_json_report() {
        let profile = profile_with(&[&[site(1, 1), site(2, 2)]]);
        let report = Report::build(&profile.snapshot(), &mut TableSymbolizer);
        let mut out = Vec::new();
        report.write_json(&mut out).unwrap();

        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["total_samples"], 1);
        assert_eq!(value["time"][0]["function"], "f1");
        assert_eq!(value["time"][0]["line"], 1);
        assert_eq!(value["cumulative_time"].as_array().unwrap().len(), 2);

        let parsed: Report = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed, report);
    }

    #[test]
    fn test_trigger_report_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.txt");
        std::fs::write(&path, "stale contents\n".repeat(100)).unwrap();

        let profile = Arc::new(Profile::default());
        let reporter = Reporter::new(profile, Output::File(path.clone()), ReportFormat::Text);
        reporter.trigger_report().unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "=== time ===\n== cumulative time ==\n");
    }

    #[test]
    fn test_trigger_report_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("profile.txt");
        let reporter = Reporter::new(
            Arc::new(Profile::default()),
            Output::File(path),
            ReportFormat::Text,
        );
        match reporter.trigger_report() {
            Err(Error::SinkWrite { destination, .. }) => {
                assert!(destination.ends_with("profile.txt"))
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_failing_sink_surfaces_error() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let reporter = Reporter::new(
            Arc::new(Profile::default()),
            Output::Stderr,
            ReportFormat::Text,
        );
        let err = reporter.generate_report(&mut Broken).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
