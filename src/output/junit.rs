//! JUnit XML report
//!
//! Test cases are collected during the run and the whole document is written
//! when the run finishes, since the totals sit on the root elements.
//! Failures are intentional test failures; crashes are reported as errors.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::Writer;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Result, RunnerError};
use crate::models::{RunCounts, Verdict};

const LOST_MESSAGE: &str = "test was lost, it likely crashed";

/// A JUnit document bound to its output file
pub struct JunitReport {
    path: PathBuf,
    file: Option<File>,
    suite: String,
    cases: Vec<(String, Verdict)>,
}

impl JunitReport {
    /// Open the output file right away so a bad path fails before any test
    /// runs.
    pub fn create(path: impl AsRef<Path>, suite: impl Into<String>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|source| RunnerError::Junit {
            path: path.display().to_string(),
            source,
        })?;

        Ok(Self {
            path,
            file: Some(file),
            suite: suite.into(),
            cases: Vec::new(),
        })
    }

    pub fn add(&mut self, name: &str, verdict: Verdict) {
        self.cases.push((name.to_string(), verdict));
    }

    /// Write the document and close the file.
    pub fn finish(&mut self, counts: &RunCounts) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };

        let mut out = BufWriter::new(file);
        self.write_document(&mut out, counts)
            .and_then(|_| out.flush())
            .map_err(|source| RunnerError::Junit {
                path: self.path.display().to_string(),
                source,
            })?;

        debug!("Wrote {} test cases to {}", self.cases.len(), self.path.display());
        Ok(())
    }

    fn write_document<W: Write>(&self, out: W, counts: &RunCounts) -> io::Result<()> {
        let mut writer = Writer::new_with_indent(out, b' ', 2);

        let tests = counts.ran().to_string();
        let failures = counts.fail.to_string();
        let errors = counts.lost.to_string();
        let disabled = counts.skip.to_string();
        let totals = [
            ("tests", tests.as_str()),
            ("failures", failures.as_str()),
            ("errors", errors.as_str()),
            ("disabled", disabled.as_str()),
        ];

        emit(
            &mut writer,
            Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)),
        )?;

        let mut root = BytesStart::new("testsuites");
        root.extend_attributes(totals);
        emit(&mut writer, Event::Start(root))?;

        let mut suite = BytesStart::new("testsuite");
        suite.push_attribute(("name", self.suite.as_str()));
        suite.extend_attributes(totals);
        emit(&mut writer, Event::Start(suite))?;

        for (name, verdict) in &self.cases {
            let mut case = BytesStart::new("testcase");
            case.push_attribute(("status", verdict.as_str()));
            case.push_attribute(("name", name.as_str()));

            match verdict {
                Verdict::Pass => emit(&mut writer, Event::Empty(case))?,
                Verdict::Fail | Verdict::Skip | Verdict::Lost => {
                    emit(&mut writer, Event::Start(case))?;
                    emit(&mut writer, Event::Empty(detail(*verdict)))?;
                    emit(&mut writer, Event::End(BytesEnd::new("testcase")))?;
                }
            }
        }

        emit(&mut writer, Event::End(BytesEnd::new("testsuite")))?;
        emit(&mut writer, Event::End(BytesEnd::new("testsuites")))?;
        writer.get_mut().write_all(b"\n")
    }
}

fn detail(verdict: Verdict) -> BytesStart<'static> {
    match verdict {
        Verdict::Fail => BytesStart::new("failure"),
        Verdict::Skip => BytesStart::new("skipped"),
        _ => {
            let mut error = BytesStart::new("error");
            error.push_attribute(("type", "lost"));
            error.push_attribute(("message", LOST_MESSAGE));
            error
        }
    }
}

fn emit<W: Write>(writer: &mut Writer<W>, event: Event<'_>) -> io::Result<()> {
    writer.write_event(event).map_err(io::Error::other)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(verdicts: &[Verdict]) -> RunCounts {
        let mut counts = RunCounts::new(verdicts.len() as u32);
        for v in verdicts {
            counts.record(*v);
        }
        counts
    }

    #[test]
    fn test_document_structure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.xml");

        let mut report = JunitReport::create(&path, "crucible").unwrap();
        report.add("a.q0", Verdict::Pass);
        report.add("b.q0", Verdict::Fail);
        report.add("c.q0", Verdict::Skip);
        report.add("d.q1", Verdict::Lost);
        report.finish(&counts(&[
            Verdict::Pass,
            Verdict::Fail,
            Verdict::Skip,
            Verdict::Lost,
        ]))
        .unwrap();

        let xml = std::fs::read_to_string(&path).unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains(
            "<testsuites tests=\"4\" failures=\"1\" errors=\"1\" disabled=\"1\">"
        ));
        assert!(xml.contains(
            "<testsuite name=\"crucible\" tests=\"4\" failures=\"1\" errors=\"1\" disabled=\"1\">"
        ));
        assert!(xml.contains("<testcase status=\"pass\" name=\"a.q0\"/>"));
        assert!(xml.contains("<failure/>"));
        assert!(xml.contains("<skipped/>"));
        assert!(xml.contains(
            "<error type=\"lost\" message=\"test was lost, it likely crashed\"/>"
        ));
    }

    #[test]
    fn test_unwritable_path_fails_early() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("results.xml");
        assert!(matches!(
            JunitReport::create(&path, "crucible"),
            Err(RunnerError::Junit { .. })
        ));
    }

    #[test]
    fn test_finish_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.xml");
        let mut report = JunitReport::create(&path, "suite").unwrap();
        report.finish(&RunCounts::default()).unwrap();
        report.finish(&RunCounts::default()).unwrap();
        let xml = std::fs::read_to_string(&path).unwrap();
        assert_eq!(xml.matches("<testsuites").count(), 1);
    }
}
