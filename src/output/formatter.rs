//! Output formatters for run summaries and test listings
//!
//! Provides JSON, Table, and summary output formats.

use serde::Serialize;

use crate::models::{QueuePref, RunCounts, TestRegistry};

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    JsonPretty,
    Summary,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "table" => Some(OutputFormat::Table),
            "json" => Some(OutputFormat::Json),
            "json-pretty" | "jsonpretty" => Some(OutputFormat::JsonPretty),
            "summary" => Some(OutputFormat::Summary),
            _ => None,
        }
    }
}

/// Final tally of a run, as printed after the result stream
#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    #[serde(flatten)]
    pub counts: RunCounts,
    pub success: bool,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn new(counts: RunCounts, duration_ms: u64) -> Self {
        Self {
            success: counts.is_success(),
            counts,
            duration_ms,
        }
    }
}

#[derive(Serialize)]
struct ListedTest<'a> {
    name: &'a str,
    queue: Option<u32>,
    skip: bool,
}

/// Result formatter
pub struct ResultFormatter {
    format: OutputFormat,
    colorize: bool,
}

impl ResultFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            colorize: true,
        }
    }

    pub fn no_color(mut self) -> Self {
        self.colorize = false;
        self
    }

    /// Format the run summary
    pub fn format_summary(&self, summary: &RunSummary) -> String {
        match self.format {
            OutputFormat::Table => self.format_summary_table(summary),
            OutputFormat::Json => serde_json::to_string(summary).unwrap_or_default(),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(summary).unwrap_or_default(),
            OutputFormat::Summary => self.format_summary_brief(summary),
        }
    }

    fn paint(&self, text: String, color: &str) -> String {
        if self.colorize {
            format!("\x1b[{color}m{text}\x1b[0m")
        } else {
            text
        }
    }

    fn format_summary_table(&self, summary: &RunSummary) -> String {
        let c = &summary.counts;
        let mut output = String::new();

        output.push_str("\n╔══════════════════════════════════════════════════════════════╗\n");
        output.push_str("║  Run Summary                                                 ║\n");
        output.push_str("╠══════════════════════════════════════════════════════════════╣\n");

        let pass_str = self.paint(format!("{:5}", c.pass), "32");
        let fail_str = if c.fail > 0 {
            self.paint(format!("{:5}", c.fail), "31")
        } else {
            format!("{:5}", c.fail)
        };
        let lost_str = if c.lost > 0 {
            self.paint(format!("{:5}", c.lost), "31")
        } else {
            format!("{:5}", c.lost)
        };

        output.push_str(&format!(
            "║  Planned: {:5} | Ran: {:5} | Pass Rate: {:5.1}%              ║\n",
            c.planned,
            c.ran(),
            c.pass_rate()
        ));
        output.push_str(&format!(
            "║  Pass: {} | Fail: {} | Skip: {:5} | Lost: {}           ║\n",
            pass_str, fail_str, c.skip, lost_str
        ));

        let verdict = if summary.success {
            self.paint("SUCCESS".to_string(), "32")
        } else {
            self.paint("FAILURE".to_string(), "31")
        };
        output.push_str(&format!(
            "║  Result: {} | Duration: {:8}ms                         ║\n",
            verdict, summary.duration_ms
        ));
        output.push_str("╚══════════════════════════════════════════════════════════════╝\n");

        output
    }

    fn format_summary_brief(&self, summary: &RunSummary) -> String {
        let c = &summary.counts;
        format!(
            "{}/{} passed, {} skipped, {} failed, {} lost ({:.1}%) in {}ms",
            c.pass,
            c.planned,
            c.skip,
            c.fail,
            c.lost,
            c.pass_rate(),
            summary.duration_ms
        )
    }

    /// Format the tests a selection enabled
    pub fn format_listing(&self, registry: &TestRegistry) -> String {
        let tests: Vec<ListedTest<'_>> = registry
            .enabled()
            .map(|(_, def)| ListedTest {
                name: &def.name,
                queue: match def.queue_pref() {
                    QueuePref::Any => None,
                    QueuePref::Fixed(q) => Some(q),
                },
                skip: def.skip,
            })
            .collect();

        match self.format {
            OutputFormat::Json => serde_json::to_string(&tests).unwrap_or_default(),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(&tests).unwrap_or_default(),
            OutputFormat::Summary => format!("{} tests enabled", tests.len()),
            OutputFormat::Table => {
                let mut output = String::new();
                for t in &tests {
                    let queue = t.queue.map_or_else(|| "all".to_string(), |q| format!("q{q}"));
                    let flag = if t.skip {
                        self.paint("skip".to_string(), "33")
                    } else {
                        String::new()
                    };
                    output.push_str(&format!("{:50} {:>5} {}\n", t.name, queue, flag));
                }
                output.push_str(&format!("{} tests enabled\n", tests.len()));
                output
            }
        }
    }
}

impl Default for ResultFormatter {
    fn default() -> Self {
        Self::new(OutputFormat::Table)
    }
}
