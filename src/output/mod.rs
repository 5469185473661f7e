//! Output module
//!
//! Console result lines, the JUnit XML report, and the formatted summaries
//! printed by the command-line front end.

mod formatter;
mod junit;
mod reporter;

pub use formatter::{OutputFormat, ResultFormatter, RunSummary};
pub use junit::JunitReport;
pub use reporter::Reporter;
