//! Rendering of run outcomes: the summary line, synthetic failure documents
//! for runs that produced no results, and the terminal report.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::config::XmlResultJargon;
use crate::core::error::Result;
use crate::logs::{LogKind, Logs};
use crate::xml::Element;

use super::parser::ResultSummary;
use super::{TestOutcome, TestVerdict};

impl fmt::Display for ResultSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tests run: {} Passed: {} Inconclusive: {} Failed: {} Ignored: {}",
            self.total,
            self.passed,
            self.inconclusive,
            self.failed + self.errors,
            self.skipped
        )
    }
}

/// A failure to record in place of the results the run never produced.
#[derive(Debug, Clone)]
pub struct FailureReport<'a> {
    /// Short tag used in the file name (`crash`, `launch`, `timeout`...).
    pub source: &'a str,
    pub app_name: &'a str,
    /// Device or target description the run used.
    pub variation: &'a str,
    pub title: &'a str,
    pub message: &'a str,
    /// File whose content becomes the stack trace, usually the main log.
    pub details: Option<&'a Path>,
}

/// Write a one-test failed document in the run's result flavor and register it.
pub fn write_failure(logs: &Logs, jargon: XmlResultJargon, report: &FailureReport<'_>) -> Result<PathBuf> {
    let details = report
        .details
        .and_then(|p| std::fs::read_to_string(p).ok())
        .unwrap_or_default();

    let (prefix, document) = match jargon {
        XmlResultJargon::NUnitV3 => ("vsts-nunit", nunit_failure(logs, report, &details)),
        _ => ("vsts-xunit", xunit_failure(report, &details)),
    };

    let path = logs.create_file(
        &format!("{}-{}.xml", prefix, report.source),
        LogKind::XmlResult,
        true,
    );
    document.write_file(&path)?;
    tracing::debug!(path = %path.display(), source = report.source, "wrote failure result");
    Ok(path)
}

fn failure(message: &str, details: &str) -> Element {
    Element::new("failure")
        .with_child(Element::new("message").with_text(message))
        .with_child(Element::new("stack-trace").with_text(details))
}

fn nunit_failure(logs: &Logs, report: &FailureReport<'_>, details: &str) -> Element {
    let now = Local::now();
    let counts = |e: Element| {
        e.with_attr("testcasecount", "1")
            .with_attr("result", "Failed")
            .with_attr("total", "1")
            .with_attr("passed", "0")
            .with_attr("failed", "1")
            .with_attr("inconclusive", "0")
            .with_attr("skipped", "0")
            .with_attr("asserts", "1")
    };

    let attachments = crate::util::fs::list_files(logs.directory())
        .unwrap_or_default()
        .into_iter()
        .filter(|p| {
            !p.file_name()
                .is_some_and(|n| n.to_string_lossy().contains("nunit"))
        })
        .fold(Element::new("attachments"), |block, path| {
            block.with_child(
                Element::new("attachment")
                    .with_child(Element::new("filePath").with_text(path.display().to_string())),
            )
        });

    let case = Element::new("test-case")
        .with_attr("id", "1")
        .with_attr("name", report.title)
        .with_attr("fullname", report.title)
        .with_attr("result", "Failed")
        .with_attr("duration", "0")
        .with_attr("asserts", "1")
        .with_child(failure(report.message, details));

    let suite = counts(
        Element::new("test-suite")
            .with_attr("type", "Assembly")
            .with_attr("id", "0")
            .with_attr("name", report.app_name)
            .with_attr("fullname", report.app_name)
            .with_attr("runstate", "Runnable"),
    )
    .with_child(Element::new("properties").with_child(
        Element::new("property")
            .with_attr("name", "_VARIATION")
            .with_attr("value", report.variation),
    ))
    .with_child(failure(report.message, details))
    .with_child(attachments)
    .with_child(case);

    counts(
        Element::new("test-run")
            .with_attr("id", "2")
            .with_attr("engine-version", "3.9.0.0")
            .with_attr("clr-version", "4.0.30319.42000")
            .with_attr("start-time", now.format("%Y-%m-%d %H:%M:%SZ").to_string())
            .with_attr("end-time", now.format("%Y-%m-%d %H:%M:%SZ").to_string())
            .with_attr("duration", "0"),
    )
    .with_child(suite)
}

fn xunit_failure(report: &FailureReport<'_>, details: &str) -> Element {
    let now = Local::now();
    let test = Element::new("test")
        .with_attr("name", report.title)
        .with_attr("type", report.title)
        .with_attr("method", report.source)
        .with_attr("time", "0")
        .with_attr("result", "Fail")
        .with_child(failure(report.message, details).with_attr("exception-type", "TestRunFailure"));

    let collection = Element::new("collection")
        .with_attr("name", report.title)
        .with_attr("total", "1")
        .with_attr("passed", "0")
        .with_attr("failed", "1")
        .with_attr("skipped", "0")
        .with_attr("time", "0")
        .with_child(test);

    let assembly = Element::new("assembly")
        .with_attr("name", report.app_name)
        .with_attr("environment", report.variation)
        .with_attr("test-framework", "xUnit.net")
        .with_attr("run-date", now.format("%Y-%m-%d").to_string())
        .with_attr("run-time", now.format("%H:%M:%S").to_string())
        .with_attr("total", "1")
        .with_attr("passed", "0")
        .with_attr("failed", "1")
        .with_attr("skipped", "0")
        .with_attr("errors", "0")
        .with_attr("time", "0")
        .with_child(collection);

    Element::new("assemblies").with_child(assembly)
}

/// Print the outcome of a run and the artifacts it left behind.
pub fn print_report(outcome: &TestOutcome, logs: &Logs) {
    let status = match outcome.verdict {
        TestVerdict::Succeeded | TestVerdict::Finished => "ok",
        _ => "FAILED",
    };
    println!("\ntest result: {status}. {}: {}", outcome.verdict, outcome.message);

    let entries = logs.entries();
    if entries.is_empty() {
        return;
    }
    println!("\n--- artifacts ---");
    for entry in entries {
        println!("{:>16}: {}", entry.kind.to_string(), entry.path.display());
    }
    println!("--- end artifacts ---");
}
