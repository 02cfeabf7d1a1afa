//! Result file detection, cleaning and summarizing, plus the log scraping
//! the reporter uses to find process ids and crash reasons.

use regex::Regex;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::config::XmlResultJargon;
use crate::core::error::{Error, Result};
use crate::xml::Element;

static FAILED_COUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Failed:\s*(\d+)").unwrap_or_else(|_| unreachable!("valid literal pattern"))
});

static MAIN_LOG_PID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"was launched with pid '(\d+)'").unwrap_or_else(|_| unreachable!("valid literal pattern"))
});

const RUN_LOG_PID_PREFIX: &str = "Application launched. PID = ";

/// Counts extracted from a result document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResultSummary {
    pub total: i64,
    pub passed: i64,
    pub failed: i64,
    pub errors: i64,
    pub inconclusive: i64,
    pub skipped: i64,
}

impl ResultSummary {
    pub fn has_failures(&self) -> bool {
        self.failed + self.errors > 0
    }
}

/// Identify the document flavor from the first telling line.
pub fn detect_jargon(path: &Path) -> Option<XmlResultJargon> {
    let file = File::open(path).ok()?;
    BufReader::new(file)
        .lines()
        .map_while(|l| l.ok())
        .filter(|l| !l.contains("ping"))
        .find_map(|line| {
            if line.contains("test-run") {
                Some(XmlResultJargon::NUnitV3)
            } else if line.contains("TouchUnitTestRun") {
                Some(XmlResultJargon::TouchUnit)
            } else if line.contains("test-results") {
                Some(XmlResultJargon::NUnitV2)
            } else if line.contains("<assemblies>") {
                Some(XmlResultJargon::XUnit)
            } else if line.contains("<TestRun") {
                Some(XmlResultJargon::Trx)
            } else {
                None
            }
        })
}

/// Strip the listener noise around the result document.
pub fn clean(source: &Path, destination: &Path) -> Result<()> {
    let reader = BufReader::new(File::open(source)?);
    let mut writer = BufWriter::new(File::create(destination)?);

    for line in reader.lines() {
        let line = line?;
        if line.starts_with("ping")
            || line.contains("TouchUnitTestRun")
            || line.contains("NUnitOutput")
            || line.contains("<!--")
            || line.is_empty()
        {
            continue;
        }
        // Always the last node of a TouchUnit document.
        if line.contains("TouchUnitExtraData") {
            break;
        }
        writeln!(writer, "{}", line)?;
    }
    writer.flush()?;
    Ok(())
}

/// Where the cleaned copy of `test_log` goes before it gets its final name.
pub fn cleaned_path(test_log: &Path) -> PathBuf {
    let candidate = test_log.with_extension("xml");
    if candidate != test_log {
        return candidate;
    }
    let stem = test_log
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    test_log.with_file_name(format!("{}-clean.xml", stem))
}

/// `nunit-<file>` or `xunit-<file>` next to `path`.
pub fn final_path(path: &Path, jargon: XmlResultJargon) -> PathBuf {
    let prefix = match jargon {
        XmlResultJargon::TouchUnit | XmlResultJargon::NUnitV2 | XmlResultJargon::NUnitV3 => "nunit-",
        XmlResultJargon::XUnit => "xunit-",
        XmlResultJargon::Trx | XmlResultJargon::Missing => return path.to_path_buf(),
    };
    prefixed(path, prefix)
}

/// `vsts-<file>` next to `path`, the name CI uploads pick up.
pub fn vsts_path(path: &Path) -> PathBuf {
    prefixed(path, "vsts-")
}

fn prefixed(path: &Path, prefix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{}{}", prefix, name))
}

/// Attach `attachments` to the first assembly suite and to every failed test
/// case, and name every assembly suite after the app.
///
/// Returns `false` when the document has no assembly suite to enrich.
pub fn add_attachments(root: &mut Element, app_name: &str, attachments: &[PathBuf]) -> bool {
    let block = attachments.iter().fold(Element::new("attachments"), |block, path| {
        block.with_child(
            Element::new("attachment")
                .with_child(Element::new("filePath").with_text(path.display().to_string())),
        )
    });

    let mut found = false;
    root.visit_mut(&mut |element: &mut Element| {
        if element.name != "test-suite" || element.attr("type") != Some("Assembly") {
            return;
        }
        if !found {
            element.children.push(block.clone());
            found = true;
        }
        element.set_attr("name", app_name);
        element.set_attr("fullname", app_name);
        element.visit_mut(&mut |case: &mut Element| {
            if case.name == "test-case" && case.attr("result") == Some("Failed") {
                case.children.push(block.clone());
            }
        });
    });
    found
}

/// Read the counts of a result document.
pub fn summarize(root: &Element, jargon: XmlResultJargon) -> Result<ResultSummary> {
    let first = |name: &str| -> Result<&Element> {
        if root.name == name {
            return Ok(root);
        }
        root.descendants(name)
            .into_iter()
            .next()
            .ok_or_else(|| Error::xml(format!("result document has no <{}> element", name)))
    };

    match jargon {
        XmlResultJargon::XUnit => {
            let assemblies = root.descendants("assembly");
            if assemblies.is_empty() && root.name != "assemblies" {
                return Err(Error::xml("result document has no <assemblies> element"));
            }
            Ok(assemblies.iter().fold(ResultSummary::default(), |mut s, a| {
                s.total += a.attr_i64("total");
                s.passed += a.attr_i64("passed");
                s.failed += a.attr_i64("failed");
                s.errors += a.attr_i64("errors");
                s.skipped += a.attr_i64("skipped");
                s
            }))
        }
        XmlResultJargon::NUnitV3 => {
            let run = first("test-run")?;
            Ok(ResultSummary {
                total: run.attr_i64("total"),
                passed: run.attr_i64("passed"),
                failed: run.attr_i64("failed"),
                errors: 0,
                inconclusive: run.attr_i64("inconclusive"),
                skipped: run.attr_i64("skipped"),
            })
        }
        XmlResultJargon::NUnitV2 | XmlResultJargon::TouchUnit => {
            let results = first("test-results")?;
            let total = results.attr_i64("total");
            let failures = results.attr_i64("failures");
            let errors = results.attr_i64("errors");
            let not_run = results.attr_i64("not-run");
            let inconclusive = results.attr_i64("inconclusive");
            let ignored = results.attr_i64("ignored");
            Ok(ResultSummary {
                total,
                passed: (total - failures - errors - inconclusive - ignored - not_run).max(0),
                failed: failures,
                errors,
                inconclusive,
                skipped: ignored + not_run,
            })
        }
        XmlResultJargon::Trx => {
            let counters = first("Counters")?;
            Ok(ResultSummary {
                total: counters.attr_i64("total"),
                passed: counters.attr_i64("passed"),
                failed: counters.attr_i64("failed"),
                errors: counters.attr_i64("error"),
                inconclusive: counters.attr_i64("inconclusive"),
                skipped: counters.attr_i64("notExecuted"),
            })
        }
        XmlResultJargon::Missing => Err(Error::xml("no result document flavor to summarize")),
    }
}

/// Plain text results: the first "Tests run:" line is the summary. Any
/// "[FAIL]" line, or a summary with failures, marks the run failed.
pub fn scan_text(text: &str) -> (Option<String>, bool) {
    let mut summary: Option<String> = None;
    let mut failed = false;

    for line in text.lines() {
        if line.contains("[FAIL]") {
            failed = true;
        }
        if summary.is_none() && line.contains("Tests run:") {
            let failures = FAILED_COUNT
                .captures(line)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<u64>().ok())
                .unwrap_or(0);
            failed |= failures > 0;
            summary = Some(line.trim().to_string());
        }
    }
    (summary, failed)
}

/// What the launcher's own output says about the launch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunLogScan {
    pub pid: Option<u32>,
    pub launch_failure: bool,
}

/// Look for the app's pid and for launch errors in launcher output.
pub fn scan_run_log(lines: &[String]) -> RunLogScan {
    let mut scan = RunLogScan::default();
    for line in lines {
        if let Some(rest) = line.strip_prefix(RUN_LOG_PID_PREFIX) {
            if let Ok(pid) = rest.trim().parse() {
                scan.pid = Some(pid);
            }
        } else if line.contains("Launched ") && line.contains(" with pid ") {
            if let Some(Ok(pid)) = line.split_whitespace().last().map(str::parse) {
                scan.pid = Some(pid);
            }
        } else if line.contains("error MT1008") {
            scan.launch_failure = true;
        }
    }
    scan
}

/// The app pid as reported in the main log.
pub fn pid_from_main_log(text: &str) -> Option<u32> {
    MAIN_LOG_PID
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// The `reason` recorded for `pid` in a JSON crash report.
///
/// Reports may hold several concatenated JSON documents (a header and a
/// body); all of them are searched.
pub fn crash_reason(report: &str, pid: u32) -> Result<Option<String>> {
    let documents = serde_json::Deserializer::from_str(report).into_iter::<serde_json::Value>();
    for document in documents {
        let document = document?;
        let Some(processes) = document.get("processes").and_then(|p| p.as_array()) else {
            continue;
        };
        for process in processes {
            let matches = match process.get("pid") {
                Some(serde_json::Value::Number(n)) => n.as_u64() == Some(u64::from(pid)),
                Some(serde_json::Value::String(s)) => s.trim() == pid.to_string(),
                _ => false,
            };
            if !matches {
                continue;
            }
            if let Some(reason) = process.get("reason").and_then(|r| r.as_str()) {
                return Ok(Some(reason.to_string()));
            }
        }
    }
    Ok(None)
}
