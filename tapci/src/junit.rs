//! JUnit-style XML and the plain-text steps summary.
//!
//! The document is small and flat, so it is written by hand: attribute values
//! are escaped and step output goes into CDATA sections after control
//! characters are stripped.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};

use crate::core::truncate::truncate_around_error;
use crate::io::config::Settings;
use crate::report::Report;
use crate::step::Step;

/// Output limits applied to every step body.
#[derive(Debug, Clone, Copy)]
pub struct OutputLimits {
    pub max_bytes: usize,
    pub context_lines: usize,
}

impl From<&Settings> for OutputLimits {
    fn from(settings: &Settings) -> Self {
        Self {
            max_bytes: settings.junit_output_limit_bytes,
            context_lines: settings.junit_context_lines,
        }
    }
}

pub fn render(reports: &[Report], limits: OutputLimits) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<testsuites>\n");
    for report in reports.iter().filter(|report| !report.is_empty()) {
        render_suite(&mut xml, report, limits);
    }
    xml.push_str("</testsuites>\n");
    xml
}

fn render_suite(xml: &mut String, report: &Report, limits: OutputLimits) {
    let timestamp = report
        .steps()
        .first()
        .and_then(Step::start_time)
        .map(format_time)
        .unwrap_or_default();
    xml.push_str(&format!(
        "  <testsuite name=\"{}\" tests=\"{}\" failures=\"{}\" skipped=\"{}\" timestamp=\"{}\">\n",
        escape_attr(report.name()),
        report.steps().len(),
        report.failed_steps().len(),
        report.ignored_steps().len(),
        timestamp,
    ));
    for step in report.steps() {
        render_case(xml, step, limits);
    }
    xml.push_str("  </testsuite>\n");
}

fn render_case(xml: &mut String, step: &Step, limits: OutputLimits) {
    let timestamp = step.start_time().map(format_time).unwrap_or_default();
    xml.push_str(&format!(
        "    <testcase name=\"{}\" status=\"{}\" time=\"{:.3}\" timestamp=\"{}\"",
        escape_attr(&step.command_short()),
        step.status(),
        step.time(),
        timestamp,
    ));
    let body = step.output().map(|output| cdata(output, limits));
    let command = escape_attr(&step.command_trimmed());
    let child = if step.failed() {
        Some(element("failure", &format!("failed: {command}"), body.as_deref()))
    } else if step.ignored() {
        Some(element("skipped", &format!("ignored: {command}"), body.as_deref()))
    } else {
        body.map(|body| format!("<system-out>{body}</system-out>"))
    };
    match child {
        Some(child) => {
            xml.push_str(">\n");
            xml.push_str(&format!("      {child}\n"));
            xml.push_str("    </testcase>\n");
        }
        None => xml.push_str("/>\n"),
    }
}

/// `<tag message="...">body</tag>`, self-closing without a body.
fn element(tag: &str, message: &str, body: Option<&str>) -> String {
    match body {
        Some(body) => format!("<{tag} message=\"{message}\">{body}</{tag}>"),
        None => format!("<{tag} message=\"{message}\"/>"),
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn escape_attr(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in strip_control(value).chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            '\n' => escaped.push_str("&#10;"),
            '\r' => escaped.push_str("&#13;"),
            '\t' => escaped.push_str("&#9;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Characters XML 1.0 cannot carry, even escaped.
fn strip_control(value: &str) -> String {
    value
        .chars()
        .filter(|ch| matches!(ch, '\t' | '\n' | '\r') || !ch.is_control())
        .filter(|ch| !matches!(ch, '\u{FFFE}' | '\u{FFFF}'))
        .collect()
}

/// Capped, sanitized output wrapped in CDATA; `]]>` is split across sections.
fn cdata(output: &str, limits: OutputLimits) -> String {
    let capped = truncate_around_error(output, limits.max_bytes, limits.context_lines);
    let clean = strip_control(&capped).replace("]]>", "]]]]><![CDATA[>");
    format!("<![CDATA[{clean}]]>")
}

pub fn write_junit(path: &Path, reports: &[Report], settings: &Settings) -> Result<()> {
    let xml = render(reports, OutputLimits::from(settings));
    fs::write(path, xml).with_context(|| format!("write {}", path.display()))
}

/// `All steps passed!` or the failed commands, then ignored-step warnings.
pub fn steps_summary(reports: &[Report]) -> String {
    let failed: Vec<&Step> = reports.iter().flat_map(Report::failed_steps).collect();
    let ignored: Vec<&Step> = reports.iter().flat_map(Report::ignored_steps).collect();

    let mut summary = String::new();
    if failed.is_empty() {
        summary.push_str("All steps passed!\n");
    } else {
        let noun = if failed.len() == 1 { "step" } else { "steps" };
        summary.push_str(&format!("Error: {} failed {noun}!\n", failed.len()));
        for step in &failed {
            summary.push_str(&format!("{}\n", step.command_trimmed()));
        }
    }
    if !ignored.is_empty() {
        let noun = if ignored.len() == 1 { "step" } else { "steps" };
        summary.push_str(&format!("Warning: {} failed {noun} ignored!\n", ignored.len()));
        for step in &ignored {
            summary.push_str(&format!("{}\n", step.command_trimmed()));
        }
    }
    summary
}

pub fn write_steps_summary(path: &Path, reports: &[Report]) -> Result<()> {
    let summary = steps_summary(reports);
    print!("{summary}");
    fs::write(path, summary).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepRequest;
    use crate::test_support::{ContextFixture, ScriptedRunner};

    fn sample_reports(runner: &ScriptedRunner, fixture: &ContextFixture) -> Vec<Report> {
        let ctx = fixture.context(runner);
        let mut formulae = Report::new("formulae", ctx.repository());
        formulae
            .record(&ctx, StepRequest::new(["brew", "install", "foo"]))
            .expect("install");
        formulae
            .record(&ctx, StepRequest::new(["brew", "test", "--verbose", "foo"]))
            .expect("test");
        formulae
            .record(
                &ctx,
                StepRequest::new(["brew", "audit", "foo"]).ignore_failures(true),
            )
            .expect("audit");
        vec![formulae, Report::new("cleanup_after", ctx.repository())]
    }

    #[test]
    fn renders_suites_and_statuses() {
        let runner = ScriptedRunner::new();
        runner.respond("brew install", true, "installed <foo> & friends\n");
        runner.respond("brew test", false, "Error: test failed ]]> oops\u{7}\n");
        runner.respond("brew audit", false, "style\n");
        let fixture = ContextFixture::new().expect("fixture");
        let reports = sample_reports(&runner, &fixture);

        let xml = render(&reports, OutputLimits::from(&Settings::default()));
        let doc = roxmltree::Document::parse(&xml).expect("well-formed");
        let suites: Vec<_> = doc
            .descendants()
            .filter(|node| node.has_tag_name("testsuite"))
            .collect();
        assert_eq!(suites.len(), 1, "empty reports are omitted");
        assert_eq!(suites[0].attribute("tests"), Some("3"));
        assert_eq!(suites[0].attribute("failures"), Some("1"));
        assert_eq!(suites[0].attribute("skipped"), Some("1"));

        let cases: Vec<_> = doc
            .descendants()
            .filter(|node| node.has_tag_name("testcase"))
            .collect();
        assert_eq!(cases[0].attribute("name"), Some("install foo"));
        assert_eq!(cases[0].attribute("status"), Some("passed"));
        let out = cases[0]
            .children()
            .find(|node| node.has_tag_name("system-out"))
            .and_then(|node| node.text())
            .expect("system-out");
        assert!(out.contains("<foo> & friends"));

        let failure = cases[1]
            .children()
            .find(|node| node.has_tag_name("failure"))
            .expect("failure");
        assert_eq!(failure.attribute("message"), Some("failed: brew test --verbose foo"));
        let text: String = failure
            .children()
            .filter_map(|node| node.text())
            .collect();
        assert!(text.contains("]]> oops"));
        assert!(!text.contains('\u{7}'));

        assert!(cases[2].children().any(|node| node.has_tag_name("skipped")));
    }

    #[test]
    fn steps_without_output_close_their_elements() {
        let runner = ScriptedRunner::new();
        runner.respond("brew test", false, "");
        runner.respond("brew audit", false, "  \n");
        let fixture = ContextFixture::new().expect("fixture");
        let reports = sample_reports(&runner, &fixture);

        let xml = render(&reports, OutputLimits::from(&Settings::default()));
        assert!(xml.contains("<testcase name=\"install foo\" status=\"passed\""));
        assert!(xml.contains("<failure message=\"failed: brew test --verbose foo\"/>"));
        assert!(xml.contains("<skipped message=\"ignored: brew audit foo\"/>"));
        let doc = roxmltree::Document::parse(&xml).expect("well-formed");
        let install = doc
            .descendants()
            .find(|node| node.attribute("name") == Some("install foo"))
            .expect("install case");
        assert!(!install.has_children());
    }

    #[test]
    fn long_output_is_capped_near_the_error() {
        let runner = ScriptedRunner::new();
        let mut noise = String::new();
        for index in 0..2000 {
            noise.push_str(&format!("line {index} of build output\n"));
        }
        noise.push_str("Error: the real problem\n");
        noise.push_str("trailing\n");
        runner.respond("brew test", false, &noise);
        let fixture = ContextFixture::new().expect("fixture");
        let reports = sample_reports(&runner, &fixture);

        let limits = OutputLimits {
            max_bytes: 512,
            context_lines: 2,
        };
        let xml = render(&reports, limits);
        assert!(xml.contains("Error: the real problem"));
        assert!(xml.contains("line 1998 of build output"));
        assert!(!xml.contains("line 10 of build output"));
    }

    #[test]
    fn summary_lists_failures_then_ignored() {
        let runner = ScriptedRunner::new();
        runner.respond("brew test", false, "Error: failed\n");
        runner.respond("brew audit", false, "style\n");
        let fixture = ContextFixture::new().expect("fixture");
        let reports = sample_reports(&runner, &fixture);
        assert_eq!(
            steps_summary(&reports),
            "Error: 1 failed step!\nbrew test --verbose foo\nWarning: 1 failed step ignored!\nbrew audit foo\n"
        );
    }

    #[test]
    fn summary_all_passed() {
        let runner = ScriptedRunner::new();
        let fixture = ContextFixture::new().expect("fixture");
        let reports = sample_reports(&runner, &fixture);
        assert_eq!(steps_summary(&reports), "All steps passed!\n");
    }
}
