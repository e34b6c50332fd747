use std::fmt::Write;

use crate::ScanReport;

/// Plain listing: one line per filter, then load problems.
pub fn render_text(report: &ScanReport) -> String {
    let mut out = String::new();
    for plugin in &report.plugins {
        let _ = write!(
            out,
            "plugin {} (api {}/{})",
            plugin.file, plugin.weed_api, plugin.filter_api
        );
        if plugin.suspicious {
            out.push_str(" [suspicious handshake]");
        }
        out.push('\n');
    }
    for filter in &report.filters {
        let _ = write!(
            out,
            "  {:<40} {:<11} {} by {} v{}",
            filter.hashname, filter.category, filter.name, filter.author, filter.version
        );
        if filter.hidden {
            out.push_str(" (hidden)");
        }
        out.push('\n');
    }
    for problem in &report.failed {
        let _ = writeln!(out, "failed: {}: {}", problem.source, problem.reason);
    }
    for problem in &report.rejected {
        let _ = writeln!(out, "rejected: {}: {}", problem.source, problem.reason);
    }
    let _ = writeln!(
        out,
        "{} plugins, {} filters, {} failed, {} rejected",
        report.plugins.len(),
        report.filters.len(),
        report.failed.len(),
        report.rejected.len()
    );
    out
}

pub fn render_json(report: &ScanReport) -> serde_json::Result<String> {
    serde_json::to_string_pretty(report)
}
