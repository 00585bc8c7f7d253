//! Prometheus text exposition of a health report, in the format the node
//! exporter's textfile collector reads.

use std::fmt::Write;

use super::{HealthReport, Severity};

fn gauge(out: &mut String, name: &str, help: &str) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} gauge", name);
}

fn severity_value(severity: Severity) -> u8 {
    match severity {
        Severity::Ok => 0,
        Severity::Warning => 1,
        Severity::Critical => 2,
    }
}

pub fn render(report: &HealthReport) -> String {
    let mut out = String::new();

    gauge(&mut out, "obs_backup_health_verdict", "Overall verdict (0 ok, 1 warning, 2 critical).");
    let _ = writeln!(out, "obs_backup_health_verdict {}", severity_value(report.verdict));

    gauge(&mut out, "obs_backup_check_status", "Per-check status (0 ok, 1 warning, 2 critical).");
    for check in &report.checks {
        let _ = writeln!(
            out,
            "obs_backup_check_status{{check=\"{}\"}} {}",
            check.name,
            severity_value(check.severity)
        );
    }

    gauge(&mut out, "obs_backup_archives", "Archives present per tier.");
    for tier in &report.tiers {
        let _ = writeln!(out, "obs_backup_archives{{tier=\"{}\"}} {}", tier.tier, tier.archives);
    }

    gauge(&mut out, "obs_backup_latest_age_seconds", "Age of the latest archive per tier.");
    for tier in &report.tiers {
        if let Some(age) = tier.latest_age_secs {
            let _ = writeln!(out, "obs_backup_latest_age_seconds{{tier=\"{}\"}} {}", tier.tier, age);
        }
    }

    gauge(&mut out, "obs_backup_latest_size_bytes", "Size of the latest archive per tier.");
    for tier in &report.tiers {
        if let Some(size) = tier.latest_size_bytes {
            let _ = writeln!(out, "obs_backup_latest_size_bytes{{tier=\"{}\"}} {}", tier.tier, size);
        }
    }

    gauge(&mut out, "obs_backup_latest_valid", "1 when the latest archive passed verification.");
    for tier in &report.tiers {
        let _ = writeln!(
            out,
            "obs_backup_latest_valid{{tier=\"{}\"}} {}",
            tier.tier,
            u8::from(tier.latest_valid)
        );
    }

    gauge(&mut out, "obs_backup_storage_bytes", "Bytes used under the artifact root.");
    let _ = writeln!(out, "obs_backup_storage_bytes {}", report.storage_bytes);

    gauge(&mut out, "obs_backup_log_lines", "Recent run log lines by level.");
    let _ = writeln!(out, "obs_backup_log_lines{{level=\"error\"}} {}", report.log_errors);
    let _ = writeln!(out, "obs_backup_log_lines{{level=\"warn\"}} {}", report.log_warnings);

    gauge(&mut out, "obs_backup_last_check_timestamp_seconds", "Unix time of this report.");
    let _ = writeln!(out, "obs_backup_last_check_timestamp_seconds {}", report.checked_at.timestamp());

    out
}
