use std::io::IsTerminal;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

use crate::cmd::SelftestReport;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct ReportOutput<'a> {
    #[serde(flatten)]
    report: &'a SelftestReport,
    timestamp: String,
}

pub fn print_report(report: &SelftestReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = ReportOutput {
                report,
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let stats = &report.stats;
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FIELD", "VALUE"]);
            for (field, value) in [
                ("mode", report.mode.to_string()),
                ("passed", report.passed.to_string()),
                ("seed", report.seed.to_string()),
                ("messages", report.messages.to_string()),
                ("bytes", report.bytes.to_string()),
                ("echoed", optional(report.echoed)),
                ("child_exit", optional(report.child_exit)),
                ("elapsed_ms", format!("{:.3}", report.elapsed_ms)),
                ("total_sent", stats.total_sent.to_string()),
                ("total_received", stats.total_received.to_string()),
                ("bytes_sent", stats.bytes_sent.to_string()),
                ("bytes_received", stats.bytes_received.to_string()),
                ("send_failed", stats.send_failed.to_string()),
                ("read_failed", stats.read_failed.to_string()),
            ] {
                table.add_row(vec![field.to_string(), value]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "{} mode={} messages={} bytes={} elapsed={:.3}ms sent={} received={}",
                if report.passed { "PASS" } else { "FAIL" },
                report.mode,
                report.messages,
                report.bytes,
                report.elapsed_ms,
                report.stats.total_sent,
                report.stats.total_received
            );
        }
    }
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
