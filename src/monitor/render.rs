//! Terminal rendering for the monitor.

use chrono::Local;
use tabled::{builder::Builder, settings::Style};

use super::discovery::GroupSnapshot;
use super::rate::BwReport;

const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

/// Timestamp line printed once per refresh.
pub fn tick_banner() -> String {
    banner(&Local::now().format("%Y-%m-%d | %H:%M:%S %z").to_string())
}

fn banner(stamp: &str) -> String {
    format!("== {stamp} ==")
}

/// One refresh worth of output: the timestamp banner, then each section.
pub fn tick_block(sections: &[String]) -> String {
    let mut out = tick_banner();
    for section in sections {
        out.push('\n');
        out.push_str(section);
    }
    out
}

/// One group as a named table: the group name, an underline, and one row
/// per occupied counter set. Vacant groups render as a header-only table.
pub fn group_table(snapshot: &GroupSnapshot) -> String {
    let mut builder = Builder::default();
    builder.push_record(snapshot.columns.iter().cloned());
    for row in &snapshot.rows {
        builder.push_record(row.iter().map(|value| value.to_string()));
    }
    let mut table = builder.build();
    table.with(Style::sharp());
    format!(
        "{}\n{}\n{}",
        snapshot.group,
        "-".repeat(snapshot.group.len()),
        table
    )
}

/// One throughput line per local rank. Peers that recorded no samples in
/// the window are left out rather than shown as a zero rate.
pub fn bw_line(report: &BwReport) -> String {
    let mut line = format!(
        "[{}][{}][{}][tx_thruput_to_rank]",
        report.local_rank, report.rank, report.pid
    );
    for (peer, rate) in report.peer_rates.iter().enumerate() {
        if let Some(rate) = rate {
            line.push_str(&format!(" [{peer}]={}/s", human_bytes(*rate)));
        }
    }
    line
}

/// Scales a byte count into the largest unit that keeps the value above
/// four digits, so consecutive refreshes do not flap between units.
pub fn human_bytes(value: f64) -> String {
    let mut value = value;
    let mut unit = 0;
    while value > 10240.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{}{}", value as u64, UNITS[unit])
}
