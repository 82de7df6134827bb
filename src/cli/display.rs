//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use super::commands::{MachineInfo, PoolReport};
use crate::cluster::Convergence;

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No machines found.\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut output = String::new();
    let mut push_row = |cells: Vec<String>| {
        let last = cells.len().saturating_sub(1);
        for (i, cell) in cells.iter().enumerate() {
            if i > 0 {
                output.push_str("   ");
            }
            if i < last && i < widths.len() {
                output.push_str(&format!("{:width$}", cell, width = widths[i]));
            } else {
                output.push_str(cell);
            }
        }
        output.push('\n');
    };

    push_row(headers.iter().map(|h| h.to_uppercase()).collect());
    for row in rows {
        push_row(row);
    }

    output
}

// ============================================================================
// Node pool display
// ============================================================================

/// Format machines in deletion order
pub fn format_machines(machines: &[MachineInfo]) -> String {
    let rows = machines
        .iter()
        .map(|m| {
            vec![
                m.name.clone(),
                m.image.clone().unwrap_or_else(|| "<missing>".to_string()),
                if m.prioritize_delete { "yes" } else { "no" }.to_string(),
            ]
        })
        .collect();
    format_table(&["name", "image", "delete-first"], rows)
}

/// One-line convergence summary
pub fn format_convergence(c: &Convergence) -> String {
    if c.is_converged() {
        format!("converged: {}/{} machines up to date", c.matching, c.desired)
    } else {
        format!(
            "converging: {}/{} machines up to date, {} outdated, {} changes remaining",
            c.matching,
            c.desired,
            c.outdated,
            c.remaining()
        )
    }
}

/// Full pool report
pub fn format_pool_report(report: &PoolReport) -> String {
    let mut output = format!("Node pool {} (cluster {})\n\n", report.pool, report.cluster);
    output.push_str(&format_machines(&report.machines));
    output.push('\n');
    output.push_str(&format_convergence(&report.convergence));
    output.push('\n');
    output
}
