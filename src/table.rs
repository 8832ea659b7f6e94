//! Plain-text elastic table rendering for CLI summaries and previews.

use std::fmt::Write as _;

/// Renders a padded two-space-separated table with a dashed separator under
/// the header row. Column widths stretch to the widest cell.
pub fn render_table(headers: &[String], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count().max(1)).collect();
    for row in rows {
        for (idx, cell) in row.iter().enumerate().take(widths.len()) {
            widths[idx] = widths[idx].max(clean(cell).chars().count());
        }
    }

    let mut output = String::new();
    append_row(&mut output, headers, &widths);
    let separator: Vec<String> = widths.iter().map(|w| "-".repeat((*w).max(3))).collect();
    append_row(&mut output, &separator, &widths);
    for row in rows {
        append_row(&mut output, row, &widths);
    }
    output
}

pub fn print_table(headers: &[String], rows: &[Vec<String>]) {
    print!("{}", render_table(headers, rows));
}

fn append_row(output: &mut String, cells: &[String], widths: &[usize]) {
    let mut line = String::new();
    for (idx, cell) in cells.iter().enumerate().take(widths.len()) {
        if idx > 0 {
            line.push_str("  ");
        }
        let cell = clean(cell);
        let padding = widths[idx].saturating_sub(cell.chars().count());
        line.push_str(&cell);
        line.push_str(&" ".repeat(padding));
    }
    let _ = writeln!(output, "{}", line.trim_end());
}

/// Control characters would break the column alignment.
fn clean(cell: &str) -> String {
    cell.chars()
        .map(|ch| if ch.is_control() { ' ' } else { ch })
        .collect()
}
