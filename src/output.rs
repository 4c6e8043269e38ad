//! What the commands print for the user.
//!
//! Narration ("Boot up the Elastic stack", "Done") goes to stderr and the
//! content the user asked for (shell exports, coverage XML, the status table)
//! goes to stdout untouched, so `eval "$(elastic-package stack shellinit)"`
//! and redirecting a report to a file keep working. Diagnostics use `tracing`.

use std::io::Write;

pub trait UserOutput: Send + Sync {
    /// One line describing what the command is doing or has done.
    fn message(&self, text: &str);

    /// Command result, written as is.
    fn document(&self, text: &str);
}

/// Terminal output of the binary.
pub struct CliOutput;

impl UserOutput for CliOutput {
    fn message(&self, text: &str) {
        eprintln!("{}", text);
    }

    fn document(&self, text: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(text.as_bytes());
        if !text.ends_with('\n') {
            let _ = stdout.write_all(b"\n");
        }
        let _ = stdout.flush();
    }
}

/// Discards everything.
pub struct QuietOutput;

impl UserOutput for QuietOutput {
    fn message(&self, _text: &str) {}
    fn document(&self, _text: &str) {}
}

/// Left-aligned columns separated by two spaces; the last column is not
/// padded.
pub fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate().take(widths.len()) {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let header: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
    for row in std::iter::once(&header).chain(rows) {
        let last = row.len().min(widths.len()).saturating_sub(1);
        let mut line = String::new();
        for (i, cell) in row.iter().enumerate().take(widths.len()) {
            line.push_str(cell);
            if i < last {
                let pad = widths[i] - cell.chars().count() + 2;
                line.extend(std::iter::repeat(' ').take(pad));
            }
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_columns_fit_the_widest_cell() {
        let rows = vec![
            vec!["elasticsearch".to_string(), "8.17.0".to_string(), "running (healthy)".to_string()],
            vec!["kibana".to_string(), "8.17.0-SNAPSHOT".to_string(), "exited (1)".to_string()],
        ];
        let table = render_table(&["SERVICE", "VERSION", "STATUS"], &rows);
        assert_eq!(
            table,
            "SERVICE        VERSION          STATUS\n\
             elasticsearch  8.17.0           running (healthy)\n\
             kibana         8.17.0-SNAPSHOT  exited (1)\n"
        );
    }

    #[test]
    fn table_without_rows_is_only_the_header() {
        assert_eq!(render_table(&["A", "B"], &[]), "A  B\n");
    }
}
