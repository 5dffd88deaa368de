// Output formatting for CLI

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn print_value<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        if let OutputFormat::Json = self {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        Ok(())
    }

    pub fn is_text(&self) -> bool {
        matches!(self, OutputFormat::Text)
    }
}

/// Format a table row, truncating values wider than their column
pub fn table_row(values: &[(&str, usize)]) -> String {
    values
        .iter()
        .map(|(val, width)| {
            let s = if val.chars().count() > *width {
                let kept: String = val.chars().take(width.saturating_sub(3)).collect();
                format!("{}...", kept)
            } else {
                val.to_string()
            };
            format!("{:<width$}", s, width = width)
        })
        .collect::<Vec<_>>()
        .join("  ")
        .trim_end()
        .to_string()
}

/// Print a table row
pub fn print_table_row(values: &[(&str, usize)]) {
    println!("{}", table_row(values));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_row_pads_and_truncates() {
        assert_eq!(table_row(&[("NAME", 6), ("ARN", 5)]), "NAME    ARN");
        assert_eq!(table_row(&[("abcdefghij", 6), ("x", 3)]), "abc...  x");
    }
}
