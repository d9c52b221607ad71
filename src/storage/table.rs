use anyhow::{Result, Context};
use rust_decimal::Decimal;
use std::fs;
use std::io::{self, Write};
use std::mem::take;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

use crate::crawler::aggregate::TraderAggregate;
use crate::crawler::task::{PayoutRecord, TraderKey};

pub const RAW_HEADER: [&str; 5] = ["Name", "Location", "Amount", "Page", "Date"];
pub const AGGREGATE_HEADER: [&str; 4] = ["Name", "Location", "Total Earnings", "Pages"];

const SEP: char = ',';
const BOM: &str = "\u{feff}";

/* ---------------- Parsing ---------------- */

/// Split delimited text into rows. Quotes and CRLF are tolerated.
pub fn parse_rows(text: &str, sep: char) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut field = String::new();
    let mut row = Vec::new();
    let mut in_quotes = false;
    let mut chars = text.strip_prefix(BOM).unwrap_or(text).chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' => {
                if in_quotes && matches!(chars.peek(), Some('"')) {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = !in_quotes;
                }
            }
            c if c == sep && !in_quotes => row.push(take(&mut field)),
            '\n' | '\r' if !in_quotes => {
                if ch == '\r' && matches!(chars.peek(), Some('\n')) {
                    chars.next();
                }
                row.push(take(&mut field));
                if !(row.len() == 1 && row[0].is_empty()) {
                    rows.push(take(&mut row));
                } else {
                    row.clear();
                }
            }
            _ => field.push(ch),
        }
    }

    // Trailing row without a newline
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }

    rows
}

/* ---------------- Writing ---------------- */

fn needs_quotes(field: &str, sep: char) -> bool {
    field.contains(sep) || field.contains('"') || field.contains('\n') || field.contains('\r')
}

/// Write a single delimited row
pub fn write_row<W: Write>(mut w: W, row: &[String], sep: char) -> io::Result<()> {
    let line = row.iter()
        .map(|cell| {
            if needs_quotes(cell, sep) {
                format!("\"{}\"", cell.replace('"', "\"\""))
            } else {
                cell.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(&sep.to_string());
    writeln!(w, "{}", line)
}

/// Write `header` and `rows` to `path`, replacing it atomically
fn write_table(path: &Path, header: &[&str], rows: impl Iterator<Item = Vec<String>>) -> Result<usize> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create directory: {}", parent.display()))?;
        }
    }

    let mut buffer = Vec::new();
    buffer.extend_from_slice(BOM.as_bytes());
    let header: Vec<String> = header.iter().map(|h| h.to_string()).collect();
    write_row(&mut buffer, &header, SEP)?;

    let mut count = 0;
    for row in rows {
        write_row(&mut buffer, &row, SEP)?;
        count += 1;
    }

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &buffer)
        .context(format!("Failed to write table: {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .context(format!("Failed to move table into place: {}", path.display()))?;

    debug!("Wrote {} rows to {}", count, path.display());
    Ok(count)
}

/// Pages as a bracketed list: `[1, 4, 9]`
pub fn format_pages(pages: &[u32]) -> String {
    let inner = pages.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ");
    format!("[{}]", inner)
}

pub fn parse_pages(text: &str) -> Result<Vec<u32>> {
    let inner = text.trim().trim_start_matches('[').trim_end_matches(']');
    let mut pages = inner.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<u32>().context(format!("Invalid page number '{}'", p)))
        .collect::<Result<Vec<_>>>()?;
    pages.sort_unstable();
    pages.dedup();
    Ok(pages)
}

/// Persist every extracted record
pub fn write_raw_table(path: &Path, records: &[PayoutRecord]) -> Result<usize> {
    let rows = records.iter().map(|r| {
        vec![
            r.trader_name.clone(),
            r.location.clone(),
            r.amount.to_string(),
            r.source_page.to_string(),
            r.observed_date.map(|d| d.format("%Y-%m-%d").to_string()).unwrap_or_default(),
        ]
    });
    write_table(path, &RAW_HEADER, rows)
}

/// Persist the per-trader aggregate
pub fn write_aggregate_table(path: &Path, traders: &[TraderAggregate]) -> Result<usize> {
    let rows = traders.iter().map(|t| {
        vec![
            t.key.name.clone(),
            t.key.location.clone(),
            t.total_earnings.to_string(),
            format_pages(&t.pages),
        ]
    });
    write_table(path, &AGGREGATE_HEADER, rows)
}

/// Load an aggregate written by `write_aggregate_table`
pub fn read_aggregate_table(path: &Path) -> Result<Vec<TraderAggregate>> {
    let text = fs::read_to_string(path)
        .context(format!("Failed to read table: {}", path.display()))?;

    let mut rows = parse_rows(&text, SEP).into_iter();
    match rows.next() {
        Some(header) if header.iter().map(String::as_str).eq(AGGREGATE_HEADER.iter().copied()) => {}
        Some(header) => anyhow::bail!("Unexpected header in {}: {:?}", path.display(), header),
        None => anyhow::bail!("Empty table: {}", path.display()),
    }

    rows.enumerate()
        .map(|(i, row)| {
            if row.len() != AGGREGATE_HEADER.len() {
                anyhow::bail!("Row {} of {} has {} fields", i + 2, path.display(), row.len());
            }
            Ok(TraderAggregate {
                key: TraderKey {
                    name: row[0].clone(),
                    location: row[1].clone(),
                },
                total_earnings: Decimal::from_str(&row[2])
                    .context(format!("Invalid total '{}' on row {}", row[2], i + 2))?,
                pages: parse_pages(&row[3])?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn trader(name: &str, location: &str, total: Decimal, pages: Vec<u32>) -> TraderAggregate {
        TraderAggregate {
            key: TraderKey { name: name.to_string(), location: location.to_string() },
            total_earnings: total,
            pages,
        }
    }

    #[test]
    fn test_aggregate_table_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("aggregated.csv");

        let traders = vec![
            trader("Ann", "Texas, US", dec!(1300.75), vec![1, 2, 3]),
            trader("Bo \"The Bull\"", "Ontario, CA", dec!(20), vec![7]),
            trader("Cy", "", dec!(0), vec![]),
        ];
        assert_eq!(write_aggregate_table(&path, &traders).unwrap(), 3);

        let back = read_aggregate_table(&path).unwrap();
        assert_eq!(back, traders);
    }

    #[test]
    fn test_written_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.csv");
        let records = vec![PayoutRecord {
            trader_name: "Ann".to_string(),
            location: "Texas, US".to_string(),
            amount: dec!(1250.50),
            source_page: 4,
            observed_date: NaiveDate::from_ymd_opt(2024, 3, 4),
        }];
        write_raw_table(&path, &records).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with(BOM));
        let body = text.trim_start_matches(BOM);
        assert_eq!(body, "Name,Location,Amount,Page,Date\nAnn,\"Texas, US\",1250.50,4,2024-03-04\n");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_parse_rows_quotes_and_crlf() {
        let rows = parse_rows("a,\"b, c\"\r\n\"say \"\"hi\"\"\",d\r\n\r\ne,f", ',');
        assert_eq!(rows, vec![
            vec!["a".to_string(), "b, c".to_string()],
            vec!["say \"hi\"".to_string(), "d".to_string()],
            vec!["e".to_string(), "f".to_string()],
        ]);
    }

    #[test]
    fn test_pages_format() {
        assert_eq!(format_pages(&[1, 4, 9]), "[1, 4, 9]");
        assert_eq!(format_pages(&[]), "[]");
        assert_eq!(parse_pages("[9, 1, 4, 4]").unwrap(), vec![1, 4, 9]);
        assert_eq!(parse_pages("[]").unwrap(), Vec::<u32>::new());
        assert!(parse_pages("[1, x]").is_err());
    }

    #[test]
    fn test_wrong_header_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.csv");
        write_raw_table(&path, &[]).unwrap();
        assert!(read_aggregate_table(&path).is_err());
    }
}
