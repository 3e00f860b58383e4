//! Plain-text rendering for the admin binary.
//!
//! Tables are drawn MySQL-CLI style; padding uses display width so wide
//! characters line up.

use serde_json::Value as JsonValue;
use unicode_width::UnicodeWidthStr;

use crate::driver::DbInfo;
use crate::models::{Row, Table};

pub fn format_value(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => "NULL".to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Array(arr) => serde_json::to_string(arr).unwrap_or_default(),
        JsonValue::Object(obj) => serde_json::to_string(obj).unwrap_or_default(),
    }
}

fn pad(text: &str, width: usize, right: bool) -> String {
    let fill = " ".repeat(width.saturating_sub(text.width()));
    if right {
        format!("{fill}{text}")
    } else {
        format!("{text}{fill}")
    }
}

/// Draw a boxed table. `numeric[i]` right-aligns column `i`.
pub fn render_table(headers: &[&str], rows: &[Vec<String>], numeric: &[bool]) -> String {
    if headers.is_empty() {
        return "Empty set\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.width()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.width());
        }
    }

    let separator: String = widths
        .iter()
        .map(|w| format!("+{}", "-".repeat(w + 2)))
        .collect::<String>()
        + "+\n";

    let mut output = separator.clone();
    for (header, width) in headers.iter().zip(&widths) {
        output.push_str(&format!("| {} ", pad(header, *width, false)));
    }
    output.push_str("|\n");
    output.push_str(&separator);

    for row in rows {
        for (i, width) in widths.iter().enumerate() {
            let cell = row.get(i).map(String::as_str).unwrap_or("");
            let right = numeric.get(i).copied().unwrap_or(false);
            output.push_str(&format!("| {} ", pad(cell, *width, right)));
        }
        output.push_str("|\n");
    }
    output.push_str(&separator);

    let noun = if rows.len() == 1 { "row" } else { "rows" };
    output.push_str(&format!("{} {noun} in set\n", rows.len()));
    output
}

/// Result rows; columns follow the first row's key order.
pub fn format_rows(rows: &[Row]) -> String {
    let Some(first) = rows.first() else {
        return "Empty set\n".to_string();
    };
    let headers: Vec<&str> = first.keys().map(String::as_str).collect();
    let numeric: Vec<bool> = first.values().map(JsonValue::is_number).collect();
    let cells: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            headers
                .iter()
                .map(|h| row.get(*h).map(format_value).unwrap_or_else(|| "NULL".into()))
                .collect()
        })
        .collect();
    render_table(&headers, &cells, &numeric)
}

pub fn format_tables(tables: &[String]) -> String {
    let cells: Vec<Vec<String>> = tables.iter().map(|t| vec![t.clone()]).collect();
    render_table(&["table"], &cells, &[])
}

/// Columns (with key marker), then secondary indexes.
pub fn format_table_info(table: &Table) -> String {
    let keys = table.primary_columns();
    let columns: Vec<Vec<String>> = table
        .columns
        .iter()
        .map(|c| {
            vec![
                c.name.clone(),
                c.type_sql.clone(),
                c.data_type.map(|t| t.to_string()).unwrap_or_else(|| "-".into()),
                if c.nullable { "YES" } else { "NO" }.to_string(),
                if keys.iter().any(|k| k.eq_ignore_ascii_case(&c.name)) {
                    "PRI".to_string()
                } else {
                    String::new()
                },
            ]
        })
        .collect();

    let mut output = format!("Table: {}\n", table.name);
    output.push_str(&render_table(
        &["column", "type", "neutral", "null", "key"],
        &columns,
        &[],
    ));

    if !table.indexes.is_empty() {
        let indexes: Vec<Vec<String>> = table
            .indexes
            .iter()
            .map(|i| {
                vec![
                    i.name.clone(),
                    i.description.clone(),
                    if i.unique { "YES" } else { "NO" }.to_string(),
                ]
            })
            .collect();
        output.push('\n');
        output.push_str(&render_table(&["index", "columns", "unique"], &indexes, &[]));
    }
    output
}

pub fn format_db_info(info: &DbInfo) -> String {
    let mut pairs = vec![
        vec!["driver".to_string(), info.driver.display_name().to_string()],
        vec![
            "version".to_string(),
            info.version.clone().unwrap_or_else(|| "unknown".into()),
        ],
        vec!["database".to_string(), info.database.clone()],
        vec!["host".to_string(), info.host.clone()],
    ];
    pairs.extend(info.extras.iter().map(|(k, v)| vec![k.clone(), v.clone()]));
    render_table(&["property", "value"], &pairs, &[])
}
