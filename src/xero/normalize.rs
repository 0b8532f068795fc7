use crate::models::{AccountType, NormalizedLine};
use crate::xero::report::{ReportRow, RowType};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};

static MONTH_NAME_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:\d{1,2}\s+)?([A-Za-z]{3,9})\.?,?\s+(\d{4}|\d{2})$").expect("valid month label regex")
});

static ISO_MONTH_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})-(\d{2})(?:-\d{2})?$").expect("valid iso month regex"));

/// Section-title keywords, checked in order; the first hit decides the account type.
const SECTION_KEYWORDS: &[(AccountType, &[&str])] = &[
    (AccountType::Cogs, &["cost of sales", "cost of goods", "direct cost", "cogs"]),
    (AccountType::OtherIncome, &["other income", "non-operating income", "interest income"]),
    (AccountType::OtherExpense, &["other expense", "non-operating expense"]),
    (AccountType::Revenue, &["income", "revenue", "sales", "turnover"]),
    (AccountType::Opex, &["operating expense", "expense", "overhead", "administrative"]),
];

pub fn classify_section(title: &str) -> AccountType {
    let lower = title.trim().to_ascii_lowercase();
    if lower.is_empty() {
        return AccountType::Other;
    }
    SECTION_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|keyword| lower.contains(keyword)))
        .map(|(account_type, _)| *account_type)
        .unwrap_or(AccountType::Other)
}

/// Converts a report column label such as `Jan 2024` or `31 Jan 24` into `YYYY-MM`.
pub fn month_key(label: &str) -> Option<String> {
    let label = label.trim();
    if let Some(caps) = ISO_MONTH_LABEL.captures(label) {
        let year = caps[1].parse::<u32>().ok()?;
        let month = caps[2].parse::<u32>().ok()?;
        return (1..=12).contains(&month).then(|| format!("{:04}-{:02}", year, month));
    }

    let caps = MONTH_NAME_LABEL.captures(label)?;
    let month = month_from_name(&caps[1])?;
    let year_raw = &caps[2];
    let mut year = year_raw.parse::<u32>().ok()?;
    if year_raw.len() == 2 {
        year += 2000;
    }
    Some(format!("{:04}-{:02}", year, month))
}

fn month_from_name(name: &str) -> Option<u32> {
    let lower = name.to_ascii_lowercase();
    let prefix = lower.get(..3)?;
    let month = match prefix {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}

/// Lenient amount parsing: blanks, text and non-finite numbers all read as zero.
pub fn parse_amount(raw: &str) -> f64 {
    let cleaned = raw.trim().replace(',', "");
    match cleaned.parse::<f64>() {
        Ok(value) if value.is_finite() => value,
        _ => 0.0,
    }
}

/// Flattens a P&L row tree into one line per (section, account) with values keyed by month.
///
/// Columns whose header cannot be read as a month are dropped. Every line carries every
/// readable month, zero-filled where the account row is short. Duplicate account rows in
/// the same section are summed.
pub fn normalize_report(business_id: &str, rows: &[ReportRow]) -> Vec<NormalizedLine> {
    let months = header_months(rows);
    if months.iter().all(Option::is_none) {
        if !rows.is_empty() {
            tracing::warn!(business_id, "P&L report has no readable month columns");
        }
        return Vec::new();
    }

    let mut lines: Vec<NormalizedLine> = Vec::new();
    let mut index: HashMap<(String, String), usize> = HashMap::new();

    for row in rows.iter().filter(|row| row.row_type == RowType::Section) {
        collect_section(business_id, row, "", &months, &mut lines, &mut index);
    }

    lines
}

fn header_months(rows: &[ReportRow]) -> Vec<Option<String>> {
    let Some(header) = rows.iter().find(|row| row.row_type == RowType::Header) else {
        return Vec::new();
    };

    // The first column names the account unless it already reads as a month.
    let mut labels = header.cells.iter().map(|cell| cell.text().trim()).collect::<Vec<_>>();
    if labels
        .first()
        .map(|label| label.is_empty() || month_key(label).is_none())
        .unwrap_or(false)
    {
        labels.remove(0);
    }

    labels
        .into_iter()
        .map(|label| {
            let key = month_key(label);
            if key.is_none() {
                tracing::debug!(label, "skipping unreadable P&L column header");
            }
            key
        })
        .collect()
}

fn collect_section(
    business_id: &str,
    section: &ReportRow,
    parent_title: &str,
    months: &[Option<String>],
    lines: &mut Vec<NormalizedLine>,
    index: &mut HashMap<(String, String), usize>,
) {
    let own_title = section.title.as_deref().map(str::trim).unwrap_or("");
    let title = if own_title.is_empty() { parent_title } else { own_title };
    // Untitled top-level sections hold computed figures (Gross Profit, Net Profit).
    if title.is_empty() {
        return;
    }
    let account_type = classify_section(title);

    for child in &section.rows {
        match child.row_type {
            RowType::Row => {}
            RowType::Section => {
                collect_section(business_id, child, title, months, lines, index);
                continue;
            }
            _ => continue,
        }

        let Some((name_cell, value_cells)) = child.cells.split_first() else {
            continue;
        };
        let account_name = name_cell.text().trim();
        if account_name.is_empty() {
            continue;
        }
        let account_id = value_cells
            .iter()
            .chain(std::iter::once(name_cell))
            .find_map(|cell| cell.account_id())
            .map(ToString::to_string);

        let key = (title.to_string(), account_name.to_string());
        let slot = *index.entry(key).or_insert_with(|| {
            lines.push(NormalizedLine {
                business_id: business_id.to_string(),
                account_name: account_name.to_string(),
                account_id: account_id.clone(),
                account_type,
                section: title.to_string(),
                monthly_values: months
                    .iter()
                    .flatten()
                    .map(|month| (month.clone(), 0.0))
                    .collect::<BTreeMap<_, _>>(),
            });
            lines.len() - 1
        });

        let line = &mut lines[slot];
        if line.account_id.is_none() {
            line.account_id = account_id;
        }
        for (cell, month) in value_cells.iter().zip(months.iter()) {
            if let Some(month) = month {
                *line.monthly_values.entry(month.clone()).or_insert(0.0) += parse_amount(cell.text());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{classify_section, month_key, normalize_report, parse_amount};
    use crate::models::AccountType;
    use crate::xero::report::{ReportCell, ReportRow, RowType};

    fn cells(values: &[&str]) -> Vec<ReportCell> {
        values
            .iter()
            .map(|value| ReportCell {
                value: Some(value.to_string()),
                attributes: Vec::new(),
            })
            .collect()
    }

    fn row(row_type: RowType, title: Option<&str>, values: &[&str], children: Vec<ReportRow>) -> ReportRow {
        ReportRow {
            row_type,
            title: title.map(ToString::to_string),
            cells: cells(values),
            rows: children,
        }
    }

    #[test]
    fn sales_under_income_becomes_revenue_by_month() {
        let rows = vec![
            row(RowType::Header, None, &["Jan 2024", "Feb 2024"], vec![]),
            row(
                RowType::Section,
                Some("Income"),
                &[],
                vec![row(RowType::Row, None, &["Sales", "1000", "1500"], vec![])],
            ),
        ];

        let lines = normalize_report("biz-1", &rows);
        assert_eq!(lines.len(), 1);
        let line = &lines[0];
        assert_eq!(line.account_name, "Sales");
        assert_eq!(line.account_type, AccountType::Revenue);
        assert_eq!(line.business_id, "biz-1");
        assert_eq!(line.monthly_values.get("2024-01"), Some(&1000.0));
        assert_eq!(line.monthly_values.get("2024-02"), Some(&1500.0));
    }

    #[test]
    fn labelled_account_column_does_not_shift_months() {
        let rows = vec![
            row(RowType::Header, None, &["Account", "Jan 2024", "Feb 2024"], vec![]),
            row(
                RowType::Section,
                Some("Income"),
                &[],
                vec![row(RowType::Row, None, &["Sales", "1000", "1500"], vec![])],
            ),
        ];

        let lines = normalize_report("biz-1", &rows);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].monthly_values.len(), 2);
        assert_eq!(lines[0].monthly_values.get("2024-01"), Some(&1000.0));
        assert_eq!(lines[0].monthly_values.get("2024-02"), Some(&1500.0));
    }

    #[test]
    fn summary_rows_and_untitled_sections_are_skipped() {
        let rows = vec![
            row(RowType::Header, None, &["", "Mar 2024"], vec![]),
            row(
                RowType::Section,
                Some("Less Operating Expenses"),
                &[],
                vec![
                    row(RowType::Row, None, &["Rent", "800"], vec![]),
                    row(RowType::SummaryRow, None, &["Total Operating Expenses", "800"], vec![]),
                ],
            ),
            row(
                RowType::Section,
                Some(""),
                &[],
                vec![row(RowType::Row, None, &["Net Profit", "-800"], vec![])],
            ),
        ];

        let lines = normalize_report("biz-1", &rows);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].account_name, "Rent");
        assert_eq!(lines[0].account_type, AccountType::Opex);
        assert_eq!(lines[0].monthly_values.get("2024-03"), Some(&800.0));
    }

    #[test]
    fn short_rows_are_zero_filled_and_garbage_reads_as_zero() {
        let rows = vec![
            row(RowType::Header, None, &["", "Jan 2024", "Feb 2024", "Mar 2024"], vec![]),
            row(
                RowType::Section,
                Some("Revenue"),
                &[],
                vec![row(RowType::Row, None, &["Grants", "n/a", "NaN"], vec![])],
            ),
        ];

        let lines = normalize_report("biz-1", &rows);
        assert_eq!(lines[0].monthly_values.len(), 3);
        assert!(lines[0].monthly_values.values().all(|value| *value == 0.0));
    }

    #[test]
    fn duplicate_accounts_in_a_section_are_summed() {
        let rows = vec![
            row(RowType::Header, None, &["", "Jan 2024"], vec![]),
            row(
                RowType::Section,
                Some("Income"),
                &[],
                vec![
                    row(RowType::Row, None, &["Sales", "100"], vec![]),
                    row(RowType::Row, None, &["Sales", "25.5"], vec![]),
                ],
            ),
        ];

        let lines = normalize_report("biz-1", &rows);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].monthly_values.get("2024-01"), Some(&125.5));
    }

    #[test]
    fn normalizing_twice_gives_the_same_lines() {
        let rows = vec![
            row(RowType::Header, None, &["", "Jan 2024", "Feb 2024"], vec![]),
            row(
                RowType::Section,
                Some("Cost of Sales"),
                &[],
                vec![row(RowType::Row, None, &["Purchases", "10", "20"], vec![])],
            ),
        ];
        assert_eq!(normalize_report("b", &rows), normalize_report("b", &rows));
    }

    #[test]
    fn unreadable_header_columns_are_dropped() {
        let rows = vec![
            row(RowType::Header, None, &["", "Jan 2024", "YTD"], vec![]),
            row(
                RowType::Section,
                Some("Income"),
                &[],
                vec![row(RowType::Row, None, &["Sales", "10", "999"], vec![])],
            ),
        ];
        let lines = normalize_report("b", &rows);
        assert_eq!(lines[0].monthly_values.len(), 1);
        assert_eq!(lines[0].monthly_values.get("2024-01"), Some(&10.0));
    }

    #[test]
    fn empty_report_yields_no_lines() {
        assert!(normalize_report("b", &[]).is_empty());
    }

    #[test]
    fn classifies_section_titles_by_priority() {
        assert_eq!(classify_section("Cost of Sales"), AccountType::Cogs);
        assert_eq!(classify_section("Trading Income"), AccountType::Revenue);
        assert_eq!(classify_section("Other Income"), AccountType::OtherIncome);
        assert_eq!(classify_section("Less Operating Expenses"), AccountType::Opex);
        assert_eq!(classify_section("Other Expenses"), AccountType::OtherExpense);
        assert_eq!(classify_section("Depreciation"), AccountType::Other);
        assert_eq!(classify_section("   "), AccountType::Other);
    }

    #[test]
    fn reads_common_month_labels() {
        assert_eq!(month_key("Jan 2024").as_deref(), Some("2024-01"));
        assert_eq!(month_key("September 2023").as_deref(), Some("2023-09"));
        assert_eq!(month_key("31 Dec 23").as_deref(), Some("2023-12"));
        assert_eq!(month_key("29 Feb 2024").as_deref(), Some("2024-02"));
        assert_eq!(month_key("2024-07").as_deref(), Some("2024-07"));
        assert_eq!(month_key("2024-07-31").as_deref(), Some("2024-07"));
        assert_eq!(month_key("2024-13"), None);
        assert_eq!(month_key("Year to date"), None);
        assert_eq!(month_key(""), None);
    }

    #[test]
    fn amounts_tolerate_separators_and_junk() {
        assert_eq!(parse_amount(" 1,234.50 "), 1234.5);
        assert_eq!(parse_amount("-80"), -80.0);
        assert_eq!(parse_amount(""), 0.0);
        assert_eq!(parse_amount("inf"), 0.0);
        assert_eq!(parse_amount("abc"), 0.0);
    }
}
