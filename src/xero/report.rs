use serde::{Deserialize, Deserializer, Serialize};

/// `GET Reports/ProfitAndLoss` response body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReportEnvelope {
    #[serde(default)]
    pub reports: Vec<Report>,
}

impl ReportEnvelope {
    /// Rows of the first report; an envelope without reports has no rows.
    pub fn into_rows(self) -> Vec<ReportRow> {
        self.reports.into_iter().next().map(|report| report.rows).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Report {
    #[serde(default, rename = "ReportID")]
    pub report_id: Option<String>,
    #[serde(default)]
    pub report_name: Option<String>,
    #[serde(default)]
    pub rows: Vec<ReportRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowType {
    Header,
    Section,
    Row,
    SummaryRow,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReportRow {
    pub row_type: RowType,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub cells: Vec<ReportCell>,
    #[serde(default)]
    pub rows: Vec<ReportRow>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReportCell {
    #[serde(default, deserialize_with = "lenient_string")]
    pub value: Option<String>,
    #[serde(default)]
    pub attributes: Vec<CellAttribute>,
}

impl ReportCell {
    pub fn text(&self) -> &str {
        self.value.as_deref().unwrap_or("")
    }

    /// Xero tags account rows with `{"Id": "account", "Value": "<uuid>"}`.
    pub fn account_id(&self) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attr| attr.id.eq_ignore_ascii_case("account"))
            .map(|attr| attr.value.as_str())
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CellAttribute {
    #[serde(default)]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_string_or_empty")]
    pub value: String,
}

// Cell values are strings in practice, but numbers and nulls show up in sandbox data.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match raw {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(text)) => Some(text),
        Some(other) => Some(other.to_string()),
    })
}

fn lenient_string_or_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_string(deserializer)?.unwrap_or_default())
}
