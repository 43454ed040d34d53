//! Table catalog, row model and cell encoding for trialsync snapshots.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "trialsync-core";

/// Every table the pipelines persist. Declaration order is dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Studies,
    Organizations,
    Statuses,
    Sponsors,
    Collaborators,
    Conditions,
    Designs,
    Arms,
    Interventions,
    Outcomes,
    Eligibility,
    Contacts,
    Locations,
    Version,
}

impl Table {
    /// Study-derived tables, parents before children.
    pub const STUDY_TABLES: [Table; 13] = [
        Table::Studies,
        Table::Organizations,
        Table::Statuses,
        Table::Sponsors,
        Table::Collaborators,
        Table::Conditions,
        Table::Designs,
        Table::Arms,
        Table::Interventions,
        Table::Outcomes,
        Table::Eligibility,
        Table::Contacts,
        Table::Locations,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Table::Studies => "studies",
            Table::Organizations => "organizations",
            Table::Statuses => "statuses",
            Table::Sponsors => "sponsors",
            Table::Collaborators => "collaborators",
            Table::Conditions => "conditions",
            Table::Designs => "designs",
            Table::Arms => "arms",
            Table::Interventions => "interventions",
            Table::Outcomes => "outcomes",
            Table::Eligibility => "eligibility",
            Table::Contacts => "contacts",
            Table::Locations => "locations",
            Table::Version => "version",
        }
    }

    /// Snapshot file name; shared by the data and archive directories.
    pub fn file_name(self) -> String {
        format!("latest_{}_data.csv", self.name())
    }

    /// Declared column order. Consumers of the archive depend on these names.
    pub fn columns(self) -> &'static [&'static str] {
        match self {
            Table::Studies => &[
                "study_id",
                "brief_title",
                "official_title",
                "acronym",
                "start_date",
                "primary_completion_date",
                "completion_date",
                "study_first_submit_date",
                "study_first_submit_qc_date",
                "study_first_post_date",
                "last_update_submit_date",
                "last_update_post_date",
                "oversight_has_dmc",
                "is_fda_regulated_drug",
                "is_fda_regulated_device",
                "is_us_export",
                "brief_summary",
                "detailed_description",
            ],
            Table::Organizations => &[
                "organization_id",
                "organization_name",
                "organization_class",
                "study_id",
            ],
            Table::Statuses => &[
                "status_id",
                "study_id",
                "status_verified_date",
                "overall_status",
                "has_expanded_access",
            ],
            Table::Sponsors => &[
                "sponsor_id",
                "study_id",
                "sponsor_name",
                "sponsor_class",
                "responsible_party_type",
            ],
            Table::Collaborators => &[
                "collaborator_id",
                "sponsor_id",
                "collaborator_name",
                "collaborator_class",
            ],
            Table::Conditions => &["condition_id", "study_id", "condition_name"],
            Table::Designs => &[
                "design_id",
                "study_id",
                "study_type",
                "phases",
                "allocation",
                "intervention_model",
                "intervention_model_description",
                "primary_purpose",
                "masking",
                "enrollment_count",
                "enrollment_type",
            ],
            Table::Arms => &["arm_id", "study_id", "label", "type"],
            Table::Interventions => &[
                "intervention_id",
                "arm_id",
                "type",
                "name",
                "description",
                "other_names",
            ],
            Table::Outcomes => &[
                "outcome_id",
                "study_id",
                "measure",
                "time_frame",
                "outcome_type",
            ],
            Table::Eligibility => &[
                "eligibility_id",
                "study_id",
                "criteria_type",
                "description",
                "healthy_volunteers",
                "sex",
                "gender_based",
                "minimum_age",
                "maximum_age",
                "std_ages",
            ],
            Table::Contacts => &["contact_id", "study_id", "name", "role", "phone", "email"],
            Table::Locations => &[
                "location_id",
                "study_id",
                "facility",
                "status",
                "city",
                "state",
                "zip",
                "country",
                "lat",
                "lon",
            ],
            Table::Version => &["apiVersion", "dataTimestamp"],
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Table {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Table::STUDY_TABLES
            .iter()
            .chain(std::iter::once(&Table::Version))
            .find(|t| t.name() == s)
            .copied()
            .ok_or_else(|| format!("unknown table: {s}"))
    }
}

/// Ordered field -> value mapping. All values are already stringified.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Row {
    cells: Vec<(String, String)>,
}

impl Row {
    pub fn new() -> Self {
        Self { cells: Vec::new() }
    }

    pub fn with(mut self, field: &str, value: impl Into<String>) -> Self {
        self.set(field, value);
        self
    }

    /// Replaces the value in place if the field exists, otherwise appends it.
    pub fn set(&mut self, field: &str, value: impl Into<String>) {
        let value = value.into();
        match self.cells.iter_mut().find(|(name, _)| name == field) {
            Some((_, existing)) => *existing = value,
            None => self.cells.push((field.to_string(), value)),
        }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value.as_str())
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(name, _)| name.as_str())
    }

    pub fn cells(&self) -> &[(String, String)] {
        &self.cells
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Reshape onto `columns`: missing fields become empty, extra fields are dropped.
    pub fn project(&self, columns: &[&str]) -> Row {
        columns
            .iter()
            .map(|column| {
                (
                    (*column).to_string(),
                    self.get(column).unwrap_or_default().to_string(),
                )
            })
            .collect()
    }
}

impl FromIterator<(String, String)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (field, value) in iter {
            row.set(&field, value);
        }
        row
    }
}

/// Rows grouped by table, iterated in dependency order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSet {
    tables: BTreeMap<Table, Vec<Row>>,
}

impl TableSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A set where each listed table is present, even if it ends up with no rows.
    pub fn with_tables(tables: &[Table]) -> Self {
        Self {
            tables: tables.iter().map(|t| (*t, Vec::new())).collect(),
        }
    }

    pub fn push(&mut self, table: Table, row: Row) {
        self.tables.entry(table).or_default().push(row);
    }

    pub fn set_rows(&mut self, table: Table, rows: Vec<Row>) {
        self.tables.insert(table, rows);
    }

    pub fn rows(&self, table: Table) -> &[Row] {
        self.tables.get(&table).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn tables(&self) -> impl Iterator<Item = Table> + '_ {
        self.tables.keys().copied()
    }

    pub fn row_counts(&self) -> BTreeMap<Table, usize> {
        self.tables.iter().map(|(t, rows)| (*t, rows.len())).collect()
    }

    pub fn total_rows(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }
}

/// Upstream feed version record, kept as opaque cell text.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeedVersion {
    pub api_version: String,
    pub data_timestamp: String,
}

impl FeedVersion {
    pub fn from_json(value: &JsonValue) -> Self {
        Self {
            api_version: cell_text(value.get("apiVersion")),
            data_timestamp: cell_text(value.get("dataTimestamp")),
        }
    }

    pub fn to_row(&self) -> Row {
        Row::new()
            .with("apiVersion", self.api_version.clone())
            .with("dataTimestamp", self.data_timestamp.clone())
    }
}

/// Scalar cell text. Absent and null are empty; nested values fall back to compact JSON.
pub fn cell_text(value: Option<&JsonValue>) -> String {
    match value {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(s)) => s.clone(),
        Some(JsonValue::Bool(b)) => b.to_string(),
        Some(JsonValue::Number(n)) => n.to_string(),
        Some(other) => other.to_string(),
    }
}

/// List cell text: the ordered sequence embedded as a compact JSON array.
pub fn cell_list(value: Option<&JsonValue>) -> String {
    match value {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::Array(items)) => JsonValue::Array(items.clone()).to_string(),
        Some(other) => JsonValue::Array(vec![other.clone()]).to_string(),
    }
}
