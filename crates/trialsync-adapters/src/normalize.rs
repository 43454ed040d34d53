//! Flattens nested registry study records into the relational study tables.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;
use trialsync_core::{cell_list, cell_text, Row, Table, TableSet};
use uuid::Uuid;

use crate::{json_at, study_id, AdapterError};

const STATUS_SUFFIX: &str = "_status";
const CRITERIA_TYPE: &str = "Inclusion/Exclusion";

static NULL: JsonValue = JsonValue::Null;

/// How synthetic row keys are minted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyStrategy {
    /// UUIDv5 over table, study id and ordinal; stable across identical runs.
    #[default]
    Deterministic,
    /// UUIDv4 per row; every run differs from the last.
    Random,
}

impl FromStr for KeyStrategy {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deterministic" => Ok(Self::Deterministic),
            "random" => Ok(Self::Random),
            other => Err(AdapterError::Message(format!("unknown key strategy: {other}"))),
        }
    }
}

/// Which arm an intervention row points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterventionLinkage {
    /// Every intervention of a study links to the last arm processed for that study.
    #[default]
    LastArm,
    /// Link through the intervention's `armGroupLabels`, one row per matched arm.
    ArmLabel,
}

impl FromStr for InterventionLinkage {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "last-arm" | "last_arm" => Ok(Self::LastArm),
            "arm-label" | "arm_label" => Ok(Self::ArmLabel),
            other => Err(AdapterError::Message(format!(
                "unknown intervention linkage: {other}"
            ))),
        }
    }
}

impl fmt::Display for InterventionLinkage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LastArm => f.write_str("last-arm"),
            Self::ArmLabel => f.write_str("arm-label"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NormalizerOptions {
    pub keys: KeyStrategy,
    pub intervention_linkage: InterventionLinkage,
}

/// Organization name -> sequential id, shared by every study of one batch.
#[derive(Debug, Clone)]
pub struct OrganizationRegistry {
    ids: HashMap<String, u64>,
    next_id: u64,
}

impl Default for OrganizationRegistry {
    fn default() -> Self {
        Self {
            ids: HashMap::new(),
            next_id: 1,
        }
    }
}

impl OrganizationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id_for(&mut self, name: &str) -> u64 {
        if let Some(id) = self.ids.get(name) {
            return *id;
        }
        let id = self.next_id;
        self.ids.insert(name.to_string(), id);
        self.next_id += 1;
        id
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// One normalizer per batch. Owns the organization registry for that batch only.
#[derive(Debug, Clone, Default)]
pub struct StudyNormalizer {
    options: NormalizerOptions,
    organizations: OrganizationRegistry,
}

impl StudyNormalizer {
    pub fn new(options: NormalizerOptions) -> Self {
        Self {
            options,
            organizations: OrganizationRegistry::new(),
        }
    }

    fn synthetic_key(&self, table: Table, study_id: &str, ordinal: usize) -> String {
        match self.options.keys {
            KeyStrategy::Deterministic => {
                let name = format!("trialsync:{}:{}:{}", table.name(), study_id, ordinal);
                Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).to_string()
            }
            KeyStrategy::Random => Uuid::new_v4().to_string(),
        }
    }

    /// Append the rows derived from one study to `out`, in table dependency order.
    pub fn normalize_study(
        &mut self,
        study: &JsonValue,
        out: &mut TableSet,
    ) -> Result<(), AdapterError> {
        let study_id = study_id(study).ok_or(AdapterError::MissingStudyId)?.to_string();
        let protocol = json_at(study, &["protocolSection"]).unwrap_or(&NULL);
        let section = |name: &str| json_at(protocol, &[name]).unwrap_or(&NULL);

        let identification = section("identificationModule");
        let status = section("statusModule");
        let sponsors = section("sponsorCollaboratorsModule");
        let oversight = section("oversightModule");
        let description = section("descriptionModule");
        let conditions = section("conditionsModule");
        let design = section("designModule");
        let arms_interventions = section("armsInterventionsModule");
        let outcomes = section("outcomesModule");
        let eligibility = section("eligibilityModule");
        let contacts_locations = section("contactsLocationsModule");

        out.push(
            Table::Studies,
            Row::new()
                .with("study_id", study_id.clone())
                .with("brief_title", text(identification, &["briefTitle"]))
                .with("official_title", text(identification, &["officialTitle"]))
                .with("acronym", text(identification, &["orgStudyIdInfo", "id"]))
                .with("start_date", text(status, &["startDateStruct", "date"]))
                .with(
                    "primary_completion_date",
                    text(status, &["primaryCompletionDateStruct", "date"]),
                )
                .with("completion_date", text(status, &["completionDateStruct", "date"]))
                .with("study_first_submit_date", text(status, &["studyFirstSubmitDate"]))
                .with(
                    "study_first_submit_qc_date",
                    text(status, &["studyFirstSubmitQcDate"]),
                )
                .with(
                    "study_first_post_date",
                    text(status, &["studyFirstPostDateStruct", "date"]),
                )
                .with("last_update_submit_date", text(status, &["lastUpdateSubmitDate"]))
                .with(
                    "last_update_post_date",
                    text(status, &["lastUpdatePostDateStruct", "date"]),
                )
                .with("oversight_has_dmc", text(oversight, &["oversightHasDmc"]))
                .with("is_fda_regulated_drug", text(oversight, &["isFdaRegulatedDrug"]))
                .with(
                    "is_fda_regulated_device",
                    text(oversight, &["isFdaRegulatedDevice"]),
                )
                .with("is_us_export", text(oversight, &["isUsExport"]))
                .with("brief_summary", text(description, &["briefSummary"]))
                .with("detailed_description", text(description, &["detailedDescription"])),
        );

        let collaborators = items(sponsors, &["collaborators"]);
        for org in collaborators {
            let name = text(org, &["name"]);
            let organization_id = self.organizations.id_for(&name);
            out.push(
                Table::Organizations,
                Row::new()
                    .with("organization_id", organization_id.to_string())
                    .with("organization_name", name)
                    .with("organization_class", text(org, &["class"]))
                    .with("study_id", study_id.clone()),
            );
        }

        out.push(
            Table::Statuses,
            Row::new()
                .with("status_id", format!("{study_id}{STATUS_SUFFIX}"))
                .with("study_id", study_id.clone())
                .with("status_verified_date", text(status, &["statusVerifiedDate"]))
                .with("overall_status", text(status, &["overallStatus"]))
                .with(
                    "has_expanded_access",
                    text(status, &["expandedAccessInfo", "hasExpandedAccess"]),
                ),
        );

        let sponsor_id = self.synthetic_key(Table::Sponsors, &study_id, 0);
        out.push(
            Table::Sponsors,
            Row::new()
                .with("sponsor_id", sponsor_id.clone())
                .with("study_id", study_id.clone())
                .with("sponsor_name", text(sponsors, &["leadSponsor", "name"]))
                .with("sponsor_class", text(sponsors, &["leadSponsor", "class"]))
                .with(
                    "responsible_party_type",
                    text(sponsors, &["responsibleParty", "type"]),
                ),
        );

        for (ordinal, collab) in collaborators.iter().enumerate() {
            out.push(
                Table::Collaborators,
                Row::new()
                    .with(
                        "collaborator_id",
                        self.synthetic_key(Table::Collaborators, &study_id, ordinal),
                    )
                    .with("sponsor_id", sponsor_id.clone())
                    .with("collaborator_name", text(collab, &["name"]))
                    .with("collaborator_class", text(collab, &["class"])),
            );
        }

        for (ordinal, condition) in items(conditions, &["conditions"]).iter().enumerate() {
            out.push(
                Table::Conditions,
                Row::new()
                    .with(
                        "condition_id",
                        self.synthetic_key(Table::Conditions, &study_id, ordinal),
                    )
                    .with("study_id", study_id.clone())
                    .with("condition_name", cell_text(Some(condition))),
            );
        }

        out.push(
            Table::Designs,
            Row::new()
                .with("design_id", self.synthetic_key(Table::Designs, &study_id, 0))
                .with("study_id", study_id.clone())
                .with("study_type", text(design, &["studyType"]))
                .with("phases", list(design, &["phases"]))
                .with("allocation", text(design, &["designInfo", "allocation"]))
                .with(
                    "intervention_model",
                    text(design, &["designInfo", "interventionModel"]),
                )
                .with(
                    "intervention_model_description",
                    text(design, &["designInfo", "interventionModelDescription"]),
                )
                .with("primary_purpose", text(design, &["designInfo", "primaryPurpose"]))
                .with(
                    "masking",
                    text(design, &["designInfo", "maskingInfo", "masking"]),
                )
                .with("enrollment_count", text(design, &["enrollmentInfo", "count"]))
                .with("enrollment_type", text(design, &["enrollmentInfo", "type"])),
        );

        let mut arms: Vec<(String, String)> = Vec::new();
        for (ordinal, arm) in items(arms_interventions, &["armGroups"]).iter().enumerate() {
            let arm_id = self.synthetic_key(Table::Arms, &study_id, ordinal);
            let label = text(arm, &["label"]);
            out.push(
                Table::Arms,
                Row::new()
                    .with("arm_id", arm_id.clone())
                    .with("study_id", study_id.clone())
                    .with("label", label.clone())
                    .with("type", text(arm, &["type"])),
            );
            arms.push((arm_id, label));
        }

        let last_arm_id = arms.last().map(|(id, _)| id.clone()).unwrap_or_default();
        for intervention in items(arms_interventions, &["interventions"]) {
            let linked = match self.options.intervention_linkage {
                InterventionLinkage::LastArm => vec![last_arm_id.clone()],
                InterventionLinkage::ArmLabel => {
                    let labels = items(intervention, &["armGroupLabels"])
                        .iter()
                        .filter_map(JsonValue::as_str)
                        .collect::<Vec<_>>();
                    let matched = arms
                        .iter()
                        .filter(|(_, label)| labels.contains(&label.as_str()))
                        .map(|(id, _)| id.clone())
                        .collect::<Vec<_>>();
                    if matched.is_empty() {
                        vec![last_arm_id.clone()]
                    } else {
                        matched
                    }
                }
            };

            let name = text(intervention, &["name"]);
            for arm_id in linked {
                out.push(
                    Table::Interventions,
                    Row::new()
                        .with("intervention_id", format!("{arm_id}_{name}"))
                        .with("arm_id", arm_id)
                        .with("type", text(intervention, &["type"]))
                        .with("name", name.clone())
                        .with("description", text(intervention, &["description"]))
                        .with("other_names", list(intervention, &["otherNames"])),
                );
            }
        }

        let tagged_outcomes = items(outcomes, &["primaryOutcomes"])
            .iter()
            .map(|o| (o, "primary"))
            .chain(
                items(outcomes, &["secondaryOutcomes"])
                    .iter()
                    .map(|o| (o, "secondary")),
            );
        for (ordinal, (outcome, outcome_type)) in tagged_outcomes.enumerate() {
            out.push(
                Table::Outcomes,
                Row::new()
                    .with(
                        "outcome_id",
                        self.synthetic_key(Table::Outcomes, &study_id, ordinal),
                    )
                    .with("study_id", study_id.clone())
                    .with("measure", text(outcome, &["measure"]))
                    .with("time_frame", text(outcome, &["timeFrame"]))
                    .with("outcome_type", outcome_type),
            );
        }

        out.push(
            Table::Eligibility,
            Row::new()
                .with(
                    "eligibility_id",
                    self.synthetic_key(Table::Eligibility, &study_id, 0),
                )
                .with("study_id", study_id.clone())
                .with("criteria_type", CRITERIA_TYPE)
                .with("description", text(eligibility, &["eligibilityCriteria"]))
                .with("healthy_volunteers", text(eligibility, &["healthyVolunteers"]))
                .with("sex", text(eligibility, &["sex"]))
                .with("gender_based", "")
                .with("minimum_age", text(eligibility, &["minimumAge"]))
                .with("maximum_age", text(eligibility, &["maximumAge"]))
                .with("std_ages", list(eligibility, &["stdAges"])),
        );

        // Officials carry no phone/email of their own; borrow the first central contact's.
        let central = items(contacts_locations, &["centralContacts"]).first();
        let phone = central.map(|c| text(c, &["phone"])).unwrap_or_default();
        let email = central.map(|c| text(c, &["email"])).unwrap_or_default();
        for (ordinal, official) in items(contacts_locations, &["overallOfficials"])
            .iter()
            .enumerate()
        {
            out.push(
                Table::Contacts,
                Row::new()
                    .with(
                        "contact_id",
                        self.synthetic_key(Table::Contacts, &study_id, ordinal),
                    )
                    .with("study_id", study_id.clone())
                    .with("name", text(official, &["name"]))
                    .with("role", text(official, &["role"]))
                    .with("phone", phone.clone())
                    .with("email", email.clone()),
            );
        }

        for (ordinal, location) in items(contacts_locations, &["locations"]).iter().enumerate() {
            out.push(
                Table::Locations,
                Row::new()
                    .with(
                        "location_id",
                        self.synthetic_key(Table::Locations, &study_id, ordinal),
                    )
                    .with("study_id", study_id.clone())
                    .with("facility", text(location, &["facility"]))
                    .with("status", text(location, &["status"]))
                    .with("city", text(location, &["city"]))
                    .with("state", text(location, &["state"]))
                    .with("zip", text(location, &["zip"]))
                    .with("country", text(location, &["country"]))
                    .with("lat", text(location, &["geoPoint", "lat"]))
                    .with("lon", text(location, &["geoPoint", "lon"])),
            );
        }

        Ok(())
    }
}

/// Normalize a whole batch in fetch order. Every study table is present in the result.
pub fn normalize_batch(studies: &[JsonValue], options: NormalizerOptions) -> TableSet {
    let mut out = TableSet::with_tables(&Table::STUDY_TABLES);
    let mut normalizer = StudyNormalizer::new(options);
    for (index, study) in studies.iter().enumerate() {
        if let Err(err) = normalizer.normalize_study(study, &mut out) {
            warn!(index, error = %err, "skipping study record");
        }
    }
    out
}

fn text(value: &JsonValue, path: &[&str]) -> String {
    cell_text(json_at(value, path))
}

fn list(value: &JsonValue, path: &[&str]) -> String {
    cell_list(json_at(value, path))
}

fn items<'a>(value: &'a JsonValue, path: &[&str]) -> &'a [JsonValue] {
    json_at(value, path)
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}
