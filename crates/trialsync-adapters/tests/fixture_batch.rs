// Normalizes the captured registry pages under fixtures/studies end to end.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use trialsync_adapters::{
    load_json_file, next_page_url, normalize_batch, NormalizerOptions, PageSource,
    PaginatedFetcher,
};
use trialsync_core::Table;
use trialsync_storage::TransportError;

const BASE: &str = "https://clinicaltrials.gov/api/v2/studies";

fn fixtures_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures")
}

struct FixturePages;

#[async_trait]
impl PageSource for FixturePages {
    async fn fetch_page(&self, url: &str) -> Result<JsonValue, TransportError> {
        let file = if url == BASE {
            "page1.json"
        } else if url == next_page_url(BASE, "page-2").unwrap() {
            "page2.json"
        } else {
            return Err(TransportError::HttpStatus {
                status: 404,
                url: url.to_string(),
            });
        };
        Ok(load_json_file(fixtures_root().join("studies").join(file)).unwrap())
    }
}

#[tokio::test]
async fn captured_pages_flatten_into_linked_tables() {
    let outcome = PaginatedFetcher::new(&FixturePages, BASE)
        .fetch_all()
        .await
        .unwrap();
    assert_eq!(outcome.pages, 2);
    assert_eq!(outcome.studies.len(), 3);
    assert_eq!(outcome.duplicates_dropped, 1);
    assert_eq!(outcome.unidentified_dropped, 1);

    let tables = normalize_batch(&outcome.studies, NormalizerOptions::default());

    let studies = tables.rows(Table::Studies);
    assert_eq!(
        studies.iter().map(|r| r.get("study_id").unwrap()).collect::<Vec<_>>(),
        vec!["NCT05000001", "NCT05000002", "NCT05000003"]
    );
    assert_eq!(studies[0].get("acronym"), Some("ASPIRE-01"));
    assert_eq!(studies[0].get("oversight_has_dmc"), Some("true"));
    assert_eq!(studies[0].get("is_us_export"), Some(""));

    let orgs = tables
        .rows(Table::Organizations)
        .iter()
        .map(|r| {
            (
                r.get("organization_name").unwrap(),
                r.get("organization_id").unwrap(),
            )
        })
        .collect::<Vec<_>>();
    assert_eq!(
        orgs,
        vec![
            ("National Institute of Neurology", "1"),
            ("Helix Pharma", "2"),
            ("Helix Pharma", "2"),
            ("National Institute of Neurology", "1"),
            ("Kinetic Devices", "3"),
        ]
    );

    let design = &tables.rows(Table::Designs)[0];
    assert_eq!(design.get("phases"), Some(r#"["PHASE2","PHASE3"]"#));
    assert_eq!(design.get("enrollment_count"), Some("420"));
    assert_eq!(tables.rows(Table::Designs)[2].get("phases"), Some(""));

    let location = &tables.rows(Table::Locations)[0];
    assert_eq!(location.get("lat"), Some("42.35843"));
    assert_eq!(location.get("zip"), Some("02115"));

    let contact = &tables.rows(Table::Contacts)[0];
    assert_eq!(contact.get("name"), Some("Ada Ellis, MD"));
    assert_eq!(contact.get("phone"), Some("555-0100"));

    assert_eq!(tables.rows(Table::Outcomes).len(), 3);
    assert_eq!(tables.rows(Table::Eligibility).len(), 3);
    assert_eq!(
        tables.rows(Table::Eligibility)[0].get("std_ages"),
        Some(r#"["ADULT","OLDER_ADULT"]"#)
    );

    // Every study-keyed row points at a study in this batch.
    let study_ids = studies
        .iter()
        .map(|r| r.get("study_id").unwrap())
        .collect::<Vec<_>>();
    for table in Table::STUDY_TABLES {
        for row in tables.rows(table) {
            if let Some(fk) = row.get("study_id") {
                assert!(study_ids.contains(&fk), "{table} row references {fk}");
            }
        }
    }
    let arm_ids = tables
        .rows(Table::Arms)
        .iter()
        .map(|r| r.get("arm_id").unwrap())
        .collect::<Vec<_>>();
    for row in tables.rows(Table::Interventions) {
        assert!(arm_ids.contains(&row.get("arm_id").unwrap()));
    }
}
