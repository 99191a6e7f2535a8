use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use publog_index::config::{Config, TableConfig};
use publog_index::engine::Engine;
use publog_index::models::{EntityKind, MatchKind, Value};
use publog_index::query::{Predicate, Query};
use publog_index::schema::{tables, ColumnType, PriorityClass};
use publog_index::services::LocationFilter;
use publog_index::state::IndexStatus;
use publog_index::store::MaterializeOptions;
use publog_index::EngineError;
use tempfile::TempDir;

const CAGE_CSV: &str = "\
CAGE_CODE,COMPANY,CITY,STATE_PROVINCE,ZIP_POSTAL_ZONE,COUNTRY,CAO,CAGE_STATUS,TYPE
0AAA1,RADOME SYSTEMS INC,WICHITA,KS,67201,UNITED STATES,S0701A,A,A
1ABC2,ACME AEROSPACE,SEATTLE,WA,98101,UNITED STATES,S4801A,A,A
K1234,NORDIC RADOME AB,STOCKHOLM,,,SWEDEN,,A,F
RADOM,RADOM TOOLING,DAYTON,OH,45401,UNITED STATES,S3605A,H,A
";

const FSC_CSV: &str = "\
FSC,FSC_TITLE,FSC_NOTES
1560,AIRFRAME STRUCTURAL COMPONENTS,Includes radomes
5985,\"ANTENNAS, WAVEGUIDES, AND RELATED EQUIPMENT\",
5820,\"RADIO AND TELEVISION COMMUNICATION EQUIPMENT, EXCEPT AIRBORNE\",
";

const FSG_CSV: &str = "\
FSC,FSG_TITLE
1560,AIRCRAFT AND AIRFRAME STRUCTURAL COMPONENTS
5820,COMMUNICATION EQUIPMENT
5985,ELECTRICAL AND ELECTRONIC EQUIPMENT COMPONENTS
";

const INC_CSV: &str = "\
INC,FIIG_TITLE,DEFINITION,INC_STATUS,FIIG,CONCEPT_NO,TYPE_CODE,COND_CODE,DT_ESTB_CANC
02788,RADOME,A dome-shaped cover protecting a radar antenna,A,A23900,1,1,,1968-01-01
77777,ANTENNA,A device for radiating radio waves,A,A239A0,1,1,,01/02/1970
";

const NSN_CSV: &str = "\
NIIN,FSC,ITEM_NAME,INC,DT_NIIN_ASGMT
011519535,5985,RADOME,02788,19740501
012345678,1560,RADOME ASSEMBLY,02788,
009876543,5985,ANTENNA,77777,2001-07-04
";

const FLISV_CSV: &str = "\
NIIN,MRC,REQUIREMENTS_STATEMENT,CLEAR_TEXT_REPLY
011519535,AGAV,END ITEM IDENTIFICATION,F-16
099999999,TEST,ONLY IN FLISV,YES
";

const MANAGEMENT_CSV: &str = "\
NIIN,EFFECTIVE_DATE,MOE,SOS,AAC,QUP,UI,UNIT_PRICE
011519535,2020-01-01,DF,SMS,D,1,EA,1234.56
011519535,2021-06-30,DN,SMS,D,1,EA,1301.10
";

fn write(root: &Path, rel: &str, body: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, body).unwrap();
}

fn setup_data() -> (TempDir, Config) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    let data = root.join("data");
    write(&data, "CAGE/P_CAGE.CSV", CAGE_CSV);
    write(&data, "H-SERIES/V_H2_FSC.CSV", FSC_CSV);
    write(&data, "H-SERIES/V_H2_FSG.CSV", FSG_CSV);
    write(&data, "H-SERIES/V_H6_NAME_INC.CSV", INC_CSV);
    write(&data, "IDENTIFICATION/P_FLIS_NSN.CSV", NSN_CSV);
    write(&data, "FLISV.CSV", FLISV_CSV);
    write(&data, "MANAGEMENT/V_FLIS_MANAGEMENT.CSV", MANAGEMENT_CSV);
    let config = Config::with_paths(root.join("db/publog.sqlite"), data);
    (tmp, config)
}

fn data_path(config: &Config, rel: &str) -> PathBuf {
    config.data.root.join(rel)
}

async fn open(config: &Config) -> Engine {
    Engine::open(config).await.unwrap()
}

async fn index(engine: &Engine, table: &str) {
    engine
        .materialize(table, MaterializeOptions::default())
        .await
        .unwrap_or_else(|e| panic!("indexing {} failed: {}", table, e));
}

async fn wait_until_idle(engine: &Engine, table: &str) {
    for _ in 0..500 {
        let status = engine.state().get(table).unwrap().status;
        if status != IndexStatus::Indexing && !engine.state().is_busy(table) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} still indexing", table);
}

#[tokio::test]
async fn materialize_is_idempotent() {
    let (_tmp, config) = setup_data();
    let engine = open(&config).await;

    let first = engine
        .materialize(tables::P_CAGE, MaterializeOptions::default())
        .await
        .unwrap();
    assert_eq!(first.rows, 4);
    let before = engine.query(tables::P_CAGE, &Query::all()).await.unwrap();

    let second = engine
        .materialize(tables::P_CAGE, MaterializeOptions::default())
        .await
        .unwrap();
    assert!(second.reused_existing);
    assert_eq!(second.rows, 4);

    let forced = engine
        .materialize(tables::P_CAGE, MaterializeOptions { force: true })
        .await
        .unwrap();
    assert!(!forced.reused_existing);
    assert_eq!(forced.rows, 4);

    let after = engine.query(tables::P_CAGE, &Query::all()).await.unwrap();
    assert_eq!(before, after);
    engine.shutdown().await;
}

#[tokio::test]
async fn same_table_second_caller_is_busy() {
    let (_tmp, config) = setup_data();
    let engine = open(&config).await;

    let held = engine.store().prepare(tables::P_CAGE).unwrap();
    let err = engine
        .materialize(tables::P_CAGE, MaterializeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Busy { .. }));
    assert!(matches!(
        engine.trigger_materialize(tables::P_CAGE, MaterializeOptions::default()),
        Err(EngineError::Busy { .. })
    ));
    assert!(matches!(
        engine.drop_table(tables::P_CAGE).await,
        Err(EngineError::Busy { .. })
    ));

    let report = engine
        .store()
        .run_prepared(held, MaterializeOptions::default())
        .await
        .unwrap();
    assert_eq!(report.rows, 4);
    assert!(!engine.state().is_busy(tables::P_CAGE));
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn different_tables_index_concurrently() {
    let (_tmp, config) = setup_data();
    let engine = open(&config).await;

    let (cage, fsc, inc) = tokio::join!(
        engine.materialize(tables::P_CAGE, MaterializeOptions::default()),
        engine.materialize(tables::V_H2_FSC, MaterializeOptions::default()),
        engine.materialize(tables::V_H6_NAME_INC, MaterializeOptions::default()),
    );
    assert_eq!(cage.unwrap().rows, 4);
    assert_eq!(fsc.unwrap().rows, 3);
    assert_eq!(inc.unwrap().rows, 2);
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn readers_never_see_a_partial_table() {
    let (_tmp, mut config) = setup_data();
    config.ingest.batch_rows = 7;
    let engine = Arc::new(open(&config).await);
    index(&engine, tables::P_FLIS_NSN).await;

    let mut bigger = String::from("NIIN,FSC,ITEM_NAME,INC,DT_NIIN_ASGMT\n");
    for i in 0..2_000u32 {
        bigger.push_str(&format!("{:09},5985,ITEM {},,\n", 100_000_000 + i, i));
    }
    fs::write(data_path(&config, "IDENTIFICATION/P_FLIS_NSN.CSV"), bigger).unwrap();

    engine
        .trigger_materialize(tables::P_FLIS_NSN, MaterializeOptions { force: true })
        .unwrap();

    let mut seen = Vec::new();
    loop {
        let n = engine
            .store()
            .count(tables::P_FLIS_NSN, &Predicate::All)
            .await
            .unwrap();
        seen.push(n);
        if !engine.state().is_busy(tables::P_FLIS_NSN) {
            break;
        }
        tokio::task::yield_now().await;
    }
    let last = engine
        .store()
        .count(tables::P_FLIS_NSN, &Predicate::All)
        .await
        .unwrap();
    seen.push(last);

    assert!(seen.iter().all(|n| *n == 3 || *n == 2_000), "{:?}", seen);
    assert_eq!(last, 2_000);
    engine.shutdown().await;
}

#[tokio::test]
async fn search_omits_unindexed_services() {
    let (_tmp, config) = setup_data();
    let engine = open(&config).await;
    index(&engine, tables::P_CAGE).await;

    let out = engine.search("radome", 10).await.unwrap();
    assert!(!out.results.is_empty());
    assert!(out.results.iter().all(|r| r.kind == EntityKind::Cage));
    let omitted: Vec<EntityKind> = out.omitted.iter().map(|o| o.kind).collect();
    assert_eq!(
        omitted,
        vec![EntityKind::Nsn, EntityKind::Fsc, EntityKind::ItemName]
    );
    assert!(out.failures.is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn malformed_rows_below_threshold_are_skipped() {
    let (_tmp, mut config) = setup_data();
    config.ingest.max_skip_ratio = 0.5;
    write(
        &config.data.root,
        "H-SERIES/V_H2_FSC.CSV",
        "FSC,FSC_TITLE\n1005,GUNS THROUGH 30MM\nNOT-A-CODE,BROKEN\n1010,GUNS OVER 30MM\n",
    );
    let engine = open(&config).await;

    let report = engine
        .materialize(tables::V_H2_FSC, MaterializeOptions::default())
        .await
        .unwrap();
    assert_eq!(report.rows, 2);
    assert_eq!(report.skipped, 1);

    let state = engine.state().get(tables::V_H2_FSC).unwrap();
    assert_eq!(state.status, IndexStatus::Indexed);
    assert_eq!(state.row_count, Some(2));
    assert_eq!(state.skipped_rows, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn malformed_rows_above_threshold_fail_and_keep_prior_table() {
    let (_tmp, config) = setup_data();
    let engine = open(&config).await;
    index(&engine, tables::V_H2_FSC).await;

    write(
        &config.data.root,
        "H-SERIES/V_H2_FSC.CSV",
        "FSC,FSC_TITLE\n1005,GUNS THROUGH 30MM\nNOT-A-CODE,BROKEN\n1010,GUNS OVER 30MM\n",
    );
    let err = engine
        .materialize(tables::V_H2_FSC, MaterializeOptions { force: true })
        .await
        .unwrap_err();
    match &err {
        EngineError::Ingest { reason, .. } => assert!(reason.contains("too many malformed rows")),
        other => panic!("unexpected error: {}", other),
    }

    let state = engine.state().get(tables::V_H2_FSC).unwrap();
    assert_eq!(state.status, IndexStatus::Failed);
    assert!(state.materialized);
    assert!(state.last_error.is_some());
    assert!(state.last_error_at.is_some());

    // The previous three classes are still served.
    let rows = engine.fsc().list_classes().await.unwrap();
    assert_eq!(rows.len(), 3);
    engine.shutdown().await;
}

#[tokio::test]
async fn missing_source_is_an_ingest_error() {
    let (_tmp, config) = setup_data();
    let engine = open(&config).await;
    let err = engine
        .materialize(tables::V_CHARACTERISTICS, MaterializeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Ingest { .. }));
    let state = engine.state().get(tables::V_CHARACTERISTICS).unwrap();
    assert_eq!(state.status, IndexStatus::Failed);
    assert!(!state.materialized);
    assert!(matches!(
        engine.query(tables::V_CHARACTERISTICS, &Query::all()).await,
        Err(EngineError::NotIndexed { .. })
    ));
    engine.shutdown().await;
}

#[tokio::test]
async fn missing_required_header_fails_ingestion() {
    let (_tmp, config) = setup_data();
    write(&config.data.root, "CAGE/P_CAGE.CSV", "COMPANY,CITY\nACME,SEATTLE\n");
    let engine = open(&config).await;
    let err = engine
        .materialize(tables::P_CAGE, MaterializeOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("CAGE_CODE"), "{}", err);
    engine.shutdown().await;
}

#[tokio::test]
async fn radome_search_is_bounded_and_ranked() {
    let (_tmp, config) = setup_data();
    let engine = open(&config).await;
    engine
        .materialize_all(None, MaterializeOptions::default())
        .await;

    let out = engine.search("RADOME", 10).await.unwrap();
    assert!(!out.results.is_empty());
    assert!(out.results.len() <= 10);
    for pair in out.results.windows(2) {
        assert!(pair[0].match_kind <= pair[1].match_kind);
    }
    // V_CHARACTERISTICS has no source file, but no search service needs it.
    assert!(out.omitted.is_empty());

    let out = engine.search("radome", 2).await.unwrap();
    assert_eq!(out.results.len(), 2);
    engine.shutdown().await;
}

#[tokio::test]
async fn exact_niin_ranks_first() {
    let (_tmp, config) = setup_data();
    let engine = open(&config).await;
    index(&engine, tables::P_FLIS_NSN).await;
    index(&engine, tables::P_CAGE).await;

    let out = engine.search("011519535", 10).await.unwrap();
    assert_eq!(out.results.len(), 1);
    let hit = &out.results[0];
    assert_eq!(hit.kind, EntityKind::Nsn);
    assert_eq!(hit.key, "011519535");
    assert_eq!(hit.match_kind, MatchKind::ExactKey);
    assert_eq!(hit.title.as_deref(), Some("RADOME"));
    engine.shutdown().await;
}

#[tokio::test]
async fn niin_lookup_accepts_nsn_forms_and_falls_back_to_flisv() {
    let (_tmp, config) = setup_data();
    let engine = open(&config).await;

    let err = engine.nsn().get_by_niin("011519535").await.unwrap_err();
    match err {
        EngineError::Unavailable { missing, .. } => {
            assert_eq!(missing, vec![tables::P_FLIS_NSN.to_string()])
        }
        other => panic!("unexpected error: {}", other),
    }

    index(&engine, tables::P_FLIS_NSN).await;
    for key in ["011519535", "5985011519535", "5985-01-151-9535"] {
        let row = engine.nsn().get_by_niin(key).await.unwrap().unwrap();
        assert_eq!(row.text("ITEM_NAME").as_deref(), Some("RADOME"));
    }
    assert!(engine.nsn().get_by_niin("000000001").await.unwrap().is_none());
    assert!(matches!(
        engine.nsn().get_by_niin("RADOME").await,
        Err(EngineError::Query(_))
    ));

    assert!(engine.nsn().get_by_niin("099999999").await.unwrap().is_none());
    index(&engine, tables::FLISV).await;
    let row = engine.nsn().get_by_niin("099999999").await.unwrap().unwrap();
    assert_eq!(row.text("REQUIREMENTS_STATEMENT").as_deref(), Some("ONLY IN FLISV"));
    engine.shutdown().await;
}

#[tokio::test]
async fn nsn_detail_joins_classification() {
    let (_tmp, config) = setup_data();
    let engine = open(&config).await;
    index(&engine, tables::P_FLIS_NSN).await;

    let detail = engine.nsn().detail("011519535").await.unwrap().unwrap();
    assert_eq!(detail.nsn.as_deref(), Some("5985-01-151-9535"));
    assert!(detail.classification.is_none());

    index(&engine, tables::V_H2_FSC).await;
    let detail = engine.nsn().detail("011519535").await.unwrap().unwrap();
    let class = detail.classification.unwrap();
    assert_eq!(
        class.text("FSC_TITLE").as_deref(),
        Some("ANTENNAS, WAVEGUIDES, AND RELATED EQUIPMENT")
    );
    assert_eq!(detail.record.get("DT_NIIN_ASGMT"), Some(&Value::from("1974-05-01")));

    let by_fsc = engine.nsn().by_fsc("5985", 10, 0).await.unwrap();
    assert_eq!(by_fsc.len(), 2);
    let filtered = engine
        .nsn()
        .search("radome", Some("1560"), 10, 0)
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].text("NIIN").as_deref(), Some("012345678"));

    assert!(matches!(
        engine.nsn().management("011519535").await,
        Err(EngineError::Unavailable { .. })
    ));
    index(&engine, tables::V_FLIS_MANAGEMENT).await;
    let rows = engine.nsn().management("5985-01-151-9535").await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get("QUP"), Some(&Value::Integer(1)));
    engine.shutdown().await;
}

#[tokio::test]
async fn supply_groups_and_classes() {
    let (_tmp, config) = setup_data();
    let engine = open(&config).await;
    engine
        .materialize_all(Some(PriorityClass::Priority), MaterializeOptions::default())
        .await;

    let groups = engine.fsc().list_groups().await.unwrap();
    let codes: Vec<i64> = groups.iter().map(|g| g.fsg).collect();
    assert_eq!(codes, vec![15, 58, 59]);
    assert_eq!(
        groups[2].title.as_deref(),
        Some("ELECTRICAL AND ELECTRONIC EQUIPMENT COMPONENTS")
    );

    let in_59 = engine.fsc().classes_in_group("59").await.unwrap();
    assert_eq!(in_59.len(), 1);
    assert_eq!(in_59[0].get("FSC"), Some(&Value::Integer(5985)));
    assert!(matches!(
        engine.fsc().classes_in_group("xx").await,
        Err(EngineError::Query(_))
    ));

    let class = engine.fsc().get_class("1560").await.unwrap().unwrap();
    assert_eq!(class.text("FSC_TITLE").as_deref(), Some("AIRFRAME STRUCTURAL COMPONENTS"));

    let hits = engine.fsc().search("5985", 10, 0).await.unwrap();
    assert_eq!(hits[0].get("FSC"), Some(&Value::Integer(5985)));
    engine.shutdown().await;
}

#[tokio::test]
async fn contractor_lookups() {
    let (_tmp, config) = setup_data();
    let engine = open(&config).await;
    index(&engine, tables::P_CAGE).await;

    let row = engine.cage().get_by_code("1abc2").await.unwrap().unwrap();
    assert_eq!(row.text("COMPANY").as_deref(), Some("ACME AEROSPACE"));

    let hits = engine.cage().search("radom", 10, 0).await.unwrap();
    let codes: Vec<String> = hits.iter().filter_map(|r| r.text("CAGE_CODE")).collect();
    // Exact code first, then ascending code.
    assert_eq!(codes, vec!["RADOM", "0AAA1", "K1234"]);

    let page = engine.cage().search("radom", 1, 1).await.unwrap();
    assert_eq!(page[0].text("CAGE_CODE").as_deref(), Some("0AAA1"));

    let none = engine
        .cage()
        .search_by_location(&LocationFilter::default(), 10)
        .await
        .unwrap();
    assert!(none.is_empty());
    let kansas = engine
        .cage()
        .search_by_location(
            &LocationFilter {
                state: Some("ks".to_string()),
                ..Default::default()
            },
            10,
        )
        .await
        .unwrap();
    assert_eq!(kansas.len(), 1);

    let stats = engine.cage().stats().await.unwrap();
    assert_eq!(stats.total_records, 4);
    assert_eq!(stats.top_countries[0].value, Value::from("UNITED STATES"));
    assert_eq!(stats.top_countries[0].count, 3);
    engine.shutdown().await;
}

#[tokio::test]
async fn contractor_search_pages_in_code_order() {
    let (_tmp, config) = setup_data();
    write(
        &config.data.root,
        "CAGE/P_CAGE.CSV",
        "CAGE_CODE,COMPANY,CITY,STATE_PROVINCE,COUNTRY,CAGE_STATUS\n\
         0AAA1,ACME,DAYTON,OH,UNITED STATES,A\n\
         ZZZZ9,DAYTON TOOL,COLUMBUS,OH,UNITED STATES,A\n",
    );
    let engine = open(&config).await;
    index(&engine, tables::P_CAGE).await;

    // A city match with the lower code precedes a company-name match.
    let hits = engine.cage().search("dayton", 10, 0).await.unwrap();
    let codes: Vec<String> = hits.iter().filter_map(|r| r.text("CAGE_CODE")).collect();
    assert_eq!(codes, vec!["0AAA1", "ZZZZ9"]);

    // Unified search still ranks the name match above the city match.
    let out = engine.search("dayton", 10).await.unwrap();
    let ranked: Vec<(&str, MatchKind)> = out
        .results
        .iter()
        .map(|r| (r.key.as_str(), r.match_kind))
        .collect();
    assert_eq!(
        ranked,
        vec![("ZZZZ9", MatchKind::Name), ("0AAA1", MatchKind::Other)]
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn item_names() {
    let (_tmp, config) = setup_data();
    let engine = open(&config).await;
    index(&engine, tables::V_H6_NAME_INC).await;

    let row = engine.item_names().get_by_inc("02788").await.unwrap().unwrap();
    assert_eq!(row.text("FIIG_TITLE").as_deref(), Some("RADOME"));
    assert_eq!(row.get("DT_ESTB_CANC"), Some(&Value::from("1968-01-01")));

    let all = engine.item_names().list_all(10).await.unwrap();
    let titles: Vec<String> = all.iter().filter_map(|r| r.text("FIIG_TITLE")).collect();
    assert_eq!(titles, vec!["ANTENNA", "RADOME"]);

    let hits = engine.item_names().search("radar", 10, 0).await.unwrap();
    assert_eq!(hits.len(), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn query_validation_errors() {
    let (_tmp, config) = setup_data();
    let engine = open(&config).await;
    index(&engine, tables::V_H2_FSC).await;

    assert!(matches!(
        engine.query(tables::V_H2_FSC, &Query::all().limit(0)).await,
        Err(EngineError::Query(_))
    ));
    assert!(matches!(
        engine.query(tables::V_H2_FSC, &Query::all().select(&["NOPE"])).await,
        Err(EngineError::Query(_))
    ));
    assert!(matches!(
        engine
            .query(tables::V_H2_FSC, &Query::all().offset(u64::MAX))
            .await,
        Err(EngineError::Query(_))
    ));
    let clamped = engine
        .query(tables::V_H2_FSC, &Query::all().limit(1_000_000))
        .await
        .unwrap();
    assert_eq!(clamped.len(), 3);
    assert!(matches!(
        engine.query("NOT_A_TABLE", &Query::all()).await,
        Err(EngineError::UnknownTable(_))
    ));
    engine.shutdown().await;
}

#[tokio::test]
async fn state_survives_restart() {
    let (_tmp, config) = setup_data();
    {
        let engine = open(&config).await;
        index(&engine, tables::P_CAGE).await;
        engine.shutdown().await;
    }

    // Remove the source: the stored table is trusted without re-reading it.
    fs::remove_file(data_path(&config, "CAGE/P_CAGE.CSV")).unwrap();
    let engine = open(&config).await;
    let state = engine.state().get(tables::P_CAGE).unwrap();
    assert_eq!(state.status, IndexStatus::Indexed);
    assert!(state.materialized);
    assert_eq!(state.row_count, Some(4));
    let report = engine
        .materialize(tables::P_CAGE, MaterializeOptions::default())
        .await
        .unwrap();
    assert!(report.reused_existing);
    engine.shutdown().await;
}

#[tokio::test]
async fn drop_table_then_reindex() {
    let (_tmp, config) = setup_data();
    let engine = open(&config).await;
    index(&engine, tables::V_H6_NAME_INC).await;
    engine.drop_table(tables::V_H6_NAME_INC).await.unwrap();
    assert!(matches!(
        engine.item_names().get_by_inc("02788").await,
        Err(EngineError::Unavailable { .. })
    ));
    index(&engine, tables::V_H6_NAME_INC).await;
    assert!(engine.item_names().get_by_inc("02788").await.unwrap().is_some());
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_materialization_is_observable_through_status() {
    let (_tmp, config) = setup_data();
    let engine = open(&config).await;

    let scheduled = engine.trigger_materialize_all(Some(PriorityClass::Priority), MaterializeOptions::default());
    assert_eq!(
        scheduled,
        vec![
            tables::P_CAGE.to_string(),
            tables::V_H2_FSC.to_string(),
            tables::V_H2_FSG.to_string(),
            tables::V_H6_NAME_INC.to_string(),
        ]
    );
    for _ in 0..500 {
        if !engine.has_background_work() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    for table in &scheduled {
        wait_until_idle(&engine, table).await;
    }

    let status = engine.status();
    for s in status.iter().filter(|s| s.class == PriorityClass::Priority) {
        assert_eq!(s.state.status, IndexStatus::Indexed, "{}", s.name);
        assert!(s.state.last_indexed_at.is_some());
    }
    assert!(status
        .iter()
        .filter(|s| s.class == PriorityClass::Large)
        .all(|s| s.state.status == IndexStatus::NotIndexed));
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abandoned_ingestion_leaves_no_partial_table() {
    let (_tmp, mut config) = setup_data();
    config.ingest.batch_rows = 50;
    let mut big = String::from("NIIN,FSC,ITEM_NAME,INC,DT_NIIN_ASGMT\n");
    for i in 0..20_000u32 {
        big.push_str(&format!("{:09},5985,ITEM {},,\n", 200_000_000 + i, i));
    }
    write(&config.data.root, "IDENTIFICATION/P_FLIS_NSN.CSV", &big);

    {
        let engine = open(&config).await;
        engine
            .trigger_materialize(tables::P_FLIS_NSN, MaterializeOptions::default())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        engine.shutdown().await;
        if let Some(state) = engine.state().get(tables::P_FLIS_NSN) {
            assert_ne!(state.status, IndexStatus::Indexing);
        }
    }

    let engine = open(&config).await;
    let pool = sqlx::SqlitePool::connect(&format!("sqlite:{}", config.db.path.display()))
        .await
        .unwrap();
    let staging: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE '\\_\\_staging\\_\\_%' ESCAPE '\\'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    pool.close().await;
    assert_eq!(staging, 0);

    if engine.state().is_materialized(tables::P_FLIS_NSN) {
        let n = engine
            .store()
            .count(tables::P_FLIS_NSN, &Predicate::All)
            .await
            .unwrap();
        assert_eq!(n, 20_000);
    }
    engine.shutdown().await;
}

#[tokio::test]
async fn stale_staging_tables_are_dropped_on_open() {
    let (_tmp, config) = setup_data();
    {
        let engine = open(&config).await;
        engine.shutdown().await;
    }
    let url = format!("sqlite:{}", config.db.path.display());
    let pool = sqlx::SqlitePool::connect(&url).await.unwrap();
    sqlx::query("CREATE TABLE \"__staging__P_CAGE\" (CAGE_CODE TEXT)")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    let engine = open(&config).await;
    let pool = sqlx::SqlitePool::connect(&url).await.unwrap();
    let left: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE name = '__staging__P_CAGE'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    pool.close().await;
    assert_eq!(left, 0);
    assert!(!engine.state().is_materialized(tables::P_CAGE));
    engine.shutdown().await;
}

#[tokio::test]
async fn stats_report_sizes_for_indexed_tables() {
    let (_tmp, config) = setup_data();
    let engine = open(&config).await;
    index(&engine, tables::P_CAGE).await;

    let stats = engine.stats().await.unwrap();
    assert!(stats.db_size_bytes > 0);
    let cage = stats.tables.iter().find(|t| t.name == tables::P_CAGE).unwrap();
    assert!(cage.materialized);
    assert_eq!(cage.row_count, Some(4));
    let nsn = stats.tables.iter().find(|t| t.name == tables::P_FLIS_NSN).unwrap();
    assert!(!nsn.materialized);
    assert_eq!(nsn.size_bytes, None);
    engine.shutdown().await;
}

#[tokio::test]
async fn configured_extra_table_materializes_as_text() {
    let (_tmp, mut config) = setup_data();
    write(
        &config.data.root,
        "CAGE/V_CAGE_ADDRESS.CSV",
        "CAGE_CODE,STREET_ADDRESS_1,CITY,ZIP_POSTAL_ZONE\n\
         0AAA1,100 MAIN ST,WICHITA,67201\n\
         1ABC2,1 PIER WAY,SEATTLE,01234\n\
         0AAA1,200 SECOND ST,WICHITA,67202\n",
    );
    config.tables.insert(
        "V_CAGE_ADDRESS".to_string(),
        TableConfig {
            path: PathBuf::from("CAGE/V_CAGE_ADDRESS.CSV"),
            key: Some("CAGE_CODE".to_string()),
            columns: ["CAGE_CODE", "STREET_ADDRESS_1", "CITY", "ZIP_POSTAL_ZONE"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            indexes: vec!["CITY".to_string()],
            ..Default::default()
        },
    );
    let engine = open(&config).await;
    let descriptor = engine.registry().get("v_cage_address").unwrap();
    assert_eq!(descriptor.class, PriorityClass::Priority);

    let report = engine
        .materialize("v_cage_address", MaterializeOptions::default())
        .await
        .unwrap();
    assert_eq!(report.table, "V_CAGE_ADDRESS");
    assert_eq!(report.rows, 2);
    assert_eq!(report.duplicates, 1);

    // Every column stays text, so leading zeros survive.
    let rows = engine
        .query(
            "V_CAGE_ADDRESS",
            &Query::new(Predicate::eq("CITY", "SEATTLE")),
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("ZIP_POSTAL_ZONE"), Some(&Value::from("01234")));

    let info = engine.table_info("V_CAGE_ADDRESS").await.unwrap();
    assert_eq!(info.status.state.row_count, Some(2));
    assert_eq!(info.key.as_deref(), Some("CAGE_CODE"));
    assert_eq!(info.columns.len(), 4);
    assert!(info.columns.iter().all(|c| c.ty == ColumnType::Text));

    let outcomes = engine
        .materialize_all(Some(PriorityClass::Priority), MaterializeOptions::default())
        .await;
    let extra = outcomes
        .iter()
        .find(|o| o.table == "V_CAGE_ADDRESS")
        .unwrap();
    assert!(extra.report.as_ref().unwrap().reused_existing);
    engine.shutdown().await;
}
