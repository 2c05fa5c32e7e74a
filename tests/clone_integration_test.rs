// ABOUTME: Integration tests against live source and target databases
// ABOUTME: Gated by PGCOPYDB_TEST_SOURCE_PGURI / PGCOPYDB_TEST_TARGET_PGURI, ignored by default

use std::env;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use pgcopydb::catalog::{SourceCatalog, DEFAULT_SPLIT_THRESHOLD};
use pgcopydb::copy::TableDataCopier;
use pgcopydb::filters::CopyFilters;
use pgcopydb::indexes::IndexBuilder;
use pgcopydb::sentinel;
use pgcopydb::snapshot;
use pgcopydb::workdir::{DoneKey, WorkDir};
use tempfile::TempDir;

/// Test database URLs from the environment, or skip.
fn get_test_uris() -> Option<(String, String)> {
    let source = env::var("PGCOPYDB_TEST_SOURCE_PGURI").ok()?;
    let target = env::var("PGCOPYDB_TEST_TARGET_PGURI").ok()?;
    Some((source, target))
}

async fn connect(uri: &str) -> tokio_postgres::Client {
    pgcopydb::pg::connect(uri).await.expect("Failed to connect")
}

async fn setup_table(
    source: &tokio_postgres::Client,
    target: &tokio_postgres::Client,
    table: &str,
) {
    let ddl = format!(
        r#"
        DROP TABLE IF EXISTS "public"."{}" CASCADE;
        CREATE TABLE "public"."{}" (id int PRIMARY KEY, v text)
        "#,
        table, table
    );
    source.batch_execute(&ddl).await.expect("source DDL failed");
    target.batch_execute(&ddl).await.expect("target DDL failed");
}

async fn cleanup_table(
    source: &tokio_postgres::Client,
    target: &tokio_postgres::Client,
    table: &str,
) {
    let ddl = format!(r#"DROP TABLE IF EXISTS "public"."{}" CASCADE"#, table);
    let _ = source.batch_execute(&ddl).await;
    let _ = target.batch_execute(&ddl).await;
}

/// Minimal copy: three rows land on the target and the done-marker exists.
#[tokio::test]
#[ignore]
async fn test_minimal_copy() {
    let (source_uri, target_uri) =
        get_test_uris().expect("PGCOPYDB_TEST_SOURCE_PGURI and PGCOPYDB_TEST_TARGET_PGURI must be set");

    let source = connect(&source_uri).await;
    let target = connect(&target_uri).await;

    setup_table(&source, &target, "pgcopydb_test_t").await;
    source
        .batch_execute(
            r#"INSERT INTO "public"."pgcopydb_test_t" VALUES (1, 'a'), (2, 'b'), (3, 'c')"#,
        )
        .await
        .expect("insert failed");

    let tmp = TempDir::new().unwrap();
    let workdir = WorkDir::for_target(&target_uri, Some(tmp.path())).unwrap();
    workdir.ensure().unwrap();

    let held = snapshot::export_snapshot(&source_uri).await.unwrap();
    let filters = CopyFilters::new(
        vec![],
        vec![],
        vec!["public.pgcopydb_test_t".to_string()],
        vec![],
    )
    .unwrap();
    let catalog = SourceCatalog::fetch(held.client(), &filters, DEFAULT_SPLIT_THRESHOLD)
        .await
        .unwrap();
    assert_eq!(catalog.tables.len(), 1);
    let table_oid = catalog.tables[0].oid;

    let copier = TableDataCopier {
        source_uri: source_uri.clone(),
        target_uri: target_uri.clone(),
        snapshot_name: Some(held.snapshot_name().to_string()),
        jobs: 2,
        resume: false,
    };
    let summary = copier
        .run(&catalog, &workdir, Arc::new(AtomicBool::new(false)))
        .await
        .unwrap();
    assert_eq!(summary.tables_done, 1);
    assert!(workdir.is_done(DoneKey::Table(table_oid)));

    let count: i64 = target
        .query_one(r#"SELECT count(*) FROM "public"."pgcopydb_test_t""#, &[])
        .await
        .unwrap()
        .get(0);
    assert_eq!(count, 3);

    held.close().await.unwrap();
    cleanup_table(&source, &target, "pgcopydb_test_t").await;
}

/// Rerunning the copy after completion is a no-op: no duplicates.
#[tokio::test]
#[ignore]
async fn test_copy_is_idempotent() {
    let (source_uri, target_uri) = get_test_uris().expect("test URIs must be set");

    let source = connect(&source_uri).await;
    let target = connect(&target_uri).await;

    setup_table(&source, &target, "pgcopydb_test_resume").await;
    source
        .batch_execute(
            r#"INSERT INTO "public"."pgcopydb_test_resume"
               SELECT g, 'v' || g FROM generate_series(1, 1000) g"#,
        )
        .await
        .expect("insert failed");

    let tmp = TempDir::new().unwrap();
    let workdir = WorkDir::for_target(&target_uri, Some(tmp.path())).unwrap();
    workdir.ensure().unwrap();

    let filters = CopyFilters::new(
        vec![],
        vec![],
        vec!["public.pgcopydb_test_resume".to_string()],
        vec![],
    )
    .unwrap();

    for run in 0..2 {
        let held = snapshot::export_snapshot(&source_uri).await.unwrap();
        let catalog = SourceCatalog::fetch(held.client(), &filters, DEFAULT_SPLIT_THRESHOLD)
            .await
            .unwrap();

        let copier = TableDataCopier {
            source_uri: source_uri.clone(),
            target_uri: target_uri.clone(),
            snapshot_name: Some(held.snapshot_name().to_string()),
            jobs: 2,
            resume: run > 0,
        };
        copier
            .run(&catalog, &workdir, Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        held.close().await.unwrap();
    }

    let count: i64 = target
        .query_one(
            r#"SELECT count(*) FROM "public"."pgcopydb_test_resume""#,
            &[],
        )
        .await
        .unwrap()
        .get(0);
    assert_eq!(count, 1000, "second run must not duplicate rows");

    cleanup_table(&source, &target, "pgcopydb_test_resume").await;
}

/// Index builds wait for the table marker, then create the same indexes the
/// post-data pass would, and record their oids for the include-list.
#[tokio::test]
#[ignore]
async fn test_index_builder_writes_done_markers() {
    let (source_uri, target_uri) = get_test_uris().expect("test URIs must be set");

    let source = connect(&source_uri).await;
    let target = connect(&target_uri).await;

    cleanup_table(&source, &target, "pgcopydb_test_idx").await;
    source
        .batch_execute(
            r#"
            CREATE TABLE "public"."pgcopydb_test_idx" (id int PRIMARY KEY, v text);
            CREATE INDEX pgcopydb_test_idx_v ON "public"."pgcopydb_test_idx" (v);
            "#,
        )
        .await
        .expect("source DDL failed");
    // the target starts without the indexes, as after a pre-data restore
    target
        .batch_execute(r#"CREATE TABLE "public"."pgcopydb_test_idx" (id int, v text)"#)
        .await
        .expect("target DDL failed");

    let tmp = TempDir::new().unwrap();
    let workdir = WorkDir::for_target(&target_uri, Some(tmp.path())).unwrap();
    workdir.ensure().unwrap();

    let held = snapshot::export_snapshot(&source_uri).await.unwrap();
    let filters = CopyFilters::new(
        vec![],
        vec![],
        vec!["public.pgcopydb_test_idx".to_string()],
        vec![],
    )
    .unwrap();
    let catalog = SourceCatalog::fetch(held.client(), &filters, DEFAULT_SPLIT_THRESHOLD)
        .await
        .unwrap();
    held.close().await.unwrap();

    // data load done; indexes become eligible
    workdir
        .mark_done(DoneKey::Table(catalog.tables[0].oid))
        .unwrap();

    let builder = IndexBuilder {
        target_uri: target_uri.clone(),
        jobs: 2,
    };
    let built = builder
        .run(
            &catalog,
            &workdir,
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(true)),
        )
        .await
        .unwrap();
    assert_eq!(built, 2);

    for index in &catalog.indexes {
        assert!(workdir.is_done(DoneKey::Index(index.oid)));
    }

    cleanup_table(&source, &target, "pgcopydb_test_idx").await;
}

/// The sentinel row keeps its invariants through the update cycle.
#[tokio::test]
#[ignore]
async fn test_sentinel_roundtrip() {
    let (source_uri, _) = get_test_uris().expect("test URIs must be set");
    let client = connect(&source_uri).await;

    let startpos = "0/1000".parse().unwrap();
    let endpos = "0/5000".parse().unwrap();

    let row = sentinel::setup(&client, startpos, endpos).await.unwrap();
    assert_eq!(row.startpos, startpos);
    assert_eq!(row.endpos, endpos);
    assert!(!row.apply);

    let row = sentinel::update_apply(&client, true).await.unwrap();
    assert!(row.apply);

    let row = sentinel::update_replay(&client, "0/2000".parse().unwrap())
        .await
        .unwrap();
    assert_eq!(row.replay_lsn, "0/2000".parse().unwrap());
    assert!(row.replay_lsn <= row.endpos);

    let row = sentinel::get(&client).await.unwrap();
    assert!(row.apply);

    sentinel::teardown(&client).await.unwrap();
}
