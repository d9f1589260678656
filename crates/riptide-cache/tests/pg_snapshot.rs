#![cfg(feature = "pg-tests")]

// Needs a reachable Postgres; set DATABASE_URL and run with
// `--features pg-tests`.
use riptide_cache::{PostgresSnapshotSource, SnapshotSource};
use riptide_shapes::{Column, Shape, TableRef};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

fn database_url() -> String {
    std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a test Postgres")
}

fn unique_table(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{prefix}_{}_{nanos}", std::process::id())
}

/// Pool whose sessions start with defaults that disagree with the snapshot
/// settings on every axis, to prove the snapshotter pins them itself.
async fn adversarial_pool() -> sqlx::PgPool {
    let options = PgConnectOptions::from_str(&database_url())
        .expect("parse DATABASE_URL")
        .options([
            ("DateStyle", "German, MDY"),
            ("TimeZone", "America/New_York"),
            ("extra_float_digits", "0"),
            ("bytea_output", "escape"),
            ("IntervalStyle", "postgres"),
        ]);
    PgPoolOptions::new()
        .max_connections(2)
        .connect_with(options)
        .await
        .expect("connect")
}

#[tokio::test]
async fn snapshot_formatting_is_fixed_regardless_of_session_defaults() {
    let pool = adversarial_pool().await;
    let table = unique_table("snapshot_fmt");

    sqlx::query(&format!(
        r#"CREATE TABLE "{table}" (
            "date" date,
            "timestamptz" timestamptz,
            "float" float8,
            "bytea" bytea,
            "interval" interval
        )"#
    ))
    .execute(&pool)
    .await
    .expect("create table");
    sqlx::query(&format!(
        r#"INSERT INTO "{table}" VALUES (
            DATE '2022-05-17',
            TIMESTAMPTZ '2022-01-12 00:01:00Z',
            1.234567890123456,
            '\x0510fa'::bytea,
            INTERVAL '1 day 12:59:10'
        )"#
    ))
    .execute(&pool)
    .await
    .expect("insert row");

    let shape = Shape {
        root_table: TableRef::new("public", &table),
        where_clause: None,
        projection: vec![
            Column::new("date", "date"),
            Column::new("timestamptz", "timestamptz"),
            Column::new("float", "float8"),
            Column::new("bytea", "bytea"),
            Column::new("interval", "interval"),
        ],
        pk: Vec::new(),
    };

    let source = PostgresSnapshotSource::new(pool.clone());
    let mut session = source.open(&shape).await.expect("open snapshot");
    assert!(session.xmin > 0, "xmin must be a live transaction horizon");

    let row = session
        .rows
        .recv()
        .await
        .expect("one row")
        .expect("row ok");
    assert_eq!(
        std::str::from_utf8(&row).expect("utf8"),
        r#"{"date":"2022-05-17","timestamptz":"2022-01-12 00:01:00+00","float":"1.234567890123456","bytea":"\\x0510fa","interval":"P1DT12H59M10S"}"#
    );
    assert!(session.rows.recv().await.is_none());

    sqlx::query(&format!(r#"DROP TABLE "{table}""#))
        .execute(&pool)
        .await
        .expect("drop table");
}

#[tokio::test]
async fn snapshot_honours_the_shape_predicate() {
    let pool = adversarial_pool().await;
    let table = unique_table("snapshot_pred");

    sqlx::query(&format!(
        r#"CREATE TABLE "{table}" (id int8, value text)"#
    ))
    .execute(&pool)
    .await
    .expect("create table");
    sqlx::query(&format!(
        r#"INSERT INTO "{table}" VALUES (1, 'a'), (2, 'b'), (3, 'c')"#
    ))
    .execute(&pool)
    .await
    .expect("insert rows");

    let shape = Shape {
        root_table: TableRef::new("public", &table),
        where_clause: Some("id > 1".into()),
        projection: vec![Column::new("id", "int8"), Column::new("value", "text")],
        pk: vec!["id".into()],
    };

    let source = PostgresSnapshotSource::new(pool.clone());
    let mut session = source.open(&shape).await.expect("open snapshot");
    let mut rows = Vec::new();
    while let Some(row) = session.rows.recv().await {
        rows.push(String::from_utf8(row.expect("row ok").to_vec()).expect("utf8"));
    }
    assert_eq!(
        rows,
        vec![
            r#"{"id":"2","value":"b"}"#.to_string(),
            r#"{"id":"3","value":"c"}"#.to_string(),
        ]
    );

    sqlx::query(&format!(r#"DROP TABLE "{table}""#))
        .execute(&pool)
        .await
        .expect("drop table");
}
