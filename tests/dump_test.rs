//! SQLite dump and restore round trips.

mod common;

use agp_dal::DbError;
use agp_dal::config::ConnectionParameters;
use agp_dal::models::DataType;
use agp_dal::Connection;
use common::{count, id, keyed_table, sqlite};

fn gzip_available() -> bool {
    std::process::Command::new("gzip")
        .arg("--version")
        .output()
        .is_ok_and(|out| out.status.success())
}

async fn populated(dir: &tempfile::TempDir) -> Connection {
    let mut conn = sqlite(dir);
    conn.create_table(&keyed_table("agp_dump", &[("v", DataType::Int)]))
        .await
        .unwrap();
    for i in 0..5 {
        conn.insert("agp_dump", &[("id", id(i)), ("v", id(i * 2))], None)
            .await
            .unwrap();
    }
    conn
}

#[tokio::test]
async fn test_dump_and_restore_plain_copy() {
    let dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let target = out.path().join("backup.db3");
    let mut conn = populated(&dir).await;

    conn.dump(&target, &[]).await.unwrap();
    assert!(target.exists());

    conn.delete("agp_dump", &[("id", id(0))]).await.unwrap();
    conn.drop_table("agp_dump").await.unwrap();
    assert!(!conn.has_table("agp_dump").await.unwrap());

    conn.restore(&target).await.unwrap();
    assert!(conn.has_table("agp_dump").await.unwrap());
    assert_eq!(count(&mut conn, "agp_dump").await, 5);
}

#[tokio::test]
async fn test_dump_and_restore_gzip() {
    if !gzip_available() {
        eprintln!("gzip not installed, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let target = out.path().join("backup.db3.gz");
    let mut conn = populated(&dir).await;

    conn.dump(&target, &[]).await.unwrap();
    let header = std::fs::read(&target).unwrap();
    assert_eq!(&header[..2], &[0x1f, 0x8b]);

    conn.drop_table("agp_dump").await.unwrap();
    conn.restore(&target).await.unwrap();
    assert_eq!(count(&mut conn, "agp_dump").await, 5);
}

#[tokio::test]
async fn test_dump_refused_inside_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let mut conn = populated(&dir).await;

    conn.begin_transaction().await.unwrap();
    let err = conn
        .dump(&out.path().join("backup.db3"), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Transaction { .. }));
    conn.rollback_transaction().await.unwrap();
}

#[tokio::test]
async fn test_memory_database_cannot_be_dumped() {
    let out = tempfile::tempdir().unwrap();
    let mut conn =
        Connection::new(ConnectionParameters::new("sqlite", "", "", "", ":memory:")).unwrap();

    let err = conn
        .dump(&out.path().join("backup.db3"), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));
}

#[tokio::test]
async fn test_restore_of_missing_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut conn = populated(&dir).await;

    let err = conn
        .restore(&dir.path().join("does-not-exist.db3"))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Dump { .. }));
}
