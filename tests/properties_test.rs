//! End-to-end behaviour of the DAL against SQLite.

mod common;

use agp_dal::DbError;
use agp_dal::models::{DataType, QueryParam, QueryRequest, TableColumn};
use common::{count, id, int, keyed_table, sqlite, text};

#[tokio::test]
async fn test_char_columns_round_trip_truncated() {
    let dir = tempfile::tempdir().unwrap();
    let mut conn = sqlite(&dir);

    let types = [
        ("c10", DataType::Char10),
        ("c20", DataType::Char20),
        ("c100", DataType::Char100),
        ("c254", DataType::Char254),
        ("c500", DataType::Char500),
        ("body", DataType::Text),
        ("long_body", DataType::LongText),
    ];
    conn.create_table(&keyed_table("agp_round_trip", &types))
        .await
        .unwrap();

    let payload = "abcdefghij".repeat(60);
    let mut values = vec![("id", id(1))];
    for (column, data_type) in types {
        values.push((
            column,
            conn.convert_to_database_value(QueryParam::from(payload.as_str()), data_type),
        ));
    }
    conn.insert("agp_round_trip", &values, None).await.unwrap();

    let row = conn
        .select_row("agp_round_trip", &["*"], &[("id", id(1))], false, None)
        .await
        .unwrap()
        .unwrap();
    for (column, data_type) in types {
        let expected = data_type.char_length().unwrap_or(payload.len());
        let stored = text(&row, column);
        assert_eq!(stored.len(), expected, "{column}");
        assert_eq!(stored, payload[..expected], "{column}");
    }
}

#[tokio::test]
async fn test_placeholders_bind_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut conn = sqlite(&dir);

    let row = conn
        .fetch_row(
            QueryRequest::new("SELECT ? AS a, ? AS b, ? AS c, ? AS d")
                .param(1)
                .param("two")
                .param(3)
                .param("four"),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(int(&row, "a"), 1);
    assert_eq!(text(&row, "b"), "two");
    assert_eq!(int(&row, "c"), 3);
    assert_eq!(text(&row, "d"), "four");
}

#[tokio::test]
async fn test_question_marks_in_literals_are_not_placeholders() {
    let dir = tempfile::tempdir().unwrap();
    let mut conn = sqlite(&dir);

    let row = conn
        .fetch_row(QueryRequest::new("SELECT 'why?' AS q, ? AS p").param("yes"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(text(&row, "q"), "why?");
    assert_eq!(text(&row, "p"), "yes");
}

#[tokio::test]
async fn test_pagination_windows() {
    let dir = tempfile::tempdir().unwrap();
    let mut conn = sqlite(&dir);
    conn.create_table(&keyed_table("agp_page", &[]))
        .await
        .unwrap();
    let rows: Vec<Vec<QueryParam>> = (0..30).map(|i| vec![id(i)]).collect();
    conn.multi_insert("agp_page", &["id"], &rows, None)
        .await
        .unwrap();

    let query = "SELECT id FROM agp_page ORDER BY id DESC";
    let first = conn
        .fetch_all(QueryRequest::new(query).window(0, 9))
        .await
        .unwrap();
    let ids: Vec<i64> = first.iter().map(|r| int(r, "id")).collect();
    assert_eq!(ids, (20..30).rev().collect::<Vec<_>>());

    let second = conn
        .fetch_all(QueryRequest::new(query).window(5, 14))
        .await
        .unwrap();
    let ids: Vec<i64> = second.iter().map(|r| int(r, "id")).collect();
    assert_eq!(ids, (15..25).rev().collect::<Vec<_>>());

    // Negative bounds disable windowing
    let all = conn
        .fetch_all(QueryRequest::new(query).window(-1, 9))
        .await
        .unwrap();
    assert_eq!(all.len(), 30);
}

#[tokio::test]
async fn test_upsert_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mut conn = sqlite(&dir);
    conn.create_table(&keyed_table(
        "agp_upsert",
        &[("name", DataType::Char100), ("score", DataType::Int)],
    ))
    .await
    .unwrap();

    let columns = ["id", "name", "score"];
    conn.insert_or_update(
        "agp_upsert",
        &columns,
        &[id(7), QueryParam::from("first"), QueryParam::Int(1)],
        &["id"],
    )
    .await
    .unwrap();
    conn.insert_or_update(
        "agp_upsert",
        &columns,
        &[id(7), QueryParam::from("second"), QueryParam::Int(2)],
        &["id"],
    )
    .await
    .unwrap();

    assert_eq!(count(&mut conn, "agp_upsert").await, 1);
    let row = conn
        .select_row("agp_upsert", &["name", "score"], &[("id", id(7))], false, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(text(&row, "name"), "second");
    assert_eq!(int(&row, "score"), 2);
}

#[tokio::test]
async fn test_nested_rollback_dooms_outer_commit() {
    let dir = tempfile::tempdir().unwrap();
    let mut conn = sqlite(&dir);
    conn.create_table(&keyed_table("agp_tx", &[("v", DataType::Int)]))
        .await
        .unwrap();

    conn.begin_transaction().await.unwrap();
    conn.insert("agp_tx", &[("id", id(1)), ("v", id(10))], None)
        .await
        .unwrap();
    conn.begin_transaction().await.unwrap();
    conn.insert("agp_tx", &[("id", id(2)), ("v", id(20))], None)
        .await
        .unwrap();
    conn.rollback_transaction().await.unwrap();
    assert!(conn.is_transaction_dirty());
    assert_eq!(conn.transaction_depth(), 1);

    let err = conn.commit_transaction().await.unwrap_err();
    assert!(matches!(err, DbError::Commit));
    assert_eq!(conn.transaction_depth(), 0);
    assert!(!conn.is_transaction_dirty());
    assert_eq!(count(&mut conn, "agp_tx").await, 0);
}

#[tokio::test]
async fn test_nested_commits_persist() {
    let dir = tempfile::tempdir().unwrap();
    let mut conn = sqlite(&dir);
    conn.create_table(&keyed_table("agp_tx", &[("v", DataType::Int)]))
        .await
        .unwrap();

    conn.begin_transaction().await.unwrap();
    conn.insert("agp_tx", &[("id", id(1)), ("v", id(10))], None)
        .await
        .unwrap();
    conn.begin_transaction().await.unwrap();
    conn.insert("agp_tx", &[("id", id(2)), ("v", id(20))], None)
        .await
        .unwrap();
    conn.commit_transaction().await.unwrap();
    conn.commit_transaction().await.unwrap();

    assert_eq!(count(&mut conn, "agp_tx").await, 2);
}

#[tokio::test]
async fn test_outer_rollback_discards_everything() {
    let dir = tempfile::tempdir().unwrap();
    let mut conn = sqlite(&dir);
    conn.create_table(&keyed_table("agp_tx", &[("v", DataType::Int)]))
        .await
        .unwrap();

    conn.begin_transaction().await.unwrap();
    conn.insert("agp_tx", &[("id", id(1)), ("v", id(10))], None)
        .await
        .unwrap();
    assert_eq!(count(&mut conn, "agp_tx").await, 1);
    conn.rollback_transaction().await.unwrap();

    assert_eq!(count(&mut conn, "agp_tx").await, 0);
    assert!(matches!(
        conn.rollback_transaction().await.unwrap_err(),
        DbError::Transaction { .. }
    ));
}

#[tokio::test]
async fn test_multi_insert_chunks_past_parameter_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    let mut conn = sqlite(&dir);

    let extra: Vec<(String, DataType)> = (1..=10).map(|i| (format!("c{i}"), DataType::Int)).collect();
    let extra_refs: Vec<(&str, DataType)> = extra.iter().map(|(c, t)| (c.as_str(), *t)).collect();
    conn.create_table(&keyed_table("agp_bulk", &extra_refs))
        .await
        .unwrap();

    let mut columns = vec!["id"];
    columns.extend(extra.iter().map(|(c, _)| c.as_str()));
    assert_eq!(columns.len(), 11);

    let rows: Vec<Vec<QueryParam>> = (0..1000)
        .map(|i| (0..11).map(|c| QueryParam::Int(i * 100 + c)).collect())
        .collect();
    let affected = conn
        .multi_insert("agp_bulk", &columns, &rows, None)
        .await
        .unwrap();

    assert_eq!(affected, 1000);
    assert_eq!(count(&mut conn, "agp_bulk").await, 1000);
    // 970 / 11 = 88 rows per statement
    assert!(conn.number_of_queries() >= 12);
}

#[tokio::test]
async fn test_change_column_keeps_data() {
    let dir = tempfile::tempdir().unwrap();
    let mut conn = sqlite(&dir);
    let table = keyed_table(
        "agp_mutate",
        &[("old_int", DataType::Int), ("label", DataType::Char20)],
    )
    .with_index(agp_dal::models::TableIndex::on_columns("ix_mutate_old", &["old_int", "label"]));
    conn.create_table(&table).await.unwrap();

    for i in 1..=5 {
        conn.insert(
            "agp_mutate",
            &[("id", id(i)), ("old_int", id(i * 1000)), ("label", QueryParam::from(format!("row{i}")))],
            None,
        )
        .await
        .unwrap();
    }

    conn.change_column(
        "agp_mutate",
        "old_int",
        &TableColumn::new("new_bigint", DataType::BigInt),
    )
    .await
    .unwrap();

    let info = conn.get_table_information("agp_mutate").await.unwrap();
    assert!(!info.has_column("old_int"));
    assert_eq!(
        info.column("new_bigint").and_then(|c| c.data_type),
        Some(DataType::BigInt)
    );
    assert_eq!(info.primary_columns(), vec!["id"]);
    let index = info.index("ix_mutate_old").unwrap();
    assert_eq!(index.columns(), vec!["new_bigint", "label"]);

    let rows = conn
        .fetch_all(QueryRequest::new("SELECT id, new_bigint, label FROM agp_mutate ORDER BY id"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 5);
    for (i, row) in (1..=5).zip(&rows) {
        assert_eq!(int(row, "new_bigint"), i * 1000);
        assert_eq!(text(row, "label"), format!("row{i}"));
    }
    assert!(!conn.has_table("agp_mutate_shadow").await.unwrap());
}

#[tokio::test]
async fn test_remove_column_keeps_other_data() {
    let dir = tempfile::tempdir().unwrap();
    let mut conn = sqlite(&dir);
    conn.create_table(&keyed_table(
        "agp_mutate",
        &[("gone", DataType::Int), ("kept", DataType::Char10)],
    ))
    .await
    .unwrap();
    conn.insert(
        "agp_mutate",
        &[("id", id(1)), ("gone", id(5)), ("kept", QueryParam::from("k"))],
        None,
    )
    .await
    .unwrap();

    conn.remove_column("agp_mutate", "gone").await.unwrap();

    assert!(!conn.has_column("agp_mutate", "gone").await.unwrap());
    let row = conn
        .select_row("agp_mutate", &["*"], &[("id", id(1))], false, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.len(), 2);
    assert_eq!(text(&row, "kept"), "k");
}

#[tokio::test]
async fn test_failed_column_change_is_wrapped_and_leaves_table_intact() {
    let dir = tempfile::tempdir().unwrap();
    let mut conn = sqlite(&dir);
    conn.create_table(&keyed_table("agp_mutate", &[("v", DataType::Int)]))
        .await
        .unwrap();
    conn.insert("agp_mutate", &[("id", id(1)), ("v", id(2))], None)
        .await
        .unwrap();

    let err = conn
        .change_column("agp_mutate", "missing", &TableColumn::new("x", DataType::Int))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::ChangeColumn { .. }));

    let err = conn.remove_column("agp_mutate", "missing").await.unwrap_err();
    assert!(matches!(err, DbError::RemoveColumn { .. }));

    assert_eq!(count(&mut conn, "agp_mutate").await, 1);
    assert!(conn.has_column("agp_mutate", "v").await.unwrap());
}

#[tokio::test]
async fn test_substring_expression() {
    let dir = tempfile::tempdir().unwrap();
    let mut conn = sqlite(&dir);
    conn.create_table(&keyed_table("agp_text", &[("temp_char100", DataType::Char100)]))
        .await
        .unwrap();
    conn.insert(
        "agp_text",
        &[("id", id(1)), ("temp_char100", QueryParam::from("foobarbazquux"))],
        None,
    )
    .await
    .unwrap();

    let bar = conn.substring_expression("temp_char100", 4, Some(3));
    let tail = conn.substring_expression("temp_char100", 7, None);
    let length = conn.string_length_expression("temp_char100");
    let sql = format!("SELECT {bar} AS bar, {tail} AS tail, {length} AS len FROM agp_text");
    let row = conn
        .fetch_row(QueryRequest::new(sql))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(text(&row, "bar"), "bar");
    assert_eq!(text(&row, "tail"), "bazquux");
    assert_eq!(int(&row, "len"), 13);
}

#[tokio::test]
async fn test_concat_and_least_expressions() {
    let dir = tempfile::tempdir().unwrap();
    let mut conn = sqlite(&dir);

    let concat = conn.concat_expression(&["'agp'", "'_'", "'dal'"]);
    let least = conn.least_expression(&["3", "1", "2"]);
    let row = conn
        .fetch_row(QueryRequest::new(format!("SELECT {concat} AS c, {least} AS l")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(text(&row, "c"), "agp_dal");
    assert_eq!(int(&row, "l"), 1);
}
