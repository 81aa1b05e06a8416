use std::collections::BTreeMap;

use rstest::rstest;
use serde_json::json;

use blobtable::blob::BlobError;
use blobtable::data_types::ID_FIELD;
use blobtable::repository::TableError;
use blobtable::schema::{ColumnDefinition, ColumnType};

use crate::{doc, make_store, ObjectStoreType};

#[rstest]
#[case::in_memory(ObjectStoreType::InMemory)]
#[case::local(ObjectStoreType::Local)]
#[tokio::test]
async fn test_drop_and_readd_column(#[case] object_store_type: ObjectStoreType) {
    let ts = make_store(object_store_type);
    let table_id = ts
        .repository
        .create(
            &ts.session,
            "devices",
            vec![
                ColumnDefinition::new("label", ColumnType::String),
                ColumnDefinition::new("serial", ColumnType::String).unique(),
            ],
        )
        .await
        .unwrap();

    for (label, serial) in [("a", "s1"), ("b", "s2")] {
        ts.repository
            .add_document(
                &ts.session,
                &table_id,
                &doc(json!({"label": label, "serial": serial})),
            )
            .await
            .unwrap();
    }
    let index_id = ts
        .repository
        .get_table(&ts.session, &table_id)
        .await
        .unwrap()
        .column("serial")
        .unwrap()
        .index_file_id
        .clone()
        .unwrap();

    ts.repository
        .drop_column(&ts.session, &table_id, "serial")
        .await
        .unwrap();

    let table = ts.repository.get_table(&ts.session, &table_id).await.unwrap();
    assert!(table.column("serial").is_none());
    assert!(table.documents.iter().all(|d| !d.contains_key("serial")));
    assert!(matches!(
        ts.store.get_fresh(&index_id).await.unwrap_err(),
        BlobError::NotFound { .. }
    ));

    let readded = ts
        .repository
        .add_column(
            &ts.session,
            &table_id,
            ColumnDefinition::new("serial", ColumnType::String),
        )
        .await
        .unwrap();
    assert_eq!(readded.index_file_id, None);

    let table = ts.repository.get_table(&ts.session, &table_id).await.unwrap();
    assert!(table.documents.iter().all(|d| !d.contains_key("serial")));

    let err = ts
        .repository
        .add_column(
            &ts.session,
            &table_id,
            ColumnDefinition::new("label", ColumnType::String),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::ColumnAlreadyExists { ref key } if key == "label"));

    let err = ts
        .repository
        .drop_column(&ts.session, &table_id, ID_FIELD)
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::SystemColumn { .. }));
}

#[rstest]
#[case::in_memory(ObjectStoreType::InMemory)]
#[case::local(ObjectStoreType::Local)]
#[tokio::test]
async fn test_make_column_unique(#[case] object_store_type: ObjectStoreType) {
    let ts = make_store(object_store_type);
    let table_id = ts
        .repository
        .create(
            &ts.session,
            "books",
            vec![ColumnDefinition::new("isbn", ColumnType::String)],
        )
        .await
        .unwrap();

    let mut expected: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for isbn in ["111", "222", "111"] {
        let document = ts
            .repository
            .add_document(&ts.session, &table_id, &doc(json!({"isbn": isbn})))
            .await
            .unwrap();
        expected
            .entry(isbn.to_string())
            .or_default()
            .push(document[ID_FIELD].as_str().unwrap().to_string());
    }

    // Existing duplicates block the constraint
    let err = ts
        .repository
        .set_column_unique(&ts.session, &table_id, "isbn", true)
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::UniqueConstraint { ref value, .. } if value == "111"));

    let duplicate = expected["111"][1].clone();
    ts.repository
        .delete_document(&ts.session, &table_id, &duplicate)
        .await
        .unwrap();
    expected.get_mut("111").unwrap().pop();

    let column = ts
        .repository
        .set_column_unique(&ts.session, &table_id, "isbn", true)
        .await
        .unwrap();
    assert!(column.unique);

    let index = ts.read_index(column.index_file_id.as_ref().unwrap()).await;
    assert_eq!(index.map, expected);
    assert!(index.is_unique);
    assert_eq!(index.table_id, table_id);

    // Rebuilding from the same documents gives the same map in a new blob
    let rebuilt_id = ts
        .repository
        .rebuild_index(&ts.session, &table_id, "isbn")
        .await
        .unwrap();
    assert_eq!(ts.read_index(&rebuilt_id).await.map, expected);
    assert_eq!(
        ts.repository
            .get_table(&ts.session, &table_id)
            .await
            .unwrap()
            .column("isbn")
            .unwrap()
            .index_file_id,
        Some(rebuilt_id.clone())
    );

    let err = ts
        .repository
        .add_document(&ts.session, &table_id, &doc(json!({"isbn": "222"})))
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::UniqueConstraint { .. }));

    let column = ts
        .repository
        .set_column_unique(&ts.session, &table_id, "isbn", false)
        .await
        .unwrap();
    assert_eq!(column.index_file_id, None);
    assert!(ts.store.get_fresh(&rebuilt_id).await.is_err());

    ts.repository
        .add_document(&ts.session, &table_id, &doc(json!({"isbn": "222"})))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_add_column_with_default_backfills() {
    let ts = make_store(ObjectStoreType::InMemory);
    let table_id = ts
        .repository
        .create(
            &ts.session,
            "tasks",
            vec![ColumnDefinition::new("title", ColumnType::String)],
        )
        .await
        .unwrap();
    ts.repository
        .add_document(&ts.session, &table_id, &doc(json!({"title": "write tests"})))
        .await
        .unwrap();

    ts.repository
        .add_column(
            &ts.session,
            &table_id,
            ColumnDefinition::new("done", ColumnType::Boolean).with_default(json!("false")),
        )
        .await
        .unwrap();

    let table = ts.repository.get_table(&ts.session, &table_id).await.unwrap();
    assert_eq!(table.documents[0]["done"], false);

    ts.repository
        .delete_table(&ts.session, &table_id)
        .await
        .unwrap();
    assert!(ts
        .repository
        .list_tables(&ts.session)
        .await
        .unwrap()
        .is_empty());
}
