use rstest::rstest;
use serde_json::{json, Value};

use blobtable::data_types::{parse_timestamp, CREATED_AT_FIELD, ID_FIELD, UPDATED_AT_FIELD};
use blobtable::query::{FilterOperator, Query, SortDirection};
use blobtable::repository::TableError;
use blobtable::schema::{ColumnDefinition, ColumnType};

use crate::{doc, make_store, ObjectStoreType, TestStore};

const NAMES: [&str; 25] = [
    "Yara", "Bob", "Carol", "Dave", "Erin", "Frank", "Grace", "Heidi", "Ivan", "Judy", "Ken",
    "Laura", "Mallory", "Niaj", "Olivia", "Peggy", "Quentin", "Rupert", "Sybil", "Trent",
    "Uma", "Victor", "Walter", "Xavier", "Alice",
];

async fn make_people(ts: &TestStore) -> String {
    let table_id = ts
        .repository
        .create(
            &ts.session,
            "people",
            vec![
                ColumnDefinition::new("name", ColumnType::String).required(),
                ColumnDefinition::new("age", ColumnType::Integer),
            ],
        )
        .await
        .unwrap();

    for (i, name) in NAMES.iter().enumerate() {
        ts.repository
            .add_document(
                &ts.session,
                &table_id,
                &doc(json!({"name": name, "age": (i + 5).to_string()})),
            )
            .await
            .unwrap();
    }
    table_id
}

#[rstest]
#[case::in_memory(ObjectStoreType::InMemory)]
#[case::local(ObjectStoreType::Local)]
#[tokio::test]
async fn test_query_adults_by_name(#[case] object_store_type: ObjectStoreType) {
    let ts = make_store(object_store_type);
    let table_id = make_people(&ts).await;

    let query = Query::default()
        .filter("age", FilterOperator::Gte, json!("18"))
        .sort_by("name", SortDirection::Asc)
        .page(1, 10);
    let result = ts
        .repository
        .read(&ts.session, &table_id, &query)
        .await
        .unwrap();

    // Ages run from 5 to 29, so 12 rows are 18 or older
    assert_eq!(result.total, 12);
    assert_eq!(result.total_pages, 2);
    assert_eq!(result.data.len(), 10);
    assert!(result
        .data
        .iter()
        .all(|d| d["age"].as_i64().unwrap() >= 18));

    let names: Vec<&str> = result
        .data
        .iter()
        .map(|d| d["name"].as_str().unwrap())
        .collect();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);

    let last_page = ts
        .repository
        .read(&ts.session, &table_id, &query.clone().page(2, 10))
        .await
        .unwrap();
    assert_eq!(last_page.data.len(), 2);
    assert_eq!(last_page.total, 12);

    let err = ts
        .repository
        .read(&ts.session, &table_id, &query.page(0, 10))
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::Query(_)));
}

#[rstest]
#[case::in_memory(ObjectStoreType::InMemory)]
#[case::cached_local(ObjectStoreType::CachedLocal)]
#[tokio::test]
async fn test_update_keeps_identity(#[case] object_store_type: ObjectStoreType) {
    let ts = make_store(object_store_type);
    let table_id = make_people(&ts).await;

    let before = ts
        .repository
        .read(
            &ts.session,
            &table_id,
            &Query::default().filter("name", FilterOperator::Equals, json!("alice")),
        )
        .await
        .unwrap()
        .data
        .remove(0);
    let doc_id = before[ID_FIELD].as_str().unwrap().to_string();

    let mut previous = before.clone();
    for age in [30, 31, 32] {
        let after = ts
            .repository
            .update_document(
                &ts.session,
                &table_id,
                &doc_id,
                &doc(json!({"age": age, ID_FIELD: "hijacked"})),
            )
            .await
            .unwrap();

        assert_eq!(after[ID_FIELD], before[ID_FIELD]);
        assert_eq!(after[CREATED_AT_FIELD], before[CREATED_AT_FIELD]);
        assert_eq!(after["name"], "Alice");
        assert_eq!(after["age"], age);

        let stamp = |d: &serde_json::Map<String, Value>| {
            parse_timestamp(d[UPDATED_AT_FIELD].as_str().unwrap()).unwrap()
        };
        assert!(stamp(&after) > stamp(&previous));
        previous = after;
    }

    // Reads see the last write even through the cache
    let stored = ts
        .repository
        .get_document(&ts.session, &table_id, &doc_id)
        .await
        .unwrap();
    assert_eq!(stored, previous);

    let err = ts
        .repository
        .update_document(&ts.session, &table_id, &doc_id, &doc(json!({"name": null})))
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::Validation(_)));
}

#[rstest]
#[case::in_memory(ObjectStoreType::InMemory)]
#[case::local(ObjectStoreType::Local)]
#[tokio::test]
async fn test_bulk_delete(#[case] object_store_type: ObjectStoreType) {
    let ts = make_store(object_store_type);
    let table_id = make_people(&ts).await;

    let young = ts
        .repository
        .read(
            &ts.session,
            &table_id,
            &Query::default()
                .filter("age", FilterOperator::Lt, json!(10))
                .page(1, 100),
        )
        .await
        .unwrap();
    assert_eq!(young.total, 5);

    let mut ids: Vec<String> = young
        .data
        .iter()
        .map(|d| d[ID_FIELD].as_str().unwrap().to_string())
        .collect();
    ids.push("not-a-document".to_string());

    let deleted = ts
        .repository
        .bulk_delete(&ts.session, &table_id, &ids)
        .await
        .unwrap();
    assert_eq!(deleted, 5);

    let remaining = ts
        .repository
        .read(&ts.session, &table_id, &Query::default())
        .await
        .unwrap();
    assert_eq!(remaining.total, 20);

    let err = ts
        .repository
        .delete_document(&ts.session, &table_id, &ids[0])
        .await
        .unwrap_err();
    assert!(matches!(err, TableError::DocumentNotFound { .. }));
}
