use rstest::rstest;
use serde_json::json;

use blobtable::data_types::{CREATED_AT_FIELD, ID_FIELD, UPDATED_AT_FIELD};
use blobtable::repository::TableError;
use blobtable::schema::ErrorCode;

use crate::{doc, make_store, ObjectStoreType};

#[rstest]
#[case::in_memory(ObjectStoreType::InMemory)]
#[case::local(ObjectStoreType::Local)]
#[case::cached_local(ObjectStoreType::CachedLocal)]
#[tokio::test]
async fn test_unique_email_table(#[case] object_store_type: ObjectStoreType) {
    let ts = make_store(object_store_type);
    let columns = serde_json::from_value(json!([
        {"key": "email", "type": "string", "unique": true, "validation": {"email": true}}
    ]))
    .unwrap();
    let table_id = ts
        .repository
        .create(&ts.session, "users", columns)
        .await
        .unwrap();

    let first = ts
        .repository
        .add_document(&ts.session, &table_id, &doc(json!({"email": "a@x.com"})))
        .await
        .unwrap();
    assert_eq!(first["email"], "a@x.com");
    assert_eq!(first[CREATED_AT_FIELD], first[UPDATED_AT_FIELD]);

    let err = ts
        .repository
        .add_document(&ts.session, &table_id, &doc(json!({"email": "not-an-email"})))
        .await
        .unwrap_err();
    let TableError::Validation(errors) = err else {
        panic!("expected a validation error, got {err:?}");
    };
    assert_eq!(errors.len(), 1);
    assert_eq!(errors.errors()[0].field, "email");
    assert_eq!(errors.errors()[0].code, ErrorCode::InvalidEmail);

    let err = ts
        .repository
        .add_document(&ts.session, &table_id, &doc(json!({"email": "a@x.com"})))
        .await
        .unwrap_err();
    assert!(
        matches!(err, TableError::UniqueConstraint { ref field, ref value } if field == "email" && value == "a@x.com")
    );
    assert_eq!(err.to_string(), "unique constraint failed for field email");

    // A different value still goes through
    ts.repository
        .add_document(&ts.session, &table_id, &doc(json!({"email": "b@x.com"})))
        .await
        .unwrap();

    let table = ts.repository.get_table(&ts.session, &table_id).await.unwrap();
    assert_eq!(table.documents.len(), 2);
    assert_ne!(table.documents[0][ID_FIELD], table.documents[1][ID_FIELD]);

    // The index blob is where the schema says it is
    let index_id = table.column("email").unwrap().index_file_id.clone().unwrap();
    let index = ts.read_index(&index_id).await;
    assert_eq!(index.ids("a@x.com"), [first[ID_FIELD].as_str().unwrap()]);
    assert_eq!(index.map.len(), 2);
}

#[rstest]
#[case::in_memory(ObjectStoreType::InMemory)]
#[case::local(ObjectStoreType::Local)]
#[tokio::test]
async fn test_deleted_value_can_be_reused(#[case] object_store_type: ObjectStoreType) {
    let ts = make_store(object_store_type);
    let columns = serde_json::from_value(json!([
        {"key": "code", "type": "string", "unique": true}
    ]))
    .unwrap();
    let table_id = ts
        .repository
        .create(&ts.session, "coupons", columns)
        .await
        .unwrap();

    let coupon = ts
        .repository
        .add_document(&ts.session, &table_id, &doc(json!({"code": "SPRING"})))
        .await
        .unwrap();
    ts.repository
        .delete_document(
            &ts.session,
            &table_id,
            coupon[ID_FIELD].as_str().unwrap(),
        )
        .await
        .unwrap();

    let check = ts
        .repository
        .check_unique(&ts.session, &table_id, "code", &json!("SPRING"), None)
        .await
        .unwrap();
    assert!(check.safe);

    ts.repository
        .add_document(&ts.session, &table_id, &doc(json!({"code": "SPRING"})))
        .await
        .unwrap();
}
