use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use relstore_core::{
    ChildOf, CollectionDefinition, Connects, CustomFieldType, FieldDefinition, Object, OrderBy,
    PrimitiveType, Registry, StorageRegistry, Value,
};
use serde_json::json;

use super::*;

fn object(value: Value) -> Object {
    value.as_object().cloned().unwrap()
}

#[derive(Debug)]
struct UpperCase;

impl CustomFieldType for UpperCase {
    fn name(&self) -> &str {
        "upper"
    }

    fn storage_type(&self) -> PrimitiveType {
        PrimitiveType::String
    }

    fn prepare_for_storage(&self, value: Value) -> anyhow::Result<Value> {
        match value {
            Value::String(s) => Ok(Value::String(s.to_uppercase())),
            other => anyhow::bail!("expected a string, got {other}"),
        }
    }

    fn prepare_from_storage(&self, value: Value) -> anyhow::Result<Value> {
        match value {
            Value::String(s) => Ok(Value::String(s.to_lowercase())),
            other => Ok(other),
        }
    }
}

fn registry() -> Arc<Registry> {
    let mut builder = StorageRegistry::new();
    builder
        .register_collection(
            CollectionDefinition::new("user")
                .field("identifier", FieldDefinition::new(PrimitiveType::String)),
        )
        .register_collection(
            CollectionDefinition::new("email")
                .field("address", FieldDefinition::new(PrimitiveType::String))
                .relationship(ChildOf::new("user")),
        )
        .register_collection(
            CollectionDefinition::new("emailVerification")
                .field("code", FieldDefinition::new(PrimitiveType::String))
                .relationship(ChildOf::single("email")),
        )
        .register_collection(
            CollectionDefinition::new("team").field("label", FieldDefinition::custom(Arc::new(UpperCase))),
        )
        .register_collection(CollectionDefinition::new("membership").relationship(Connects::new("user", "team")));
    Arc::new(builder.finish())
}

async fn backend_with(config: BackendConfig) -> SqlStorageBackend {
    let backend = SqlStorageBackend::in_memory(config);
    backend.configure(registry()).unwrap();
    backend.migrate(None).await.unwrap();
    backend
}

async fn backend() -> SqlStorageBackend {
    backend_with(BackendConfig::default()).await
}

async fn all(backend: &SqlStorageBackend, collection: &str) -> Vec<Object> {
    backend
        .find_objects(
            collection,
            &Object::new(),
            &FindOptions {
                order: vec![OrderBy::asc("id")],
                ..FindOptions::default()
            },
        )
        .await
        .unwrap()
}

#[derive(Debug)]
enum RunnerError {
    Storage(StorageError),
    Aborted(&'static str),
}

impl From<StorageError> for RunnerError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

#[tokio::test]
async fn create_then_find_user() {
    let backend = backend().await;
    let created = backend
        .create_object("user", object(json!({"identifier": "joe"})), &CreateOptions::default())
        .await
        .unwrap();
    assert_eq!(Value::Object(created.object), json!({"id": 1, "identifier": "joe"}));

    let found = backend
        .find_objects("user", &object(json!({"identifier": "joe"})), &FindOptions::default())
        .await
        .unwrap();
    assert_eq!(found, vec![object(json!({"id": 1, "identifier": "joe"}))]);
}

#[tokio::test]
async fn committed_runner_keeps_every_write() {
    let backend = backend().await;
    let ids = backend
        .transaction(|tx| async move {
            let joe = tx.create_object("user", object(json!({"identifier": "joe"}))).await?;
            let bob = tx.create_object("user", object(json!({"identifier": "bob"}))).await?;
            Ok::<_, StorageError>((joe.object["id"].clone(), bob.object["id"].clone()))
        })
        .await
        .unwrap();
    assert_eq!(ids, (json!(1), json!(2)));
    assert_eq!(all(&backend, "user").await.len(), 2);
}

#[tokio::test]
async fn failing_runner_rolls_back_and_returns_its_error() {
    let backend = backend().await;
    let err = backend
        .transaction(|tx| async move {
            tx.create_object("user", object(json!({"identifier": "joe"}))).await?;
            Err::<(), RunnerError>(RunnerError::Aborted("changed my mind"))
        })
        .await
        .unwrap_err();

    assert!(matches!(err, RunnerError::Aborted("changed my mind")));
    let found = backend
        .find_objects("user", &object(json!({"identifier": "joe"})), &FindOptions::default())
        .await
        .unwrap();
    assert!(found.is_empty());
}

#[tokio::test]
async fn storage_errors_inside_runner_reach_caller_unchanged() {
    let backend = backend().await;
    let err = backend
        .transaction(|tx| async move {
            tx.create_object("user", object(json!({"identifier": "joe"}))).await?;
            tx.create_object("nope", Object::new()).await?;
            Ok::<_, RunnerError>(())
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RunnerError::Storage(StorageError::UnknownCollection { ref name }) if name == "nope"
    ));
    assert!(all(&backend, "user").await.is_empty());
}

#[tokio::test]
async fn nested_create_writes_every_generated_key_back() {
    let backend = backend().await;
    let created = backend
        .create_object(
            "user",
            object(json!({
                "identifier": "joe",
                "email": [
                    {"address": "joe@a.com", "emailVerification": {"code": "x1"}},
                    {"address": "joe@b.com"},
                ],
            })),
            &CreateOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(
        Value::Object(created.object),
        json!({
            "id": 1,
            "identifier": "joe",
            "email": [
                {"id": 1, "address": "joe@a.com", "emailVerification": {"id": 1, "code": "x1"}},
                {"id": 2, "address": "joe@b.com"},
            ],
        })
    );

    let emails = backend
        .find_objects(
            "email",
            &object(json!({"user": 1})),
            &FindOptions {
                order: vec![OrderBy::asc("id")],
                ..FindOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        emails,
        vec![
            object(json!({"id": 1, "address": "joe@a.com", "user": 1})),
            object(json!({"id": 2, "address": "joe@b.com", "user": 1})),
        ]
    );
    let verification = backend
        .find_object("emailVerification", &object(json!({"email": 1})), &FindOptions::default())
        .await
        .unwrap();
    assert_eq!(verification, Some(object(json!({"id": 1, "code": "x1", "email": 1}))));
}

#[tokio::test]
async fn failing_child_leaves_nothing_behind() {
    let backend = backend().await;
    let err = backend
        .create_object(
            "user",
            object(json!({"identifier": "joe", "email": [{"address": "ok"}, {"note": "no address"}]})),
            &CreateOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Engine(_)), "{err}");
    assert!(all(&backend, "user").await.is_empty());
    assert!(all(&backend, "email").await.is_empty());
}

#[tokio::test]
async fn falsy_relationship_alias_is_not_written() {
    let backend = backend().await;
    backend
        .create_object("email", object(json!({"address": "orphan", "user": null})), &CreateOptions::default())
        .await
        .unwrap();
    let rows = all(&backend, "email").await;
    assert_eq!(rows, vec![object(json!({"id": 1, "address": "orphan", "user": null}))]);
}

#[tokio::test]
async fn updates_translate_aliases_and_count() {
    let backend = backend().await;
    for identifier in ["joe", "bob"] {
        backend
            .create_object("user", object(json!({"identifier": identifier})), &CreateOptions::default())
            .await
            .unwrap();
    }
    backend
        .create_object("email", object(json!({"address": "shared", "user": 1})), &CreateOptions::default())
        .await
        .unwrap();

    let affected = backend
        .update_objects(
            "email",
            &object(json!({"user": 1})),
            object(json!({"user": 2})),
            &UpdateOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(affected, 1);

    let count = |user: i64| {
        let backend = &backend;
        async move {
            backend
                .count_objects("email", &object(json!({"user": user})), &CountOptions::default())
                .await
                .unwrap()
        }
    };
    assert_eq!(count(1).await, 0);
    assert_eq!(count(2).await, 1);
}

#[tokio::test]
async fn connects_translates_both_sides() {
    let backend = backend().await;
    backend
        .create_object("user", object(json!({"identifier": "joe"})), &CreateOptions::default())
        .await
        .unwrap();
    backend
        .create_object("team", object(json!({"label": "core"})), &CreateOptions::default())
        .await
        .unwrap();
    backend
        .create_object("membership", object(json!({"user": 1, "team": 1})), &CreateOptions::default())
        .await
        .unwrap();

    let rows = all(&backend, "membership").await;
    assert_eq!(rows, vec![object(json!({"id": 1, "user": 1, "team": 1}))]);
}

#[tokio::test]
async fn custom_fields_are_encoded_on_write_and_decoded_on_read() {
    let backend = backend().await;
    backend
        .create_object("team", object(json!({"label": "core"})), &CreateOptions::default())
        .await
        .unwrap();

    let stored = backend
        .find_objects("team", &object(json!({"label": "CORE"})), &FindOptions::default())
        .await
        .unwrap();
    assert_eq!(stored, vec![object(json!({"id": 1, "label": "core"}))]);

    let err = backend
        .create_object("team", object(json!({"label": 5})), &CreateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::FieldEncoding { ref collection, ref field, .. } if collection == "team" && field == "label"
    ));
}

#[tokio::test]
async fn find_honours_operators_order_and_limit() {
    let backend = backend().await;
    for identifier in ["a", "b", "c", "d"] {
        backend
            .create_object("user", object(json!({"identifier": identifier})), &CreateOptions::default())
            .await
            .unwrap();
    }
    let rows = backend
        .find_objects(
            "user",
            &object(json!({"id": {"$gt": 1}})),
            &FindOptions {
                order: vec![OrderBy::desc("identifier")],
                limit: Some(2),
                ..FindOptions::default()
            },
        )
        .await
        .unwrap();
    let names: Vec<&str> = rows.iter().map(|r| r["identifier"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["d", "c"]);

    let missing = backend
        .find_object("user", &object(json!({"identifier": "zz"})), &FindOptions::default())
        .await
        .unwrap();
    assert!(missing.is_none());

    let err = backend
        .find_objects("user", &object(json!({"id": {"$regex": "x"}})), &FindOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Query(_)));
}

#[tokio::test]
async fn named_databases_share_the_model_but_not_rows() {
    let backend = backend_with(BackendConfig {
        databases: vec!["default".to_string(), "archive".to_string()],
        ..BackendConfig::default()
    })
    .await;
    let archive = Some("archive".to_string());

    backend
        .create_object(
            "user",
            object(json!({"identifier": "old"})),
            &CreateOptions {
                database: archive.clone(),
            },
        )
        .await
        .unwrap();

    assert!(all(&backend, "user").await.is_empty());
    let archived = backend
        .find_objects(
            "user",
            &Object::new(),
            &FindOptions {
                database: archive.clone(),
                ..FindOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(archived.len(), 1);

    let err = backend
        .transaction(|tx| async move {
            tx.find_objects(
                "user",
                &Object::new(),
                &FindOptions {
                    database: archive,
                    ..FindOptions::default()
                },
            )
            .await
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::TransactionDatabaseMismatch { ref requested, ref active }
            if requested == "archive" && active == "default"
    ));

    let err = backend
        .count_objects(
            "user",
            &Object::new(),
            &CountOptions {
                database: Some("nope".to_string()),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::UnknownDatabase { ref name } if name == "nope"));
}

#[tokio::test]
async fn operations_dispatch_standalone_and_scoped() {
    let backend = backend().await;
    let created = backend
        .operation(Operation::CreateObject {
            collection: "user".to_string(),
            args: object(json!({"identifier": "joe"})),
            options: CreateOptions::default(),
        })
        .await
        .unwrap();
    assert_eq!(
        created,
        OperationOutput::Created(CreateResult {
            object: object(json!({"id": 1, "identifier": "joe"})),
        })
    );

    let (inside, database) = backend
        .transaction(|tx| async move {
            tx.operation(Operation::CreateObject {
                collection: "user".to_string(),
                args: object(json!({"identifier": "bob"})),
                options: CreateOptions::default(),
            })
            .await?;
            let found = tx
                .operation(Operation::CountObjects {
                    collection: "user".to_string(),
                    query: Object::new(),
                    options: CountOptions::default(),
                })
                .await?;
            let database = tx
                .call(|scope| async move { scope.context().database.clone() })
                .await;
            Ok::<_, StorageError>((found, database))
        })
        .await
        .unwrap();
    assert_eq!(inside, OperationOutput::Count(2));
    assert_eq!(database, "default");

    let deleted = backend
        .operation(Operation::DeleteObjects {
            collection: "user".to_string(),
            query: object(json!({"identifier": "bob"})),
            options: DeleteOptions::limit(1),
        })
        .await
        .unwrap();
    assert_eq!(deleted, OperationOutput::Affected(1));
}

#[tokio::test]
async fn backend_requires_configuration() {
    let backend = SqlStorageBackend::in_memory(BackendConfig::default());
    let err = backend
        .find_objects("user", &Object::new(), &FindOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotConfigured));
    assert!(backend.registry().is_none());
}

#[tokio::test]
async fn configure_rejects_missing_targets_and_keeps_previous_model() {
    let backend = backend().await;
    let current = backend.registry().unwrap();
    backend.configure(Arc::clone(&current)).unwrap();

    let mut builder = StorageRegistry::new();
    builder.register_collection(CollectionDefinition::new("email").relationship(ChildOf::new("ghost")));
    let err = backend.configure(Arc::new(builder.finish())).unwrap_err();
    assert!(matches!(err, StorageError::Schema(_)));
    assert!(err.to_string().contains("ghost"), "{err}");
    assert!(Arc::ptr_eq(&backend.registry().unwrap(), &current));
}

#[test]
fn default_database_must_have_an_engine() {
    let err = SqlStorageBackend::new(BackendConfig::default(), BTreeMap::new()).err().unwrap();
    assert!(matches!(err, StorageError::UnknownDatabase { ref name } if name == "default"));
}

#[tokio::test]
async fn called_functions_join_the_transaction() {
    let backend = backend().await;
    let err = backend
        .transaction(|tx| async move {
            tx.create_object("user", object(json!({"identifier": "joe"}))).await?;
            let seen = tx
                .call(|scope| async move {
                    scope.create_object("user", object(json!({"identifier": "bob"}))).await?;
                    scope
                        .count_objects("user", &Object::new(), &CountOptions::default())
                        .await
                })
                .await?;
            assert_eq!(seen, 2);
            Err::<(), RunnerError>(RunnerError::Aborted("after call"))
        })
        .await
        .unwrap_err();

    assert!(matches!(err, RunnerError::Aborted("after call")));
    assert!(all(&backend, "user").await.is_empty());
}

#[tokio::test]
async fn cancelled_runner_releases_its_transaction() {
    let backend = backend().await;
    let cancelled = tokio::time::timeout(
        Duration::from_millis(50),
        backend.transaction(|tx| async move {
            tx.create_object("user", object(json!({"identifier": "joe"}))).await?;
            std::future::pending::<()>().await;
            Ok::<_, StorageError>(())
        }),
    )
    .await;
    assert!(cancelled.is_err());

    let created = tokio::time::timeout(
        Duration::from_secs(1),
        backend.create_object("user", object(json!({"identifier": "bob"})), &CreateOptions::default()),
    )
    .await
    .expect("writer lock released")
    .unwrap();
    assert_eq!(Value::Object(created.object), json!({"id": 1, "identifier": "bob"}));
    assert_eq!(all(&backend, "user").await, vec![object(json!({"id": 1, "identifier": "bob"}))]);
}

/// Memory engine that counts the transactions it is asked to open.
#[derive(Default)]
struct CountingEngine {
    inner: MemoryEngine,
    begins: AtomicUsize,
}

impl CountingEngine {
    fn begins(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl RelationalEngine for CountingEngine {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn sync(&self, model: &RelationalModel) -> anyhow::Result<()> {
        self.inner.sync(model).await
    }

    async fn begin(&self) -> anyhow::Result<TransactionId> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        self.inner.begin().await
    }

    async fn commit(&self, txn: TransactionId) -> anyhow::Result<()> {
        self.inner.commit(txn).await
    }

    async fn rollback(&self, txn: TransactionId) -> anyhow::Result<()> {
        self.inner.rollback(txn).await
    }

    fn abandon(&self, txn: TransactionId) {
        self.inner.abandon(txn);
    }

    async fn create(
        &self,
        table: &TableSpec,
        values: Object,
        txn: Option<TransactionId>,
    ) -> anyhow::Result<Object> {
        self.inner.create(table, values, txn).await
    }

    async fn find_all(
        &self,
        table: &TableSpec,
        filter: &Filter,
        order: &[OrderBy],
        limit: Option<u64>,
        txn: Option<TransactionId>,
    ) -> anyhow::Result<Vec<Object>> {
        self.inner.find_all(table, filter, order, limit, txn).await
    }

    async fn update(
        &self,
        table: &TableSpec,
        values: Object,
        filter: &Filter,
        txn: Option<TransactionId>,
    ) -> anyhow::Result<u64> {
        self.inner.update(table, values, filter, txn).await
    }

    async fn destroy(
        &self,
        table: &TableSpec,
        filter: &Filter,
        txn: Option<TransactionId>,
    ) -> anyhow::Result<u64> {
        self.inner.destroy(table, filter, txn).await
    }

    async fn count(
        &self,
        table: &TableSpec,
        filter: &Filter,
        txn: Option<TransactionId>,
    ) -> anyhow::Result<u64> {
        self.inner.count(table, filter, txn).await
    }
}

#[tokio::test]
async fn each_top_level_call_opens_exactly_one_transaction() {
    let engine = Arc::new(CountingEngine::default());
    let engines = BTreeMap::from([(
        "default".to_string(),
        Arc::clone(&engine) as Arc<dyn RelationalEngine>,
    )]);
    let backend = SqlStorageBackend::new(BackendConfig::default(), engines).unwrap();
    backend.configure(registry()).unwrap();
    backend.migrate(None).await.unwrap();

    backend
        .create_object(
            "user",
            object(json!({
                "identifier": "joe",
                "email": [{"address": "joe@a.com", "emailVerification": {"code": "x1"}}],
            })),
            &CreateOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(engine.begins(), 1);

    let batch: OperationBatch = serde_json::from_value(json!([
        {"operation": "createObject", "collection": "user", "placeholder": "u",
         "args": {"identifier": "bob"}},
        {"operation": "createObject", "collection": "email", "placeholder": "e",
         "args": {"address": "bob@a.com"}, "replace": [{"path": ["user"], "placeholder": "u"}]},
    ]))
    .unwrap();
    backend.execute_batch(&batch).await.unwrap();
    assert_eq!(engine.begins(), 2);

    backend
        .transaction(|tx| async move {
            tx.create_object("user", object(json!({"identifier": "ann"}))).await?;
            tx.operation(Operation::CreateObject {
                collection: "user".to_string(),
                args: object(json!({"identifier": "eve", "email": [{"address": "eve@a.com"}]})),
                options: CreateOptions::default(),
            })
            .await?;
            Ok::<_, StorageError>(())
        })
        .await
        .unwrap();
    assert_eq!(engine.begins(), 3);
    assert_eq!(engine.inner.active_transactions(), 0);
    assert_eq!(all(&backend, "user").await.len(), 4);
}

#[tokio::test]
async fn from_config_without_url_uses_memory_engines() {
    let config = BackendConfig {
        databases: vec!["default".to_string(), "archive".to_string()],
        ..BackendConfig::default()
    };
    let backend = SqlStorageBackend::from_config(config).await.unwrap();
    assert_eq!(backend.databases().collect::<Vec<_>>(), vec!["archive", "default"]);

    backend.configure(registry()).unwrap();
    backend.migrate(None).await.unwrap();
    backend
        .create_object("user", object(json!({"identifier": "joe"})), &CreateOptions::default())
        .await
        .unwrap();
    assert_eq!(all(&backend, "user").await.len(), 1);
}

#[cfg(not(feature = "postgres"))]
#[tokio::test]
async fn from_config_with_url_requires_postgres_feature() {
    let config = BackendConfig {
        connection_url: Some("postgres://localhost/app".to_string()),
        ..BackendConfig::default()
    };
    let err = SqlStorageBackend::from_config(config).await.err().unwrap();
    assert!(matches!(err, StorageError::Engine(_)));
    assert!(err.to_string().contains("postgres feature"), "{err}");
}
