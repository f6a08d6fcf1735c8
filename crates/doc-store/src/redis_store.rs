use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, Script};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    ChangeKind, CollectionPath, CollectionSnapshot, DocHandle, DocumentSnapshot, DocumentStore,
    EntryChange, Fields, Precondition, StoreError, StoreResult, Subscription, auto_id,
};

const KEY_PREFIX: &str = "huddle";
/// Hash field present on every stored document so an empty document still
/// exists as a key.
const MARKER_FIELD: &str = "__doc";
const PAYLOAD_FIELD: &str = "payload";
const STREAM_BLOCK_MS: usize = 5_000;
const STREAM_BATCH: usize = 64;
const STREAM_RETRY_DELAY: Duration = Duration::from_millis(500);

// ARGV: ttl, channel, field, value, ...
const CREATE_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then return 'exists' end
redis.call('HSET', KEYS[1], ARGV[3], '1', unpack(ARGV, 4))
redis.call('EXPIRE', KEYS[1], ARGV[1])
redis.call('PUBLISH', ARGV[2], 'create')
return 'ok'
";

// ARGV: ttl, channel, field, value, ...
const SET_SCRIPT: &str = r"
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1], ARGV[3], '1', unpack(ARGV, 4))
redis.call('EXPIRE', KEYS[1], ARGV[1])
redis.call('PUBLISH', ARGV[2], 'set')
return 'ok'
";

// ARGV: ttl, channel, mode, field, value, ...
const UPDATE_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return 'missing' end
if ARGV[3] == 'absent' then
  for i = 4, #ARGV, 2 do
    local current = redis.call('HGET', KEYS[1], ARGV[i])
    if current and current ~= 'null' then return 'conflict:' .. ARGV[i] end
  end
end
if #ARGV >= 5 then
  redis.call('HSET', KEYS[1], unpack(ARGV, 4))
end
redis.call('EXPIRE', KEYS[1], ARGV[1])
redis.call('PUBLISH', ARGV[2], 'update')
return 'ok'
";

struct Scripts {
    create: Script,
    set: Script,
    update: Script,
}

/// Redis-backed document store shared by participants on different hosts.
///
/// Documents are hashes with one JSON value per field, collections are
/// streams (stream ids double as entry ids, so append order is preserved),
/// and document writes are announced on a per-document pub/sub channel.
/// Conditional writes run as Lua scripts so the check and the write are
/// atomic.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    redis: ConnectionManager,
    scripts: Arc<Scripts>,
    ttl_seconds: u64,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, ttl_seconds: u64) -> StoreResult<Self> {
        let client = Client::open(redis_url).map_err(backend)?;
        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(backend)?;
        tracing::debug!(target = "doc_store", url = %redis_url, ttl_seconds, "connected to redis");
        Ok(Self {
            client,
            redis,
            scripts: Arc::new(Scripts {
                create: Script::new(CREATE_SCRIPT),
                set: Script::new(SET_SCRIPT),
                update: Script::new(UPDATE_SCRIPT),
            }),
            ttl_seconds,
        })
    }

    async fn snapshot(&self, doc: &DocHandle) -> StoreResult<DocumentSnapshot> {
        let fields = self.get_document(doc).await?;
        Ok(DocumentSnapshot {
            doc: doc.clone(),
            fields,
        })
    }

    async fn write(
        &self,
        script: &Script,
        doc: &DocHandle,
        mode: Option<&str>,
        fields: Fields,
    ) -> StoreResult<String> {
        let mut conn = self.redis.clone();
        let mut invocation = script.key(doc_key(doc));
        invocation.arg(self.ttl_seconds).arg(channel(doc));
        match mode {
            Some(mode) => {
                invocation.arg(mode);
            }
            None => {
                invocation.arg(MARKER_FIELD);
            }
        }
        for (field, value) in fields {
            invocation.arg(field).arg(serde_json::to_string(&value)?);
        }
        invocation.invoke_async(&mut conn).await.map_err(backend)
    }
}

#[async_trait]
impl DocumentStore for RedisStore {
    fn new_document(&self, collection: &CollectionPath) -> DocHandle {
        collection.doc(auto_id())
    }

    async fn create_document(&self, doc: &DocHandle, fields: Fields) -> StoreResult<()> {
        match self.write(&self.scripts.create, doc, None, fields).await?.as_str() {
            "ok" => Ok(()),
            _ => Err(StoreError::AlreadyExists(doc.path())),
        }
    }

    async fn set_document(&self, doc: &DocHandle, fields: Fields) -> StoreResult<()> {
        self.write(&self.scripts.set, doc, None, fields).await?;
        Ok(())
    }

    async fn update_document(
        &self,
        doc: &DocHandle,
        patch: Fields,
        precondition: Precondition,
    ) -> StoreResult<()> {
        let mode = match precondition {
            Precondition::Exists => "exists",
            Precondition::FieldsAbsent => "absent",
        };
        let outcome = self.write(&self.scripts.update, doc, Some(mode), patch).await?;
        match outcome.as_str() {
            "ok" => Ok(()),
            "missing" => Err(StoreError::NotFound(doc.path())),
            other => match other.strip_prefix("conflict:") {
                Some(field) => Err(StoreError::Conflict {
                    path: doc.path(),
                    field: field.to_string(),
                }),
                None => Err(StoreError::Backend(format!(
                    "unexpected update outcome {other}"
                ))),
            },
        }
    }

    async fn get_document(&self, doc: &DocHandle) -> StoreResult<Option<Fields>> {
        let mut conn = self.redis.clone();
        let raw: HashMap<String, String> = conn.hgetall(doc_key(doc)).await.map_err(backend)?;
        if raw.is_empty() {
            return Ok(None);
        }
        let mut fields = Fields::new();
        for (field, json) in raw {
            if field == MARKER_FIELD {
                continue;
            }
            fields.insert(field, serde_json::from_str(&json)?);
        }
        Ok(Some(fields))
    }

    async fn add_entry(&self, collection: &CollectionPath, value: Value) -> StoreResult<String> {
        let mut conn = self.redis.clone();
        let key = stream_key(collection);
        let payload = serde_json::to_string(&value)?;
        let (id,): (String,) = redis::pipe()
            .cmd("XADD")
            .arg(&key)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(&payload)
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl_seconds)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        tracing::trace!(target = "doc_store", collection = %collection, %id, "appended entry");
        Ok(id)
    }

    async fn list_entries(&self, collection: &CollectionPath) -> StoreResult<Vec<(String, Value)>> {
        let mut conn = self.redis.clone();
        let reply: StreamRangeReply = conn
            .xrange_all(stream_key(collection))
            .await
            .map_err(backend)?;
        reply.ids.iter().map(decode_entry).collect()
    }

    async fn watch_document(&self, doc: &DocHandle) -> StoreResult<Subscription<DocumentSnapshot>> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(backend)?;
        pubsub.subscribe(channel(doc)).await.map_err(backend)?;

        // Subscribed before the first read, so no write can fall between the
        // two.
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(self.snapshot(doc).await);

        let store = self.clone();
        let doc = doc.clone();
        let task = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while messages.next().await.is_some() {
                if tx.send(store.snapshot(&doc).await).is_err() {
                    return;
                }
            }
            tracing::debug!(target = "doc_store", doc = %doc, "document notification stream ended");
            let _ = tx.send(Err(StoreError::Closed));
        });
        Ok(Subscription::with_task(rx, task))
    }

    async fn watch_collection(
        &self,
        collection: &CollectionPath,
    ) -> StoreResult<Subscription<CollectionSnapshot>> {
        // Blocking reads get their own connection so they never stall the
        // shared one.
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(backend)?;
        let key = stream_key(collection);
        let collection = collection.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let mut last_id = "0".to_string();
            let mut first = true;
            loop {
                let options = StreamReadOptions::default()
                    .block(STREAM_BLOCK_MS)
                    .count(STREAM_BATCH);
                let reply: Result<Option<StreamReadReply>, redis::RedisError> = conn
                    .xread_options(&[&key], &[&last_id], &options)
                    .await;
                let changes = match reply {
                    Ok(reply) => {
                        let mut changes = Vec::new();
                        for stream in reply.map(|r| r.keys).unwrap_or_default() {
                            for entry in &stream.ids {
                                last_id = entry.id.clone();
                                match decode_entry(entry) {
                                    Ok((id, value)) => changes.push(EntryChange {
                                        kind: ChangeKind::Added,
                                        id,
                                        value,
                                    }),
                                    Err(err) => {
                                        if tx.send(Err(err)).is_err() {
                                            return;
                                        }
                                    }
                                }
                            }
                        }
                        changes
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "doc_store",
                            collection = %collection,
                            error = %err,
                            "stream read failed; retrying"
                        );
                        if tx.send(Err(backend(err))).is_err() {
                            return;
                        }
                        tokio::time::sleep(STREAM_RETRY_DELAY).await;
                        continue;
                    }
                };
                if changes.is_empty() && !first {
                    continue;
                }
                first = false;
                let snapshot = CollectionSnapshot {
                    collection: collection.clone(),
                    changes,
                };
                if tx.send(Ok(snapshot)).is_err() {
                    return;
                }
            }
        });
        Ok(Subscription::with_task(rx, task))
    }
}

fn decode_entry(entry: &StreamId) -> StoreResult<(String, Value)> {
    let payload: String = entry
        .get(PAYLOAD_FIELD)
        .ok_or_else(|| StoreError::Backend(format!("entry {} has no payload", entry.id)))?;
    Ok((entry.id.clone(), serde_json::from_str(&payload)?))
}

fn doc_key(doc: &DocHandle) -> String {
    format!("{KEY_PREFIX}:doc:{}", doc.path())
}

fn stream_key(collection: &CollectionPath) -> String {
    format!("{KEY_PREFIX}:entries:{collection}")
}

fn channel(doc: &DocHandle) -> String {
    format!("{KEY_PREFIX}:notify:{}", doc.path())
}

fn backend(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap_or_default()
    }

    /// Needs a reachable Redis; tests below are `#[ignore]`d for that reason.
    async fn store() -> RedisStore {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into());
        RedisStore::connect(&url, 60).await.expect("redis store")
    }

    /// A fresh collection per test, so runs never see each other's keys.
    fn scratch() -> CollectionPath {
        CollectionPath::new(format!("doc-store-test-{}", auto_id()))
    }

    #[test]
    fn keys_are_namespaced_by_path() {
        let doc = CollectionPath::new("sessions").doc("ABC123");
        assert_eq!(doc_key(&doc), "huddle:doc:sessions/ABC123");
        assert_eq!(channel(&doc), "huddle:notify:sessions/ABC123");
        assert_eq!(
            stream_key(&doc.subcollection("offererCandidates")),
            "huddle:entries:sessions/ABC123/offererCandidates"
        );
    }

    #[test_timeout::timeout(20)]
    #[ignore]
    async fn create_is_exclusive_and_update_needs_a_document() {
        let store = store().await;
        let doc = store.new_document(&scratch());

        let missing = store
            .update_document(&doc, fields(json!({"offer": 1})), Precondition::Exists)
            .await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));

        let empty = fields(json!({"offer": null, "answer": null}));
        store.create_document(&doc, empty.clone()).await.expect("create");
        let again = store.create_document(&doc, Fields::new()).await;
        assert!(matches!(again, Err(StoreError::AlreadyExists(_))));
        assert_eq!(store.get_document(&doc).await.expect("get"), Some(empty));
    }

    #[test_timeout::timeout(20)]
    #[ignore]
    async fn fields_absent_writes_each_field_once() {
        let store = store().await;
        let doc = store.new_document(&scratch());
        store
            .create_document(&doc, fields(json!({"offer": null, "answer": null})))
            .await
            .expect("create");

        let offer = json!({"type": "offer", "sdp": "v=0"});
        store
            .update_document(
                &doc,
                fields(json!({"offer": offer.clone()})),
                Precondition::FieldsAbsent,
            )
            .await
            .expect("null counts as unset");
        let second = store
            .update_document(
                &doc,
                fields(json!({"offer": {"type": "offer", "sdp": "v=0 again"}})),
                Precondition::FieldsAbsent,
            )
            .await;
        assert!(matches!(second, Err(StoreError::Conflict { field, .. }) if field == "offer"));

        let answer = json!({"type": "answer", "sdp": "v=0"});
        store
            .update_document(
                &doc,
                fields(json!({"answer": answer.clone()})),
                Precondition::FieldsAbsent,
            )
            .await
            .expect("answer");
        let stored = store.get_document(&doc).await.expect("get").expect("exists");
        assert_eq!(stored["offer"], offer);
        assert_eq!(stored["answer"], answer);
    }

    #[test_timeout::timeout(20)]
    #[ignore]
    async fn collection_watch_replays_then_streams() {
        let store = store().await;
        let entries = store.new_document(&scratch()).subcollection("offererCandidates");
        let first = store
            .add_entry(&entries, json!({"candidate": "c1"}))
            .await
            .expect("c1");
        let second = store
            .add_entry(&entries, json!({"candidate": "c2"}))
            .await
            .expect("c2");

        let mut watch = store.watch_collection(&entries).await.expect("watch");
        let replay = watch.next().await.expect("snapshot").expect("replay");
        let ids: Vec<_> = replay.changes.iter().map(|change| change.id.clone()).collect();
        assert_eq!(ids, vec![first, second]);
        assert!(replay.changes.iter().all(|change| change.kind == ChangeKind::Added));

        let third = store
            .add_entry(&entries, json!({"candidate": "c3"}))
            .await
            .expect("c3");
        let live = watch.next().await.expect("snapshot").expect("live");
        assert_eq!(live.changes.len(), 1);
        assert_eq!(live.changes[0].id, third);
        assert_eq!(live.changes[0].value, json!({"candidate": "c3"}));

        let listed: Vec<_> = store
            .list_entries(&entries)
            .await
            .expect("list")
            .into_iter()
            .map(|(_, value)| value["candidate"].clone())
            .collect();
        assert_eq!(listed, vec![json!("c1"), json!("c2"), json!("c3")]);
    }

    #[test_timeout::timeout(20)]
    #[ignore]
    async fn document_watch_sees_current_state_then_writes() {
        let store = store().await;
        let doc = store.new_document(&scratch());
        store
            .create_document(&doc, fields(json!({"offer": null})))
            .await
            .expect("create");

        let mut watch = store.watch_document(&doc).await.expect("watch");
        let initial = watch.next().await.expect("snapshot").expect("initial");
        assert_eq!(initial.fields, Some(fields(json!({"offer": null}))));

        store
            .update_document(&doc, fields(json!({"offer": "set"})), Precondition::FieldsAbsent)
            .await
            .expect("update");
        let updated = watch.next().await.expect("snapshot").expect("update");
        assert_eq!(updated.fields, Some(fields(json!({"offer": "set"}))));
    }
}
