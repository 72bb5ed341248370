mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tokio::sync::mpsc;

use common::{book_data, book_schema};
use tbone::dispatch::ChannelRegistry;
use tbone::persist::WriteEvent;
use tbone::{
    Carrier, ChannelConfig, ChannelState, Collection, MemoryStore, Model, ModelSignals,
    MpscCarrier,
};

fn config() -> ChannelConfig {
    ChannelConfig::default()
        .with_capacity(64)
        .with_poll_interval(Duration::from_millis(5))
        .with_await_timeout(Duration::from_millis(25))
}

async fn next(rx: &mut mpsc::Receiver<JsonValue>) -> JsonValue {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("carrier closed")
}

/// Records every payload it is handed.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<JsonValue>>,
}

#[async_trait]
impl Carrier for Recorder {
    async fn deliver(&self, payload: &JsonValue) -> bool {
        self.seen.lock().unwrap().push(payload.clone());
        true
    }
}

struct Panicking;

#[async_trait]
impl Carrier for Panicking {
    async fn deliver(&self, _payload: &JsonValue) -> bool {
        panic!("socket torn down mid-write");
    }
}

#[tokio::test]
async fn saved_models_are_broadcast_to_subscribers() {
    let store = MemoryStore::new().into_handle();
    let registry = ChannelRegistry::new();
    let channel = registry.get_or_create("books", &store, config()).unwrap();
    let (carrier, mut rx) = MpscCarrier::channel(16);
    channel.subscribe("book.saved", Arc::new(carrier));
    channel.kickoff().await.unwrap();

    let schema = book_schema();
    let signals = Arc::new(ModelSignals::new());
    let books = Collection::builder(&schema)
        .signals(Arc::clone(&signals))
        .build()
        .unwrap();
    let publisher = Arc::clone(&channel);
    signals
        .post_save
        .connect("broadcast", &schema, move |event: Arc<WriteEvent>| {
            let channel = Arc::clone(&publisher);
            async move {
                let data = event.instance.serialize().await?;
                channel
                    .publish("book.saved", JsonValue::Object(data))
                    .await?;
                Ok(())
            }
        });

    for (isbn, title) in [("1", "E1"), ("2", "E2")] {
        let mut book = Model::from_data(&schema, &book_data(isbn, title)).unwrap();
        books.save(&store, &mut book).await.unwrap();
    }

    let first = next(&mut rx).await;
    assert_eq!(first["type"], json!("event"));
    assert_eq!(first["payload"]["name"], json!("book.saved"));
    assert_eq!(first["payload"]["data"]["title"], json!("E1"));
    assert_eq!(next(&mut rx).await["payload"]["data"]["title"], json!("E2"));

    registry.remove("books");
    channel.join().await;
    assert_eq!(channel.state(), ChannelState::Stopped);
    assert!(registry.get("books").is_none());
}

#[tokio::test]
async fn panicking_carrier_does_not_stop_delivery() {
    let store = MemoryStore::new().into_handle();
    let registry = ChannelRegistry::new();
    let channel = registry.get_or_create("chat", &store, config()).unwrap();
    let recorder = Arc::new(Recorder::default());
    let (carrier, mut rx) = MpscCarrier::channel(16);
    channel.subscribe("message", Arc::new(Panicking));
    channel.subscribe("message", Arc::clone(&recorder) as Arc<dyn Carrier>);
    channel.subscribe("message", Arc::new(carrier));
    channel.kickoff().await.unwrap();

    for text in ["hello", "again"] {
        channel.publish("message", json!({"text": text})).await.unwrap();
    }
    assert_eq!(next(&mut rx).await["payload"]["data"]["text"], json!("hello"));
    assert_eq!(next(&mut rx).await["payload"]["data"]["text"], json!("again"));
    assert!(channel.is_active());

    channel.stop();
    channel.join().await;
    let texts: Vec<JsonValue> = recorder
        .seen
        .lock()
        .unwrap()
        .iter()
        .map(|payload| payload["payload"]["data"]["text"].clone())
        .collect();
    assert_eq!(texts, vec![json!("hello"), json!("again")]);
    let stats = channel.stats();
    assert_eq!(stats.events_consumed, 2);
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.delivered, 4);
}

#[tokio::test]
async fn channels_share_a_store_without_crosstalk() {
    let store = MemoryStore::new().into_handle();
    let registry = ChannelRegistry::new();
    let alpha = registry.get_or_create("alpha", &store, config()).unwrap();
    let beta = registry.get_or_create("beta", &store, config()).unwrap();
    assert_eq!(registry.names(), ["alpha", "beta"]);

    let (carrier, mut rx) = MpscCarrier::channel(16);
    beta.subscribe("ping", Arc::new(carrier));
    beta.kickoff().await.unwrap();

    alpha.publish("ping", json!("from alpha")).await.unwrap();
    beta.publish("ping", json!("from beta")).await.unwrap();
    assert_eq!(next(&mut rx).await["payload"]["data"], json!("from beta"));
    assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv())
        .await
        .is_err());

    beta.stop();
    beta.join().await;
}
