use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use deskd::Config;
use deskd::Device;
use deskd::commands::CommandDispatcher;
use deskd::commands::CommandRequest;
use deskd::commands::DispatchError;
use deskd::commands::Origin;
use deskd::commands::Platform;
use deskd::commands::Whitelist;
use deskd::engine::MetricProvider;
use deskd::engine::ModuleKind;
use deskd::engine::ModuleScheduler;
use deskd::engine::ProviderError;
use deskd::engine::Sample;
use deskd::engine::StatusAggregator;
use deskd::mqtt::Backoff;
use deskd::mqtt::BrokerSession;
use deskd::mqtt::Topics;
use deskd::mqtt::Transport;
use deskd::mqtt::TransportError;
use deskd::mqtt::TransportEvent;
use deskd::mqtt::discovery;
use serde_json::Map;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type Log = Arc<Mutex<Vec<(String, Vec<u8>, bool)>>>;

struct ChannelTransport {
    events: mpsc::UnboundedReceiver<TransportEvent>,
    published: Log,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn next_event(&mut self) -> Result<TransportEvent, TransportError> {
        match self.events.recv().await {
            Some(event) => Ok(event),
            None => std::future::pending().await,
        }
    }

    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), TransportError> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload, retain));
        Ok(())
    }

    fn subscribe(&self, _topic: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct CountingProvider {
    kind: ModuleKind,
    count: u64,
}

#[async_trait]
impl MetricProvider for CountingProvider {
    fn kind(&self) -> ModuleKind {
        self.kind
    }

    async fn sample(&mut self) -> Result<Sample, ProviderError> {
        self.count += 1;
        Ok(Sample::new()
            .with_state(format!("tick {}", self.count))
            .field("count", self.count))
    }
}

const CONFIG: &str = r#"
    [device]
    name = "Office PC"
    id = "office"

    [mqtt]
    broker = "broker.local"

    [modules.system]
    interval = 5

    [modules.media]
    enabled = true
    interval = 10
"#;

fn count(aggregator: &StatusAggregator, kind: ModuleKind) -> Option<u64> {
    aggregator
        .snapshot()
        .get(kind)
        .and_then(|report| report.fields.get("count"))
        .and_then(Value::as_u64)
}

#[tokio::test(start_paused = true)]
async fn test_connect_publishes_discovery_then_status_and_modules_keep_their_pace() {
    let config = Config::parse(CONFIG).unwrap();
    let device = Arc::new(Device::from_config(&config, vec![]));
    let topics = Topics::new(
        &config.mqtt.base_topic,
        &device.id,
        &config.mqtt.discovery_prefix,
    );
    let aggregator = Arc::new(StatusAggregator::new());

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let published = Log::default();
    let transport = ChannelTransport {
        events: events_rx,
        published: published.clone(),
    };
    let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
    let (session, _handle) =
        BrokerSession::new(transport, topics, device.clone(), aggregator.clone(), backoff);
    let session_cancel = CancellationToken::new();
    let session_task = tokio::spawn(session.run(session_cancel.clone()));
    events_tx.send(TransportEvent::Connected).unwrap();

    let mut scheduler = ModuleScheduler::new(aggregator.clone(), CancellationToken::new());
    for kind in [ModuleKind::System, ModuleKind::Media] {
        let provider = Box::new(CountingProvider { kind, count: 0 });
        scheduler.start(provider, config.modules.interval(kind));
    }

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(count(&aggregator, ModuleKind::System), Some(1));
    assert_eq!(count(&aggregator, ModuleKind::Media), Some(1));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(count(&aggregator, ModuleKind::System), Some(2));
    assert_eq!(count(&aggregator, ModuleKind::Media), Some(1));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(count(&aggregator, ModuleKind::System), Some(3));
    assert_eq!(count(&aggregator, ModuleKind::Media), Some(2));

    {
        let published = published.lock().unwrap();
        let topics: Vec<&str> = published.iter().map(|(t, _, _)| t.as_str()).collect();
        assert_eq!(topics[0], "desktop/office/availability");

        let last_discovery = topics
            .iter()
            .rposition(|t| t.starts_with("homeassistant/"))
            .unwrap();
        let first_status = topics
            .iter()
            .position(|t| *t == "desktop/office/status")
            .unwrap();
        assert!(last_discovery < first_status);
        assert!(!topics.iter().any(|t| t.contains("current_game")));

        let (_, payload, retain) = published
            .iter()
            .rev()
            .find(|(t, _, _)| t == "desktop/office/media/state")
            .unwrap();
        assert_eq!(payload.as_slice(), b"tick 2");
        assert!(*retain);
    }

    scheduler.shutdown().await;
    assert!(aggregator.snapshot().is_empty());

    session_cancel.cancel();
    session_task.await.unwrap();
    let published = published.lock().unwrap();
    let (topic, payload, retain) = published.last().unwrap();
    assert_eq!(topic, "desktop/office/availability");
    assert_eq!(payload.as_slice(), b"offline");
    assert!(*retain);
}

#[test]
fn test_discovery_follows_configuration() {
    let config = Config::parse(CONFIG).unwrap();
    let device = Device::from_config(&config, vec!["lock".to_string()]);
    let topics = Topics::new("desktop", &device.id, "homeassistant");

    let first = discovery::descriptors(&device, &topics);
    let second = discovery::descriptors(&device, &topics);
    assert_eq!(
        first.iter().map(|d| &d.payload).collect::<Vec<_>>(),
        second.iter().map(|d| &d.payload).collect::<Vec<_>>()
    );

    assert!(first
        .iter()
        .any(|d| d.topic == "homeassistant/button/office/run_lock/config"));
    assert!(!first.iter().any(|d| d.topic.contains("/gaming/")));
    assert!(!first.iter().any(|d| d.topic.contains("/update/")));

    for descriptor in &first {
        let payload: Value = serde_json::from_slice(&descriptor.payload).unwrap();
        assert_eq!(payload["availability_topic"], "desktop/office/availability");
        assert_eq!(payload["device"]["name"], "Office PC");
    }
}

#[tokio::test]
async fn test_whitelist_file_and_platform_check() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("commands.json");
    std::fs::write(
        &path,
        r#"{"reboot": {"cmd": "systemctl reboot", "wait": false, "platforms": ["linux"]}}"#,
    )
    .unwrap();

    let whitelist = Whitelist::load(&path).unwrap();
    let dispatcher =
        CommandDispatcher::new(whitelist, Duration::from_secs(30), CancellationToken::new())
            .with_platform(Some(Platform::Windows));
    assert!(dispatcher.available_commands().is_empty());

    let request = CommandRequest {
        command: "reboot".to_string(),
        args: Map::new(),
        origin: Origin::Rest { peer: None },
    };
    let result = dispatcher.dispatch(&request).await;
    assert!(matches!(
        result,
        Err(DispatchError::PlatformNotSupported { .. })
    ));
}

#[test]
fn test_config_file_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("deskd.toml");
    std::fs::write(&path, "[mqtt]\nbroker = \"localhost\"\n").unwrap();

    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.mqtt.port, 1883);
    assert_eq!(config.mqtt.base_topic, "desktop");
    assert!(config.modules.is_enabled(ModuleKind::System));
    assert!(!config.modules.is_enabled(ModuleKind::Media));
    assert_eq!(
        config.modules.interval(ModuleKind::System),
        Duration::from_secs(30)
    );
    assert!(!config.api.enabled);
    assert!(!config.updates.enabled);
}

#[test]
fn test_missing_whitelist_means_no_commands() {
    let dir = tempfile::tempdir().unwrap();
    let config_for = |name: &str| {
        let path = dir.path().join(name);
        Config::parse(&format!(
            "[mqtt]\nbroker = \"localhost\"\n\n[commands]\nwhitelist = '{}'\n",
            path.display()
        ))
        .unwrap()
    };

    let whitelist = deskd::agent::load_whitelist(&config_for("absent.toml")).unwrap();
    assert!(whitelist.is_empty());

    std::fs::write(dir.path().join("broken.toml"), "[lock\ncmd = ").unwrap();
    assert!(deskd::agent::load_whitelist(&config_for("broken.toml")).is_err());
}
