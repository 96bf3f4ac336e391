use courier_broker::{Broker, InProcessBroker, OffsetReset, TopicConfig, TopicProvisioner};
use courier_common::ids::{CorrelationId, InstanceId, SubscriptionId};
use courier_common::{DeviceRef, EventKey, EventKind, Filter, Subscriber};
use courier_eventbus::{
    DistributedFilterRegistry, DomainEvent, EventBus, EventBusConfig, FilterRegistry,
    SessionQueue, attach_delivery,
};
use courier_rpc::{ResponseDispatcher, RpcClient, RpcClientConfig};
use courier_wire::Response;
use std::sync::Arc;
use std::time::Duration;

const SETTLE: Duration = Duration::from_secs(5);

struct Cluster {
    broker: Arc<dyn Broker>,
    provisioner: Arc<TopicProvisioner>,
}

impl Cluster {
    fn new() -> Self {
        let broker: Arc<dyn Broker> = Arc::new(InProcessBroker::default());
        let provisioner = Arc::new(TopicProvisioner::new(
            Arc::clone(&broker),
            TopicConfig::new(4, 1),
        ));
        Self {
            broker,
            provisioner,
        }
    }

    async fn node(&self) -> Arc<DistributedFilterRegistry> {
        let config = EventBusConfig {
            instance_id: InstanceId::new(),
            poll_timeout: Duration::from_millis(20),
            ..EventBusConfig::default()
        };
        DistributedFilterRegistry::start(
            Arc::new(FilterRegistry::new()),
            Arc::clone(&self.broker),
            Arc::clone(&self.provisioner),
            &config,
        )
        .await
        .expect("registry start")
    }

    fn bus(&self, registry: Arc<DistributedFilterRegistry>) -> EventBus {
        EventBus::new(registry, ResponseDispatcher::new(Arc::clone(&self.broker)))
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + SETTLE;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn subscriber(reply_to: &str) -> Subscriber {
    Subscriber::new(SubscriptionId::new(), reply_to, CorrelationId::new())
}

#[tokio::test]
async fn registrations_converge_across_processes() {
    let cluster = Cluster::new();
    let a = cluster.node().await;
    let b = cluster.node().await;

    let sub = subscriber("response_topic_a");
    a.register(
        Filter::new(EventKind::Notification).with_devices(["D1"]).with_names(["temp"]),
        sub.clone(),
    )
    .await;

    let event = EventKey::new(EventKind::Notification).device("D1").name("temp");
    eventually(|| b.match_event(&event).len() == 1).await;
    assert_eq!(b.match_event(&event)[0].subscriber, sub);

    // Cascade issued on B reaches A.
    let removed = b.unregister_device(DeviceRef::new("D1")).await;
    assert_eq!(removed, vec![sub.clone()]);
    eventually(|| a.match_event(&event).is_empty()).await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn network_cascade_converges() {
    let cluster = Cluster::new();
    let a = cluster.node().await;
    let b = cluster.node().await;

    let by_network = subscriber("r");
    let by_device = subscriber("r");
    b.register(Filter::new(EventKind::Command).with_networks([3]), by_network.clone())
        .await;
    b.register(Filter::new(EventKind::Command).with_devices(["D5"]), by_device.clone())
        .await;
    eventually(|| a.local().len() == 2).await;

    a.unregister_network(3, vec![DeviceRef::new("D5")]).await;
    assert!(a.local().is_empty());
    eventually(|| b.local().is_empty()).await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn local_echo_is_not_reapplied() {
    let cluster = Cluster::new();
    let a = cluster.node().await;
    let sub = subscriber("r");
    a.register(Filter::all_devices(EventKind::Command), sub.clone()).await;
    assert!(a.unregister(sub.id).await);
    // Our own REGISTER arriving after the UNREGISTER must not resurrect it.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!a.local().contains(&sub.id));
    a.shutdown().await;
}

#[tokio::test]
async fn published_events_stream_to_matching_reply_topics() {
    let cluster = Cluster::new();
    let a = cluster.node().await;
    let b = cluster.node().await;
    cluster
        .provisioner
        .ensure("response_topic_a")
        .await
        .expect("reply topic");
    let mut reply = cluster
        .broker
        .subscribe("response_topic_a", "response_topic_a", OffsetReset::Latest)
        .await
        .expect("subscribe");

    let sub = subscriber("response_topic_a");
    let bus_a = cluster.bus(Arc::clone(&a));
    let bus_b = cluster.bus(Arc::clone(&b));
    bus_a
        .subscribe(
            vec![Filter::new(EventKind::Notification).with_device_types([9])],
            sub.clone(),
        )
        .await;
    eventually(|| b.local().contains(&sub.id)).await;

    let miss = DomainEvent::new(EventKind::Notification, "D1").with_device_type(8);
    assert_eq!(bus_b.publish(&miss).await.expect("publish"), 0);

    let hit = DomainEvent::new(EventKind::Notification, "D1")
        .with_device_type(9)
        .with_payload(serde_json::json!({ "value": 1 }));
    assert_eq!(bus_b.publish(&hit).await.expect("publish"), 1);

    let records = reply.poll(SETTLE).await.expect("poll");
    assert_eq!(records.len(), 1);
    let response = Response::decode(&records[0].payload).expect("decode");
    assert_eq!(response.correlation_id(), &sub.correlation_id);
    assert!(!response.is_last());
    assert_eq!(response.body().decode_as::<DomainEvent>().expect("event"), hit);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn client_session_receives_events_until_unsubscribed() {
    let cluster = Cluster::new();
    let a = cluster.node().await;
    let b = cluster.node().await;
    let client = RpcClient::start(
        Arc::clone(&cluster.broker),
        Arc::clone(&cluster.provisioner),
        RpcClientConfig {
            reply_topic: Some("response_topic_session".into()),
            ping_attempts: 0,
            poll_timeout: Duration::from_millis(20),
            ..RpcClientConfig::default()
        },
    )
    .await
    .expect("client");

    let sub = subscriber(client.reply_topic());
    let (queue, mut events) = SessionQueue::new(16);
    attach_delivery(client.matcher(), sub.id, sub.correlation_id.clone(), Arc::new(queue))
        .expect("attach");

    let bus_a = cluster.bus(Arc::clone(&a));
    let bus_b = cluster.bus(Arc::clone(&b));
    bus_a
        .subscribe(vec![Filter::all_devices(EventKind::CommandUpdate)], sub.clone())
        .await;
    eventually(|| b.local().contains(&sub.id)).await;

    for device in ["D1", "D2", "D3"] {
        let event = DomainEvent::new(EventKind::CommandUpdate, device);
        assert_eq!(bus_b.publish(&event).await.expect("publish"), 1);
    }
    for expected in ["D1", "D2", "D3"] {
        let event = tokio::time::timeout(SETTLE, events.recv())
            .await
            .expect("event in time")
            .expect("event");
        assert_eq!(event.device_id, expected);
    }

    assert!(bus_b.unsubscribe(sub.id).await);
    eventually(|| !client.matcher().contains(&sub.correlation_id)).await;
    eventually(|| !a.local().contains(&sub.id)).await;

    client.shutdown().await;
    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn device_cascade_closes_client_streams() {
    let cluster = Cluster::new();
    let a = cluster.node().await;
    let b = cluster.node().await;
    let client = RpcClient::start(
        Arc::clone(&cluster.broker),
        Arc::clone(&cluster.provisioner),
        RpcClientConfig {
            reply_topic: Some("response_topic_cascade".into()),
            ping_attempts: 0,
            poll_timeout: Duration::from_millis(20),
            ..RpcClientConfig::default()
        },
    )
    .await
    .expect("client");

    let by_device = subscriber(client.reply_topic());
    let by_network = subscriber(client.reply_topic());
    let unrelated = subscriber(client.reply_topic());
    for sub in [&by_device, &by_network, &unrelated] {
        let (queue, _events) = SessionQueue::new(4);
        attach_delivery(client.matcher(), sub.id, sub.correlation_id.clone(), Arc::new(queue))
            .expect("attach");
    }
    assert_eq!(client.matcher().pending(), 3);

    let bus_a = cluster.bus(Arc::clone(&a));
    let bus_b = cluster.bus(Arc::clone(&b));
    bus_a
        .subscribe(
            vec![Filter::new(EventKind::Notification).with_devices(["D1"])],
            by_device.clone(),
        )
        .await;
    bus_a
        .subscribe(
            vec![Filter::new(EventKind::Command).with_networks([4])],
            by_network.clone(),
        )
        .await;
    bus_a
        .subscribe(
            vec![Filter::new(EventKind::Command).with_devices(["D2"])],
            unrelated.clone(),
        )
        .await;
    eventually(|| b.local().len() == 3).await;

    let removed = bus_b.unregister_device(DeviceRef::new("D1")).await;
    assert_eq!(removed, vec![by_device.id]);
    let removed = bus_b
        .unregister_network(4, vec![DeviceRef::new("D9")])
        .await;
    assert_eq!(removed, vec![by_network.id]);

    eventually(|| client.matcher().pending() == 1).await;
    assert!(client.matcher().contains(&unrelated.correlation_id));
    eventually(|| a.local().len() == 1 && a.local().contains(&unrelated.id)).await;

    assert_eq!(bus_b.unregister_device_type(77, Vec::new()).await, Vec::new());
    assert!(bus_b.unsubscribe(unrelated.id).await);
    eventually(|| client.matcher().pending() == 0).await;

    client.shutdown().await;
    a.shutdown().await;
    b.shutdown().await;
}
