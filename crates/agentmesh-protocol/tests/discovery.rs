#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Capability discovery across responders sharing one broker.

use agentmesh_broker::{InMemoryBroker, MessageBroker};
use agentmesh_protocol::{
    discovery_request_subject, AgentMessage, AgentProtocol, Announcement, DiscoveryResponder,
    Identity, MessageType, ProtocolConfig, AGENT_ROOT,
};
use agentmesh_security::SubjectAuthorizer;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn caps(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn protocol(broker: Arc<InMemoryBroker>) -> Arc<AgentProtocol> {
    let authorizer = Arc::new(SubjectAuthorizer::with_default_roots(vec![AGENT_ROOT.into()]));
    Arc::new(AgentProtocol::with_config(
        broker,
        authorizer,
        ProtocolConfig {
            discovery_timeout: Duration::from_millis(300),
            max_discovery_results: 16,
        },
    ))
}

fn agent_ids(found: &[AgentMessage]) -> Vec<String> {
    let mut ids: Vec<String> = found.iter().map(|m| m.source.id.clone()).collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn test_superset_filter_and_fixed_window() {
    let broker = InMemoryBroker::new();
    let proto = protocol(broker.clone());
    let full = DiscoveryResponder::spawn(proto.clone(), "T1", "full", caps(&["a", "b", "c"]))
        .await
        .unwrap();
    let partial = DiscoveryResponder::spawn(proto.clone(), "T1", "partial", caps(&["a"]))
        .await
        .unwrap();

    let window = Duration::from_millis(300);
    let started = Instant::now();
    let found = proto.discover("T1", &caps(&["a", "b"]), Some(window)).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(agent_ids(&found), vec!["full".to_string()]);
    assert!(elapsed >= window, "returned early after {elapsed:?}");
    assert!(elapsed < window + Duration::from_millis(250), "returned late after {elapsed:?}");

    let body: Announcement = serde_json::from_value(found[0].payload.content.clone()).unwrap();
    assert_eq!(body.capabilities, caps(&["a", "b", "c"]));

    full.stop().await;
    partial.stop().await;
    assert_eq!(broker.subscription_count().await, 0);
}

#[tokio::test]
async fn test_all_matching_responders_are_collected() {
    let broker = InMemoryBroker::new();
    let proto = protocol(broker.clone());
    let mut responders = Vec::new();
    for id in ["r1", "r2", "r3"] {
        responders.push(
            DiscoveryResponder::spawn(proto.clone(), "T1", id, caps(&["ocr"]))
                .await
                .unwrap(),
        );
    }

    let found = proto.discover("T1", &caps(&["ocr"]), None).await.unwrap();
    assert_eq!(agent_ids(&found), caps(&["r1", "r2", "r3"]));
    for r in responders {
        r.stop().await;
    }
}

#[tokio::test]
async fn test_misbehaving_responder_is_filtered_locally() {
    let broker = InMemoryBroker::new();
    let proto = protocol(broker.clone());

    // Replies to every query regardless of what it asks for.
    let mut requests = broker.subscribe(&discovery_request_subject("T1")).await.unwrap();
    let rogue_proto = proto.clone();
    tokio::spawn(async move {
        while let Some(delivery) = requests.receiver.recv().await {
            let query = AgentMessage::from_bytes(&delivery.payload).unwrap();
            let content = serde_json::json!({
                "agent_id": "rogue",
                "capabilities": ["a"],
                "status": "online"
            });
            rogue_proto
                .respond(&query, Identity::agent("rogue", "T1", caps(&["a"])), content, true)
                .await
                .unwrap();
        }
    });

    let found = proto
        .discover("T1", &caps(&["a", "b"]), Some(Duration::from_millis(200)))
        .await
        .unwrap();
    assert!(found.is_empty());
}

#[tokio::test]
async fn test_tenants_do_not_answer_each_other() {
    let broker = InMemoryBroker::new();
    let proto = protocol(broker.clone());
    let other = DiscoveryResponder::spawn(proto.clone(), "T2", "elsewhere", caps(&["a"]))
        .await
        .unwrap();

    let found = proto
        .discover("T1", &caps(&["a"]), Some(Duration::from_millis(150)))
        .await
        .unwrap();
    assert!(found.is_empty());
    other.stop().await;
}

#[tokio::test]
async fn test_result_cap_bounds_collection() {
    let broker = InMemoryBroker::new();
    let authorizer = Arc::new(SubjectAuthorizer::with_default_roots(vec![AGENT_ROOT.into()]));
    let proto = Arc::new(AgentProtocol::with_config(
        broker.clone(),
        authorizer,
        ProtocolConfig {
            discovery_timeout: Duration::from_millis(200),
            max_discovery_results: 2,
        },
    ));
    let mut responders = Vec::new();
    for id in ["r1", "r2", "r3", "r4"] {
        responders.push(
            DiscoveryResponder::spawn(proto.clone(), "T1", id, caps(&["x"]))
                .await
                .unwrap(),
        );
    }

    let found = proto.discover("T1", &caps(&["x"]), None).await.unwrap();
    assert_eq!(found.len(), 2);
    assert!(found.iter().all(|m| m.message_type == MessageType::Result));
    for r in responders {
        r.stop().await;
    }
}

#[tokio::test]
async fn test_stray_and_repeated_replies_do_not_fill_the_cap() {
    let broker = InMemoryBroker::new();
    let authorizer = Arc::new(SubjectAuthorizer::with_default_roots(vec![AGENT_ROOT.into()]));
    let proto = Arc::new(AgentProtocol::with_config(
        broker.clone(),
        authorizer,
        ProtocolConfig {
            discovery_timeout: Duration::from_millis(300),
            max_discovery_results: 2,
        },
    ));

    // Answers first: three replies lacking "b", then the same matching
    // responder three times over.
    let mut requests = broker.subscribe(&discovery_request_subject("T1")).await.unwrap();
    let noisy = proto.clone();
    tokio::spawn(async move {
        while let Some(delivery) = requests.receiver.recv().await {
            let query = AgentMessage::from_bytes(&delivery.payload).unwrap();
            for i in 0..3 {
                let id = format!("partial-{i}");
                let content = serde_json::json!({"agent_id": id, "capabilities": ["a"], "status": "online"});
                noisy
                    .respond(&query, Identity::agent(&id, "T1", caps(&["a"])), content, true)
                    .await
                    .unwrap();
            }
            for _ in 0..3 {
                let content = serde_json::json!({"agent_id": "echo", "capabilities": ["a", "b"], "status": "online"});
                noisy
                    .respond(&query, Identity::agent("echo", "T1", caps(&["a", "b"])), content, true)
                    .await
                    .unwrap();
            }
        }
    });

    // Answers late, after the cap would already be full if every reply counted.
    let mut late_requests = broker.subscribe(&discovery_request_subject("T1")).await.unwrap();
    let late = proto.clone();
    tokio::spawn(async move {
        while let Some(delivery) = late_requests.receiver.recv().await {
            let query = AgentMessage::from_bytes(&delivery.payload).unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            let content = serde_json::json!({"agent_id": "real", "capabilities": ["a", "b"], "status": "online"});
            late.respond(&query, Identity::agent("real", "T1", caps(&["a", "b"])), content, true)
                .await
                .unwrap();
        }
    });

    let found = proto.discover("T1", &caps(&["a", "b"]), None).await.unwrap();
    assert_eq!(agent_ids(&found), caps(&["echo", "real"]));
}
