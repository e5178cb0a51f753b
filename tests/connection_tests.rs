//! Connection manager behavior: routing, queueing, ACKs, heartbeats.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use taskplane::connection::{
    ChannelSession, ConnectionConfig, ConnectionManager, ServiceFinder, TaskRequest,
};
use taskplane::idempotency::{ExecutionState, IdempotencyStore};
use taskplane::{ServiceInfo, ServiceSchema, ServiceType, Session, Status};

struct StubFinder {
    services: HashMap<String, Arc<ServiceInfo>>,
}

impl StubFinder {
    fn single(service: Arc<ServiceInfo>) -> Self {
        let mut services = HashMap::new();
        services.insert(service.id.clone(), service);
        Self { services }
    }
}

#[async_trait]
impl ServiceFinder for StubFinder {
    async fn find_service(&self, service_id: &str) -> Option<Arc<ServiceInfo>> {
        self.services.get(service_id).cloned()
    }
}

fn stub_service(id: &str) -> Arc<ServiceInfo> {
    Arc::new(ServiceInfo {
        kind: ServiceType::Service,
        id: id.to_string(),
        name: id.to_string(),
        description: String::new(),
        schema: ServiceSchema::default(),
        project_id: "p1".to_string(),
        version: 1,
        idempotency: Arc::new(IdempotencyStore::new()),
    })
}

fn task_request(service_id: &str, task_id: &str, key: &str) -> TaskRequest {
    TaskRequest {
        kind: TaskRequest::KIND.to_string(),
        id: task_id.to_string(),
        execution_id: "exec-1".to_string(),
        idempotency_key: key.to_string(),
        service_id: service_id.to_string(),
        orchestration_id: "o1".to_string(),
        project_id: "p1".to_string(),
        input: json!({"x": "42"}),
        status: Status::Processing,
    }
}

#[tokio::test]
async fn task_result_reaches_idempotency_store_and_is_acked() {
    let manager = ConnectionManager::new(ConnectionConfig::default());
    let service = stub_service("svc-a");
    let finder = StubFinder::single(service.clone());

    let key = "fingerprint-1".to_string();
    service.idempotency.initialize(&key, "exec-1").await;

    let (session, mut rx) = ChannelSession::pair();
    manager.attach("svc-a", session).await;

    let frame = json!({
        "id": "task1",
        "payload": {
            "type": "task_result",
            "idempotencyKey": key,
            "serviceId": "svc-a",
            "taskId": "task1",
            "executionId": "exec-1",
            "result": {"y": "42-a"},
        }
    });
    manager
        .handle_frame("svc-a", &frame.to_string(), &finder)
        .await
        .unwrap();

    let execution = service.idempotency.get(&key).await.unwrap();
    assert_eq!(execution.state, ExecutionState::Completed);
    assert_eq!(execution.result, Some(json!({"y": "42-a"})));

    let ack_frame = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("ack in time")
        .expect("session open");
    let ack: Value = serde_json::from_str(&ack_frame).unwrap();
    assert_eq!(ack, json!({"type": "ACK", "id": "task1"}));
}

#[tokio::test]
async fn empty_error_string_counts_as_success() {
    let manager = ConnectionManager::new(ConnectionConfig::default());
    let service = stub_service("svc-a");
    let finder = StubFinder::single(service.clone());
    let key = "fingerprint-2".to_string();
    service.idempotency.initialize(&key, "exec-1").await;

    let (session, _rx) = ChannelSession::pair();
    manager.attach("svc-a", session).await;

    let frame = json!({
        "id": "task1",
        "payload": {
            "type": "task_result",
            "idempotencyKey": key,
            "serviceId": "svc-a",
            "taskId": "task1",
            "executionId": "exec-1",
            "result": {"y": "ok"},
            "error": "",
        }
    });
    manager
        .handle_frame("svc-a", &frame.to_string(), &finder)
        .await
        .unwrap();

    let execution = service.idempotency.get(&key).await.unwrap();
    assert_eq!(execution.state, ExecutionState::Completed);
}

#[tokio::test]
async fn tasks_for_absent_workers_queue_and_replay_on_attach() {
    let manager = ConnectionManager::new(ConnectionConfig::default());

    manager
        .send_task("svc-a", &task_request("svc-a", "task1", "k1"))
        .await
        .unwrap();

    let (session, mut rx) = ChannelSession::pair();
    manager.attach("svc-a", session).await;

    let frame = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("replay in time")
        .expect("session open");
    let replayed: Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(replayed["type"], "task_request");
    assert_eq!(replayed["id"], "task1");
    assert_eq!(replayed["idempotencyKey"], "k1");
    assert_eq!(replayed["input"], json!({"x": "42"}));
}

#[tokio::test]
async fn queue_overflow_drops_the_oldest_message() {
    let cfg = ConnectionConfig {
        queue_capacity: 3,
        ..Default::default()
    };
    let manager = ConnectionManager::new(cfg);

    for i in 0..4 {
        manager
            .send_task("svc-a", &task_request("svc-a", &format!("task{i}"), "k"))
            .await
            .unwrap();
    }

    let (session, mut rx) = ChannelSession::pair();
    manager.attach("svc-a", session).await;

    let mut replayed_ids = Vec::new();
    for _ in 0..3 {
        let frame = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("replay in time")
            .expect("session open");
        let value: Value = serde_json::from_str(&frame).unwrap();
        replayed_ids.push(value["id"].as_str().unwrap().to_string());
    }
    assert_eq!(replayed_ids, vec!["task1", "task2", "task3"]);
    assert!(
        timeout(Duration::from_millis(200), rx.recv()).await.is_err(),
        "only three messages survive the overflow"
    );
}

#[tokio::test]
async fn oversized_frames_are_rejected() {
    let manager = ConnectionManager::new(ConnectionConfig::default());
    let finder = StubFinder {
        services: HashMap::new(),
    };
    let oversized = "x".repeat(10 * 1024 + 1);
    assert!(manager
        .handle_frame("svc-a", &oversized, &finder)
        .await
        .is_err());
}

#[tokio::test]
async fn silent_worker_is_closed_after_pong_deadline() {
    let cfg = ConnectionConfig {
        ping_interval: Duration::from_millis(50),
        pong_wait: Duration::from_millis(150),
        ..Default::default()
    };
    let manager = ConnectionManager::new(cfg);
    let finder = Arc::new(StubFinder {
        services: HashMap::new(),
    });

    let (health_tx, mut health_rx) = mpsc::unbounded_channel();
    manager.register_health_callback(health_tx).await;

    let (session, mut rx) = ChannelSession::pair();
    manager.attach("svc-a", session.clone()).await;

    // Answer the first two pings, then go silent.
    let ping_manager = manager.clone();
    let ping_finder = finder.clone();
    tokio::spawn(async move {
        let mut answered = 0;
        while let Some(frame) = rx.recv().await {
            if frame == "ping" && answered < 2 {
                answered += 1;
                let _ = ping_manager
                    .handle_frame("svc-a", "pong", ping_finder.as_ref())
                    .await;
            }
        }
    });

    let saw_unhealthy = timeout(Duration::from_secs(3), async {
        while let Some(event) = health_rx.recv().await {
            if event.service_id == "svc-a" && !event.healthy {
                return true;
            }
        }
        false
    })
    .await
    .expect("health transition in time");

    assert!(saw_unhealthy);
    assert!(session.is_closed());
    assert!(!manager.is_healthy("svc-a").await);
}
