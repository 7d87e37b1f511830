//! Registration and deregistration against the simulated backend

use edgeward_protocol::{EventStatus, TlsStatus, SIMULATION_MARKER};
use std::sync::Arc;

use edgeward_e2e::{fast_settings, fast_simulation, init_test, FailingStore, TestEnv, PROXY_HOST_IP};
use edgeward_server::{FailureKind, SimulatedProxyClient};

#[tokio::test]
async fn test_register_emits_five_ordered_events() {
    init_test();

    let env = TestEnv::with_admins(&[1]).await;
    let orchestrator = env.simulated();

    let (events, outcome) = orchestrator
        .register_domain(1, "test.example.com", "test@example.com")
        .expect("Operation should start")
        .collect()
        .await
        .unwrap();

    let steps: Vec<u8> = events.iter().map(|e| e.step).collect();
    assert_eq!(steps, vec![1, 2, 3, 4, 5]);
    assert!(events[..4].iter().all(|e| e.status == EventStatus::InProgress));
    assert_eq!(events[4].status, EventStatus::Success);
    assert!(outcome.success);
    assert_eq!(outcome.status, Some(TlsStatus::Https));

    let record = env.record(1).await;
    assert_eq!(record.domain_name, "test.example.com");
    assert_eq!(record.email, "test@example.com");
    assert_eq!(record.tls_status, TlsStatus::Https);
    assert_eq!(record.proxy_host_ip.as_deref(), Some(PROXY_HOST_IP));
}

#[tokio::test]
async fn test_every_simulated_event_is_marked() {
    init_test();

    let env = TestEnv::with_admins(&[1]).await;
    let (events, _) = env
        .simulated()
        .register_domain(1, "marked.example.com", "ops@example.com")
        .unwrap()
        .collect()
        .await
        .unwrap();

    for event in &events {
        assert!(event.simulated, "event {} not flagged", event.step);
        assert!(
            event.message.starts_with(SIMULATION_MARKER),
            "event {} lacks marker: {}",
            event.step,
            event.message
        );
    }
}

#[tokio::test]
async fn test_deregister_restores_http() {
    init_test();

    let env = TestEnv::with_admins(&[1]).await;
    let orchestrator = env.simulated();

    let outcome = orchestrator
        .register_domain(1, "test.example.com", "test@example.com")
        .unwrap()
        .outcome()
        .await
        .unwrap();
    assert!(outcome.success);

    let (events, outcome) = orchestrator
        .deregister_domain(1)
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(events.len(), 5);
    assert_eq!(events[4].status, EventStatus::Success);
    assert_eq!(outcome.status, Some(TlsStatus::Http));

    let record = env.record(1).await;
    assert_eq!(record.tls_status, TlsStatus::Http);
    assert_eq!(record.domain_name, "");
    assert_eq!(record.operator_ip, edgeward_e2e::operator_ip(1));
}

#[tokio::test]
async fn test_invalid_domain_fails_at_first_step() {
    init_test();

    let env = TestEnv::with_admins(&[1]).await;
    let before = env.record(1).await;

    let (events, outcome) = env
        .simulated()
        .register_domain(1, "not a domain", "x@y.com")
        .unwrap()
        .collect()
        .await
        .unwrap();

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].step, 1);
    assert_eq!(events[0].status, EventStatus::Failure);
    assert_eq!(outcome.failure, Some(FailureKind::Validation));
    assert_eq!(env.record(1).await, before);
}

#[tokio::test]
async fn test_invalid_email_fails_at_first_step() {
    init_test();

    let env = TestEnv::with_admins(&[1]).await;
    let (events, outcome) = env
        .simulated()
        .register_domain(1, "ok.example.com", "not-an-email")
        .unwrap()
        .collect()
        .await
        .unwrap();

    assert_eq!(events.len(), 1);
    assert_eq!(outcome.failure, Some(FailureKind::Validation));
}

#[tokio::test]
async fn test_second_registration_conflicts() {
    init_test();

    let env = TestEnv::with_admins(&[1, 2]).await;
    let orchestrator = env.simulated();

    orchestrator
        .register_domain(1, "first.example.com", "ops@example.com")
        .unwrap()
        .outcome()
        .await
        .unwrap();

    // Same administrator, already exposing a domain
    let outcome = orchestrator
        .register_domain(1, "second.example.com", "ops@example.com")
        .unwrap()
        .outcome()
        .await
        .unwrap();
    assert_eq!(outcome.failure, Some(FailureKind::Conflict));
    assert_eq!(outcome.status, Some(TlsStatus::Https));

    // Another administrator claiming the same domain
    let (events, outcome) = orchestrator
        .register_domain(2, "first.example.com", "other@example.com")
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(outcome.failure, Some(FailureKind::Conflict));
    assert_eq!(env.record(2).await.tls_status, TlsStatus::Http);
    assert_eq!(env.record(1).await.domain_name, "first.example.com");
}

#[tokio::test]
async fn test_deregister_without_domain_is_rejected() {
    init_test();

    let env = TestEnv::with_admins(&[1]).await;
    let (events, outcome) = env
        .simulated()
        .deregister_domain(1)
        .unwrap()
        .collect()
        .await
        .unwrap();

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, EventStatus::Failure);
    assert_eq!(outcome.failure, Some(FailureKind::Validation));
}

#[tokio::test]
async fn test_unknown_administrator() {
    init_test();

    let env = TestEnv::with_admins(&[1]).await;
    let outcome = env
        .simulated()
        .register_domain(99, "test.example.com", "test@example.com")
        .unwrap()
        .outcome()
        .await
        .unwrap();

    assert_eq!(outcome.failure, Some(FailureKind::NotFound));
}

#[tokio::test]
async fn test_unreadable_record_reports_no_status() {
    init_test();

    let env = TestEnv::with_admins(&[1]).await;
    let store = FailingStore::wrap(env.store.clone());
    store.set_fail_reads(true);
    let orchestrator = env.orchestrator_with(
        Arc::new(SimulatedProxyClient::new(fast_simulation())),
        store,
        fast_settings(),
    );

    let (events, outcome) = orchestrator
        .register_domain(1, "test.example.com", "test@example.com")
        .unwrap()
        .collect()
        .await
        .unwrap();

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].step, 1);
    assert_eq!(outcome.failure, Some(FailureKind::Store));
    assert_eq!(outcome.status, None);

    let outcome = orchestrator.deregister_domain(1).unwrap().outcome().await.unwrap();
    assert_eq!(outcome.failure, Some(FailureKind::Store));
    assert_eq!(outcome.status, None);
}

#[tokio::test]
async fn test_disconnected_subscriber_does_not_cancel() {
    init_test();

    let env = TestEnv::with_admins(&[1]).await;
    let mut stream = env
        .simulated()
        .register_domain(1, "detached.example.com", "ops@example.com")
        .unwrap();

    // Read one event, then walk away
    let first = stream.next_event().await.unwrap();
    assert_eq!(first.step, 1);
    let handle = stream.detach();

    let outcome = handle.await.unwrap();
    assert!(outcome.success);
    assert_eq!(env.record(1).await.tls_status, TlsStatus::Https);
}

#[tokio::test]
async fn test_status_reports_live_domain() {
    init_test();

    let env = TestEnv::with_admins(&[1]).await;
    let orchestrator = env.simulated();
    assert!(!orchestrator.status(1).await.unwrap().diverged());

    orchestrator
        .register_domain(1, "live.example.com", "ops@example.com")
        .unwrap()
        .outcome()
        .await
        .unwrap();

    let status = orchestrator.status(1).await.unwrap();
    assert_eq!(status.live_domains, vec!["live.example.com"]);
    assert!(status.is_live());
    assert!(status.simulated);
    assert!(!status.diverged());
}
