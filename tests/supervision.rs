//! The coordinator supervising real child processes.

use edge_runtime::coordinator::{
    CoordinatorConfig, ProcessService, ProcessSpec, Service, ServiceConfig, ServiceCoordinator,
};
use edge_runtime::ServiceStatus;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn coordinator() -> Arc<ServiceCoordinator> {
    Arc::new(ServiceCoordinator::new(CoordinatorConfig {
        health_check_interval: Duration::from_millis(20),
        failure_threshold: 1,
        ..Default::default()
    }))
}

fn eager_config() -> ServiceConfig {
    ServiceConfig {
        restart_delay_seconds: 0.0,
        health_check_interval_seconds: 0.0,
        max_restart_attempts: 5,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_exited_process_is_restarted() {
    let coordinator = coordinator();
    let alerts = Arc::new(Mutex::new(Vec::new()));
    let sink = alerts.clone();
    coordinator
        .set_alert_callback(move |_title, _body, context| {
            let kind = context["alert_type"].as_str().unwrap_or_default().to_string();
            sink.lock().unwrap().push(kind);
        })
        .await;

    let short_lived = ProcessService::new(ProcessSpec {
        startup_grace: Duration::from_millis(20),
        ..ProcessSpec::new("short-lived", "sleep").arg("0.2")
    });
    let service: Arc<dyn Service> = Arc::new(short_lived);
    coordinator
        .register_service(service, Some(eager_config()))
        .await
        .unwrap();

    assert!(coordinator.start().await);

    let mut restarted = false;
    for _ in 0..150 {
        let state = coordinator.get_service_state("short-lived").await.unwrap();
        if state.restart_count >= 1 {
            restarted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(restarted);

    let alerts = alerts.lock().unwrap().clone();
    assert!(alerts.iter().any(|a| a == "health_check_failed"));
    assert!(alerts.iter().any(|a| a == "auto_restart"));

    coordinator.stop(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn test_long_running_process_stays_healthy_and_stops() {
    let coordinator = coordinator();
    let service: Arc<dyn Service> = Arc::new(ProcessService::new(ProcessSpec {
        startup_grace: Duration::from_millis(20),
        ..ProcessSpec::new("sleeper", "sleep").arg("30")
    }));
    coordinator
        .register_service(service.clone(), Some(eager_config()))
        .await
        .unwrap();

    assert!(coordinator.start().await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let state = coordinator.get_service_state("sleeper").await.unwrap();
    assert_eq!(state.status, ServiceStatus::Healthy);
    assert_eq!(state.restart_count, 0);

    assert!(coordinator.stop(Duration::from_secs(2)).await);
    assert!(!service.is_running().await);
    assert_eq!(
        coordinator.get_service_state("sleeper").await.unwrap().status,
        ServiceStatus::Stopped
    );
}
