//! HTTP router configuration

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post, put},
};
use orthos_api::events::FleetEvent;
use orthos_api::responses::ErrorResponse;
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

use crate::api::{machines, system, tasks, ws};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(
        system::health,
        system::validate,
        system::architectures,
        system::statistics,
        machines::list_machines,
        machines::register_machine,
        machines::get_machine,
        machines::update_system,
        machines::machine_history,
        machines::enqueue_task,
        tasks::list_tasks,
        tasks::get_task,
        tasks::cancel_task,
    ),
    components(schemas(ErrorResponse, FleetEvent)),
    tags(
        (name = "machines", description = "Inventory and reservations"),
        (name = "tasks", description = "Queued actions against machines"),
        (name = "system", description = "Health, compatibility map and statistics"),
    )
)]
pub struct ApiDoc;

/// Create the application router
///
/// Every role serves the same API; the taskmanager leaves out `/docs`.
pub fn create_router(state: Arc<AppState>) -> Router {
    let router = Router::new()
        // System endpoints
        .route("/health", get(system::health))
        .route("/validate", post(system::validate))
        .route("/architectures", get(system::architectures))
        .route("/statistics", get(system::statistics))
        // Machine endpoints
        .route(
            "/machines",
            get(machines::list_machines).post(machines::register_machine),
        )
        .route("/machines/{id}", get(machines::get_machine))
        .route("/machines/{id}/system", put(machines::update_system))
        .route("/machines/{id}/history", get(machines::machine_history))
        .route("/machines/{id}/tasks", post(machines::enqueue_task))
        // Task endpoints
        .route("/tasks", get(tasks::list_tasks))
        .route("/tasks/{id}", get(tasks::get_task))
        .route("/tasks/{id}/cancel", post(tasks::cancel_task))
        // Events
        .route("/ws/events", get(ws::events));

    let router = if state.mode.serves_docs() {
        router.merge(Scalar::with_url("/docs", ApiDoc::openapi()))
    } else {
        router
    };

    router.with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use orthos_api::requests::{ActionRequest, RegisterMachineRequest};
    use orthos_client::{ClientError, HttpClient, WsClient};
    use orthos_core::{Engine, EngineArgs, EngineConfig, MachineStore};
    use orthos_remote::{
        AdapterRegistry, Channel, Outcome, ProbeOutcome, Prober, RemoteAction, RemoteControl,
        Target,
    };
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::Mode;
    use crate::fleet::{Fleet, LocalFleet, RemoteFleet};

    struct InstantPower;

    #[async_trait]
    impl RemoteControl for InstantPower {
        async fn execute(&self, _: &Target, _: &RemoteAction, _: &CancellationToken) -> Outcome {
            Outcome::success()
        }

        fn channel(&self) -> Channel {
            Channel::Power
        }
    }

    struct AlwaysUp;

    #[async_trait]
    impl Prober for AlwaysUp {
        async fn probe(&self, _: &Target) -> ProbeOutcome {
            ProbeOutcome::reachable()
        }

        fn method(&self) -> &'static str {
            "test"
        }
    }

    /// Serve `state` on an ephemeral port and return its base URL
    async fn serve(state: AppState) -> String {
        let app = create_router(Arc::new(state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn spawn_app(mode: Mode) -> (HttpClient, Engine) {
        let config = EngineConfig {
            dispatch_tick_ms: 10,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            dispatch_enabled: mode.runs_tasks(),
            reconcile_enabled: false,
            ..EngineConfig::default()
        };
        let engine = Engine::start(EngineArgs {
            store: Arc::new(MachineStore::new(config.event_channel_capacity)),
            config,
            adapters: AdapterRegistry::new().with(Arc::new(InstantPower)),
            prober: Arc::new(AlwaysUp),
            restored_tasks: Vec::new(),
        });

        let fleet = Arc::new(LocalFleet::new(engine.clone()));
        let url = serve(AppState::new(fleet, mode)).await;
        (HttpClient::new(url).unwrap(), engine)
    }

    fn register(id: &str, architecture: &str, system: &str) -> RegisterMachineRequest {
        RegisterMachineRequest {
            id: id.to_string(),
            fqdn: format!("{id}.example.com"),
            architecture: architecture.to_string(),
            system: system.to_string(),
            bmc: Some(format!("{id}-sp.example.com")),
            maintenance: false,
        }
    }

    fn api_status(error: &ClientError) -> Option<u16> {
        match error {
            ClientError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    #[test]
    fn test_openapi_lists_every_route() {
        let doc = ApiDoc::openapi();
        for path in [
            "/health",
            "/machines",
            "/machines/{id}/tasks",
            "/tasks/{id}/cancel",
            "/validate",
            "/architectures",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }

    #[tokio::test]
    async fn test_inventory_endpoints() {
        let (client, _engine) = spawn_app(Mode::All).await;

        let health = client.health().await.unwrap();
        assert_eq!(health.mode, "all");

        let created = client
            .register_machine(register("lab-001", "s390x", "LPAR zSeries"))
            .await
            .unwrap();
        assert_eq!(created.effective_status, "unknown");
        client
            .register_machine(register("lab-002", "x86_64", "BareMetal"))
            .await
            .unwrap();

        let err = client
            .register_machine(register("lab-003", "embedded", "KVM"))
            .await
            .unwrap_err();
        assert_eq!(api_status(&err), Some(422));
        let err = client
            .register_machine(register("lab-001", "s390x", "zVM"))
            .await
            .unwrap_err();
        assert_eq!(api_status(&err), Some(409));

        let page = client
            .list_machines()
            .architecture("s390x")
            .send()
            .await
            .unwrap();
        assert_eq!(page.pagination.total_items, 1);
        assert_eq!(page.data[0].id, "lab-001");

        let page = client.list_machines().per_page(1).page(2).send().await.unwrap();
        assert_eq!(page.pagination.total_pages, 2);
        assert_eq!(page.data[0].id, "lab-002");

        let updated = client.update_system("lab-002", "KVM").await.unwrap();
        assert_eq!(updated.system, "KVM");
        let err = client.update_system("lab-002", "zVM").await.unwrap_err();
        assert_eq!(api_status(&err), Some(422));

        let err = client.get_machine("nope").await.unwrap_err();
        assert!(err.is_not_found());

        let stats = client.statistics().await.unwrap();
        assert_eq!(stats.total.total, 2);
        assert_eq!(stats.total.architecture, "total");
    }

    #[tokio::test]
    async fn test_compatibility_endpoints() {
        let (client, _engine) = spawn_app(Mode::All).await;

        let verdict = client.validate("s390x", "zKVM").await.unwrap();
        assert!(verdict.compatible);
        assert_eq!(verdict.allowed, vec!["zVM", "zKVM", "LPAR zSeries"]);

        let verdict = client.validate("embedded", "KVM").await.unwrap();
        assert!(!verdict.compatible);

        let verdict = client.validate("sparc", "BareMetal").await.unwrap();
        assert!(!verdict.compatible);
        assert!(verdict.allowed.is_empty());

        let map = client.architectures().await.unwrap();
        assert_eq!(map.len(), 6);
        let aarch64 = map.iter().find(|e| e.architecture == "aarch64").unwrap();
        assert_eq!(aarch64.systems, vec!["BareMetal", "KVM"]);
    }

    #[tokio::test]
    async fn test_task_endpoints() {
        let (client, _engine) = spawn_app(Mode::All).await;
        client
            .register_machine(register("lab-002", "x86_64", "BareMetal"))
            .await
            .unwrap();

        let queued = client
            .enqueue_task("lab-002", ActionRequest::PowerCycle, "alice")
            .await
            .unwrap();
        let mut state = String::new();
        for _ in 0..200 {
            state = client.get_task(queued.task_id).await.unwrap().state;
            if state == "succeeded" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state, "succeeded");

        let cancel = client.cancel_task(queued.task_id).await.unwrap();
        assert_eq!(cancel.outcome, "already_finished");

        let err = client
            .enqueue_task(
                "lab-002",
                ActionRequest::Provision {
                    choice: "sles-16".to_string(),
                    system: Some("zVM".to_string()),
                },
                "alice",
            )
            .await
            .unwrap_err();
        assert_eq!(api_status(&err), Some(422));

        let err = client
            .enqueue_task("missing", ActionRequest::PowerOn, "alice")
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let err = client.get_task(uuid::Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_not_found());

        let tasks = client
            .list_tasks(Some("lab-002"), Some("succeeded"))
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].action, "power_cycle");
        let err = client.list_tasks(None, Some("exploded")).await.unwrap_err();
        assert_eq!(api_status(&err), Some(422));
    }

    /// A web front end forwarding to a taskmanager on another port
    async fn spawn_split() -> (HttpClient, HttpClient, Engine) {
        let (taskmanager, engine) = spawn_app(Mode::Taskmanager).await;
        let fleet = RemoteFleet::connect(taskmanager.base_url().as_str(), 64).unwrap();
        let url = serve(AppState::new(Arc::new(fleet), Mode::Web)).await;
        (HttpClient::new(url).unwrap(), taskmanager, engine)
    }

    #[tokio::test]
    async fn test_web_role_forwards_to_taskmanager() {
        let (web, taskmanager, engine) = spawn_split().await;
        assert_eq!(web.health().await.unwrap().mode, "web");
        assert_eq!(taskmanager.health().await.unwrap().mode, "taskmanager");

        web.register_machine(register("lab-002", "x86_64", "BareMetal"))
            .await
            .unwrap();
        assert!(engine.get_machine_status("lab-002").await.is_ok());

        let queued = web
            .enqueue_task("lab-002", ActionRequest::PowerCycle, "alice")
            .await
            .unwrap();
        let mut state = String::new();
        for _ in 0..200 {
            state = web.get_task(queued.task_id).await.unwrap().state;
            if state == "succeeded" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state, "succeeded");
        assert_eq!(
            taskmanager.get_task(queued.task_id).await.unwrap().state,
            "succeeded"
        );

        let tasks = web.list_tasks(Some("lab-002"), None).await.unwrap();
        assert_eq!(tasks.len(), 1);
        let page = web.list_machines().architecture("x86_64").send().await.unwrap();
        assert_eq!(page.pagination.total_items, 1);
        assert_eq!(web.statistics().await.unwrap().total.total, 1);

        // taskmanager rejections keep their status and code
        let err = web
            .enqueue_task("missing", ActionRequest::PowerOn, "alice")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        let err = web
            .register_machine(register("lab-002", "x86_64", "BareMetal"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        let err = web.update_system("lab-002", "zVM").await.unwrap_err();
        assert_eq!(err.code(), Some("VALIDATION_FAILED"));
    }

    #[tokio::test]
    async fn test_web_role_relays_taskmanager_events() {
        let (taskmanager, _engine) = spawn_app(Mode::Taskmanager).await;
        let fleet = RemoteFleet::connect(taskmanager.base_url().as_str(), 64).unwrap();
        let mut events = fleet.subscribe();
        // let the relay finish its handshake
        tokio::time::sleep(Duration::from_millis(200)).await;

        taskmanager
            .register_machine(register("lab-002", "x86_64", "BareMetal"))
            .await
            .unwrap();
        let queued = taskmanager
            .enqueue_task("lab-002", ActionRequest::PowerOn, "alice")
            .await
            .unwrap();

        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let FleetEvent::TaskQueued { task_id, .. } = event
                && task_id == queued.task_id
            {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_web_role_without_taskmanager_is_bad_gateway() {
        // nothing listens on the discard port
        let fleet = RemoteFleet::connect("http://127.0.0.1:9", 16).unwrap();
        let web = HttpClient::new(serve(AppState::new(Arc::new(fleet), Mode::Web)).await).unwrap();

        let err = web.list_machines().send().await.unwrap_err();
        assert_eq!(api_status(&err), Some(502));
        assert_eq!(err.code(), Some("TASKMANAGER_UNAVAILABLE"));
        // answered locally
        assert!(web.validate("s390x", "zVM").await.unwrap().compatible);
    }

    #[tokio::test]
    async fn test_docs_only_outside_taskmanager() {
        let (taskmanager, _engine) = spawn_app(Mode::Taskmanager).await;
        assert!(taskmanager.list_machines().send().await.is_ok());

        let docs = |client: &HttpClient| client.base_url().join("/docs").unwrap();
        let status = reqwest::get(docs(&taskmanager)).await.unwrap().status();
        assert_eq!(status.as_u16(), 404);
        let (all, _engine) = spawn_app(Mode::All).await;
        assert!(reqwest::get(docs(&all)).await.unwrap().status().is_success());
    }

    #[tokio::test]
    async fn test_event_stream() {
        let (client, _engine) = spawn_app(Mode::All).await;
        client
            .register_machine(register("lab-002", "x86_64", "BareMetal"))
            .await
            .unwrap();

        let mut events = WsClient::connect(client.ws_url("/ws/events").unwrap().as_str()).unwrap();
        // let the background task finish its handshake
        tokio::time::sleep(Duration::from_millis(200)).await;

        let queued = client
            .enqueue_task(
                "lab-002",
                ActionRequest::Reserve {
                    reason: "bisect".to_string(),
                    until: None,
                },
                "alice",
            )
            .await
            .unwrap();

        let mut saw_queued = false;
        let mut saw_reservation = false;
        while !(saw_queued && saw_reservation) {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            match event {
                FleetEvent::TaskQueued { task_id, .. } => saw_queued |= task_id == queued.task_id,
                FleetEvent::ReservationChanged { owner, .. } => {
                    saw_reservation |= owner.as_deref() == Some("alice");
                }
                _ => {}
            }
        }
    }
}
