//! Where inventory and task requests are answered
//!
//! `all` and `taskmanager` own the store and the queue and answer from their
//! engine. `web` owns neither: it forwards every inventory and task request
//! to the taskmanager over HTTP and relays the taskmanager's event stream to
//! its own subscribers.

use async_trait::async_trait;
use orthos_api::events::FleetEvent;
use orthos_api::requests::{EnqueueTaskRequest, RegisterMachineRequest};
use orthos_api::responses::{
    CancelTaskResponse, EnqueueTaskResponse, MachineResponse, PaginatedResponse,
    ReservationRecordResponse, StatisticsResponse, TaskResponse,
};
use orthos_client::{ClientError, HttpClient, WsClient};
use orthos_core::{Architecture, Engine, Machine, SystemClass};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::api::error::AppError;
use crate::api::machines::{ListMachinesQuery, machine_response, record_response, task_action};
use crate::api::system::statistics_response;
use crate::api::tasks::{ListTasksQuery, task_response};

/// Operations behind the inventory and task endpoints
#[async_trait]
pub trait Fleet: Send + Sync {
    async fn list_machines(
        &self,
        query: &ListMachinesQuery,
    ) -> Result<PaginatedResponse<MachineResponse>, AppError>;

    async fn register_machine(
        &self,
        request: RegisterMachineRequest,
    ) -> Result<MachineResponse, AppError>;

    async fn get_machine(&self, id: &str) -> Result<MachineResponse, AppError>;

    async fn update_system(&self, id: &str, system: &str) -> Result<MachineResponse, AppError>;

    async fn machine_history(
        &self,
        id: &str,
    ) -> Result<Vec<ReservationRecordResponse>, AppError>;

    async fn enqueue_task(
        &self,
        machine_id: &str,
        request: EnqueueTaskRequest,
    ) -> Result<EnqueueTaskResponse, AppError>;

    async fn list_tasks(&self, query: &ListTasksQuery) -> Result<Vec<TaskResponse>, AppError>;

    async fn get_task(&self, id: Uuid) -> Result<TaskResponse, AppError>;

    async fn cancel_task(&self, id: Uuid) -> Result<CancelTaskResponse, AppError>;

    async fn statistics(&self) -> Result<StatisticsResponse, AppError>;

    fn subscribe(&self) -> broadcast::Receiver<FleetEvent>;
}

/// Answers from an engine running in this process
pub struct LocalFleet {
    engine: Engine,
}

impl LocalFleet {
    #[must_use]
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Fleet for LocalFleet {
    async fn list_machines(
        &self,
        query: &ListMachinesQuery,
    ) -> Result<PaginatedResponse<MachineResponse>, AppError> {
        let machines = self.engine.list_machines(&query.filter()?).await;
        Ok(query.page_of(&machines))
    }

    async fn register_machine(
        &self,
        request: RegisterMachineRequest,
    ) -> Result<MachineResponse, AppError> {
        let architecture: Architecture = request.architecture.parse()?;
        let system: SystemClass = request.system.parse()?;
        let mut machine = Machine::new(request.id, request.fqdn, architecture, system)?
            .with_maintenance(request.maintenance);
        if let Some(bmc) = request.bmc {
            machine = machine.with_bmc(bmc);
        }

        let response = machine_response(&machine);
        self.engine.register_machine(machine).await?;
        Ok(response)
    }

    async fn get_machine(&self, id: &str) -> Result<MachineResponse, AppError> {
        let machine = self.engine.get_machine_status(id).await?;
        Ok(machine_response(&machine))
    }

    async fn update_system(&self, id: &str, system: &str) -> Result<MachineResponse, AppError> {
        let system: SystemClass = system.parse()?;
        self.engine.update_system(id, system).await?;
        self.get_machine(id).await
    }

    async fn machine_history(
        &self,
        id: &str,
    ) -> Result<Vec<ReservationRecordResponse>, AppError> {
        let history = self.engine.reservation_history(id).await?;
        Ok(history.into_iter().map(record_response).collect())
    }

    async fn enqueue_task(
        &self,
        machine_id: &str,
        request: EnqueueTaskRequest,
    ) -> Result<EnqueueTaskResponse, AppError> {
        let action = task_action(request.action)?;
        let task_id = self
            .engine
            .enqueue_task(machine_id, action, &request.requested_by)
            .await?;
        Ok(EnqueueTaskResponse { task_id })
    }

    async fn list_tasks(&self, query: &ListTasksQuery) -> Result<Vec<TaskResponse>, AppError> {
        let tasks = self.engine.list_tasks(query.filter()?).await?;
        Ok(tasks.iter().map(task_response).collect())
    }

    async fn get_task(&self, id: Uuid) -> Result<TaskResponse, AppError> {
        let task = self.engine.get_task(id).await?;
        Ok(task_response(&task))
    }

    async fn cancel_task(&self, id: Uuid) -> Result<CancelTaskResponse, AppError> {
        let outcome = self.engine.cancel_task(id).await?;
        Ok(CancelTaskResponse {
            task_id: id,
            outcome: outcome.as_str().to_string(),
        })
    }

    async fn statistics(&self) -> Result<StatisticsResponse, AppError> {
        Ok(statistics_response(self.engine.statistics().await))
    }

    fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.engine.subscribe()
    }
}

/// Forwards to a taskmanager
pub struct RemoteFleet {
    client: HttpClient,
    events: broadcast::Sender<FleetEvent>,
    relay: JoinHandle<()>,
}

impl RemoteFleet {
    /// Point at the taskmanager at `base_url` and start relaying its events
    ///
    /// Nothing is contacted here; the event stream connects in the
    /// background and reconnects on its own.
    ///
    /// # Errors
    /// Returns an error if `base_url` is not a valid URL
    pub fn connect(base_url: &str, event_capacity: usize) -> Result<Self, ClientError> {
        let client = HttpClient::new(base_url)?;
        let mut stream = WsClient::connect(client.ws_url("/ws/events")?.as_str())?;
        let (events, _) = broadcast::channel(event_capacity.max(1));

        let tx = events.clone();
        let relay = tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                // no subscribers is not an error
                let _ = tx.send(event);
            }
        });
        info!(taskmanager = %base_url, "Forwarding to taskmanager");

        Ok(Self {
            client,
            events,
            relay,
        })
    }
}

impl Drop for RemoteFleet {
    fn drop(&mut self) {
        self.relay.abort();
    }
}

#[async_trait]
impl Fleet for RemoteFleet {
    async fn list_machines(
        &self,
        query: &ListMachinesQuery,
    ) -> Result<PaginatedResponse<MachineResponse>, AppError> {
        let mut request = self
            .client
            .list_machines()
            .page(query.page)
            .per_page(query.per_page);
        if let Some(arch) = &query.arch {
            request = request.architecture(arch);
        }
        if let Some(status) = &query.status {
            request = request.status(status);
        }
        if let Some(owner) = &query.reserved_by {
            request = request.reserved_by(owner);
        }
        if query.free {
            request = request.free();
        }
        if let Some(q) = &query.q {
            request = request.query(q);
        }
        Ok(request.send().await?)
    }

    async fn register_machine(
        &self,
        request: RegisterMachineRequest,
    ) -> Result<MachineResponse, AppError> {
        Ok(self.client.register_machine(request).await?)
    }

    async fn get_machine(&self, id: &str) -> Result<MachineResponse, AppError> {
        Ok(self.client.get_machine(id).await?)
    }

    async fn update_system(&self, id: &str, system: &str) -> Result<MachineResponse, AppError> {
        Ok(self.client.update_system(id, system).await?)
    }

    async fn machine_history(
        &self,
        id: &str,
    ) -> Result<Vec<ReservationRecordResponse>, AppError> {
        Ok(self.client.reservation_history(id).await?)
    }

    async fn enqueue_task(
        &self,
        machine_id: &str,
        request: EnqueueTaskRequest,
    ) -> Result<EnqueueTaskResponse, AppError> {
        Ok(self
            .client
            .enqueue_task(machine_id, request.action, &request.requested_by)
            .await?)
    }

    async fn list_tasks(&self, query: &ListTasksQuery) -> Result<Vec<TaskResponse>, AppError> {
        Ok(self
            .client
            .list_tasks(query.machine.as_deref(), query.state.as_deref())
            .await?)
    }

    async fn get_task(&self, id: Uuid) -> Result<TaskResponse, AppError> {
        Ok(self.client.get_task(id).await?)
    }

    async fn cancel_task(&self, id: Uuid) -> Result<CancelTaskResponse, AppError> {
        Ok(self.client.cancel_task(id).await?)
    }

    async fn statistics(&self) -> Result<StatisticsResponse, AppError> {
        Ok(self.client.statistics().await?)
    }

    fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }
}
