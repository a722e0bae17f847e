use async_trait::async_trait;
use bollard::{
    container::{InspectContainerOptions, ListContainersOptions},
    errors::Error as DockerError,
    models::{ContainerInspectResponse, ContainerSummary, EventMessage},
    system::EventsOptions,
    Docker,
};
use futures_util::StreamExt;
use std::collections::HashMap;

use autopg_core::{EventSubscription, Platform, PlatformError, Workload, WorkloadStarted};

const NOT_FOUND: u16 = 404;

#[derive(Debug, Clone)]
pub struct DockerPlatform {
    docker: Docker,
}

impl DockerPlatform {
    /// Connects using the standard Docker environment (`DOCKER_HOST`, or the local socket).
    pub fn connect() -> Result<Self, PlatformError> {
        let docker = Docker::connect_with_local_defaults().map_err(PlatformError::api)?;

        Ok(Self::new(docker))
    }

    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    fn map_error(err: DockerError, id: &str) -> PlatformError {
        match err {
            DockerError::DockerResponseServerError {
                status_code: NOT_FOUND,
                ..
            } => PlatformError::NotFound(id.to_string()),
            err => PlatformError::api(err),
        }
    }
}

fn workload_from_summary(summary: ContainerSummary) -> Option<Workload> {
    Some(Workload {
        id: summary.id?,
        name: summary.names.and_then(|names| names.into_iter().next()),
        labels: summary.labels.unwrap_or_default(),
    })
}

fn workload_from_inspect(response: ContainerInspectResponse) -> Option<Workload> {
    Some(Workload {
        id: response.id?,
        name: response.name,
        labels: response
            .config
            .and_then(|config| config.labels)
            .unwrap_or_default(),
    })
}

fn started_from_event(message: EventMessage) -> Option<WorkloadStarted> {
    let id = message.actor.and_then(|actor| actor.id)?;

    Some(WorkloadStarted {
        id,
        time: message.time,
    })
}

#[async_trait]
impl Platform for DockerPlatform {
    #[tracing::instrument(name = "docker::list_workloads", skip_all)]
    async fn list_workloads(&self) -> Result<Vec<Workload>, PlatformError> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };

        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(PlatformError::api)?;

        Ok(summaries
            .into_iter()
            .filter_map(workload_from_summary)
            .collect())
    }

    #[tracing::instrument(name = "docker::inspect_workload", skip(self))]
    async fn inspect_workload(&self, id: &str) -> Result<Workload, PlatformError> {
        let response = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|err| Self::map_error(err, id))?;

        workload_from_inspect(response).ok_or_else(|| PlatformError::NotFound(id.to_string()))
    }

    #[tracing::instrument(name = "docker::subscribe_started", skip(self))]
    async fn subscribe_started(
        &self,
        since: Option<i64>,
    ) -> Result<EventSubscription, PlatformError> {
        let filters = HashMap::from([
            ("type".to_string(), vec!["container".to_string()]),
            ("event".to_string(), vec!["start".to_string()]),
        ]);

        let options = EventsOptions::<String> {
            since: since.map(|since| since.to_string()),
            filters,
            ..Default::default()
        };

        let events = self
            .docker
            .events(Some(options))
            .filter_map(|result| async move {
                match result {
                    Ok(message) => started_from_event(message).map(Ok),
                    Err(err) => Some(Err(PlatformError::api(err))),
                }
            });

        Ok(events.boxed())
    }

    // The Engine API has no endpoint for changing labels on an existing container.
    async fn update_labels(
        &self,
        _id: &str,
        _labels: &HashMap<String, String>,
    ) -> Result<(), PlatformError> {
        Err(PlatformError::Unsupported("label updates on existing containers"))
    }
}
