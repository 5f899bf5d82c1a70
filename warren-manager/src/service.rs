//! `ClusterService` gRPC implementation: the one place every mutation is
//! turned into a `Command` and every read is served straight from `Store`.
//!
//! Grounded on the teacher's `manager::manager::Manager` RPC handlers: a
//! leadership check up front on every write, a `Store`/`Fsm` pair behind it,
//! and `rpc::Status::invalid_argument`/`not_found` mapping at the edge —
//! generalized here across the full entity surface instead of just jobs.

use std::pin::Pin;
use std::sync::Arc;

use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tokio_stream::{Stream, StreamExt};
use tonic::{Request, Response, Status};

use warren_proto::pb::cluster_service_server::ClusterService;
use warren_proto::pb::command::Op;
use warren_proto::pb::*;
use warren_proto::{new_id, now_timestamp, WarrenError};
use warren_raft::RaftNode;
use warren_security::tokens::TokenRole as SecurityTokenRole;
use warren_security::{CertificateAuthority, SecretsManager, TokenManager};
use warren_store::Store;

use crate::events::EventBroker;
use crate::propose::propose;
use crate::validation::is_valid_name;

const CONTAINER_WATCH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3);

pub struct ClusterServiceImpl {
    store: Arc<Store>,
    raft: Arc<RaftNode>,
    ca: Arc<CertificateAuthority>,
    secrets: Arc<SecretsManager>,
    tokens: Arc<TokenManager>,
    events: Arc<EventBroker>,
}

impl ClusterServiceImpl {
    pub fn new(
        store: Arc<Store>,
        raft: Arc<RaftNode>,
        ca: Arc<CertificateAuthority>,
        secrets: Arc<SecretsManager>,
        tokens: Arc<TokenManager>,
        events: Arc<EventBroker>,
    ) -> Self {
        Self { store, raft, ca, secrets, tokens, events }
    }

    async fn require_leader(&self) -> Result<(), Status> {
        if self.raft.is_leader() {
            Ok(())
        } else {
            let leader = self.leader_address().await;
            Err(WarrenError::not_leader(leader).into())
        }
    }

    async fn leader_address(&self) -> Option<String> {
        let leader_id = self.raft.current_leader().await?;
        self.store
            .list_nodes()
            .ok()?
            .into_iter()
            .find(|n| warren_raft::node_id_from_str(&n.address) == leader_id)
            .map(|n| n.address)
    }

    fn require_name(name: &str) -> Result<(), Status> {
        if !is_valid_name(name) {
            return Err(WarrenError::InvalidArgument(format!("invalid name: {name}")).into());
        }
        Ok(())
    }
}

fn to_security_role(role: i32) -> SecurityTokenRole {
    match TokenRole::try_from(role).unwrap_or(TokenRole::Unspecified) {
        TokenRole::Manager => SecurityTokenRole::Manager,
        _ => SecurityTokenRole::Worker,
    }
}

fn from_security_role(role: SecurityTokenRole) -> TokenRole {
    match role {
        SecurityTokenRole::Manager => TokenRole::Manager,
        SecurityTokenRole::Worker => TokenRole::Worker,
    }
}

#[tonic::async_trait]
impl ClusterService for ClusterServiceImpl {
    // ───────────────────────── Membership ─────────────────────────

    async fn register_node(
        &self,
        request: Request<RegisterNodeRequest>,
    ) -> Result<Response<RegisterNodeResponse>, Status> {
        self.require_leader().await?;
        let req = request.into_inner();

        let overlay_address = stable_overlay_address(&req.node_id);

        let node = Node {
            id: req.node_id,
            role: req.role,
            address: req.address,
            overlay_address: overlay_address.clone(),
            capacity: req.capacity,
            status: NodeStatus::Ready as i32,
            last_heartbeat: Some(now_timestamp()),
            labels: req.labels,
            created_at: Some(now_timestamp()),
        };
        let id = node.id.clone();
        propose(&self.raft, Op::CreateNode(node)).await?;
        self.events.publish("node.registered", &id);

        Ok(Response::new(RegisterNodeResponse { overlay_address }))
    }

    async fn heartbeat(
        &self,
        request: Request<HeartbeatRequest>,
    ) -> Result<Response<HeartbeatResponse>, Status> {
        self.require_leader().await?;
        let req = request.into_inner();

        let mut node = self
            .store
            .get_node(&req.node_id)
            .map_err(Status::from_warren)?
            .ok_or_else(|| WarrenError::NotFound(format!("node {}", req.node_id)))?;
        node.status = req.status;
        node.last_heartbeat = Some(now_timestamp());
        propose(&self.raft, Op::UpdateNode(node)).await?;

        for reported in req.containers {
            if let Some(mut existing) = self
                .store
                .get_container(&reported.id)
                .map_err(Status::from_warren)?
            {
                existing.actual_state = reported.actual_state;
                existing.runtime_container_id = reported.runtime_container_id;
                existing.error_message = reported.error_message;
                existing.healthy = reported.healthy;
                existing.ip_address = reported.ip_address;
                propose(&self.raft, Op::UpdateContainer(existing)).await?;
            }
        }

        Ok(Response::new(HeartbeatResponse {}))
    }

    async fn remove_node(
        &self,
        request: Request<RemoveNodeRequest>,
    ) -> Result<Response<RemoveNodeResponse>, Status> {
        self.require_leader().await?;
        let node_id = request.into_inner().node_id;
        propose(&self.raft, Op::DeleteNode(node_id.clone())).await?;
        self.events.publish("node.removed", &node_id);
        Ok(Response::new(RemoveNodeResponse {}))
    }

    async fn generate_join_token(
        &self,
        request: Request<GenerateJoinTokenRequest>,
    ) -> Result<Response<GenerateJoinTokenResponse>, Status> {
        self.require_leader().await?;
        let role = to_security_role(request.into_inner().role);
        let token = self.tokens.generate(role).await;
        let expires_at = now_timestamp_plus(self.tokens.default_ttl());

        Ok(Response::new(GenerateJoinTokenResponse {
            token: Some(JoinTokenInfo {
                token,
                role: from_security_role(role) as i32,
                created_at: Some(now_timestamp()),
                expires_at: Some(expires_at),
            }),
        }))
    }

    async fn join_cluster(
        &self,
        request: Request<JoinClusterRequest>,
    ) -> Result<Response<JoinClusterResponse>, Status> {
        self.require_leader().await?;
        let req = request.into_inner();

        self.tokens
            .validate(&req.token, SecurityTokenRole::Manager)
            .await
            .map_err(|e| Status::permission_denied(e.to_string()))?;

        let node_id = warren_raft::node_id_from_str(&req.address);
        self.raft
            .add_voter(node_id, req.address)
            .await
            .map_err(|e| Status::internal(format!("failed to add voter: {e}")))?;

        Ok(Response::new(JoinClusterResponse {}))
    }

    async fn request_certificate(
        &self,
        request: Request<RequestCertificateRequest>,
    ) -> Result<Response<RequestCertificateResponse>, Status> {
        self.require_leader().await?;
        let remote_addr = request.remote_addr();
        let req = request.into_inner();

        self.tokens
            .validate_any(&req.token)
            .await
            .map_err(|e| Status::permission_denied(e.to_string()))?;

        let issued = if req.client_only {
            self.ca
                .issue_client_certificate(&req.node_id)
                .map_err(|e| Status::internal(e.to_string()))?
        } else {
            let bind_host = remote_addr.map(|a| a.ip().to_string()).unwrap_or_default();
            self.ca
                .issue_manager_certificate(&req.node_id, &bind_host)
                .map_err(|e| Status::internal(e.to_string()))?
        };

        Ok(Response::new(RequestCertificateResponse {
            certificate_pem: issued.certificate_pem,
            private_key_pem: issued.private_key_pem,
            ca_certificate_pem: self.ca.root_certificate_pem().to_string(),
        }))
    }

    async fn get_cluster_info(
        &self,
        _request: Request<GetClusterInfoRequest>,
    ) -> Result<Response<GetClusterInfoResponse>, Status> {
        let metrics = self.raft.raft.metrics().borrow().clone();
        let nodes = self.store.list_nodes().map_err(Status::from_warren)?;

        let leader_address = metrics
            .current_leader
            .and_then(|id| metrics.membership_config.membership().get_node(&id).cloned())
            .map(|n| n.addr);

        Ok(Response::new(GetClusterInfoResponse {
            leader_id: metrics.current_leader.map(|id| id.to_string()).unwrap_or_default(),
            leader_address: leader_address.unwrap_or_default(),
            nodes,
            raft_term: metrics.current_term,
            raft_applied_index: metrics.last_applied.map(|l| l.index).unwrap_or(0),
        }))
    }

    // ───────────────────────── Services ─────────────────────────

    async fn create_service(
        &self,
        request: Request<CreateServiceRequest>,
    ) -> Result<Response<CreateServiceResponse>, Status> {
        self.require_leader().await?;
        let mut spec = request
            .into_inner()
            .spec
            .ok_or_else(|| WarrenError::InvalidArgument("missing service spec".into()))?;
        Self::require_name(&spec.name)?;

        if self
            .store
            .get_service_by_name(&spec.name)
            .map_err(Status::from_warren)?
            .is_some()
        {
            return Err(WarrenError::AlreadyExists(format!("service {}", spec.name)).into());
        }

        spec.id = new_id();
        spec.created_at = Some(now_timestamp());
        spec.updated_at = spec.created_at;
        propose(&self.raft, Op::CreateService(spec.clone())).await?;
        self.events.publish("service.created", &spec.id);

        Ok(Response::new(CreateServiceResponse { service: Some(spec) }))
    }

    async fn update_service(
        &self,
        request: Request<UpdateServiceRequest>,
    ) -> Result<Response<UpdateServiceResponse>, Status> {
        self.require_leader().await?;
        let mut spec = request
            .into_inner()
            .spec
            .ok_or_else(|| WarrenError::InvalidArgument("missing service spec".into()))?;

        let existing = self
            .store
            .get_service(&spec.id)
            .map_err(Status::from_warren)?
            .ok_or_else(|| WarrenError::NotFound(format!("service {}", spec.id)))?;

        spec.created_at = existing.created_at;
        spec.updated_at = Some(now_timestamp());
        propose(&self.raft, Op::UpdateService(spec.clone())).await?;
        self.events.publish("service.updated", &spec.id);

        Ok(Response::new(UpdateServiceResponse { service: Some(spec) }))
    }

    async fn delete_service(
        &self,
        request: Request<DeleteServiceRequest>,
    ) -> Result<Response<DeleteServiceResponse>, Status> {
        self.require_leader().await?;
        let req = request.into_inner();
        let id = self.resolve_service_id(&req.id, &req.name)?;
        propose(&self.raft, Op::DeleteService(id.clone())).await?;
        self.events.publish("service.deleted", &id);
        Ok(Response::new(DeleteServiceResponse {}))
    }

    async fn get_service(
        &self,
        request: Request<GetServiceRequest>,
    ) -> Result<Response<GetServiceResponse>, Status> {
        let req = request.into_inner();
        let service = self.lookup_service(&req.id, &req.name)?;
        Ok(Response::new(GetServiceResponse { service: Some(service) }))
    }

    async fn list_services(
        &self,
        _request: Request<ListServicesRequest>,
    ) -> Result<Response<ListServicesResponse>, Status> {
        let services = self.store.list_services().map_err(Status::from_warren)?;
        Ok(Response::new(ListServicesResponse { services }))
    }

    // ───────────────────────── Containers ─────────────────────────

    async fn list_containers(
        &self,
        request: Request<ListContainersRequest>,
    ) -> Result<Response<ListContainersResponse>, Status> {
        let req = request.into_inner();
        let containers = if !req.node_id.is_empty() {
            self.store.list_containers_for_node(&req.node_id)
        } else if !req.service_id.is_empty() {
            self.store.list_containers_for_service(&req.service_id)
        } else {
            self.store.list_containers()
        }
        .map_err(Status::from_warren)?;

        Ok(Response::new(ListContainersResponse { containers }))
    }

    async fn get_container(
        &self,
        request: Request<GetContainerRequest>,
    ) -> Result<Response<GetContainerResponse>, Status> {
        let id = request.into_inner().id;
        let container = self
            .store
            .get_container(&id)
            .map_err(Status::from_warren)?
            .ok_or_else(|| WarrenError::NotFound(format!("container {id}")))?;
        Ok(Response::new(GetContainerResponse { container: Some(container) }))
    }

    async fn update_container_status(
        &self,
        request: Request<UpdateContainerStatusRequest>,
    ) -> Result<Response<UpdateContainerStatusResponse>, Status> {
        self.require_leader().await?;
        let container = request
            .into_inner()
            .container
            .ok_or_else(|| WarrenError::InvalidArgument("missing container".into()))?;
        let id = container.id.clone();
        propose(&self.raft, Op::UpdateContainer(container)).await?;
        self.events.publish("container.updated", &id);
        Ok(Response::new(UpdateContainerStatusResponse {}))
    }

    async fn report_container_health(
        &self,
        request: Request<ReportContainerHealthRequest>,
    ) -> Result<Response<ReportContainerHealthResponse>, Status> {
        self.require_leader().await?;
        let req = request.into_inner();

        let mut container = self
            .store
            .get_container(&req.container_id)
            .map_err(Status::from_warren)?
            .ok_or_else(|| WarrenError::NotFound(format!("container {}", req.container_id)))?;
        container.healthy = req.healthy;
        if !req.healthy {
            container.error_message = req.message;
        }
        propose(&self.raft, Op::UpdateContainer(container)).await?;

        Ok(Response::new(ReportContainerHealthResponse {}))
    }

    type WatchContainersStream =
        Pin<Box<dyn Stream<Item = Result<WatchContainersEvent, Status>> + Send + 'static>>;

    async fn watch_containers(
        &self,
        request: Request<WatchContainersRequest>,
    ) -> Result<Response<Self::WatchContainersStream>, Status> {
        let node_id = request.into_inner().node_id;
        let store = self.store.clone();
        let (tx, rx) = tokio::sync::mpsc::channel(16);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CONTAINER_WATCH_INTERVAL);
            loop {
                ticker.tick().await;
                let containers = match store.list_containers_for_node(&node_id) {
                    Ok(c) => c,
                    Err(_) => continue,
                };
                if tx.send(Ok(WatchContainersEvent { containers })).await.is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    // ───────────────────────── Secrets ─────────────────────────

    async fn create_secret(
        &self,
        request: Request<CreateSecretRequest>,
    ) -> Result<Response<CreateSecretResponse>, Status> {
        self.require_leader().await?;
        let req = request.into_inner();
        Self::require_name(&req.name)?;

        let ciphertext = self
            .secrets
            .encrypt(&req.plaintext)
            .map_err(|e| Status::internal(e.to_string()))?;

        let secret = Secret {
            id: new_id(),
            name: req.name,
            ciphertext,
            created_at: Some(now_timestamp()),
        };
        propose(&self.raft, Op::CreateSecret(secret.clone())).await?;
        self.events.publish("secret.created", &secret.id);

        Ok(Response::new(CreateSecretResponse {
            secret: Some(cleared_secret(secret)),
        }))
    }

    async fn delete_secret(
        &self,
        request: Request<DeleteSecretRequest>,
    ) -> Result<Response<DeleteSecretResponse>, Status> {
        self.require_leader().await?;
        let req = request.into_inner();
        let secret = self.lookup_secret(&req.id, &req.name)?;
        propose(&self.raft, Op::DeleteSecret(secret.id.clone())).await?;
        self.events.publish("secret.deleted", &secret.id);
        Ok(Response::new(DeleteSecretResponse {}))
    }

    async fn get_secret(
        &self,
        request: Request<GetSecretRequest>,
    ) -> Result<Response<GetSecretResponse>, Status> {
        let req = request.into_inner();
        let secret = self.lookup_secret(&req.id, &req.name)?;
        Ok(Response::new(GetSecretResponse {
            secret: Some(cleared_secret(secret)),
        }))
    }

    async fn list_secrets(
        &self,
        _request: Request<ListSecretsRequest>,
    ) -> Result<Response<ListSecretsResponse>, Status> {
        let secrets = self
            .store
            .list_secrets()
            .map_err(Status::from_warren)?
            .into_iter()
            .map(cleared_secret)
            .collect();
        Ok(Response::new(ListSecretsResponse { secrets }))
    }

    /// The one secret-reading RPC that returns live ciphertext — callable by
    /// workers mounting a secret, never by interactive clients (spec §4.5).
    async fn get_secret_by_name(
        &self,
        request: Request<GetSecretByNameRequest>,
    ) -> Result<Response<GetSecretByNameResponse>, Status> {
        let name = request.into_inner().name;
        let secret = self
            .store
            .get_secret_by_name(&name)
            .map_err(Status::from_warren)?
            .ok_or_else(|| WarrenError::NotFound(format!("secret {name}")))?;
        Ok(Response::new(GetSecretByNameResponse { secret: Some(secret) }))
    }

    // ───────────────────────── Volumes ─────────────────────────

    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        self.require_leader().await?;
        let mut spec = request
            .into_inner()
            .spec
            .ok_or_else(|| WarrenError::InvalidArgument("missing volume spec".into()))?;
        Self::require_name(&spec.name)?;

        spec.id = new_id();
        spec.created_at = Some(now_timestamp());
        propose(&self.raft, Op::CreateVolume(spec.clone())).await?;
        self.events.publish("volume.created", &spec.id);

        Ok(Response::new(CreateVolumeResponse { volume: Some(spec) }))
    }

    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        self.require_leader().await?;
        let req = request.into_inner();
        let volume = self.lookup_volume(&req.id, &req.name)?;
        propose(&self.raft, Op::DeleteVolume(volume.id.clone())).await?;
        self.events.publish("volume.deleted", &volume.id);
        Ok(Response::new(DeleteVolumeResponse {}))
    }

    async fn get_volume(
        &self,
        request: Request<GetVolumeRequest>,
    ) -> Result<Response<GetVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume = self.lookup_volume(&req.id, &req.name)?;
        Ok(Response::new(GetVolumeResponse { volume: Some(volume) }))
    }

    async fn list_volumes(
        &self,
        _request: Request<ListVolumesRequest>,
    ) -> Result<Response<ListVolumesResponse>, Status> {
        let volumes = self.store.list_volumes().map_err(Status::from_warren)?;
        Ok(Response::new(ListVolumesResponse { volumes }))
    }

    // ───────────────────────── Networks ─────────────────────────

    async fn create_network(
        &self,
        request: Request<CreateNetworkRequest>,
    ) -> Result<Response<CreateNetworkResponse>, Status> {
        self.require_leader().await?;
        let mut spec = request
            .into_inner()
            .spec
            .ok_or_else(|| WarrenError::InvalidArgument("missing network spec".into()))?;
        Self::require_name(&spec.name)?;

        spec.id = new_id();
        propose(&self.raft, Op::CreateNetwork(spec.clone())).await?;
        self.events.publish("network.created", &spec.id);

        Ok(Response::new(CreateNetworkResponse { network: Some(spec) }))
    }

    async fn delete_network(
        &self,
        request: Request<DeleteNetworkRequest>,
    ) -> Result<Response<DeleteNetworkResponse>, Status> {
        self.require_leader().await?;
        let req = request.into_inner();
        let id = if !req.id.is_empty() {
            req.id
        } else {
            self.store
                .list_networks()
                .map_err(Status::from_warren)?
                .into_iter()
                .find(|n| n.name == req.name)
                .map(|n| n.id)
                .ok_or_else(|| WarrenError::NotFound(format!("network {}", req.name)))?
        };
        propose(&self.raft, Op::DeleteNetwork(id.clone())).await?;
        self.events.publish("network.deleted", &id);
        Ok(Response::new(DeleteNetworkResponse {}))
    }

    async fn list_networks(
        &self,
        _request: Request<ListNetworksRequest>,
    ) -> Result<Response<ListNetworksResponse>, Status> {
        let networks = self.store.list_networks().map_err(Status::from_warren)?;
        Ok(Response::new(ListNetworksResponse { networks }))
    }

    // ───────────────────────── Ingress ─────────────────────────

    async fn create_ingress_rule(
        &self,
        request: Request<CreateIngressRuleRequest>,
    ) -> Result<Response<CreateIngressRuleResponse>, Status> {
        self.require_leader().await?;
        let mut spec = request
            .into_inner()
            .spec
            .ok_or_else(|| WarrenError::InvalidArgument("missing ingress rule".into()))?;

        spec.id = new_id();
        propose(&self.raft, Op::CreateIngress(spec.clone())).await?;
        self.events.publish("ingress.created", &spec.id);

        Ok(Response::new(CreateIngressRuleResponse { rule: Some(spec) }))
    }

    async fn delete_ingress_rule(
        &self,
        request: Request<DeleteIngressRuleRequest>,
    ) -> Result<Response<DeleteIngressRuleResponse>, Status> {
        self.require_leader().await?;
        let id = request.into_inner().id;
        propose(&self.raft, Op::DeleteIngress(id.clone())).await?;
        self.events.publish("ingress.deleted", &id);
        Ok(Response::new(DeleteIngressRuleResponse {}))
    }

    async fn list_ingress_rules(
        &self,
        _request: Request<ListIngressRulesRequest>,
    ) -> Result<Response<ListIngressRulesResponse>, Status> {
        let rules = self.store.list_ingress_rules().map_err(Status::from_warren)?;
        Ok(Response::new(ListIngressRulesResponse { rules }))
    }

    // ───────────────────────── TLS certificates ─────────────────────────

    async fn create_tls_certificate(
        &self,
        request: Request<CreateTlsCertificateRequest>,
    ) -> Result<Response<CreateTlsCertificateResponse>, Status> {
        self.require_leader().await?;
        let mut spec = request
            .into_inner()
            .spec
            .ok_or_else(|| WarrenError::InvalidArgument("missing certificate spec".into()))?;
        Self::require_name(&spec.name)?;

        spec.id = new_id();
        propose(&self.raft, Op::CreateTlsCertificate(spec.clone())).await?;
        self.events.publish("tls_certificate.created", &spec.id);

        Ok(Response::new(CreateTlsCertificateResponse { certificate: Some(spec) }))
    }

    async fn delete_tls_certificate(
        &self,
        request: Request<DeleteTlsCertificateRequest>,
    ) -> Result<Response<DeleteTlsCertificateResponse>, Status> {
        self.require_leader().await?;
        let req = request.into_inner();
        let cert = self.lookup_tls_certificate(&req.id, &req.name)?;
        propose(&self.raft, Op::DeleteTlsCertificate(cert.id.clone())).await?;
        self.events.publish("tls_certificate.deleted", &cert.id);
        Ok(Response::new(DeleteTlsCertificateResponse {}))
    }

    async fn get_tls_certificate(
        &self,
        request: Request<GetTlsCertificateRequest>,
    ) -> Result<Response<GetTlsCertificateResponse>, Status> {
        let req = request.into_inner();
        let cert = self.lookup_tls_certificate(&req.id, &req.name)?;
        Ok(Response::new(GetTlsCertificateResponse { certificate: Some(cert) }))
    }

    async fn list_tls_certificates(
        &self,
        _request: Request<ListTlsCertificatesRequest>,
    ) -> Result<Response<ListTlsCertificatesResponse>, Status> {
        let certificates = self.store.list_tls_certificates().map_err(Status::from_warren)?;
        Ok(Response::new(ListTlsCertificatesResponse { certificates }))
    }

    // ───────────────────────── Events ─────────────────────────

    type StreamEventsStream = Pin<Box<dyn Stream<Item = Result<ClusterEvent, Status>> + Send + 'static>>;

    async fn stream_events(
        &self,
        _request: Request<StreamEventsRequest>,
    ) -> Result<Response<Self::StreamEventsStream>, Status> {
        let stream = BroadcastStream::new(self.events.subscribe())
            .filter_map(|item| item.ok())
            .map(Ok);
        Ok(Response::new(Box::pin(stream)))
    }
}

impl ClusterServiceImpl {
    fn resolve_service_id(&self, id: &str, name: &str) -> Result<String, Status> {
        Ok(self.lookup_service(id, name)?.id)
    }

    fn lookup_service(&self, id: &str, name: &str) -> Result<Service, Status> {
        let found = if !id.is_empty() {
            self.store.get_service(id).map_err(Status::from_warren)?
        } else {
            self.store.get_service_by_name(name).map_err(Status::from_warren)?
        };
        found.ok_or_else(|| WarrenError::NotFound(format!("service {id}{name}")).into())
    }

    fn lookup_secret(&self, id: &str, name: &str) -> Result<Secret, Status> {
        let found = if !id.is_empty() {
            self.store.get_secret(id).map_err(Status::from_warren)?
        } else {
            self.store.get_secret_by_name(name).map_err(Status::from_warren)?
        };
        found.ok_or_else(|| WarrenError::NotFound(format!("secret {id}{name}")).into())
    }

    fn lookup_volume(&self, id: &str, name: &str) -> Result<Volume, Status> {
        let found = if !id.is_empty() {
            self.store.get_volume(id).map_err(Status::from_warren)?
        } else {
            self.store.get_volume_by_name(name).map_err(Status::from_warren)?
        };
        found.ok_or_else(|| WarrenError::NotFound(format!("volume {id}{name}")).into())
    }

    fn lookup_tls_certificate(&self, id: &str, name: &str) -> Result<TlsCertificate, Status> {
        let found = if !id.is_empty() {
            self.store.get_tls_certificate(id).map_err(Status::from_warren)?
        } else {
            self.store
                .get_tls_certificate_by_name(name)
                .map_err(Status::from_warren)?
        };
        found.ok_or_else(|| WarrenError::NotFound(format!("tls certificate {id}{name}")).into())
    }
}

/// Clears the ciphertext field: every secret-listing RPC except
/// `GetSecretByName` must never let plaintext-adjacent bytes cross the wire
/// (spec §4.5's exposure contract).
fn cleared_secret(mut secret: Secret) -> Secret {
    secret.ciphertext.clear();
    secret
}

/// A stable, private-range IPv4 derived from the node id — there is no real
/// overlay network in this implementation (host networking plus the hooks in
/// spec §4.10 stand in for it), but callers still need a consistent address
/// to hand back from `RegisterNode`.
fn stable_overlay_address(node_id: &str) -> String {
    let hash = node_id.bytes().fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    format!("10.100.{}.{}", (hash >> 8) as u8, hash as u8)
}

fn now_timestamp_plus(duration: std::time::Duration) -> prost_types::Timestamp {
    let mut ts = now_timestamp();
    ts.seconds += duration.as_secs() as i64;
    ts
}

trait StatusExt {
    fn from_warren(err: WarrenError) -> Status;
}

impl StatusExt for Status {
    fn from_warren(err: WarrenError) -> Status {
        err.into()
    }
}
