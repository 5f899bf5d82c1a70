//! Bucket (sled tree) names. Kept in one place, like the teacher keeps table
//! key prefixes centralized in `datastore::meta::table_key::TableKey`.

pub const NODES: &str = "nodes";
pub const SERVICES: &str = "services";
pub const CONTAINERS: &str = "containers";
pub const SECRETS: &str = "secrets";
pub const VOLUMES: &str = "volumes";
pub const NETWORKS: &str = "networks";
pub const INGRESS: &str = "ingress_rules";
pub const TLS_CERTIFICATES: &str = "tls_certificates";
pub const CA_MATERIAL: &str = "ca_material";

// Secondary indexes: secondary key bytes -> primary id bytes.
pub const IDX_SERVICE_NAME: &str = "idx_service_name";
pub const IDX_VOLUME_NAME: &str = "idx_volume_name";
pub const IDX_NETWORK_NAME: &str = "idx_network_name";
pub const IDX_SECRET_NAME: &str = "idx_secret_name";
pub const IDX_TLS_NAME: &str = "idx_tls_name";

// One-to-many indexes: composite key (parent_id, child_id) -> empty value.
// Scanned by prefix to answer "containers for this service/node".
pub const IDX_SERVICE_CONTAINERS: &str = "idx_service_containers";
pub const IDX_NODE_CONTAINERS: &str = "idx_node_containers";

pub const CA_MATERIAL_KEY: &[u8] = b"singleton";
