use std::path::Path;
use std::sync::Mutex;

use prost::Message;
use warren_proto::pb::{
    CaMaterial, ContainerInstance, IngressRule, NetworkDef, Node, Secret, Service,
    TlsCertificate, Volume,
};
use warren_proto::{Result, WarrenError};

use crate::buckets;

/// The durable, ordered key-value store backing every cluster entity.
///
/// Mirrors the role `EmbeddedDB` plays for the teacher's `Metastore`: one
/// handle, many named buckets, secondary indexes kept inside the same write
/// as the primary record. Per spec §5 there is exactly one writer (the FSM
/// apply loop) — `write_lock` exists only to make that invariant load-bearing
/// even if a future caller forgets it, not to support concurrent writers.
pub struct Store {
    db: sled::Db,
    write_lock: Mutex<()>,
}

fn decode<M: Message + Default>(bytes: &[u8]) -> Result<M> {
    M::decode(bytes).map_err(|e| WarrenError::internal(format!("corrupt record: {e}")))
}

impl Store {
    pub fn open(dir: &Path) -> Result<Self> {
        let db = sled::open(dir.join("state.db"))
            .map_err(|e| WarrenError::internal(format!("failed to open state.db: {e}")))?;
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| WarrenError::internal(format!("failed to open temp store: {e}")))?;
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn tree(&self, name: &str) -> Result<sled::Tree> {
        self.db
            .open_tree(name)
            .map_err(|e| WarrenError::internal(format!("failed to open bucket {name}: {e}")))
    }

    fn put_record<M: Message>(&self, bucket: &str, id: &str, record: &M) -> Result<()> {
        let tree = self.tree(bucket)?;
        tree.insert(id.as_bytes(), record.encode_to_vec())
            .map_err(|e| WarrenError::internal(format!("write to {bucket} failed: {e}")))?;
        Ok(())
    }

    fn get_record<M: Message + Default>(&self, bucket: &str, id: &str) -> Result<Option<M>> {
        let tree = self.tree(bucket)?;
        match tree
            .get(id.as_bytes())
            .map_err(|e| WarrenError::internal(format!("read from {bucket} failed: {e}")))?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn delete_record(&self, bucket: &str, id: &str) -> Result<()> {
        let tree = self.tree(bucket)?;
        tree.remove(id.as_bytes())
            .map_err(|e| WarrenError::internal(format!("delete from {bucket} failed: {e}")))?;
        Ok(())
    }

    fn list_records<M: Message + Default>(&self, bucket: &str) -> Result<Vec<M>> {
        let tree = self.tree(bucket)?;
        let mut out = Vec::new();
        for entry in tree.iter() {
            let (_, bytes) =
                entry.map_err(|e| WarrenError::internal(format!("scan of {bucket} failed: {e}")))?;
            out.push(decode(&bytes)?);
        }
        Ok(out)
    }

    fn set_index(&self, index: &str, key: &str, id: &str) -> Result<()> {
        let tree = self.tree(index)?;
        tree.insert(key.as_bytes(), id.as_bytes())
            .map_err(|e| WarrenError::internal(format!("index write {index} failed: {e}")))?;
        Ok(())
    }

    fn remove_index(&self, index: &str, key: &str) -> Result<()> {
        let tree = self.tree(index)?;
        tree.remove(key.as_bytes())
            .map_err(|e| WarrenError::internal(format!("index delete {index} failed: {e}")))?;
        Ok(())
    }

    fn lookup_index(&self, index: &str, key: &str) -> Result<Option<String>> {
        let tree = self.tree(index)?;
        match tree
            .get(key.as_bytes())
            .map_err(|e| WarrenError::internal(format!("index read {index} failed: {e}")))?
        {
            Some(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            None => Ok(None),
        }
    }

    fn set_membership(&self, index: &str, parent_id: &str, child_id: &str) -> Result<()> {
        let tree = self.tree(index)?;
        let key = format!("{parent_id}/{child_id}");
        tree.insert(key.as_bytes(), &[])
            .map_err(|e| WarrenError::internal(format!("membership write {index} failed: {e}")))?;
        Ok(())
    }

    fn remove_membership(&self, index: &str, parent_id: &str, child_id: &str) -> Result<()> {
        let tree = self.tree(index)?;
        let key = format!("{parent_id}/{child_id}");
        tree.remove(key.as_bytes())
            .map_err(|e| WarrenError::internal(format!("membership delete {index} failed: {e}")))?;
        Ok(())
    }

    fn list_membership(&self, index: &str, parent_id: &str) -> Result<Vec<String>> {
        let tree = self.tree(index)?;
        let prefix = format!("{parent_id}/");
        let mut out = Vec::new();
        for entry in tree.scan_prefix(prefix.as_bytes()) {
            let (key, _) = entry
                .map_err(|e| WarrenError::internal(format!("membership scan {index} failed: {e}")))?;
            let key = String::from_utf8_lossy(&key).into_owned();
            if let Some(child_id) = key.splitn(2, '/').nth(1) {
                out.push(child_id.to_string());
            }
        }
        Ok(out)
    }

    // ───────────────────────── Nodes ─────────────────────────

    pub fn put_node(&self, node: &Node) -> Result<()> {
        let _g = self.write_lock.lock().unwrap();
        self.put_record(buckets::NODES, &node.id, node)
    }

    pub fn get_node(&self, id: &str) -> Result<Option<Node>> {
        self.get_record(buckets::NODES, id)
    }

    pub fn delete_node(&self, id: &str) -> Result<()> {
        let _g = self.write_lock.lock().unwrap();
        self.delete_record(buckets::NODES, id)
    }

    pub fn list_nodes(&self) -> Result<Vec<Node>> {
        self.list_records(buckets::NODES)
    }

    // ───────────────────────── Services ─────────────────────────

    pub fn put_service(&self, service: &Service) -> Result<()> {
        let _g = self.write_lock.lock().unwrap();
        self.put_record(buckets::SERVICES, &service.id, service)?;
        self.set_index(buckets::IDX_SERVICE_NAME, &service.name, &service.id)
    }

    pub fn get_service(&self, id: &str) -> Result<Option<Service>> {
        self.get_record(buckets::SERVICES, id)
    }

    pub fn get_service_by_name(&self, name: &str) -> Result<Option<Service>> {
        match self.lookup_index(buckets::IDX_SERVICE_NAME, name)? {
            Some(id) => self.get_service(&id),
            None => Ok(None),
        }
    }

    pub fn delete_service(&self, id: &str) -> Result<()> {
        let _g = self.write_lock.lock().unwrap();
        if let Some(service) = self.get_record::<Service>(buckets::SERVICES, id)? {
            self.remove_index(buckets::IDX_SERVICE_NAME, &service.name)?;
        }
        self.delete_record(buckets::SERVICES, id)
    }

    pub fn list_services(&self) -> Result<Vec<Service>> {
        self.list_records(buckets::SERVICES)
    }

    // ───────────────────────── Containers ─────────────────────────

    pub fn put_container(&self, container: &ContainerInstance) -> Result<()> {
        let _g = self.write_lock.lock().unwrap();
        self.put_record(buckets::CONTAINERS, &container.id, container)?;
        self.set_membership(
            buckets::IDX_SERVICE_CONTAINERS,
            &container.service_id,
            &container.id,
        )?;
        if !container.node_id.is_empty() {
            self.set_membership(buckets::IDX_NODE_CONTAINERS, &container.node_id, &container.id)?;
        }
        Ok(())
    }

    pub fn get_container(&self, id: &str) -> Result<Option<ContainerInstance>> {
        self.get_record(buckets::CONTAINERS, id)
    }

    pub fn delete_container(&self, id: &str) -> Result<()> {
        let _g = self.write_lock.lock().unwrap();
        if let Some(container) = self.get_record::<ContainerInstance>(buckets::CONTAINERS, id)? {
            self.remove_membership(
                buckets::IDX_SERVICE_CONTAINERS,
                &container.service_id,
                &container.id,
            )?;
            if !container.node_id.is_empty() {
                self.remove_membership(
                    buckets::IDX_NODE_CONTAINERS,
                    &container.node_id,
                    &container.id,
                )?;
            }
        }
        self.delete_record(buckets::CONTAINERS, id)
    }

    pub fn list_containers(&self) -> Result<Vec<ContainerInstance>> {
        self.list_records(buckets::CONTAINERS)
    }

    pub fn list_containers_for_service(&self, service_id: &str) -> Result<Vec<ContainerInstance>> {
        let ids = self.list_membership(buckets::IDX_SERVICE_CONTAINERS, service_id)?;
        ids.into_iter()
            .filter_map(|id| self.get_container(&id).transpose())
            .collect()
    }

    pub fn list_containers_for_node(&self, node_id: &str) -> Result<Vec<ContainerInstance>> {
        let ids = self.list_membership(buckets::IDX_NODE_CONTAINERS, node_id)?;
        ids.into_iter()
            .filter_map(|id| self.get_container(&id).transpose())
            .collect()
    }

    // ───────────────────────── Secrets ─────────────────────────

    pub fn put_secret(&self, secret: &Secret) -> Result<()> {
        let _g = self.write_lock.lock().unwrap();
        self.put_record(buckets::SECRETS, &secret.id, secret)?;
        self.set_index(buckets::IDX_SECRET_NAME, &secret.name, &secret.id)
    }

    pub fn get_secret(&self, id: &str) -> Result<Option<Secret>> {
        self.get_record(buckets::SECRETS, id)
    }

    pub fn get_secret_by_name(&self, name: &str) -> Result<Option<Secret>> {
        match self.lookup_index(buckets::IDX_SECRET_NAME, name)? {
            Some(id) => self.get_secret(&id),
            None => Ok(None),
        }
    }

    pub fn delete_secret(&self, id: &str) -> Result<()> {
        let _g = self.write_lock.lock().unwrap();
        if let Some(secret) = self.get_record::<Secret>(buckets::SECRETS, id)? {
            self.remove_index(buckets::IDX_SECRET_NAME, &secret.name)?;
        }
        self.delete_record(buckets::SECRETS, id)
    }

    pub fn list_secrets(&self) -> Result<Vec<Secret>> {
        self.list_records(buckets::SECRETS)
    }

    // ───────────────────────── Volumes ─────────────────────────

    pub fn put_volume(&self, volume: &Volume) -> Result<()> {
        let _g = self.write_lock.lock().unwrap();
        self.put_record(buckets::VOLUMES, &volume.id, volume)?;
        self.set_index(buckets::IDX_VOLUME_NAME, &volume.name, &volume.id)
    }

    pub fn get_volume(&self, id: &str) -> Result<Option<Volume>> {
        self.get_record(buckets::VOLUMES, id)
    }

    pub fn get_volume_by_name(&self, name: &str) -> Result<Option<Volume>> {
        match self.lookup_index(buckets::IDX_VOLUME_NAME, name)? {
            Some(id) => self.get_volume(&id),
            None => Ok(None),
        }
    }

    pub fn delete_volume(&self, id: &str) -> Result<()> {
        let _g = self.write_lock.lock().unwrap();
        if let Some(volume) = self.get_record::<Volume>(buckets::VOLUMES, id)? {
            self.remove_index(buckets::IDX_VOLUME_NAME, &volume.name)?;
        }
        self.delete_record(buckets::VOLUMES, id)
    }

    pub fn list_volumes(&self) -> Result<Vec<Volume>> {
        self.list_records(buckets::VOLUMES)
    }

    // ───────────────────────── Networks ─────────────────────────

    pub fn put_network(&self, network: &NetworkDef) -> Result<()> {
        let _g = self.write_lock.lock().unwrap();
        self.put_record(buckets::NETWORKS, &network.id, network)?;
        self.set_index(buckets::IDX_NETWORK_NAME, &network.name, &network.id)
    }

    pub fn delete_network(&self, id: &str) -> Result<()> {
        let _g = self.write_lock.lock().unwrap();
        if let Some(network) = self.get_record::<NetworkDef>(buckets::NETWORKS, id)? {
            self.remove_index(buckets::IDX_NETWORK_NAME, &network.name)?;
        }
        self.delete_record(buckets::NETWORKS, id)
    }

    pub fn list_networks(&self) -> Result<Vec<NetworkDef>> {
        self.list_records(buckets::NETWORKS)
    }

    // ───────────────────────── Ingress rules ─────────────────────────

    pub fn put_ingress_rule(&self, rule: &IngressRule) -> Result<()> {
        let _g = self.write_lock.lock().unwrap();
        self.put_record(buckets::INGRESS, &rule.id, rule)
    }

    pub fn delete_ingress_rule(&self, id: &str) -> Result<()> {
        let _g = self.write_lock.lock().unwrap();
        self.delete_record(buckets::INGRESS, id)
    }

    pub fn list_ingress_rules(&self) -> Result<Vec<IngressRule>> {
        self.list_records(buckets::INGRESS)
    }

    // ───────────────────────── TLS certificates ─────────────────────────

    pub fn put_tls_certificate(&self, cert: &TlsCertificate) -> Result<()> {
        let _g = self.write_lock.lock().unwrap();
        self.put_record(buckets::TLS_CERTIFICATES, &cert.id, cert)?;
        self.set_index(buckets::IDX_TLS_NAME, &cert.name, &cert.id)
    }

    pub fn get_tls_certificate(&self, id: &str) -> Result<Option<TlsCertificate>> {
        self.get_record(buckets::TLS_CERTIFICATES, id)
    }

    pub fn get_tls_certificate_by_name(&self, name: &str) -> Result<Option<TlsCertificate>> {
        match self.lookup_index(buckets::IDX_TLS_NAME, name)? {
            Some(id) => self.get_tls_certificate(&id),
            None => Ok(None),
        }
    }

    pub fn delete_tls_certificate(&self, id: &str) -> Result<()> {
        let _g = self.write_lock.lock().unwrap();
        if let Some(cert) = self.get_record::<TlsCertificate>(buckets::TLS_CERTIFICATES, id)? {
            self.remove_index(buckets::IDX_TLS_NAME, &cert.name)?;
        }
        self.delete_record(buckets::TLS_CERTIFICATES, id)
    }

    pub fn list_tls_certificates(&self) -> Result<Vec<TlsCertificate>> {
        self.list_records(buckets::TLS_CERTIFICATES)
    }

    // ───────────────────────── CA material ─────────────────────────

    pub fn put_ca_material(&self, material: &CaMaterial) -> Result<()> {
        let _g = self.write_lock.lock().unwrap();
        let tree = self.tree(buckets::CA_MATERIAL)?;
        tree.insert(buckets::CA_MATERIAL_KEY, material.encode_to_vec())
            .map_err(|e| WarrenError::internal(format!("failed to persist CA material: {e}")))?;
        Ok(())
    }

    pub fn get_ca_material(&self) -> Result<Option<CaMaterial>> {
        let tree = self.tree(buckets::CA_MATERIAL)?;
        match tree
            .get(buckets::CA_MATERIAL_KEY)
            .map_err(|e| WarrenError::internal(format!("failed to read CA material: {e}")))?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Clears every bucket. Used only by FSM restore, which reinstalls every
    /// entity from a snapshot via the normal write path right afterwards.
    pub(crate) fn clear_all(&self) -> Result<()> {
        let _g = self.write_lock.lock().unwrap();
        for name in self.db.tree_names() {
            if name == b"__sled__default" {
                continue;
            }
            let tree = self
                .db
                .open_tree(&name)
                .map_err(|e| WarrenError::internal(format!("failed to open bucket: {e}")))?;
            tree.clear()
                .map_err(|e| WarrenError::internal(format!("failed to clear bucket: {e}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warren_proto::pb::{NodeRole, NodeStatus};

    fn node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            role: NodeRole::Worker as i32,
            status: NodeStatus::Ready as i32,
            ..Default::default()
        }
    }

    #[test]
    fn round_trip_create_get_delete() {
        let store = Store::temporary().unwrap();
        let n = node("n1");
        store.put_node(&n).unwrap();
        assert_eq!(store.get_node("n1").unwrap().unwrap().id, "n1");
        store.delete_node("n1").unwrap();
        assert!(store.get_node("n1").unwrap().is_none());
    }

    #[test]
    fn service_lookup_by_name() {
        let store = Store::temporary().unwrap();
        let svc = Service {
            id: "s1".into(),
            name: "web".into(),
            ..Default::default()
        };
        store.put_service(&svc).unwrap();
        assert_eq!(store.get_service_by_name("web").unwrap().unwrap().id, "s1");
        store.delete_service("s1").unwrap();
        assert!(store.get_service_by_name("web").unwrap().is_none());
    }

    #[test]
    fn containers_indexed_by_service_and_node() {
        let store = Store::temporary().unwrap();
        let c = ContainerInstance {
            id: "c1".into(),
            service_id: "s1".into(),
            node_id: "n1".into(),
            ..Default::default()
        };
        store.put_container(&c).unwrap();
        assert_eq!(store.list_containers_for_service("s1").unwrap().len(), 1);
        assert_eq!(store.list_containers_for_node("n1").unwrap().len(), 1);
        store.delete_container("c1").unwrap();
        assert_eq!(store.list_containers_for_service("s1").unwrap().len(), 0);
        assert_eq!(store.list_containers_for_node("n1").unwrap().len(), 0);
    }
}
