//! Port publisher (spec §4.10). Host mode shells out to `iptables` to install
//! tagged DNAT/MASQUERADE/FORWARD rules; ingress mode installs nothing, since
//! the port record already lives in Store via the container's `ports` field
//! and is consumed by the ingress proxy directly.
//!
//! No crate in the dependency stack wraps `iptables`, so rules are applied
//! the way most Rust daemons that need netfilter do it without a kernel
//! binding: invoke the `iptables` binary per rule, tag every rule with a
//! `--comment` carrying the container id so they can be enumerated and
//! removed without tracking rule handles across a process restart.

use tokio::process::Command;
use tracing::warn;

use warren_proto::pb::{ContainerInstance, PortMode, PortProtocol};
use warren_proto::WarrenError;

fn comment(container_id: &str) -> String {
    format!("warren-{container_id}")
}

/// Installs one DNAT + one MASQUERADE + one FORWARD-accept rule per declared
/// host-mode port. On any failure, tears down whatever this call already
/// installed so no partial rule set survives (spec: "no partial rules are
/// left behind").
pub async fn install(container: &ContainerInstance, container_ip: &str) -> Result<(), WarrenError> {
    let tag = comment(&container.id);
    let mut installed = Vec::new();

    for port in &container.ports {
        if port.mode != PortMode::Host as i32 || port.host_port == 0 {
            continue;
        }
        let proto = if port.protocol == PortProtocol::Udp as i32 { "udp" } else { "tcp" };
        let dest = format!("{container_ip}:{}", port.container_port);

        let rules: [Vec<String>; 2] = [
            vec![
                "-t".into(), "nat".into(), "-A".into(), "PREROUTING".into(),
                "-p".into(), proto.into(), "--dport".into(), port.host_port.to_string(),
                "-j".into(), "DNAT".into(), "--to-destination".into(), dest.clone(),
                "-m".into(), "comment".into(), "--comment".into(), tag.clone(),
            ],
            vec![
                "-A".into(), "FORWARD".into(), "-p".into(), proto.into(),
                "-d".into(), container_ip.to_string(), "--dport".into(), port.container_port.to_string(),
                "-j".into(), "ACCEPT".into(),
                "-m".into(), "comment".into(), "--comment".into(), tag.clone(),
            ],
        ];

        for rule in rules {
            if let Err(e) = run_iptables(&rule).await {
                remove(&container.id).await;
                return Err(WarrenError::Runtime(format!("port rule install failed: {e}")));
            }
            installed.push(rule);
        }
    }

    let masq_rule = vec![
        "-t".into(), "nat".into(), "-A".into(), "POSTROUTING".into(),
        "-d".into(), container_ip.to_string(), "-j".into(), "MASQUERADE".into(),
        "-m".into(), "comment".into(), "--comment".into(), tag.clone(),
    ];
    if !installed.is_empty() {
        if let Err(e) = run_iptables(&masq_rule).await {
            remove(&container.id).await;
            return Err(WarrenError::Runtime(format!("masquerade rule install failed: {e}")));
        }
    }
    Ok(())
}

/// Removes every rule tagged with this container's id from every chain it
/// could appear in. Safe to call even if nothing was ever installed.
pub async fn remove(container_id: &str) {
    let tag = comment(container_id);
    let locations: [(Option<&str>, &str); 3] =
        [(Some("nat"), "PREROUTING"), (Some("nat"), "POSTROUTING"), (None, "FORWARD")];

    for (table, chain) in locations {
        loop {
            let mut list_args = Vec::new();
            if let Some(table) = table {
                list_args.extend(["-t".to_string(), table.to_string()]);
            }
            list_args.extend(["-L".to_string(), chain.to_string(), "-n".to_string(), "--line-numbers".to_string()]);
            let Ok(output) = Command::new("iptables").args(&list_args).output().await else { break };
            let stdout = String::from_utf8_lossy(&output.stdout);
            let Some(line) = stdout.lines().find(|l| l.contains(&tag)) else { break };
            let Some(line_no) = line.split_whitespace().next() else { break };

            let mut del_args = Vec::new();
            if let Some(table) = table {
                del_args.extend(["-t".to_string(), table.to_string()]);
            }
            del_args.extend(["-D".to_string(), chain.to_string(), line_no.to_string()]);
            if run_iptables(&del_args).await.is_err() {
                warn!(container_id, "failed to remove tagged port rule, leaving it in place");
                break;
            }
        }
    }
}

async fn run_iptables(args: &[String]) -> std::io::Result<()> {
    let status = Command::new("iptables").args(args).status().await?;
    if !status.success() {
        return Err(std::io::Error::other(format!("iptables {args:?} exited with {status}")));
    }
    Ok(())
}
