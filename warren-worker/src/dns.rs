//! Writes the per-container DNS configuration file (spec §4.9 step d, §6's
//! `<dnsDir>/resolv.conf`: "nameserver `<managerIP>`, then upstream
//! nameservers, then `search <domain>`, `options ndots:0`").

use std::net::IpAddr;
use std::path::Path;

pub struct DnsConfig {
    pub manager_ip: IpAddr,
    pub upstreams: Vec<IpAddr>,
    pub search_domain: String,
}

impl DnsConfig {
    pub fn render(&self) -> String {
        let mut out = format!("nameserver {}\n", self.manager_ip);
        for upstream in &self.upstreams {
            out.push_str(&format!("nameserver {upstream}\n"));
        }
        out.push_str(&format!("search {}\n", self.search_domain));
        out.push_str("options ndots:0\n");
        out
    }

    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_manager_then_upstreams_then_search() {
        let cfg = DnsConfig {
            manager_ip: "10.100.0.1".parse().unwrap(),
            upstreams: vec!["1.1.1.1".parse().unwrap(), "8.8.8.8".parse().unwrap()],
            search_domain: "warren".to_string(),
        };
        let rendered = cfg.render();
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "nameserver 10.100.0.1");
        assert_eq!(lines[1], "nameserver 1.1.1.1");
        assert_eq!(lines[2], "nameserver 8.8.8.8");
        assert_eq!(lines[3], "search warren");
        assert_eq!(lines[4], "options ndots:0");
    }
}
