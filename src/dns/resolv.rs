//! System resolver configuration.

use std::net::IpAddr;
use std::path::Path;

const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Nameservers from `/etc/resolv.conf`, falling back to loopback (the
/// systemd-resolved stub first) when the file is missing or names none.
pub(crate) fn nameservers() -> Vec<IpAddr> {
    let mut servers = parse_file(Path::new(RESOLV_CONF));
    if servers.is_empty() {
        for fallback in ["127.0.0.53", "127.0.0.1"] {
            if let Ok(ip) = fallback.parse() {
                servers.push(ip);
            }
        }
    }
    servers
}

fn parse_file(path: &Path) -> Vec<IpAddr> {
    let data = match std::fs::read_to_string(path) {
        Ok(d) => d,
        Err(_) => return Vec::new(),
    };
    parse_str(&data)
}

fn parse_str(data: &str) -> Vec<IpAddr> {
    let mut servers = Vec::new();
    for line in data.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let mut words = line.split_whitespace();
        if words.next() != Some("nameserver") {
            continue;
        }
        if let Some(addr) = words.next() {
            // Strip any scope id; link-local servers are rare and the
            // socket connect would need the interface anyway.
            let addr = addr.split('%').next().unwrap_or(addr);
            if let Ok(ip) = addr.parse::<IpAddr>() {
                if !servers.contains(&ip) {
                    servers.push(ip);
                }
            }
        }
    }
    servers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nameserver_lines() {
        let conf = "# comment\n\
            ; other comment\n\
            search example.com\n\
            nameserver 192.0.2.53\n\
            nameserver 2001:db8::53\n\
            nameserver 192.0.2.53\n\
            options edns0\n";
        let servers = parse_str(conf);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].to_string(), "192.0.2.53");
        assert_eq!(servers[1].to_string(), "2001:db8::53");
    }

    #[test]
    fn empty_conf_yields_nothing() {
        assert!(parse_str("search example.com\n").is_empty());
    }
}
