//! Environment of the Kong proxy container and the values derived from it.

use k8s_openapi::api::core::v1::EnvVar;

use crate::consts::*;
use crate::crds::DataPlaneServicePort;

pub const KONG_PROXY_LISTEN: &str = "KONG_PROXY_LISTEN";
pub const KONG_ADMIN_LISTEN: &str = "KONG_ADMIN_LISTEN";
pub const KONG_STATUS_LISTEN: &str = "KONG_STATUS_LISTEN";
pub const KONG_PORT_MAPS: &str = "KONG_PORT_MAPS";
pub const KONG_PLUGINS: &str = "KONG_PLUGINS";
pub const KONG_LUA_PACKAGE_PATH: &str = "KONG_LUA_PACKAGE_PATH";

pub fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

/// Default service ports of the ingress Service.
pub fn default_ingress_ports() -> Vec<DataPlaneServicePort> {
    vec![
        DataPlaneServicePort {
            name: Some("http".to_string()),
            port: DEFAULT_HTTP_PORT,
            target_port: Some(PROXY_PORT),
        },
        DataPlaneServicePort {
            name: Some("https".to_string()),
            port: DEFAULT_HTTPS_PORT,
            target_port: Some(PROXY_SSL_PORT),
        },
    ]
}

/// KONG_PORT_MAPS value for the given ingress ports, e.g. "80:8000, 443:8443".
pub fn port_maps(ports: &[DataPlaneServicePort]) -> String {
    ports
        .iter()
        .map(|p| format!("{}:{}", p.port, p.target()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Environment every proxy container gets unless the pod template overrides a
/// variable by name.
pub fn proxy_defaults(ports: &[DataPlaneServicePort]) -> Vec<EnvVar> {
    let cert_path = |file: &str| format!("{CLUSTER_CERTIFICATE_PATH}/{file}");
    vec![
        env("KONG_DATABASE", "off"),
        env(
            KONG_PROXY_LISTEN,
            format!(
                "0.0.0.0:{PROXY_PORT} reuseport backlog=16384, 0.0.0.0:{PROXY_SSL_PORT} http2 ssl reuseport backlog=16384"
            ),
        ),
        env(
            KONG_ADMIN_LISTEN,
            format!("0.0.0.0:{ADMIN_API_PORT} http2 ssl reuseport backlog=16384"),
        ),
        env(KONG_STATUS_LISTEN, format!("0.0.0.0:{STATUS_PORT}")),
        env(KONG_PORT_MAPS, port_maps(ports)),
        env("KONG_ADMIN_SSL_CERT", cert_path(TLS_CERT_KEY)),
        env("KONG_ADMIN_SSL_CERT_KEY", cert_path(TLS_KEY_KEY)),
        env("KONG_NGINX_ADMIN_SSL_VERIFY_CLIENT", "on"),
        env("KONG_NGINX_ADMIN_SSL_CLIENT_CERTIFICATE", cert_path(CA_CERT_KEY)),
        env("KONG_ADMIN_ACCESS_LOG", "/dev/stdout"),
        env("KONG_ADMIN_ERROR_LOG", "/dev/stderr"),
        env("KONG_PROXY_ACCESS_LOG", "/dev/stdout"),
        env("KONG_PROXY_ERROR_LOG", "/dev/stderr"),
        env("KONG_NGINX_WORKER_PROCESSES", "2"),
        env(KONG_PLUGINS, "bundled"),
    ]
}

/// Ports named in a Kong listen directive such as
/// "0.0.0.0:8000 reuseport, [::]:8443 http2 ssl".
pub fn listen_ports(listen: &str) -> Vec<i32> {
    let mut ports: Vec<i32> = listen
        .split(',')
        .filter_map(|entry| {
            let address = entry.split_whitespace().next()?;
            address.rsplit(':').next()?.parse().ok()
        })
        .collect();
    ports.dedup();
    ports
}

/// Parses a KONG_PORT_MAPS value into (service port, container port) pairs.
pub fn parse_port_maps(value: &str) -> Vec<(i32, i32)> {
    value
        .split(',')
        .filter_map(|pair| {
            let (port, target) = pair.trim().split_once(':')?;
            Some((port.trim().parse().ok()?, target.trim().parse().ok()?))
        })
        .collect()
}

/// Checks that KONG_PORT_MAPS agrees with the ingress Service ports. Returns a
/// description of the mismatch, if any.
pub fn check_port_maps(port_maps: &str, ports: &[DataPlaneServicePort]) -> Option<String> {
    let mut configured = parse_port_maps(port_maps);
    let mut expected: Vec<(i32, i32)> = ports.iter().map(|p| (p.port, p.target())).collect();
    configured.sort_unstable();
    expected.sort_unstable();
    if configured == expected {
        return None;
    }
    Some(format!(
        "{KONG_PORT_MAPS} is \"{port_maps}\" but the ingress Service maps \"{}\"",
        self::port_maps(ports)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_port_maps() {
        assert_eq!(port_maps(&default_ingress_ports()), "80:8000, 443:8443");
    }

    #[test]
    fn listen_ports_are_parsed() {
        assert_eq!(
            listen_ports("0.0.0.0:8000 reuseport backlog=16384, 0.0.0.0:8443 http2 ssl reuseport backlog=16384"),
            vec![8000, 8443]
        );
        assert_eq!(listen_ports("[::]:8100"), vec![8100]);
        assert_eq!(listen_ports("off"), Vec::<i32>::new());
    }

    #[test]
    fn port_map_mismatch_is_reported() {
        let ports = default_ingress_ports();
        assert_eq!(check_port_maps("443:8443,80:8000", &ports), None);
        let mismatch = check_port_maps("80:8000", &ports).unwrap();
        assert!(mismatch.contains("443:8443"));
    }
}
