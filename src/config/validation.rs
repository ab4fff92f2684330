//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (load balancers reference existing groups)
//! - Validate value ranges (thresholds >= 1, periods > 0, addresses parse)
//! - Detect duplicate aliases
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: LbConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::{HealthCheckConfig, LbConfig};

/// One semantic problem, located by a dotted field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub fn validate_config(config: &LbConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.event_loops.acceptor_threads == 0 {
        errors.push(ValidationError::new("event_loops.acceptor_threads", "must be at least 1"));
    }
    if config.event_loops.worker_threads == 0 {
        errors.push(ValidationError::new("event_loops.worker_threads", "must be at least 1"));
    }

    validate_health_check("health_check", &config.health_check, &mut errors);

    let mut groups = HashSet::new();
    for (i, group) in config.server_groups.iter().enumerate() {
        let path = format!("server_groups[{}]", i);
        if group.alias.is_empty() {
            errors.push(ValidationError::new(format!("{}.alias", path), "must not be empty"));
        } else if !groups.insert(group.alias.as_str()) {
            errors.push(ValidationError::new(
                format!("{}.alias", path),
                format!("duplicate server group `{}`", group.alias),
            ));
        }
        if let Some(hc) = &group.health_check {
            validate_health_check(&format!("{}.health_check", path), hc, &mut errors);
        }

        let mut servers = HashSet::new();
        for (j, server) in group.servers.iter().enumerate() {
            let spath = format!("{}.servers[{}]", path, j);
            if !servers.insert(server.alias.as_str()) {
                errors.push(ValidationError::new(
                    format!("{}.alias", spath),
                    format!("duplicate server `{}`", server.alias),
                ));
            }
            if server.address.parse::<SocketAddr>().is_err() {
                errors.push(ValidationError::new(
                    format!("{}.address", spath),
                    format!("`{}` is not a socket address", server.address),
                ));
            }
        }
    }

    let mut lbs = HashSet::new();
    for (i, lb) in config.load_balancers.iter().enumerate() {
        let path = format!("load_balancers[{}]", i);
        if !lbs.insert(lb.alias.as_str()) {
            errors.push(ValidationError::new(
                format!("{}.alias", path),
                format!("duplicate load balancer `{}`", lb.alias),
            ));
        }
        if lb.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new(
                format!("{}.bind_address", path),
                format!("`{}` is not a socket address", lb.bind_address),
            ));
        }
        if !groups.contains(lb.backend.as_str()) {
            errors.push(ValidationError::new(
                format!("{}.backend", path),
                format!("unknown server group `{}`", lb.backend),
            ));
        }
        if lb.timeout_ms == 0 {
            errors.push(ValidationError::new(format!("{}.timeout_ms", path), "must be greater than 0"));
        }
        if lb.in_buffer_size == 0 {
            errors.push(ValidationError::new(format!("{}.in_buffer_size", path), "must be greater than 0"));
        }
        if lb.out_buffer_size == 0 {
            errors.push(ValidationError::new(format!("{}.out_buffer_size", path), "must be greater than 0"));
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("`{}` is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_health_check(path: &str, hc: &HealthCheckConfig, errors: &mut Vec<ValidationError>) {
    if hc.timeout_ms == 0 {
        errors.push(ValidationError::new(format!("{}.timeout_ms", path), "must be greater than 0"));
    }
    if hc.period_ms == 0 {
        errors.push(ValidationError::new(format!("{}.period_ms", path), "must be greater than 0"));
    }
    if hc.up == 0 {
        errors.push(ValidationError::new(format!("{}.up", path), "must be at least 1"));
    }
    if hc.down == 0 {
        errors.push(ValidationError::new(format!("{}.down", path), "must be at least 1"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{ServerConfig, ServerGroupConfig, TcpLbConfig};

    fn valid() -> LbConfig {
        let mut config = LbConfig::default();
        config.server_groups.push(ServerGroupConfig {
            alias: "web".into(),
            method: Default::default(),
            health_check: None,
            servers: vec![ServerConfig {
                alias: "a".into(),
                address: "127.0.0.1:3000".into(),
                weight: 10,
            }],
        });
        config.load_balancers.push(TcpLbConfig {
            alias: "lb0".into(),
            bind_address: "127.0.0.1:8080".into(),
            backend: "web".into(),
            timeout_ms: 1000,
            in_buffer_size: 1024,
            out_buffer_size: 1024,
            persist_timeout_ms: 0,
        });
        config
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(validate_config(&valid()).is_ok());
    }

    #[test]
    fn test_reports_all_errors() {
        let mut config = valid();
        config.health_check.up = 0;
        config.server_groups[0].servers[0].address = "nowhere".into();
        config.load_balancers[0].backend = "missing".into();
        config.load_balancers[0].in_buffer_size = 0;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "health_check.up",
                "server_groups[0].servers[0].address",
                "load_balancers[0].backend",
                "load_balancers[0].in_buffer_size",
            ]
        );
    }

    #[test]
    fn test_duplicate_aliases_rejected() {
        let mut config = valid();
        let group = config.server_groups[0].clone();
        config.server_groups.push(group);
        let server = config.server_groups[0].servers[0].clone();
        config.server_groups[0].servers.push(server);

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.contains("duplicate server `a`"));
        assert!(errors[1].message.contains("duplicate server group `web`"));
    }
}
