//! Service and instance definitions.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// One backend process serving a service.
///
/// Identity is the whole value: an instance that keeps its name but moves
/// to a new address is a different instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Instance {
    /// Instance name (container name, task id, ...).
    pub name: String,
    /// Address the instance accepts connections on.
    pub address: SocketAddr,
}

impl Instance {
    /// Create a new instance.
    pub fn new(name: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            name: name.into(),
            address,
        }
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.address)
    }
}

/// Relay strategy selected by a service's protocol tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protocol {
    /// Byte-exact TCP splice.
    Tcp,
    /// HTTP/1.x exchange-aware relay.
    Http,
    /// A tag nobody understands; relayed as TCP.
    Unknown(String),
}

impl Protocol {
    /// Parse a protocol tag. The empty tag means TCP.
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "" | "tcp" => Protocol::Tcp,
            "http" => Protocol::Http,
            other => Protocol::Unknown(other.to_string()),
        }
    }

    /// Label used in events and logs.
    pub fn as_str(&self) -> &str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Http => "http",
            Protocol::Unknown(tag) => tag,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a service as published by the control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Protocol tag (`""`, `"tcp"` or `"http"`).
    #[serde(default)]
    pub protocol: String,

    /// Virtual address clients connect to, if one has been assigned.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<SocketAddr>,

    /// Current instances.
    #[serde(default)]
    pub instances: Vec<Instance>,
}

impl Service {
    /// Parsed protocol tag.
    pub fn protocol(&self) -> Protocol {
        Protocol::from_tag(&self.protocol)
    }

    /// Instances as a set, for membership comparisons.
    pub fn instance_set(&self) -> HashSet<&Instance> {
        self.instances.iter().collect()
    }

    /// Check the snapshot for instances the balancer cannot dial.
    pub fn validate(&self) -> Result<(), ModelError> {
        for inst in &self.instances {
            if inst.name.is_empty() {
                return Err(ModelError::InvalidInstance {
                    name: inst.name.clone(),
                    reason: "empty name".to_string(),
                });
            }
            if inst.address.port() == 0 {
                return Err(ModelError::InvalidInstance {
                    name: inst.name.clone(),
                    reason: "port 0".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// A change to one service.
///
/// `service == None` deletes the service. `reset` is set on the first update
/// of a delivery that carries the complete set of services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceUpdate {
    pub name: String,

    #[serde(default)]
    pub service: Option<Service>,

    #[serde(default)]
    pub reset: bool,
}

impl ServiceUpdate {
    /// An update that creates or replaces a service.
    pub fn upsert(name: impl Into<String>, service: Service) -> Self {
        Self {
            name: name.into(),
            service: Some(service),
            reset: false,
        }
    }

    /// An update that deletes a service.
    pub fn delete(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service: None,
            reset: false,
        }
    }

    /// Mark this update as the start of a full snapshot.
    pub fn with_reset(mut self) -> Self {
        self.reset = true;
        self
    }
}

/// Decode one delivery from a line of JSON.
///
/// A line holds either a single update or an array of updates.
pub fn parse_delivery(line: &str) -> Result<Vec<ServiceUpdate>, ModelError> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    let updates: Vec<ServiceUpdate> = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        vec![serde_json::from_value(value)?]
    };

    for update in &updates {
        if update.name.is_empty() {
            return Err(ModelError::MissingName);
        }
        if let Some(service) = &update.service {
            service.validate()?;
        }
    }

    Ok(updates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_from_tag() {
        assert_eq!(Protocol::from_tag(""), Protocol::Tcp);
        assert_eq!(Protocol::from_tag("tcp"), Protocol::Tcp);
        assert_eq!(Protocol::from_tag("HTTP"), Protocol::Http);
        assert_eq!(
            Protocol::from_tag("grpc"),
            Protocol::Unknown("grpc".to_string())
        );
    }

    #[test]
    fn test_parse_single_update() {
        let line = r#"{"name":"web","service":{"protocol":"http","address":"10.1.0.1:80","instances":[{"name":"web-1","address":"172.17.0.2:8080"}]}}"#;
        let updates = parse_delivery(line).unwrap();
        assert_eq!(updates.len(), 1);

        let svc = updates[0].service.as_ref().unwrap();
        assert_eq!(svc.protocol(), Protocol::Http);
        assert_eq!(svc.address, Some("10.1.0.1:80".parse().unwrap()));
        assert_eq!(svc.instances[0].name, "web-1");
        assert!(!updates[0].reset);
    }

    #[test]
    fn test_parse_snapshot_delivery() {
        let line = r#"[{"name":"a","service":{},"reset":true},{"name":"b","service":null}]"#;
        let updates = parse_delivery(line).unwrap();
        assert_eq!(updates.len(), 2);
        assert!(updates[0].reset);
        assert_eq!(updates[0].service, Some(Service::default()));
        assert!(updates[1].service.is_none());
    }

    #[test]
    fn test_parse_rejects_port_zero() {
        let line = r#"{"name":"a","service":{"instances":[{"name":"i","address":"10.0.0.1:0"}]}}"#;
        assert!(matches!(
            parse_delivery(line),
            Err(ModelError::InvalidInstance { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_missing_name() {
        assert!(matches!(
            parse_delivery(r#"{"name":""}"#),
            Err(ModelError::MissingName)
        ));
        assert!(matches!(
            parse_delivery("not json"),
            Err(ModelError::Malformed(_))
        ));
    }

    #[test]
    fn test_instance_identity_includes_address() {
        let a = Instance::new("i", "10.0.0.1:80".parse().unwrap());
        let b = Instance::new("i", "10.0.0.2:80".parse().unwrap());
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "i@10.0.0.1:80");
    }
}
