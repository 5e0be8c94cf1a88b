//! Cluster observations used for status reporting and reconciliation

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Service};

use crate::models::{DeploymentView, ServicePortView, ServiceView};

/// Read access to the parts of the cluster the console cares about.
///
/// Implemented both by the informer cache and by the direct API client so the
/// reconciler works whether or not the cache is running.
#[async_trait]
pub trait ClusterView: Send + Sync {
    /// Phase of a namespace, `None` when it does not exist
    async fn namespace_phase(&self, namespace: &str) -> anyhow::Result<Option<String>>;

    async fn deployments(&self, namespace: &str) -> anyhow::Result<Vec<Deployment>>;

    async fn services(&self, namespace: &str) -> anyhow::Result<Vec<Service>>;

    async fn nodes(&self) -> anyhow::Result<Vec<Node>>;
}

impl From<&Deployment> for DeploymentView {
    fn from(deployment: &Deployment) -> Self {
        let desired = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(1);
        let status = deployment.status.as_ref();
        let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);
        let available = status.and_then(|s| s.available_replicas).unwrap_or(0);
        let updated = status.and_then(|s| s.updated_replicas).unwrap_or(0);
        let observed = match deployment.metadata.generation {
            Some(generation) => status
                .and_then(|s| s.observed_generation)
                .map_or(false, |seen| seen >= generation),
            None => true,
        };

        let failure = status
            .and_then(|s| s.conditions.as_ref())
            .and_then(|conditions| {
                conditions.iter().find_map(|c| {
                    let failed = (c.type_ == "Progressing" && c.status == "False")
                        || (c.type_ == "ReplicaFailure" && c.status == "True");
                    if !failed {
                        return None;
                    }
                    Some(
                        c.message
                            .clone()
                            .or_else(|| c.reason.clone())
                            .unwrap_or_else(|| c.type_.clone()),
                    )
                })
            });

        DeploymentView {
            name: deployment.metadata.name.clone().unwrap_or_default(),
            desired,
            ready,
            available,
            updated,
            observed,
            failure,
        }
    }
}

impl From<&Service> for ServiceView {
    fn from(service: &Service) -> Self {
        let spec = service.spec.as_ref();

        let ports = spec
            .and_then(|s| s.ports.as_ref())
            .map(|ports| {
                ports
                    .iter()
                    .map(|p| ServicePortView {
                        name: p.name.clone(),
                        port: p.port,
                        node_port: p.node_port,
                        protocol: p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let ingress = service
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .map(|ingress| {
                ingress
                    .iter()
                    .filter_map(|i| i.ip.clone().or_else(|| i.hostname.clone()))
                    .collect()
            })
            .unwrap_or_default();

        ServiceView {
            name: service.metadata.name.clone().unwrap_or_default(),
            service_type: spec
                .and_then(|s| s.type_.clone())
                .unwrap_or_else(|| "ClusterIP".to_string()),
            cluster_ip: spec.and_then(|s| s.cluster_ip.clone()),
            ports,
            ingress,
        }
    }
}

/// Address clients outside the cluster can reach a node on
pub fn node_address(node: &Node) -> Option<String> {
    let addresses = node.status.as_ref()?.addresses.as_ref()?;
    addresses
        .iter()
        .find(|a| a.type_ == "ExternalIP")
        .or_else(|| addresses.iter().find(|a| a.type_ == "InternalIP"))
        .map(|a| a.address.clone())
}

pub fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

/// Externally reachable URLs of a set of services
pub fn service_urls(services: &[ServiceView], nodes: &[Node]) -> Vec<String> {
    let node_ip = nodes
        .iter()
        .filter(|n| node_is_ready(n))
        .find_map(node_address);

    let mut urls = Vec::new();
    for service in services {
        match service.service_type.as_str() {
            "LoadBalancer" if !service.ingress.is_empty() => {
                for host in &service.ingress {
                    for port in &service.ports {
                        urls.push(format!("http://{}:{}", host, port.port));
                    }
                }
            }
            "LoadBalancer" | "NodePort" => {
                if let Some(ip) = &node_ip {
                    for port in &service.ports {
                        if let Some(node_port) = port.node_port {
                            urls.push(format!("http://{}:{}", ip, node_port));
                        }
                    }
                }
            }
            _ => {}
        }
    }
    urls
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_deployment_view_readiness() {
        let view = DeploymentView::from(&deployment("ns", "web", 3, 2));
        assert_eq!(view.name, "web");
        assert_eq!(view.desired, 3);
        assert!(!view.is_ready());
        assert!(view.failure.is_none());

        let view = DeploymentView::from(&deployment("ns", "web", 3, 3));
        assert!(view.is_ready());
    }

    #[test]
    fn test_deployment_view_waits_for_new_generation() {
        let view = DeploymentView::from(&stale_deployment("ns", "web", 2));
        assert_eq!(view.ready, 2);
        assert!(!view.observed);
        assert!(!view.is_ready());
    }

    #[test]
    fn test_deployment_view_waits_for_updated_replicas() {
        let mut d = deployment("ns", "web", 2, 2);
        if let Some(status) = d.status.as_mut() {
            status.updated_replicas = Some(1);
        }
        let view = DeploymentView::from(&d);
        assert!(view.observed);
        assert_eq!(view.updated, 1);
        assert!(!view.is_ready());
    }

    #[test]
    fn test_deployment_view_failure() {
        let view = DeploymentView::from(&failed_deployment("ns", "web", "deadline exceeded"));
        assert_eq!(view.failure.as_deref(), Some("deadline exceeded"));
    }

    #[test]
    fn test_service_view() {
        let view = ServiceView::from(&service("ns", "web", "NodePort", 80, Some(30080)));
        assert_eq!(view.service_type, "NodePort");
        assert_eq!(view.ports[0].node_port, Some(30080));
        assert_eq!(view.ports[0].protocol, "TCP");
    }

    #[test]
    fn test_service_urls() {
        let nodes = vec![node("down", "10.0.0.1", false), node("up", "10.0.0.2", true)];
        let services = vec![
            ServiceView::from(&service("ns", "internal", "ClusterIP", 80, None)),
            ServiceView::from(&service("ns", "web", "NodePort", 80, Some(30080))),
            ServiceView::from(&load_balancer("ns", "lb", "203.0.113.7", 443)),
        ];

        let urls = service_urls(&services, &nodes);
        assert_eq!(
            urls,
            vec![
                "http://10.0.0.2:30080".to_string(),
                "http://203.0.113.7:443".to_string()
            ]
        );
    }

    #[test]
    fn test_service_urls_without_ready_nodes() {
        let nodes = vec![node("down", "10.0.0.1", false)];
        let services = vec![ServiceView::from(&service("ns", "web", "NodePort", 80, Some(30080)))];
        assert!(service_urls(&services, &nodes).is_empty());
    }
}
