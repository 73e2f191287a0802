//! Externally reachable address of a tier.

use dbop_core::{Component, PodSpec};
use dbop_kubehub::Platform;
use tracing::debug;

use crate::{StatusError, StatusResult};

/// `<service>.<namespace>`; needs no platform lookup.
pub fn internal_host(component: &Component, namespace: &str) -> String {
    format!("{}.{}", component.service_name(), namespace)
}

/// Resolve the address clients should use for `component`.
///
/// Internal exposure is plain name formatting. Load-balanced exposure reads the
/// Service and takes its first ingress point, hostname before IP. A missing
/// Service or one without ingress yields [`StatusError::LoadBalancerNotReady`].
pub async fn app_host(platform: &dyn Platform, component: &Component, namespace: &str, pod_spec: &PodSpec) -> StatusResult<String> {
    if !pod_spec.is_load_balanced() {
        return Ok(internal_host(component, namespace));
    }

    let svc_name = component.service_name();
    let ingress = platform
        .get_service(namespace, &svc_name)
        .await?
        .and_then(|svc| svc.status)
        .and_then(|st| st.load_balancer)
        .and_then(|lb| lb.ingress)
        .and_then(|points| points.into_iter().next());

    let Some(point) = ingress else {
        debug!(service = %svc_name, ns = %namespace, "host: no ingress yet");
        return Err(StatusError::LoadBalancerNotReady(svc_name));
    };
    match (point.hostname.filter(|h| !h.is_empty()), point.ip.filter(|ip| !ip.is_empty())) {
        (Some(hostname), _) => Ok(hostname),
        (None, Some(ip)) => Ok(ip),
        (None, None) => Err(StatusError::LoadBalancerNotReady(svc_name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbop_core::{ServiceType, Tier};
    use dbop_kubehub::MemoryPlatform;
    use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, Service, ServiceStatus};

    fn lb_spec() -> PodSpec {
        PodSpec { service_type: ServiceType::LoadBalancer, ..PodSpec::new(3) }
    }

    fn service(name: &str, ingress: Vec<LoadBalancerIngress>) -> Service {
        let mut svc = Service::default();
        svc.metadata.name = Some(name.into());
        svc.metadata.namespace = Some("pxc".into());
        svc.status = Some(ServiceStatus {
            load_balancer: Some(LoadBalancerStatus { ingress: Some(ingress), ..Default::default() }),
            ..Default::default()
        });
        svc
    }

    #[tokio::test]
    async fn internal_exposure_is_name_dot_namespace() {
        let mp = MemoryPlatform::new();
        mp.fail_reads(Some("must not be called"));
        let c = Component::new(Tier::HaProxy, "cr-mock");
        let first = app_host(&mp, &c, "pxc", &PodSpec::new(3)).await.unwrap();
        let second = app_host(&mp, &c, "pxc", &PodSpec::new(3)).await.unwrap();
        assert_eq!(first, "cr-mock-haproxy.pxc");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn ingress_without_address_is_not_ready() {
        let mp = MemoryPlatform::new();
        mp.add_service(service("cr-mock-haproxy", vec![LoadBalancerIngress::default()]));
        let c = Component::new(Tier::HaProxy, "cr-mock");
        let err = app_host(&mp, &c, "pxc", &lb_spec()).await.unwrap_err();
        assert!(err.is_transitional());
    }

    #[tokio::test]
    async fn only_first_ingress_point_is_used() {
        let mp = MemoryPlatform::new();
        let first = LoadBalancerIngress { ip: Some("10.0.0.1".into()), ..Default::default() };
        let second = LoadBalancerIngress { hostname: Some("lb.example".into()), ..Default::default() };
        mp.add_service(service("cr-mock-haproxy", vec![first, second]));
        let c = Component::new(Tier::HaProxy, "cr-mock");
        assert_eq!(app_host(&mp, &c, "pxc", &lb_spec()).await.unwrap(), "10.0.0.1");
    }

    #[tokio::test]
    async fn lookup_failures_propagate() {
        let mp = MemoryPlatform::new();
        mp.fail_reads(Some("connection refused"));
        let c = Component::new(Tier::HaProxy, "cr-mock");
        let err = app_host(&mp, &c, "pxc", &lb_spec()).await.unwrap_err();
        assert!(matches!(err, StatusError::Platform(_)));
    }
}
