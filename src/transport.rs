use crate::errors::{EndpointsNotFound, NoIpAddress};
use crate::registry::EndpointsRegistry;
use anyhow::Context;
use http::uri::PathAndQuery;
use http::{Request, Uri};
use rand::Rng;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tower::{Layer, Service};

const SCHEME_PREFIX: &str = "kube-";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Layers [`KubeTransport`] onto an HTTP client service.
#[derive(Clone)]
pub struct KubeTransportLayer {
    registry: Arc<EndpointsRegistry>,
}

// === impl KubeTransportLayer ===

impl KubeTransportLayer {
    pub fn new(registry: Arc<EndpointsRegistry>) -> Self {
        Self { registry }
    }

    /// A layer backed by the in-cluster API client, sweeping idle entries at
    /// the default interval.
    pub fn in_cluster() -> anyhow::Result<Self> {
        Ok(Self::new(EndpointsRegistry::in_cluster(
            crate::DEFAULT_TICK_INTERVAL,
        )?))
    }
}

impl<S> Layer<S> for KubeTransportLayer {
    type Service = KubeTransport<S>;

    fn layer(&self, inner: S) -> Self::Service {
        KubeTransport {
            registry: self.registry.clone(),
            inner,
        }
    }
}

/// Rewrites `kube-*` request URLs to one pod IP before delegating.
///
/// Requests whose scheme carries the `kube-` prefix have their host parsed as
/// `name[.namespace[.svc.cluster.local]][:port]`, resolved through the
/// registry, and rewritten to `<picked-ip>[:port]` with the prefix stripped
/// from the scheme. One IP is picked uniformly at random per call; there are
/// no retries against other IPs. Every other request passes through
/// untouched.
#[derive(Clone)]
pub struct KubeTransport<S> {
    registry: Arc<EndpointsRegistry>,
    inner: S,
}

impl<S, B> Service<Request<B>> for KubeTransport<S>
where
    S: Service<Request<B>> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        let registry = self.registry.clone();
        // The clone swap keeps the readied inner service for this call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move {
            let request = resolve(&registry, request).await?;
            inner.call(request).await.map_err(Into::into)
        })
    }
}

/// Rewrites the request target if its scheme carries the `kube-` prefix.
async fn resolve<B>(
    registry: &EndpointsRegistry,
    request: Request<B>,
) -> Result<Request<B>, BoxError> {
    let Some(scheme) = request
        .uri()
        .scheme_str()
        .and_then(|scheme| scheme.strip_prefix(SCHEME_PREFIX))
    else {
        return Ok(request);
    };
    let scheme = scheme.to_string();
    let authority = request
        .uri()
        .authority()
        .ok_or_else(|| anyhow::anyhow!("request url has no host"))?
        .as_str()
        .to_string();

    let (hostname, port) = split_port(&authority);
    let (name, namespace) = split_locator(hostname);
    let namespace = if namespace.is_empty() {
        registry.default_namespace()
    } else {
        namespace
    };

    let ip_addresses = registry
        .get_ip_addresses(namespace, name)
        .await
        .with_context(|| format!("get ip addresses; hostname={hostname:?}"))?;
    let ip_addresses = match ip_addresses {
        None => {
            return Err(anyhow::Error::new(EndpointsNotFound)
                .context(format!("namespace={namespace:?} endpointsName={name:?}"))
                .into())
        }
        Some(ip_addresses) if ip_addresses.is_empty() => {
            return Err(anyhow::Error::new(NoIpAddress)
                .context(format!("namespace={namespace:?} endpointsName={name:?}"))
                .into())
        }
        Some(ip_addresses) => ip_addresses,
    };

    let ip_address = pick_ip_address(&ip_addresses);
    let request = redirect(request, &scheme, format!("{ip_address}{port}"))?;
    Ok(request)
}

/// Splits a trailing `:port` off at the last colon. IPv6 literals are not
/// part of the hostname grammar.
fn split_port(authority: &str) -> (&str, &str) {
    match authority.rfind(':') {
        Some(colon) => (&authority[..colon], &authority[colon..]),
        None => (authority, ""),
    }
}

/// Parses `name[.namespace[.svc.cluster.local]]` into `(name, namespace)`,
/// leaving the namespace empty when the hostname carries none.
fn split_locator(hostname: &str) -> (&str, &str) {
    let locator = hostname
        .strip_suffix(".svc.cluster.local")
        .unwrap_or(hostname);
    match locator.rfind('.') {
        Some(dot) => (&locator[..dot], &locator[dot + 1..]),
        None => (locator, ""),
    }
}

fn pick_ip_address(ip_addresses: &[String]) -> &str {
    let picked = rand::thread_rng().gen_range(0..ip_addresses.len());
    &ip_addresses[picked]
}

fn redirect<B>(request: Request<B>, scheme: &str, authority: String) -> Result<Request<B>, BoxError> {
    let (mut head, body) = request.into_parts();
    let mut uri = std::mem::take(&mut head.uri).into_parts();
    uri.scheme = Some(scheme.parse().context("parse scheme")?);
    uri.authority = Some(authority.parse().context("parse authority")?);
    if uri.path_and_query.is_none() {
        uri.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    head.uri = Uri::from_parts(uri).context("rebuild request url")?;
    Ok(Request::from_parts(head, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::mock::{endpoints, MockApi};
    use crate::k8s::EndpointsApi;
    use http::Response;
    use parking_lot::Mutex;
    use std::convert::Infallible;
    use std::time::Duration;
    use tower::ServiceExt;

    #[derive(Debug, thiserror::Error)]
    #[error("something wrong")]
    struct SomethingWrong;

    /// Records the URI of every request it receives.
    #[derive(Clone)]
    struct RecordingService(Arc<Mutex<Option<Uri>>>);

    impl Service<Request<()>> for RecordingService {
        type Response = Response<()>;
        type Error = Infallible;
        type Future = std::future::Ready<Result<Response<()>, Infallible>>;

        fn poll_ready(&mut self, _: &mut TaskContext<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, request: Request<()>) -> Self::Future {
            *self.0.lock() = Some(request.uri().clone());
            std::future::ready(Ok(Response::new(())))
        }
    }

    fn transport(api: &Arc<MockApi>) -> (KubeTransport<RecordingService>, Arc<Mutex<Option<Uri>>>) {
        let client: Arc<dyn EndpointsApi> = api.clone();
        let registry = Arc::new(EndpointsRegistry::new(
            client,
            Duration::from_secs(24 * 60 * 60),
        ));
        let forwarded = Arc::new(Mutex::new(None));
        let inner = RecordingService(forwarded.clone());
        (KubeTransportLayer::new(registry).layer(inner), forwarded)
    }

    fn request(url: &str) -> Request<()> {
        Request::builder().uri(url).body(()).unwrap()
    }

    fn chain_contains<T: std::error::Error + 'static>(error: &BoxError) -> bool {
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(error.as_ref());
        while let Some(cause) = current {
            if cause.is::<T>() {
                return true;
            }
            current = cause.source();
        }
        false
    }

    fn chain_text(error: &BoxError) -> String {
        let mut text = error.to_string();
        let mut current: Option<&(dyn std::error::Error + 'static)> =
            error.as_ref().source();
        while let Some(cause) = current {
            text.push_str(": ");
            text.push_str(&cause.to_string());
            current = cause.source();
        }
        text
    }

    #[tokio::test]
    async fn forwards_other_schemes_untouched() {
        let api = MockApi::new("default");
        let (service, forwarded) = transport(&api);

        service.oneshot(request("http://abc.com/")).await.unwrap();

        assert_eq!("http://abc.com/", forwarded.lock().take().unwrap());
        assert_eq!(0, api.get_calls());
    }

    #[tokio::test]
    async fn rewrites_the_host_to_a_pod_ip() {
        let api = MockApi::new("default");
        api.expect_get(|| Ok(Some(endpoints("8910", &[&["1.2.3.4"]]))));
        let (service, forwarded) = transport(&api);

        service.oneshot(request("kube-http://bar.foo/")).await.unwrap();

        assert_eq!("http://1.2.3.4/", forwarded.lock().take().unwrap());
    }

    #[tokio::test]
    async fn preserves_port_path_and_query() {
        let api = MockApi::new("default");
        api.expect_get(|| Ok(Some(endpoints("8910", &[&["1.2.3.4"]]))));
        let (service, forwarded) = transport(&api);

        service
            .oneshot(request("kube-http://bar.foo.svc.cluster.local:2220/p?q=1"))
            .await
            .unwrap();

        assert_eq!(
            "http://1.2.3.4:2220/p?q=1",
            forwarded.lock().take().unwrap()
        );
    }

    #[tokio::test]
    async fn resolves_bare_names_against_the_default_namespace() {
        let api = MockApi::new("hello");
        api.expect_get(|| Ok(None));
        let (service, _forwarded) = transport(&api);

        let error = service
            .oneshot(request("kube-http://world/"))
            .await
            .unwrap_err();

        assert!(chain_contains::<EndpointsNotFound>(&error));
        assert_eq!(
            "namespace=\"hello\" endpointsName=\"world\": endpoints not found",
            chain_text(&error)
        );
    }

    #[tokio::test]
    async fn fails_when_the_endpoints_have_no_addresses() {
        let api = MockApi::new("default");
        api.expect_get(|| Ok(Some(endpoints("8910", &[]))));
        let (service, _forwarded) = transport(&api);

        let error = service
            .oneshot(request("kube-http://bar.foo/"))
            .await
            .unwrap_err();

        assert!(chain_contains::<NoIpAddress>(&error));
        assert!(chain_text(&error)
            .contains("namespace=\"foo\" endpointsName=\"bar\": no ip address"));
    }

    #[tokio::test]
    async fn wraps_resolution_failures_with_the_hostname() {
        let api = MockApi::new("default");
        api.expect_get(|| Err(anyhow::Error::new(SomethingWrong)));
        let (service, _forwarded) = transport(&api);

        let error = service
            .oneshot(request("kube-http://bar.foo.svc.cluster.local:2220/"))
            .await
            .unwrap_err();

        assert!(chain_contains::<SomethingWrong>(&error));
        assert_eq!(
            "get ip addresses; hostname=\"bar.foo.svc.cluster.local\": \
             get endpoints; namespace=\"foo\" endpointsName=\"bar\": something wrong",
            chain_text(&error)
        );
    }

    #[tokio::test]
    async fn picks_every_ip_eventually() {
        let api = MockApi::new("default");
        api.expect_get(|| Ok(Some(endpoints("8910", &[&["1.2.3.4", "5.6.7.8"]]))));
        let (service, forwarded) = transport(&api);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..64 {
            service
                .clone()
                .oneshot(request("kube-http://bar.foo/"))
                .await
                .unwrap();
            seen.insert(forwarded.lock().take().unwrap().host().unwrap().to_string());
        }
        assert_eq!(2, seen.len());
    }

    #[test]
    fn splits_the_port_at_the_last_colon() {
        assert_eq!(("bar.foo", ":8080"), split_port("bar.foo:8080"));
        assert_eq!(("bar.foo", ""), split_port("bar.foo"));
    }

    #[test]
    fn parses_the_locator_grammar() {
        assert_eq!(("bar", ""), split_locator("bar"));
        assert_eq!(("bar", "foo"), split_locator("bar.foo"));
        assert_eq!(("bar", "foo"), split_locator("bar.foo.svc.cluster.local"));
        assert_eq!(("bar.baz", "foo"), split_locator("bar.baz.foo"));
    }
}
