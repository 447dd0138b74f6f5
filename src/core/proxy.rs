//! # Proxy Router
//!
//! Longest-prefix reverse proxy. The [`RouteTable`] is built once at startup,
//! sorted so that the most specific source prefix is always tried first, and
//! then shared read-only by every listener.
//!
//! Requests are forwarded with `reqwest`; upstream redirects are passed back to
//! the client unchanged and hop-by-hop headers never cross the proxy.

use crate::{constants::MAX_PROXY_BODY_BYTES, core::config_loader::ConfigError, models::RouteConfig};
use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Url;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;

lazy_static! {
    static ref REPEATED_SLASHES: Regex = Regex::new(r"/{2,}").expect("slash pattern is valid");
}

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
static X_POWERED_BY: HeaderName = HeaderName::from_static("x-powered-by");

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("failed to read the request body: {0}")]
    Body(#[source] axum::Error),
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

/// The scheme a listener accepts connections on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- ROUTE TABLE ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub name: String,
    pub source: String,
    pub target: Url,
}

/// Routes sorted by descending source length.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Parses every route target and sorts the table.
    ///
    /// Equal-length sources are ordered by source text and then by route name, so
    /// the result never depends on the order routes are supplied in.
    ///
    /// # Errors
    /// [`ConfigError::InvalidRouteTarget`] for a target that is not an absolute
    /// `http`/`https` URL with a host.
    pub fn build<I, N>(routes: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (N, RouteConfig)>,
        N: Into<String>,
    {
        let mut parsed = routes
            .into_iter()
            .map(|(name, config)| parse_route(name.into(), config))
            .collect::<Result<Vec<_>, _>>()?;

        parsed.sort_by(|a, b| {
            b.source
                .len()
                .cmp(&a.source.len())
                .then_with(|| a.source.cmp(&b.source))
                .then_with(|| a.name.cmp(&b.name))
        });

        for route in &parsed {
            log::debug!("Route '{}': {} -> {}", route.name, route.source, route.target);
        }
        Ok(Self { routes: parsed })
    }

    /// The first (most specific) route whose source prefixes `path`.
    pub fn resolve(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|route| path.starts_with(&route.source))
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn parse_route(name: String, config: RouteConfig) -> Result<Route, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidRouteTarget {
        name: name.clone(),
        target: config.target.clone(),
        reason,
    };

    let target = Url::parse(config.target.trim()).map_err(|e| invalid(e.to_string()))?;
    if !matches!(target.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", target.scheme())));
    }
    if target.host_str().is_none_or(str::is_empty) {
        return Err(invalid("URL has no host".to_string()));
    }

    Ok(Route {
        name,
        source: config.source,
        target,
    })
}

// --- REWRITING ---

/// Maps a request path onto the target's base path.
///
/// The matched `source` prefix is removed and the remainder appended to
/// `target_base`, with runs of `/` collapsed.
pub fn rewrite_path(source: &str, target_base: &str, path: &str) -> String {
    let suffix = path.strip_prefix(source).unwrap_or(path);
    let suffix = suffix.strip_prefix('/').unwrap_or(suffix);
    let base = target_base.trim_end_matches('/');

    let joined = if base.is_empty() {
        format!("/{suffix}")
    } else {
        format!("{base}/{suffix}")
    };
    REPEATED_SLASHES.replace_all(&joined, "/").into_owned()
}

/// The full upstream URL for a request, query string included.
pub fn upstream_url(route: &Route, path: &str, query: Option<&str>) -> Url {
    let mut url = route.target.clone();
    url.set_path(&rewrite_path(&route.source, route.target.path(), path));
    url.set_query(query);
    url
}

/// Removes hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in HOP_BY_HOP.iter().copied().chain(listed.iter().map(String::as_str)) {
        headers.remove(name);
    }
}

/// Builds the headers sent upstream for an inbound request.
pub fn forwarded_request_headers(
    inbound: &HeaderMap,
    client_ip: Option<IpAddr>,
    scheme: Scheme,
    target: &Url,
) -> HeaderMap {
    let mut headers = inbound.clone();
    strip_hop_by_hop(&mut headers);

    if let Some(host) = inbound.get(header::HOST) {
        headers.insert(X_FORWARDED_HOST.clone(), host.clone());
    }

    if let Some(ip) = client_ip {
        let forwarded_for = match inbound
            .get(&X_FORWARDED_FOR)
            .and_then(|value| value.to_str().ok())
        {
            Some(existing) if !existing.trim().is_empty() => format!("{existing}, {ip}"),
            _ => ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert(X_FORWARDED_FOR.clone(), value);
        }
    }

    headers.insert(
        X_FORWARDED_PROTO.clone(),
        HeaderValue::from_static(scheme.as_str()),
    );

    headers.remove(header::HOST);
    if let Some(host) = target.host_str() {
        let authority = match target.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&authority) {
            headers.insert(header::HOST, value);
        }
    }
    headers
}

// --- HTTP SURFACE ---

/// The upstream client. Redirects are returned to the caller, never followed.
pub fn client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
}

#[derive(Debug, Clone)]
struct ProxyState {
    table: Arc<RouteTable>,
    client: reqwest::Client,
    scheme: Scheme,
}

/// An axum router that proxies every request through `table`.
pub fn router(table: Arc<RouteTable>, client: reqwest::Client, scheme: Scheme) -> Router {
    Router::new().fallback(dispatch).with_state(ProxyState {
        table,
        client,
        scheme,
    })
}

async fn dispatch(State(state): State<ProxyState>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    let Some(route) = state.table.resolve(&path) else {
        log::debug!("No route matches '{}'", path);
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    };

    match forward(&state, route, request).await {
        Ok(response) => response,
        Err(ProxyError::Body(e)) => {
            log::warn!("[{}] rejected request for '{}': {}", route.name, path, e);
            (StatusCode::BAD_REQUEST, "Bad Request").into_response()
        }
        Err(e) => {
            log::warn!("[{}] {} for '{}'", route.name, e, path);
            (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
        }
    }
}

async fn forward(
    state: &ProxyState,
    route: &Route,
    request: Request,
) -> Result<Response, ProxyError> {
    let (parts, body) = request.into_parts();
    let client_ip = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let url = upstream_url(route, parts.uri.path(), parts.uri.query());
    let headers = forwarded_request_headers(&parts.headers, client_ip, state.scheme, &route.target);
    let body = axum::body::to_bytes(body, MAX_PROXY_BODY_BYTES)
        .await
        .map_err(ProxyError::Body)?;

    log::debug!("[{}] {} {} -> {}", route.name, parts.method, parts.uri, url);
    let upstream = state
        .client
        .request(parts.method, url)
        .headers(headers)
        .body(body)
        .send()
        .await?;

    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    strip_hop_by_hop(&mut response_headers);
    response_headers.remove(&X_POWERED_BY);

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        http::{Method, Uri},
        response::Redirect,
        routing::get,
    };
    use http_body_util::BodyExt;
    use std::net::Ipv4Addr;
    use tower::ServiceExt;

    fn route(source: &str, target: &str) -> RouteConfig {
        RouteConfig {
            source: source.to_string(),
            target: target.to_string(),
        }
    }

    fn sources(table: &RouteTable) -> Vec<&str> {
        table.routes().iter().map(|r| r.source.as_str()).collect()
    }

    #[test]
    fn test_longest_prefix_wins_regardless_of_order() {
        let forward = vec![
            ("api", route("/api/", "http://localhost:3000")),
            ("v2", route("/api/v2/", "http://localhost:3002")),
            ("root", route("/", "http://localhost:8000")),
        ];
        let mut backward = forward.clone();
        backward.reverse();

        for routes in [forward, backward] {
            let table = RouteTable::build(routes).unwrap();
            assert_eq!(sources(&table), vec!["/api/v2/", "/api/", "/"]);
            assert_eq!(table.resolve("/api/v2/users").unwrap().name, "v2");
            assert_eq!(table.resolve("/api/v1/users").unwrap().name, "api");
            assert_eq!(table.resolve("/assets/x.js").unwrap().name, "root");
        }
    }

    #[test]
    fn test_equal_length_ties_are_deterministic() {
        let a = vec![
            ("zeta", route("/b/", "http://b")),
            ("alpha", route("/a/", "http://a")),
            ("beta", route("/a/", "http://a2")),
        ];
        let mut b = a.clone();
        b.rotate_left(1);

        let names = |table: RouteTable| -> Vec<String> {
            table.routes().iter().map(|r| r.name.clone()).collect()
        };
        let first = names(RouteTable::build(a).unwrap());
        let second = names(RouteTable::build(b).unwrap());
        assert_eq!(first, vec!["alpha", "beta", "zeta"]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_invalid_targets_abort_the_build() {
        for target in ["not a url", "file:///etc/passwd", "localhost:3000"] {
            let err = RouteTable::build([("bad", route("/x/", target))]).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidRouteTarget { ref name, .. } if name == "bad"),
                "{target}: {err}"
            );
        }
    }

    #[test]
    fn test_no_match_resolves_to_none() {
        let table = RouteTable::build([("api", route("/api/", "http://localhost:3000"))]).unwrap();
        assert!(table.resolve("/other").is_none());
        assert!(table.resolve("/api").is_none());
    }

    #[test]
    fn test_rewrite_path() {
        assert_eq!(rewrite_path("/api/", "/svc", "/api/v2/x"), "/svc/v2/x");
        assert_eq!(rewrite_path("/api/", "/", "/api/v2/x"), "/v2/x");
        assert_eq!(rewrite_path("/api/", "/svc/", "/api/"), "/svc/");
        assert_eq!(rewrite_path("/api", "/svc", "/api//deep//path"), "/svc/deep/path");
        assert_eq!(rewrite_path("/", "", "/"), "/");
    }

    #[test]
    fn test_upstream_url_keeps_query() {
        let table = RouteTable::build([("api", route("/api/", "http://host:3000/svc"))]).unwrap();
        let route = table.resolve("/api/items").unwrap();
        let url = upstream_url(route, "/api/items", Some("page=2&q=a%20b"));
        assert_eq!(url.as_str(), "http://host:3000/svc/items?page=2&q=a%20b");
        assert_eq!(upstream_url(route, "/api/items", None).query(), None);
    }

    #[test]
    fn test_forwarded_request_headers() {
        let mut inbound = HeaderMap::new();
        inbound.insert(header::HOST, HeaderValue::from_static("example.test"));
        inbound.insert(X_FORWARDED_FOR.clone(), HeaderValue::from_static("1.1.1.1"));
        inbound.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-session"));
        inbound.insert("x-session", HeaderValue::from_static("secret"));
        inbound.insert(header::TE, HeaderValue::from_static("trailers"));
        inbound.insert(header::ACCEPT, HeaderValue::from_static("text/html"));

        let target = Url::parse("http://backend:3000/svc").unwrap();
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));
        let headers = forwarded_request_headers(&inbound, Some(ip), Scheme::Https, &target);

        assert_eq!(headers[header::HOST], "backend:3000");
        assert_eq!(headers[&X_FORWARDED_HOST], "example.test");
        assert_eq!(headers[&X_FORWARDED_FOR], "1.1.1.1, 10.0.0.7");
        assert_eq!(headers[&X_FORWARDED_PROTO], "https");
        assert_eq!(headers[header::ACCEPT], "text/html");
        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get(header::TE).is_none());
        assert!(headers.get("x-session").is_none());
    }

    #[test]
    fn test_forwarded_host_omits_default_port() {
        let target = Url::parse("https://backend/").unwrap();
        let headers = forwarded_request_headers(&HeaderMap::new(), None, Scheme::Http, &target);
        assert_eq!(headers[header::HOST], "backend");
        assert_eq!(headers[&X_FORWARDED_PROTO], "http");
        assert!(headers.get(&X_FORWARDED_FOR).is_none());
    }

    // --- Router tests against a real upstream ---

    async fn echo(headers: HeaderMap, uri: Uri) -> impl IntoResponse {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-")
                .to_string()
        };
        (
            [(X_POWERED_BY.clone(), HeaderValue::from_static("upstream"))],
            format!(
                "{} host={} xff={} proto={}",
                uri,
                header("host"),
                header("x-forwarded-for"),
                header("x-forwarded-proto")
            ),
        )
    }

    async fn spawn_upstream() -> SocketAddr {
        let app = Router::new()
            .route("/svc/moved", get(|| async { Redirect::temporary("/elsewhere") }))
            .fallback(echo);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        addr
    }

    fn proxy_for(target: &str) -> Router {
        let table = RouteTable::build([("api", route("/api/", target))]).unwrap();
        router(Arc::new(table), client().unwrap(), Scheme::Http)
    }

    fn request(uri: &str) -> Request {
        let mut request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(header::HOST, "proxy.test")
            .body(Body::empty())
            .unwrap();
        request.extensions_mut().insert(ConnectInfo(SocketAddr::from((
            Ipv4Addr::new(10, 0, 0, 7),
            50000,
        ))));
        request
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_unmatched_request_is_not_found() {
        let app = router(
            Arc::new(RouteTable::default()),
            client().unwrap(),
            Scheme::Http,
        );
        let response = app.oneshot(request("/anything")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_empty_route_configuration_answers_not_found() {
        let table = RouteTable::build(Vec::<(String, RouteConfig)>::new()).unwrap();
        assert!(table.is_empty());

        let app = router(Arc::new(table), client().unwrap(), Scheme::Http);
        for path in ["/", "/api/users", "/static/app.js"] {
            let response = app.clone().oneshot(request(path)).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
    }

    #[tokio::test]
    async fn test_request_is_forwarded_and_rewritten() {
        let upstream = spawn_upstream().await;
        let app = proxy_for(&format!("http://{upstream}/svc"));

        let response = app.oneshot(request("/api/v2/x?q=1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(&X_POWERED_BY).is_none());

        let body = body_text(response).await;
        assert!(body.starts_with("/svc/v2/x?q=1 "), "{body}");
        assert!(body.contains(&format!("host={upstream}")), "{body}");
        assert!(body.contains("xff=10.0.0.7"), "{body}");
        assert!(body.contains("proto=http"), "{body}");
    }

    #[tokio::test]
    async fn test_upstream_redirects_are_passed_through() {
        let upstream = spawn_upstream().await;
        let app = proxy_for(&format!("http://{upstream}/svc"));

        let response = app.oneshot(request("/api/moved")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(response.headers()[header::LOCATION], "/elsewhere");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        // Bind then drop to obtain a port nothing listens on.
        let closed = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let app = proxy_for(&format!("http://{closed}"));
        let response = app.oneshot(request("/api/x")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
