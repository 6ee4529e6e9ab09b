use crate::backend::SimpleInput;
use actix_web::dev::ServiceRequest;
use std::future::{ready, Ready};
use std::net::{IpAddr, Ipv6Addr};
use std::time::Duration;

type CustomFn = Box<dyn Fn(&ServiceRequest) -> Result<String, actix_web::Error>>;

pub type SimpleInputFuture = Ready<Result<SimpleInput, actix_web::Error>>;

/// Shared bucket for clients that cannot be identified.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Identifies the client that sent a request.
///
/// Uses the first entry of `X-Forwarded-For`, falling back to the connection peer IP. Requests
/// with neither are all keyed as [UNKNOWN_CLIENT], so they share one quota.
///
/// # Security
///
/// `X-Forwarded-For` is client controlled unless a proxy you control overwrites it.
pub fn client_identifier(req: &ServiceRequest) -> String {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|first| !first.is_empty())
        .map(ToOwned::to_owned)
        .or_else(|| req.peer_addr().map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_owned())
}

/// Utility to create a input function that produces a [SimpleInput].
///
/// You should take care to ensure that you are producing unique keys per backend, e.g. with
/// [SimpleInputFunctionBuilder::custom_key] when several policies share one backend.
pub struct SimpleInputFunctionBuilder {
    interval: Duration,
    max_requests: u64,
    client_key: bool,
    group_ipv6: bool,
    path_key: bool,
    skip_successful_requests: bool,
    skip_failed_requests: bool,
    custom_key: Option<String>,
    custom_fn: Option<CustomFn>,
}

impl SimpleInputFunctionBuilder {
    pub fn new(interval: Duration, max_requests: u64) -> Self {
        Self {
            interval,
            max_requests,
            client_key: false,
            group_ipv6: false,
            path_key: false,
            skip_successful_requests: false,
            skip_failed_requests: false,
            custom_key: None,
            custom_fn: None,
        }
    }

    /// Adds the client identifier to the rate limiting key, see [client_identifier].
    pub fn client_key(mut self) -> Self {
        self.client_key = true;
        self
    }

    /// Group IPv6 client identifiers into a single key per /64.
    pub fn group_ipv6_subnets(mut self) -> Self {
        self.group_ipv6 = true;
        self
    }

    /// Add the request path to the rate limiting key
    pub fn path_key(mut self) -> Self {
        self.path_key = true;
        self
    }

    /// Add a custom component to the rate limiting key
    pub fn custom_key(mut self, key: &str) -> Self {
        self.custom_key = Some(key.to_owned());
        self
    }

    /// Dynamically add a custom component to the rate limiting key
    pub fn custom_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&ServiceRequest) -> Result<String, actix_web::Error> + 'static,
    {
        self.custom_fn = Some(Box::new(f));
        self
    }

    /// Leave successful outcomes out of the success counter.
    pub fn skip_successful_requests(mut self, skip: bool) -> Self {
        self.skip_successful_requests = skip;
        self
    }

    /// Leave failed outcomes out of the failure counter.
    pub fn skip_failed_requests(mut self, skip: bool) -> Self {
        self.skip_failed_requests = skip;
        self
    }

    pub fn build(self) -> impl Fn(&ServiceRequest) -> SimpleInputFuture + 'static {
        move |req| {
            ready((|| {
                let mut components = Vec::new();
                if let Some(custom) = &self.custom_key {
                    components.push(custom.clone());
                }
                if self.client_key {
                    let client = client_identifier(req);
                    if self.group_ipv6 {
                        components.push(ip_key(&client).unwrap_or(client));
                    } else {
                        components.push(client);
                    }
                }
                if self.path_key {
                    components.push(req.path().to_owned());
                }
                if let Some(f) = &self.custom_fn {
                    components.push(f(req)?)
                }
                let key = components.join("-");

                Ok(SimpleInput {
                    interval: self.interval,
                    max_requests: self.max_requests,
                    key,
                    skip_successful_requests: self.skip_successful_requests,
                    skip_failed_requests: self.skip_failed_requests,
                })
            })())
        }
    }
}

// Groups IPv6 addresses together, see:
// https://adam-p.ca/blog/2022/02/ipv6-rate-limiting/
fn ip_key(ip_str: &str) -> Option<String> {
    let ip = ip_str.parse::<IpAddr>().ok()?;
    Some(match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return Some(v4.to_string());
            }
            let s = v6.segments();
            let subnet = Ipv6Addr::new(s[0], s[1], s[2], s[3], 0, 0, 0, 0);
            format!("{}/64", subnet)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;
    use std::net::SocketAddr;

    fn peer() -> SocketAddr {
        "10.0.0.7:52000".parse().unwrap()
    }

    #[test]
    fn test_ip_key() {
        // Check that IPv4 addresses are preserved
        assert_eq!(ip_key("142.250.187.206").unwrap(), "142.250.187.206");
        // Check that IPv4 mapped addresses are preserved
        assert_eq!(ip_key("::FFFF:142.250.187.206").unwrap(), "142.250.187.206");
        // Check that IPv6 addresses are grouped into /64 subnets
        assert_eq!(
            ip_key("2a00:1450:4009:81f::200e").unwrap(),
            "2a00:1450:4009:81f::/64"
        );
        assert!(ip_key("not-an-ip").is_none());
    }

    #[test]
    fn test_identifier_prefers_first_forwarded_entry() {
        let req = TestRequest::default()
            .insert_header(("x-forwarded-for", " 203.0.113.9 , 10.1.1.1"))
            .peer_addr(peer())
            .to_srv_request();
        assert_eq!(client_identifier(&req), "203.0.113.9");
    }

    #[test]
    fn test_identifier_falls_back_to_peer() {
        let req = TestRequest::default().peer_addr(peer()).to_srv_request();
        assert_eq!(client_identifier(&req), "10.0.0.7");

        let req = TestRequest::default()
            .insert_header(("x-forwarded-for", ""))
            .peer_addr(peer())
            .to_srv_request();
        assert_eq!(client_identifier(&req), "10.0.0.7");
    }

    #[test]
    fn test_identifier_unknown() {
        let req = TestRequest::default().to_srv_request();
        assert_eq!(client_identifier(&req), UNKNOWN_CLIENT);
    }

    #[actix_web::test]
    async fn test_key_components() {
        let input_fn = SimpleInputFunctionBuilder::new(Duration::from_secs(60), 5)
            .custom_key("auth")
            .client_key()
            .path_key()
            .skip_successful_requests(true)
            .build();
        let req = TestRequest::with_uri("/login")
            .insert_header(("x-forwarded-for", "198.51.100.4"))
            .to_srv_request();
        let input = input_fn(&req).await.unwrap();
        assert_eq!(input.key, "auth-198.51.100.4-/login");
        assert_eq!(input.max_requests, 5);
        assert!(input.skip_successful_requests);
        assert!(!input.skip_failed_requests);
    }

    #[actix_web::test]
    async fn test_grouped_ipv6_key() {
        let input_fn = SimpleInputFunctionBuilder::new(Duration::from_secs(60), 5)
            .client_key()
            .group_ipv6_subnets()
            .build();
        let req = TestRequest::default()
            .insert_header(("x-forwarded-for", "2a00:1450:4009:81f::200e"))
            .to_srv_request();
        assert_eq!(input_fn(&req).await.unwrap().key, "2a00:1450:4009:81f::/64");

        // Anything unparseable is used verbatim
        let req = TestRequest::default().to_srv_request();
        assert_eq!(input_fn(&req).await.unwrap().key, UNKNOWN_CLIENT);
    }
}
