use crate::policy::{PolicyDescriptor, TimeUnit};
use actix_web::dev::ServiceRequest;
use actix_web::ResponseError;
use std::future::{ready, Ready};
use std::net::{AddrParseError, IpAddr, Ipv6Addr};
use thiserror::Error;

type CustomFn = Box<dyn Fn(&ServiceRequest) -> Result<String, actix_web::Error>>;

pub type PolicyFuture = Ready<Result<Option<PolicyDescriptor>, actix_web::Error>>;

/// Utility to create a policy function that applies one fixed [PolicyDescriptor] shape to
/// every request.
///
/// The limit key is assembled from the enabled components, joined by `-`. If no component is
/// enabled the key is empty, and the policy is not enforced.
///
/// This will not be of any use if you want per-route limits or perform an asynchronous lookup;
/// you should instead write your own policy function.
pub struct PolicyFunctionBuilder {
    limit: u64,
    window: i64,
    unit: TimeUnit,
    scope_id: String,
    real_ip_key: bool,
    peer_ip_key: bool,
    route_key: bool,
    custom_key: Option<String>,
    custom_fn: Option<CustomFn>,
}

impl PolicyFunctionBuilder {
    pub fn new(limit: u64, window: i64, unit: TimeUnit) -> Self {
        Self {
            limit,
            window,
            unit,
            scope_id: String::new(),
            real_ip_key: false,
            peer_ip_key: false,
            route_key: false,
            custom_key: None,
            custom_fn: None,
        }
    }

    /// Count requests under a scope (e.g. an application id) rather than the default namespace.
    pub fn scope(mut self, scope_id: &str) -> Self {
        self.scope_id = scope_id.to_owned();
        self
    }

    /// Adds the client's real IP to the rate limiting key.
    ///
    /// # Security
    ///
    /// This calls
    /// [ConnectionInfo::realip_remote_addr()](actix_web::dev::ConnectionInfo::realip_remote_addr)
    /// internally which is only suitable for Actix applications deployed behind a proxy that you
    /// control.
    ///
    /// # IPv6
    ///
    /// IPv6 addresses will be grouped into a single key per /64
    pub fn real_ip_key(mut self) -> Self {
        self.real_ip_key = true;
        self
    }

    /// Adds the connection peer IP to the rate limiting key.
    ///
    /// # IPv6
    ///
    /// IPv6 addresses will be grouped into a single key per /64
    pub fn peer_ip_key(mut self) -> Self {
        self.peer_ip_key = true;
        self
    }

    /// Add the matched route pattern (e.g. `/echo/{str}`) to the rate limiting key, so that all
    /// requests to one route share a counter.
    ///
    /// Falls back to the request path if no route matches.
    pub fn route_key(mut self) -> Self {
        self.route_key = true;
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

    pub fn build(self) -> impl Fn(&ServiceRequest) -> PolicyFuture + 'static {
        move |req| {
            ready((|| {
                let mut components = Vec::new();
                let info = req.connection_info();
                if let Some(custom) = &self.custom_key {
                    components.push(custom.clone());
                }
                if self.real_ip_key {
                    components.push(ip_key(info.realip_remote_addr())?)
                }
                if self.peer_ip_key {
                    components.push(ip_key(info.peer_addr())?)
                }
                if self.route_key {
                    let route = req.match_pattern().unwrap_or_else(|| req.path().to_owned());
                    components.push(route);
                }
                if let Some(f) = &self.custom_fn {
                    components.push(f(req)?)
                }

                Ok(Some(PolicyDescriptor {
                    scope_id: self.scope_id.clone(),
                    limit_key: components.join("-"),
                    limit: self.limit,
                    window: self.window,
                    unit: Some(self.unit),
                }))
            })())
        }
    }
}

#[derive(Debug, Error)]
enum Error {
    #[error("Unable to parse remote IP address: {0}")]
    InvalidIp(
        #[source]
        #[from]
        AddrParseError,
    ),
    #[error("Remote IP address is unknown")]
    MissingIp,
}

impl ResponseError for Error {}

// Groups IPv6 addresses together, see:
// https://adam-p.ca/blog/2022/02/ipv6-rate-limiting/
fn ip_key(ip_str: Option<&str>) -> Result<String, Error> {
    let ip = ip_str.ok_or(Error::MissingIp)?.parse::<IpAddr>()?;
    Ok(match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return Ok(v4.to_string());
            }
            let [a, b, c, d, ..] = v6.segments();
            format!("{}/64", Ipv6Addr::new(a, b, c, d, 0, 0, 0, 0))
        }
    })
}
