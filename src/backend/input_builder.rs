use crate::backend::SimpleInput;
use actix_web::dev::ServiceRequest;
use actix_web::ResponseError;
use std::future::{ready, Ready};
use std::net::{AddrParseError, IpAddr, Ipv6Addr, SocketAddr};
use thiserror::Error;

pub type SimpleInputFuture = Ready<Result<SimpleInput, actix_web::Error>>;

/// One component of a client key.
enum KeyPart {
    Fixed(String),
    RealIp,
    PeerIp,
    Path,
    Dynamic(Box<dyn Fn(&ServiceRequest) -> Result<String, actix_web::Error>>),
}

/// Builds the input function that names the client each request is counted against.
///
/// The key is made of the parts added, in the order they were added, joined by `-`. Every
/// distinct key gets its own request log, so one backend should only be fed keys built the
/// same way.
#[derive(Default)]
pub struct SimpleInputFunctionBuilder {
    parts: Vec<KeyPart>,
}

impl SimpleInputFunctionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn with(mut self, part: KeyPart) -> Self {
        self.parts.push(part);
        self
    }

    /// Keys clients by the address reported by
    /// [ConnectionInfo::realip_remote_addr()](actix_web::dev::ConnectionInfo::realip_remote_addr).
    ///
    /// That address comes from `Forwarded` / `X-Forwarded-For` when present, which any client
    /// can set. Only use this behind a proxy you control. IPv6 clients share a key per /64.
    pub fn real_ip_key(self) -> Self {
        self.with(KeyPart::RealIp)
    }

    /// Keys clients by the address of the TCP peer. IPv6 clients share a key per /64.
    pub fn peer_ip_key(self) -> Self {
        self.with(KeyPart::PeerIp)
    }

    /// Gives every path its own window.
    pub fn path_key(self) -> Self {
        self.with(KeyPart::Path)
    }

    pub fn custom_key(self, key: &str) -> Self {
        self.with(KeyPart::Fixed(key.to_owned()))
    }

    /// Adds a part computed from the request. An error fails the request.
    pub fn custom_fn<F>(self, f: F) -> Self
    where
        F: Fn(&ServiceRequest) -> Result<String, actix_web::Error> + 'static,
    {
        self.with(KeyPart::Dynamic(Box::new(f)))
    }

    pub fn build(self) -> impl Fn(&ServiceRequest) -> SimpleInputFuture + 'static {
        move |req| ready(self.key_for(req).map(|key| SimpleInput { key }))
    }

    fn key_for(&self, req: &ServiceRequest) -> Result<String, actix_web::Error> {
        let info = req.connection_info();
        let mut key = Vec::with_capacity(self.parts.len());
        for part in &self.parts {
            key.push(match part {
                KeyPart::Fixed(fixed) => fixed.clone(),
                KeyPart::RealIp => ip_key(info.realip_remote_addr().ok_or(Error::MissingAddress)?)?,
                KeyPart::PeerIp => ip_key(info.peer_addr().ok_or(Error::MissingAddress)?)?,
                KeyPart::Path => req.path().to_owned(),
                KeyPart::Dynamic(f) => f(req)?,
            });
        }
        Ok(key.join("-"))
    }
}

#[derive(Debug, Error)]
enum Error {
    #[error("Unable to parse remote IP address: {0}")]
    InvalidIpError(
        #[source]
        #[from]
        AddrParseError,
    ),
    #[error("Remote address is not available for this request")]
    MissingAddress,
}

impl ResponseError for Error {}

/// Key for a client address, with or without a port.
///
/// A single IPv6 host usually owns a whole /64, so the address is cut down to that prefix.
fn ip_key(addr: &str) -> Result<String, Error> {
    let ip = match addr.parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(e) => addr.parse::<SocketAddr>().map_err(|_| e)?.ip(),
    };
    let v6 = match ip {
        IpAddr::V4(v4) => return Ok(v4.to_string()),
        IpAddr::V6(v6) => v6,
    };
    if let Some(v4) = v6.to_ipv4_mapped() {
        return Ok(v4.to_string());
    }
    let [a, b, c, d, ..] = v6.segments();
    Ok(format!("{}/64", Ipv6Addr::new(a, b, c, d, 0, 0, 0, 0)))
}
