//! Turning configured endpoints into addresses we can send requests to.

use std::{
    fmt::Debug,
    net::{SocketAddr, ToSocketAddrs},
    sync::Arc,
};

use anyhow::Context;

use crate::{error::ResolveError, retry::RetryPolicy};

/// Something that can produce a `host:port` address to talk to.
pub trait EndpointResolver: Debug + Send + Sync {
    fn resolve(&self) -> Result<String, ResolveError>;
}

/// An address that is already concrete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralEndpoint {
    address: String,
}

impl LiteralEndpoint {
    /// Wrap something that is already in `host:port` form.
    pub fn from_address(address: impl Into<String>) -> Self {
        LiteralEndpoint {
            address: address.into(),
        }
    }
}

impl EndpointResolver for LiteralEndpoint {
    fn resolve(&self) -> Result<String, ResolveError> {
        Ok(self.address.clone())
    }
}

/// An external discovery mechanism mapping a symbolic service name to a
/// concrete host and port.
///
/// Returning `Ok(None)` means the lookup worked but had nothing to offer
/// right now.
pub trait AddressLookup: Debug + Send + Sync {
    fn lookup(&self, name: &str) -> Result<Option<(String, u16)>, anyhow::Error>;
}

/// An [`AddressLookup`] backed by the system resolver.
///
/// Names are expected in `host:port` form and resolve to the first address
/// the system returns.
#[derive(Debug, Default, Clone, Copy)]
pub struct DnsLookup;

impl AddressLookup for DnsLookup {
    fn lookup(&self, name: &str) -> Result<Option<(String, u16)>, anyhow::Error> {
        let mut addresses = name
            .to_socket_addrs()
            .with_context(|| format!("Unable to look up \"{name}\""))?;

        Ok(addresses.next().map(|addr| match addr {
            SocketAddr::V4(v4) => (v4.ip().to_string(), v4.port()),
            SocketAddr::V6(v6) => (format!("[{}]", v6.ip()), v6.port()),
        }))
    }
}

/// Resolves a symbolic name through an [`AddressLookup`], retrying with a
/// jittered pause when the lookup fails or comes back empty.
#[derive(Debug, Clone)]
pub struct IndirectEndpoint {
    name: String,
    lookup: Arc<dyn AddressLookup>,
    policy: RetryPolicy,
}

impl IndirectEndpoint {
    pub fn new(name: impl Into<String>, lookup: Arc<dyn AddressLookup>, policy: RetryPolicy) -> Self {
        IndirectEndpoint {
            name: name.into(),
            lookup,
            policy,
        }
    }
}

impl EndpointResolver for IndirectEndpoint {
    #[tracing::instrument(level = "debug", skip_all, fields(endpoint.name = %self.name))]
    fn resolve(&self) -> Result<String, ResolveError> {
        let attempts = self.policy.max_attempts();
        let mut last = None;

        for attempt in 1..=attempts {
            match self.lookup.lookup(&self.name) {
                Ok(Some((host, port))) if !host.is_empty() && port > 0 => {
                    let address = format!("{host}:{port}");
                    tracing::debug!(%address, attempt, "Resolved endpoint");
                    return Ok(address);
                }
                Ok(_) => {
                    tracing::debug!(attempt, "Lookup returned no usable address");
                }
                Err(e) => {
                    tracing::debug!(attempt, error = &*e, "Lookup failed");
                    last = Some(e);
                }
            }

            if attempt < attempts {
                self.policy.pause();
            }
        }

        tracing::error!(endpoint.name = %self.name, attempts, "Unable to resolve endpoint");

        Err(ResolveError::Resolution {
            name: self.name.clone(),
            attempts,
            last,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[derive(Debug)]
    struct Scripted {
        answers: Mutex<Vec<Result<Option<(String, u16)>, String>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(answers: Vec<Result<Option<(String, u16)>, String>>) -> Self {
            Scripted {
                answers: Mutex::new(answers.into_iter().rev().collect()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl AddressLookup for Scripted {
        fn lookup(&self, _name: &str) -> Result<Option<(String, u16)>, anyhow::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.answers.lock().unwrap().pop() {
                Some(Ok(answer)) => Ok(answer),
                Some(Err(msg)) => Err(anyhow::Error::msg(msg)),
                None => Ok(None),
            }
        }
    }

    #[test]
    fn literal_is_the_identity() {
        let endpoint = LiteralEndpoint::from_address("meta.example.com:443");

        assert_eq!(endpoint.resolve().unwrap(), "meta.example.com:443");
    }

    #[test]
    fn retries_until_an_address_shows_up() {
        let lookup = Arc::new(Scripted::new(vec![
            Err("timed out".to_string()),
            Ok(Some((String::new(), 80))),
            Ok(Some(("10.0.0.7".to_string(), 8080))),
        ]));
        let endpoint = IndirectEndpoint::new("meta", lookup.clone(), RetryPolicy::immediate(5));

        let address = endpoint.resolve().unwrap();

        assert_eq!(address, "10.0.0.7:8080");
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn gives_up_after_the_configured_attempts() {
        let lookup = Arc::new(Scripted::new(vec![
            Err("boom".to_string()),
            Err("boom".to_string()),
            Err("boom".to_string()),
        ]));
        let endpoint = IndirectEndpoint::new("meta", lookup.clone(), RetryPolicy::immediate(3));

        let err = endpoint.resolve().unwrap_err();

        assert!(
            matches!(err, ResolveError::Resolution { ref name, attempts: 3, last: Some(_) } if name == "meta"),
            "{err:?}"
        );
        assert!(err.is_transient());
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn zero_port_is_not_an_answer() {
        let lookup = Arc::new(Scripted::new(vec![Ok(Some(("10.0.0.1".to_string(), 0)))]));
        let endpoint = IndirectEndpoint::new("meta", lookup, RetryPolicy::immediate(1));

        assert!(endpoint.resolve().is_err());
    }

    #[test]
    fn dns_lookup_of_a_literal_ip() {
        let (host, port) = DnsLookup.lookup("127.0.0.1:9000").unwrap().unwrap();

        assert_eq!(host, "127.0.0.1");
        assert_eq!(port, 9000);
    }
}
