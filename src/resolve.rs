use core::net::{IpAddr, SocketAddr};
use std::{collections::HashMap, env, net::ToSocketAddrs};

use anyhow::{anyhow, Context, Error};
use hickory_resolver::{
    config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts},
    Resolver,
};

/// Memoized host/port resolution.
///
/// Translating addresses comes at a cost, so every (host, port) pair is
/// resolved once and cached for the lifetime of the configuration load.
///
/// Nameservers can be overridden with the `NAMESERVER1`, `NAMESERVER2`, ...
/// environment variables, checked in order until the first unset one. With
/// no override in place the system resolver is used.
pub struct AddrCache {
    cache: HashMap<(String, u16), SocketAddr>,
    resolver: Option<Resolver>,
}

impl AddrCache {
    pub fn new() -> Result<Self, Error> {
        let resolver = match nameservers_from_env()? {
            Some(ns) => {
                log::debug!("overriding nameservers: {ns:?}");

                let mut config = ResolverConfig::new();
                for ip in ns {
                    config.add_name_server(NameServerConfig::new(
                        SocketAddr::new(ip, 53),
                        Protocol::Udp,
                    ));
                }

                Some(Resolver::new(config, ResolverOpts::default())?)
            }
            None => None,
        };

        Ok(Self {
            cache: HashMap::new(),
            resolver,
        })
    }

    /// Resolves `host:port` into a socket address, consulting the cache
    /// first.
    pub fn resolve(&mut self, host: &str, port: u16) -> Result<SocketAddr, Error> {
        let key = (host.to_owned(), port);
        if let Some(addr) = self.cache.get(&key) {
            return Ok(*addr);
        }

        let addr = self
            .lookup(host, port)
            .with_context(|| format!("cannot resolve: {host}:{port}"))?;
        self.cache.insert(key, addr);

        Ok(addr)
    }

    fn lookup(&self, host: &str, port: u16) -> Result<SocketAddr, Error> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        match &self.resolver {
            Some(resolver) => {
                let lookup = resolver.lookup_ip(host)?;
                let ip = lookup
                    .iter()
                    .next()
                    .ok_or_else(|| anyhow!("no addresses found for {host}"))?;

                Ok(SocketAddr::new(ip, port))
            }
            None => (host, port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| anyhow!("no addresses found for {host}")),
        }
    }
}

fn nameservers_from_env() -> Result<Option<Vec<IpAddr>>, Error> {
    let mut out = Vec::new();

    for n in 1.. {
        let Ok(v) = env::var(format!("NAMESERVER{n}")) else {
            break;
        };
        let ip = v
            .parse::<IpAddr>()
            .map_err(|_| anyhow!("NAMESERVER{n}: `{v}' is not an IP address"))?;
        out.push(ip);
    }

    Ok(if out.is_empty() { None } else { Some(out) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_addresses_skip_dns() {
        let mut cache = AddrCache::new().unwrap();

        let v4 = cache.resolve("127.0.0.1", 8080).unwrap();
        assert_eq!(v4, "127.0.0.1:8080".parse().unwrap());

        let v6 = cache.resolve("::1", 443).unwrap();
        assert_eq!(v6, "[::1]:443".parse().unwrap());
    }

    #[test]
    fn cache_returns_the_same_address() {
        let mut cache = AddrCache::new().unwrap();

        let a = cache.resolve("localhost", 80).unwrap();
        let b = cache.resolve("localhost", 80).unwrap();
        assert_eq!(a, b);
    }
}
