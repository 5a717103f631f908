use std::ffi::{CStr, CString};
use std::fmt;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ptr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PingError;
use crate::packet::Family;

/// Which address family a session is allowed to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FamilyPreference {
    #[default]
    #[serde(rename = "any")]
    Any,
    #[serde(rename = "ipv4")]
    ForceIpv4,
    #[serde(rename = "ipv6")]
    ForceIpv6,
}

impl FamilyPreference {
    fn accepts(self, addr: &IpAddr) -> bool {
        match self {
            FamilyPreference::Any => true,
            FamilyPreference::ForceIpv4 => addr.is_ipv4(),
            FamilyPreference::ForceIpv6 => addr.is_ipv6(),
        }
    }
}

/// Target address picked at start time; fixed for the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAddress {
    addr: IpAddr,
}

impl ResolvedAddress {
    pub fn new(addr: IpAddr) -> Self {
        Self { addr }
    }

    pub fn family(&self) -> Family {
        Family::of(&self.addr)
    }

    pub fn ip(&self) -> IpAddr {
        self.addr
    }
}

impl fmt::Display for ResolvedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.addr, f)
    }
}

/// First candidate, in resolver order, that the preference allows.
pub fn select<I>(candidates: I, preference: FamilyPreference) -> Option<ResolvedAddress>
where
    I: IntoIterator<Item = IpAddr>,
{
    candidates
        .into_iter()
        .find(|addr| preference.accepts(addr))
        .map(ResolvedAddress::new)
}

/// Addresses for `host` from the system resolver, in the order it returned
/// them. Errors carry the `EAI_*` code.
fn getaddrinfo(host: &str) -> Result<Vec<IpAddr>, (i32, String)> {
    let c_host = CString::new(host)
        .map_err(|_| (libc::EAI_NONAME, "host name contains a NUL byte".to_string()))?;
    // SAFETY: all-zero is a valid `addrinfo` (null pointers, zero integers).
    let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
    hints.ai_family = libc::AF_UNSPEC;
    // One entry per address instead of one per socket type
    hints.ai_socktype = libc::SOCK_DGRAM;

    let mut list: *mut libc::addrinfo = ptr::null_mut();
    // SAFETY: `c_host` and `hints` outlive the call; `list` is freed below.
    let rc = unsafe { libc::getaddrinfo(c_host.as_ptr(), ptr::null(), &hints, &mut list) };
    if rc != 0 {
        let message = if rc == libc::EAI_SYSTEM {
            io::Error::last_os_error().to_string()
        } else {
            // SAFETY: gai_strerror returns a static NUL-terminated string.
            unsafe { CStr::from_ptr(libc::gai_strerror(rc)) }
                .to_string_lossy()
                .into_owned()
        };
        return Err((rc, message));
    }

    let mut addrs = Vec::new();
    let mut entry = list;
    while !entry.is_null() {
        // SAFETY: `entry` is a node of the list getaddrinfo just returned.
        let info = unsafe { &*entry };
        if !info.ai_addr.is_null() {
            match info.ai_family {
                libc::AF_INET => {
                    // SAFETY: AF_INET entries point at a sockaddr_in.
                    let sa = unsafe { &*(info.ai_addr as *const libc::sockaddr_in) };
                    addrs.push(IpAddr::V4(Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr))));
                }
                libc::AF_INET6 => {
                    // SAFETY: AF_INET6 entries point at a sockaddr_in6.
                    let sa = unsafe { &*(info.ai_addr as *const libc::sockaddr_in6) };
                    addrs.push(IpAddr::V6(Ipv6Addr::from(sa.sin6_addr.s6_addr)));
                }
                _ => {}
            }
        }
        entry = info.ai_next;
    }
    // SAFETY: `list` came from a successful getaddrinfo and is freed once.
    unsafe { libc::freeaddrinfo(list) };

    let mut unique = Vec::with_capacity(addrs.len());
    for addr in addrs {
        if !unique.contains(&addr) {
            unique.push(addr);
        }
    }
    Ok(unique)
}

/// Resolves `host` (a name or an address literal) using the system resolver.
pub async fn resolve(
    host: &str,
    preference: FamilyPreference,
) -> Result<ResolvedAddress, PingError> {
    // Literals skip the resolver but still honour the preference
    let candidates: Vec<IpAddr> = if let Ok(ip) = host.parse::<IpAddr>() {
        vec![ip]
    } else {
        let name = host.to_string();
        let lookup = tokio::task::spawn_blocking(move || getaddrinfo(&name))
            .await
            .map_err(|e| PingError::ResolutionFailed {
                host: host.to_string(),
                code: None,
                message: e.to_string(),
            })?;
        lookup.map_err(|(code, message)| PingError::ResolutionFailed {
            host: host.to_string(),
            code: Some(code),
            message,
        })?
    };
    debug!("{} resolved to {:?}", host, candidates);

    select(candidates, preference).ok_or_else(|| PingError::ResolutionFailed {
        host: host.to_string(),
        code: Some(libc::EAI_NONAME),
        message: format!("no address matching {:?}", preference),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(list: &[&str]) -> Vec<IpAddr> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn select_respects_order_and_preference() {
        let candidates = addrs(&["2001:db8::1", "192.0.2.1", "192.0.2.2"]);

        let any = select(candidates.clone(), FamilyPreference::Any).unwrap();
        assert_eq!(any.ip(), candidates[0]);
        assert_eq!(any.family(), Family::V6);

        let v4 = select(candidates.clone(), FamilyPreference::ForceIpv4).unwrap();
        assert_eq!(v4.to_string(), "192.0.2.1");

        assert!(select(addrs(&["192.0.2.1"]), FamilyPreference::ForceIpv6).is_none());
        assert!(select(Vec::new(), FamilyPreference::Any).is_none());
    }

    #[test]
    fn preference_names() {
        let p: FamilyPreference = serde_json::from_str("\"ipv6\"").unwrap();
        assert_eq!(p, FamilyPreference::ForceIpv6);
        assert_eq!(serde_json::to_string(&FamilyPreference::Any).unwrap(), "\"any\"");
    }

    #[tokio::test]
    async fn literal_with_wrong_family_fails() {
        let err = resolve("::1", FamilyPreference::ForceIpv4).await.unwrap_err();
        match err {
            PingError::ResolutionFailed { host, code, .. } => {
                assert_eq!(host, "::1");
                assert_eq!(code, Some(libc::EAI_NONAME));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn localhost_forced_v4_is_dotted_decimal() {
        let addr = resolve("localhost", FamilyPreference::ForceIpv4).await.unwrap();
        assert_eq!(addr.family(), Family::V4);
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.to_string().split('.').count(), 4);
    }

    #[tokio::test]
    async fn unknown_name_fails() {
        let err = resolve("no-such-host.invalid", FamilyPreference::Any)
            .await
            .unwrap_err();
        match err {
            PingError::ResolutionFailed { host, code, message } => {
                assert_eq!(host, "no-such-host.invalid");
                // EAI_NONAME, or EAI_AGAIN without a reachable DNS server
                assert!(matches!(code, Some(c) if c != 0), "code {code:?}");
                assert!(!message.is_empty());
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn name_with_nul_fails_with_eai_code() {
        let err = resolve("bad\0host", FamilyPreference::Any).await.unwrap_err();
        assert_eq!(err.code(), Some(libc::EAI_NONAME));
    }

    #[test]
    fn getaddrinfo_lists_each_address_once() {
        let addrs = getaddrinfo("localhost").unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|a| a.is_loopback()));
        let mut deduped = addrs.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), addrs.len());
    }
}
