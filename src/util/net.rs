//! Local address discovery for test payloads that connect back to the host.

use std::net::Ipv4Addr;

/// Every non-loopback IPv4 address of an interface that is up.
#[cfg(unix)]
pub fn local_ipv4_addresses() -> std::io::Result<Vec<Ipv4Addr>> {
    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: getifaddrs fills `head` with a list we free below.
    if unsafe { libc::getifaddrs(&mut head) } == -1 {
        return Err(std::io::Error::last_os_error());
    }

    let mut addrs = Vec::new();
    let mut cursor = head;
    while !cursor.is_null() {
        // SAFETY: `cursor` is a live node of the list returned by getifaddrs.
        let ifa = unsafe { &*cursor };
        let flags = ifa.ifa_flags as i32;
        if flags & libc::IFF_UP != 0 && flags & libc::IFF_LOOPBACK == 0 {
            if let Some(ip) = sockaddr_to_ipv4(ifa.ifa_addr) {
                if !ip.is_loopback() && !addrs.contains(&ip) {
                    addrs.push(ip);
                }
            }
        }
        cursor = ifa.ifa_next;
    }

    // SAFETY: `head` came from getifaddrs and is freed exactly once.
    unsafe { libc::freeifaddrs(head) };
    Ok(addrs)
}

#[cfg(not(unix))]
pub fn local_ipv4_addresses() -> std::io::Result<Vec<Ipv4Addr>> {
    Ok(Vec::new())
}

#[cfg(unix)]
fn sockaddr_to_ipv4(sockaddr: *const libc::sockaddr) -> Option<Ipv4Addr> {
    if sockaddr.is_null() {
        return None;
    }
    // SAFETY: non-null sockaddr from getifaddrs; the family tells the layout.
    let family = i32::from(unsafe { (*sockaddr).sa_family });
    if family != libc::AF_INET {
        return None;
    }
    let sockaddr_in = unsafe { &*(sockaddr as *const libc::sockaddr_in) };
    Some(Ipv4Addr::from(u32::from_be(sockaddr_in.sin_addr.s_addr)))
}

/// Comma-joined host addresses handed to a hardware device, falling back
/// to loopback when no interface address is available.
pub fn host_addresses_for_device() -> String {
    match local_ipv4_addresses() {
        Ok(addrs) if !addrs.is_empty() => addrs
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(","),
        Ok(_) => Ipv4Addr::LOCALHOST.to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to enumerate local addresses");
            Ipv4Addr::LOCALHOST.to_string()
        }
    }
}
