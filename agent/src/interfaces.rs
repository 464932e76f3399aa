//! Local interface enumeration for `InfoReply` (§4.3, §11). The server
//! derives the session's stable id from the MAC addresses reported here, so
//! every non-loopback interface with a hardware address must be included.

use codec::NetInterface;
use network_interface::{NetworkInterface, NetworkInterfaceConfig};

const FLAG_UP: u32 = 1 << 0;

/// Enumerate the host's network interfaces as wire-format `NetInterface`s.
/// Loopback interfaces are omitted entirely (§4.3): they never identify a
/// host (no stable hardware address) and never carry a pivoted flow, so
/// reporting them would only give the server something to filter back out.
pub fn enumerate() -> anyhow::Result<Vec<NetInterface>> {
    let interfaces = NetworkInterface::show()?;

    Ok(interfaces
        .into_iter()
        .filter(|iface| !iface.addr.iter().any(|addr| addr.ip().is_loopback()))
        .map(|iface| NetInterface {
            index: iface.index,
            // `network-interface` does not surface MTU; 1500 matches the
            // tun device's own MTU on the server side (§4.4) and is the
            // common default for any interface capable of carrying a
            // pivoted TCP stream.
            mtu: 1500,
            name: iface.name,
            hardware_addr: iface.mac_addr.unwrap_or_default(),
            flags: FLAG_UP,
            addresses: iface.addr.iter().map(|addr| addr.ip().to_string()).collect(),
        })
        .collect())
}
