//! Routes owned by a session's relay, and the overlap arithmetic used both
//! locally (re-applying a session's own route set) and across the registry
//! (rejecting a new route that collides with another session's).

use ipnet::IpNet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Route {
    pub cidr: IpNet,
    pub is_loopback: bool,
}

impl Route {
    pub fn new(cidr: IpNet, is_loopback: bool) -> Self {
        Self { cidr, is_loopback }
    }
}

/// Two prefixes overlap iff either contains the other's network address.
///
/// # Test
///
/// ```
/// use ligolo_service::route::overlaps;
///
/// let a = "10.0.0.0/16".parse().unwrap();
/// let b = "10.0.1.0/24".parse().unwrap();
/// let c = "192.168.0.0/24".parse().unwrap();
///
/// assert!(overlaps(a, b));
/// assert!(overlaps(b, a));
/// assert!(!overlaps(a, c));
/// ```
pub fn overlaps(a: IpNet, b: IpNet) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_prefixes_overlap() {
        let a: IpNet = "172.16.0.0/12".parse().unwrap();
        assert!(overlaps(a, a));
    }

    #[test]
    fn disjoint_v4_and_v6_do_not_overlap() {
        let a: IpNet = "10.0.0.0/8".parse().unwrap();
        let b: IpNet = "fd00::/8".parse().unwrap();
        assert!(!overlaps(a, b));
    }

    #[test]
    fn adjacent_non_overlapping_prefixes() {
        let a: IpNet = "10.0.0.0/24".parse().unwrap();
        let b: IpNet = "10.0.1.0/24".parse().unwrap();
        assert!(!overlaps(a, b));
    }
}
