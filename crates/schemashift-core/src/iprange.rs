//! Ban address parsing: a single IP or a CIDR block as an inclusive range.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::error::MigrationError;

/// Inclusive address range covered by a ban.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRange {
    pub start: IpAddr,
    pub end: IpAddr,
}

impl IpRange {
    #[must_use]
    pub const fn single(ip: IpAddr) -> Self {
        Self { start: ip, end: ip }
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl FromStr for IpRange {
    type Err = MigrationError;

    /// Parse `addr` or `addr/bits`. IPv4-mapped IPv6 addresses are treated
    /// as IPv4.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MigrationError::InvalidIpRange(s.to_string());
        let trimmed = s.trim();
        let (addr, bits) = match trimmed.split_once('/') {
            Some((addr, bits)) => (addr, Some(bits.parse::<u8>().map_err(|_| invalid())?)),
            None => (trimmed, None),
        };
        let ip: IpAddr = addr.parse().map_err(|_| invalid())?;
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
            IpAddr::V4(_) => ip,
        };
        let Some(bits) = bits else {
            return Ok(Self::single(ip));
        };
        match ip {
            IpAddr::V4(v4) => {
                if bits > 32 {
                    return Err(invalid());
                }
                let mask = u32::MAX.checked_shl(32 - u32::from(bits)).unwrap_or(0);
                let base = u32::from(v4);
                Ok(Self {
                    start: IpAddr::V4(Ipv4Addr::from(base & mask)),
                    end: IpAddr::V4(Ipv4Addr::from(base | !mask)),
                })
            }
            IpAddr::V6(v6) => {
                if bits > 128 {
                    return Err(invalid());
                }
                let mask = u128::MAX.checked_shl(128 - u32::from(bits)).unwrap_or(0);
                let base = u128::from(v6);
                Ok(Self {
                    start: IpAddr::V6(Ipv6Addr::from(base & mask)),
                    end: IpAddr::V6(Ipv6Addr::from(base | !mask)),
                })
            }
        }
    }
}

/// Parse a ban address into its inclusive range.
///
/// # Errors
///
/// [`MigrationError::InvalidIpRange`] if `value` is not an address or CIDR.
pub fn parse_ip_range(value: &str) -> Result<IpRange, MigrationError> {
    value.parse()
}
