//! Packet Forge Library
//!
//! A LAN man-in-the-middle engine. The packet plane poisons ARP caches,
//! redirects victim traffic to a local proxy, reconstructs flows passively and
//! shapes bandwidth per target. The application plane terminates HTTP and
//! HTTPS (with certificates minted on demand by a local CA) and rewrites
//! responses according to declarative rules.
//!
//! The [`controller::MitmController`] ties both planes together; every
//! component can also be driven on its own.

pub mod actions;
pub mod arp;
pub mod certs;
pub mod controller;
pub mod dns;
pub mod driver;
pub mod error;
pub mod events;
pub mod monitor;
pub mod os;
pub mod packet;
pub mod ports;
pub mod proxy;
pub mod redirect;
pub mod report;
pub mod rules;
pub mod shaper;
pub mod sni;
pub mod store;

pub use error::{Error, Result};

/// Address helpers shared by the packet-plane components
pub mod network {
    use std::fmt;
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    use pnet::util::MacAddr;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Parses a MAC address written with `:` or `-` separators.
    ///
    /// # Arguments
    ///
    /// * `text` - MAC address such as "aa:bb:cc:dd:ee:ff" or "AA-BB-CC-DD-EE-FF"
    ///
    /// # Returns
    ///
    /// * `Ok(MacAddr)` - The parsed address
    /// * `Err(String)` - Error message if parsing fails
    ///
    /// # Examples
    ///
    /// ```
    /// use packet_forge::network::parse_mac;
    ///
    /// let mac = parse_mac("AA-BB-CC-00-11-22").unwrap();
    /// assert_eq!(mac.to_string(), "aa:bb:cc:00:11:22");
    /// ```
    pub fn parse_mac(text: &str) -> Result<MacAddr, String> {
        let normalized = text.trim().replace('-', ":");
        let octets: Vec<&str> = normalized.split(':').collect();
        if octets.len() != 6 {
            return Err(format!("Invalid MAC address: {}", text));
        }

        let mut bytes = [0u8; 6];
        for (slot, octet) in bytes.iter_mut().zip(octets) {
            *slot = u8::from_str_radix(octet, 16)
                .map_err(|_| format!("Invalid MAC address: {}", text))?;
        }
        Ok(MacAddr::new(
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5],
        ))
    }

    /// Reads an IPv4 address from the first four bytes of a slice.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::net::Ipv4Addr;
    /// use packet_forge::network::ipv4_from_bytes;
    ///
    /// assert_eq!(ipv4_from_bytes(&[10, 0, 0, 1]), Some(Ipv4Addr::new(10, 0, 0, 1)));
    /// assert_eq!(ipv4_from_bytes(&[10, 0]), None);
    /// ```
    pub fn ipv4_from_bytes(bytes: &[u8]) -> Option<Ipv4Addr> {
        let octets: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
        Some(Ipv4Addr::from(octets))
    }

    pub fn mac_to_bytes(mac: MacAddr) -> [u8; 6] {
        mac.octets()
    }

    /// A LAN host: a spoofing target or the gateway.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Host {
        pub ip: Ipv4Addr,
        #[serde(serialize_with = "serialize_mac", deserialize_with = "deserialize_mac")]
        pub mac: MacAddr,
    }

    impl Host {
        pub fn new(ip: Ipv4Addr, mac: MacAddr) -> Self {
            Host { ip, mac }
        }
    }

    impl fmt::Display for Host {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{} ({})", self.ip, self.mac)
        }
    }

    impl FromStr for Host {
        type Err = String;

        /// Parses `"ip=mac"`.
        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let (ip, mac) = s
                .split_once('=')
                .ok_or_else(|| format!("Expected ip=mac, got {}", s))?;
            let ip = ip
                .trim()
                .parse::<Ipv4Addr>()
                .map_err(|e| format!("Invalid IP address: {}", e))?;
            Ok(Host {
                ip,
                mac: parse_mac(mac)?,
            })
        }
    }

    fn serialize_mac<S: Serializer>(mac: &MacAddr, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&mac.to_string())
    }

    fn deserialize_mac<'de, D: Deserializer<'de>>(deserializer: D) -> Result<MacAddr, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse_mac(&text).map_err(serde::de::Error::custom)
    }

}
