//! Raw peer addresses and address handles.
//!
//! A raw address is the 32-byte wire identity of an endpoint: a 16-byte
//! GID (IPv6-format), a queue pair number, and a 32-bit connection
//! identifier chosen randomly at endpoint startup. Two endpoints that share
//! GID and QPN but differ in connid are distinct: the QP was destroyed and
//! recreated, and traffic from the predecessor must not be conflated with
//! the successor.

use std::fmt;

/// Length of a GID in bytes.
pub const GID_LEN: usize = 16;

/// Length of a serialized raw address in bytes.
pub const RAW_ADDR_LEN: usize = 32;

/// 128-bit network identifier of a hardware port.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Gid(pub [u8; GID_LEN]);

impl Gid {
    /// Return `true` if every byte is zero. A zero GID is never a valid
    /// peer identity.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; GID_LEN]
    }
}

impl fmt::Debug for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // IPv6-style grouping, enough for log lines.
        for (i, chunk) in self.0.chunks(2).enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02x}{:02x}", chunk[0], chunk[1])?;
        }
        Ok(())
    }
}

/// Raw endpoint address as carried in the optional raw-address header.
///
/// Wire layout (32 bytes, little-endian):
/// `gid[16] | qpn:u16 | pad:u16 | connid:u32 | reserved:u64`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawAddr {
    pub gid: Gid,
    pub qpn: u16,
    pub connid: u32,
}

impl RawAddr {
    pub fn new(gid: Gid, qpn: u16, connid: u32) -> Self {
        Self { gid, qpn, connid }
    }

    /// Serialize into the fixed 32-byte wire form.
    pub fn to_bytes(&self) -> [u8; RAW_ADDR_LEN] {
        let mut out = [0u8; RAW_ADDR_LEN];
        out[..GID_LEN].copy_from_slice(&self.gid.0);
        out[16..18].copy_from_slice(&self.qpn.to_le_bytes());
        // bytes 18..20 are padding
        out[20..24].copy_from_slice(&self.connid.to_le_bytes());
        // bytes 24..32 are reserved
        out
    }

    /// Parse the fixed 32-byte wire form.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < RAW_ADDR_LEN {
            return None;
        }
        let mut gid = [0u8; GID_LEN];
        gid.copy_from_slice(&bytes[..GID_LEN]);
        let qpn = u16::from_le_bytes([bytes[16], bytes[17]]);
        let connid = u32::from_le_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
        Some(Self {
            gid: Gid(gid),
            qpn,
            connid,
        })
    }

    /// Exact identity comparison: GID, QPN and connid must all match.
    #[inline]
    pub fn same_endpoint(&self, other: &RawAddr) -> bool {
        self.gid == other.gid && self.qpn == other.qpn && self.connid == other.connid
    }
}

/// Stable opaque address handed to the application by the address vector.
///
/// The value is an index into the AV's peer table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiAddr(pub u64);

impl FiAddr {
    #[inline]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FiAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hardware address handle identity returned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AhHandle {
    /// Opaque transport-level handle.
    pub handle: u64,
    /// Address handle number the device stamps on received packets.
    pub ahn: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_addr_roundtrip() {
        let addr = RawAddr::new(Gid([0xab; GID_LEN]), 0x1234, 0xdeadbeef);
        let bytes = addr.to_bytes();
        assert_eq!(bytes.len(), RAW_ADDR_LEN);
        let back = RawAddr::from_bytes(&bytes).unwrap();
        assert_eq!(addr, back);
        // Padding and reserved bytes stay zero.
        assert_eq!(&bytes[18..20], &[0, 0]);
        assert_eq!(&bytes[24..32], &[0u8; 8]);
    }

    #[test]
    fn test_raw_addr_short_input() {
        assert!(RawAddr::from_bytes(&[0u8; 31]).is_none());
    }

    #[test]
    fn test_zero_gid() {
        assert!(Gid::default().is_zero());
        assert!(!Gid([1; GID_LEN]).is_zero());
    }
}
