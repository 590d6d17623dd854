//! Heterogeneous-memory copy abstraction.
//!
//! Payload copies between packet buffers and application memory go
//! through a small registry of copy providers keyed by memory interface.
//! System memory is always available; accelerator interfaces are optional
//! capability providers discovered at startup. An absent provider yields
//! a no-op path: copies report `NotSupported` and address probes answer
//! `false`.

use crate::error::{Error, Result};

/// Memory interface of an application buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HmemIface {
    #[default]
    System,
    Cuda,
    Rocr,
    Ze,
    GdrCopy,
}

const IFACE_COUNT: usize = 5;

#[inline]
fn iface_slot(iface: HmemIface) -> usize {
    match iface {
        HmemIface::System => 0,
        HmemIface::Cuda => 1,
        HmemIface::Rocr => 2,
        HmemIface::Ze => 3,
        HmemIface::GdrCopy => 4,
    }
}

/// Location of an application buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HmemDesc {
    pub iface: HmemIface,
    pub device: u64,
}

/// A device-memory copy capability.
pub trait CopyProvider {
    /// Copy into device-resident destination memory.
    fn copy_to(&self, device: u64, dst: &mut [u8], src: &[u8]) -> Result<()>;
    /// Copy out of device-resident source memory.
    fn copy_from(&self, device: u64, dst: &mut [u8], src: &[u8]) -> Result<()>;
    /// Whether an address belongs to this interface.
    fn is_addr_valid(&self, addr: &[u8]) -> bool;
}

/// Registry of discovered copy providers.
pub struct HmemRegistry {
    providers: [Option<Box<dyn CopyProvider>>; IFACE_COUNT],
}

impl Default for HmemRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HmemRegistry {
    /// Discover available providers. Only system memory is built in;
    /// accelerator providers are registered by the embedder.
    pub fn new() -> Self {
        Self {
            providers: [None, None, None, None, None],
        }
    }

    /// Register a provider for an accelerator interface.
    pub fn register(&mut self, iface: HmemIface, provider: Box<dyn CopyProvider>) {
        self.providers[iface_slot(iface)] = Some(provider);
    }

    #[inline]
    pub fn is_supported(&self, iface: HmemIface) -> bool {
        matches!(iface, HmemIface::System) || self.providers[iface_slot(iface)].is_some()
    }

    /// Copy packet payload into an application buffer.
    pub fn copy_to(&self, desc: HmemDesc, dst: &mut [u8], src: &[u8]) -> Result<()> {
        match desc.iface {
            HmemIface::System => {
                dst[..src.len()].copy_from_slice(src);
                Ok(())
            }
            iface => match &self.providers[iface_slot(iface)] {
                Some(p) => p.copy_to(desc.device, dst, src),
                None => Err(Error::NotSupported("hmem interface not discovered")),
            },
        }
    }

    /// Copy application memory into a packet buffer.
    pub fn copy_from(&self, desc: HmemDesc, dst: &mut [u8], src: &[u8]) -> Result<()> {
        match desc.iface {
            HmemIface::System => {
                dst[..src.len()].copy_from_slice(src);
                Ok(())
            }
            iface => match &self.providers[iface_slot(iface)] {
                Some(p) => p.copy_from(desc.device, dst, src),
                None => Err(Error::NotSupported("hmem interface not discovered")),
            },
        }
    }

    /// Probe which interface owns an address. Absent providers never
    /// claim an address.
    pub fn iface_of(&self, addr: &[u8]) -> HmemIface {
        for (slot, provider) in self.providers.iter().enumerate() {
            if let Some(p) = provider {
                if p.is_addr_valid(addr) {
                    return match slot {
                        1 => HmemIface::Cuda,
                        2 => HmemIface::Rocr,
                        3 => HmemIface::Ze,
                        4 => HmemIface::GdrCopy,
                        _ => HmemIface::System,
                    };
                }
            }
        }
        HmemIface::System
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Doubling;

    impl CopyProvider for Doubling {
        fn copy_to(&self, _device: u64, dst: &mut [u8], src: &[u8]) -> Result<()> {
            for (d, s) in dst.iter_mut().zip(src) {
                *d = s.wrapping_mul(2);
            }
            Ok(())
        }

        fn copy_from(&self, _device: u64, dst: &mut [u8], src: &[u8]) -> Result<()> {
            self.copy_to(0, dst, src)
        }

        fn is_addr_valid(&self, addr: &[u8]) -> bool {
            addr.first() == Some(&0x42)
        }
    }

    #[test]
    fn test_system_copy() {
        let reg = HmemRegistry::new();
        let mut dst = [0u8; 4];
        reg.copy_to(HmemDesc::default(), &mut dst, b"abcd").unwrap();
        assert_eq!(&dst, b"abcd");
    }

    #[test]
    fn test_absent_provider_is_enosys() {
        let reg = HmemRegistry::new();
        let desc = HmemDesc {
            iface: HmemIface::Cuda,
            device: 0,
        };
        let mut dst = [0u8; 4];
        assert!(matches!(
            reg.copy_to(desc, &mut dst, b"abcd"),
            Err(Error::NotSupported(_))
        ));
        assert!(!reg.is_supported(HmemIface::Cuda));
        assert_eq!(reg.iface_of(&[0x42]), HmemIface::System);
    }

    #[test]
    fn test_registered_provider_routes() {
        let mut reg = HmemRegistry::new();
        reg.register(HmemIface::Cuda, Box::new(Doubling));
        let desc = HmemDesc {
            iface: HmemIface::Cuda,
            device: 3,
        };
        let mut dst = [0u8; 3];
        reg.copy_to(desc, &mut dst, &[1, 2, 3]).unwrap();
        assert_eq!(dst, [2, 4, 6]);
        assert_eq!(reg.iface_of(&[0x42]), HmemIface::Cuda);
    }
}
