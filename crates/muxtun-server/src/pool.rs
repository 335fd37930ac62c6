//! Virtual IPv4 address pool

use muxtun_core::{TunnelError, TunnelResult};
use std::net::Ipv4Addr;
use std::sync::Mutex;

/// Leases addresses out of an inclusive IPv4 range.
///
/// Both ends of the range are inclusive and must share the same /16 network
/// prefix. All operations serialize on one mutex so concurrent flow opens
/// and closes never race.
pub struct AddressPool {
    base: u32,
    in_use: Mutex<Vec<bool>>,
}

impl AddressPool {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> TunnelResult<AddressPool> {
        let (lo, hi) = (u32::from(start), u32::from(end));
        if hi < lo {
            return Err(TunnelError::BadConfiguration(format!(
                "pool range {start}-{end} is inverted"
            )));
        }
        if lo >> 16 != hi >> 16 {
            return Err(TunnelError::BadConfiguration(format!(
                "pool range {start}-{end} spans more than one /16 network"
            )));
        }
        let size = (hi - lo + 1) as usize;
        Ok(AddressPool {
            base: lo,
            in_use: Mutex::new(vec![false; size]),
        })
    }

    /// Total addresses in the range.
    pub fn size(&self) -> usize {
        self.in_use.lock().unwrap().len()
    }

    pub fn allocated(&self) -> usize {
        self.in_use.lock().unwrap().iter().filter(|bit| **bit).count()
    }

    /// Lease the first free address, scanning from the start of the range.
    /// `None` when the pool is exhausted.
    pub fn allocate(&self) -> Option<Ipv4Addr> {
        let mut in_use = self.in_use.lock().unwrap();
        let index = in_use.iter().position(|bit| !bit)?;
        in_use[index] = true;
        Some(Ipv4Addr::from(self.base + index as u32))
    }

    /// Return a leased address. Addresses outside the range are ignored.
    pub fn deallocate(&self, address: Ipv4Addr) {
        let raw = u32::from(address);
        if raw < self.base {
            return;
        }
        let index = (raw - self.base) as usize;
        let mut in_use = self.in_use.lock().unwrap();
        if index < in_use.len() {
            in_use[index] = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_sequential_allocation() {
        let pool = AddressPool::new(addr("10.0.0.1"), addr("10.0.0.3")).unwrap();
        assert_eq!(pool.size(), 3);
        assert_eq!(pool.allocate(), Some(addr("10.0.0.1")));
        assert_eq!(pool.allocate(), Some(addr("10.0.0.2")));
        assert_eq!(pool.allocate(), Some(addr("10.0.0.3")));
        assert_eq!(pool.allocate(), None);
    }

    #[test]
    fn test_first_free_reused_after_deallocate() {
        let pool = AddressPool::new(addr("10.0.0.1"), addr("10.0.0.3")).unwrap();
        let first = pool.allocate().unwrap();
        pool.allocate().unwrap();
        pool.allocate().unwrap();

        pool.deallocate(first);
        assert_eq!(pool.allocate(), Some(addr("10.0.0.1")));
        assert_eq!(pool.allocate(), None);
    }

    #[test]
    fn test_allocate_deallocate_restores_initial_state() {
        let pool = AddressPool::new(addr("172.16.4.10"), addr("172.16.4.20")).unwrap();
        let leased: Vec<Ipv4Addr> = (0..5).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.allocated(), 5);

        for address in leased {
            pool.deallocate(address);
        }
        assert_eq!(pool.allocated(), 0);
        assert_eq!(pool.allocate(), Some(addr("172.16.4.10")));
    }

    #[test]
    fn test_no_double_allocation() {
        let pool = AddressPool::new(addr("10.1.0.1"), addr("10.1.0.200")).unwrap();
        let mut seen = std::collections::HashSet::new();
        while let Some(address) = pool.allocate() {
            assert!(seen.insert(address), "address {address} leased twice");
        }
        assert_eq!(seen.len(), 200);
    }

    #[test]
    fn test_single_address_range() {
        let pool = AddressPool::new(addr("10.0.0.5"), addr("10.0.0.5")).unwrap();
        assert_eq!(pool.allocate(), Some(addr("10.0.0.5")));
        assert_eq!(pool.allocate(), None);
    }

    #[test]
    fn test_rejects_inverted_range() {
        assert!(AddressPool::new(addr("10.0.0.9"), addr("10.0.0.1")).is_err());
    }

    #[test]
    fn test_rejects_range_across_slash16() {
        assert!(AddressPool::new(addr("10.0.255.1"), addr("10.1.0.5")).is_err());
    }

    #[test]
    fn test_deallocate_out_of_range_ignored() {
        let pool = AddressPool::new(addr("10.0.0.1"), addr("10.0.0.2")).unwrap();
        pool.allocate().unwrap();
        pool.deallocate(addr("9.255.255.255"));
        pool.deallocate(addr("10.0.0.200"));
        assert_eq!(pool.allocated(), 1);
    }
}
