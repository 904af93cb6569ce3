//! Transport port reservation per node.

use std::collections::BTreeMap;

/// Identifies one cut: hop endpoints plus producing and consuming node.
pub type CutKey = (String, String, usize, usize);

/// Hands out transport ports from each node's reserved range
/// `base_port + node_index * port_range + k`.
///
/// The same cut always gets the same port.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    base_port: u16,
    port_range: u16,
    next: BTreeMap<usize, u16>,
    assigned: BTreeMap<CutKey, u16>,
}

impl PortAllocator {
    #[must_use]
    pub fn new(base_port: u16, port_range: u16) -> Self {
        Self {
            base_port,
            port_range,
            next: BTreeMap::new(),
            assigned: BTreeMap::new(),
        }
    }

    /// Port for `key`, allocated from `key`'s producing node range on first
    /// use. `None` when that range is used up or overflows `u16`.
    pub fn port_for(&mut self, key: &CutKey) -> Option<u16> {
        if let Some(&port) = self.assigned.get(key) {
            return Some(port);
        }
        let node = key.2;
        let k = self.next.get(&node).copied().unwrap_or(0);
        if k >= self.port_range {
            return None;
        }
        let offset = u32::try_from(node)
            .ok()?
            .checked_mul(u32::from(self.port_range))?
            .checked_add(u32::from(k))?;
        let port = u16::try_from(u32::from(self.base_port).checked_add(offset)?).ok()?;
        self.next.insert(node, k + 1);
        self.assigned.insert(key.clone(), port);
        Some(port)
    }

    /// Number of ports handed out so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.assigned.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assigned.is_empty()
    }
}
