//! Per-session table of objects that have crossed the session boundary.
//!
//! Each node is keyed by its wire address. A local node counts how many
//! strong references the peer holds (`times_sent`) and keeps the object alive
//! while that count is non-zero. A remote node counts how many references
//! this side has received (`times_recd`); they are handed back in one
//! dec-strong when the proxy goes away.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::binder::{Binder, RemoteBinder, SpBinder};
use crate::error::{Result, RpcError};
use crate::session::Session;
use crate::wire::{
    RPC_WIRE_ADDRESS_ID_SHIFT, RPC_WIRE_ADDRESS_OPTION_CREATED, RPC_WIRE_ADDRESS_OPTION_FOR_SERVER,
};

pub(crate) enum NodeObject {
    Local {
        binder: Weak<dyn Binder>,
        /// Strong reference held on behalf of the peer.
        sent_ref: Option<Arc<dyn Binder>>,
    },
    Remote(Weak<RemoteBinder>),
}

pub(crate) struct BinderNode {
    pub(crate) object: NodeObject,
    pub(crate) times_sent: u64,
    pub(crate) times_recd: u64,
}

impl BinderNode {
    fn is_local(&self) -> bool {
        matches!(self.object, NodeObject::Local { .. })
    }
}

#[derive(Default)]
pub(crate) struct NodeTable {
    nodes: HashMap<u64, BinderNode>,
    next_id: u64,
    terminated: bool,
}

impl NodeTable {
    fn ensure_open(&self) -> Result<()> {
        if self.terminated {
            return Err(RpcError::DeadObject);
        }
        Ok(())
    }

    fn mint_address(&mut self, for_server: bool) -> u64 {
        loop {
            self.next_id += 1;
            let mut address = (self.next_id << RPC_WIRE_ADDRESS_ID_SHIFT) | RPC_WIRE_ADDRESS_OPTION_CREATED;
            if for_server {
                address |= RPC_WIRE_ADDRESS_OPTION_FOR_SERVER;
            }
            if !self.nodes.contains_key(&address) {
                return address;
            }
        }
    }

    /// A local object is being sent to the peer: hand out its address and
    /// count one more strong reference held remotely.
    pub(crate) fn leaving_local(&mut self, binder: &Arc<dyn Binder>, for_server: bool) -> Result<u64> {
        self.ensure_open()?;
        let target = Arc::as_ptr(binder) as *const ();

        for (address, node) in self.nodes.iter_mut() {
            if let NodeObject::Local { binder: weak, sent_ref } = &mut node.object {
                if Weak::as_ptr(weak) as *const () == target {
                    node.times_sent += 1;
                    if sent_ref.is_none() {
                        *sent_ref = Some(binder.clone());
                    }
                    return Ok(*address);
                }
            }
        }

        let address = self.mint_address(for_server);
        self.nodes.insert(
            address,
            BinderNode {
                object: NodeObject::Local {
                    binder: Arc::downgrade(binder),
                    sent_ref: Some(binder.clone()),
                },
                times_sent: 1,
                times_recd: 0,
            },
        );
        tracing::trace!(address, "new local node");
        Ok(address)
    }

    /// A proxy is being sent back to its owner. Counts don't move: the peer
    /// resolves the address to its own local node.
    pub(crate) fn leaving_remote(&self, proxy: &RemoteBinder) -> Result<u64> {
        self.ensure_open()?;
        match self.nodes.get(&proxy.address()) {
            Some(node) if !node.is_local() => Ok(proxy.address()),
            _ => Err(RpcError::BadObject {
                address: proxy.address(),
            }),
        }
    }

    /// An address arrived from the peer.
    pub(crate) fn entering(
        &mut self,
        session: &Arc<Session>,
        address: u64,
        for_server: bool,
    ) -> Result<SpBinder> {
        self.ensure_open()?;

        if let Some(node) = self.nodes.get_mut(&address) {
            match &mut node.object {
                NodeObject::Local { binder, .. } => {
                    // our own object came back; the peer never counted it
                    return binder
                        .upgrade()
                        .map(SpBinder::Local)
                        .ok_or(RpcError::BadObject { address });
                }
                NodeObject::Remote(weak) => {
                    node.times_recd += 1;
                    if let Some(proxy) = weak.upgrade() {
                        return Ok(SpBinder::Remote(proxy));
                    }
                    // previous proxy is mid-drop; its dec-strong will see the
                    // new proxy and leave the counts to it
                    let proxy = Arc::new(RemoteBinder::new(session.clone(), address));
                    *weak = Arc::downgrade(&proxy);
                    return Ok(SpBinder::Remote(proxy));
                }
            }
        }

        if address & RPC_WIRE_ADDRESS_OPTION_CREATED == 0 {
            return Err(RpcError::BadValue(format!(
                "address {address:#x} was never created by a node table"
            )));
        }
        let minted_by_server = address & RPC_WIRE_ADDRESS_OPTION_FOR_SERVER != 0;
        if minted_by_server == for_server {
            return Err(RpcError::BadValue(format!(
                "address {address:#x} claims to be ours but is unknown"
            )));
        }

        let proxy = Arc::new(RemoteBinder::new(session.clone(), address));
        self.nodes.insert(
            address,
            BinderNode {
                object: NodeObject::Remote(Arc::downgrade(&proxy)),
                times_sent: 0,
                times_recd: 1,
            },
        );
        tracing::trace!(address, "new remote node");
        Ok(SpBinder::Remote(proxy))
    }

    /// The proxy for `address` is being destroyed. Returns how many strong
    /// references to hand back to the peer, if any.
    pub(crate) fn proxy_dropped(&mut self, address: u64) -> Option<u64> {
        let node = self.nodes.get(&address)?;
        match &node.object {
            NodeObject::Remote(weak) if weak.strong_count() == 0 => {}
            // a newer proxy took over this node
            _ => return None,
        }
        let amount = node.times_recd;
        self.nodes.remove(&address);
        (amount > 0).then_some(amount)
    }

    /// Peer released `amount` strong references on a local object. Returns
    /// the strong reference to drop once the lock is released.
    pub(crate) fn dec_strong(&mut self, address: u64, amount: u64) -> Option<Arc<dyn Binder>> {
        let Some(node) = self.nodes.get_mut(&address) else {
            tracing::warn!(address, amount, "dec-strong for unknown address, already cleaned up?");
            return None;
        };
        if !node.is_local() {
            tracing::error!(address, "peer tried to release a reference it does not own");
            return None;
        }

        if amount > node.times_sent {
            tracing::error!(
                address,
                amount,
                times_sent = node.times_sent,
                "peer released more references than it was sent, clamping"
            );
            node.times_sent = 0;
        } else {
            node.times_sent -= amount;
        }

        if node.times_sent > 0 {
            return None;
        }

        let released = match &mut node.object {
            NodeObject::Local { sent_ref, .. } => sent_ref.take(),
            NodeObject::Remote(_) => None,
        };
        if node.times_recd == 0 {
            self.nodes.remove(&address);
        }
        released
    }

    /// Peer took `amount` extra strong references on a local object.
    pub(crate) fn acquire(&mut self, address: u64, amount: u64) -> Result<()> {
        match self.nodes.get_mut(&address) {
            Some(node) if node.is_local() && node.times_sent > 0 => {
                node.times_sent += amount;
                Ok(())
            }
            _ => Err(RpcError::BadObject { address }),
        }
    }

    /// Track a reference this side took (positive) or gave back (negative)
    /// on a remote object.
    pub(crate) fn adjust_received(&mut self, address: u64, acquire: bool) -> Result<()> {
        let node = match self.nodes.get_mut(&address) {
            Some(node) if !node.is_local() => node,
            _ => return Err(RpcError::BadObject { address }),
        };
        if acquire {
            node.times_recd += 1;
        } else if node.times_recd > 1 {
            node.times_recd -= 1;
        } else {
            return Err(RpcError::InvalidOperation(format!(
                "no extra reference held on {address:#x}"
            )));
        }
        Ok(())
    }

    pub(crate) fn lookup_local(&self, address: u64) -> Option<Arc<dyn Binder>> {
        match &self.nodes.get(&address)?.object {
            NodeObject::Local { binder, .. } => binder.upgrade(),
            NodeObject::Remote(_) => None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Forget every node. Returns the strong references the peer was
    /// holding so the caller can drop them outside the lock.
    pub(crate) fn clear(&mut self) -> Vec<Arc<dyn Binder>> {
        self.terminated = true;
        self.nodes
            .drain()
            .filter_map(|(_, node)| match node.object {
                NodeObject::Local { sent_ref, .. } => sent_ref,
                NodeObject::Remote(_) => None,
            })
            .collect()
    }

    pub(crate) fn dump(&self) -> String {
        let mut out = format!("{} node(s)", self.nodes.len());
        let mut addresses: Vec<_> = self.nodes.keys().copied().collect();
        addresses.sort_unstable();
        for address in addresses {
            let node = &self.nodes[&address];
            let kind = if node.is_local() { "local" } else { "remote" };
            out.push_str(&format!(
                "\n  {address:#x} {kind} times_sent={} times_recd={}",
                node.times_sent, node.times_recd
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::{CallContext, Payload};
    use crate::error::StatusCode;

    struct Nop;

    impl Binder for Nop {
        fn on_transact(
            &self,
            _ctx: &CallContext<'_>,
            _code: u32,
            data: Payload,
        ) -> std::result::Result<Payload, StatusCode> {
            Ok(data)
        }
    }

    #[test]
    fn count_tracks_leaving_minus_released() {
        let mut table = NodeTable::default();
        let object: Arc<dyn Binder> = Arc::new(Nop);

        let address = table.leaving_local(&object, true).unwrap();
        for _ in 0..4 {
            assert_eq!(table.leaving_local(&object, true).unwrap(), address);
        }
        assert_eq!(table.nodes[&address].times_sent, 5);
        assert_ne!(address & RPC_WIRE_ADDRESS_OPTION_CREATED, 0);
        assert_ne!(address & RPC_WIRE_ADDRESS_OPTION_FOR_SERVER, 0);

        assert!(table.dec_strong(address, 2).is_none());
        assert_eq!(table.nodes[&address].times_sent, 3);
        assert_eq!(table.len(), 1);

        // the last release hands back the strong ref and erases the node
        let released = table.dec_strong(address, 3);
        assert!(released.is_some());
        assert_eq!(table.len(), 0);
        drop(released);
        assert_eq!(Arc::strong_count(&object), 1);
    }

    #[test]
    fn over_release_clamps_to_zero() {
        let mut table = NodeTable::default();
        let object: Arc<dyn Binder> = Arc::new(Nop);
        let address = table.leaving_local(&object, false).unwrap();
        assert!(table.dec_strong(address, 10).is_some());
        assert_eq!(table.len(), 0);
        // a late release for the now-unknown address is tolerated
        assert!(table.dec_strong(address, 1).is_none());
    }

    #[test]
    fn node_keeps_object_alive_until_released() {
        let mut table = NodeTable::default();
        let object: Arc<dyn Binder> = Arc::new(Nop);
        let weak = Arc::downgrade(&object);
        let address = table.leaving_local(&object, false).unwrap();
        drop(object);
        assert!(weak.upgrade().is_some());
        assert!(table.lookup_local(address).is_some());
        drop(table.dec_strong(address, 1));
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn clear_terminates_the_table() {
        let mut table = NodeTable::default();
        let object: Arc<dyn Binder> = Arc::new(Nop);
        table.leaving_local(&object, false).unwrap();
        assert_eq!(table.clear().len(), 1);
        assert!(matches!(
            table.leaving_local(&object, false),
            Err(RpcError::DeadObject)
        ));
    }
}
