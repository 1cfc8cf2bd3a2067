//! Tunnel bookkeeping.
//!
//! A tunnel pins a route from the connection that opened it (the anchor) to
//! one device connection. The broker gives every tunnel an id from the same
//! sequence as client ids, so a caller id popped off a response names either
//! a client or a tunnel, never both.

use crate::error::{Result, ShvError};
use shv_chainpack::TunnelHandle;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunnel {
    pub id: i64,
    /// Caller chain of the `openTunnel` request, anchor last.
    pub caller_client_ids: Vec<i64>,
    pub anchor: i64,
    pub target: i64,
    /// Path on the target the tunnel was opened on.
    pub target_path: String,
}

impl Tunnel {
    pub fn handle(&self) -> TunnelHandle {
        TunnelHandle::new(self.caller_client_ids.clone(), self.id)
    }
}

#[derive(Debug, Default)]
pub struct TunnelManager {
    tunnels: BTreeMap<i64, Tunnel>,
}

impl TunnelManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(
        &mut self,
        id: i64,
        caller_client_ids: Vec<i64>,
        anchor: i64,
        target: i64,
        target_path: impl Into<String>,
    ) -> TunnelHandle {
        let tunnel = Tunnel {
            id,
            caller_client_ids,
            anchor,
            target,
            target_path: target_path.into(),
        };
        let handle = tunnel.handle();
        self.tunnels.insert(id, tunnel);
        handle
    }

    pub fn get(&self, id: i64) -> Option<&Tunnel> {
        self.tunnels.get(&id)
    }

    /// Tunnel named by `handle`, if `sender` may use it.
    pub fn route(&self, handle: &TunnelHandle, sender: i64) -> Result<&Tunnel> {
        let tunnel = self
            .tunnels
            .get(&handle.tunnel_client_id)
            .ok_or(ShvError::ConnectionClosed)?;
        if tunnel.anchor != sender {
            return Err(ShvError::permission_denied(format!(
                "Tunnel {} belongs to client {}",
                tunnel.id, tunnel.anchor
            )));
        }
        Ok(tunnel)
    }

    pub fn close(&mut self, id: i64, requester: i64) -> Result<Tunnel> {
        match self.tunnels.get(&id) {
            None => Err(ShvError::ConnectionClosed),
            Some(tunnel) if tunnel.anchor != requester => Err(ShvError::permission_denied(
                format!("Tunnel {} belongs to client {}", id, tunnel.anchor),
            )),
            Some(_) => self.tunnels.remove(&id).ok_or(ShvError::ConnectionClosed),
        }
    }

    /// Drop every tunnel anchored at or targeting `connection`.
    pub fn close_connection(&mut self, connection: i64) -> Vec<Tunnel> {
        let ids: Vec<i64> = self
            .tunnels
            .values()
            .filter(|t| t.anchor == connection || t.target == connection)
            .map(|t| t.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.tunnels.remove(&id))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tunnel> {
        self.tunnels.values()
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}
