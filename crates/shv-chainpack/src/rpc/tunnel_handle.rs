//! Handle of a broker tunnel.

use crate::meta::builtin::{self, tunnel_handle};
use crate::value::{IMap, MetaData, RpcValue};
use std::fmt;

/// Identifies a tunnel: the caller-id chain that opened it and the id the
/// broker assigned to the forwarding leg.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelHandle {
    pub caller_client_ids: Vec<i64>,
    pub tunnel_client_id: i64,
}

impl TunnelHandle {
    pub fn new(caller_client_ids: Vec<i64>, tunnel_client_id: i64) -> Self {
        Self {
            caller_client_ids,
            tunnel_client_id,
        }
    }

    pub fn to_rpc_value(&self) -> RpcValue {
        let descriptor = builtin::tunnel_handle();
        let ids = self
            .caller_client_ids
            .iter()
            .copied()
            .map(RpcValue::from)
            .collect::<Vec<_>>();
        let mut imap = IMap::new();
        imap.insert(tunnel_handle::CALLER_CLIENT_IDS, RpcValue::from(ids));
        imap.insert(
            tunnel_handle::TUNNEL_CLIENT_ID,
            RpcValue::from(self.tunnel_client_id),
        );
        RpcValue::from(imap).with_meta(MetaData::with_meta_type(
            descriptor.namespace_id(),
            descriptor.type_id(),
        ))
    }

    pub fn from_rpc_value(value: &RpcValue) -> Option<Self> {
        let imap = value.as_imap()?;
        let tunnel_client_id = imap
            .get(&tunnel_handle::TUNNEL_CLIENT_ID)
            .and_then(RpcValue::as_int)?;
        let caller_client_ids = imap
            .get(&tunnel_handle::CALLER_CLIENT_IDS)
            .map(super::caller_ids_from_value)
            .unwrap_or_default();
        Some(Self::new(caller_client_ids, tunnel_client_id))
    }
}

impl fmt::Display for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tunnel {} (callers {:?})",
            self.tunnel_client_id, self.caller_client_ids
        )
    }
}
