//! Broker tables: clients, mount points, subscriptions and tunnels.
//!
//! All tables sit behind std `RwLock`s. No guard is ever held across an
//! await; callers get owned copies.

use super::tunnel::{Tunnel, TunnelManager};
use crate::config::{BrokerConfig, RpcConfig};
use crate::error::{Result, ShvError};
use crate::node::AccessLevel;
use crate::rpc::{ConnectionHandle, PendingLogin};
use shv_chainpack::rpc::split_shv_path;
use shv_chainpack::TunnelHandle;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// A logged-in connection.
#[derive(Debug, Clone)]
pub struct ClientEntry {
    pub handle: ConnectionHandle,
    pub user: String,
    pub access: AccessLevel,
    pub device_id: Option<String>,
    pub mount_point: Option<String>,
}

/// Interest of one client in signals below `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub client_id: i64,
    pub path: String,
    pub method: Option<String>,
}

impl Subscription {
    /// `path` matches when it equals the subscribed path or lies below it.
    pub fn matches(&self, path: &str, method: &str) -> bool {
        if let Some(m) = &self.method {
            if m != method {
                return false;
            }
        }
        is_path_prefix(&self.path, path)
    }
}

/// Mount owning a path, with the rest of the path below the mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountMatch {
    pub mount_point: String,
    pub client_id: i64,
    pub remainder: String,
}

fn is_path_prefix(prefix: &str, path: &str) -> bool {
    let prefix = split_shv_path(prefix);
    let path = split_shv_path(path);
    path.len() >= prefix.len() && prefix.iter().zip(&path).all(|(a, b)| a == b)
}

/// Canonical form of a mount point; the root cannot be mounted.
pub fn normalize_mount_point(mount_point: &str) -> Result<String> {
    let normalized = split_shv_path(mount_point).join("/");
    if normalized.is_empty() {
        return Err(ShvError::invalid_params("Mount point must not be empty"));
    }
    let reserved = split_shv_path(RpcConfig::BROKER_APP_PATH);
    if split_shv_path(&normalized).first() == reserved.first() {
        return Err(ShvError::permission_denied(format!(
            "Mount point '{}' is reserved for the broker",
            normalized
        )));
    }
    Ok(normalized)
}

pub struct BrokerState {
    config: BrokerConfig,
    next_id: AtomicI64,
    clients: RwLock<HashMap<i64, ClientEntry>>,
    mounts: RwLock<BTreeMap<String, i64>>,
    subscriptions: RwLock<Vec<Subscription>>,
    tunnels: RwLock<TunnelManager>,
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| ShvError::internal("Failed to acquire broker read lock"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| ShvError::internal("Failed to acquire broker write lock"))
}

impl BrokerState {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            next_id: AtomicI64::new(1),
            clients: RwLock::new(HashMap::new()),
            mounts: RwLock::new(BTreeMap::new()),
            subscriptions: RwLock::new(Vec::new()),
            tunnels: RwLock::new(TunnelManager::new()),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Next id for a client or a tunnel.
    pub fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Check a pending login against the configured users.
    pub fn authenticate(&self, login: &PendingLogin) -> Result<AccessLevel> {
        let rejected = || ShvError::LoginFailed {
            message: "Invalid user name or password".to_string(),
        };
        let user = self.config.users.get(login.user()).ok_or_else(rejected)?;
        if !login.verify(&user.password) {
            return Err(rejected());
        }
        Ok(user.access)
    }

    // Clients

    /// Claim `mount_point` for `client_id`. Fails when another client holds it.
    pub fn reserve_mount(&self, mount_point: &str, client_id: i64) -> Result<()> {
        let mut mounts = write(&self.mounts)?;
        if let Some(owner) = mounts.get(mount_point) {
            return Err(ShvError::invalid_params(format!(
                "Mount point '{}' is already used by client {}",
                mount_point, owner
            )));
        }
        mounts.insert(mount_point.to_string(), client_id);
        Ok(())
    }

    pub fn add_client(&self, client_id: i64, entry: ClientEntry) -> Result<()> {
        info!(
            "Client {} logged in as '{}'{}",
            client_id,
            entry.user,
            entry
                .mount_point
                .as_deref()
                .map(|m| format!(", mounted at '{}'", m))
                .unwrap_or_default()
        );
        write(&self.clients)?.insert(client_id, entry);
        Ok(())
    }

    /// Forget a client together with its mount, subscriptions and tunnels.
    pub fn remove_client(&self, client_id: i64) -> Result<Option<ClientEntry>> {
        let entry = write(&self.clients)?.remove(&client_id);
        write(&self.mounts)?.retain(|_, owner| *owner != client_id);
        write(&self.subscriptions)?.retain(|s| s.client_id != client_id);
        for tunnel in write(&self.tunnels)?.close_connection(client_id) {
            warn!(
                "Tunnel {} closed with client {} (anchor {}, target {})",
                tunnel.id, client_id, tunnel.anchor, tunnel.target
            );
        }
        if entry.is_some() {
            info!("Client {} removed", client_id);
        }
        Ok(entry)
    }

    pub fn client(&self, client_id: i64) -> Result<Option<ClientEntry>> {
        Ok(read(&self.clients)?.get(&client_id).cloned())
    }

    pub fn client_ids(&self) -> Result<Vec<i64>> {
        let mut ids: Vec<i64> = read(&self.clients)?.keys().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    // Mounts

    pub fn mount_points(&self) -> Result<BTreeMap<String, i64>> {
        Ok(read(&self.mounts)?.clone())
    }

    /// Longest mount point that is `path` or one of its ancestors.
    pub fn find_mount(&self, path: &str) -> Result<Option<MountMatch>> {
        let segments = split_shv_path(path);
        let mounts = read(&self.mounts)?;
        for len in (1..=segments.len()).rev() {
            let candidate = segments[..len].join("/");
            if let Some(client_id) = mounts.get(&candidate) {
                return Ok(Some(MountMatch {
                    mount_point: candidate,
                    client_id: *client_id,
                    remainder: segments[len..].join("/"),
                }));
            }
        }
        Ok(None)
    }

    /// Next path segments of mount points strictly below `path`.
    pub fn mount_children(&self, path: &str) -> Result<Vec<String>> {
        let base = split_shv_path(path);
        let mut names: Vec<String> = Vec::new();
        for mount in read(&self.mounts)?.keys() {
            let segments = split_shv_path(mount);
            if segments.len() > base.len() && segments[..base.len()] == base[..] {
                let name = segments[base.len()].to_string();
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        Ok(names)
    }

    // Subscriptions

    pub fn subscribe(&self, client_id: i64, path: &str, method: Option<&str>) -> Result<()> {
        let subscription = Subscription {
            client_id,
            path: split_shv_path(path).join("/"),
            method: method.map(str::to_string),
        };
        let mut subscriptions = write(&self.subscriptions)?;
        if !subscriptions.contains(&subscription) {
            debug!(
                "Client {} subscribed to '{}' ({:?})",
                client_id, subscription.path, subscription.method
            );
            subscriptions.push(subscription);
        }
        Ok(())
    }

    pub fn unsubscribe(&self, client_id: i64, path: &str, method: Option<&str>) -> Result<bool> {
        let path = split_shv_path(path).join("/");
        let mut subscriptions = write(&self.subscriptions)?;
        let before = subscriptions.len();
        subscriptions.retain(|s| {
            !(s.client_id == client_id && s.path == path && s.method.as_deref() == method)
        });
        Ok(subscriptions.len() != before)
    }

    /// Connections subscribed to a signal, the source excluded.
    pub fn subscribers(
        &self,
        path: &str,
        method: &str,
        source: i64,
    ) -> Result<Vec<ConnectionHandle>> {
        let mut ids: Vec<i64> = read(&self.subscriptions)?
            .iter()
            .filter(|s| s.client_id != source && s.matches(path, method))
            .map(|s| s.client_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();

        let clients = read(&self.clients)?;
        Ok(ids
            .into_iter()
            .filter_map(|id| clients.get(&id).map(|c| c.handle.clone()))
            .collect())
    }

    // Tunnels

    /// Open a tunnel from `anchor` to the device serving `shv_path`.
    pub fn open_tunnel(
        &self,
        anchor: i64,
        caller_ids: &[i64],
        shv_path: &str,
    ) -> Result<TunnelHandle> {
        let mount = self
            .find_mount(shv_path)?
            .ok_or_else(|| ShvError::path_not_found(shv_path))?;
        let id = self.next_id();
        let mut chain = caller_ids.to_vec();
        chain.push(anchor);
        let handle = write(&self.tunnels)?.open(
            id,
            chain,
            anchor,
            mount.client_id,
            mount.remainder,
        );
        info!(
            "Tunnel {} opened by client {} to '{}' (client {})",
            id, anchor, shv_path, mount.client_id
        );
        Ok(handle)
    }

    pub fn close_tunnel(&self, tunnel_id: i64, requester: i64) -> Result<()> {
        let tunnel = write(&self.tunnels)?.close(tunnel_id, requester)?;
        info!("Tunnel {} closed by client {}", tunnel.id, requester);
        Ok(())
    }

    /// Target connection and path prefix for a tunneled request.
    pub fn route_tunnel(
        &self,
        handle: &TunnelHandle,
        sender: i64,
    ) -> Result<(ConnectionHandle, String)> {
        let (target, target_path) = {
            let tunnels = read(&self.tunnels)?;
            let tunnel = tunnels.route(handle, sender)?;
            (tunnel.target, tunnel.target_path.clone())
        };
        let target = self.client(target)?.ok_or(ShvError::ConnectionClosed)?;
        Ok((target.handle, target_path))
    }

    /// Anchor connection of tunnel `tunnel_id` when `from` is its target.
    pub fn tunnel_anchor(&self, tunnel_id: i64, from: i64) -> Result<Option<ConnectionHandle>> {
        let anchor = match read(&self.tunnels)?.get(tunnel_id) {
            Some(tunnel) if tunnel.target == from => tunnel.anchor,
            _ => return Ok(None),
        };
        Ok(self.client(anchor)?.map(|c| c.handle))
    }

    pub fn tunnels(&self) -> Result<Vec<Tunnel>> {
        Ok(read(&self.tunnels)?.iter().cloned().collect())
    }
}
