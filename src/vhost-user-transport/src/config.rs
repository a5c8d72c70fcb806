// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Socket configuration.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which end of the connection a socket plays.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketRole {
    /// Bind a path and accept front-end connections.
    #[default]
    Server,
    /// Connect to a path served by the peer.
    Client,
}

impl fmt::Display for SocketRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketRole::Server => write!(f, "server"),
            SocketRole::Client => write!(f, "client"),
        }
    }
}

/// Configuration of one vhost-user socket. Immutable once the socket is registered.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SocketConfig {
    /// Filesystem path of the socket. Paths longer than the platform `sun_path` limit are
    /// truncated, not rejected.
    pub path: String,
    /// Role of the socket.
    #[serde(default)]
    pub role: SocketRole,
    /// Retry failed connects in the background. Only meaningful for client sockets.
    #[serde(default)]
    pub reconnect: bool,
    /// Use the builtin virtio-net implementation for devices created on this socket.
    #[serde(default)]
    pub builtin_virtio_net: bool,
    /// Enable dequeue zero-copy for devices created on this socket.
    #[serde(default)]
    pub dequeue_zero_copy: bool,
    /// vDPA device to attach to devices created on this socket.
    #[serde(default)]
    pub vdpa_device_id: Option<u32>,
}

impl SocketConfig {
    /// Creates a server socket configuration for `path`.
    pub fn server(path: impl Into<String>) -> Self {
        SocketConfig {
            path: path.into(),
            role: SocketRole::Server,
            ..Default::default()
        }
    }

    /// Creates a client socket configuration for `path`.
    pub fn client(path: impl Into<String>, reconnect: bool) -> Self {
        SocketConfig {
            path: path.into(),
            role: SocketRole::Client,
            reconnect,
            ..Default::default()
        }
    }

    /// Whether failed connects and dropped connections on this socket are retried.
    pub fn reconnects(&self) -> bool {
        self.role == SocketRole::Client && self.reconnect
    }

    /// Parameters applied to every device created for a connection on this socket.
    pub fn device_params(&self) -> DeviceParams {
        DeviceParams {
            ifname: self.path.clone(),
            builtin_virtio_net: self.builtin_virtio_net,
            dequeue_zero_copy: self.dequeue_zero_copy,
            vdpa_device_id: self.vdpa_device_id,
        }
    }
}

/// Per-device parameters handed to the device layer when a connection is set up.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceParams {
    /// Interface name of the device, the socket path.
    pub ifname: String,
    /// See [`SocketConfig::builtin_virtio_net`].
    pub builtin_virtio_net: bool,
    /// See [`SocketConfig::dequeue_zero_copy`].
    pub dequeue_zero_copy: bool,
    /// See [`SocketConfig::vdpa_device_id`].
    pub vdpa_device_id: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_defaults() {
        let config: SocketConfig =
            serde_json::from_str(r#"{ "path": "/tmp/vhost.sock" }"#).unwrap();
        assert_eq!(config, SocketConfig::server("/tmp/vhost.sock"));
        assert!(!config.reconnects());
    }

    #[test]
    fn test_deserialize_client() {
        let config: SocketConfig = serde_json::from_str(
            r#"{
                "path": "/tmp/vhost.sock",
                "role": "client",
                "reconnect": true,
                "dequeue_zero_copy": true,
                "vdpa_device_id": 3
            }"#,
        )
        .unwrap();
        assert_eq!(config.role, SocketRole::Client);
        assert!(config.reconnects());

        let params = config.device_params();
        assert_eq!(params.ifname, "/tmp/vhost.sock");
        assert!(params.dequeue_zero_copy);
        assert!(!params.builtin_virtio_net);
        assert_eq!(params.vdpa_device_id, Some(3));
    }

    #[test]
    fn test_deserialize_rejects_unknown() {
        serde_json::from_str::<SocketConfig>(r#"{ "path": "/a", "backlog": 5 }"#).unwrap_err();
        serde_json::from_str::<SocketConfig>(r#"{ "path": "/a", "role": "peer" }"#).unwrap_err();
    }

    #[test]
    fn test_server_never_reconnects() {
        let mut config = SocketConfig::server("/a");
        config.reconnect = true;
        assert!(!config.reconnects());
        assert!(SocketConfig::client("/a", true).reconnects());
        assert!(!SocketConfig::client("/a", false).reconnects());
    }
}
