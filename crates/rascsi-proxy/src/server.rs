//! Proxy server.
//!
//! Each client connection carries exactly one command:
//!
//! 1. read the `RASCSI` magic and one length-prefixed frame
//! 2. decode the command and classify its operation
//! 3. run `attach`/`insert` hooks, forward the original bytes upstream,
//!    run `detach`/`eject` hooks
//! 4. write the upstream response back (length prefix only) and close
//!
//! Every upstream exchange opens its own connection. If the upstream cannot
//! be reached the client connection is closed without a response.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use rascsi_control::proto::{PbCommand, PbOperation};
use rascsi_control::{
    EngineClient, SocketTransport, decode_command, device_type_name, read_frame, read_magic,
    write_frame,
};
use rascsi_core::Result;

use crate::plugin::{DeviceEvent, Hook, PluginRegistry};

/// Listening proxy bound to one upstream engine.
pub struct ProxyServer {
    listener: TcpListener,
    upstream: SocketTransport,
    plugins: Arc<PluginRegistry>,
}

impl ProxyServer {
    pub async fn bind(addr: SocketAddr, upstream: SocketTransport, plugins: PluginRegistry) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            upstream,
            plugins: Arc::new(plugins),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever, one task per connection.
    pub async fn run(self) -> Result<()> {
        info!(
            addr = %self.local_addr()?,
            upstream = %self.upstream.endpoint(),
            plugins = self.plugins.len(),
            "Proxy listening"
        );

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Client connected");
                    let upstream = self.upstream.clone();
                    let plugins = Arc::clone(&self.plugins);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, &upstream, &plugins).await {
                            warn!(peer = %peer, kind = e.kind().as_str(), error = %e, "Proxy connection closed");
                        }
                    });
                }
                Err(e) => debug!(error = %e, "Accept error"),
            }
        }
    }
}

/// Serve one client command.
pub async fn handle_connection<S>(mut stream: S, upstream: &SocketTransport, plugins: &PluginRegistry) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    read_magic(&mut stream).await?;
    let payload = read_frame(&mut stream).await?;
    let cmd = decode_command(&payload)?;
    let operation = PbOperation::try_from(cmd.operation).unwrap_or(PbOperation::NoOperation);
    debug!(
        operation = operation.as_str_name(),
        devices = cmd.devices.len(),
        "Proxying command"
    );

    let response = match operation {
        PbOperation::Attach | PbOperation::Insert => {
            let hook = if operation == PbOperation::Attach {
                Hook::Attach
            } else {
                Hook::Insert
            };
            let events = media_events(&metadata_client(upstream, &cmd), &cmd)
                .await
                .unwrap_or_else(|e| {
                    warn!(error = %e, "Media lookup failed, skipping hooks");
                    Vec::new()
                });
            plugins.dispatch(hook, &events).await;
            upstream.send(&payload).await?
        }
        PbOperation::Detach | PbOperation::Eject => {
            let hook = if operation == PbOperation::Detach {
                Hook::Detach
            } else {
                Hook::Eject
            };
            let events = current_events(&metadata_client(upstream, &cmd), &cmd)
                .await
                .unwrap_or_else(|e| {
                    warn!(error = %e, "Device lookup failed, skipping hooks");
                    Vec::new()
                });
            let response = upstream.send(&payload).await?;
            plugins.dispatch(hook, &events).await;
            response
        }
        _ => upstream.send(&payload).await?,
    };

    write_frame(&mut stream, &response).await
}

/// Client for the proxy's own lookups, carrying the caller's token.
fn metadata_client(upstream: &SocketTransport, cmd: &PbCommand) -> EngineClient {
    EngineClient::new(upstream.clone()).with_token(cmd.params.get("token").cloned())
}

/// Events for the media an ATTACH or INSERT is about to load.
///
/// Relative file names resolve against the engine's image directory.
/// Devices without a file produce no event, and so does every device
/// when the engine does not report its image folder.
async fn media_events(client: &EngineClient, cmd: &PbCommand) -> Result<Vec<DeviceEvent>> {
    let query = client.command(PbOperation::DefaultImageFilesInfo).build();
    let result = client.send_command(&query).await?;
    let folder = result
        .image_files_info
        .map(|info| info.default_image_folder)
        .unwrap_or_default();
    if folder.is_empty() {
        warn!(status = result.status, message = %result.msg, "Image folder unknown, skipping hooks");
        return Ok(Vec::new());
    }
    let images_dir = PathBuf::from(folder);
    let events = cmd
        .devices
        .iter()
        .filter_map(|device| {
            let file = device.params.get("file").filter(|f| !f.is_empty())?;
            Some(DeviceEvent {
                id: device.id.max(0) as u32,
                unit: device.unit.max(0) as u32,
                device_type: device_type_name(device.r#type),
                path: resolve_image(&images_dir, file),
            })
        })
        .collect();
    Ok(events)
}

/// Events for the media a DETACH or EJECT is about to release, captured
/// with one `DEVICES_INFO` per device before the command is forwarded.
async fn current_events(client: &EngineClient, cmd: &PbCommand) -> Result<Vec<DeviceEvent>> {
    let mut events = Vec::with_capacity(cmd.devices.len());
    for device in &cmd.devices {
        let id = device.id.max(0) as u32;
        let unit = device.unit.max(0) as u32;
        let query = client.command(PbOperation::DevicesInfo).slot(id, Some(unit)).build();
        let result = client.send_command(&query).await?;

        let Some(current) = result.devices_info.and_then(|info| info.devices.into_iter().next()) else {
            debug!(id, unit, message = %result.msg, "No device to observe");
            continue;
        };
        let image = current.file.map(|f| f.name).unwrap_or_default();
        if image.is_empty() {
            debug!(id, unit, "Device has no media");
            continue;
        }
        events.push(DeviceEvent {
            id,
            unit,
            device_type: device_type_name(current.r#type),
            path: PathBuf::from(image),
        });
    }
    Ok(events)
}

fn resolve_image(images_dir: &Path, file: &str) -> PathBuf {
    let file = Path::new(file);
    if file.is_absolute() {
        file.to_path_buf()
    } else {
        images_dir.join(file)
    }
}
