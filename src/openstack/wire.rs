//! Request and response bodies for Nova, Cinder, Glance and Neutron.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::backend::{
    NamedResource, ServerRequest, ServerSnapshot, VolumeAttachment, VolumeInfo,
};

#[derive(Debug, Deserialize)]
pub(super) struct NamedList {
    #[serde(default, alias = "flavors", alias = "images", alias = "networks")]
    items: Vec<Named>,
}

#[derive(Debug, Deserialize)]
struct Named {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

impl NamedList {
    /// First entry whose name equals `name`.
    pub(super) fn find(self, name: &str) -> Option<NamedResource> {
        self.items
            .into_iter()
            .find(|item| item.name.as_deref() == Some(name))
            .map(|item| NamedResource {
                id: item.id,
                name: name.to_owned(),
            })
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct CreatedServer {
    #[serde(default)]
    server: Option<ServerRef>,
}

#[derive(Debug, Deserialize)]
struct ServerRef {
    id: String,
}

impl CreatedServer {
    pub(super) fn into_id(self) -> Option<String> {
        self.server.map(|server| server.id)
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct ServerBody {
    server: Server,
}

#[derive(Debug, Deserialize)]
struct Server {
    id: String,
    status: String,
    #[serde(default)]
    addresses: BTreeMap<String, Vec<Address>>,
    #[serde(default)]
    fault: Option<Fault>,
}

#[derive(Debug, Deserialize)]
struct Address {
    addr: String,
}

#[derive(Debug, Deserialize)]
struct Fault {
    #[serde(default)]
    message: String,
    #[serde(default)]
    details: Option<String>,
}

impl ServerBody {
    pub(super) fn into_snapshot(self) -> ServerSnapshot {
        let server = self.server;
        let addresses = server
            .addresses
            .into_iter()
            .map(|(network, entries)| {
                let parsed = entries
                    .iter()
                    .filter_map(|entry| entry.addr.parse::<IpAddr>().ok())
                    .collect();
                (network, parsed)
            })
            .collect();
        let fault = server.fault.map(|fault| match fault.details {
            Some(details) if !details.is_empty() => format!("{}: {details}", fault.message),
            _ => fault.message,
        });
        ServerSnapshot {
            id: server.id,
            status: server.status,
            addresses,
            fault,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct ImageBody {
    status: String,
}

impl ImageBody {
    pub(super) fn into_status(self) -> String {
        self.status
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct SnapshotCreated {
    image_id: String,
}

impl SnapshotCreated {
    pub(super) fn into_id(self) -> String {
        self.image_id
    }
}

/// Image id from the `Location` header older compute APIs return for
/// `createImage`.
pub(super) fn image_id_from_location(location: &str) -> Option<String> {
    location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
}

#[derive(Debug, Deserialize)]
pub(super) struct VolumeList {
    volumes: Vec<Volume>,
}

#[derive(Debug, Deserialize)]
pub(super) struct VolumeBody {
    volume: Volume,
}

#[derive(Debug, Deserialize)]
struct Volume {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    attachments: Vec<CinderAttachment>,
}

#[derive(Debug, Deserialize)]
struct CinderAttachment {
    server_id: String,
    #[serde(default)]
    device: Option<String>,
}

impl From<Volume> for VolumeInfo {
    fn from(value: Volume) -> Self {
        Self {
            name: value.name.unwrap_or_else(|| value.id.clone()),
            id: value.id,
            attachments: value
                .attachments
                .into_iter()
                .map(|attachment| VolumeAttachment {
                    server_id: attachment.server_id,
                    device: attachment.device,
                })
                .collect(),
        }
    }
}

impl VolumeList {
    pub(super) fn into_volumes(self) -> Vec<VolumeInfo> {
        self.volumes.into_iter().map(VolumeInfo::from).collect()
    }
}

impl VolumeBody {
    pub(super) fn into_volume(self) -> VolumeInfo {
        self.volume.into()
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct AttachmentList {
    #[serde(rename = "volumeAttachments", default)]
    attachments: Vec<NovaAttachment>,
}

#[derive(Debug, Deserialize)]
struct NovaAttachment {
    #[serde(rename = "volumeId")]
    volume_id: String,
}

impl AttachmentList {
    pub(super) fn into_volume_ids(self) -> Vec<String> {
        self.attachments
            .into_iter()
            .map(|attachment| attachment.volume_id)
            .collect()
    }
}

pub(super) fn create_server_body(request: &ServerRequest) -> Value {
    json!({
        "server": {
            "name": request.name,
            "imageRef": request.image_id,
            "flavorRef": request.flavor_id,
            "key_name": request.keypair,
            "networks": [{ "uuid": request.network_id }],
        }
    })
}

pub(super) fn attach_volume_body(volume_id: &str) -> Value {
    json!({ "volumeAttachment": { "volumeId": volume_id } })
}

pub(super) fn create_image_body(name: &str) -> Value {
    json!({ "createImage": { "name": name } })
}
