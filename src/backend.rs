//! Control-plane abstraction for the compute, image, network and volume
//! services a tasting session drives.

use std::collections::BTreeMap;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use thiserror::Error;

/// Server status reported once an instance has booted.
pub const STATUS_ACTIVE: &str = "ACTIVE";

/// Server status reported when the provider gave up building an instance.
pub const STATUS_ERROR: &str = "ERROR";

/// A named provider resource (image, flavor or network).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NamedResource {
    /// Provider identifier.
    pub id: String,
    /// Display name.
    pub name: String,
}

/// Parameters required to boot a server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerRequest {
    /// Name given to the server.
    pub name: String,
    /// Flavor identifier.
    pub flavor_id: String,
    /// Image identifier to boot from.
    pub image_id: String,
    /// Network identifier to attach the server to.
    pub network_id: String,
    /// Name of the keypair injected into the instance.
    pub keypair: String,
}

impl ServerRequest {
    /// Validates the request, returning a descriptive error when a required
    /// field is missing.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when any field is empty.
    pub fn validate(&self) -> Result<(), BackendError> {
        let fields = [
            ("name", &self.name),
            ("flavor_id", &self.flavor_id),
            ("image_id", &self.image_id),
            ("network_id", &self.network_id),
            ("keypair", &self.keypair),
        ];
        for (field, value) in fields {
            if value.trim().is_empty() {
                return Err(BackendError::Validation(field.to_owned()));
            }
        }
        Ok(())
    }
}

/// Handle returned by a backend once a server has been requested.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerHandle {
    /// Provider identifier for the server.
    pub id: String,
    /// Name the server was created with.
    pub name: String,
}

/// Point-in-time view of a server.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ServerSnapshot {
    /// Provider identifier.
    pub id: String,
    /// Provider status string (for example `BUILD` or `ACTIVE`).
    pub status: String,
    /// Addresses keyed by network name.
    pub addresses: BTreeMap<String, Vec<IpAddr>>,
    /// Fault message reported by the provider, if any.
    pub fault: Option<String>,
}

impl ServerSnapshot {
    /// Returns `true` once the server has finished booting.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status.eq_ignore_ascii_case(STATUS_ACTIVE)
    }

    /// Returns `true` when the provider marked the build as failed.
    #[must_use]
    pub fn is_faulted(&self) -> bool {
        self.status.eq_ignore_ascii_case(STATUS_ERROR)
    }

    /// First address on `network`, preferring IPv4.
    #[must_use]
    pub fn address_on(&self, network: &str) -> Option<IpAddr> {
        let addresses = self.addresses.get(network)?;
        addresses
            .iter()
            .find(|address| address.is_ipv4())
            .or_else(|| addresses.first())
            .copied()
    }
}

/// One attachment of a volume to a server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeAttachment {
    /// Server the volume is attached to.
    pub server_id: String,
    /// Device path reported by the provider (for example `/dev/vdb`).
    pub device: Option<String>,
}

/// Point-in-time view of a block storage volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeInfo {
    /// Provider identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Current attachments.
    pub attachments: Vec<VolumeAttachment>,
}

impl VolumeInfo {
    /// Returns `true` when the volume is attached anywhere.
    #[must_use]
    pub const fn is_attached(&self) -> bool {
        !self.attachments.is_empty()
    }

    /// Attachment to `server_id`, if present.
    #[must_use]
    pub fn attachment_to(&self, server_id: &str) -> Option<&VolumeAttachment> {
        self.attachments
            .iter()
            .find(|attachment| attachment.server_id == server_id)
    }
}

/// Errors raised by backend-independent validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum BackendError {
    /// Raised when a request is missing a required field.
    #[error("missing or empty field: {0}")]
    Validation(String),
}

/// Future returned by backend operations.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Compute and image operations needed to boot, inspect and remove a server.
pub trait Backend: Send + Sync {
    /// Provider specific error type returned by the backend.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Looks up an image by exact name.
    fn find_image<'a>(
        &'a self,
        name: &'a str,
    ) -> BackendFuture<'a, Option<NamedResource>, Self::Error>;

    /// Looks up a flavor by exact name.
    fn find_flavor<'a>(
        &'a self,
        name: &'a str,
    ) -> BackendFuture<'a, Option<NamedResource>, Self::Error>;

    /// Looks up a network by exact name.
    fn find_network<'a>(
        &'a self,
        name: &'a str,
    ) -> BackendFuture<'a, Option<NamedResource>, Self::Error>;

    /// Requests a new server. `None` means the provider accepted the call
    /// but returned no server.
    fn create_server<'a>(
        &'a self,
        request: &'a ServerRequest,
    ) -> BackendFuture<'a, Option<ServerHandle>, Self::Error>;

    /// Fetches the current state of a server; `None` once it no longer
    /// exists.
    fn fetch_server<'a>(
        &'a self,
        server_id: &'a str,
    ) -> BackendFuture<'a, Option<ServerSnapshot>, Self::Error>;

    /// Deletes a server. Deleting a server that is already gone succeeds.
    fn delete_server<'a>(&'a self, server_id: &'a str) -> BackendFuture<'a, (), Self::Error>;

    /// Captures the server's disk as a new image and returns its identifier.
    fn create_snapshot<'a>(
        &'a self,
        server_id: &'a str,
        name: &'a str,
    ) -> BackendFuture<'a, String, Self::Error>;

    /// Current status of an image (for example `queued` or `active`).
    fn image_status<'a>(
        &'a self,
        image_id: &'a str,
    ) -> BackendFuture<'a, Option<String>, Self::Error>;
}

/// Block storage operations used by the volume workflow.
pub trait VolumeBackend: Backend {
    /// Lists every volume visible to the project.
    fn list_volumes(&self) -> BackendFuture<'_, Vec<VolumeInfo>, Self::Error>;

    /// Fetches a single volume; `None` when it does not exist.
    fn fetch_volume<'a>(
        &'a self,
        volume_id: &'a str,
    ) -> BackendFuture<'a, Option<VolumeInfo>, Self::Error>;

    /// Requests that `volume_id` be attached to `server_id`.
    fn attach_volume<'a>(
        &'a self,
        server_id: &'a str,
        volume_id: &'a str,
    ) -> BackendFuture<'a, (), Self::Error>;

    /// Requests that `volume_id` be detached from `server_id`.
    ///
    /// A volume that is not attached to the server counts as detached.
    fn detach_volume<'a>(
        &'a self,
        server_id: &'a str,
        volume_id: &'a str,
    ) -> BackendFuture<'a, (), Self::Error>;

    /// Lists the volume identifiers currently attached to `server_id`.
    fn list_attachments<'a>(
        &'a self,
        server_id: &'a str,
    ) -> BackendFuture<'a, Vec<String>, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn request() -> ServerRequest {
        ServerRequest {
            name: String::from("taster-20240101_000000-ubuntu"),
            flavor_id: String::from("1"),
            image_id: String::from("img"),
            network_id: String::from("net"),
            keypair: String::from("ci"),
        }
    }

    #[rstest]
    fn complete_request_validates() {
        assert_eq!(request().validate(), Ok(()));
    }

    #[rstest]
    fn blank_keypair_is_rejected() {
        let mut incomplete = request();
        incomplete.keypair = String::from("  ");
        assert_eq!(
            incomplete.validate(),
            Err(BackendError::Validation(String::from("keypair")))
        );
    }

    #[rstest]
    fn address_lookup_prefers_ipv4() {
        let mut server = ServerSnapshot::default();
        server.addresses.insert(
            String::from("public"),
            vec![
                IpAddr::V6(Ipv6Addr::LOCALHOST),
                IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)),
            ],
        );

        assert_eq!(
            server.address_on("public"),
            Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)))
        );
        assert_eq!(server.address_on("private"), None);
    }

    #[rstest]
    #[case("ACTIVE", true, false)]
    #[case("active", true, false)]
    #[case("BUILD", false, false)]
    #[case("ERROR", false, true)]
    fn status_predicates(#[case] status: &str, #[case] active: bool, #[case] faulted: bool) {
        let server = ServerSnapshot {
            status: status.to_owned(),
            ..ServerSnapshot::default()
        };
        assert_eq!(server.is_active(), active);
        assert_eq!(server.is_faulted(), faulted);
    }
}
