//! Cinder volume queries and Nova volume attachments behind
//! [`VolumeBackend`].

use super::auth::Service;
use super::wire::{self, AttachmentList, VolumeBody, VolumeList};
use super::{Call, OpenStackBackend};
use crate::backend::{BackendFuture, VolumeBackend, VolumeInfo};

impl VolumeBackend for OpenStackBackend {
    fn list_volumes(&self) -> BackendFuture<'_, Vec<VolumeInfo>, Self::Error> {
        Box::pin(async move {
            let list: VolumeList = self
                .send_json(Call::get("list_volumes", Service::Volume, "/volumes/detail"))
                .await?;
            Ok(list.into_volumes())
        })
    }

    fn fetch_volume<'a>(
        &'a self,
        volume_id: &'a str,
    ) -> BackendFuture<'a, Option<VolumeInfo>, Self::Error> {
        Box::pin(async move {
            let path = format!("/volumes/{volume_id}");
            let body: Option<VolumeBody> = self
                .find_json(Call::get("fetch_volume", Service::Volume, &path))
                .await?;
            Ok(body.map(VolumeBody::into_volume))
        })
    }

    fn attach_volume<'a>(
        &'a self,
        server_id: &'a str,
        volume_id: &'a str,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let path = format!("/servers/{server_id}/os-volume_attachments");
            let body = wire::attach_volume_body(volume_id);
            self.send(Call::post("attach_volume", Service::Compute, &path, &body))
                .await?;
            Ok(())
        })
    }

    fn detach_volume<'a>(
        &'a self,
        server_id: &'a str,
        volume_id: &'a str,
    ) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let path = format!("/servers/{server_id}/os-volume_attachments/{volume_id}");
            self.remove(Call::delete("detach_volume", Service::Compute, &path))
                .await
        })
    }

    fn list_attachments<'a>(
        &'a self,
        server_id: &'a str,
    ) -> BackendFuture<'a, Vec<String>, Self::Error> {
        Box::pin(async move {
            let path = format!("/servers/{server_id}/os-volume_attachments");
            let list: AttachmentList = self
                .send_json(Call::get("list_attachments", Service::Compute, &path))
                .await?;
            Ok(list.into_volume_ids())
        })
    }
}
