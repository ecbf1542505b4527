//! Nova, Glance and Neutron calls behind [`Backend`].

use reqwest::header::LOCATION;

use super::auth::Service;
use super::wire::{self, CreatedServer, ImageBody, NamedList, ServerBody, SnapshotCreated};
use super::{Call, OpenStackBackend, OpenStackError};
use crate::backend::{
    Backend, BackendFuture, NamedResource, ServerHandle, ServerRequest, ServerSnapshot,
};

impl OpenStackBackend {
    async fn find_named(
        &self,
        call: Call<'_>,
        name: &str,
    ) -> Result<Option<NamedResource>, OpenStackError> {
        let list: NamedList = self.send_json(call).await?;
        Ok(list.find(name))
    }

    async fn snapshot_server(
        &self,
        server_id: &str,
        name: &str,
    ) -> Result<String, OpenStackError> {
        let path = format!("/servers/{server_id}/action");
        let body = wire::create_image_body(name);
        let response = self
            .send(Call::post("create_snapshot", Service::Compute, &path, &body))
            .await?;

        let from_header = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .and_then(wire::image_id_from_location);
        if let Some(image_id) = from_header {
            return Ok(image_id);
        }
        let text = response.text().await?;
        serde_json::from_str::<SnapshotCreated>(&text)
            .map(SnapshotCreated::into_id)
            .map_err(|err| OpenStackError::Decode {
                action: String::from("create_snapshot"),
                message: err.to_string(),
            })
    }
}

impl Backend for OpenStackBackend {
    type Error = OpenStackError;

    fn find_image<'a>(
        &'a self,
        name: &'a str,
    ) -> BackendFuture<'a, Option<NamedResource>, Self::Error> {
        Box::pin(async move {
            let query = [("name", name)];
            let call = Call::get("find_image", Service::Image, "/v2/images").with_query(&query);
            self.find_named(call, name).await
        })
    }

    fn find_flavor<'a>(
        &'a self,
        name: &'a str,
    ) -> BackendFuture<'a, Option<NamedResource>, Self::Error> {
        Box::pin(async move {
            let call = Call::get("find_flavor", Service::Compute, "/flavors");
            self.find_named(call, name).await
        })
    }

    fn find_network<'a>(
        &'a self,
        name: &'a str,
    ) -> BackendFuture<'a, Option<NamedResource>, Self::Error> {
        Box::pin(async move {
            let query = [("name", name)];
            let call =
                Call::get("find_network", Service::Network, "/v2.0/networks").with_query(&query);
            self.find_named(call, name).await
        })
    }

    fn create_server<'a>(
        &'a self,
        request: &'a ServerRequest,
    ) -> BackendFuture<'a, Option<ServerHandle>, Self::Error> {
        Box::pin(async move {
            request.validate()?;
            let body = wire::create_server_body(request);
            let created: CreatedServer = self
                .send_json(Call::post("create_server", Service::Compute, "/servers", &body))
                .await?;
            Ok(created.into_id().map(|id| ServerHandle {
                id,
                name: request.name.clone(),
            }))
        })
    }

    fn fetch_server<'a>(
        &'a self,
        server_id: &'a str,
    ) -> BackendFuture<'a, Option<ServerSnapshot>, Self::Error> {
        Box::pin(async move {
            let path = format!("/servers/{server_id}");
            let body: Option<ServerBody> = self
                .find_json(Call::get("fetch_server", Service::Compute, &path))
                .await?;
            Ok(body.map(ServerBody::into_snapshot))
        })
    }

    fn delete_server<'a>(&'a self, server_id: &'a str) -> BackendFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let path = format!("/servers/{server_id}");
            self.remove(Call::delete("delete_server", Service::Compute, &path))
                .await
        })
    }

    fn create_snapshot<'a>(
        &'a self,
        server_id: &'a str,
        name: &'a str,
    ) -> BackendFuture<'a, String, Self::Error> {
        Box::pin(self.snapshot_server(server_id, name))
    }

    fn image_status<'a>(
        &'a self,
        image_id: &'a str,
    ) -> BackendFuture<'a, Option<String>, Self::Error> {
        Box::pin(async move {
            let path = format!("/v2/images/{image_id}");
            let body: Option<ImageBody> = self
                .find_json(Call::get("image_status", Service::Image, &path))
                .await?;
            Ok(body.map(ImageBody::into_status))
        })
    }
}
