use async_trait::async_trait;
use kube::api::{Api, DynamicObject, ListParams, PostParams};
use kube::discovery::{ApiResource, Discovery};
use tracing::debug;

use crate::error::{EncryptionError, EncryptionResult};
use crate::keys::GroupResource;

use super::in_process::ObjectRewriter;

const PAGE_SIZE: u32 = 500;

/// key: kube-object-rewriter
/// Rewrites objects through the API server: a no-op replace makes the server
/// store each object again, encrypted with its current write key.
#[derive(Clone)]
pub struct KubeObjectRewriter {
    client: kube::Client,
}

impl KubeObjectRewriter {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    async fn resolve(&self, resource: &GroupResource) -> EncryptionResult<ApiResource> {
        let discovery = Discovery::new(self.client.clone())
            .filter(&[resource.group.as_str()])
            .run()
            .await?;
        let found = discovery
            .groups()
            .flat_map(|group| group.recommended_resources())
            .map(|(api_resource, _)| api_resource)
            .find(|api_resource| api_resource.plural == resource.resource)
            .ok_or_else(|| {
                EncryptionError::Migration(format!("resource {resource} is not served"))
            });
        found
    }

    fn api_for(&self, api_resource: &ApiResource, object: &DynamicObject) -> Api<DynamicObject> {
        match object.metadata.namespace.as_deref() {
            Some(namespace) => {
                Api::namespaced_with(self.client.clone(), namespace, api_resource)
            }
            None => Api::all_with(self.client.clone(), api_resource),
        }
    }
}

#[async_trait]
impl ObjectRewriter for KubeObjectRewriter {
    async fn rewrite_all(&self, resource: &GroupResource) -> EncryptionResult<usize> {
        let api_resource = self.resolve(resource).await?;
        let listing: Api<DynamicObject> = Api::all_with(self.client.clone(), &api_resource);

        let mut rewritten = 0;
        let mut continue_token: Option<String> = None;
        loop {
            let mut params = ListParams::default().limit(PAGE_SIZE);
            if let Some(token) = &continue_token {
                params = params.continue_token(token);
            }
            let page = listing.list(&params).await?;

            for object in &page.items {
                let Some(name) = object.metadata.name.as_deref() else {
                    continue;
                };
                let api = self.api_for(&api_resource, object);
                match api.replace(name, &PostParams::default(), object).await {
                    Ok(_) => rewritten += 1,
                    // changed or deleted since listed: already stored with the new key
                    Err(kube::Error::Api(response)) if response.code == 409 || response.code == 404 => {
                        debug!(%resource, name, code = response.code, "object changed during migration");
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            continue_token = page.metadata.continue_.filter(|token| !token.is_empty());
            if continue_token.is_none() {
                break;
            }
        }
        Ok(rewritten)
    }
}
