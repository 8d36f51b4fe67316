//! Kubernetes API implementation of the cluster interfaces

use super::{ClusterError, ClusterReader, ClusterWriter, SealedSecretRef};
use crate::constants::{DEFAULT_LIST_PAGE_SIZE, FIELD_MANAGER};
use crate::crd::SealedSecret;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams, PostParams};
use kube::Client;
use tracing::debug;

/// Cluster access backed by a kube [`Client`]
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    page_size: u32,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            page_size: DEFAULT_LIST_PAGE_SIZE,
        }
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn sealed_secrets(&self, namespace: Option<&str>) -> Api<SealedSecret> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn post_params(dry_run: bool) -> PostParams {
        PostParams {
            dry_run,
            field_manager: Some(FIELD_MANAGER.to_string()),
        }
    }
}

#[async_trait]
impl ClusterReader for KubeCluster {
    fn list_sealed_secrets<'a>(
        &'a self,
        namespace: Option<&'a str>,
    ) -> BoxStream<'a, Result<SealedSecretRef, ClusterError>> {
        let api = self.sealed_secrets(namespace);
        let page_size = self.page_size;
        let scope = namespace.unwrap_or("*").to_string();

        // State is the continue token of the next page; `None` once the last page was read
        stream::try_unfold(Some(String::new()), move |token| {
            let api = api.clone();
            let scope = scope.clone();
            async move {
                let Some(token) = token else {
                    return Ok(None);
                };
                let mut params = ListParams::default().limit(page_size);
                if !token.is_empty() {
                    params = params.continue_token(&token);
                }
                let page = api
                    .list(&params)
                    .await
                    .map_err(|e| classify(e, "SealedSecret", &scope, ""))?;
                let next = page.metadata.continue_.clone().filter(|t| !t.is_empty());
                debug!(
                    namespace = %scope,
                    items = page.items.len(),
                    more = next.is_some(),
                    "Listed SealedSecret page"
                );
                let refs: Vec<Result<SealedSecretRef, ClusterError>> = page
                    .items
                    .iter()
                    .filter_map(SealedSecret::reference)
                    .map(Ok)
                    .collect();
                Ok(Some((stream::iter(refs), next)))
            }
        })
        .try_flatten()
        .boxed()
    }

    async fn fetch_sealed_secret(
        &self,
        reference: &SealedSecretRef,
    ) -> Result<SealedSecret, ClusterError> {
        let api: Api<SealedSecret> = Api::namespaced(self.client.clone(), &reference.namespace);
        api.get(&reference.name)
            .await
            .map_err(|e| classify(e, "SealedSecret", &reference.namespace, &reference.name))
    }

    async fn fetch_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Secret>, ClusterError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| classify(e, "Secret", namespace, name))
    }
}

#[async_trait]
impl ClusterWriter for KubeCluster {
    async fn dry_run_update(&self, object: &SealedSecret) -> Result<(), ClusterError> {
        let (namespace, name) = identity(object);
        let api: Api<SealedSecret> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&name, &Self::post_params(true), object)
            .await
            .map(|_| ())
            .map_err(|e| classify(e, "SealedSecret", &namespace, &name))
    }

    async fn update_sealed_secret(
        &self,
        object: &SealedSecret,
    ) -> Result<SealedSecret, ClusterError> {
        let (namespace, name) = identity(object);
        let api: Api<SealedSecret> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&name, &Self::post_params(false), object)
            .await
            .map_err(|e| classify(e, "SealedSecret", &namespace, &name))
    }
}

fn identity(object: &SealedSecret) -> (String, String) {
    (
        object.metadata.namespace.clone().unwrap_or_default(),
        object.metadata.name.clone().unwrap_or_default(),
    )
}

/// Map a kube client error onto the cluster error taxonomy
fn classify(err: kube::Error, kind: &'static str, namespace: &str, name: &str) -> ClusterError {
    match err {
        kube::Error::Api(response) => {
            classify_status(response.code, response.message.clone(), kind, namespace, name)
        }
        other => ClusterError::Unreachable(other.to_string()),
    }
}

fn classify_status(
    code: u16,
    message: String,
    kind: &'static str,
    namespace: &str,
    name: &str,
) -> ClusterError {
    match code {
        404 => ClusterError::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        409 => ClusterError::Conflict {
            resource: format!("{namespace}/{name}"),
            message,
        },
        429 | 500..=599 => ClusterError::Unreachable(format!("HTTP {code}: {message}")),
        _ => ClusterError::Rejected { code, message },
    }
}
