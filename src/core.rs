//! The top-level facade assembling a [`Graph`], [`TagStore`], and the
//! transfer engine behind one construction parameter, mirroring the
//! teacher crate's `AppConfig` -> `RegistryClient` assembly
//! (SPEC_FULL.md §6 ambient addition).

use crate::config::Config;
use crate::error::TransferError;
use crate::event::{EventSink, NullSink};
use crate::graph::{Graph, GraphDriver};
use crate::manifest::{ManifestSigner, ManifestVerifier, TrustService};
use crate::tagstore::TagStore;
use crate::transfer::{endpoint, puller_v1, puller_v2, pusher_v1, pusher_v2, EndpointList, Version};
use std::sync::Arc;

/// Owns the on-disk [`Graph`] and [`TagStore`] for one daemon instance,
/// and drives the pull/push state machines against a caller-supplied
/// [`Repository`] + [`EndpointList`] (the wire transport itself stays
/// out of scope, spec.md §1).
pub struct Core {
    config: Config,
    graph: Arc<Graph>,
    tagstore: TagStore,
    sink: Arc<dyn EventSink>,
}

impl Core {
    pub async fn new(config: Config, driver: Arc<dyn GraphDriver>) -> Result<Self, crate::error::TagStoreError> {
        Self::with_sink(config, driver, Arc::new(NullSink)).await
    }

    pub async fn with_sink(
        config: Config,
        driver: Arc<dyn GraphDriver>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, crate::error::TagStoreError> {
        let graph = Arc::new(Graph::with_sink(config.graph_root.clone(), driver, sink.clone()).await?);
        let tagstore = TagStore::with_sink(config.tag_store_path.clone(), graph.clone(), sink.clone()).await?;
        Ok(Self { config, graph, tagstore, sink })
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn tagstore(&self) -> &TagStore {
        &self.tagstore
    }

    /// Pulls `repository:reference`, trying each endpoint `endpoints`
    /// returns in order and falling back per spec.md §4.5.
    pub async fn pull(
        &self,
        repository: &str,
        reference: &str,
        endpoints: &dyn EndpointList,
        session: &dyn crate::transfer::RegistrySession,
        verifier: &dyn ManifestVerifier,
        trust: &dyn TrustService,
    ) -> Result<(), TransferError> {
        let canonical_name = repository;
        let repo_handle = session.open(canonical_name).await?;
        let list = endpoints.endpoints_for(canonical_name).await;

        endpoint::run_with_fallback(&list, |endpoint| {
            let repo_handle = repo_handle.as_ref();
            Box::pin(async move {
                match endpoint.version {
                    Version::V2 => {
                        puller_v2::pull(
                            endpoint,
                            repository,
                            reference,
                            repo_handle,
                            &self.graph,
                            &self.tagstore,
                            verifier,
                            trust,
                            self.sink.as_ref(),
                        )
                        .await
                    }
                    Version::V1 => {
                        puller_v1::pull(
                            endpoint,
                            repository,
                            reference,
                            repo_handle,
                            &self.graph,
                            &self.tagstore,
                            &self.config.retry,
                            self.sink.as_ref(),
                        )
                        .await
                    }
                }
            })
        })
        .await
    }

    /// Pushes `repository:reference`, trying each endpoint in order.
    pub async fn push(
        &self,
        repository: &str,
        reference: &str,
        endpoints: &dyn EndpointList,
        session: &dyn crate::transfer::RegistrySession,
        signer: &dyn ManifestSigner,
    ) -> Result<(), TransferError> {
        let canonical_name = repository;
        let repo_handle = session.open(canonical_name).await?;
        let list = endpoints.endpoints_for(canonical_name).await;

        endpoint::run_with_fallback(&list, |endpoint| {
            let repo_handle = repo_handle.as_ref();
            Box::pin(async move {
                match endpoint.version {
                    Version::V2 => {
                        pusher_v2::push(
                            endpoint,
                            repository,
                            reference,
                            repo_handle,
                            &self.graph,
                            &self.tagstore,
                            signer,
                            self.sink.as_ref(),
                        )
                        .await
                    }
                    Version::V1 => {
                        pusher_v1::push(
                            endpoint,
                            repository,
                            reference,
                            repo_handle,
                            &self.graph,
                            &self.tagstore,
                            self.sink.as_ref(),
                        )
                        .await
                    }
                }
            })
        })
        .await
    }

    /// Tags `source` as `repository:tag_name` (spec.md §4.2 "tag").
    pub async fn tag(
        &self,
        repository: &str,
        tag_name: &str,
        source: &str,
        force: bool,
    ) -> Result<crate::graph::ImageId, crate::error::TagStoreError> {
        self.tagstore.tag(repository, tag_name, source, force, false).await
    }

    /// Exports `repository:reference` and its full parent chain as a tar
    /// stream per [`crate::export`] (spec.md §6 "Export format").
    pub async fn save(&self, names: &[String]) -> Result<Vec<u8>, crate::export::ExportError> {
        crate::export::save(&self.graph, &self.tagstore, names).await
    }

    /// Loads a tar stream produced by [`Self::save`] (spec.md §6 "Load").
    pub async fn load(&self, tar_bytes: &[u8]) -> Result<Vec<crate::graph::ImageId>, crate::export::ExportError> {
        crate::export::load(&self.graph, &self.tagstore, tar_bytes).await
    }
}
