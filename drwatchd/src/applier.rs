use crate::errors::Error;
use crate::reconcile::PatchKind;
use crate::reconcile::PatchRequest;

use kube::Api as KubeApi;
use kube::Client as KubeClient;
use kube::ResourceExt;
use kube::api::Patch as KubePatch;
use kube::api::PatchParams as KubePatchParams;
use kube::core::ApiResource;
use kube::core::DynamicObject;
use log;
use std::future::Future;

/*
 * Applier sends a computed patch to wherever the object lives. It gets one
 * attempt per request; retrying is left to the next update event.
 */
pub trait Applier {
    fn apply(&self, request: &PatchRequest) -> impl Future<Output = Result<(), Error>> + Send;
}

/*
 * KubeApplier patches objects through the dynamic API, so it works for any
 * resource described by an ApiResource.
 */
#[derive(Clone)]
pub struct KubeApplier {
    kube_client: KubeClient,
    resource: ApiResource,
}

impl KubeApplier {

    fn api(&self, namespace: Option<&str>) -> KubeApi<DynamicObject> {
	match namespace {
	    Some(namespace) => KubeApi::namespaced_with(self.kube_client.clone(), namespace, &self.resource),
	    None => KubeApi::all_with(self.kube_client.clone(), &self.resource),
	}
    }

    pub fn new(kube_client: KubeClient, resource: ApiResource) -> Self {
	Self{
	    kube_client: kube_client,
	    resource: resource,
	}
    }
}

impl Applier for KubeApplier {

    async fn apply(&self, request: &PatchRequest) -> Result<(), Error> {
	let api = self.api(request.namespace.as_deref());
	let patch = request.patch()?;
	let opts = KubePatchParams::default();

	let patched = match request.kind {
	    PatchKind::Merge => api.patch(&request.name, &opts, &KubePatch::Merge(patch)).await?,
	    PatchKind::Strategic => api.patch(&request.name, &opts, &KubePatch::Strategic(patch)).await?,
	};
	log::debug!("Patched {} {}, now at resourceVersion {:?}",
		    self.resource.kind, request.name, patched.resource_version());

	Ok(())
    }
}
