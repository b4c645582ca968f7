use crate::applier::Applier;
use crate::reconcile::PatchRequest;
use crate::reconcile::Reconciler;
use drwatch_api as api;

use futures::Stream;
use futures::StreamExt;
use kube::Resource;
use kube::ResourceExt;
use kube::core::DynamicObject;
use kube::runtime::watcher as kube_watcher;
use kube::runtime::watcher::Event as KubeWatcherEvent;
use log;
use std::collections::HashMap;
use std::collections::HashSet;
use std::future::Future;

/*
 * What happened to an object, as opposed to what the watch stream said: the
 * stream can't tell an add from an update, the cache below can.
 */
#[derive(Clone, Debug, PartialEq)]
pub enum Notification<K> {
    Added(K),
    Updated {
	old: K,
	cur: K,
    },
    Deleted(K),
}

/*
 * `namespace/name` for namespaced objects, `name` otherwise.
 */
pub fn object_key<K: Resource>(obj: &K) -> String {
    match obj.namespace() {
	Some(namespace) => format!("{}/{}", namespace, obj.name_any()),
	None => obj.name_any(),
    }
}

/*
 * ObjectCache remembers the last version of every object seen on the watch,
 * which is what turns watcher events into add/update/delete notifications.
 *
 * A relist (Init, InitApply..., InitDone) reports as deleted every object that
 * the relist did not return.
 */
pub struct ObjectCache<K> {
    objects: HashMap<String, K>,
    relisted: Option<HashSet<String>>,
}

impl<K: Resource + Clone> ObjectCache<K> {

    pub fn new() -> Self {
	Self{
	    objects: HashMap::new(),
	    relisted: None,
	}
    }

    pub fn len(&self) -> usize {
	self.objects.len()
    }

    fn upsert(&mut self, obj: K) -> Notification<K> {
	match self.objects.insert(object_key(&obj), obj.clone()) {
	    Some(old) => Notification::Updated{ old: old, cur: obj },
	    None => Notification::Added(obj),
	}
    }

    pub fn observe(&mut self, event: KubeWatcherEvent<K>) -> Vec<Notification<K>> {
	match event {
	    KubeWatcherEvent::Apply(obj) => vec![self.upsert(obj)],
	    KubeWatcherEvent::Delete(obj) => {
		self.objects.remove(&object_key(&obj));
		vec![Notification::Deleted(obj)]
	    },
	    KubeWatcherEvent::Init => {
		log::debug!("Relist started with {} known objects", self.objects.len());
		self.relisted = Some(HashSet::new());
		vec![]
	    },
	    KubeWatcherEvent::InitApply(obj) => {
		if let Some(seen) = self.relisted.as_mut() {
		    seen.insert(object_key(&obj));
		}
		vec![self.upsert(obj)]
	    },
	    KubeWatcherEvent::InitDone => {
		let seen = match self.relisted.take() {
		    Some(seen) => seen,
		    None => return vec![],
		};

		let mut gone: Vec<String> = self.objects.keys()
		    .filter(|key| !seen.contains(*key))
		    .cloned()
		    .collect();
		gone.sort();
		log::debug!("Relist done, {} objects vanished", gone.len());

		gone.into_iter()
		    .filter_map(|key| self.objects.remove(&key))
		    .map(Notification::Deleted)
		    .collect()
	    },
	}
    }
}

/*
 * What the handler did with a notification.
 */
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    Observed,
    AlreadyMarked,
    DryRun(PatchRequest),
    Patched(PatchRequest),
    Failed,
}

pub struct EventHandler<A> {
    reconciler: Reconciler,
    applier: A,
    annotate_on_add: bool,
    dry_run: bool,
}

impl<A: Applier> EventHandler<A> {

    fn describe(obj: &DynamicObject) {
	let key = object_key(obj);

	log::info!("DestinationRule ADD {}", key);
	match api::destinationrule::spec_of(obj) {
	    Ok(spec) => log::info!("\t {}", spec.summary()),
	    Err(err) => log::error!("Unable to read the spec of DestinationRule {}: {}", key, err),
	}
    }

    async fn reconcile(&self, obj: &DynamicObject) -> Outcome {
	let key = object_key(obj);

	let request = match self.reconciler.reconcile(obj) {
	    Ok(Some(request)) => request,
	    Ok(None) => {
		log::debug!("DestinationRule {} already carries {}", key, self.reconciler.marker().key);
		return Outcome::AlreadyMarked;
	    },
	    Err(err) => {
		log::error!("Unable to compute annotation patch for {}: {}", key, err);
		return Outcome::Failed;
	    },
	};

	log::info!("DestinationRule {} annotation updated, diff: {}", key, String::from_utf8_lossy(&request.body));
	if self.dry_run {
	    match self.reconciler.preview(obj, &request) {
		Ok(patched) => log::info!("Dry run, not patching {}; annotations would be {}", key, patched["metadata"]["annotations"]),
		Err(err) => log::error!("Dry run of {} produced a patch that doesn't apply: {}", key, err),
	    }
	    return Outcome::DryRun(request);
	}

	match self.applier.apply(&request).await {
	    Ok(()) => Outcome::Patched(request),
	    Err(err) => {
		log::error!("DestinationRule {} patch error: {}", key, err);
		Outcome::Failed
	    },
	}
    }

    pub async fn handle(&self, notification: Notification<DynamicObject>) -> Outcome {
	match notification {
	    Notification::Added(obj) => {
		Self::describe(&obj);
		if self.annotate_on_add {
		    return self.reconcile(&obj).await;
		}
		Outcome::Observed
	    },
	    Notification::Updated{ old, cur } => {
		log::info!("DestinationRule update {} ({:?} -> {:?})",
			   object_key(&cur), old.resource_version(), cur.resource_version());
		self.reconcile(&cur).await
	    },
	    Notification::Deleted(obj) => {
		log::debug!("DestinationRule {} deleted", object_key(&obj));
		Outcome::Observed
	    },
	}
    }

    #[cfg(test)]
    pub fn applier(&self) -> &A {
	&self.applier
    }

    pub fn annotate_on_add(mut self, enabled: bool) -> Self {
	self.annotate_on_add = enabled;
	self
    }

    pub fn dry_run(mut self, enabled: bool) -> Self {
	self.dry_run = enabled;
	self
    }

    pub fn new(reconciler: Reconciler, applier: A) -> Self {
	Self{
	    reconciler: reconciler,
	    applier: applier,
	    annotate_on_add: false,
	    dry_run: false,
	}
    }
}

/*
 * Feeds watcher events through the cache and into the handler until the
 * stream ends or `shutdown` resolves. Errors on the stream are logged and
 * skipped; a backoff-wrapped watcher recovers on its own.
 */
pub async fn run<S, A, F>(events: S, handler: &EventHandler<A>, shutdown: F)
where
    S: Stream<Item = Result<KubeWatcherEvent<DynamicObject>, kube_watcher::Error>>,
    A: Applier,
    F: Future<Output = ()>,
{
    let mut cache: ObjectCache<DynamicObject> = ObjectCache::new();
    futures::pin_mut!(events);
    futures::pin_mut!(shutdown);

    loop {
	tokio::select! {
	    biased;

	    _ = &mut shutdown => {
		log::info!("Stop requested, leaving with {} objects cached", cache.len());
		break;
	    },
	    event = events.next() => match event {
		Some(Ok(event)) => {
		    for notification in cache.observe(event) {
			handler.handle(notification).await;
		    }
		},
		Some(Err(err)) => log::warn!("DestinationRule watch error: {}", err),
		None => {
		    log::info!("DestinationRule watch ended");
		    break;
		},
	    },
	}
    }
}
