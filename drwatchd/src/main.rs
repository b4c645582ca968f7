mod applier;
mod errors;
mod informer;
mod reconcile;
mod schema;
mod strategic;

use applier::KubeApplier;
use errors::Error;
use informer::EventHandler;
use reconcile::Marker;
use reconcile::Reconciler;
use drwatch_api as api;

use clap::Parser;
use kube::Api as KubeApi;
use kube::Client as KubeClient;
use kube::Config as KubeConfig;
use kube::config::KubeConfigOptions;
use kube::config::Kubeconfig;
use kube::core::DynamicObject;
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher as kube_watcher;
use log;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about = "Watches Istio DestinationRules and makes sure each one carries a marker annotation")]
struct Args {
    /// (optional) absolute path to the kubeconfig file; inferred when omitted
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// kubeconfig context to use instead of the current one
    #[arg(long)]
    context: Option<String>,

    /// only watch DestinationRules in this namespace
    #[arg(long, short)]
    namespace: Option<String>,

    #[arg(long, default_value = reconcile::DEFAULT_MARKER_KEY)]
    annotation_key: String,

    #[arg(long, default_value = reconcile::DEFAULT_MARKER_VALUE)]
    annotation_value: String,

    /// also annotate objects when they are first seen, not only on update
    #[arg(long)]
    annotate_on_add: bool,

    /// compute and log patches, but never send them
    #[arg(long)]
    dry_run: bool,
}

/*
 * Builds the client from --kubeconfig when given. Otherwise the usual
 * inference applies: $KUBECONFIG, ~/.kube/config, then in-cluster.
 */
async fn kube_client(args: &Args) -> Result<KubeClient, Error> {
    let options = KubeConfigOptions{
	context: args.context.clone(),
	..Default::default()
    };

    let config = match &args.kubeconfig {
	Some(path) => {
	    log::debug!("Loading kubeconfig from {}", path.display());
	    let kubeconfig = Kubeconfig::read_from(path)?;
	    KubeConfig::from_custom_kubeconfig(kubeconfig, &options).await?
	},
	None if args.context.is_some() => KubeConfig::from_kubeconfig(&options).await?,
	None => KubeConfig::infer().await?,
    };

    Ok(KubeClient::try_from(config)?)
}

/*
 * drwatchd:
 *
 *  1. Watch every DestinationRule (or those of one namespace)
 *  2. Log what each newly seen rule routes to
 *  3. On update, patch in the marker annotation when it's missing
 *  4. Keep going until CTRL^C
 */
#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();
    let args = Args::parse();

    let kube_client = kube_client(&args).await?;
    let resource = api::destinationrule::api_resource();
    let dr_api: KubeApi<DynamicObject> = match &args.namespace {
	Some(namespace) => KubeApi::namespaced_with(kube_client.clone(), namespace, &resource),
	None => KubeApi::all_with(kube_client.clone(), &resource),
    };

    let marker = Marker::new(&args.annotation_key, &args.annotation_value);
    log::info!("starting drwatchd, marker {}={}, namespace {}",
	       marker.key, marker.value, args.namespace.as_deref().unwrap_or("<all>"));

    let handler = EventHandler::new(Reconciler::new(marker), KubeApplier::new(kube_client.clone(), resource))
	.annotate_on_add(args.annotate_on_add)
	.dry_run(args.dry_run);
    let events = kube_watcher(dr_api, kube_watcher::Config::default()).default_backoff();

    // handle CTRL^C as gracefully as we can.
    informer::run(events, &handler, async {
	if let Err(err) = tokio::signal::ctrl_c().await {
	    log::error!("Unable to listen for CTRL^C, running until killed: {}", err);
	    futures::future::pending::<()>().await;
	}
    }).await;

    Ok(())
}
