use futures_util::StreamExt as _;
use kube::CustomResourceExt as _;
use kube::config::KubeConfigOptions;
use tracing::{debug, warn};
use tracing_subscriber::util::SubscriberInitExt as _;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt as _};

mod config;
mod controllers;
mod gateway_client;
mod labels;
mod resources;
mod utils;

use config::OperatorConfig;
use resources::{AgenticSession, ProjectSettings};

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.contains(&"--crd".into()) {
        let session_crd = AgenticSession::crd();
        println!("{}", serde_yaml::to_string(&session_crd).unwrap());
        println!("---");
        let settings_crd = ProjectSettings::crd();
        println!("{}", serde_yaml::to_string(&settings_crd).unwrap());
        std::process::exit(0);
    }

    setup_tracing();

    let operator_config = OperatorConfig::from_env();
    let kubernetes_client =
        kube::client::Client::try_from(discover_kubernetes_config().await).unwrap();

    let session_controller =
        controllers::agentic_session_controller::reconciler::new(
            kubernetes_client.clone(),
            operator_config.clone(),
        );
    let namespace_controller = controllers::namespace_controller::new(kubernetes_client.clone());
    let projectsettings_controller =
        controllers::projectsettings_controller::new(kubernetes_client.clone());

    tokio::spawn(controllers::agentic_session_controller::temp_content::run_sweeper(
        kubernetes_client,
        operator_config,
    ));

    tokio::spawn(namespace_controller.for_each(|res| async move {
        match res {
            Ok(o) => debug!("reconciled namespace {:?}", o),
            Err(e) => warn!("namespace reconcile failed: {:?}", e),
        }
    }));

    tokio::spawn(projectsettings_controller.for_each(|res| async move {
        match res {
            Ok(o) => debug!("reconciled ProjectSettings {:?}", o),
            Err(e) => warn!("ProjectSettings reconcile failed: {:?}", e),
        }
    }));

    session_controller
        .for_each(|res| async move {
            match res {
                Ok(o) => debug!("reconciled {:?}", o),
                Err(e) => warn!("reconcile failed: {:?}", e),
            }
        })
        .await;
}

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .try_init()
        .expect("tracing-subscriber setup failed");
}

async fn discover_kubernetes_config() -> kube::Config {
    let from_default_kubeconfig =
        kube::Config::from_kubeconfig(&KubeConfigOptions::default()).await;

    if let Ok(config) = from_default_kubeconfig {
        return config;
    }

    let from_incluster_env = kube::Config::incluster_env();

    if let Ok(config) = from_incluster_env {
        return config;
    }

    panic!("Failed to find a suitable Kubernetes client config.");
}
