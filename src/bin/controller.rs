use std::{path::PathBuf, process, sync::Arc};

use structopt::StructOpt;
use fl_link::{
    lifecycle::{Engine, EngineConfig},
    logging,
    mailbox::Mailbox,
    registry::Registry,
    rest,
    settings::Settings,
    signal,
    store::MemoryStore,
    supervisor::{ProcessSupervisor, RuntimeEnvironment, Supervisor},
};

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "Controller")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let Settings {
        api: api_settings,
        log: log_settings,
        paths,
        tls,
        runtime,
    } = settings;

    logging::configure(log_settings.filter);

    let environment = RuntimeEnvironment::initialize(&paths.runtime_dir, runtime)
        .await
        .unwrap_or_else(|err| {
            error!("failed to prepare the runtime environment: {}", err);
            process::exit(1);
        });
    let supervisor = Arc::new(ProcessSupervisor::new(
        Arc::new(environment),
        &paths.logs_dir,
        &paths.uploads_dir,
    ));

    let store = MemoryStore::new();
    let mailbox = Arc::new(Mailbox::new());
    let config = EngineConfig {
        uploads_dir: paths.uploads_dir,
        authorized_keys: paths.authorized_keys,
        tls: tls.into(),
    };
    let engine = Arc::new(Engine::new(
        store.clone(),
        mailbox.clone(),
        supervisor.clone(),
        config,
    ));
    let registry = Arc::new(Registry::new(store, mailbox));

    tokio::select! {
        _ = rest::serve(api_settings, engine, registry) => {
            warn!("shutting down: REST server terminated");
        }
        _ = signal::shutdown() => {
            info!("shutting down: received termination signal");
        }
    }

    if let Err(err) = supervisor.stop_training_driver() {
        warn!("failed to stop the training driver: {}", err);
    }
    if let Err(err) = supervisor.stop_aggregator() {
        warn!("failed to stop the aggregation service: {}", err);
    }
}
