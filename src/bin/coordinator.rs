use std::{path::PathBuf, process};

use structopt::StructOpt;
use tokio::{signal, sync::oneshot, time};
use xain_coordinator::{
    common::logging,
    coordinator::{
        api,
        core::{self, CoordinatorPhase, EventSubscriber},
        settings::Settings,
    },
};

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "Coordinator")]
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
        federated_learning: fl_settings,
        model: model_settings,
        log: log_settings,
    } = settings;

    logging::configure(log_settings);

    let model = model_settings.initial_model().unwrap_or_else(|err| {
        eprintln!("failed to initialize the global model: {}", err);
        process::exit(1);
    });

    // once the training is finished, keep on answering the participants for one heartbeat
    // timeout so that they learn about it
    let grace_period = fl_settings.heartbeat_timeout();
    let (service, handle, subscriber) = core::spawn(fl_settings, model);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let api = api::serve(api_settings, handle, subscriber.clone(), async {
        let _ = shutdown_rx.await;
    });

    tokio::select! {
        _ = service => {
            warn!("shutting down: service terminated");
        }
        res = api => {
            if let Err(e) = res {
                error!("{}", e);
                process::exit(1);
            }
            warn!("shutting down: HTTP API terminated");
        }
        _ = async {
            finished(subscriber).await;
            info!("training finished: shutting down in {:?}", grace_period);
            time::sleep(grace_period).await;
        } => {}
        _ = signal::ctrl_c() => {}
    }
    let _ = shutdown_tx.send(());
}

/// Wait until the coordinator finished.
async fn finished(subscriber: EventSubscriber) {
    let mut phase = subscriber.phase_listener();
    if phase.get_latest().event == CoordinatorPhase::Finished {
        return;
    }
    while let Some(event) = phase.changed().await {
        if event.event == CoordinatorPhase::Finished {
            return;
        }
    }
}
