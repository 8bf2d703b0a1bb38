//! Runs an in-process coordinator with simulated participants.

use std::{convert::Infallible, time::Duration};

use futures::future::join_all;
use rand::Rng;
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;
use xain_coordinator::{
    client::{Participant, ParticipantSettings, Trainer, TrainingResult, TrainingTask},
    common::{logging, settings::LoggingSettings},
    coordinator::{core, models::Metrics, settings::FederatedLearningSettings},
};

#[macro_use]
extern crate tracing;

#[derive(Debug, StructOpt)]
#[structopt(name = "test-drive")]
struct Opt {
    /// Number of simulated participants
    #[structopt(short, long, default_value = "10")]
    participants: u32,
    /// Number of rounds
    #[structopt(short, long, default_value = "3")]
    rounds: u32,
    /// Fraction of the participants selected in each round
    #[structopt(long, default_value = "0.5")]
    ratio: f64,
    /// Number of local epochs per round
    #[structopt(long, default_value = "2")]
    epochs: u32,
    /// Shape of each tensor of the model, for instance `4x3,3`
    #[structopt(long, use_delimiter = true, default_value = "4x3,3")]
    shapes: Vec<String>,
    /// Log filter
    #[structopt(long, default_value = "info")]
    log: String,
}

/// Adds uniform noise to the weights, and reports a random number of examples.
struct NoiseTrainer {
    partition: u32,
}

#[async_trait::async_trait]
impl Trainer for NoiseTrainer {
    type Error = Infallible;

    async fn train(&mut self, task: TrainingTask) -> Result<TrainingResult, Self::Error> {
        let result = {
            let mut rng = rand::thread_rng();
            let theta_prime = task
                .theta
                .iter()
                .map(|tensor| tensor.mapv(|w| w + rng.gen_range(-0.1..0.1)))
                .collect();
            let loss: Vec<f64> = (0..task.epochs)
                .map(|epoch| 1. / (1. + (task.epoch_base + epoch) as f64))
                .collect();
            TrainingResult {
                theta_prime,
                num_examples: rng.gen_range(10..100),
                history: vec![("loss".to_string(), loss)].into_iter().collect(),
                metrics: Metrics {
                    id: self.partition,
                    per_class_counts: (0..10).map(|_| rng.gen_range(0..10)).collect(),
                },
            }
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(result)
    }
}

fn parse_shape(shape: &str) -> anyhow::Result<Vec<usize>> {
    shape
        .split('x')
        .map(|dim| {
            dim.parse::<usize>()
                .map_err(|e| anyhow::anyhow!("invalid shape {:?}: {}", shape, e))
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();
    logging::configure(LoggingSettings {
        filter: EnvFilter::try_new(&opt.log)?,
    });

    let shapes = opt
        .shapes
        .iter()
        .map(|shape| parse_shape(shape))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let settings = FederatedLearningSettings {
        rounds: opt.rounds,
        min_clients: opt.participants,
        max_clients: opt.participants,
        participants_ratio: opt.ratio,
        epochs: opt.epochs,
        heartbeat_timeout: 5,
        round_timeout: 30,
        liveness_check_interval: 100,
    };
    let (service, handle, subscriber) =
        core::spawn(settings, xain_coordinator::common::model::zeros(&shapes));

    let participant_settings = ParticipantSettings {
        heartbeat_interval: Duration::from_millis(100),
        rendezvous_retry: Duration::from_millis(500),
    };
    let participants = (0..opt.participants).map(|partition| {
        let participant = Participant::new(
            handle.clone(),
            NoiseTrainer { partition },
            participant_settings,
        );
        tokio::spawn(participant.run())
    });
    for (partition, result) in join_all(participants).await.into_iter().enumerate() {
        match result? {
            Ok(rounds) => info!("participant {} trained {} rounds", partition, rounds),
            Err(e) => warn!("participant {} failed: {}", partition, e),
        }
    }
    drop(handle);
    service.await?;

    for report in subscriber.reports_listener().get_latest().event.iter() {
        info!(
            "round {}: {:?}, {} contributors, {} examples, class counts {:?}",
            report.round,
            report.outcome,
            report.contributors.len(),
            report.num_examples,
            report.class_counts
        );
    }
    info!(
        "final model: {:?}",
        subscriber.model_listener().get_latest().event
    );
    Ok(())
}
