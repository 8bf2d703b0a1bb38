use std::{convert::Infallible, time::Duration};

use async_trait::async_trait;
use futures::future::join_all;
use ndarray::array;
use xain_coordinator::{
    client::{Participant, ParticipantSettings, Trainer, TrainingResult, TrainingTask},
    coordinator::{
        core::{self, CoordinatorPhase, RoundOutcome},
        models::{History, Metrics},
        settings::FederatedLearningSettings,
    },
};

/// Adds `step` to every weight.
struct StepTrainer {
    step: f64,
    num_examples: u64,
}

#[async_trait]
impl Trainer for StepTrainer {
    type Error = Infallible;

    async fn train(&mut self, task: TrainingTask) -> Result<TrainingResult, Self::Error> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(TrainingResult {
            theta_prime: task.theta.iter().map(|t| t + self.step).collect(),
            num_examples: self.num_examples,
            history: History::new(),
            metrics: Metrics::default(),
        })
    }
}

fn participant_settings() -> ParticipantSettings {
    ParticipantSettings {
        heartbeat_interval: Duration::from_millis(5),
        rendezvous_retry: Duration::from_millis(5),
    }
}

fn settings(rounds: u32, min_clients: u32, participants_ratio: f64) -> FederatedLearningSettings {
    FederatedLearningSettings {
        rounds,
        min_clients,
        max_clients: 100,
        participants_ratio,
        epochs: 2,
        heartbeat_timeout: 10,
        round_timeout: 10,
        liveness_check_interval: 10,
    }
}

#[tokio::test]
async fn test_every_participant_trains_every_round() {
    let (service, handle, subscriber) =
        core::spawn(settings(3, 4, 1.0), vec![array![0.0, 0.0].into_dyn()]);

    let participants = (0..4).map(|i| {
        let trainer = StepTrainer {
            step: 1.0,
            num_examples: 10 * (i + 1),
        };
        tokio::spawn(Participant::new(handle.clone(), trainer, participant_settings()).run())
    });
    for result in join_all(participants).await {
        assert_eq!(result.unwrap().unwrap(), 3);
    }
    drop(handle);
    service.await.unwrap();

    // every update adds one to the weights, whatever the weighting
    let model = subscriber.model_listener().get_latest().event;
    for w in model[0].iter() {
        assert!((w - 3.0).abs() < 1e-9);
    }
    let reports = subscriber.reports_listener().get_latest().event;
    assert_eq!(reports.len(), 3);
    for (round, report) in reports.iter().enumerate() {
        assert_eq!(report.round, round as u32);
        assert_eq!(report.outcome, RoundOutcome::Aggregated);
        assert_eq!(report.contributors.len(), 4);
        assert_eq!(report.num_examples, 100);
    }
    assert_eq!(
        subscriber.phase_listener().get_latest().event,
        CoordinatorPhase::Finished
    );
}

#[tokio::test]
async fn test_partial_selection() {
    let (service, handle, subscriber) =
        core::spawn(settings(4, 6, 0.5), vec![array![1.0].into_dyn()]);

    let participants = (0..6).map(|_| {
        let trainer = StepTrainer {
            step: 0.5,
            num_examples: 7,
        };
        tokio::spawn(Participant::new(handle.clone(), trainer, participant_settings()).run())
    });
    let rounds_trained: u32 = join_all(participants)
        .await
        .into_iter()
        .map(|result| result.unwrap().unwrap())
        .sum();
    drop(handle);
    service.await.unwrap();

    // three participants out of six are selected in each of the four rounds
    let reports = subscriber.reports_listener().get_latest().event;
    assert_eq!(reports.len(), 4);
    for report in reports.iter() {
        assert_eq!(report.selected.len(), 3);
        assert_eq!(report.contributors.len(), 3);
    }
    assert_eq!(rounds_trained, 12);
    assert!((subscriber.model_listener().get_latest().event[0][0] - 3.0).abs() < 1e-9);
}

#[cfg(feature = "reqwest-client")]
#[tokio::test]
async fn test_participants_over_http() {
    use xain_coordinator::{client::HttpApiClient, coordinator::api};

    let (service, handle, subscriber) =
        core::spawn(settings(2, 2, 1.0), vec![array![0.0].into_dyn()]);
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let (addr, server) = api::bind(
        "127.0.0.1:0".parse().unwrap(),
        handle,
        subscriber.clone(),
        async {
            let _ = shutdown_rx.await;
        },
    )
    .unwrap();
    let server = tokio::spawn(server);

    let participants = (0..2).map(|_| {
        let client = HttpApiClient::new(format!("http://{}", addr)).unwrap();
        let trainer = StepTrainer {
            step: 2.0,
            num_examples: 1,
        };
        tokio::spawn(Participant::new(client, trainer, participant_settings()).run())
    });
    for result in join_all(participants).await {
        assert_eq!(result.unwrap().unwrap(), 2);
    }

    shutdown_tx.send(()).unwrap();
    server.await.unwrap();
    service.await.unwrap();
    assert_eq!(
        subscriber.model_listener().get_latest().event[0],
        array![4.0].into_dyn()
    );
}
