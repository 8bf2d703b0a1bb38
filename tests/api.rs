use ndarray::array;
use serde_json::{json, Value};
use warp::{http::StatusCode, Filter, Reply};
use xain_coordinator::coordinator::{
    api,
    core,
    models::{RendezvousReply, RendezvousResponse, StartTrainingReply},
    settings::FederatedLearningSettings,
};

fn settings(rounds: u32, min_clients: u32) -> FederatedLearningSettings {
    FederatedLearningSettings {
        rounds,
        min_clients,
        max_clients: 10,
        participants_ratio: 1.0,
        epochs: 3,
        heartbeat_timeout: 60,
        round_timeout: 600,
        liveness_check_interval: 500,
    }
}

fn routes(
    rounds: u32,
    min_clients: u32,
) -> impl Filter<Extract = impl Reply, Error = std::convert::Infallible> + Clone {
    let (_join, handle, subscriber) = core::spawn(
        settings(rounds, min_clients),
        vec![array![0.0, 0.0].into_dyn(), array![[0.0]].into_dyn()],
    );
    api::routes(handle, subscriber)
}

async fn post<F>(routes: &F, path: &str, body: Option<Value>) -> (StatusCode, Value)
where
    F: Filter + Clone + Send + Sync + 'static,
    F::Extract: Reply + Send,
{
    let mut request = warp::test::request().method("POST").path(path);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let resp = request.reply(routes).await;
    (resp.status(), serde_json::from_slice(resp.body()).unwrap())
}

async fn get<F>(routes: &F, path: &str) -> Value
where
    F: Filter + Clone + Send + Sync + 'static,
    F::Extract: Reply + Send,
{
    let resp = warp::test::request()
        .method("GET")
        .path(path)
        .reply(routes)
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    serde_json::from_slice(resp.body()).unwrap()
}

async fn rendezvous<F>(routes: &F) -> RendezvousReply
where
    F: Filter + Clone + Send + Sync + 'static,
    F::Extract: Reply + Send,
{
    let (status, body) = post(routes, "/rendezvous", None).await;
    assert_eq!(status, StatusCode::OK);
    serde_json::from_value(body).unwrap()
}

fn theta_prime(a: f64, b: f64, c: f64) -> Value {
    json!([array![a, b].into_dyn(), array![[c]].into_dyn()])
}

#[tokio::test]
async fn test_weighted_average_round() {
    let routes = routes(1, 2);
    assert_eq!(get(&routes, "/state").await, json!({"state": "STANDBY", "round": 0}));

    let a = rendezvous(&routes).await;
    assert_eq!(a.response, RendezvousResponse::Accept);
    let a = a.id.unwrap();
    let b = rendezvous(&routes).await.id.unwrap();
    assert_eq!(get(&routes, "/state").await, json!({"state": "ROUND", "round": 0}));

    // a participant arriving during the round is told to come back later
    let late = rendezvous(&routes).await;
    assert_eq!(late.response, RendezvousResponse::Later);
    assert_eq!(late.id, None);

    for id in [a, b].iter() {
        let (status, body) = post(
            &routes,
            &format!("/heartbeat/{}", id),
            Some(json!({"state": "READY", "round": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"state": "ROUND", "round": 0}));
    }

    let (status, task_a) = post(&routes, &format!("/start_training/{}", a), None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, task_b) = post(&routes, &format!("/start_training/{}", b), None).await;
    assert_eq!(task_a, task_b);
    let task: StartTrainingReply = serde_json::from_value(task_a).unwrap();
    assert_eq!(task.epochs, 3);
    assert_eq!(task.epoch_base, 0);

    let (status, body) = post(
        &routes,
        &format!("/end_training/{}", a),
        Some(json!({
            "theta_update": {"theta_prime": theta_prime(4.0, 8.0, -4.0), "num_examples": 10},
            "history": {"loss": [0.5, 0.25, 0.125]},
            "metrics": {"id": 0, "per_class_counts": [6, 4]}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({}));

    let (status, _) = post(
        &routes,
        &format!("/end_training/{}", b),
        Some(json!({
            "theta_update": {"theta_prime": theta_prime(0.0, 4.0, 4.0), "num_examples": 30}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // 0.25 * theta_prime_a + 0.75 * theta_prime_b
    let model = get(&routes, "/model").await;
    assert_eq!(model, theta_prime(1.0, 5.0, 2.0));
    assert_eq!(get(&routes, "/state").await, json!({"state": "FINISHED", "round": 1}));

    let results = get(&routes, "/results").await;
    assert_eq!(results.as_array().unwrap().len(), 1);
    assert_eq!(results[0]["round"], json!(0));
    assert_eq!(results[0]["num_examples"], json!(40));
    assert_eq!(results[0]["outcome"], json!("Aggregated"));
    assert_eq!(results[0]["class_counts"], json!([6, 4]));
    assert_eq!(
        results[0]["histories"][a.to_string()]["loss"],
        json!([0.5, 0.25, 0.125])
    );

    let (status, body) = post(
        &routes,
        &format!("/heartbeat/{}", a),
        Some(json!({"state": "READY", "round": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"state": "FINISHED", "round": 1}));

    let (status, _) = post(&routes, &format!("/start_training/{}", a), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_refused_requests() {
    let routes = routes(2, 2);
    let unknown = uuid::Uuid::new_v4();

    let (status, body) = post(
        &routes,
        &format!("/heartbeat/{}", unknown),
        Some(json!({"state": "READY", "round": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("not registered"));

    let a = rendezvous(&routes).await.id.unwrap();
    let (status, _) = post(&routes, &format!("/start_training/{}", a), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = post(
        &routes,
        &format!("/heartbeat/{}", a),
        Some(json!({"state": "SLEEPING", "round": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let b = rendezvous(&routes).await.id.unwrap();
    let update = json!({
        "theta_update": {"theta_prime": theta_prime(1.0, 1.0, 1.0), "num_examples": 2}
    });
    let (status, body) = post(&routes, &format!("/end_training/{}", a), Some(update)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("did not start training"));

    let (status, _) = post(&routes, &format!("/start_training/{}", b), None).await;
    assert_eq!(status, StatusCode::OK);
    let update = json!({
        "theta_update": {"theta_prime": theta_prime(1.0, 1.0, 1.0), "num_examples": 0}
    });
    let (status, _) = post(&routes, &format!("/end_training/{}", b), Some(update)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let update = json!({
        "theta_update": {"theta_prime": theta_prime(1.0, 1.0, 1.0), "num_examples": 2}
    });
    let (status, _) = post(
        &routes,
        &format!("/end_training/{}", b),
        Some(update.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = post(&routes, &format!("/end_training/{}", b), Some(update)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("already submitted"));

    // re-rendezvous with a known id is idempotent
    let (status, body) = post(&routes, &format!("/rendezvous/{}", a), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"response": "ACCEPT", "id": a}));

    // the coordinator assigns the ids: an unknown id cannot rendezvous again
    let (status, body) = post(&routes, &format!("/rendezvous/{}", unknown), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("not registered"));

    let (status, _) = post(&routes, "/nowhere", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
