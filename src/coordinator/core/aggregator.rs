//! The aggregator: combines the submitted updates into a new global model.

use crate::{
    common::{
        client::ParticipantId,
        model::{self, Model},
    },
    coordinator::models::ThetaUpdate,
};

/// The result of an aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    /// The new global model, or `None` if no update could be aggregated.
    pub model: Option<Model>,
    /// Participants whose updates were aggregated.
    pub contributors: Vec<ParticipantId>,
    /// Participants whose updates were discarded.
    pub discarded: Vec<ParticipantId>,
    /// Total number of examples of the aggregated updates.
    pub num_examples: u64,
}

/// A type that aggregates local updates into a new global model.
pub trait Aggregator {
    /// Aggregate `updates`. Updates that cannot be combined with `global` are discarded, they
    /// never abort the aggregation.
    fn aggregate(&mut self, global: &Model, updates: &[(ParticipantId, &ThetaUpdate)])
        -> Aggregation;
}

/// Federated averaging: the weights of each update are weighted by the number of examples the
/// participant trained on.
#[derive(Debug, Default, Clone, Copy)]
pub struct FederatedAverage;

impl Aggregator for FederatedAverage {
    fn aggregate(
        &mut self,
        global: &Model,
        updates: &[(ParticipantId, &ThetaUpdate)],
    ) -> Aggregation {
        let mut res = model::zeros(&model::shape_of(global));
        let mut contributors = Vec::with_capacity(updates.len());
        let mut discarded = Vec::new();
        let mut total_weight: u64 = 0;

        for &(id, update) in updates {
            if update.num_examples == 0 {
                warn!("discarding update of participant {}: no training examples", id);
                discarded.push(id);
                continue;
            }
            if !model::same_shape(global, &update.theta_prime) {
                warn!(
                    "discarding update of participant {}: shape {:?} does not match the global model",
                    id,
                    model::shape_of(&update.theta_prime)
                );
                discarded.push(id);
                continue;
            }
            for (res_t, update_t) in res.iter_mut().zip(update.theta_prime.iter()) {
                res_t.scaled_add(update.num_examples as f64, update_t);
            }
            total_weight += update.num_examples;
            contributors.push(id);
        }

        if total_weight == 0 {
            return Aggregation {
                model: None,
                contributors,
                discarded,
                num_examples: 0,
            };
        }

        let total = total_weight as f64;
        for tensor in res.iter_mut() {
            *tensor /= total;
        }

        Aggregation {
            model: Some(res),
            contributors,
            discarded,
            num_examples: total_weight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn update(theta_prime: Model, num_examples: u64) -> ThetaUpdate {
        ThetaUpdate {
            theta_prime,
            num_examples,
        }
    }

    fn assert_close(a: &Model, b: &Model) {
        assert!(model::same_shape(a, b));
        for (t_a, t_b) in a.iter().zip(b) {
            for (w_a, w_b) in t_a.iter().zip(t_b.iter()) {
                assert!((w_a - w_b).abs() < 1e-9, "{} != {}", w_a, w_b);
            }
        }
    }

    #[test]
    fn test_weighted_average() {
        let global = vec![array![0.0, 0.0].into_dyn(), array![[0.0], [0.0]].into_dyn()];
        let (a, b) = (ParticipantId::new(), ParticipantId::new());
        let update_a = update(
            vec![array![1.0, 2.0].into_dyn(), array![[4.0], [0.0]].into_dyn()],
            10,
        );
        let update_b = update(
            vec![array![3.0, -2.0].into_dyn(), array![[0.0], [8.0]].into_dyn()],
            30,
        );

        let aggregation = FederatedAverage.aggregate(&global, &[(a, &update_a), (b, &update_b)]);

        let expected = vec![array![2.5, -1.0].into_dyn(), array![[1.0], [6.0]].into_dyn()];
        assert_close(aggregation.model.as_ref().unwrap(), &expected);
        assert_eq!(aggregation.contributors, vec![a, b]);
        assert!(aggregation.discarded.is_empty());
        assert_eq!(aggregation.num_examples, 40);
    }

    #[test]
    fn test_shape_mismatch_is_discarded() {
        let global = vec![array![0.0, 0.0].into_dyn()];
        let (good, bad) = (ParticipantId::new(), ParticipantId::new());
        let good_update = update(vec![array![1.0, 1.0].into_dyn()], 5);
        let bad_update = update(vec![array![1.0, 1.0, 1.0].into_dyn()], 500);

        let aggregation =
            FederatedAverage.aggregate(&global, &[(bad, &bad_update), (good, &good_update)]);

        assert_close(
            aggregation.model.as_ref().unwrap(),
            &vec![array![1.0, 1.0].into_dyn()],
        );
        assert_eq!(aggregation.contributors, vec![good]);
        assert_eq!(aggregation.discarded, vec![bad]);
    }

    #[test]
    fn test_no_updates() {
        let global = vec![array![1.0].into_dyn()];
        let aggregation = FederatedAverage.aggregate(&global, &[]);
        assert_eq!(aggregation.model, None);
        assert!(aggregation.contributors.is_empty());
    }

    #[test]
    fn test_only_invalid_updates() {
        let global = vec![array![1.0].into_dyn()];
        let id = ParticipantId::new();
        let bad_update = update(vec![], 3);
        let aggregation = FederatedAverage.aggregate(&global, &[(id, &bad_update)]);
        assert_eq!(aggregation.model, None);
        assert_eq!(aggregation.discarded, vec![id]);
    }
}
