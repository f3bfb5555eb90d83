//! Fixed-topology feed-forward policy and its genetic operators.
//!
//! Each layer is stored as a dense `(inputs + 1) x outputs` row-major matrix whose
//! last row holds the bias, so applying a layer is a single affine map.

use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::config::{MutationConfig, NetworkConfig};
use crate::error::{Result, SnakeError};

/// Up, down, left, right.
pub const ACTIONS: usize = 4;

/// Shape of a policy network: sensor width, hidden widths, and the input clip.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkShape {
    pub inputs: usize,
    pub hidden: Vec<usize>,
    pub input_clip: f32,
}

impl NetworkShape {
    pub fn new(inputs: usize, hidden: Vec<usize>) -> Self {
        Self {
            inputs,
            hidden,
            input_clip: NetworkConfig::default().input_clip,
        }
    }

    pub fn from_config(config: &NetworkConfig) -> Self {
        Self {
            inputs: config.sensors.width(),
            hidden: config.hidden_layers.clone(),
            input_clip: config.input_clip,
        }
    }

    /// `(inputs, outputs)` of every layer transition.
    pub fn layer_dims(&self) -> Vec<(usize, usize)> {
        let mut widths = Vec::with_capacity(self.hidden.len() + 2);
        widths.push(self.inputs);
        widths.extend_from_slice(&self.hidden);
        widths.push(ACTIONS);
        widths.windows(2).map(|w| (w[0], w[1])).collect()
    }

    fn matrix_len((inputs, outputs): (usize, usize)) -> usize {
        (inputs + 1) * outputs
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Layer {
    inputs: usize,
    outputs: usize,
    weights: Vec<f32>,
}

impl Layer {
    fn forward(&self, x: &[f32]) -> Vec<f32> {
        let bias = &self.weights[self.inputs * self.outputs..];
        let mut out = bias.to_vec();
        for (i, &xi) in x.iter().enumerate() {
            if xi == 0.0 {
                continue;
            }
            let row = &self.weights[i * self.outputs..(i + 1) * self.outputs];
            for (o, w) in out.iter_mut().zip(row) {
                *o += xi * w;
            }
        }
        out
    }
}

/// Deserializing goes through [`Genome::from_matrices`], so a malformed document
/// is rejected instead of producing a genome that cannot run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "GenomeDocument", into = "GenomeDocument")]
pub struct Genome {
    shape: NetworkShape,
    layers: Vec<Layer>,
}

#[derive(Serialize, Deserialize)]
struct GenomeDocument {
    shape: NetworkShape,
    matrices: Vec<Vec<f32>>,
}

impl TryFrom<GenomeDocument> for Genome {
    type Error = SnakeError;

    fn try_from(doc: GenomeDocument) -> Result<Self> {
        Genome::from_matrices(&doc.shape, doc.matrices)
    }
}

impl From<Genome> for GenomeDocument {
    fn from(genome: Genome) -> Self {
        Self {
            shape: genome.shape,
            matrices: genome.layers.into_iter().map(|l| l.weights).collect(),
        }
    }
}

impl Genome {
    /// Every weight uniform in [-1, 1].
    pub fn random<R: Rng>(shape: &NetworkShape, rng: &mut R) -> Self {
        let layers = shape
            .layer_dims()
            .into_iter()
            .map(|dims| Layer {
                inputs: dims.0,
                outputs: dims.1,
                weights: (0..NetworkShape::matrix_len(dims))
                    .map(|_| rng.gen_range(-1.0f32..=1.0))
                    .collect(),
            })
            .collect();
        Self {
            shape: shape.clone(),
            layers,
        }
    }

    /// Builds a genome from raw row-major matrices, one per layer transition.
    pub fn from_matrices(shape: &NetworkShape, matrices: Vec<Vec<f32>>) -> Result<Self> {
        let dims = shape.layer_dims();
        if matrices.len() != dims.len() {
            return Err(SnakeError::ShapeMismatch {
                expected: dims.len(),
                actual: matrices.len(),
            });
        }
        let mut layers = Vec::with_capacity(dims.len());
        for (d, weights) in dims.into_iter().zip(matrices) {
            let expected = NetworkShape::matrix_len(d);
            if weights.len() != expected {
                return Err(SnakeError::ShapeMismatch {
                    expected,
                    actual: weights.len(),
                });
            }
            if weights.iter().any(|w| !w.is_finite()) {
                return Err(SnakeError::Deserialization(
                    "non-finite weight in matrix".to_string(),
                ));
            }
            layers.push(Layer {
                inputs: d.0,
                outputs: d.1,
                weights,
            });
        }
        Ok(Self {
            shape: shape.clone(),
            layers,
        })
    }

    /// A policy that always picks `action`: every weight is zero except the final
    /// bias, which outweighs the other actions past f32 underflow.
    #[cfg(test)]
    pub(crate) fn constant(shape: &NetworkShape, action: usize) -> Self {
        let layers = shape
            .layer_dims()
            .into_iter()
            .map(|dims| Layer {
                inputs: dims.0,
                outputs: dims.1,
                weights: vec![0.0; NetworkShape::matrix_len(dims)],
            })
            .collect();
        let mut genome = Self {
            shape: shape.clone(),
            layers,
        };
        if let Some(last) = genome.layers.last_mut() {
            let bias_start = last.inputs * last.outputs;
            last.weights[bias_start + action.min(ACTIONS - 1)] = 200.0;
        }
        genome
    }

    pub fn shape(&self) -> &NetworkShape {
        &self.shape
    }

    pub fn input_size(&self) -> usize {
        self.shape.inputs
    }

    pub fn matrices(&self) -> impl Iterator<Item = &[f32]> {
        self.layers.iter().map(|l| l.weights.as_slice())
    }

    /// Clipped forward pass followed by a max-shifted softmax.
    pub fn action_probabilities(&self, sensors: &[f32]) -> Result<[f32; ACTIONS]> {
        if sensors.len() != self.shape.inputs {
            return Err(SnakeError::ShapeMismatch {
                expected: self.shape.inputs,
                actual: sensors.len(),
            });
        }
        let clip = self.shape.input_clip;
        let mut activations: Vec<f32> = sensors
            .iter()
            .map(|v| if v.is_nan() { 0.0 } else { v.clamp(-clip, clip) })
            .collect();

        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            activations = layer.forward(&activations);
            if i != last {
                for a in activations.iter_mut() {
                    *a = a.max(0.0);
                }
            }
        }

        let max = activations.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut probs = [0.0f32; ACTIONS];
        let mut sum = 0.0;
        for (p, a) in probs.iter_mut().zip(&activations) {
            *p = (a - max).exp();
            sum += *p;
        }
        for p in probs.iter_mut() {
            *p /= sum;
        }
        Ok(probs)
    }

    /// Samples an action index from the policy distribution.
    pub fn decide<R: Rng>(&self, sensors: &[f32], rng: &mut R) -> Result<usize> {
        let probs = self.action_probabilities(sensors)?;
        let r = rng.r#gen::<f32>();
        let mut acc = 0.0;
        for (i, p) in probs.iter().enumerate() {
            acc += p;
            if r < acc {
                return Ok(i);
            }
        }
        // Rounding left `acc` a hair under 1.0; fall back to the likeliest action.
        Ok(probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(0))
    }

    /// Returns a perturbed copy; `self` is never touched.
    pub fn mutate<R: Rng>(&self, mutation: &MutationConfig, rng: &mut R) -> Genome {
        let mut child = self.clone();
        for layer in &mut child.layers {
            for w in layer.weights.iter_mut() {
                if rng.r#gen::<f32>() < mutation.rate {
                    let z: f32 = rng.sample(StandardNormal);
                    *w += z * mutation.strength;
                }
            }
        }
        if rng.r#gen::<f32>() < mutation.catastrophic_chance {
            for layer in &mut child.layers {
                for w in layer.weights.iter_mut() {
                    if rng.r#gen::<f32>() < mutation.catastrophic_fraction {
                        *w = rng.gen_range(-1.0f32..=1.0);
                    }
                }
            }
        }
        child
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    fn shape() -> NetworkShape {
        NetworkShape::new(8, vec![6, 5])
    }

    #[test]
    fn layer_dims_chain() {
        assert_eq!(shape().layer_dims(), vec![(8, 6), (6, 5), (5, 4)]);
        assert_eq!(NetworkShape::new(8, vec![]).layer_dims(), vec![(8, 4)]);
    }

    #[test]
    fn wrong_sensor_width_is_shape_mismatch() {
        let mut rng = SmallRng::seed_from_u64(1);
        let genome = Genome::random(&shape(), &mut rng);
        let err = genome.decide(&[0.0; 7], &mut rng).unwrap_err();
        assert!(matches!(
            err,
            SnakeError::ShapeMismatch { expected: 8, actual: 7 }
        ));
    }

    #[test]
    fn probabilities_form_a_distribution_even_for_huge_inputs() {
        let mut rng = SmallRng::seed_from_u64(2);
        let genome = Genome::random(&shape(), &mut rng);
        let probs = genome
            .action_probabilities(&[1e9, -1e9, f32::NAN, 3.0, 0.0, 1.0, 0.5, 1e30])
            .unwrap();
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(probs.iter().all(|p| p.is_finite() && *p >= 0.0));
    }

    #[test]
    fn clipping_bounds_sensor_magnitude() {
        let mut rng = SmallRng::seed_from_u64(3);
        let genome = Genome::random(&shape(), &mut rng);
        let mut big = [0.0; 8];
        big[0] = 1e6;
        let mut clipped = [0.0; 8];
        clipped[0] = 10.0;
        assert_eq!(
            genome.action_probabilities(&big).unwrap(),
            genome.action_probabilities(&clipped).unwrap()
        );
    }

    #[test]
    fn seeded_decisions_are_reproducible() {
        let genome = Genome::random(&shape(), &mut SmallRng::seed_from_u64(4));
        let sensors = [1.0, 0.0, 0.0, 0.0, 0.5, 0.25, 0.1, 0.9];
        let mut a = SmallRng::seed_from_u64(99);
        let mut b = SmallRng::seed_from_u64(99);
        for _ in 0..50 {
            assert_eq!(
                genome.decide(&sensors, &mut a).unwrap(),
                genome.decide(&sensors, &mut b).unwrap()
            );
        }
    }

    #[test]
    fn constant_policy_always_picks_its_action() {
        let mut rng = SmallRng::seed_from_u64(5);
        for action in 0..ACTIONS {
            let genome = Genome::constant(&shape(), action);
            for _ in 0..200 {
                let sensors: Vec<f32> = (0..8).map(|_| rng.r#gen::<f32>()).collect();
                assert_eq!(genome.decide(&sensors, &mut rng).unwrap(), action);
            }
        }
    }

    #[test]
    fn zero_rate_mutation_is_identity() {
        let mut rng = SmallRng::seed_from_u64(6);
        let genome = Genome::random(&shape(), &mut rng);
        let mutation = MutationConfig {
            rate: 0.0,
            strength: 0.5,
            catastrophic_chance: 0.0,
            catastrophic_fraction: 0.3,
        };
        for _ in 0..10 {
            assert_eq!(genome.mutate(&mutation, &mut rng), genome);
        }
    }

    #[test]
    fn mutation_leaves_parent_untouched() {
        let mut rng = SmallRng::seed_from_u64(7);
        let parent = Genome::random(&shape(), &mut rng);
        let snapshot = parent.clone();
        let mutation = MutationConfig {
            rate: 1.0,
            strength: 1.0,
            catastrophic_chance: 1.0,
            catastrophic_fraction: 1.0,
        };
        let child = parent.mutate(&mutation, &mut rng);
        assert_eq!(parent, snapshot);
        assert_ne!(child, parent);
        for m in child.matrices() {
            assert!(m.iter().all(|w| (-1.0..=1.0).contains(w)));
        }
    }

    #[test]
    fn clone_has_independent_storage() {
        let mut rng = SmallRng::seed_from_u64(8);
        let source = Genome::random(&shape(), &mut rng);
        let sensors = [0.3, 1.0, 0.0, 0.0, 0.2, 0.2, 0.9, 0.1];
        let before = source.action_probabilities(&sensors).unwrap();

        let mut copy = source.clone();
        for layer in &mut copy.layers {
            for w in layer.weights.iter_mut() {
                *w = -*w + 0.5;
            }
        }
        assert_ne!(copy.action_probabilities(&sensors).unwrap(), before);
        assert_eq!(source.action_probabilities(&sensors).unwrap(), before);

        let mut a = SmallRng::seed_from_u64(11);
        let mut b = SmallRng::seed_from_u64(11);
        assert_eq!(
            source.decide(&sensors, &mut a).unwrap(),
            source.clone().decide(&sensors, &mut b).unwrap()
        );
    }

    #[test]
    fn from_matrices_validates_sizes() {
        let s = NetworkShape::new(8, vec![]);
        assert!(Genome::from_matrices(&s, vec![vec![0.0; 36]]).is_ok());
        assert!(matches!(
            Genome::from_matrices(&s, vec![vec![0.0; 32]]),
            Err(SnakeError::ShapeMismatch { expected: 36, actual: 32 })
        ));
        assert!(Genome::from_matrices(&s, vec![]).is_err());
        let mut bad = vec![0.0; 36];
        bad[3] = f32::INFINITY;
        assert!(Genome::from_matrices(&s, vec![bad]).is_err());
    }

    #[test]
    fn malformed_documents_do_not_deserialize() {
        let short = r#"{"shape":{"inputs":8,"hidden":[],"input_clip":10.0},"matrices":[[0.0]]}"#;
        assert!(serde_json::from_str::<Genome>(short).is_err());

        let empty = r#"{"shape":{"inputs":8,"hidden":[],"input_clip":10.0},"matrices":[]}"#;
        assert!(serde_json::from_str::<Genome>(empty).is_err());

        let missing = r#"{"shape":{"inputs":8,"hidden":[4],"input_clip":10.0},"matrices":[[0.0]]}"#;
        assert!(serde_json::from_str::<Genome>(missing).is_err());
    }

    #[test]
    fn serialized_genome_reloads_and_decides() {
        let mut rng = SmallRng::seed_from_u64(9);
        let genome = Genome::random(&shape(), &mut rng);
        let json = serde_json::to_string(&genome).unwrap();
        let back: Genome = serde_json::from_str(&json).unwrap();
        assert_eq!(back, genome);
        assert!(back.decide(&[0.0; 8], &mut rng).unwrap() < ACTIONS);
    }
}
