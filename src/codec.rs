//! Versioned genome blobs.
//!
//! Layout: `SNKG` magic, a little-endian `u16` format tag, then a bincode payload.
//! Older bias-free f64 formats are migrated onto the shape the caller asks for.

use rand::Rng;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::warn;

use crate::error::{Result, SnakeError};
use crate::genome::{ACTIONS, Genome, NetworkShape};

pub const MAGIC: &[u8; 4] = b"SNKG";
const HEADER_LEN: usize = 6;

/// Legacy: one `inputs x 4` matrix, f64, no bias.
pub const TAG_LINEAR: u16 = 1;
/// Legacy: `inputs x hidden` then `hidden x 4`, f64, no bias.
pub const TAG_ONE_HIDDEN: u16 = 2;
/// Current: layered f32 matrices with bias rows.
pub const TAG_LAYERED: u16 = 3;
/// Legacy: a chain of bias-free f64 matrices, e.g. 16 -> 32 -> 16 -> 4.
pub const TAG_LEGACY_LAYERS: u16 = 4;

#[derive(Serialize, Deserialize)]
struct LinearPayload {
    inputs: u32,
    weights: Vec<f64>,
}

#[derive(Serialize, Deserialize)]
struct OneHiddenPayload {
    inputs: u32,
    hidden: u32,
    input_to_hidden: Vec<f64>,
    hidden_to_output: Vec<f64>,
}

#[derive(Serialize, Deserialize)]
struct LegacyMatrixPayload {
    rows: u32,
    cols: u32,
    weights: Vec<f64>,
}

#[derive(Serialize, Deserialize)]
struct LegacyLayersPayload {
    matrices: Vec<LegacyMatrixPayload>,
}

#[derive(Serialize, Deserialize)]
struct LayeredPayload {
    shape: NetworkShape,
    matrices: Vec<Vec<f32>>,
}

/// A bias-free row-major matrix from an older format.
#[derive(Clone, Debug, PartialEq)]
pub struct LegacyMatrix {
    pub rows: usize,
    pub cols: usize,
    pub weights: Vec<f64>,
}

impl LegacyMatrix {
    fn checked(rows: usize, cols: usize, weights: Vec<f64>) -> Result<Self> {
        if weights.len() != rows * cols {
            return Err(SnakeError::Deserialization(format!(
                "legacy matrix is {rows}x{cols} but holds {} weights",
                weights.len()
            )));
        }
        if weights.iter().any(|w| !w.is_finite()) {
            return Err(SnakeError::Deserialization(
                "non-finite weight in legacy matrix".to_string(),
            ));
        }
        Ok(Self { rows, cols, weights })
    }
}

type EncodeResult = std::result::Result<Vec<u8>, bincode::error::EncodeError>;

fn frame<T: Serialize>(tag: u16, payload: &T) -> EncodeResult {
    let body = bincode::serde::encode_to_vec(payload, bincode::config::standard())?;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&tag.to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Encodes `genome` in the current format.
pub fn encode(genome: &Genome) -> EncodeResult {
    let payload = LayeredPayload {
        shape: genome.shape().clone(),
        matrices: genome.matrices().map(<[f32]>::to_vec).collect(),
    };
    frame(TAG_LAYERED, &payload)
}

/// Encodes a single-layer policy in the oldest format.
pub fn encode_linear(inputs: usize, weights: Vec<f64>) -> EncodeResult {
    frame(
        TAG_LINEAR,
        &LinearPayload {
            inputs: inputs as u32,
            weights,
        },
    )
}

/// Encodes a one-hidden-layer policy in the intermediate format.
pub fn encode_one_hidden(
    inputs: usize,
    hidden: usize,
    input_to_hidden: Vec<f64>,
    hidden_to_output: Vec<f64>,
) -> EncodeResult {
    frame(
        TAG_ONE_HIDDEN,
        &OneHiddenPayload {
            inputs: inputs as u32,
            hidden: hidden as u32,
            input_to_hidden,
            hidden_to_output,
        },
    )
}

/// Encodes a bias-free matrix chain in the last legacy format.
pub fn encode_legacy_layers(matrices: &[LegacyMatrix]) -> EncodeResult {
    let payload = LegacyLayersPayload {
        matrices: matrices
            .iter()
            .map(|m| LegacyMatrixPayload {
                rows: m.rows as u32,
                cols: m.cols as u32,
                weights: m.weights.clone(),
            })
            .collect(),
    };
    frame(TAG_LEGACY_LAYERS, &payload)
}

/// Reads the format tag without decoding the payload.
pub fn format_tag(bytes: &[u8]) -> Result<u16> {
    split_header(bytes).map(|(tag, _)| tag)
}

fn split_header(bytes: &[u8]) -> Result<(u16, &[u8])> {
    if bytes.len() < HEADER_LEN {
        return Err(SnakeError::Deserialization(format!(
            "blob too short: {} bytes",
            bytes.len()
        )));
    }
    if &bytes[..4] != MAGIC {
        return Err(SnakeError::Deserialization("bad magic".to_string()));
    }
    let tag = u16::from_le_bytes([bytes[4], bytes[5]]);
    Ok((tag, &bytes[HEADER_LEN..]))
}

fn read_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    let (value, read) =
        bincode::serde::decode_from_slice::<T, _>(payload, bincode::config::standard())
            .map_err(|e| SnakeError::Deserialization(e.to_string()))?;
    if read != payload.len() {
        return Err(SnakeError::Deserialization(format!(
            "{} trailing bytes after payload",
            payload.len() - read
        )));
    }
    Ok(value)
}

/// Decodes a blob into a genome of exactly `shape`, migrating legacy formats.
pub fn decode<R: Rng>(bytes: &[u8], shape: &NetworkShape, rng: &mut R) -> Result<Genome> {
    let (tag, payload) = split_header(bytes)?;
    match tag {
        TAG_LINEAR => {
            let p: LinearPayload = read_payload(payload)?;
            let m = LegacyMatrix::checked(p.inputs as usize, ACTIONS, p.weights)?;
            migrate(&[m], shape, rng)
        }
        TAG_ONE_HIDDEN => {
            let p: OneHiddenPayload = read_payload(payload)?;
            let (inputs, hidden) = (p.inputs as usize, p.hidden as usize);
            let first = LegacyMatrix::checked(inputs, hidden, p.input_to_hidden)?;
            let second = LegacyMatrix::checked(hidden, ACTIONS, p.hidden_to_output)?;
            migrate(&[first, second], shape, rng)
        }
        TAG_LEGACY_LAYERS => {
            let p: LegacyLayersPayload = read_payload(payload)?;
            let chain = p
                .matrices
                .into_iter()
                .map(|m| LegacyMatrix::checked(m.rows as usize, m.cols as usize, m.weights))
                .collect::<Result<Vec<_>>>()?;
            check_chain(&chain)?;
            migrate(&chain, shape, rng)
        }
        TAG_LAYERED => {
            let p: LayeredPayload = read_payload(payload)?;
            if p.shape != *shape {
                return Err(SnakeError::Deserialization(format!(
                    "stored shape {:?} does not match requested {:?}",
                    p.shape, shape
                )));
            }
            Genome::from_matrices(&p.shape, p.matrices)
                .map_err(|e| SnakeError::Deserialization(e.to_string()))
        }
        other => Err(SnakeError::Deserialization(format!(
            "unknown genome format tag {other}"
        ))),
    }
}

fn check_chain(chain: &[LegacyMatrix]) -> Result<()> {
    let Some(last) = chain.last() else {
        return Err(SnakeError::Deserialization("no legacy matrices".to_string()));
    };
    if last.cols != ACTIONS {
        return Err(SnakeError::Deserialization(format!(
            "legacy output layer has {} columns",
            last.cols
        )));
    }
    if chain.windows(2).any(|w| w[0].cols != w[1].rows) {
        return Err(SnakeError::Deserialization(
            "legacy matrices do not chain".to_string(),
        ));
    }
    Ok(())
}

/// Embeds the overlapping block of legacy matrices into the layers of `shape`.
///
/// Chains of equal depth map layer by layer. Otherwise only leading hidden-side
/// matrices are carried into leading hidden-side layers and the legacy output
/// matrix is dropped. Everything not covered, bias rows included, is drawn from
/// [-0.5, 0.5].
pub fn migrate<R: Rng>(
    legacy: &[LegacyMatrix],
    shape: &NetworkShape,
    rng: &mut R,
) -> Result<Genome> {
    if legacy.is_empty() {
        return Err(SnakeError::Deserialization("no legacy matrices".to_string()));
    }
    let dims = shape.layer_dims();
    let depth = dims.len();
    let aligned = legacy.len() == depth;
    let source = |k: usize| {
        if aligned || (k + 1 < legacy.len() && k + 1 < depth) {
            legacy.get(k)
        } else {
            None
        }
    };
    let matrices = dims
        .into_iter()
        .enumerate()
        .map(|(k, (inputs, outputs))| {
            let mut weights: Vec<f32> = (0..(inputs + 1) * outputs)
                .map(|_| rng.gen_range(-0.5..=0.5))
                .collect();
            if let Some(old) = source(k) {
                for r in 0..old.rows.min(inputs) {
                    for c in 0..old.cols.min(outputs) {
                        weights[r * outputs + c] = old.weights[r * old.cols + c] as f32;
                    }
                }
            }
            weights
        })
        .collect();
    Genome::from_matrices(shape, matrices)
}

/// Decodes `bytes`, or logs why not and returns a fresh random genome.
pub fn load_or_random<R: Rng>(bytes: &[u8], shape: &NetworkShape, rng: &mut R) -> Genome {
    match decode(bytes, shape, rng) {
        Ok(genome) => genome,
        Err(e) => {
            warn!(error = %e, "stored genome rejected, starting from a random one");
            Genome::random(shape, rng)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(42)
    }

    #[test]
    fn current_format_round_trips() {
        let shape = NetworkShape::new(16, vec![32, 16]);
        let genome = Genome::random(&shape, &mut rng());
        let bytes = encode(&genome).unwrap();
        assert_eq!(&bytes[..4], MAGIC);
        assert_eq!(format_tag(&bytes).unwrap(), TAG_LAYERED);
        assert_eq!(decode(&bytes, &shape, &mut rng()).unwrap(), genome);
    }

    #[test]
    fn current_format_rejects_other_shapes() {
        let genome = Genome::random(&NetworkShape::new(8, vec![4]), &mut rng());
        let bytes = encode(&genome).unwrap();
        let err = decode(&bytes, &NetworkShape::new(12, vec![4]), &mut rng()).unwrap_err();
        assert!(matches!(err, SnakeError::Deserialization(_)));
    }

    #[test]
    fn garbage_is_rejected() {
        let shape = NetworkShape::new(8, vec![]);
        let blobs: [&[u8]; 5] = [
            b"",
            b"SNK",
            b"ABCD\x03\x00",
            b"SNKG\x09\x00rest",
            b"SNKG\x03\x00\xff",
        ];
        for bytes in blobs {
            assert!(matches!(
                decode(bytes, &shape, &mut rng()),
                Err(SnakeError::Deserialization(_))
            ));
        }
    }

    fn legacy(rows: usize, cols: usize, value: f64) -> LegacyMatrix {
        LegacyMatrix {
            rows,
            cols,
            weights: vec![value; rows * cols],
        }
    }

    #[test]
    fn linear_legacy_fills_a_single_layer_policy() {
        let weights: Vec<f64> = (0..32).map(|i| i as f64 / 100.0).collect();
        let bytes = encode_linear(8, weights.clone()).unwrap();
        let shape = NetworkShape::new(12, vec![]);
        let genome = decode(&bytes, &shape, &mut rng()).unwrap();

        let only = genome.matrices().next().unwrap();
        assert_eq!(only.len(), 13 * 4);
        for r in 0..8 {
            for c in 0..4 {
                assert_eq!(only[r * 4 + c], weights[r * 4 + c] as f32);
            }
        }
        assert!(only.iter().all(|w| (-0.5..=0.5).contains(w)));
    }

    #[test]
    fn linear_legacy_is_not_wired_into_hidden_layers() {
        let bytes = encode_linear(8, vec![0.3; 32]).unwrap();
        let shape = NetworkShape::new(16, vec![32, 16]);
        let genome = decode(&bytes, &shape, &mut rng()).unwrap();
        for m in genome.matrices() {
            assert!(m.iter().all(|&w| w != 0.3 && (-0.5..=0.5).contains(&w)));
        }
    }

    #[test]
    fn one_hidden_legacy_fills_both_layers() {
        let ih = vec![0.25; 12 * 16];
        let ho = vec![-0.125; 16 * 4];
        let bytes = encode_one_hidden(12, 16, ih, ho).unwrap();
        let shape = NetworkShape::new(12, vec![16]);
        let genome = decode(&bytes, &shape, &mut rng()).unwrap();
        let mut layers = genome.matrices();

        let first = layers.next().unwrap();
        assert!(first[..12 * 16].iter().all(|&w| w == 0.25));
        let second = layers.next().unwrap();
        assert!(second[..16 * 4].iter().all(|&w| w == -0.125));
    }

    #[test]
    fn one_hidden_legacy_keeps_its_output_off_deeper_layers() {
        let bytes = encode_one_hidden(12, 16, vec![0.25; 12 * 16], vec![-0.125; 16 * 4]).unwrap();
        let shape = NetworkShape::new(16, vec![32, 16]);
        let genome = decode(&bytes, &shape, &mut rng()).unwrap();
        let layers: Vec<&[f32]> = genome.matrices().collect();

        for r in 0..12 {
            assert!(layers[0][r * 32..r * 32 + 16].iter().all(|&w| w == 0.25));
        }
        assert!(layers[1].iter().all(|&w| w != -0.125));
        assert!(layers[2].iter().all(|&w| w != -0.125));
    }

    #[test]
    fn layered_legacy_maps_layer_by_layer() {
        let chain = [legacy(16, 32, 0.1), legacy(32, 16, 0.2), legacy(16, 4, 0.3)];
        let bytes = encode_legacy_layers(&chain).unwrap();
        assert_eq!(format_tag(&bytes).unwrap(), TAG_LEGACY_LAYERS);

        let shape = NetworkShape::new(16, vec![32, 16]);
        let genome = decode(&bytes, &shape, &mut rng()).unwrap();
        for (layer, old) in genome.matrices().zip(&chain) {
            let body = &layer[..old.rows * old.cols];
            assert!(body.iter().all(|&w| w == old.weights[0] as f32));
            assert!(layer[body.len()..].iter().all(|w| (-0.5..=0.5).contains(w)));
        }
    }

    #[test]
    fn layered_legacy_must_chain_into_four_actions() {
        let shape = NetworkShape::new(16, vec![32, 16]);
        let broken = [legacy(16, 32, 0.1), legacy(16, 4, 0.3)];
        let bytes = encode_legacy_layers(&broken).unwrap();
        assert!(decode(&bytes, &shape, &mut rng()).is_err());

        let wide = [legacy(16, 5, 0.1)];
        let bytes = encode_legacy_layers(&wide).unwrap();
        assert!(decode(&bytes, &shape, &mut rng()).is_err());

        let bytes = encode_legacy_layers(&[]).unwrap();
        assert!(decode(&bytes, &shape, &mut rng()).is_err());
    }

    #[test]
    fn legacy_with_wrong_weight_count_fails() {
        let bytes = encode_linear(8, vec![0.0; 31]).unwrap();
        let shape = NetworkShape::new(8, vec![]);
        assert!(decode(&bytes, &shape, &mut rng()).is_err());
    }

    #[test]
    fn fallback_produces_a_usable_genome() {
        let shape = NetworkShape::new(12, vec![8]);
        let genome = load_or_random(b"not a genome", &shape, &mut rng());
        assert_eq!(genome.shape(), &shape);
        assert!(genome.decide(&[0.0; 12], &mut rng()).unwrap() < ACTIONS);
    }
}
