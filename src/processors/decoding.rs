//! Per-round max-channel decoding.
//!
//! For every spot the brightest channel of each round forms its code, which
//! is looked up in the codebook. Spots are decoded independently in parallel
//! and keep their input order.

use std::collections::BTreeMap;

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;

use super::spots::{Spot, SpotTable};
use crate::config::{Aggregation, ConfigurationError, DecodeConfig};
use crate::core::codebook::Codebook;

/// A spot annotated with its decoded target.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSpot {
    pub spot: Spot,
    /// Brightest channel index per round.
    pub code: Vec<usize>,
    /// `None` when the code is not in the codebook.
    pub target: Option<String>,
    pub total_intensity: f32,
    /// Intensities scaled to unit L2 norm.
    pub normalized_intensities: Array2<f32>,
    pub passes_threshold: bool,
}

/// Decoded spots of one field of view.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedResult {
    pub round_labels: Vec<u32>,
    pub ch_labels: Vec<u32>,
    pub spots: Vec<DecodedSpot>,
}

impl DecodedResult {
    #[inline]
    pub fn len(&self) -> usize {
        self.spots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.spots.is_empty()
    }

    /// Number of spots per assigned target.
    pub fn target_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for target in self.spots.iter().filter_map(|s| s.target.as_ref()) {
            *counts.entry(target.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn unassigned(&self) -> usize {
        self.spots.iter().filter(|s| s.target.is_none()).count()
    }
}

fn argmax(values: ArrayView1<'_, f32>) -> (usize, f32) {
    let mut best = (0usize, f32::NEG_INFINITY);
    for (i, &v) in values.iter().enumerate() {
        // strict comparison keeps the lowest index on ties
        if v > best.1 {
            best = (i, v);
        }
    }
    best
}

/// Brightest channel of each round; ties resolve to the lowest channel.
pub fn per_round_max_code(intensities: ArrayView2<'_, f32>) -> Vec<usize> {
    intensities
        .axis_iter(Axis(0))
        .map(|round| argmax(round).0)
        .collect()
}

fn aggregate(maxima: &[f32], aggregation: Aggregation) -> f32 {
    if maxima.is_empty() {
        return 0.0;
    }
    match aggregation {
        Aggregation::Sum => maxima.iter().sum(),
        Aggregation::Mean => maxima.iter().sum::<f32>() / maxima.len() as f32,
        Aggregation::Max => maxima.iter().copied().fold(f32::NEG_INFINITY, f32::max),
    }
}

fn l2_normalize(intensities: &Array2<f32>) -> Array2<f32> {
    let norm = intensities.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        intensities / norm
    } else {
        Array2::zeros(intensities.raw_dim())
    }
}

fn decode_spot(spot: &Spot, codebook: &Codebook, config: &DecodeConfig) -> DecodedSpot {
    let (code, maxima): (Vec<usize>, Vec<f32>) = spot
        .intensities
        .axis_iter(Axis(0))
        .map(argmax)
        .unzip();
    let total_intensity = aggregate(&maxima, config.aggregation);
    DecodedSpot {
        spot: spot.clone(),
        target: codebook.lookup(&code).map(String::from),
        code,
        total_intensity,
        normalized_intensities: l2_normalize(&spot.intensities),
        passes_threshold: total_intensity > config.min_total_intensity,
    }
}

/// Decode every spot of `table` against `codebook`.
///
/// Fails if the table's rounds/channels do not match the codebook.
pub fn decode(
    table: &SpotTable,
    codebook: &Codebook,
    config: &DecodeConfig,
) -> Result<DecodedResult, ConfigurationError> {
    config.validate()?;
    if table.num_rounds() != codebook.num_rounds() || table.num_chs() != codebook.num_chs() {
        return Err(ConfigurationError::CodebookMismatch {
            codebook_rounds: codebook.num_rounds(),
            codebook_chs: codebook.num_chs(),
            data_rounds: table.num_rounds(),
            data_chs: table.num_chs(),
        });
    }

    let spots: Vec<DecodedSpot> = table
        .spots
        .par_iter()
        .map(|spot| decode_spot(spot, codebook, config))
        .collect();

    Ok(DecodedResult {
        round_labels: table.round_labels.clone(),
        ch_labels: table.ch_labels.clone(),
        spots,
    })
}

/// Keep only spots whose total intensity passed the threshold.
pub fn filter_by_intensity(mut result: DecodedResult) -> DecodedResult {
    let before = result.spots.len();
    result.spots.retain(|s| s.passes_threshold);
    log::debug!(
        "intensity filter kept {}/{} spots",
        result.spots.len(),
        before
    );
    result
}

/// [`decode`] followed by [`filter_by_intensity`].
pub fn decode_and_filter(
    table: &SpotTable,
    codebook: &Codebook,
    config: &DecodeConfig,
) -> Result<DecodedResult, ConfigurationError> {
    let decoded = decode(table, codebook, config)?;
    let result = filter_by_intensity(decoded);
    log::info!(
        "Decoded {} spots ({} unassigned) above total intensity {}",
        result.len(),
        result.unassigned(),
        config.min_total_intensity
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codebook::CodebookEntry;
    use ndarray::array;

    fn codebook() -> Codebook {
        Codebook::new(
            3,
            2,
            vec![
                CodebookEntry {
                    target: "G1".into(),
                    code: vec![0, 1, 0],
                },
                CodebookEntry {
                    target: "G2".into(),
                    code: vec![1, 1, 1],
                },
            ],
        )
        .unwrap()
    }

    fn spot(id: usize, intensities: Array2<f32>) -> Spot {
        Spot {
            id,
            z: 0.0,
            y: id as f32,
            x: 0.0,
            radius: 1.0,
            mass: 1.0,
            signal: 1.0,
            intensities,
        }
    }

    fn table(spots: Vec<Spot>) -> SpotTable {
        let (rounds, chs) = spots[0].intensities.dim();
        SpotTable::new(
            (0..rounds as u32).collect(),
            (0..chs as u32).collect(),
            spots,
        )
    }

    #[test]
    fn test_per_round_max_code_ties_to_lowest() {
        let intensities = array![[0.2, 0.2], [0.1, 0.3], [0.0, 0.0]];
        assert_eq!(per_round_max_code(intensities.view()), vec![0, 1, 0]);
    }

    #[test]
    fn test_decode_assigns_targets() {
        let spots = vec![
            spot(0, array![[0.9, 0.1], [0.1, 0.8], [0.7, 0.0]]),
            spot(1, array![[0.1, 0.9], [0.2, 0.8], [0.0, 0.7]]),
            spot(2, array![[0.9, 0.1], [0.9, 0.1], [0.9, 0.1]]),
        ];
        let result = decode(&table(spots), &codebook(), &DecodeConfig::default()).unwrap();
        assert_eq!(result.spots[0].target.as_deref(), Some("G1"));
        assert_eq!(result.spots[1].target.as_deref(), Some("G2"));
        assert_eq!(result.spots[2].target, None);
        assert!((result.spots[0].total_intensity - 2.4).abs() < 1e-6);
        assert_eq!(result.unassigned(), 1);
        assert_eq!(result.target_counts().get("G1"), Some(&1));
    }

    #[test]
    fn test_code_shape_matches_codebook() {
        let spots: Vec<Spot> = (0..6)
            .map(|i| {
                let v = i as f32 / 10.0;
                spot(i, array![[v, 0.5 - v], [0.3, v], [v * v, 0.1]])
            })
            .collect();
        let cb = codebook();
        let result = decode(&table(spots), &cb, &DecodeConfig::default()).unwrap();
        for decoded in &result.spots {
            assert_eq!(decoded.code.len(), cb.num_rounds());
            assert!(decoded.code.iter().all(|&c| c < cb.num_chs()));
        }
    }

    #[test]
    fn test_threshold_is_strict() {
        let cb = Codebook::new(
            1,
            1,
            vec![CodebookEntry {
                target: "A".into(),
                code: vec![0],
            }],
        )
        .unwrap();
        let config = DecodeConfig::default();
        let at = spot(0, array![[0.025f32]]);
        let above = spot(1, array![[0.026f32]]);
        let result = decode_and_filter(&table(vec![at, above]), &cb, &config).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.spots[0].spot.id, 1);
    }

    #[test]
    fn test_decoding_is_order_invariant() {
        let spots = vec![
            spot(0, array![[0.9, 0.1], [0.1, 0.8], [0.7, 0.0]]),
            spot(1, array![[0.1, 0.9], [0.2, 0.8], [0.0, 0.7]]),
            spot(2, array![[0.01, 0.0], [0.0, 0.01], [0.0, 0.0]]),
            spot(3, array![[0.3, 0.4], [0.6, 0.5], [0.2, 0.1]]),
        ];
        let mut reversed = spots.clone();
        reversed.reverse();

        let pairs = |spots: Vec<Spot>| {
            let result = decode_and_filter(&table(spots), &codebook(), &DecodeConfig::default())
                .unwrap();
            let mut pairs: Vec<(usize, Option<String>)> = result
                .spots
                .into_iter()
                .map(|s| (s.spot.id, s.target))
                .collect();
            pairs.sort();
            pairs
        };
        assert_eq!(pairs(spots), pairs(reversed));
    }

    #[test]
    fn test_aggregation_modes() {
        let maxima = [0.2f32, 0.4, 0.6];
        assert!((aggregate(&maxima, Aggregation::Sum) - 1.2).abs() < 1e-6);
        assert!((aggregate(&maxima, Aggregation::Mean) - 0.4).abs() < 1e-6);
        assert_eq!(aggregate(&maxima, Aggregation::Max), 0.6);
    }

    #[test]
    fn test_normalized_intensities() {
        let result = decode(
            &table(vec![
                spot(0, array![[3.0, 0.0], [0.0, 4.0], [0.0, 0.0]]),
                spot(1, Array2::zeros((3, 2))),
            ]),
            &codebook(),
            &DecodeConfig::default(),
        )
        .unwrap();
        let n = &result.spots[0].normalized_intensities;
        assert!((n[[0, 0]] - 0.6).abs() < 1e-6);
        assert!((n[[1, 1]] - 0.8).abs() < 1e-6);
        assert!(result.spots[1].normalized_intensities.iter().all(|&v| v == 0.0));
        assert!(!result.spots[1].passes_threshold);
    }

    #[test]
    fn test_codebook_mismatch_rejected() {
        let spots = vec![spot(0, Array2::zeros((2, 2)))];
        assert!(matches!(
            decode(&table(spots), &codebook(), &DecodeConfig::default()),
            Err(ConfigurationError::CodebookMismatch { data_rounds: 2, .. })
        ));
    }
}
