//! Unsupervised outlier detection over `[latency_ms, error_flag]` points.

use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;

const EULER_GAMMA: f64 = 0.577_215_664_9;

/// Label and score for one input point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub outlier: bool,
    /// Decision score: negative for outliers, lower is more anomalous.
    pub score: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("non-finite value in point {0}")]
    NonFinite(usize),
}

pub trait AnomalyDetector: Send + Sync {
    /// One detection per input point, in input order.
    fn detect(&self, points: &[[f64; 2]]) -> Result<Vec<Detection>, DetectorError>;
}

/// Isolation forest with a fixed seed, so the same input always yields the
/// same labels.
///
/// Points are outliers when their anomaly score exceeds 0.5.
#[derive(Debug, Clone)]
pub struct IsolationForest {
    pub trees: usize,
    pub max_samples: usize,
    pub seed: u64,
}

impl Default for IsolationForest {
    fn default() -> Self {
        Self {
            trees: 100,
            max_samples: 256,
            seed: 42,
        }
    }
}

impl AnomalyDetector for IsolationForest {
    fn detect(&self, points: &[[f64; 2]]) -> Result<Vec<Detection>, DetectorError> {
        if let Some(i) = points.iter().position(|p| !p.iter().all(|v| v.is_finite())) {
            return Err(DetectorError::NonFinite(i));
        }

        let distinct: HashSet<[u64; 2]> = points
            .iter()
            .map(|p| [p[0].to_bits(), p[1].to_bits()])
            .collect();
        if distinct.len() < 2 {
            return Ok(vec![
                Detection {
                    outlier: false,
                    score: 0.0,
                };
                points.len()
            ]);
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let sample_size = self.max_samples.min(points.len()).max(2);
        let height_limit = (sample_size as f64).log2().ceil() as usize;

        let forest: Vec<Node> = (0..self.trees.max(1))
            .map(|_| {
                let sample = index::sample(&mut rng, points.len(), sample_size).into_vec();
                Node::build(points, sample, 0, height_limit, &mut rng)
            })
            .collect();

        let norm = average_path_length(sample_size);
        Ok(points
            .iter()
            .map(|p| {
                let mean_depth =
                    forest.iter().map(|t| t.path_length(p, 0)).sum::<f64>() / forest.len() as f64;
                let anomaly_score = 2f64.powf(-mean_depth / norm);
                let score = 0.5 - anomaly_score;
                Detection {
                    outlier: score < 0.0,
                    score,
                }
            })
            .collect())
    }
}

enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl Node {
    fn build(
        points: &[[f64; 2]],
        rows: Vec<usize>,
        depth: usize,
        height_limit: usize,
        rng: &mut StdRng,
    ) -> Node {
        if depth >= height_limit || rows.len() <= 1 {
            return Node::Leaf { size: rows.len() };
        }

        // Only features that still vary within this node can split it.
        let ranges: Vec<(usize, f64, f64)> = (0..2)
            .filter_map(|f| {
                let (lo, hi) = rows.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &r| {
                    (lo.min(points[r][f]), hi.max(points[r][f]))
                });
                (lo < hi).then_some((f, lo, hi))
            })
            .collect();
        if ranges.is_empty() {
            return Node::Leaf { size: rows.len() };
        }

        let (feature, lo, hi) = ranges[rng.gen_range(0..ranges.len())];
        let threshold = rng.gen_range(lo..hi);
        let (left, right): (Vec<usize>, Vec<usize>) =
            rows.into_iter().partition(|&r| points[r][feature] <= threshold);

        Node::Split {
            feature,
            threshold,
            left: Box::new(Node::build(points, left, depth + 1, height_limit, rng)),
            right: Box::new(Node::build(points, right, depth + 1, height_limit, rng)),
        }
    }

    fn path_length(&self, point: &[f64; 2], depth: usize) -> f64 {
        match self {
            Node::Leaf { size } => depth as f64 + average_path_length(*size),
            Node::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                if point[*feature] <= *threshold {
                    left.path_length(point, depth + 1)
                } else {
                    right.path_length(point, depth + 1)
                }
            }
        }
    }
}

/// Average path length of an unsuccessful binary search tree lookup over `n`
/// points.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}
