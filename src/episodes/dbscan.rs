//! Density clustering over cosine distance.
//!
//! Classic DBSCAN with distance `1 − cos(a, b)`. Vectors of mismatched
//! dimension sit at distance 1.0 from everything, so they land in noise
//! instead of poisoning a cluster. Noise points are simply absent from the
//! output; the consolidator leaves them orphaned for the next pass.

use crate::vectors::math::cosine_similarity;

/// DBSCAN parameters.
#[derive(Clone, Copy, Debug)]
pub struct DbscanParams {
    /// Neighborhood radius over cosine distance.
    pub epsilon: f64,
    /// Minimum neighborhood size (the point itself included) for a core
    /// point; also the minimum emitted cluster size.
    pub min_points: usize,
}

/// Cosine distance with mismatched dimensions pinned to 1.0.
fn distance(a: &[f32], b: &[f32]) -> f64 {
    match cosine_similarity(a, b) {
        Some(sim) => 1.0 - sim,
        None => 1.0,
    }
}

const UNCLASSIFIED: isize = -2;
const NOISE: isize = -1;

/// Cluster `vectors`, returning member-index groups of size
/// `>= min_points`. Indices within a cluster keep input order.
#[must_use]
pub fn cluster(vectors: &[Vec<f32>], params: DbscanParams) -> Vec<Vec<usize>> {
    let n = vectors.len();
    let min_points = params.min_points.max(1);
    if n < min_points {
        return Vec::new();
    }

    let mut labels = vec![UNCLASSIFIED; n];
    let mut cluster_id: isize = 0;

    for point in 0..n {
        if labels[point] != UNCLASSIFIED {
            continue;
        }
        let neighbors = region_query(vectors, point, params.epsilon);
        if neighbors.len() < min_points {
            labels[point] = NOISE;
            continue;
        }

        labels[point] = cluster_id;
        let mut frontier: Vec<usize> = neighbors;
        let mut cursor = 0;
        while cursor < frontier.len() {
            let candidate = frontier[cursor];
            cursor += 1;
            if labels[candidate] == NOISE {
                // Border point reachable from a core point.
                labels[candidate] = cluster_id;
            }
            if labels[candidate] != UNCLASSIFIED {
                continue;
            }
            labels[candidate] = cluster_id;
            let candidate_neighbors = region_query(vectors, candidate, params.epsilon);
            if candidate_neighbors.len() >= min_points {
                frontier.extend(candidate_neighbors);
            }
        }
        cluster_id += 1;
    }

    let mut clusters: Vec<Vec<usize>> = vec![Vec::new(); cluster_id as usize];
    for (index, label) in labels.iter().enumerate() {
        if *label >= 0 {
            clusters[*label as usize].push(index);
        }
    }
    clusters.retain(|members| members.len() >= min_points);
    clusters
}

fn region_query(vectors: &[Vec<f32>], point: usize, epsilon: f64) -> Vec<usize> {
    (0..vectors.len())
        .filter(|&other| distance(&vectors[point], &vectors[other]) <= epsilon)
        .collect()
}
