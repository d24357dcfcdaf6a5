//! Clustering and layout primitives for the topic mind map.
//!
//! Average-link agglomerative clustering over cosine similarity, medoid
//! selection for representative chunks, and a left-to-right tree layout.

use std::collections::HashMap;

/// Pairwise cosine similarity matrix for unit-length embeddings.
pub fn similarity_matrix(embeddings: &[Vec<f32>]) -> Vec<Vec<f32>> {
    let n = embeddings.len();
    let mut sim = vec![vec![0.0f32; n]; n];
    for i in 0..n {
        for j in i..n {
            let s = crate::vector_store::cosine_similarity(&embeddings[i], &embeddings[j]);
            sim[i][j] = s;
            sim[j][i] = s;
        }
    }
    sim
}

/// Average-link agglomerative clustering down to `target_k` clusters.
///
/// Merges the pair with the highest mean inter-cluster similarity each step.
/// Deterministic for a fixed input order.
pub fn agglomerative_clusters(sim: &[Vec<f32>], n: usize, target_k: usize) -> Vec<Vec<usize>> {
    if n == 0 {
        return Vec::new();
    }
    if target_k <= 1 || n == 1 {
        return vec![(0..n).collect()];
    }
    let target_k = target_k.min(n);

    let mut clusters: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();

    let cluster_sim = |a: &[usize], b: &[usize]| -> f32 {
        let mut total = 0.0f32;
        let mut count = 0usize;
        for &i in a {
            for &j in b {
                total += sim[i][j];
                count += 1;
            }
        }
        if count == 0 {
            -1.0
        } else {
            total / count as f32
        }
    };

    while clusters.len() > target_k {
        let mut best_pair: Option<(usize, usize)> = None;
        let mut best_score = -1.0f32;

        for i in 0..clusters.len() {
            for j in (i + 1)..clusters.len() {
                let score = cluster_sim(&clusters[i], &clusters[j]);
                if score > best_score {
                    best_score = score;
                    best_pair = Some((i, j));
                }
            }
        }

        let Some((i, j)) = best_pair else { break };
        let merged = clusters.remove(j);
        clusters[i].extend(merged);
    }

    clusters
}

/// Index of the member most similar to all others (the medoid).
pub fn medoid_index(sim: &[Vec<f32>], members: &[usize]) -> usize {
    match members {
        [] => 0,
        [only] => *only,
        _ => {
            let mut best = members[0];
            let mut best_score = -1.0f32;
            for &i in members {
                let score: f32 =
                    members.iter().map(|&j| sim[i][j]).sum::<f32>() / members.len() as f32;
                if score > best_score {
                    best_score = score;
                    best = i;
                }
            }
            best
        }
    }
}

/// Node position in the mind map.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

const X_SPACING: f64 = 340.0;
const Y_SPACING: f64 = 130.0;

/// Left-to-right tree layout.
///
/// Leaves are stacked top-to-bottom with even spacing; internal nodes are
/// centered over their children; the whole tree is centered vertically.
pub fn mind_map_layout(
    root_id: &str,
    children: &HashMap<String, Vec<String>>,
) -> HashMap<String, Position> {
    let mut positions: HashMap<String, Position> = HashMap::new();
    let mut next_y = 0.0f64;

    fn dfs(
        node_id: &str,
        depth: usize,
        children: &HashMap<String, Vec<String>>,
        positions: &mut HashMap<String, Position>,
        next_y: &mut f64,
    ) -> f64 {
        let kids = children.get(node_id).cloned().unwrap_or_default();
        let y = if kids.is_empty() {
            let y = *next_y;
            *next_y += Y_SPACING;
            y
        } else {
            let child_ys: Vec<f64> = kids
                .iter()
                .map(|child| dfs(child, depth + 1, children, positions, next_y))
                .collect();
            child_ys.iter().sum::<f64>() / child_ys.len() as f64
        };

        positions.insert(
            node_id.to_string(),
            Position {
                x: depth as f64 * X_SPACING,
                y,
            },
        );
        y
    }

    dfs(root_id, 0, children, &mut positions, &mut next_y);

    // Center vertically around zero.
    let ys: Vec<f64> = positions.values().map(|p| p.y).collect();
    if let (Some(min), Some(max)) = (
        ys.iter().cloned().reduce(f64::min),
        ys.iter().cloned().reduce(f64::max),
    ) {
        let mid = (min + max) / 2.0;
        for position in positions.values_mut() {
            position.y -= mid;
        }
    }

    positions
}

/// Value at the given percentile (nearest-rank, inputs need not be sorted).
pub fn percentile(values: &[f32], pct: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((pct / 100.0) * (sorted.len() - 1) as f32).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agglomerative_merges_similar_vectors() {
        // Two tight groups: indices 0,1 and 2,3.
        let embeddings = vec![
            vec![1.0, 0.0],
            vec![0.99, 0.05],
            vec![0.0, 1.0],
            vec![0.05, 0.99],
        ];
        let sim = similarity_matrix(&embeddings);
        let clusters = agglomerative_clusters(&sim, 4, 2);

        assert_eq!(clusters.len(), 2);
        for cluster in &clusters {
            let mut sorted = cluster.clone();
            sorted.sort();
            assert!(sorted == vec![0, 1] || sorted == vec![2, 3]);
        }
    }

    #[test]
    fn test_cluster_edge_cases() {
        let sim = similarity_matrix(&[vec![1.0, 0.0]]);
        assert_eq!(agglomerative_clusters(&sim, 1, 3), vec![vec![0]]);
        assert!(agglomerative_clusters(&[], 0, 2).is_empty());

        // target 1 collapses everything
        let embeddings = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let sim = similarity_matrix(&embeddings);
        assert_eq!(agglomerative_clusters(&sim, 2, 1).len(), 1);
    }

    #[test]
    fn test_medoid_prefers_central_member() {
        // Member 1 sits between 0 and 2.
        let embeddings = vec![
            vec![1.0, 0.0],
            vec![0.7, 0.7],
            vec![0.0, 1.0],
        ];
        let sim = similarity_matrix(&embeddings);
        assert_eq!(medoid_index(&sim, &[0, 1, 2]), 1);
        assert_eq!(medoid_index(&sim, &[2]), 2);
    }

    #[test]
    fn test_layout_depth_and_centering() {
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        children.insert("root".to_string(), vec!["a".to_string(), "b".to_string()]);
        children.insert("a".to_string(), vec!["a1".to_string(), "a2".to_string()]);

        let positions = mind_map_layout("root", &children);

        assert_eq!(positions["root"].x, 0.0);
        assert_eq!(positions["a"].x, X_SPACING);
        assert_eq!(positions["a1"].x, 2.0 * X_SPACING);

        // Parent is centered over its children.
        let mid = (positions["a1"].y + positions["a2"].y) / 2.0;
        assert!((positions["a"].y - mid).abs() < 1e-9);

        // The whole tree is centered vertically.
        let ys: Vec<f64> = positions.values().map(|p| p.y).collect();
        let min = ys.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = ys.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        assert!((min + max).abs() < 1e-9);
    }

    #[test]
    fn test_percentile() {
        let values = vec![0.1, 0.2, 0.3, 0.4, 0.5];
        assert!((percentile(&values, 0.0) - 0.1).abs() < 1e-6);
        assert!((percentile(&values, 100.0) - 0.5).abs() < 1e-6);
        assert!((percentile(&values, 50.0) - 0.3).abs() < 1e-6);
        assert_eq!(percentile(&[], 40.0), 0.0);
    }
}
