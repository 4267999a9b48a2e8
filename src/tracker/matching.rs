//! Cost matrices and the linear assignment used by every association tier.

use ndarray::Array2;

use crate::tracker::rect::Rect;

/// Cost assigned to padding cells so the solver never prefers them over a
/// real pair.
const PADDING_COST: f64 = 1e6;

/// `1 - IoU` for every (track, detection) pair.
pub fn iou_distance(track_boxes: &[Rect], det_boxes: &[Rect]) -> Array2<f32> {
    let mut dists = Array2::zeros((track_boxes.len(), det_boxes.len()));
    for (i, t) in track_boxes.iter().enumerate() {
        for (j, d) in det_boxes.iter().enumerate() {
            dists[[i, j]] = 1.0 - t.iou(d);
        }
    }
    dists
}

/// Weight IoU similarity by detection confidence, so that among equally
/// overlapping detections the more confident one is cheaper.
pub fn fuse_score(cost_matrix: &mut Array2<f32>, scores: &[f32]) {
    for ((_, j), cost) in cost_matrix.indexed_iter_mut() {
        let similarity = (1.0 - *cost) * scores[j];
        *cost = 1.0 - similarity;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentResult {
    pub matches: Vec<(usize, usize)>,
    pub unmatched_tracks: Vec<usize>,
    pub unmatched_detections: Vec<usize>,
}

/// Solve the minimum-cost assignment and keep pairs whose cost is within
/// `thresh`.
///
/// Uses Jonker-Volgenant on a square padded matrix. If the solver rejects
/// the input, falls back to a greedy pass over pairs ordered by (cost, row,
/// column), which is deterministic but not optimal.
pub fn linear_assignment(cost_matrix: &Array2<f32>, thresh: f32) -> AssignmentResult {
    let (num_rows, num_cols) = cost_matrix.dim();

    if num_rows == 0 || num_cols == 0 {
        return AssignmentResult {
            matches: vec![],
            unmatched_tracks: (0..num_rows).collect(),
            unmatched_detections: (0..num_cols).collect(),
        };
    }

    let size = num_rows.max(num_cols);
    let mut padded = Array2::<f64>::from_elem((size, size), PADDING_COST);
    for ((i, j), &cost) in cost_matrix.indexed_iter() {
        padded[[i, j]] = if cost.is_finite() { cost as f64 } else { PADDING_COST };
    }

    let pairs = match lapjv::lapjv(&padded) {
        Ok((row_to_col, _)) => row_to_col
            .into_iter()
            .enumerate()
            .filter(|&(row, col)| row < num_rows && col < num_cols)
            .filter(|&(row, col)| cost_matrix[[row, col]] <= thresh)
            .collect(),
        Err(err) => {
            tracing::debug!(error = ?err, rows = num_rows, cols = num_cols, "lapjv failed, using greedy assignment");
            greedy_assignment(cost_matrix, thresh)
        }
    };

    collect(pairs, num_rows, num_cols)
}

fn greedy_assignment(cost_matrix: &Array2<f32>, thresh: f32) -> Vec<(usize, usize)> {
    let mut candidates: Vec<(f32, usize, usize)> = cost_matrix
        .indexed_iter()
        .filter(|&(_, &cost)| cost <= thresh)
        .map(|((i, j), &cost)| (cost, i, j))
        .collect();
    candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

    let (rows, cols) = cost_matrix.dim();
    let mut row_used = vec![false; rows];
    let mut col_used = vec![false; cols];
    let mut pairs = Vec::new();
    for (_, i, j) in candidates {
        if !row_used[i] && !col_used[j] {
            row_used[i] = true;
            col_used[j] = true;
            pairs.push((i, j));
        }
    }
    pairs
}

fn collect(mut matches: Vec<(usize, usize)>, num_rows: usize, num_cols: usize) -> AssignmentResult {
    matches.sort_unstable();

    let mut row_matched = vec![false; num_rows];
    let mut col_matched = vec![false; num_cols];
    for &(i, j) in &matches {
        row_matched[i] = true;
        col_matched[j] = true;
    }

    AssignmentResult {
        matches,
        unmatched_tracks: (0..num_rows).filter(|&i| !row_matched[i]).collect(),
        unmatched_detections: (0..num_cols).filter(|&j| !col_matched[j]).collect(),
    }
}
