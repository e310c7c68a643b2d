//! Pairwise comparison and multi-face winner selection.
//!
//! Distances are Euclidean (L2); smaller means more similar. Winner
//! selection always reports a winner for non-empty input and never applies
//! an acceptance cutoff: callers decide what distance counts as a match.

use crate::types::{Detection, Embedding, Match};
use serde::Serialize;
use std::cmp::Ordering;
use thiserror::Error;

/// Distance below which two embeddings are taken to be the same person.
pub const DEFAULT_SAME_IDENTITY_THRESHOLD: f32 = 0.7;

#[derive(Error, Debug, PartialEq)]
pub enum MatchError {
    #[error("embedding dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
}

/// Outcome of comparing two embeddings directly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Comparison {
    pub distance: f32,
    pub same_person: bool,
}

/// L2 norm of `a - b`.
pub fn distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

pub fn same_identity(distance: f32, threshold: f32) -> bool {
    distance < threshold
}

/// Compare two embeddings, rejecting vectors of different length.
pub fn compare(a: &Embedding, b: &Embedding, threshold: f32) -> Result<Comparison, MatchError> {
    if a.dim() != b.dim() {
        return Err(MatchError::DimensionMismatch {
            left: a.dim(),
            right: b.dim(),
        });
    }
    let d = distance(&a.values, &b.values);
    Ok(Comparison {
        distance: d,
        same_person: same_identity(d, threshold),
    })
}

/// Registry order: ascending distance, ties broken by smaller record id.
pub fn rank(a: &Match, b: &Match) -> Ordering {
    a.distance
        .total_cmp(&b.distance)
        .then(a.record_id.cmp(&b.record_id))
}

/// Best candidate found for one detected face.
#[derive(Debug, Clone, Serialize)]
pub struct FaceCandidate {
    pub index: usize,
    #[serde(rename = "box")]
    pub bbox: [i32; 4],
    pub best_match: Option<Match>,
}

impl FaceCandidate {
    /// Best-match distance, or +∞ when the registry returned nothing.
    pub fn best_distance(&self) -> f32 {
        self.best_match.as_ref().map_or(f32::INFINITY, |m| m.distance)
    }
}

/// Result of running every detected face against the registry.
#[derive(Debug, Clone)]
pub struct WinnerSelection {
    pub winner_index: usize,
    /// Ranked registry hits for the winning face.
    pub matches: Vec<Match>,
    pub faces: Vec<FaceCandidate>,
}

impl WinnerSelection {
    pub fn winner(&self) -> &FaceCandidate {
        &self.faces[self.winner_index]
    }

    pub fn winner_match(&self) -> Option<&Match> {
        self.winner().best_match.as_ref()
    }

    pub fn boxes(&self) -> Vec<[i32; 4]> {
        self.faces.iter().map(|f| f.bbox).collect()
    }
}

/// Pick the detection whose best registry candidate is globally closest.
///
/// `search` is called once per detection with that face's embedding. The
/// returned hits are re-ranked here, so the collaborator's ordering is not
/// trusted. Ties between faces go to the lower detection index. Returns
/// `Ok(None)` only for an empty detection list.
pub fn select_winner<E, F>(detections: &[Detection], mut search: F) -> Result<Option<WinnerSelection>, E>
where
    F: FnMut(&[f32]) -> Result<Vec<Match>, E>,
{
    let mut faces = Vec::with_capacity(detections.len());
    let mut ranked_hits = Vec::with_capacity(detections.len());

    for (index, detection) in detections.iter().enumerate() {
        let mut hits = search(&detection.embedding.values)?;
        hits.sort_by(rank);
        faces.push(FaceCandidate {
            index,
            bbox: detection.bbox.corners(),
            best_match: hits.first().cloned(),
        });
        ranked_hits.push(hits);
    }

    let mut winner: Option<usize> = None;
    for face in &faces {
        let better = match winner {
            None => true,
            Some(w) => face.best_distance() < faces[w].best_distance(),
        };
        if better {
            winner = Some(face.index);
        }
    }

    Ok(winner.map(|winner_index| WinnerSelection {
        winner_index,
        matches: std::mem::take(&mut ranked_hits[winner_index]),
        faces,
    }))
}

/// Closest pair of faces across two images.
///
/// Returns `(index_in_a, index_in_b, comparison)`, or `None` if either side
/// is empty.
pub fn closest_pair(
    a: &[Detection],
    b: &[Detection],
    threshold: f32,
) -> Result<Option<(usize, usize, Comparison)>, MatchError> {
    let mut best: Option<(usize, usize, Comparison)> = None;
    for (i, da) in a.iter().enumerate() {
        for (j, db) in b.iter().enumerate() {
            let cmp = compare(&da.embedding, &db.embedding, threshold)?;
            if best.map_or(true, |(_, _, prev)| cmp.distance < prev.distance) {
                best = Some((i, j, cmp));
            }
        }
    }
    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;
    use std::convert::Infallible;

    fn detection(x: f32, values: Vec<f32>) -> Detection {
        Detection {
            bbox: BoundingBox {
                x, y: 0.0, width: 10.0, height: 10.0, confidence: 0.9, landmarks: None,
            },
            embedding: Embedding::new(values),
        }
    }

    fn hit(record_id: u64, identity_id: i64, distance: f32) -> Match {
        Match { record_id, identity_id, distance }
    }

    #[test]
    fn test_distance_zero_for_identical() {
        assert_eq!(distance(&[0.3, 0.4], &[0.3, 0.4]), 0.0);
    }

    #[test]
    fn test_same_identity_is_strict() {
        assert!(same_identity(0.69, 0.7));
        assert!(!same_identity(0.7, 0.7));
    }

    #[test]
    fn test_compare_close_vectors_same_person() {
        let a = Embedding::new(vec![0.5, 0.5, 0.5]);
        let b = Embedding::new(vec![0.55, 0.5, 0.45]);
        let cmp = compare(&a, &b, DEFAULT_SAME_IDENTITY_THRESHOLD).unwrap();
        assert!(cmp.distance < 0.1);
        assert!(cmp.same_person);
    }

    #[test]
    fn test_compare_rejects_dimension_mismatch() {
        let a = Embedding::new(vec![0.0; 3]);
        let b = Embedding::new(vec![0.0; 4]);
        assert_eq!(
            compare(&a, &b, 0.7),
            Err(MatchError::DimensionMismatch { left: 3, right: 4 })
        );
    }

    #[test]
    fn test_rank_ties_by_record_id() {
        let mut hits = vec![hit(9, 1, 0.2), hit(3, 2, 0.2), hit(5, 3, 0.1)];
        hits.sort_by(rank);
        let ids: Vec<u64> = hits.iter().map(|h| h.record_id).collect();
        assert_eq!(ids, vec![5, 3, 9]);
    }

    #[test]
    fn test_select_winner_picks_globally_closest_face() {
        // Face 2 is closest even though detection 0 comes first.
        let detections = vec![
            detection(0.0, vec![0.0]),
            detection(20.0, vec![1.0]),
            detection(40.0, vec![2.0]),
        ];
        let distances = [0.9f32, 0.5, 0.1];
        let selection = select_winner(&detections, |emb| {
            let i = emb[0] as usize;
            Ok::<_, Infallible>(vec![hit(100 + i as u64, i as i64, distances[i])])
        })
        .unwrap()
        .unwrap();

        assert_eq!(selection.winner_index, 2);
        assert_eq!(selection.winner_match().map(|m| m.identity_id), Some(2));
        assert_eq!(selection.winner().bbox, [40, 0, 50, 10]);
        assert_eq!(selection.faces.len(), 3);
    }

    #[test]
    fn test_select_winner_reranks_unsorted_hits() {
        let detections = vec![detection(0.0, vec![0.0])];
        let selection = select_winner(&detections, |_| {
            Ok::<_, Infallible>(vec![hit(1, 1, 0.8), hit(2, 2, 0.3), hit(3, 3, 0.5)])
        })
        .unwrap()
        .unwrap();

        let ids: Vec<u64> = selection.matches.iter().map(|m| m.record_id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
        assert_eq!(selection.winner_match().map(|m| m.record_id), Some(2));
    }

    #[test]
    fn test_select_winner_with_empty_registry_reports_first_face() {
        let detections = vec![detection(0.0, vec![0.0]), detection(20.0, vec![1.0])];
        let selection = select_winner(&detections, |_| Ok::<_, Infallible>(Vec::new()))
            .unwrap()
            .unwrap();

        assert_eq!(selection.winner_index, 0);
        assert!(selection.winner_match().is_none());
        assert_eq!(selection.winner().best_distance(), f32::INFINITY);
    }

    #[test]
    fn test_select_winner_face_without_candidates_loses() {
        let detections = vec![detection(0.0, vec![0.0]), detection(20.0, vec![1.0])];
        let selection = select_winner(&detections, |emb| {
            if emb[0] == 0.0 {
                Ok::<_, Infallible>(Vec::new())
            } else {
                Ok(vec![hit(7, 42, 3.5)])
            }
        })
        .unwrap()
        .unwrap();

        // A large distance still beats "no candidate".
        assert_eq!(selection.winner_index, 1);
    }

    #[test]
    fn test_select_winner_empty_detections() {
        let selection = select_winner(&[], |_| Ok::<_, Infallible>(Vec::new())).unwrap();
        assert!(selection.is_none());
    }

    #[test]
    fn test_select_winner_propagates_search_error() {
        let detections = vec![detection(0.0, vec![0.0])];
        let result = select_winner(&detections, |_| Err::<Vec<Match>, _>("registry down"));
        assert_eq!(result.err(), Some("registry down"));
    }

    #[test]
    fn test_closest_pair_across_all_faces() {
        let a = vec![detection(0.0, vec![5.0, 5.0]), detection(20.0, vec![1.0, 0.0])];
        let b = vec![detection(0.0, vec![9.0, 9.0]), detection(20.0, vec![1.0, 0.05])];
        let (i, j, cmp) = closest_pair(&a, &b, 0.7).unwrap().unwrap();
        assert_eq!((i, j), (1, 1));
        assert!(cmp.same_person);
    }

    #[test]
    fn test_closest_pair_empty_side() {
        let a = vec![detection(0.0, vec![1.0])];
        assert!(closest_pair(&a, &[], 0.7).unwrap().is_none());
    }
}
