//! Candidate bookkeeping for caption decoding.
//!
//! Scoring is multiplicative: a child's score is `parent * -ln(p)`, and lower
//! is better. This is not a log-likelihood and does not length-normalize, so
//! it ranks sequences differently from textbook beam search.
//!
//! Only the primary hypothesis is expanded at each step, and it is expanded
//! as a fresh root with score [`ROOT_SCORE`]. The other survivors are kept for
//! inspection but never extended, which makes the search greedy with a
//! `width`-wide lookahead rather than a true multi-hypothesis beam.

use anyhow::{ensure, Result};
use ndarray::ArrayView1;

/// Score of the initial candidate and of every expanded parent.
pub const ROOT_SCORE: f32 = 1.0;

/// Probabilities are floored here before the logarithm so a zero never
/// yields an infinite score.
pub const PROBABILITY_FLOOR: f32 = f32::MIN_POSITIVE;

#[derive(Debug, Clone, PartialEq)]
pub struct BeamCandidate {
    pub sequence: Vec<usize>,
    pub score: f32,
}

impl BeamCandidate {
    pub fn last_token(&self) -> Option<usize> {
        self.sequence.last().copied()
    }
}

pub fn candidate_score(parent_score: f32, probability: f32) -> f32 {
    parent_score * -probability.max(PROBABILITY_FLOOR).ln()
}

#[derive(Debug, Clone)]
pub struct Beam {
    width: usize,
    candidates: Vec<BeamCandidate>,
    suppressed: Vec<usize>,
}

impl Beam {
    /// Beam holding only `[start]` with score [`ROOT_SCORE`].
    pub fn new(start: usize, width: usize) -> Self {
        Self {
            width: width.max(1),
            candidates: vec![BeamCandidate {
                sequence: vec![start],
                score: ROOT_SCORE,
            }],
            suppressed: Vec::new(),
        }
    }

    /// Token ids that are never proposed as continuations.
    pub fn with_suppressed(mut self, ids: impl IntoIterator<Item = usize>) -> Self {
        self.suppressed.extend(ids);
        self.suppressed.sort_unstable();
        self.suppressed.dedup();
        self
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn primary(&self) -> &BeamCandidate {
        &self.candidates[0]
    }

    pub fn candidates(&self) -> &[BeamCandidate] {
        &self.candidates
    }

    /// Expands the primary hypothesis with next-token `probs`, keeps the
    /// `width` lowest-scoring children and returns the token chosen for
    /// this step. Equal scores keep ascending id order.
    pub fn step(&mut self, probs: ArrayView1<'_, f32>) -> Result<usize> {
        let mut scored: Vec<(usize, f32)> = probs
            .iter()
            .enumerate()
            .filter(|(id, _)| self.suppressed.binary_search(id).is_err())
            .map(|(id, &p)| (id, candidate_score(ROOT_SCORE, p)))
            .collect();
        ensure!(
            !scored.is_empty(),
            "no eligible tokens among {} probabilities",
            probs.len()
        );

        // stable: ties stay in id order
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.truncate(self.width);

        let parent = &self.primary().sequence;
        let next: Vec<BeamCandidate> = scored
            .into_iter()
            .map(|(id, score)| {
                let mut sequence = Vec::with_capacity(parent.len() + 1);
                sequence.extend_from_slice(parent);
                sequence.push(id);
                BeamCandidate { sequence, score }
            })
            .collect();
        self.candidates = next;

        let chosen = self.primary().last_token().unwrap_or_default();
        Ok(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, Array1};

    #[test]
    fn starts_with_single_root_candidate() {
        let beam = Beam::new(7, 3);
        assert_eq!(beam.candidates().len(), 1);
        assert_eq!(beam.primary().sequence, vec![7]);
        assert_eq!(beam.primary().score, ROOT_SCORE);
    }

    #[test]
    fn never_keeps_more_than_width() {
        let probs = Array1::from_elem(50, 0.02_f32);
        for width in 1..6 {
            let mut beam = Beam::new(1, width);
            for _ in 0..4 {
                beam.step(probs.view()).expect("step");
                assert!(beam.candidates().len() <= width);
            }
        }
    }

    #[test]
    fn picks_most_probable_token() {
        let mut beam = Beam::new(0, 2);
        let chosen = beam.step(arr1(&[0.1, 0.2, 0.6, 0.1]).view()).expect("step");
        assert_eq!(chosen, 2);
        assert_eq!(beam.primary().sequence, vec![0, 2]);
        assert_abs_diff_eq!(beam.primary().score, -(0.6_f32.ln()), epsilon = 1e-6);
        assert_eq!(beam.candidates()[1].last_token(), Some(1));
    }

    #[test]
    fn ties_resolve_to_lowest_id() {
        let mut beam = Beam::new(1, 3).with_suppressed([0, 1]);
        let chosen = beam.step(Array1::from_elem(5, 0.2).view()).expect("step");
        assert_eq!(chosen, 2);
        let ids: Vec<usize> = beam
            .candidates()
            .iter()
            .filter_map(BeamCandidate::last_token)
            .collect();
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[test]
    fn zero_probability_gets_finite_score() {
        let score = candidate_score(ROOT_SCORE, 0.0);
        assert!(score.is_finite());
        assert!(score > candidate_score(ROOT_SCORE, 1e-30));
    }

    #[test]
    fn each_step_extends_the_previous_primary() {
        let mut beam = Beam::new(1, 2);
        beam.step(arr1(&[0.1, 0.1, 0.7, 0.1]).view()).expect("step");
        beam.step(arr1(&[0.1, 0.1, 0.1, 0.7]).view()).expect("step");
        assert_eq!(beam.primary().sequence, vec![1, 2, 3]);
        // restarts from the root score, so no accumulation across steps
        assert_abs_diff_eq!(beam.primary().score, -(0.7_f32.ln()), epsilon = 1e-6);
    }

    #[test]
    fn fully_suppressed_distribution_is_an_error() {
        let mut beam = Beam::new(0, 2).with_suppressed([0, 1]);
        assert!(beam.step(arr1(&[0.5, 0.5]).view()).is_err());
    }
}
