//! Concordant pair index construction.
//!
//! Every unordered sample pair `(i, j)` with `i < j` whose responses differ by
//! more than `delta` becomes one training comparison. Pairs are emitted in
//! lexicographic `(i, j)` order, so the same responses always give the same
//! sequence.

use cinet_core::Pair;

/// Build the ordered list of concordant pairs for `responses`.
///
/// When the pair count leaves a remainder of exactly one against
/// `batch_size`, the last pair is duplicated so no mini-batch of size 1 is
/// ever produced (batch normalisation needs at least two rows).
///
/// Fewer than two responses give an empty list.
pub fn build_concordant_pairs(responses: &[f32], delta: f32, batch_size: usize) -> Vec<Pair> {
    let n = responses.len();
    if n < 2 {
        return Vec::new();
    }

    let mut pairs = Vec::with_capacity(n * (n - 1) / 2);
    for i in 0..n - 1 {
        for j in i + 1..n {
            if (responses[i] - responses[j]).abs() > delta {
                pairs.push(Pair::from_responses(i, j, responses));
            }
        }
    }

    pad_single_row_batch(&mut pairs, batch_size);
    pairs
}

/// Duplicate the final pair when `len % batch_size == 1`.
fn pad_single_row_batch(pairs: &mut Vec<Pair>, batch_size: usize) {
    if batch_size > 1 && pairs.len() % batch_size == 1 {
        if let Some(&last) = pairs.last() {
            tracing::debug!(
                pairs = pairs.len(),
                batch_size,
                "Duplicating last pair to avoid a single-row batch"
            );
            pairs.push(last);
        }
    }
}
