use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::fingerprint::fingerprint_seed;
use crate::readers::Row;

const HEAD_ROWS: usize = 50;

/// How many rows the analyzer wants to look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleSize {
    /// Pick a size from the row count (the usual path).
    Auto,
    /// A caller-requested size, still deterministic.
    Exact(usize),
}

/// Return the indices of a deterministic sample of `total` rows.
///
/// Small files are taken whole. Larger files keep the first fifty rows (the
/// head is where headers-gone-wrong and format quirks show up) and spread the
/// rest across the file: uniformly random for mid-size files, evenly spaced
/// strata beyond that. The random picks are seeded by the file fingerprint so
/// the same file always yields the same sample.
pub fn sample_indices(total: usize, size: SampleSize, fingerprint: &str) -> Vec<usize> {
    let target = match size {
        SampleSize::Exact(n) => n.min(total),
        SampleSize::Auto => match total {
            0..=100 => total,
            101..=1000 => 100,
            1001..=10_000 => 200,
            _ => 500,
        },
    };

    if target >= total {
        return (0..total).collect();
    }

    let head = HEAD_ROWS.min(target);
    let rest = target - head;
    let mut indices: Vec<usize> = (0..head).collect();

    if rest == 0 {
        return indices;
    }

    let tail_start = head;
    let tail_len = total - tail_start;

    if matches!(size, SampleSize::Auto) && total <= 1000 {
        // uniformly random over the remainder, seeded by the fingerprint
        let mut rng = StdRng::seed_from_u64(fingerprint_seed(fingerprint));
        let mut picked = rand::seq::index::sample(&mut rng, tail_len, rest.min(tail_len)).into_vec();
        picked.sort_unstable();
        indices.extend(picked.into_iter().map(|i| tail_start + i));
    }
    else {
        // evenly spaced strata across the remainder
        for slot in 0..rest {
            let offset = (slot * tail_len) / rest + tail_len / (rest * 2);
            indices.push(tail_start + offset.min(tail_len - 1));
        }
        indices.dedup();
    }

    indices
}

pub fn sample_rows<'a>(rows: &'a [Row], size: SampleSize, fingerprint: &str) -> Vec<&'a Row> {
    sample_indices(rows.len(), size, fingerprint)
        .into_iter()
        .map(|i| &rows[i])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FP: &str = "0d7c21f5f2f1a9efc4b5cf2f8cbb9e1d";

    #[test]
    fn small_files_are_taken_whole() {
        assert_eq!(sample_indices(0, SampleSize::Auto, FP).len(), 0);
        assert_eq!(sample_indices(73, SampleSize::Auto, FP).len(), 73);
        assert_eq!(sample_indices(100, SampleSize::Auto, FP).len(), 100);
    }

    #[test]
    fn boundary_formula() {
        assert_eq!(sample_indices(101, SampleSize::Auto, FP).len(), 100);
        assert_eq!(sample_indices(1000, SampleSize::Auto, FP).len(), 100);
        assert_eq!(sample_indices(1001, SampleSize::Auto, FP).len(), 200);
        assert_eq!(sample_indices(10_000, SampleSize::Auto, FP).len(), 200);
        assert_eq!(sample_indices(10_001, SampleSize::Auto, FP).len(), 500);
    }

    #[test]
    fn sample_is_deterministic_per_fingerprint() {
        let a = sample_indices(1000, SampleSize::Auto, FP);
        let b = sample_indices(1000, SampleSize::Auto, FP);
        assert_eq!(a, b);

        let c = sample_indices(1000, SampleSize::Auto, "another-fingerprint");
        assert_ne!(a, c);
    }

    #[test]
    fn head_rows_always_included() {
        let indices = sample_indices(50_000, SampleSize::Auto, FP);
        assert_eq!(&indices[..50], &(0..50).collect::<Vec<_>>()[..]);
        assert_eq!(indices.len(), 500);
        assert!(indices.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn exact_size_is_honored() {
        assert_eq!(sample_indices(10_000, SampleSize::Exact(75), FP).len(), 75);
        assert_eq!(sample_indices(10, SampleSize::Exact(75), FP).len(), 10);
    }
}
