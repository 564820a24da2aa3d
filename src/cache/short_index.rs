use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashSet;

/// Draws allowed per requested song before the sampler gives up.
pub const DEFAULT_DRAW_FACTOR: usize = 10;

/// Complete list of known song keys, replaced wholesale on refresh.
///
/// Only used for O(1) random draws; never updated incrementally.
#[derive(Debug, Default)]
pub struct ShortIndex {
    ids: RwLock<Vec<String>>,
}

impl ShortIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, ids: Vec<String>) {
        *self.ids.write() = ids;
    }

    pub fn len(&self) -> usize {
        self.ids.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.read().is_empty()
    }

    /// Draws up to `n` distinct keys.
    ///
    /// At most `n * draw_factor` draws are made. When the budget runs out the
    /// keys collected so far are returned, so the result can be shorter than
    /// `n` (always so when the index holds fewer than `n` keys). This is a
    /// best-effort sample, not an error.
    pub fn sample<R: Rng + ?Sized>(&self, n: usize, draw_factor: usize, rng: &mut R) -> Vec<String> {
        let ids = self.ids.read();
        if ids.is_empty() || n == 0 {
            return Vec::new();
        }

        let budget = n.saturating_mul(draw_factor.max(1));
        let mut seen = HashSet::with_capacity(n);
        let mut picked = Vec::with_capacity(n);

        for _ in 0..budget {
            if picked.len() == n {
                break;
            }
            let id = &ids[rng.gen_range(0..ids.len())];
            if seen.insert(id.as_str()) {
                picked.push(id.clone());
            }
        }

        picked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn index(size: usize) -> ShortIndex {
        let index = ShortIndex::new();
        index.replace((0..size).map(|i| format!("youtube_{i}")).collect());
        index
    }

    fn distinct(ids: &[String]) -> usize {
        ids.iter().collect::<HashSet<_>>().len()
    }

    #[test]
    fn large_index_yields_n_distinct_keys() {
        let index = index(1000);
        let mut rng = StdRng::seed_from_u64(1);

        let ids = index.sample(5, DEFAULT_DRAW_FACTOR, &mut rng);

        assert_eq!(ids.len(), 5);
        assert_eq!(distinct(&ids), 5);
    }

    #[test]
    fn small_index_terminates_with_at_most_m_keys() {
        let index = index(3);
        let mut rng = StdRng::seed_from_u64(2);

        let ids = index.sample(10, DEFAULT_DRAW_FACTOR, &mut rng);

        assert!(ids.len() <= 3);
        assert_eq!(distinct(&ids), ids.len());
    }

    #[test]
    fn budget_of_one_draw_per_song_can_come_up_short() {
        let index = index(2);
        let mut rng = StdRng::seed_from_u64(3);

        for _ in 0..20 {
            let ids = index.sample(2, 1, &mut rng);
            assert!(!ids.is_empty() && ids.len() <= 2);
        }
    }

    #[test]
    fn empty_index_returns_nothing() {
        let index = ShortIndex::new();
        let mut rng = StdRng::seed_from_u64(4);
        assert!(index.sample(3, DEFAULT_DRAW_FACTOR, &mut rng).is_empty());
    }

    #[test]
    fn replace_swaps_the_whole_index() {
        let index = index(5);
        index.replace(vec!["youtube_x".into()]);
        let mut rng = StdRng::seed_from_u64(5);
        assert_eq!(index.sample(3, DEFAULT_DRAW_FACTOR, &mut rng), vec!["youtube_x"]);
    }
}
