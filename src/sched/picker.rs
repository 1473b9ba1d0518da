//! Channel and entry selection: smooth weighted round-robin over the
//! active channels, then either a recency cursor or a seeded draw
//! inside the winner.

use std::collections::VecDeque;

/// xorshift64*. One 64-bit state word, seeded per channel from
/// `global_seed ^ channel_index ^ epoch`, so repeat playsets reshuffle
/// deterministically and the draw order is stable across runs.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Xorshift64(u64);

impl Xorshift64 {
    pub fn new(seed: u64) -> Self {
        // State must be nonzero or the stream is all zeros.
        Self(if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed })
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    pub fn next_below(&mut self, n: usize) -> usize {
        debug_assert!(n > 0);
        (self.next_u64() % n as u64) as usize
    }
}

/// One smooth-weighted-round-robin step. Every channel earns its weight
/// as credit, the highest credit wins (ties to the lowest index) and
/// pays back the total weight. Returns None when no channel carries
/// weight.
pub(crate) fn swrr_pick(credits: &mut [i64], weights: &[u32]) -> Option<usize> {
    debug_assert_eq!(credits.len(), weights.len());
    let total: i64 = weights.iter().map(|&w| i64::from(w)).sum();
    if total == 0 {
        return None;
    }
    let mut winner = None;
    let mut best = i64::MIN;
    for (i, (credit, &weight)) in credits.iter_mut().zip(weights).enumerate() {
        if weight == 0 {
            continue;
        }
        *credit += i64::from(weight);
        if *credit > best {
            best = *credit;
            winner = Some(i);
        }
    }
    let w = winner?;
    credits[w] -= total;
    Some(w)
}

/// Punish a winner that turned out to have nothing to play (race with
/// a removal): drop its credit to the lowest among weighted channels so
/// the next step prefers everyone else.
pub(crate) fn swrr_penalize(credits: &mut [i64], weights: &[u32], loser: usize) {
    let floor = credits
        .iter()
        .zip(weights)
        .filter(|(_, &w)| w > 0)
        .map(|(&c, _)| c)
        .min()
        .unwrap_or(0);
    credits[loser] = floor;
}

/// Recency mode: the entry at the cursor, then advance modulo length.
pub(crate) fn pick_recency(cursor: &mut usize, len: usize) -> Option<usize> {
    if len == 0 {
        return None;
    }
    let index = *cursor % len;
    *cursor = (index + 1) % len;
    Some(index)
}

/// Random mode: draw, rejecting anything in the recent window; after
/// the retry budget runs out any draw is accepted.
pub(crate) fn pick_random(
    rng: &mut Xorshift64,
    len: usize,
    recent: &VecDeque<usize>,
) -> Option<usize> {
    if len == 0 {
        return None;
    }
    let budget = 4 * len.max(4);
    let mut draw = rng.next_below(len);
    for _ in 0..budget {
        if !recent.contains(&draw) {
            break;
        }
        draw = rng.next_below(len);
    }
    Some(draw)
}

/// Push into a bounded ring, evicting the oldest.
pub(crate) fn remember(ring: &mut VecDeque<usize>, value: usize, cap: usize) {
    if cap == 0 {
        return;
    }
    while ring.len() >= cap {
        ring.pop_front();
    }
    ring.push_back(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_weights_pick_nothing() {
        let mut credits = [0i64; 3];
        assert_eq!(swrr_pick(&mut credits, &[0, 0, 0]), None);
    }

    #[test]
    fn equal_weights_alternate() {
        let mut credits = [0i64; 2];
        let weights = [1u32, 1];
        let picks: Vec<usize> =
            (0..6).map(|_| swrr_pick(&mut credits, &weights).unwrap()).collect();
        assert_eq!(picks, vec![0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn weighted_counts_match_ratios() {
        for (wa, wb) in [(1u32, 1u32), (1, 3), (0, 1)] {
            let weights = [wa, wb];
            let mut credits = [0i64; 2];
            let mut counts = [0usize; 2];
            for _ in 0..1000 {
                counts[swrr_pick(&mut credits, &weights).unwrap()] += 1;
            }
            let total = (wa + wb) as usize;
            let expect_a = 1000 * wa as usize / total;
            assert!(
                counts[0].abs_diff(expect_a) <= 2,
                "weights {weights:?}: counts {counts:?}"
            );
            if wa == 0 {
                assert_eq!(counts[0], 0);
            }
        }
    }

    #[test]
    fn interleaving_is_smooth() {
        // (1,3) must not bunch all of channel 1's turns together.
        let mut credits = [0i64; 2];
        let picks: Vec<usize> =
            (0..8).map(|_| swrr_pick(&mut credits, &[1, 3]).unwrap()).collect();
        assert_eq!(picks.iter().filter(|&&p| p == 0).count(), 2);
        // No run of four identical picks.
        assert!(!picks.windows(4).any(|w| w.iter().all(|&p| p == w[0])));
    }

    #[test]
    fn penalized_channel_loses_next_round() {
        let mut credits = [0i64; 2];
        let weights = [1u32, 1];
        let first = swrr_pick(&mut credits, &weights).unwrap();
        assert_eq!(first, 0);
        // Channel 1 turned out empty; next rounds go to channel 0.
        swrr_penalize(&mut credits, &weights, 1);
        assert_eq!(swrr_pick(&mut credits, &weights).unwrap(), 0);
    }

    #[test]
    fn recency_cursor_visits_all_before_repeat() {
        let mut cursor = 0usize;
        let picks: Vec<usize> = (0..6).map(|_| pick_recency(&mut cursor, 3).unwrap()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(pick_recency(&mut cursor, 0), None);
    }

    #[test]
    fn random_avoids_recent_window() {
        let mut rng = Xorshift64::new(42);
        let mut recent = VecDeque::new();
        for _ in 0..100 {
            let pick = pick_random(&mut rng, 20, &recent).unwrap();
            assert!(!recent.contains(&pick));
            remember(&mut recent, pick, 8);
        }
    }

    #[test]
    fn random_is_deterministic_for_a_seed() {
        let draw = |seed: u64| -> Vec<usize> {
            let mut rng = Xorshift64::new(seed);
            let empty = VecDeque::new();
            (0..16).map(|_| pick_random(&mut rng, 20, &empty).unwrap()).collect()
        };
        assert_eq!(draw(7), draw(7));
        assert_ne!(draw(7), draw(8));
    }

    #[test]
    fn saturated_window_still_yields() {
        // Window covers the whole entry set; the budget must not spin
        // forever and any draw is acceptable.
        let mut rng = Xorshift64::new(1);
        let mut recent = VecDeque::new();
        for i in 0..3 {
            remember(&mut recent, i, 8);
        }
        assert!(pick_random(&mut rng, 3, &recent).is_some());
    }
}
