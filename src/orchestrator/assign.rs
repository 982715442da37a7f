//! Track assignment: distribute N engines across tracks proportionally to
//! configured `engine_slots`, with largest-remainder rounding.
//!
//! Rules: when N >= the number of tracks every track gets at least one
//! engine; when N is smaller the tracks with the largest slot counts win.
//! If the floor overshoots N, the excess comes off the largest shares
//! first.

#[derive(Debug, Clone)]
pub struct TrackShare {
    pub name: String,
    pub slots: u32,
}

pub fn assign_tracks(tracks: &[TrackShare], engines: usize) -> Vec<(String, usize)> {
    if tracks.is_empty() || engines == 0 {
        return tracks.iter().map(|t| (t.name.clone(), 0)).collect();
    }

    // Fewer engines than tracks: one engine each for the largest tracks.
    if engines < tracks.len() {
        let mut order: Vec<usize> = (0..tracks.len()).collect();
        order.sort_by(|&a, &b| {
            tracks[b]
                .slots
                .cmp(&tracks[a].slots)
                .then_with(|| tracks[a].name.cmp(&tracks[b].name))
        });
        let chosen: std::collections::HashSet<usize> =
            order.into_iter().take(engines).collect();
        return tracks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), usize::from(chosen.contains(&i))))
            .collect();
    }

    // Largest-remainder apportionment over slot weights. A track with no
    // slots still weighs one so the floor can hold.
    let weights: Vec<u64> = tracks.iter().map(|t| u64::from(t.slots.max(1))).collect();
    let total: u64 = weights.iter().sum();
    let n = engines as u64;

    let mut counts: Vec<usize> = weights.iter().map(|w| ((n * w) / total) as usize).collect();
    let mut leftover = engines - counts.iter().sum::<usize>();

    let mut by_remainder: Vec<usize> = (0..tracks.len()).collect();
    by_remainder.sort_by(|&a, &b| {
        let rem_a = (n * weights[a]) % total;
        let rem_b = (n * weights[b]) % total;
        rem_b
            .cmp(&rem_a)
            .then_with(|| weights[b].cmp(&weights[a]))
            .then_with(|| tracks[a].name.cmp(&tracks[b].name))
    });
    for &i in by_remainder.iter().cycle() {
        if leftover == 0 {
            break;
        }
        counts[i] += 1;
        leftover -= 1;
    }

    // Floor: every track runs at least one engine, funded by the largest
    // allocations.
    loop {
        let Some(zero) = counts.iter().position(|&c| c == 0) else {
            break;
        };
        let donor = (0..counts.len())
            .filter(|&i| counts[i] > 1)
            .max_by(|&a, &b| {
                counts[a]
                    .cmp(&counts[b])
                    .then_with(|| weights[a].cmp(&weights[b]))
                    .then_with(|| tracks[b].name.cmp(&tracks[a].name))
            });
        match donor {
            Some(donor) => {
                counts[donor] -= 1;
                counts[zero] += 1;
            }
            None => break,
        }
    }

    tracks
        .iter()
        .zip(counts)
        .map(|(t, c)| (t.name.clone(), c))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn shares(spec: &[(&str, u32)]) -> Vec<TrackShare> {
        spec.iter()
            .map(|(name, slots)| TrackShare {
                name: name.to_string(),
                slots: *slots,
            })
            .collect()
    }

    fn count(assignment: &[(String, usize)], name: &str) -> usize {
        assignment.iter().find(|(n, _)| n == name).unwrap().1
    }

    #[test]
    fn proportional_split_exact() {
        let assignment = assign_tracks(&shares(&[("backend", 2), ("frontend", 1)]), 6);
        assert_eq!(count(&assignment, "backend"), 4);
        assert_eq!(count(&assignment, "frontend"), 2);
    }

    #[test]
    fn largest_remainder_breaks_uneven_splits() {
        // Weights 3:1, 3 engines -> exact shares 2.25 / 0.75.
        let assignment = assign_tracks(&shares(&[("backend", 3), ("frontend", 1)]), 3);
        assert_eq!(count(&assignment, "backend"), 2);
        assert_eq!(count(&assignment, "frontend"), 1);
    }

    #[test]
    fn floor_guarantees_one_engine_per_track() {
        let assignment =
            assign_tracks(&shares(&[("big", 10), ("tiny", 1), ("small", 1)]), 3);
        assert_eq!(count(&assignment, "big"), 1);
        assert_eq!(count(&assignment, "tiny"), 1);
        assert_eq!(count(&assignment, "small"), 1);
    }

    #[test]
    fn floor_excess_comes_off_the_largest_share() {
        let assignment = assign_tracks(&shares(&[("big", 8), ("mid", 3), ("tiny", 1)]), 4);
        let total: usize = assignment.iter().map(|(_, c)| c).sum();
        assert_eq!(total, 4);
        assert!(count(&assignment, "tiny") >= 1);
        assert!(count(&assignment, "big") >= count(&assignment, "mid"));
    }

    #[test]
    fn fewer_engines_than_tracks_prefers_large_slots() {
        let assignment =
            assign_tracks(&shares(&[("big", 5), ("mid", 3), ("tiny", 1)]), 2);
        assert_eq!(count(&assignment, "big"), 1);
        assert_eq!(count(&assignment, "mid"), 1);
        assert_eq!(count(&assignment, "tiny"), 0);
    }

    #[test]
    fn zero_engines_means_zero_everywhere() {
        let assignment = assign_tracks(&shares(&[("a", 1), ("b", 1)]), 0);
        assert!(assignment.iter().all(|(_, c)| *c == 0));
    }

    #[test]
    fn single_track_takes_everything() {
        let assignment = assign_tracks(&shares(&[("only", 2)]), 5);
        assert_eq!(count(&assignment, "only"), 5);
    }

    proptest! {
        #[test]
        fn totals_always_match(
            slots in prop::collection::vec(0u32..20, 1..8),
            engines in 0usize..40,
        ) {
            let tracks: Vec<TrackShare> = slots
                .iter()
                .enumerate()
                .map(|(i, s)| TrackShare { name: format!("t{i}"), slots: *s })
                .collect();
            let assignment = assign_tracks(&tracks, engines);
            let total: usize = assignment.iter().map(|(_, c)| c).sum();
            prop_assert_eq!(total, engines);
        }

        #[test]
        fn floor_holds_when_engines_cover_tracks(
            slots in prop::collection::vec(0u32..20, 1..8),
            extra in 0usize..20,
        ) {
            let tracks: Vec<TrackShare> = slots
                .iter()
                .enumerate()
                .map(|(i, s)| TrackShare { name: format!("t{i}"), slots: *s })
                .collect();
            let engines = tracks.len() + extra;
            let assignment = assign_tracks(&tracks, engines);
            prop_assert!(assignment.iter().all(|(_, c)| *c >= 1));
        }
    }
}
