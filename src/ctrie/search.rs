//! Bounded-edit-distance search over the trie.
//!
//! The walk keeps a frontier of partial matches. Each element either
//! consumed a trie char against a query char (match or substitution),
//! consumed a query char without moving in the trie (a "downshift", i.e. a
//! gap in the trie), or consumed a trie char without moving in the query
//! (a "rightshift", a gap in the query). A rightshift may not be followed
//! directly by a downshift, nor a downshift by a rightshift; without that
//! rule the two gaps cancel into a cheaper substitution and the frontier
//! re-visits the same alignment forever. A visited map keyed by trie
//! position and query position prunes dominated re-expansions, which keeps
//! the walk linear in practice when the same node is reached along
//! several gap paths.

use std::collections::HashMap;

use super::CompressedTrie;
use crate::strutils;

/// One scored hit out of the string space.
#[derive(Clone, Debug)]
pub struct FuzzyMatch {
    pub(crate) key: u32,
    /// The stored (folded) string that matched.
    pub matched: String,
    pub distance: u32,
    /// `1 - distance / max(|query|, |match|)`, in [0, 1].
    pub score: f32,
}

impl FuzzyMatch {
    fn new(trie: &CompressedTrie, key: u32, distance: u32, query_len: usize) -> FuzzyMatch {
        let matched = trie.key(key).to_string();
        let longer = query_len.max(matched.chars().count()) as f32;
        let score = if longer == 0.0 {
            1.0
        } else {
            1.0 - distance as f32 / longer
        };
        FuzzyMatch {
            key,
            matched,
            distance,
            score,
        }
    }
}

/// Order matches best-first: descending score, ties broken by the matched
/// string so results are stable.
pub(crate) fn sort_matches(matches: &mut Vec<FuzzyMatch>) {
    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.matched.cmp(&b.matched))
    });
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum Mode {
    Match,
    Down,
    Right,
}

#[derive(Clone, Copy)]
struct PartialMatch {
    node: usize,
    /// Offset into `node`'s edge label: the next trie char to consume.
    offset: usize,
    qpos: usize,
    distance: u32,
    mode: Mode,
}

impl CompressedTrie {
    pub fn exact_matches(&self, query: &str) -> Vec<FuzzyMatch> {
        let folded = strutils::fold_case(query);
        let qlen = folded.chars().count();
        match self.lookup(&folded) {
            Some(k) => vec![FuzzyMatch::new(self, k, 0, qlen)],
            None => Vec::new(),
        }
    }

    pub fn prefix_matches(&self, query: &str) -> Vec<FuzzyMatch> {
        let folded = strutils::fold_case(query);
        let qlen = folded.chars().count();
        let mut out: Vec<_> = self
            .keys_with_prefix(&folded)
            .into_iter()
            .map(|k| FuzzyMatch::new(self, k, 0, qlen))
            .collect();
        sort_matches(&mut out);
        out
    }

    /// All stored keys within `max_dist` edits of the query (insertion,
    /// deletion, substitution at unit cost). Exact hits come back with
    /// distance 0 even when a larger budget was requested.
    pub fn fuzzy_matches(&self, query: &str, max_dist: u32) -> Vec<FuzzyMatch> {
        let folded = strutils::fold_case(query);
        let q = strutils::to_code_points(&folded);
        // best distance per stored key reached so far
        let mut found: HashMap<u32, u32> = HashMap::new();
        // dominance pruning per (position, query position, mode)
        let mut visited: HashMap<(usize, usize, usize, Mode), u32> = HashMap::new();

        let mut frontier = vec![PartialMatch {
            node: 0,
            offset: 0,
            qpos: 0,
            distance: 0,
            mode: Mode::Match,
        }];
        while let Some(pm) = frontier.pop() {
            match visited.entry((pm.node, pm.offset, pm.qpos, pm.mode)) {
                std::collections::hash_map::Entry::Occupied(mut e) => {
                    if *e.get() <= pm.distance {
                        continue;
                    }
                    e.insert(pm.distance);
                }
                std::collections::hash_map::Entry::Vacant(e) => {
                    e.insert(pm.distance);
                }
            }

            let label_len = self.nodes[pm.node].label.len();
            if pm.offset == label_len {
                if let Some(key) = self.nodes[pm.node].key {
                    // a stored key ends here; any unconsumed query suffix
                    // costs one gap each, and a gap run may not start
                    // right after a rightshift
                    let remaining = (q.len() - pm.qpos) as u32;
                    let total = pm.distance + remaining;
                    if total <= max_dist && (remaining == 0 || pm.mode != Mode::Right) {
                        let best = found.entry(key).or_insert(u32::MAX);
                        if total < *best {
                            *best = total;
                        }
                    }
                }
            }

            // every way of consuming one trie char from this position
            let steps: Vec<(usize, usize, char)> = if pm.offset < label_len {
                vec![(pm.node, pm.offset + 1, self.nodes[pm.node].label[pm.offset])]
            } else {
                self.nodes[pm.node]
                    .children
                    .iter()
                    .map(|&c| (c, 1, self.nodes[c].label[0]))
                    .collect()
            };
            for (node, offset, trie_char) in steps {
                if pm.qpos < q.len() {
                    let cost = u32::from(trie_char != q[pm.qpos]);
                    if pm.distance + cost <= max_dist {
                        frontier.push(PartialMatch {
                            node,
                            offset,
                            qpos: pm.qpos + 1,
                            distance: pm.distance + cost,
                            mode: Mode::Match,
                        });
                    }
                }
                if pm.mode != Mode::Down && pm.distance + 1 <= max_dist {
                    frontier.push(PartialMatch {
                        node,
                        offset,
                        qpos: pm.qpos,
                        distance: pm.distance + 1,
                        mode: Mode::Right,
                    });
                }
            }
            // gap in the trie: consume a query char in place
            if pm.qpos < q.len() && pm.mode != Mode::Right && pm.distance + 1 <= max_dist {
                frontier.push(PartialMatch {
                    node: pm.node,
                    offset: pm.offset,
                    qpos: pm.qpos + 1,
                    distance: pm.distance + 1,
                    mode: Mode::Down,
                });
            }
        }

        let mut out: Vec<_> = found
            .into_iter()
            .map(|(key, dist)| FuzzyMatch::new(self, key, dist, q.len()))
            .collect();
        sort_matches(&mut out);
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn trie_of(keys: &[&str]) -> CompressedTrie {
        let mut t = CompressedTrie::new();
        for k in keys {
            t.insert(&strutils::fold_case(k));
        }
        t
    }

    #[test]
    fn test_fuzzy_single_substitution() {
        // "Astraceae" vs stored "Asteraceae": one deletion, score 0.9
        let t = trie_of(&["Asteraceae"]);
        let hits = t.fuzzy_matches("Astraceae", 2);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].matched, "asteraceae");
        assert_eq!(hits[0].distance, 1);
        assert!((hits[0].score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_exact_hit_wins_over_fuzzy() {
        let t = trie_of(&["Aster", "Astera"]);
        let hits = t.fuzzy_matches("aster", 2);
        assert_eq!(hits[0].matched, "aster");
        assert_eq!(hits[0].distance, 0);
        assert_eq!(hits[0].score, 1.0);
        assert_eq!(hits[1].distance, 1);
    }

    #[test]
    fn test_budget_is_respected() {
        let t = trie_of(&["Asteraceae"]);
        assert!(t.fuzzy_matches("Astraceae", 0).is_empty());
        assert_eq!(t.fuzzy_matches("Astraceae", 1).len(), 1);
    }

    #[test]
    fn test_ordering_on_ties() {
        let t = trie_of(&["abcd", "abce"]);
        let hits = t.fuzzy_matches("abcf", 1);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].matched, "abcd");
        assert_eq!(hits[1].matched, "abce");
    }

    #[test]
    fn test_finds_everything_within_budget() {
        // cross-check against a plain DP edit distance over a small key set
        fn edit(a: &str, b: &str) -> u32 {
            let a: Vec<char> = a.chars().collect();
            let b: Vec<char> = b.chars().collect();
            let mut prev: Vec<u32> = (0..=b.len() as u32).collect();
            for i in 1..=a.len() {
                let mut row = vec![i as u32];
                for j in 1..=b.len() {
                    let sub = prev[j - 1] + u32::from(a[i - 1] != b[j - 1]);
                    row.push(sub.min(prev[j] + 1).min(row[j - 1] + 1));
                }
                prev = row;
            }
            prev[b.len()]
        }

        let keys = [
            "homo sapiens",
            "homo erectus",
            "homo habilis",
            "pan troglodytes",
            "pango",
            "mus musculus",
        ];
        let t = trie_of(&keys);
        for query in ["homo sapens", "hono sapiens", "pan troglodyte", "mus", "pamgo"] {
            for max_d in 0..=3u32 {
                let hits = t.fuzzy_matches(query, max_d);
                for k in keys {
                    let d = edit(&strutils::fold_case(k), query);
                    let hit = hits.iter().find(|h| h.matched == strutils::fold_case(k));
                    if d <= max_d {
                        let hit = hit.unwrap_or_else(|| {
                            panic!("{} within {} of {} but not found", k, max_d, query)
                        });
                        assert_eq!(hit.distance, d, "{} vs {}", k, query);
                    }
                }
            }
        }
    }
}
