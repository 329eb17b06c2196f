//! Mapping string-space hits back into the taxonomy.
//!
//! The same stored string can be the canonical name of one taxon and a
//! junior synonym on several others, so each key carries a small vector of
//! (taxon, optional synonym) back-references. Context restriction is a
//! traversal-interval filter against the query context's root taxon; one
//! shared index serves every context.

use smallvec::SmallVec;

use super::search::sort_matches;
use super::{max_distance_for, CompressedTrie, FuzzyMatch};
use crate::strutils;
use crate::taxonomy::{TaxonIx, Taxonomy};

#[derive(Clone, Copy, Debug)]
struct NameRef {
    taxon: TaxonIx,
    synonym: Option<usize>,
}

/// A string-space hit resolved to a taxon (and possibly the synonym that
/// carried the matching name).
#[derive(Clone, Debug)]
pub struct MatchWithTaxon {
    pub taxon: TaxonIx,
    pub synonym: Option<usize>,
    /// The name as the taxonomy stores it, original casing.
    pub matched_name: String,
    pub distance: u32,
    pub score: f32,
}

impl MatchWithTaxon {
    pub fn is_synonym(&self) -> bool {
        self.synonym.is_some()
    }
}

/// The fuzzy/prefix/exact name index over a taxonomy snapshot.
pub struct NameIndex {
    trie: CompressedTrie,
    refs: Vec<SmallVec<[NameRef; 1]>>,
    generation: u64,
}

impl NameIndex {
    /// Index every canonical name and synonym in the taxonomy.
    pub fn build(tax: &Taxonomy) -> NameIndex {
        Self::build_restricted(tax, None)
    }

    /// Index only taxa whose trav_enter falls inside `range` (a context's
    /// traversal interval); `None` indexes everything.
    pub fn build_restricted(tax: &Taxonomy, range: Option<(u32, u32)>) -> NameIndex {
        let in_range = |enter: u32| match range {
            Some((lo, hi)) => lo <= enter && enter <= hi,
            None => true,
        };
        let mut trie = CompressedTrie::new();
        let mut refs: Vec<SmallVec<[NameRef; 1]>> = Vec::new();
        fn add(
            trie: &mut CompressedTrie,
            refs: &mut Vec<SmallVec<[NameRef; 1]>>,
            name: &str,
            nref: NameRef,
        ) {
            let key = trie.insert(&strutils::fold_case(name));
            if key as usize == refs.len() {
                refs.push(SmallVec::new());
            }
            refs[key as usize].push(nref);
        }
        for ix in 0..tax.len() {
            if !in_range(tax.taxon(ix).trav_enter) {
                continue;
            }
            add(
                &mut trie,
                &mut refs,
                &tax.taxon(ix).name,
                NameRef { taxon: ix, synonym: None },
            );
            for (s, syn) in tax.taxon(ix).synonyms.iter().map(|&s| (s, tax.synonym(s))) {
                add(
                    &mut trie,
                    &mut refs,
                    &syn.name,
                    NameRef { taxon: ix, synonym: Some(s) },
                );
            }
        }
        NameIndex {
            trie,
            refs,
            generation: tax.generation(),
        }
    }

    /// The taxonomy generation this index was built against; a mismatch
    /// means the index is stale and must be rebuilt.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn exact_query(&self, query: &str) -> Vec<FuzzyMatch> {
        self.trie.exact_matches(query)
    }

    pub fn prefix_query(&self, query: &str) -> Vec<FuzzyMatch> {
        self.trie.prefix_matches(query)
    }

    /// Fuzzy query with the length-scaled distance budget.
    pub fn fuzzy_query(&self, query: &str) -> Vec<FuzzyMatch> {
        let budget = max_distance_for(query.chars().count());
        self.trie.fuzzy_matches(query, budget)
    }

    /// Resolve string hits to taxa, keeping only taxa inside the context
    /// root's subtree and (unless asked) not suppressed from TNRS. Result
    /// order follows the input hit order.
    pub fn to_taxa(
        &self,
        matches: &[FuzzyMatch],
        tax: &Taxonomy,
        context_root: TaxonIx,
        include_suppressed: bool,
    ) -> Vec<MatchWithTaxon> {
        let mut out = Vec::new();
        for m in matches {
            for nref in &self.refs[m.key as usize] {
                if !tax.is_ancestor_of(context_root, nref.taxon) {
                    continue;
                }
                if !include_suppressed && tax.is_suppressed_from_tnrs(nref.taxon) {
                    continue;
                }
                let matched_name = match nref.synonym {
                    Some(s) => tax.synonym(s).name.clone(),
                    None => tax.taxon(nref.taxon).name.clone(),
                };
                out.push(MatchWithTaxon {
                    taxon: nref.taxon,
                    synonym: nref.synonym,
                    matched_name,
                    distance: m.distance,
                    score: m.score,
                });
            }
        }
        out
    }

    /// Convenience for the common fuzzy-then-resolve pipeline.
    pub fn fuzzy_query_to_taxa(
        &self,
        query: &str,
        tax: &Taxonomy,
        context_root: TaxonIx,
        include_suppressed: bool,
    ) -> Vec<MatchWithTaxon> {
        let mut matches = self.fuzzy_query(query);
        sort_matches(&mut matches);
        self.to_taxa(&matches, tax, context_root, include_suppressed)
    }
}
