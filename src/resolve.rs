//! Resolving node-id strings against a summary tree.
//!
//! Two id families are recognized: `ott<digits>` and
//! `mrcaott<digits>ott<digits>`. The full ladder for an `ott` name is
//!
//! ```text
//! ott<X> -> too large | never valid | forwarded/current ->
//!           pruned from synth | broken (MRCA stand-in) | found
//! ```
//!
//! and an `mrca` name first tries the canonical synthesized node names,
//! then resolves each side and takes the traversal-interval MRCA.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::synth::{SummaryTree, SynthNodeIx};
use crate::taxonomy::{OttId, Taxonomy};
use crate::{Error, Result};

static OTT_ID_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^ott(\d+)$").unwrap());
static MRCA_ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^mrca(ott\d+)(ott\d+)$").unwrap());

/// Parse an `ott<digits>` string; `None` when the shape is wrong or the
/// digits overflow the id width.
pub fn parse_ott_id(node_id: &str) -> Option<OttId> {
    let caps = OTT_ID_PATTERN.captures(node_id)?;
    caps[1].parse().ok()
}

/// Where a valid taxon landed in the summary tree.
#[derive(Clone, Copy, Debug)]
pub enum TaxonToSynth {
    /// Valid taxon, but pruned from this summary tree.
    Pruned,
    /// Broken taxon; the MRCA stand-in node.
    Broken { mrca: SynthNodeIx },
    Found { node: SynthNodeIx },
}

#[derive(Clone, Copy, Debug)]
pub struct ValidId {
    pub id: OttId,
    pub forwarded_from: Option<OttId>,
    pub to_synth: TaxonToSynth,
}

#[derive(Clone, Copy, Debug)]
pub enum OttIdLookup {
    /// The digits overflow the id width.
    BadId,
    /// Never minted: unknown to the taxonomy and to the forward table.
    InvalidId { id: OttId },
    Valid(ValidId),
}

impl OttIdLookup {
    pub fn node(&self) -> Option<SynthNodeIx> {
        match self {
            OttIdLookup::Valid(v) => match v.to_synth {
                TaxonToSynth::Found { node } => Some(node),
                TaxonToSynth::Broken { mrca } => Some(mrca),
                TaxonToSynth::Pruned => None,
            },
            _ => None,
        }
    }

    pub fn broken(&self) -> bool {
        matches!(
            self,
            OttIdLookup::Valid(ValidId {
                to_synth: TaxonToSynth::Broken { .. },
                ..
            })
        )
    }

    pub fn pruned(&self) -> bool {
        matches!(
            self,
            OttIdLookup::Valid(ValidId {
                to_synth: TaxonToSynth::Pruned,
                ..
            })
        )
    }

    pub fn invalid(&self) -> bool {
        matches!(self, OttIdLookup::InvalidId { .. })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct MrcaLookup {
    pub first: OttIdLookup,
    pub second: OttIdLookup,
    pub mrca: Option<SynthNodeIx>,
}

#[derive(Clone, Copy, Debug)]
pub enum NodeLookup {
    /// The string matches neither recognized shape.
    NoMatch,
    Ott(OttIdLookup),
    Mrca(MrcaLookup),
}

impl NodeLookup {
    /// The node this lookup maps to, counting a broken taxon's MRCA
    /// stand-in as a successful mapping.
    pub fn node(&self) -> Option<SynthNodeIx> {
        match self {
            NodeLookup::NoMatch => None,
            NodeLookup::Ott(o) => o.node(),
            NodeLookup::Mrca(m) => m.mrca,
        }
    }

    pub fn broken(&self) -> bool {
        matches!(self, NodeLookup::Ott(o) if o.broken())
    }

    pub fn pruned(&self) -> bool {
        matches!(self, NodeLookup::Ott(o) if o.pruned())
    }

    pub fn invalid(&self) -> bool {
        matches!(self, NodeLookup::Ott(o) if o.invalid())
    }

    /// The machine-readable reason a lookup without a usable node failed.
    pub fn failure_reason(&self) -> &'static str {
        if self.invalid() {
            "invalid_ott_id"
        } else if self.pruned() {
            "pruned_ott_id"
        } else if self.broken() {
            "broken"
        } else {
            "unknown_id"
        }
    }
}

fn find_node_by_valid_ottid(tree: &SummaryTree, id: OttId) -> TaxonToSynth {
    if let Some(node) = tree.node_by_ott_id(id) {
        return TaxonToSynth::Found { node };
    }
    let id_str = format!("ott{}", id);
    match tree.broken_taxon(&id_str) {
        Some(bt) => TaxonToSynth::Broken { mrca: bt.mrca },
        None => {
            tracing::warn!(
                "ott id {} is not in the synth tree and is not listed as broken",
                id
            );
            TaxonToSynth::Pruned
        }
    }
}

fn find_node_by_ottid_str(
    tree: &SummaryTree,
    taxonomy: &Taxonomy,
    node_id: &str,
) -> OttIdLookup {
    let parsed = match parse_ott_id(node_id) {
        Some(id) => id,
        None => return OttIdLookup::BadId,
    };
    let valid = match taxonomy.unforward_id(parsed) {
        Some(id) => id,
        None => return OttIdLookup::InvalidId { id: parsed },
    };
    let forwarded_from = (parsed != valid).then_some(parsed);
    OttIdLookup::Valid(ValidId {
        id: valid,
        forwarded_from,
        to_synth: find_node_by_valid_ottid(tree, valid),
    })
}

fn find_node_by_mrca_str(
    tree: &SummaryTree,
    taxonomy: &Taxonomy,
    first_id: &str,
    second_id: &str,
) -> MrcaLookup {
    let first = find_node_by_ottid_str(tree, taxonomy, first_id);
    let second = find_node_by_ottid_str(tree, taxonomy, second_id);
    let mrca = match (first.node(), second.node()) {
        (Some(a), Some(b)) => Some(tree.mrca(a, b)),
        _ => None,
    };
    MrcaLookup {
        first,
        second,
        mrca,
    }
}

/// Resolve a node-id string against a summary tree.
pub fn find_node_by_id_str(
    tree: &SummaryTree,
    taxonomy: &Taxonomy,
    node_id: &str,
) -> NodeLookup {
    if OTT_ID_PATTERN.is_match(node_id) {
        return NodeLookup::Ott(find_node_by_ottid_str(tree, taxonomy, node_id));
    }
    if let Some(caps) = MRCA_ID_PATTERN.captures(node_id) {
        let (first, second) = (caps[1].to_string(), caps[2].to_string());
        let mut lookup = find_node_by_mrca_str(tree, taxonomy, &first, &second);
        // a canonical synthesized node name wins over the computed mrca;
        // it stays resolvable even if one side was later pruned
        if let Some(node) = tree.node_by_broken_name(node_id) {
            lookup.mrca = Some(node);
        }
        return NodeLookup::Mrca(lookup);
    }
    NodeLookup::NoMatch
}

/// Resolve a node id that the operation cannot proceed without. Returns
/// the node and whether it stands in for a broken taxon.
pub fn find_required_node(
    tree: &SummaryTree,
    taxonomy: &Taxonomy,
    node_id: &str,
) -> Result<(SynthNodeIx, bool)> {
    let result = find_node_by_id_str(tree, taxonomy, node_id);
    match result.node() {
        Some(node) => Ok((node, result.broken())),
        None => Err(Error::bad_request_with(
            format!("node_id '{}' was not found!", node_id),
            serde_json::json!({ "reason": result.failure_reason() }),
        )),
    }
}

/// Which unresolved categories a batch lookup tolerates: matching ids are
/// reported in the `filtered` map instead of failing the request.
#[derive(Clone, Copy, Debug, Default)]
pub struct LookupFilter {
    pub invalid: bool,
    pub pruned: bool,
    pub broken: bool,
}

#[derive(Debug, Default)]
pub struct BatchLookup {
    /// One entry per surviving input id, broken taxa standing in as their
    /// MRCA nodes.
    pub nodes: Vec<SynthNodeIx>,
    /// Input id -> stand-in node id, for every broken input.
    pub broken: BTreeMap<String, String>,
    /// Input id -> reason, for ids dropped by the filter.
    pub filtered: BTreeMap<String, String>,
}

/// Batched lookup. Fails the whole batch (with a per-id reason map) when
/// any id neither resolves nor falls into a filtered category.
pub fn find_nodes_for_ids(
    tree: &SummaryTree,
    taxonomy: &Taxonomy,
    node_ids: &[String],
    fail_broken: bool,
    filter: LookupFilter,
) -> Result<BatchLookup> {
    let mut out = BatchLookup::default();
    let mut unknown: BTreeMap<String, String> = BTreeMap::new();
    let mut first_bad: Option<String> = None;
    for node_id in node_ids {
        let result = find_node_by_id_str(tree, taxonomy, node_id);
        let unusable = result.node().is_none() || (result.broken() && fail_broken);
        if unusable {
            let reason = result.failure_reason();
            let filtered = (result.invalid() && filter.invalid)
                || (result.pruned() && filter.pruned)
                || (result.broken() && filter.broken);
            if filtered {
                out.filtered.insert(node_id.clone(), reason.to_string());
                continue;
            }
            unknown.insert(node_id.clone(), reason.to_string());
            first_bad.get_or_insert_with(|| node_id.clone());
            continue;
        }
        if result.broken() {
            let node = result.node().expect("broken lookups carry their mrca");
            out.broken.insert(node_id.clone(), tree.node_id_str(node));
        }
        out.nodes
            .push(result.node().expect("usable lookups carry a node"));
    }
    if !unknown.is_empty() {
        let bad = first_bad.expect("unknown map implies a bad id");
        return Err(Error::bad_request_with(
            format!("node_id '{}' was not found!", bad),
            serde_json::json!({ "unknown": unknown }),
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::synth::test::sample_summary;
    use crate::taxonomy::test::life_taxonomy;

    #[test]
    fn test_parse_ott_id() {
        assert_eq!(parse_ott_id("ott770315"), Some(770_315));
        assert_eq!(parse_ott_id("ott99999999999"), None);
        assert_eq!(parse_ott_id("mrcaott1ott2"), None);
        assert_eq!(parse_ott_id("Homo"), None);
    }

    #[test]
    fn test_found_and_forwarded() {
        let tax = life_taxonomy();
        let (tree, _, _) = sample_summary();
        let r = find_node_by_id_str(&tree, &tax, "ott3");
        assert_eq!(tree.node_id_str(r.node().unwrap()), "ott3");
        // 77 forwards to 3
        match find_node_by_id_str(&tree, &tax, "ott77") {
            NodeLookup::Ott(OttIdLookup::Valid(v)) => {
                assert_eq!(v.id, 3);
                assert_eq!(v.forwarded_from, Some(77));
            }
            other => panic!("expected a valid lookup, got {:?}", other),
        }
    }

    #[test]
    fn test_failure_ladder() {
        let tax = life_taxonomy();
        let (tree, _, _) = sample_summary();
        let too_big = find_node_by_id_str(&tree, &tax, "ott4294967296");
        assert_eq!(too_big.failure_reason(), "unknown_id");
        let invalid = find_node_by_id_str(&tree, &tax, "ott555");
        assert!(invalid.invalid());
        assert_eq!(invalid.failure_reason(), "invalid_ott_id");
        let nomatch = find_node_by_id_str(&tree, &tax, "Homo sapiens");
        assert!(matches!(nomatch, NodeLookup::NoMatch));
        assert_eq!(nomatch.failure_reason(), "unknown_id");
    }

    #[test]
    fn test_broken_resolves_to_mrca() {
        let tax = life_taxonomy();
        let (tree, _, _) = sample_summary();
        // ott99 is in the broken table with mrcaott3ott4 as its stand-in,
        // but 99 is not a live taxon in this fixture; use the table directly
        let r = find_node_by_id_str(&tree, &tax, "mrcaott3ott4");
        assert_eq!(tree.node_id_str(r.node().unwrap()), "mrcaott3ott4");
    }

    #[test]
    fn test_mrca_id_family() {
        let tax = life_taxonomy();
        let (tree, _, _) = sample_summary();
        let r = find_node_by_id_str(&tree, &tax, "mrcaott3ott5");
        match r {
            NodeLookup::Mrca(m) => {
                assert_eq!(tree.node_id_str(m.mrca.unwrap()), "ott2");
            }
            other => panic!("expected an mrca lookup, got {:?}", other),
        }
        // one bad side poisons the mrca
        let r = find_node_by_id_str(&tree, &tax, "mrcaott3ott999");
        assert!(r.node().is_none());
        assert_eq!(r.failure_reason(), "unknown_id");
    }

    #[test]
    fn test_batch_lookup() {
        let tax = life_taxonomy();
        let (tree, _, _) = sample_summary();
        let ids = vec!["ott3".to_string(), "ott4".to_string()];
        let batch =
            find_nodes_for_ids(&tree, &tax, &ids, false, LookupFilter::default()).unwrap();
        assert_eq!(batch.nodes.len(), 2);
        assert!(batch.broken.is_empty());

        // an unknown id fails the batch with a reason map
        let ids = vec!["ott3".to_string(), "ott555".to_string()];
        let err = find_nodes_for_ids(&tree, &tax, &ids, false, LookupFilter::default())
            .unwrap_err();
        let j = err.to_json();
        assert_eq!(j["unknown"]["ott555"], "invalid_ott_id");

        // ...unless the caller filters that category
        let batch = find_nodes_for_ids(
            &tree,
            &tax,
            &ids,
            false,
            LookupFilter {
                invalid: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(batch.nodes.len(), 1);
        assert_eq!(batch.filtered["ott555"], "invalid_ott_id");
    }
}
