//! The query facade: one value owning the gated taxonomy, the name index,
//! the context data and every registered summary tree, with one method per
//! exposed operation. Methods return `serde_json::Value` blobs; the
//! transport layer owns status codes and wire formatting.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Value};
use tracing::debug;

use crate::context::ContextCatalog;
use crate::ctrie::NameIndex;
use crate::flags::{flags_to_string_vec, FlagSet};
use crate::formats::newick::write_newick;
use crate::gate::ParallelReadSerialWrite;
use crate::rank::TaxRank;
use crate::resolve::{
    find_node_by_id_str, find_nodes_for_ids, find_required_node, LookupFilter, NodeLookup,
    OttIdLookup,
};
use crate::synth::{
    compare_synth_ids, MappingKind, StudyNodeInterner, SummaryTree, SummaryTreeAnnotation,
    SynthNodeIx,
};
use crate::taxonomy::{OttId, TaxonIx, Taxonomy};
use crate::tnrs::Searcher;
use crate::{Error, Result};

const NEWICK_TIP_LIMIT: u32 = 100_000;
const ARGUSON_TIP_LIMIT: u32 = 25_000;

/// How newick node labels are rendered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LabelFormat {
    NameOnly,
    IdOnly,
    NameAndId,
}

impl LabelFormat {
    pub fn parse(s: &str) -> Result<LabelFormat> {
        match s {
            "name" => Ok(LabelFormat::NameOnly),
            "id" => Ok(LabelFormat::IdOnly),
            "name_and_id" => Ok(LabelFormat::NameAndId),
            _ => Err(Error::bad_request(format!(
                "label_format '{}' is not one of name, id, name_and_id",
                s
            ))),
        }
    }
}

/// The taxonomy and everything whose validity is tied to its traversal
/// indices, swapped together under the write gate.
struct CoreData {
    taxonomy: Taxonomy,
    index: NameIndex,
    catalog: ContextCatalog,
}

pub struct TreeService {
    core: ParallelReadSerialWrite<CoreData>,
    interner: StudyNodeInterner,
    trees: BTreeMap<String, (SummaryTree, SummaryTreeAnnotation)>,
    default_synth_id: Option<String>,
}

impl TreeService {
    /// Wrap a loaded taxonomy. Builds the name index and the
    /// nomenclature boundaries; summary trees are registered afterwards.
    pub fn new(taxonomy: Taxonomy) -> Result<TreeService> {
        let index = NameIndex::build(&taxonomy);
        let mut catalog = ContextCatalog::new();
        catalog.init_nom_code_boundaries(&taxonomy)?;
        Ok(TreeService {
            core: ParallelReadSerialWrite::new(CoreData {
                taxonomy,
                index,
                catalog,
            }),
            interner: StudyNodeInterner::new(),
            trees: BTreeMap::new(),
            default_synth_id: None,
        })
    }

    /// Load and register one summary tree from its directory. Called
    /// during single-threaded startup, before queries begin.
    pub fn register_summary_dir(&mut self, dir: &std::path::Path) -> Result<()> {
        let core = self.core.read();
        let (tree, sta) =
            crate::synth::register_summary_dir(dir, &core.taxonomy, &mut self.interner)?;
        drop(core);
        self.finish_registration(tree, sta)
    }

    /// Register a summary tree from already-loaded pieces.
    pub fn register_summary_parts(
        &mut self,
        newick: &str,
        annotations: &Value,
        broken_taxa: &Value,
        contesting: Option<&Value>,
    ) -> Result<()> {
        let core = self.core.read();
        let (tree, sta) = crate::synth::build_summary(
            newick,
            &core.taxonomy,
            annotations,
            broken_taxa,
            contesting,
            &mut self.interner,
        )?;
        drop(core);
        self.finish_registration(tree, sta)
    }

    fn finish_registration(
        &mut self,
        tree: SummaryTree,
        sta: SummaryTreeAnnotation,
    ) -> Result<()> {
        let synth_id = sta.synth_id.clone();
        // the default is the highest embedded version among loaded trees
        let take_default = match &self.default_synth_id {
            None => true,
            Some(cur) => compare_synth_ids(cur, &synth_id)? == std::cmp::Ordering::Less,
        };
        if take_default {
            self.default_synth_id = Some(synth_id.clone());
        }
        self.trees.insert(synth_id, (tree, sta));
        Ok(())
    }

    pub fn default_synth_id(&self) -> Option<&str> {
        self.default_synth_id.as_deref()
    }

    pub fn available_trees(&self) -> Vec<&str> {
        self.trees.keys().map(String::as_str).collect()
    }

    fn summary(&self, synth_id: Option<&str>) -> Result<(&SummaryTree, &SummaryTreeAnnotation)> {
        let key = match synth_id {
            Some(id) if !id.is_empty() => id,
            _ => self
                .default_synth_id
                .as_deref()
                .ok_or_else(|| Error::bad_request("no summary tree has been registered"))?,
        };
        self.trees
            .get(key)
            .map(|(t, a)| (t, a))
            .ok_or_else(|| Error::bad_request(format!("synth_id '{}' is not available", key)))
    }

    // ------------------------------------------------------------------
    // tree-of-life operations

    pub fn about(&self, synth_id: Option<&str>, include_source_list: bool) -> Result<Value> {
        let (tree, sta) = self.summary(synth_id)?;
        let core = self.core.read();
        let mut response = json!({
            "date_created": sta.date_completed,
            "num_source_trees": sta.num_source_trees,
            "num_source_studies": sta.num_source_studies,
            "taxonomy_version": sta.taxonomy_version,
            "filtered_flags": sta.filtered_flags_vec,
            "synth_id": sta.synth_id,
        });
        if include_source_list {
            response["source_id_map"] = sta.source_id_map.clone();
            response["source_list"] = json!(sta.sources);
        }
        response["root"] = self.basic_node_blob(tree, tree.root(), &core.taxonomy, false);
        Ok(response)
    }

    pub fn node_info(
        &self,
        synth_id: Option<&str>,
        node_id: &str,
        include_lineage: bool,
    ) -> Result<Value> {
        debug!("node_info for {}", node_id);
        let (tree, sta) = self.summary(synth_id)?;
        let core = self.core.read();
        let lookup = find_node_by_id_str(tree, &core.taxonomy, node_id);
        let node = match lookup.node() {
            Some(n) => n,
            None => {
                return Err(Error::bad_request_with(
                    format!("node_id '{}' was not found!", node_id),
                    json!({ "reason": lookup.failure_reason() }),
                ))
            }
        };
        let mut response = self.node_info_blob(tree, sta, &core.taxonomy, node, include_lineage);
        response["query"] = json!(node_id);
        if lookup.broken() {
            response["response_for_mrca_of_broken_taxon"] = json!(true);
        }
        if let NodeLookup::Ott(OttIdLookup::Valid(v)) = lookup {
            if let Some(from) = v.forwarded_from {
                response["forwarded_from"] = json!(from);
            }
        }
        Ok(response)
    }

    pub fn nodes_info(
        &self,
        synth_id: Option<&str>,
        node_ids: &[String],
        include_lineage: bool,
    ) -> Result<Value> {
        let (tree, sta) = self.summary(synth_id)?;
        let core = self.core.read();
        let batch =
            find_nodes_for_ids(tree, &core.taxonomy, node_ids, false, LookupFilter::default())?;
        let mut response = Vec::with_capacity(batch.nodes.len());
        for (node, node_id) in batch.nodes.iter().zip(node_ids) {
            let mut j = self.node_info_blob(tree, sta, &core.taxonomy, *node, include_lineage);
            j["query"] = json!(node_id);
            response.push(j);
        }
        Ok(Value::Array(response))
    }

    /// `node_info` addressed by a source-study node id such as
    /// `ncbi:9606`; resolves through the taxonomy cross-references.
    pub fn node_info_by_source_id(
        &self,
        synth_id: Option<&str>,
        source_id: &str,
        include_lineage: bool,
    ) -> Result<Value> {
        let core = self.core.read();
        let (prefix, foreign) = split_source_id(source_id)?;
        let ott_id = core.taxonomy.source_lookup(prefix, foreign)?.id;
        drop(core);
        self.node_info(synth_id, &format!("ott{}", ott_id), include_lineage)
    }

    pub fn mrca(
        &self,
        synth_id: Option<&str>,
        node_ids: &[String],
        excluded_node_ids: &[String],
        soft_exclude: bool,
    ) -> Result<Value> {
        let (tree, sta) = self.summary(synth_id)?;
        let core = self.core.read();
        let taxonomy = &core.taxonomy;

        let batch = find_nodes_for_ids(tree, taxonomy, node_ids, false, LookupFilter::default())?;
        let mrca_included = tree
            .mrca_of_set(&batch.nodes)
            .ok_or_else(|| Error::bad_request("MRCA of taxa was not found"))?;

        let excluded =
            find_nodes_for_ids(tree, taxonomy, excluded_node_ids, false, LookupFilter::default())?;
        let mut closest_excluded_ancestor: Option<SynthNodeIx> = None;
        let mut reversals: Vec<&str> = Vec::new();
        for (node, node_id) in excluded.nodes.iter().zip(excluded_node_ids) {
            let m = tree.mrca(mrca_included, *node);
            if m == mrca_included {
                // the excluded node sits inside the include group
                reversals.push(node_id);
                continue;
            }
            let closer = match closest_excluded_ancestor {
                None => true,
                Some(cur) => tree.is_ancestor_of(cur, m),
            };
            if closer {
                closest_excluded_ancestor = Some(m);
            }
        }

        let mut response = json!({ "synth_id": sta.synth_id });
        if !reversals.is_empty() {
            response["reversals"] = json!(reversals);
            if !soft_exclude {
                return Err(Error::bad_request_with(
                    "excluded taxa were nested within the include group",
                    response,
                ));
            }
        }
        if !excluded_node_ids.is_empty() {
            let stop = closest_excluded_ancestor.ok_or_else(|| {
                Error::bad_request("all excluded taxa were nested within the include group")
            })?;
            let mut chain = Vec::new();
            let mut cur = mrca_included;
            while cur != stop {
                chain.push(tree.node_id_str(cur));
                cur = match tree.node(cur).parent {
                    Some(p) => p,
                    None => break,
                };
            }
            response["node_ids"] = json!(chain);
            return Ok(response);
        }

        let mut mrcaj = self.basic_node_blob(tree, mrca_included, taxonomy, false);
        let mut used_sources = BTreeSet::new();
        self.add_support_info(tree, mrca_included, taxonomy, &mut mrcaj, &mut used_sources);
        add_nearest_taxon(tree, mrca_included, taxonomy, &mut response)?;
        response["source_id_map"] = self.source_id_map_blob(&used_sources, taxonomy, sta);
        response["mrca"] = mrcaj;
        if !batch.broken.is_empty() {
            response["broken"] = json!(batch.broken);
        }
        Ok(response)
    }

    fn node_for_subtree(
        &self,
        tree: &SummaryTree,
        taxonomy: &Taxonomy,
        node_id: &str,
        height_limit: i64,
        tip_limit: u32,
    ) -> Result<SynthNodeIx> {
        let (node, was_broken) = find_required_node(tree, taxonomy, node_id)?;
        if was_broken {
            let mut broken = json!({ "mrca": tree.node_id_str(node) });
            if let Some(contesting) = tree.contesting_trees(node_id) {
                let mut c = serde_json::Map::new();
                for ct in contesting {
                    let points: Vec<Value> = ct
                        .attachment_points
                        .iter()
                        .map(|p| {
                            json!({
                                "parent": p.parent,
                                "children_from_taxon": p.children_from_taxon,
                            })
                        })
                        .collect();
                    c.insert(ct.tree.clone(), json!({ "attachment_points": points }));
                }
                broken["contesting_trees"] = Value::Object(c);
            }
            return Err(Error::Broken {
                id: node_id.to_string(),
                data: json!({ "broken": broken }),
            });
        }
        if tree.node(node).num_tips > tip_limit && height_limit < 0 {
            return Err(Error::TooLarge { limit: tip_limit });
        }
        Ok(node)
    }

    pub fn subtree_newick(
        &self,
        synth_id: Option<&str>,
        node_id: &str,
        label_format: LabelFormat,
        height_limit: i64,
        include_all_node_labels: bool,
    ) -> Result<Value> {
        let (tree, _) = self.summary(synth_id)?;
        let core = self.core.read();
        let taxonomy = &core.taxonomy;
        let focal =
            self.node_for_subtree(tree, taxonomy, node_id, height_limit, NEWICK_TIP_LIMIT)?;

        let mut studies: BTreeSet<String> = BTreeSet::new();
        let children = |n: SynthNodeIx| tree.children(n).to_vec();
        let mut namer = |n: SynthNodeIx| {
            self.stash_supporting_studies(tree, n, &mut studies);
            let node = tree.node(n);
            if !include_all_node_labels && !node.is_tip() && node.ott_id.is_none() {
                return String::new();
            }
            synth_node_label(tree, n, taxonomy, label_format)
        };
        let newick = write_newick(focal, &children, &mut namer, height_limit);
        Ok(json!({
            "newick": newick,
            "supporting_studies": studies,
        }))
    }

    pub fn subtree_arguson(
        &self,
        synth_id: Option<&str>,
        node_id: &str,
        height_limit: i64,
    ) -> Result<Value> {
        let (tree, sta) = self.summary(synth_id)?;
        let core = self.core.read();
        let taxonomy = &core.taxonomy;
        let focal =
            self.node_for_subtree(tree, taxonomy, node_id, height_limit, ARGUSON_TIP_LIMIT)?;
        let mut used_sources = BTreeSet::new();
        let mut arguson =
            self.arguson_blob(tree, focal, taxonomy, height_limit, &mut used_sources);
        self.add_lineage(tree, focal, taxonomy, &mut arguson, &mut used_sources, true);
        arguson["source_id_map"] = self.source_id_map_blob(&used_sources, taxonomy, sta);
        Ok(json!({ "synth_id": sta.synth_id, "arguson": arguson }))
    }

    pub fn induced_subtree(
        &self,
        synth_id: Option<&str>,
        node_ids: &[String],
        label_format: LabelFormat,
    ) -> Result<Value> {
        let (tree, _) = self.summary(synth_id)?;
        let core = self.core.read();
        let taxonomy = &core.taxonomy;
        let batch = find_nodes_for_ids(tree, taxonomy, node_ids, false, LookupFilter::default())?;
        let focal = tree
            .mrca_of_set(&batch.nodes)
            .ok_or_else(|| Error::bad_request("MRCA of taxa was not found"))?;

        // the visited set spans every tip-to-mrca path
        let mut visited: BTreeSet<SynthNodeIx> = BTreeSet::new();
        visited.insert(focal);
        for &tip in &batch.nodes {
            let mut cur = tip;
            while visited.insert(cur) {
                match tree.node(cur).parent {
                    Some(p) => cur = p,
                    None => break,
                }
            }
        }
        let mut studies: BTreeSet<String> = BTreeSet::new();
        let children = |n: SynthNodeIx| -> Vec<SynthNodeIx> {
            tree.children(n)
                .iter()
                .copied()
                .filter(|c| visited.contains(c))
                .collect()
        };
        let mut namer = |n: SynthNodeIx| {
            self.stash_supporting_studies(tree, n, &mut studies);
            synth_node_label(tree, n, taxonomy, label_format)
        };
        let newick = write_newick(focal, &children, &mut namer, -1);
        Ok(json!({
            "newick": newick,
            "supporting_studies": studies,
            "broken": batch.broken,
        }))
    }

    pub fn conflict_status(&self, tree1_newick: &str, tree2: &str) -> Result<Value> {
        let core = self.core.read();
        let statuses = match tree2 {
            "ott" => crate::conflict::conflict_with_reference(
                tree1_newick,
                &crate::conflict::RefTree::Taxonomy(&core.taxonomy),
                &core.taxonomy,
            )?,
            "synth" => {
                let (tree, _) = self.summary(None)?;
                crate::conflict::conflict_with_reference(
                    tree1_newick,
                    &crate::conflict::RefTree::Summary(tree),
                    &core.taxonomy,
                )?
            }
            other => {
                return Err(Error::bad_request(format!(
                    "tree2 = '{}' not recognized; expected 'ott' or 'synth'",
                    other
                )))
            }
        };
        let mut response = serde_json::Map::new();
        for (name, status) in statuses {
            let j = if status.status == "conflicts_with" {
                let (witnesses, names): (Vec<_>, Vec<_>) = status.witnesses.into_iter().unzip();
                json!({
                    "status": "conflicts_with",
                    "witness": witnesses,
                    "witness_name": names,
                })
            } else {
                let (witness, witness_name) =
                    status.witnesses.into_iter().next().unwrap_or_default();
                json!({
                    "status": status.status,
                    "witness": witness,
                    "witness_name": witness_name,
                })
            };
            response.insert(name, j);
        }
        Ok(Value::Object(response))
    }

    // ------------------------------------------------------------------
    // taxonomy operations

    pub fn taxonomy_about(&self) -> Result<Value> {
        let core = self.core.read();
        Ok(tax_about_blob(&core.taxonomy))
    }

    pub fn taxon_info(
        &self,
        ott_id: Option<OttId>,
        source_id: Option<&str>,
        include_lineage: bool,
        include_children: bool,
        include_terminal_descendants: bool,
    ) -> Result<Value> {
        let core = self.core.read();
        let taxonomy = &core.taxonomy;
        let ix = self.taxon_from_args(taxonomy, ott_id, source_id)?;
        let mut response = taxon_blob(taxonomy, ix);
        if include_lineage {
            let lineage: Vec<Value> = taxonomy
                .ancestors(ix)
                .map(|a| taxon_blob(taxonomy, a))
                .collect();
            response["lineage"] = json!(lineage);
        }
        if include_children {
            let children: Vec<Value> = taxonomy
                .children(ix)
                .iter()
                .map(|&c| taxon_blob(taxonomy, c))
                .collect();
            response["children"] = json!(children);
        }
        if include_terminal_descendants {
            let tips: Vec<OttId> = taxonomy
                .descendants(ix)
                .filter(|&d| taxonomy.children(d).is_empty())
                .map(|d| taxonomy.taxon(d).id)
                .collect();
            response["terminal_descendants"] = json!(tips);
        }
        Ok(response)
    }

    pub fn taxonomy_flags(&self) -> Result<Value> {
        let core = self.core.read();
        let mut flags = serde_json::Map::new();
        for flag in FlagSet::all().iter() {
            flags.insert(flag.as_str().to_string(), json!(0));
        }
        for (flag, count) in core.taxonomy.flag_counts() {
            flags.insert(flag.as_str().to_string(), json!(count));
        }
        Ok(Value::Object(flags))
    }

    pub fn taxonomy_mrca(&self, ott_ids: &[OttId]) -> Result<Value> {
        let core = self.core.read();
        let taxonomy = &core.taxonomy;
        let mut taxa = Vec::with_capacity(ott_ids.len());
        for &id in ott_ids {
            let ix = taxonomy.taxon_ix_from_id(id).ok_or_else(|| {
                Error::bad_request(format!("ott_id \"{}\" was not recognized", id))
            })?;
            taxa.push(ix);
        }
        let mrca = taxonomy
            .mrca_of_set(&taxa)
            .ok_or_else(|| Error::bad_request("MRCA of taxa was not found"))?;
        Ok(json!({ "mrca": taxon_blob(taxonomy, mrca) }))
    }

    pub fn taxonomy_subtree(
        &self,
        ott_id: Option<OttId>,
        source_id: Option<&str>,
        label_format: LabelFormat,
    ) -> Result<Value> {
        let core = self.core.read();
        let taxonomy = &core.taxonomy;
        let ix = self.taxon_from_args(taxonomy, ott_id, source_id)?;
        let children = |n: TaxonIx| taxonomy.children(n).to_vec();
        let mut namer = |n: TaxonIx| taxon_label(taxonomy, n, label_format);
        let newick = write_newick(ix, &children, &mut namer, -1);
        Ok(json!({ "newick": newick }))
    }

    fn taxon_from_args(
        &self,
        taxonomy: &Taxonomy,
        ott_id: Option<OttId>,
        source_id: Option<&str>,
    ) -> Result<TaxonIx> {
        match (ott_id, source_id) {
            (Some(_), Some(_)) => Err(Error::Conflict {
                msg: "supply either ott_id or source_id, not both".into(),
            }),
            (Some(id), None) => {
                let current = taxonomy
                    .unforward_id(id)
                    .ok_or_else(|| Error::InvalidOttId {
                        id: format!("ott{}", id),
                    })?;
                Ok(taxonomy
                    .taxon_ix_from_id(current)
                    .expect("unforwarded ids are live"))
            }
            (None, Some(sid)) => {
                let (prefix, foreign) = split_source_id(sid)?;
                let id = taxonomy.source_lookup(prefix, foreign)?.id;
                Ok(taxonomy
                    .taxon_ix_from_id(id)
                    .expect("source lookups return live taxa"))
            }
            (None, None) => Err(Error::bad_request("an ott_id or source_id is required")),
        }
    }

    // ------------------------------------------------------------------
    // tnrs operations

    fn with_searcher<T>(&self, f: impl FnOnce(&Searcher<'_>) -> Result<T>) -> Result<T> {
        let core = self.core.read();
        f(&Searcher {
            taxonomy: &core.taxonomy,
            index: &core.index,
            catalog: &core.catalog,
        })
    }

    pub fn tnrs_match_names(
        &self,
        names: &[String],
        context_name: Option<&str>,
        do_approximate_matching: bool,
        include_suppressed: bool,
    ) -> Result<Value> {
        self.with_searcher(|s| {
            crate::tnrs::match_names(
                s,
                names,
                context_name,
                do_approximate_matching,
                include_suppressed,
            )
        })
    }

    pub fn tnrs_autocomplete_name(
        &self,
        name: &str,
        context_name: &str,
        include_suppressed: bool,
    ) -> Result<Value> {
        self.with_searcher(|s| {
            crate::tnrs::autocomplete_name(s, name, context_name, include_suppressed)
        })
    }

    pub fn tnrs_contexts(&self) -> Result<Value> {
        let core = self.core.read();
        Ok(crate::tnrs::contexts(&core.catalog))
    }

    pub fn tnrs_infer_context(&self, names: &[String]) -> Result<Value> {
        self.with_searcher(|s| Ok(crate::tnrs::infer_context(s, names)))
    }

    // ------------------------------------------------------------------
    // patching

    /// Graft new taxa into the live taxonomy. Runs under the write gate:
    /// readers drain first, and the name index and nomenclature ranges
    /// are rebuilt before the gate is released.
    pub fn add_taxa(&self, taxa: &[Value]) -> Result<Value> {
        let mut core = self.core.write();
        let mut added = 0usize;
        for taxon in taxa {
            let name = req_str(taxon, "name")?;
            let ott_id = req_ott_id(taxon, "ott_id")?;
            let parent = req_ott_id(taxon, "parent")?;
            let rank: TaxRank = req_str(taxon, "rank")?.parse()?;
            if let Err(e) =
                core.taxonomy
                    .add_taxon(ott_id, parent, &name, rank, Vec::new(), FlagSet::empty())
            {
                // the index may already be stale from earlier additions
                self.refresh_core(&mut core)?;
                return Err(Error::bad_request_with(
                    format!("error adding taxon '{}' with ott_id {}", name, ott_id),
                    json!({ "ott_id": ott_id, "error": e.to_string(), "added": added }),
                ));
            }
            added += 1;
        }
        if added > 0 {
            self.refresh_core(&mut core)?;
        }
        Ok(json!({ "added": added }))
    }

    fn refresh_core(&self, core: &mut CoreData) -> Result<()> {
        core.index = NameIndex::build(&core.taxonomy);
        core.catalog.init_nom_code_boundaries(&core.taxonomy)
    }

    // ------------------------------------------------------------------
    // response-blob helpers

    fn basic_node_blob(
        &self,
        tree: &SummaryTree,
        ix: SynthNodeIx,
        taxonomy: &Taxonomy,
        is_arguson: bool,
    ) -> Value {
        let node = tree.node(ix);
        let mut j = json!({
            "node_id": tree.node_id_str(ix),
            "num_tips": if node.is_tip() { 0 } else { node.num_tips },
        });
        if is_arguson {
            j["extinct"] = json!(node.extinct);
        }
        match node.ott_id.and_then(|id| taxonomy.taxon_ix_from_id(id)) {
            Some(tix) => {
                j["taxon"] = short_taxon_blob(taxonomy, tix);
            }
            None => {
                if is_arguson {
                    j["descendant_name_list"] = descendant_names(tree, ix, taxonomy);
                }
            }
        }
        j
    }

    fn add_support_info(
        &self,
        tree: &SummaryTree,
        ix: SynthNodeIx,
        taxonomy: &Taxonomy,
        noderepr: &mut Value,
        used_sources: &mut BTreeSet<String>,
    ) {
        let node = tree.node(ix);
        let mut singles: BTreeMap<&'static str, serde_json::Map<String, Value>> = BTreeMap::new();
        let mut conflicts: serde_json::Map<String, Value> = serde_json::Map::new();
        for &(kind, edge) in &node.source_edges {
            let (study, study_node) = self.interner.decode(edge);
            used_sources.insert(study.to_string());
            if kind.is_multivalued() {
                conflicts
                    .entry(study.to_string())
                    .or_insert_with(|| Value::Array(Vec::new()))
                    .as_array_mut()
                    .expect("conflict entries are arrays")
                    .push(json!(study_node));
            } else {
                singles
                    .entry(kind.as_str())
                    .or_default()
                    .insert(study.to_string(), json!(study_node));
            }
        }
        // the taxonomy is an extra supporting source for taxon nodes
        if node.ott_id.is_some() {
            let tag = format!("ott{}", taxonomy.version());
            used_sources.insert(tag.clone());
            singles
                .entry(MappingKind::SupportedBy.as_str())
                .or_default()
                .insert(tag, json!(tree.node_id_str(ix)));
        }
        for (tag, map) in singles {
            noderepr[tag] = Value::Object(map);
        }
        if !conflicts.is_empty() {
            noderepr[MappingKind::ConflictsWith.as_str()] = Value::Object(conflicts);
        }
        if node.was_uncontested {
            noderepr["was_uncontested"] = json!(true);
            noderepr["was_constrained"] = json!(true);
        }
    }

    fn stash_supporting_studies(
        &self,
        tree: &SummaryTree,
        ix: SynthNodeIx,
        studies: &mut BTreeSet<String>,
    ) {
        for edge in tree.node(ix).supported_by() {
            let (study, _) = self.interner.decode(edge);
            studies.insert(study.to_string());
        }
    }

    fn add_lineage(
        &self,
        tree: &SummaryTree,
        ix: SynthNodeIx,
        taxonomy: &Taxonomy,
        j: &mut Value,
        used_sources: &mut BTreeSet<String>,
        is_arguson: bool,
    ) {
        let mut lineage = Vec::new();
        for anc in tree.ancestors(ix) {
            let mut ancj = self.basic_node_blob(tree, anc, taxonomy, is_arguson);
            self.add_support_info(tree, anc, taxonomy, &mut ancj, used_sources);
            lineage.push(ancj);
        }
        j["lineage"] = json!(lineage);
    }

    fn source_id_map_blob(
        &self,
        used_sources: &BTreeSet<String>,
        taxonomy: &Taxonomy,
        sta: &SummaryTreeAnnotation,
    ) -> Value {
        let tax_tag = format!("ott{}", taxonomy.version());
        let mut map = serde_json::Map::new();
        for tag in used_sources {
            let entry = if *tag == tax_tag {
                json!({ "taxonomy": tax_tag })
            } else {
                sta.source_id_map.get(tag).cloned().unwrap_or(Value::Null)
            };
            map.insert(tag.clone(), entry);
        }
        Value::Object(map)
    }

    fn node_info_blob(
        &self,
        tree: &SummaryTree,
        sta: &SummaryTreeAnnotation,
        taxonomy: &Taxonomy,
        node: SynthNodeIx,
        include_lineage: bool,
    ) -> Value {
        let mut response = self.basic_node_blob(tree, node, taxonomy, false);
        response["synth_id"] = json!(sta.synth_id);
        let mut used_sources = BTreeSet::new();
        self.add_support_info(tree, node, taxonomy, &mut response, &mut used_sources);
        if include_lineage {
            self.add_lineage(tree, node, taxonomy, &mut response, &mut used_sources, false);
        }
        response["source_id_map"] = self.source_id_map_blob(&used_sources, taxonomy, sta);
        response
    }

    fn arguson_blob(
        &self,
        tree: &SummaryTree,
        ix: SynthNodeIx,
        taxonomy: &Taxonomy,
        height_limit: i64,
        used_sources: &mut BTreeSet<String>,
    ) -> Value {
        let mut j = self.basic_node_blob(tree, ix, taxonomy, true);
        if !tree.node(ix).is_tip() && height_limit != 0 {
            let children: Vec<Value> = tree
                .children(ix)
                .iter()
                .map(|&c| self.arguson_blob(tree, c, taxonomy, height_limit - 1, used_sources))
                .collect();
            j["children"] = json!(children);
        }
        self.add_support_info(tree, ix, taxonomy, &mut j, used_sources);
        j
    }
}

fn split_source_id(source_id: &str) -> Result<(&str, &str)> {
    source_id.split_once(':').ok_or_else(|| {
        Error::bad_request(format!(
            "source id '{}' is not of the form prefix:id",
            source_id
        ))
    })
}

fn req_str(j: &Value, field: &str) -> Result<String> {
    j.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::bad_request(format!("missing required argument '{}'", field)))
}

fn req_ott_id(j: &Value, field: &str) -> Result<OttId> {
    let raw = j
        .get(field)
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::bad_request(format!("missing required argument '{}'", field)))?;
    OttId::try_from(raw).map_err(|_| Error::UnknownId {
        id: format!("ott{}", raw),
    })
}

/// The taxon block embedded in synth-node responses.
fn short_taxon_blob(taxonomy: &Taxonomy, ix: TaxonIx) -> Value {
    let taxon = taxonomy.taxon(ix);
    json!({
        "ott_id": taxon.id,
        "name": taxon.name,
        "unique_name": taxon.unique_name,
        "rank": taxon.rank.as_str(),
        "tax_sources": source_strings(taxonomy, ix),
    })
}

fn source_strings(taxonomy: &Taxonomy, ix: TaxonIx) -> Vec<String> {
    taxonomy
        .taxon(ix)
        .sources
        .iter()
        .map(|(db, fid)| format!("{}:{}", db.prefix(), fid))
        .collect()
}

/// The full taxon block used by the taxonomy and TNRS services.
pub(crate) fn taxon_blob(taxonomy: &Taxonomy, ix: TaxonIx) -> Value {
    let taxon = taxonomy.taxon(ix);
    let synonyms: Vec<&str> = taxonomy.synonyms_of(ix).map(|s| s.name.as_str()).collect();
    json!({
        "ott_id": taxon.id,
        "name": taxon.name,
        "unique_name": taxon.unique_name,
        "rank": taxon.rank.as_str(),
        "tax_sources": source_strings(taxonomy, ix),
        "source": format!("ott{}", taxonomy.version()),
        "flags": flags_to_string_vec(taxon.flags),
        "synonyms": synonyms,
        "is_suppressed": taxonomy.is_suppressed_from_tnrs(ix),
        "is_suppressed_from_synth": taxonomy.is_suppressed_from_synth(ix),
    })
}

pub(crate) fn tax_about_blob(taxonomy: &Taxonomy) -> Value {
    json!({
        "author": "open tree of life project",
        "name": "ott",
        "source": format!("ott{}", taxonomy.version()),
        "version": taxonomy.version_number(),
        "weburl": format!(
            "https://tree.opentreeoflife.org/about/taxonomy-version/ott{}",
            taxonomy.version_number()
        ),
    })
}

fn taxon_label(taxonomy: &Taxonomy, ix: TaxonIx, format: LabelFormat) -> String {
    let taxon = taxonomy.taxon(ix);
    match format {
        LabelFormat::IdOnly => format!("ott{}", taxon.id),
        LabelFormat::NameOnly => taxon.unique_name.clone(),
        LabelFormat::NameAndId => format!("{} ott{}", taxon.unique_name, taxon.id),
    }
}

fn synth_node_label(
    tree: &SummaryTree,
    ix: SynthNodeIx,
    taxonomy: &Taxonomy,
    format: LabelFormat,
) -> String {
    let node = tree.node(ix);
    if format != LabelFormat::IdOnly {
        if let Some(tix) = node.ott_id.and_then(|id| taxonomy.taxon_ix_from_id(id)) {
            return match format {
                LabelFormat::NameAndId => {
                    format!("{} {}", taxonomy.taxon(tix).unique_name, tree.node_id_str(ix))
                }
                _ => taxonomy.taxon(tix).unique_name.clone(),
            };
        }
    }
    tree.node_id_str(ix)
}

/// Two representative tip-ward names for an unnamed node, used by the
/// arguson tree browser display.
fn descendant_names(tree: &SummaryTree, ix: SynthNodeIx, taxonomy: &Taxonomy) -> Value {
    fn name_from(
        tree: &SummaryTree,
        ix: SynthNodeIx,
        taxonomy: &Taxonomy,
        take_first: bool,
    ) -> Option<String> {
        let mut cur = ix;
        loop {
            if let Some(tix) = tree
                .node(cur)
                .ott_id
                .and_then(|id| taxonomy.taxon_ix_from_id(id))
            {
                return Some(taxonomy.taxon(tix).name.clone());
            }
            let children = tree.children(cur);
            cur = if take_first {
                *children.first()?
            } else {
                *children.last()?
            };
        }
    }
    let mut names = Vec::new();
    let children = tree.children(ix);
    if let Some(&first) = children.first() {
        if let Some(n) = name_from(tree, first, taxonomy, true) {
            names.push(n);
        }
    }
    if children.len() > 1 {
        if let Some(&last) = children.last() {
            if let Some(n) = name_from(tree, last, taxonomy, false) {
                names.push(n);
            }
        }
    }
    json!(names)
}

fn add_nearest_taxon(
    tree: &SummaryTree,
    node: SynthNodeIx,
    taxonomy: &Taxonomy,
    j: &mut Value,
) -> Result<()> {
    if tree.node(node).ott_id.is_some() {
        return Ok(());
    }
    for anc in tree.ancestors(node) {
        if let Some(id) = tree.node(anc).ott_id {
            let tix = taxonomy.taxon_ix_from_id(id).ok_or_else(|| {
                Error::internal(format!("ott id {} on a synth node is not in the taxonomy", id))
            })?;
            j["nearest_taxon"] = short_taxon_blob(taxonomy, tix);
            return Ok(());
        }
    }
    Err(Error::internal("no ancestor of the mrca is a taxon"))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::synth::test::sample_summary_inputs;
    use crate::taxonomy::test::life_taxonomy;

    pub(crate) fn sample_service() -> TreeService {
        let mut service = TreeService::new(life_taxonomy()).unwrap();
        let (newick, annotations, broken, contesting) = sample_summary_inputs();
        service
            .register_summary_parts(&newick, &annotations, &broken, Some(&contesting))
            .unwrap();
        service
    }

    #[test]
    fn test_about() {
        let service = sample_service();
        let v = service.about(None, true).unwrap();
        assert_eq!(v["synth_id"], "opentree13.4");
        assert_eq!(v["num_source_trees"], 3);
        assert_eq!(v["root"]["node_id"], "ott1");
        assert_eq!(v["root"]["num_tips"], 4);
        assert_eq!(v["root"]["taxon"]["name"], "Life");
        assert!(v["source_id_map"].is_object());
        assert_eq!(service.default_synth_id(), Some("opentree13.4"));
    }

    #[test]
    fn test_node_info_basic() {
        let service = sample_service();
        let v = service.node_info(None, "ott2", true).unwrap();
        assert_eq!(v["node_id"], "ott2");
        assert_eq!(v["num_tips"], 3);
        assert_eq!(v["taxon"]["name"], "Mammalia");
        assert_eq!(v["supported_by"]["ot_100@tree1"], "node2");
        // taxonomy is an extra supporting source
        assert_eq!(v["supported_by"]["ott3.3draft1"], "ott2");
        assert_eq!(v["was_uncontested"], true);
        let lineage = v["lineage"].as_array().unwrap();
        assert_eq!(lineage.len(), 1);
        assert_eq!(lineage[0]["node_id"], "ott1");
        assert!(v["source_id_map"]["ot_100@tree1"]["study_id"].is_string());
    }

    #[test]
    fn test_node_info_forwarded() {
        let service = sample_service();
        // scenario: ott77 forwards to ott3
        let v = service.node_info(None, "ott77", false).unwrap();
        assert_eq!(v["node_id"], "ott3");
        assert_eq!(v["forwarded_from"], 77);
        assert_eq!(v["query"], "ott77");
    }

    #[test]
    fn test_node_info_broken() {
        let service = sample_service();
        // ott99 is broken; its info is the stand-in mrca's
        let v = service.node_info(None, "ott99", false).unwrap();
        assert_eq!(v["node_id"], "mrcaott3ott4");
        assert_eq!(v["response_for_mrca_of_broken_taxon"], true);
        // conflicts_with renders as per-study arrays
        assert_eq!(v["conflicts_with"]["ot_200@tree2"], json!(["node3", "node9"]));
    }

    #[test]
    fn test_node_info_failures() {
        let service = sample_service();
        let err = service.node_info(None, "ott12345", false).unwrap_err();
        assert_eq!(err.to_json()["reason"], "invalid_ott_id");
        let err = service.node_info(None, "not-an-id", false).unwrap_err();
        assert_eq!(err.to_json()["reason"], "unknown_id");
    }

    #[test]
    fn test_mrca_standard() {
        let service = sample_service();
        let ids = vec!["ott3".into(), "ott4".into(), "ott5".into()];
        let v = service.mrca(None, &ids, &[], false).unwrap();
        assert_eq!(v["mrca"]["node_id"], "ott2");
        // the mrca carries a taxon, so nearest_taxon is omitted
        assert!(v["nearest_taxon"].is_null());
        let ids = vec!["ott3".into(), "ott6".into()];
        let v = service.mrca(None, &ids, &[], false).unwrap();
        assert_eq!(v["mrca"]["node_id"], "ott1");
        // an mrca without its own taxon reports the nearest one
        let ids = vec!["ott3".into(), "ott4".into()];
        let v = service.mrca(None, &ids, &[], false).unwrap();
        assert_eq!(v["mrca"]["node_id"], "mrcaott3ott4");
        assert_eq!(v["nearest_taxon"]["name"], "Mammalia");
    }

    #[test]
    fn test_mrca_broken_id_succeeds() {
        let service = sample_service();
        // scenario: mrca([ott99, ott5]) uses the broken taxon's stand-in
        let ids = vec!["ott99".into(), "ott5".into()];
        let v = service.mrca(None, &ids, &[], false).unwrap();
        assert_eq!(v["mrca"]["node_id"], "ott2");
        assert_eq!(v["broken"]["ott99"], "mrcaott3ott4");
    }

    #[test]
    fn test_mrca_with_exclusions() {
        let service = sample_service();
        let ids = vec!["ott3".into(), "ott4".into()];
        let excluded = vec!["ott6".into()];
        let v = service.mrca(None, &ids, &excluded, false).unwrap();
        // the chain runs from the mrca up to (not including) the closest
        // excluded ancestor
        let chain = v["node_ids"].as_array().unwrap();
        assert_eq!(chain[0], "mrcaott3ott4");
        assert_eq!(chain[1], "ott2");
        assert_eq!(chain.len(), 2);
        // an excluded node inside the include group is a reversal
        let excluded = vec!["ott3".into()];
        assert!(service.mrca(None, &ids, &excluded, false).is_err());
        let v = service.mrca(None, &ids, &excluded, true);
        // soft exclusion with nothing left outside also fails
        assert!(v.is_err());
    }

    #[test]
    fn test_subtree_newick_label_formats() {
        let service = sample_service();
        let v = service
            .subtree_newick(None, "ott2", LabelFormat::IdOnly, -1, true)
            .unwrap();
        assert_eq!(v["newick"], "((ott3,ott4)mrcaott3ott4,ott5)ott2;");
        let v = service
            .subtree_newick(None, "ott2", LabelFormat::NameOnly, -1, false)
            .unwrap();
        assert_eq!(v["newick"], "((Homo,Pan),Mus)Mammalia;");
        let v = service
            .subtree_newick(None, "ott2", LabelFormat::NameAndId, -1, true)
            .unwrap();
        assert_eq!(
            v["newick"],
            "(('Homo ott3','Pan ott4')mrcaott3ott4,'Mus ott5')'Mammalia ott2';"
        );
        let studies = v["supporting_studies"].as_array().unwrap();
        assert!(studies.contains(&json!("ot_100@tree1")));
    }

    #[test]
    fn test_subtree_broken_root_fails_with_payload() {
        let service = sample_service();
        let err = service
            .subtree_newick(None, "ott99", LabelFormat::IdOnly, -1, false)
            .unwrap_err();
        let j = err.to_json();
        assert_eq!(j["reason"], "broken");
        assert_eq!(j["broken"]["mrca"], "mrcaott3ott4");
        assert!(j["broken"]["contesting_trees"]["tree5"].is_object());
    }

    #[test]
    fn test_subtree_arguson() {
        let service = sample_service();
        let v = service.subtree_arguson(None, "mrcaott3ott4", 3).unwrap();
        let a = &v["arguson"];
        assert_eq!(a["node_id"], "mrcaott3ott4");
        assert_eq!(a["extinct"], false);
        assert_eq!(
            a["descendant_name_list"],
            json!(["Homo", "Pan"])
        );
        assert_eq!(a["children"].as_array().unwrap().len(), 2);
        let lineage = a["lineage"].as_array().unwrap();
        assert_eq!(lineage[0]["node_id"], "ott2");
        assert_eq!(lineage[1]["node_id"], "ott1");
    }

    #[test]
    fn test_induced_subtree() {
        let service = sample_service();
        let ids = vec!["ott3".into(), "ott6".into()];
        let v = service
            .induced_subtree(None, &ids, LabelFormat::IdOnly)
            .unwrap();
        assert_eq!(v["newick"], "(((ott3)mrcaott3ott4)ott2,ott6)ott1;");
    }

    #[test]
    fn test_taxonomy_endpoints() {
        let service = sample_service();
        let v = service.taxonomy_about().unwrap();
        assert_eq!(v["source"], "ott3.3draft1");
        assert_eq!(v["version"], "3.3");

        let v = service
            .taxon_info(Some(2), None, true, true, true)
            .unwrap();
        assert_eq!(v["name"], "Mammalia");
        assert_eq!(v["lineage"].as_array().unwrap().len(), 1);
        assert_eq!(v["children"].as_array().unwrap().len(), 3);
        let mut tips = v["terminal_descendants"]
            .as_array()
            .unwrap()
            .iter()
            .map(|x| x.as_u64().unwrap())
            .collect::<Vec<_>>();
        tips.sort();
        assert_eq!(tips, vec![3, 4, 5]);

        // source-id addressing and argument conflicts
        let v = service
            .taxon_info(None, Some("ncbi:10088"), false, false, false)
            .unwrap();
        assert_eq!(v["name"], "Mus");
        assert!(matches!(
            service.taxon_info(Some(2), Some("ncbi:10088"), false, false, false),
            Err(Error::Conflict { .. })
        ));

        let v = service.taxonomy_mrca(&[3, 4, 5]).unwrap();
        assert_eq!(v["mrca"]["ott_id"], 2);

        let v = service
            .taxonomy_subtree(Some(2), None, LabelFormat::NameOnly)
            .unwrap();
        assert_eq!(v["newick"], "(Homo,Pan,Mus)Mammalia;");
    }

    #[test]
    fn test_taxonomy_flags_counts() {
        let service = sample_service();
        let v = service.taxonomy_flags().unwrap();
        // every flag is present, almost all zero in this fixture
        assert_eq!(v["extinct"], 0);
        assert_eq!(v.as_object().unwrap().len(), 32);
    }

    #[test]
    fn test_add_taxon_patch_refreshes_index() {
        let service = sample_service();
        let v = service
            .add_taxa(&[json!({
                "name": "Rattus",
                "ott_id": 7,
                "parent": 2,
                "rank": "genus",
            })])
            .unwrap();
        assert_eq!(v["added"], 1);
        // the rebuilt name index sees the new taxon immediately
        let v = service
            .tnrs_autocomplete_name("Rattus", "All life", false)
            .unwrap();
        assert_eq!(v[0]["ott_id"], 7);
        let v = service.taxonomy_mrca(&[7, 3]).unwrap();
        assert_eq!(v["mrca"]["ott_id"], 2);
        // a duplicate id reports the count added so far
        let err = service
            .add_taxa(&[json!({
                "name": "Rattus",
                "ott_id": 7,
                "parent": 2,
                "rank": "genus",
            })])
            .unwrap_err();
        assert_eq!(err.to_json()["added"], 0);
    }

    #[test]
    fn test_conflict_status_endpoint() {
        let service = sample_service();
        let v = service
            .conflict_status(
                "((Homo_ott3,Mus_ott5)node1,(Pan_ott4,Aves_ott6)node2)node0;",
                "synth",
            )
            .unwrap();
        // {Homo, Mus} cuts across the summary's {Homo, Pan} grouping
        assert_eq!(v["node1"]["status"], "conflicts_with");
        assert!(v["node1"]["witness"]
            .as_array()
            .unwrap()
            .contains(&json!("mrcaott3ott4")));
        assert_eq!(v["node0"]["status"], "supported_by");
        let v = service
            .conflict_status("((Homo_ott3,Pan_ott4)node1,Mus_ott5)node0;", "ott")
            .unwrap();
        assert_eq!(v["node1"]["status"], "partial_path_of");
        assert!(service.conflict_status("(a,b)c;", "bogus").is_err());
    }

    #[test]
    fn test_tnrs_round_trip_through_service() {
        let service = sample_service();
        let v = service
            .tnrs_match_names(&["Homo".into()], None, false, false)
            .unwrap();
        assert_eq!(v["results"][0]["matches"][0]["taxon"]["ott_id"], 3);
        let v = service.tnrs_contexts().unwrap();
        assert!(v["LIFE"].is_array());
        let v = service.tnrs_infer_context(&["Homo".into()]).unwrap();
        assert_eq!(v["context_name"], "All life");
    }
}
