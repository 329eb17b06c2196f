//! The summary-tree store: the synthetic phylogeny, its per-node source
//! mappings, and the side tables describing taxa the synthesis broke.
//!
//! A summary tree is loaded once from its directory (tree newick,
//! annotations, broken taxa, contesting trees) and never mutated. Node
//! annotations reference source studies through a dense interning table so
//! each node carries `(kind, u32)` pairs instead of strings.

use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;
use smallvec::SmallVec;
use tracing::warn;

use crate::formats::newick::{parse_newick, ParsedTree};
use crate::taxonomy::{OttId, Taxonomy};
use crate::{Error, Result};

pub type SynthNodeIx = usize;

/// How a source-study edge relates to a summary-tree node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MappingKind {
    ConflictsWith,
    PartialPathOf,
    Resolves,
    SupportedBy,
    Terminal,
}

impl MappingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MappingKind::ConflictsWith => "conflicts_with",
            MappingKind::PartialPathOf => "partial_path_of",
            MappingKind::Resolves => "resolves",
            MappingKind::SupportedBy => "supported_by",
            MappingKind::Terminal => "terminal",
        }
    }

    /// `conflicts_with` may carry several nodes per source study; the rest
    /// are single-valued.
    pub fn is_multivalued(self) -> bool {
        self == MappingKind::ConflictsWith
    }
}

/// Interns `(study id, node id)` pairs to dense indices shared by every
/// registered tree. Mutated only while trees are being registered.
#[derive(Default)]
pub struct StudyNodeInterner {
    pairs: Vec<(String, String)>,
    lookup: HashMap<(String, String), u32>,
}

impl StudyNodeInterner {
    pub fn new() -> Self {
        StudyNodeInterner::default()
    }

    pub fn intern(&mut self, study: &str, node: &str) -> u32 {
        if let Some(&ix) = self.lookup.get(&(study.to_string(), node.to_string())) {
            return ix;
        }
        let ix = self.pairs.len() as u32;
        self.pairs.push((study.to_string(), node.to_string()));
        self.lookup
            .insert((study.to_string(), node.to_string()), ix);
        ix
    }

    /// (study id, node id) for an interned index.
    pub fn decode(&self, ix: u32) -> (&str, &str) {
        let (s, n) = &self.pairs[ix as usize];
        (s, n)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct SynthNode {
    /// Synthesized name (`mrcaott…ott…`) when the node carries no OTT id,
    /// empty otherwise.
    pub name: String,
    pub ott_id: Option<OttId>,
    pub parent: Option<SynthNodeIx>,
    pub(crate) children: Vec<SynthNodeIx>,
    pub trav_enter: u32,
    pub trav_exit: u32,
    pub depth: u32,
    /// Tips in this subtree; 1 for a tip itself.
    pub num_tips: u32,
    /// All descendants (and the node itself) are extinct.
    pub extinct: bool,
    pub was_uncontested: bool,
    pub source_edges: SmallVec<[(MappingKind, u32); 4]>,
}

impl SynthNode {
    pub fn is_tip(&self) -> bool {
        self.children.is_empty()
    }

    fn mappings_of(&self, kind: MappingKind) -> impl Iterator<Item = u32> + '_ {
        self.source_edges
            .iter()
            .filter(move |(k, _)| *k == kind)
            .map(|&(_, ix)| ix)
    }

    pub fn supported_by(&self) -> impl Iterator<Item = u32> + '_ {
        self.mappings_of(MappingKind::SupportedBy)
    }

    pub fn conflicts_with(&self) -> impl Iterator<Item = u32> + '_ {
        self.mappings_of(MappingKind::ConflictsWith)
    }

    pub fn partial_path_of(&self) -> impl Iterator<Item = u32> + '_ {
        self.mappings_of(MappingKind::PartialPathOf)
    }

    pub fn resolves(&self) -> impl Iterator<Item = u32> + '_ {
        self.mappings_of(MappingKind::Resolves)
    }

    pub fn terminal(&self) -> impl Iterator<Item = u32> + '_ {
        self.mappings_of(MappingKind::Terminal)
    }
}

/// A taxon whose group was not recovered: its stand-in MRCA plus the nodes
/// its members attach to.
#[derive(Clone, Debug)]
pub struct BrokenTaxon {
    pub mrca: SynthNodeIx,
    pub attachments: Vec<SynthNodeIx>,
}

#[derive(Clone, Debug)]
pub struct AttachmentPoint {
    pub parent: String,
    pub children_from_taxon: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct ContestingTree {
    pub tree: String,
    pub attachment_points: Vec<AttachmentPoint>,
}

pub struct SummaryTree {
    nodes: Vec<SynthNode>,
    root: SynthNodeIx,
    id_to_node: HashMap<OttId, SynthNodeIx>,
    broken_name_to_node: HashMap<String, SynthNodeIx>,
    broken_taxa: HashMap<String, BrokenTaxon>,
    contesting: HashMap<String, Vec<ContestingTree>>,
}

impl SummaryTree {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn root(&self) -> SynthNodeIx {
        self.root
    }

    pub fn node(&self, ix: SynthNodeIx) -> &SynthNode {
        &self.nodes[ix]
    }

    pub fn children(&self, ix: SynthNodeIx) -> &[SynthNodeIx] {
        &self.nodes[ix].children
    }

    pub fn node_by_ott_id(&self, id: OttId) -> Option<SynthNodeIx> {
        self.id_to_node.get(&id).copied()
    }

    pub fn node_by_broken_name(&self, name: &str) -> Option<SynthNodeIx> {
        self.broken_name_to_node.get(name).copied()
    }

    pub fn broken_taxon(&self, id_str: &str) -> Option<&BrokenTaxon> {
        self.broken_taxa.get(id_str)
    }

    pub fn contesting_trees(&self, id_str: &str) -> Option<&[ContestingTree]> {
        self.contesting.get(id_str).map(|v| v.as_slice())
    }

    /// `ott<id>` when the node maps to a taxon, its synthesized name
    /// otherwise.
    pub fn node_id_str(&self, ix: SynthNodeIx) -> String {
        match self.nodes[ix].ott_id {
            Some(id) => format!("ott{}", id),
            None => self.nodes[ix].name.clone(),
        }
    }

    pub fn is_ancestor_of(&self, anc: SynthNodeIx, des: SynthNodeIx) -> bool {
        let a = &self.nodes[anc];
        let q = self.nodes[des].trav_enter;
        a.trav_enter <= q && q <= a.trav_exit
    }

    pub fn mrca(&self, a: SynthNodeIx, b: SynthNodeIx) -> SynthNodeIx {
        let (mut anc, des) = if self.nodes[a].depth <= self.nodes[b].depth {
            (a, b)
        } else {
            (b, a)
        };
        while !self.is_ancestor_of(anc, des) {
            anc = self.nodes[anc]
                .parent
                .expect("walk reached the root without covering the query interval");
        }
        anc
    }

    pub fn mrca_of_set(&self, ixs: &[SynthNodeIx]) -> Option<SynthNodeIx> {
        let mut it = ixs.iter();
        let mut focal = *it.next()?;
        for &ix in it {
            focal = self.mrca(focal, ix);
        }
        Some(focal)
    }

    pub fn ancestors(&self, ix: SynthNodeIx) -> SynthAncestors<'_> {
        SynthAncestors {
            tree: self,
            cur: self.nodes[ix].parent,
        }
    }

    fn from_parsed(parsed: ParsedTree) -> Result<SummaryTree> {
        if parsed.nodes.is_empty() {
            return Err(Error::bad_request("summary tree is empty"));
        }
        let mut nodes: Vec<SynthNode> = parsed
            .nodes
            .iter()
            .map(|p| SynthNode {
                name: if p.ott_id.is_some() {
                    String::new()
                } else {
                    p.name.clone()
                },
                ott_id: p.ott_id,
                parent: p.parent,
                children: p.children.clone(),
                trav_enter: 0,
                trav_exit: 0,
                depth: 0,
                num_tips: 0,
                extinct: false,
                was_uncontested: false,
                source_edges: SmallVec::new(),
            })
            .collect();

        // one pre-order walk assigns trav indices and depth
        let mut counter: u32 = 0;
        let mut stack: Vec<(SynthNodeIx, usize)> = vec![(ParsedTree::ROOT, 0)];
        while let Some((ix, child_pos)) = stack.pop() {
            if child_pos == 0 {
                nodes[ix].trav_enter = counter;
            }
            if child_pos < nodes[ix].children.len() {
                let child = nodes[ix].children[child_pos];
                stack.push((ix, child_pos + 1));
                counter += 1;
                nodes[child].depth = nodes[ix].depth + 1;
                stack.push((child, 0));
            } else {
                nodes[ix].trav_exit = counter;
            }
        }

        // post-order over indices: children always follow parents in the
        // parsed arena, so a reverse scan visits children first
        for ix in (0..nodes.len()).rev() {
            if nodes[ix].is_tip() {
                nodes[ix].num_tips = 1;
            } else {
                let sum: u32 = nodes[ix].children.iter().map(|&c| nodes[c].num_tips).sum();
                nodes[ix].num_tips = sum;
            }
        }

        let mut id_to_node = HashMap::new();
        let mut broken_name_to_node = HashMap::new();
        for (ix, node) in nodes.iter().enumerate() {
            match node.ott_id {
                Some(id) => {
                    if id_to_node.insert(id, ix).is_some() {
                        return Err(Error::bad_request(format!(
                            "ott id {} appears twice in the summary tree",
                            id
                        )));
                    }
                }
                None => {
                    if node.name.is_empty() {
                        return Err(Error::bad_request(
                            "summary tree node carries neither an ott id nor a name",
                        ));
                    }
                    broken_name_to_node.insert(node.name.clone(), ix);
                }
            }
        }

        Ok(SummaryTree {
            nodes,
            root: ParsedTree::ROOT,
            id_to_node,
            broken_name_to_node,
            broken_taxa: HashMap::new(),
            contesting: HashMap::new(),
        })
    }

    /// Resolve an annotation/broken-taxa key against the loaded topology.
    fn node_for_key(&self, key: &str) -> Option<SynthNodeIx> {
        if let Some(id) = crate::formats::newick::ott_id_from_label(key) {
            return self.node_by_ott_id(id);
        }
        self.broken_name_to_node.get(key).copied()
    }

    fn mark_extinct(&mut self, taxonomy: &Taxonomy) {
        for ix in (0..self.nodes.len()).rev() {
            let computed = if self.nodes[ix].is_tip() {
                match self.nodes[ix].ott_id.and_then(|id| taxonomy.taxon_from_id(id)) {
                    Some(taxon) => taxon.is_extinct(),
                    None => false,
                }
            } else {
                self.nodes[ix]
                    .children
                    .iter()
                    .all(|&c| self.nodes[c].extinct)
            };
            self.nodes[ix].extinct = computed;
            if !self.nodes[ix].is_tip() {
                if let Some(taxon) = self.nodes[ix].ott_id.and_then(|id| taxonomy.taxon_from_id(id))
                {
                    if taxon.is_extinct() != computed {
                        warn!(
                            "higher taxon {} is extinct={} in the taxonomy but computed \
                             extinctness is {}",
                            taxon.name,
                            taxon.is_extinct(),
                            computed
                        );
                    }
                }
            }
        }
    }
}

pub struct SynthAncestors<'t> {
    tree: &'t SummaryTree,
    cur: Option<SynthNodeIx>,
}

impl<'t> Iterator for SynthAncestors<'t> {
    type Item = SynthNodeIx;

    fn next(&mut self) -> Option<SynthNodeIx> {
        let ix = self.cur?;
        self.cur = self.tree.nodes[ix].parent;
        Some(ix)
    }
}

/// Metadata decoded from `annotations.json`.
#[derive(Clone, Debug, Default)]
pub struct SummaryTreeAnnotation {
    pub date_completed: String,
    pub filtered_flags: String,
    pub filtered_flags_vec: Vec<String>,
    pub generated_by: String,
    pub num_leaves_in_exemplified_taxonomy: u64,
    pub num_source_studies: u64,
    pub num_source_trees: u64,
    pub num_tips: u64,
    pub root_ott_id: OttId,
    pub root_taxon_name: String,
    pub synth_id: String,
    pub taxonomy_version: String,
    pub tree_id: String,
    pub source_id_map: Value,
    pub sources: Vec<String>,
}

fn extract_str(j: &Value, field: &str) -> Result<String> {
    j.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::bad_request(format!("missing or non-string \"{}\" field", field)))
}

fn extract_u64(j: &Value, field: &str) -> Result<u64> {
    j.get(field)
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::bad_request(format!("missing or non-integer \"{}\" field", field)))
}

impl SummaryTreeAnnotation {
    pub fn from_json(j: &Value) -> Result<SummaryTreeAnnotation> {
        let filtered_flags = extract_str(j, "filtered_flags")?;
        let filtered_flags_vec = filtered_flags
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let root_ott_id = extract_u64(j, "root_ott_id")?;
        let root_ott_id = OttId::try_from(root_ott_id)
            .map_err(|_| Error::bad_request("root_ott_id overflows the id width"))?;
        let sources = j
            .get("sources")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::bad_request("missing \"sources\" field"))?
            .iter()
            .map(|s| {
                s.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| Error::bad_request("sources entries must be strings"))
            })
            .collect::<Result<Vec<_>>>()?;
        let source_id_map = j
            .get("source_id_map")
            .filter(|v| v.is_object())
            .cloned()
            .ok_or_else(|| Error::bad_request("missing \"source_id_map\" field"))?;
        Ok(SummaryTreeAnnotation {
            date_completed: extract_str(j, "date_completed")?,
            filtered_flags,
            filtered_flags_vec,
            generated_by: j
                .get("generated_by")
                .map(|v| v.to_string())
                .unwrap_or_default(),
            num_leaves_in_exemplified_taxonomy: extract_u64(
                j,
                "num_leaves_in_exemplified_taxonomy",
            )
            .unwrap_or(0),
            num_source_studies: extract_u64(j, "num_source_studies")?,
            num_source_trees: extract_u64(j, "num_source_trees")?,
            num_tips: extract_u64(j, "num_tips")?,
            root_ott_id,
            root_taxon_name: extract_str(j, "root_taxon_name")?,
            synth_id: extract_str(j, "synth_id")?,
            taxonomy_version: extract_str(j, "taxonomy_version")?,
            tree_id: extract_str(j, "tree_id").unwrap_or_default(),
            source_id_map,
            sources,
        })
    }
}

/// Build a summary tree from its already-loaded pieces. The annotation
/// node mappings are interned through `interner`.
pub fn build_summary(
    newick: &str,
    taxonomy: &Taxonomy,
    annotations: &Value,
    broken_taxa_json: &Value,
    contesting_json: Option<&Value>,
    interner: &mut StudyNodeInterner,
) -> Result<(SummaryTree, SummaryTreeAnnotation)> {
    let mut tree = SummaryTree::from_parsed(parse_newick(newick)?)?;
    tree.mark_extinct(taxonomy);
    let annotation = SummaryTreeAnnotation::from_json(annotations)?;

    decode_node_annotations(&mut tree, annotations, interner)?;
    decode_broken_taxa(&mut tree, broken_taxa_json)?;
    if let Some(cj) = contesting_json {
        decode_contesting_trees(&mut tree, cj)?;
    }
    Ok((tree, annotation))
}

fn decode_node_annotations(
    tree: &mut SummaryTree,
    annotations: &Value,
    interner: &mut StudyNodeInterner,
) -> Result<()> {
    let node_obj = annotations
        .get("nodes")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::bad_request("annotations are missing the \"nodes\" object"))?;
    for (key, support) in node_obj {
        let ix = tree.node_for_key(key).ok_or_else(|| {
            Error::bad_request(format!("annotated node {} is not in the tree", key))
        })?;
        let support = support
            .as_object()
            .ok_or_else(|| Error::bad_request(format!("annotations for {} are not an object", key)))?;
        let mut edges: SmallVec<[(MappingKind, u32); 4]> = SmallVec::new();
        for (k, v) in support {
            let kind = match k.as_str() {
                "supported_by" => MappingKind::SupportedBy,
                "terminal" => MappingKind::Terminal,
                "conflicts_with" => MappingKind::ConflictsWith,
                "partial_path_of" => MappingKind::PartialPathOf,
                "resolves" => MappingKind::Resolves,
                "was_uncontested" => {
                    tree.nodes[ix].was_uncontested = v.as_bool().ok_or_else(|| {
                        Error::bad_request("expected was_uncontested to be a boolean")
                    })?;
                    continue;
                }
                "was_constrained" => continue,
                other => {
                    return Err(Error::bad_request(format!(
                        "unrecognized annotations key {}",
                        other
                    )))
                }
            };
            let per_study = v.as_object().ok_or_else(|| {
                Error::bad_request(format!("{} annotations for {} are not an object", k, key))
            })?;
            for (study, node_ids) in per_study {
                match node_ids {
                    Value::String(node_id) => {
                        edges.push((kind, interner.intern(study, node_id)));
                    }
                    Value::Array(ids) => {
                        for id in ids {
                            let node_id = id.as_str().ok_or_else(|| {
                                Error::bad_request("study node ids must be strings")
                            })?;
                            edges.push((kind, interner.intern(study, node_id)));
                        }
                    }
                    _ => {
                        return Err(Error::bad_request(
                            "study node ids must be a string or an array",
                        ))
                    }
                }
            }
        }
        tree.nodes[ix].source_edges = edges;
    }
    Ok(())
}

fn decode_broken_taxa(tree: &mut SummaryTree, broken_taxa_json: &Value) -> Result<()> {
    let nmt = match broken_taxa_json.get("non_monophyletic_taxa") {
        Some(v) if !v.is_null() => v
            .as_object()
            .ok_or_else(|| Error::bad_request("non_monophyletic_taxa is not an object"))?,
        _ => return Ok(()),
    };
    for (broken_ott, dest) in nmt {
        let mrca_id = extract_str(dest, "mrca")?;
        let mrca = tree.node_for_key(&mrca_id).ok_or_else(|| {
            Error::bad_request(format!("broken-taxon mrca {} is not in the tree", mrca_id))
        })?;
        let attach_obj = dest
            .get("attachment_points")
            .and_then(Value::as_object)
            .ok_or_else(|| Error::bad_request("broken taxon is missing attachment_points"))?;
        let mut attachments = Vec::with_capacity(attach_obj.len());
        for attach_id in attach_obj.keys() {
            match tree.node_for_key(attach_id) {
                Some(ix) => attachments.push(ix),
                None => warn!("attachment point {} is not in the tree", attach_id),
            }
        }
        tree.broken_taxa
            .insert(broken_ott.clone(), BrokenTaxon { mrca, attachments });
    }
    Ok(())
}

fn decode_contesting_trees(tree: &mut SummaryTree, contesting_json: &Value) -> Result<()> {
    let obj = match contesting_json.as_object() {
        Some(o) => o,
        None => return Ok(()),
    };
    for (taxon, trees) in obj {
        let trees_obj = trees
            .as_object()
            .ok_or_else(|| Error::bad_request("contesting-trees entry is not an object"))?;
        let mut contesting = Vec::with_capacity(trees_obj.len());
        for (tree_file, attachment_points_json) in trees_obj {
            let tree_name = tree_file.strip_suffix(".tre").unwrap_or(tree_file);
            let points_arr = attachment_points_json
                .as_array()
                .ok_or_else(|| Error::bad_request("attachment points are not an array"))?;
            let mut attachment_points = Vec::with_capacity(points_arr.len());
            for point in points_arr {
                let parent = extract_str(point, "parent")?;
                let parent =
                    crate::formats::newick::source_node_name(parent.trim()).to_string();
                let children = point
                    .get("children_from_taxon")
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        Error::bad_request("attachment point is missing children_from_taxon")
                    })?
                    .iter()
                    .map(|c| {
                        c.as_str()
                            .map(|s| {
                                crate::formats::newick::source_node_name(s.trim()).to_string()
                            })
                            .ok_or_else(|| {
                                Error::bad_request("children_from_taxon entries must be strings")
                            })
                    })
                    .collect::<Result<Vec<_>>>()?;
                attachment_points.push(AttachmentPoint {
                    parent,
                    children_from_taxon: children,
                });
            }
            contesting.push(ContestingTree {
                tree: tree_name.to_string(),
                attachment_points,
            });
        }
        tree.contesting.insert(taxon.clone(), contesting);
    }
    Ok(())
}

/// Load a summary tree from the standard directory layout:
/// `labelled_supertree/labelled_supertree.tre`,
/// `annotated_supertree/annotations.json`,
/// `labelled_supertree/broken_taxa.json` and (optionally)
/// `subproblems/contesting-trees.json`.
pub fn register_summary_dir(
    dir: &Path,
    taxonomy: &Taxonomy,
    interner: &mut StudyNodeInterner,
) -> Result<(SummaryTree, SummaryTreeAnnotation)> {
    let newick = std::fs::read_to_string(dir.join("labelled_supertree/labelled_supertree.tre"))?;
    let annotations: Value = serde_json::from_str(&std::fs::read_to_string(
        dir.join("annotated_supertree/annotations.json"),
    )?)?;
    let broken: Value = serde_json::from_str(&std::fs::read_to_string(
        dir.join("labelled_supertree/broken_taxa.json"),
    )?)?;
    let contesting_path = dir.join("subproblems/contesting-trees.json");
    let contesting: Option<Value> = match std::fs::read_to_string(&contesting_path) {
        Ok(s) => Some(serde_json::from_str(&s)?),
        Err(e) => {
            warn!(
                "could not read {} ({}); contesting-tree details will be absent",
                contesting_path.display(),
                e
            );
            None
        }
    };
    build_summary(
        &newick,
        taxonomy,
        &annotations,
        &broken,
        contesting.as_ref(),
        interner,
    )
}

/// The numeric version embedded in a synth id (`opentree13.4` -> [13, 4]).
fn synth_id_version(id: &str) -> Result<Vec<u64>> {
    let start = id
        .find(|c: char| c.is_ascii_digit())
        .ok_or_else(|| Error::bad_request(format!("synth id '{}' has no version number", id)))?;
    id[start..]
        .split('.')
        .map(|part| {
            part.parse::<u64>().map_err(|_| {
                Error::bad_request(format!("synth id '{}' has a malformed version", id))
            })
        })
        .collect()
}

/// Numeric comparison of two synth ids' embedded versions.
pub fn compare_synth_ids(a: &str, b: &str) -> Result<std::cmp::Ordering> {
    Ok(synth_id_version(a)?.cmp(&synth_id_version(b)?))
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::taxonomy::test::life_taxonomy;
    use serde_json::json;

    /// Summary tree over the life_taxonomy fixture: Mammalia is recovered,
    /// its genera hang off an unnamed mrca node.
    pub(crate) fn sample_summary_inputs() -> (String, Value, Value, Value) {
        let newick = "(((ott3,ott4)mrcaott3ott4,ott5)ott2,ott6)ott1;".to_string();
        let annotations = json!({
            "date_completed": "2025-05-01 12:00:00",
            "filtered_flags": "major_rank_conflict,barren",
            "generated_by": [{"name": "propinquity"}],
            "num_leaves_in_exemplified_taxonomy": 4,
            "num_source_studies": 2,
            "num_source_trees": 3,
            "num_tips": 4,
            "root_ott_id": 1,
            "root_taxon_name": "Life",
            "synth_id": "opentree13.4",
            "taxonomy_version": "3.3draft1",
            "tree_id": "opentree13.4_tree",
            "source_id_map": {
                "ot_100@tree1": {"git_sha": "abc", "study_id": "ot_100", "tree_id": "tree1"},
                "ot_200@tree2": {"git_sha": "def", "study_id": "ot_200", "tree_id": "tree2"}
            },
            "sources": ["ot_100@tree1", "ot_200@tree2"],
            "nodes": {
                "mrcaott3ott4": {
                    "supported_by": {"ot_100@tree1": "node7"},
                    "conflicts_with": {"ot_200@tree2": ["node3", "node9"]}
                },
                "ott2": {
                    "supported_by": {"ot_100@tree1": "node2"},
                    "was_uncontested": true
                },
                "ott5": {
                    "terminal": {"ot_200@tree2": "node12"}
                }
            }
        });
        let broken = json!({
            "non_monophyletic_taxa": {
                "ott99": {
                    "mrca": "mrcaott3ott4",
                    "attachment_points": {"ott3": [], "ott5": []}
                }
            }
        });
        let contesting = json!({
            "ott99": {
                "tree5.tre": [
                    {"parent": "Homo_node8_ott3", "children_from_taxon": ["node9 "]}
                ]
            }
        });
        (newick, annotations, broken, contesting)
    }

    pub(crate) fn sample_summary() -> (SummaryTree, SummaryTreeAnnotation, StudyNodeInterner) {
        let tax = life_taxonomy();
        let (newick, annotations, broken, contesting) = sample_summary_inputs();
        let mut interner = StudyNodeInterner::new();
        let (tree, sta) = build_summary(
            &newick,
            &tax,
            &annotations,
            &broken,
            Some(&contesting),
            &mut interner,
        )
        .unwrap();
        (tree, sta, interner)
    }

    #[test]
    fn test_topology_and_indices() {
        let (tree, _, _) = sample_summary();
        assert_eq!(tree.len(), 7);
        let root = tree.root();
        assert_eq!(tree.node(root).ott_id, Some(1));
        assert_eq!(tree.node(root).num_tips, 4);
        let mam = tree.node_by_ott_id(2).unwrap();
        assert_eq!(tree.node(mam).num_tips, 3);
        let homo = tree.node_by_ott_id(3).unwrap();
        assert_eq!(tree.node(homo).num_tips, 1);
        assert!(tree.is_ancestor_of(mam, homo));
        assert!(!tree.is_ancestor_of(homo, mam));
        let mrca_node = tree.node_by_broken_name("mrcaott3ott4").unwrap();
        assert_eq!(tree.node_id_str(mrca_node), "mrcaott3ott4");
    }

    #[test]
    fn test_mrca_via_traversal() {
        let (tree, _, _) = sample_summary();
        let homo = tree.node_by_ott_id(3).unwrap();
        let pan = tree.node_by_ott_id(4).unwrap();
        let mus = tree.node_by_ott_id(5).unwrap();
        let aves = tree.node_by_ott_id(6).unwrap();
        assert_eq!(
            tree.node_id_str(tree.mrca(homo, pan)),
            "mrcaott3ott4"
        );
        assert_eq!(tree.node_id_str(tree.mrca(homo, mus)), "ott2");
        assert_eq!(tree.node_id_str(tree.mrca(homo, aves)), "ott1");
        assert_eq!(tree.mrca_of_set(&[homo, pan, mus]).unwrap(), tree.node_by_ott_id(2).unwrap());
    }

    #[test]
    fn test_source_edge_mappings() {
        let (tree, _, interner) = sample_summary();
        let mrca_node = tree.node_by_broken_name("mrcaott3ott4").unwrap();
        let node = tree.node(mrca_node);
        let supp: Vec<_> = node.supported_by().collect();
        assert_eq!(supp.len(), 1);
        assert_eq!(interner.decode(supp[0]), ("ot_100@tree1", "node7"));
        assert_eq!(node.conflicts_with().count(), 2);
        assert_eq!(node.partial_path_of().count(), 0);
        let mam = tree.node_by_ott_id(2).unwrap();
        assert!(tree.node(mam).was_uncontested);
        // interning dedupes pairs across nodes
        assert_eq!(interner.len(), 5);
    }

    #[test]
    fn test_broken_and_contesting_tables() {
        let (tree, _, _) = sample_summary();
        let broken = tree.broken_taxon("ott99").unwrap();
        assert_eq!(tree.node_id_str(broken.mrca), "mrcaott3ott4");
        assert_eq!(broken.attachments.len(), 2);
        assert!(tree.broken_taxon("ott3").is_none());
        let contesting = tree.contesting_trees("ott99").unwrap();
        assert_eq!(contesting.len(), 1);
        assert_eq!(contesting[0].tree, "tree5");
        assert_eq!(contesting[0].attachment_points[0].parent, "node8");
        assert_eq!(
            contesting[0].attachment_points[0].children_from_taxon,
            vec!["node9"]
        );
    }

    #[test]
    fn test_annotation_decode() {
        let (_, sta, _) = sample_summary();
        assert_eq!(sta.synth_id, "opentree13.4");
        assert_eq!(sta.num_source_trees, 3);
        assert_eq!(
            sta.filtered_flags_vec,
            vec!["major_rank_conflict", "barren"]
        );
        assert_eq!(sta.root_ott_id, 1);
    }

    #[test]
    fn test_extinct_marks_bubble_up() {
        use crate::flags::TaxonFlag;
        use crate::rank::TaxRank;
        use crate::taxonomy::{TaxonRecord, TaxonomyBuilder};
        let tax = TaxonomyBuilder::new()
            .taxon(TaxonRecord {
                id: 1,
                parent_id: None,
                name: "root".into(),
                ..Default::default()
            })
            .taxon(TaxonRecord {
                id: 2,
                parent_id: Some(1),
                name: "Dodo".into(),
                rank: TaxRank::Genus,
                flags: TaxonFlag::Extinct.into(),
                ..Default::default()
            })
            .taxon(TaxonRecord {
                id: 3,
                parent_id: Some(1),
                name: "Raphus".into(),
                rank: TaxRank::Genus,
                flags: TaxonFlag::Extinct.into(),
                ..Default::default()
            })
            .taxon(TaxonRecord {
                id: 4,
                parent_id: Some(1),
                name: "Columba".into(),
                rank: TaxRank::Genus,
                ..Default::default()
            })
            .build()
            .unwrap();
        let mut interner = StudyNodeInterner::new();
        let annotations = json!({
            "date_completed": "x", "filtered_flags": "", "num_source_studies": 0,
            "num_source_trees": 0, "num_tips": 3, "root_ott_id": 1,
            "root_taxon_name": "root", "synth_id": "opentree1.0",
            "taxonomy_version": "3.3", "source_id_map": {}, "sources": [],
            "nodes": {}
        });
        let (tree, _) = build_summary(
            "((ott2,ott3)mrcaott2ott3,ott4)ott1;",
            &tax,
            &annotations,
            &json!({}),
            None,
            &mut interner,
        )
        .unwrap();
        let pair = tree.node_by_broken_name("mrcaott2ott3").unwrap();
        assert!(tree.node(pair).extinct);
        assert!(!tree.node(tree.root()).extinct);
        assert!(tree.node(tree.node_by_ott_id(2).unwrap()).extinct);
    }

    #[test]
    fn test_register_from_directory() -> crate::Result<()> {
        let tax = life_taxonomy();
        let (newick, annotations, broken, contesting) = sample_summary_inputs();
        let dir = tempfile::tempdir()?;
        let p = dir.path();
        std::fs::create_dir_all(p.join("labelled_supertree"))?;
        std::fs::create_dir_all(p.join("annotated_supertree"))?;
        std::fs::create_dir_all(p.join("subproblems"))?;
        std::fs::write(p.join("labelled_supertree/labelled_supertree.tre"), &newick)?;
        std::fs::write(
            p.join("annotated_supertree/annotations.json"),
            annotations.to_string(),
        )?;
        std::fs::write(
            p.join("labelled_supertree/broken_taxa.json"),
            broken.to_string(),
        )?;
        std::fs::write(
            p.join("subproblems/contesting-trees.json"),
            contesting.to_string(),
        )?;
        let mut interner = StudyNodeInterner::new();
        let (tree, sta) = register_summary_dir(p, &tax, &mut interner)?;
        assert_eq!(sta.synth_id, "opentree13.4");
        assert_eq!(tree.node(tree.root()).num_tips, 4);
        Ok(())
    }

    #[test]
    fn test_synth_id_comparison() -> crate::Result<()> {
        use std::cmp::Ordering;
        assert_eq!(
            compare_synth_ids("opentree13.4", "opentree13.4")?,
            Ordering::Equal
        );
        assert_eq!(
            compare_synth_ids("opentree9.1", "opentree13.4")?,
            Ordering::Less
        );
        assert_eq!(
            compare_synth_ids("opentree13.10", "opentree13.4")?,
            Ordering::Greater
        );
        assert!(compare_synth_ids("opentree", "opentree1.0").is_err());
        Ok(())
    }
}
