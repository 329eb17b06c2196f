//! Pairing a user-supplied phylogeny against a reference tree: induced
//! subtrees and the per-node conflict classification.
//!
//! The reference is either the taxonomy or a summary tree. The query is
//! preprocessed (unmapped, duplicate and ancestral tips dropped, higher
//! taxa optionally expanded against the summary), both trees are
//! contracted to their shared tip set, and every internal node of the
//! induced query tree is classified as supported_by, partial_path_of,
//! resolved_by, conflicts_with or terminal.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::formats::newick::{parse_newick, ParsedNode, source_node_name};
use crate::synth::{SummaryTree, SynthNodeIx};
use crate::taxonomy::{OttId, TaxonIx, Taxonomy};
use crate::{Error, Result};

/// A rooted, mutable query tree in arena form. Pruned nodes stay in the
/// arena but are detached from the topology; every traversal starts at
/// the root.
pub struct QueryTree {
    nodes: Vec<ParsedNode>,
    root: usize,
}

impl QueryTree {
    pub fn from_newick(newick: &str) -> Result<QueryTree> {
        let parsed = parse_newick(newick)?;
        Ok(QueryTree {
            nodes: parsed.nodes,
            root: 0,
        })
    }

    pub fn node(&self, ix: usize) -> &ParsedNode {
        &self.nodes[ix]
    }

    pub fn root(&self) -> usize {
        self.root
    }

    fn preorder(&self) -> Vec<usize> {
        let mut order = Vec::new();
        let mut stack = vec![self.root];
        while let Some(ix) = stack.pop() {
            order.push(ix);
            for &c in self.nodes[ix].children.iter().rev() {
                stack.push(c);
            }
        }
        order
    }

    fn postorder(&self) -> Vec<usize> {
        let mut order = self.preorder();
        order.reverse();
        order
    }

    pub fn leaves(&self) -> Vec<usize> {
        self.preorder()
            .into_iter()
            .filter(|&ix| self.nodes[ix].children.is_empty())
            .collect()
    }

    fn detach(&mut self, ix: usize) {
        if let Some(p) = self.nodes[ix].parent {
            self.nodes[p].children.retain(|&c| c != ix);
        }
        self.nodes[ix].parent = None;
    }

    /// Remove a tip; ancestors left childless go with it.
    fn prune_tip_and_bare_ancestors(&mut self, tip: usize) {
        let mut cur = tip;
        loop {
            let parent = self.nodes[cur].parent;
            self.detach(cur);
            match parent {
                Some(p) if self.nodes[p].children.is_empty() && p != self.root => cur = p,
                _ => break,
            }
        }
    }

    fn add_child(&mut self, parent: usize, name: String, ott_id: Option<OttId>) -> usize {
        let ix = self.nodes.len();
        self.nodes.push(ParsedNode {
            name,
            ott_id,
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent].children.push(ix);
        ix
    }
}

/// Traversal intervals for the (possibly pruned) query tree, computed
/// after preprocessing so the induced-tree machinery can treat the query
/// like any other reference.
struct QueryIndex {
    trav_enter: Vec<u32>,
    trav_exit: Vec<u32>,
    depth: Vec<u32>,
}

impl QueryIndex {
    fn compute(tree: &QueryTree) -> QueryIndex {
        let n = tree.nodes.len();
        let mut ix = QueryIndex {
            trav_enter: vec![u32::MAX; n],
            trav_exit: vec![0; n],
            depth: vec![0; n],
        };
        let mut counter = 0u32;
        let mut stack: Vec<(usize, usize)> = vec![(tree.root, 0)];
        ix.trav_enter[tree.root] = 0;
        while let Some((node, child_pos)) = stack.pop() {
            if child_pos < tree.nodes[node].children.len() {
                let child = tree.nodes[node].children[child_pos];
                stack.push((node, child_pos + 1));
                counter += 1;
                ix.trav_enter[child] = counter;
                ix.depth[child] = ix.depth[node] + 1;
                stack.push((child, 0));
            } else {
                ix.trav_exit[node] = counter;
            }
        }
        ix
    }
}

/// Uniform view of a tree the induced-subtree builder can contract.
trait InducedSource {
    fn mrca(&self, a: usize, b: usize) -> usize;
    fn trav_enter(&self, n: usize) -> u32;
    fn is_ancestor(&self, anc: usize, des: usize) -> bool;
    fn label(&self, n: usize) -> String;
    fn ott_id(&self, n: usize) -> Option<OttId>;
}

/// The reference side of a conflict analysis.
pub enum RefTree<'a> {
    Taxonomy(&'a Taxonomy),
    Summary(&'a SummaryTree),
}

impl<'a> RefTree<'a> {
    fn node_by_ott_id(&self, id: OttId) -> Option<usize> {
        match self {
            RefTree::Taxonomy(tax) => tax.taxon_ix_from_id(id),
            RefTree::Summary(tree) => tree.node_by_ott_id(id),
        }
    }
}

impl<'a> InducedSource for RefTree<'a> {
    fn mrca(&self, a: usize, b: usize) -> usize {
        match self {
            RefTree::Taxonomy(tax) => tax.mrca(a as TaxonIx, b as TaxonIx),
            RefTree::Summary(tree) => tree.mrca(a as SynthNodeIx, b as SynthNodeIx),
        }
    }

    fn trav_enter(&self, n: usize) -> u32 {
        match self {
            RefTree::Taxonomy(tax) => tax.taxon(n).trav_enter,
            RefTree::Summary(tree) => tree.node(n).trav_enter,
        }
    }

    fn is_ancestor(&self, anc: usize, des: usize) -> bool {
        match self {
            RefTree::Taxonomy(tax) => tax.is_ancestor_of(anc, des),
            RefTree::Summary(tree) => tree.is_ancestor_of(anc, des),
        }
    }

    fn label(&self, n: usize) -> String {
        match self {
            RefTree::Taxonomy(tax) => format!("ott{}", tax.taxon(n).id),
            RefTree::Summary(tree) => tree.node_id_str(n),
        }
    }

    fn ott_id(&self, n: usize) -> Option<OttId> {
        match self {
            RefTree::Taxonomy(tax) => Some(tax.taxon(n).id),
            RefTree::Summary(tree) => tree.node(n).ott_id,
        }
    }
}

struct IndexedQuery<'a> {
    tree: &'a QueryTree,
    index: &'a QueryIndex,
}

impl<'a> InducedSource for IndexedQuery<'a> {
    fn mrca(&self, a: usize, b: usize) -> usize {
        let (mut anc, des) = if self.index.depth[a] <= self.index.depth[b] {
            (a, b)
        } else {
            (b, a)
        };
        while !self.is_ancestor(anc, des) {
            anc = self.tree.nodes[anc]
                .parent
                .expect("query mrca walk ran past the root");
        }
        anc
    }

    fn trav_enter(&self, n: usize) -> u32 {
        self.index.trav_enter[n]
    }

    fn is_ancestor(&self, anc: usize, des: usize) -> bool {
        let q = self.index.trav_enter[des];
        self.index.trav_enter[anc] <= q && q <= self.index.trav_exit[anc]
    }

    fn label(&self, n: usize) -> String {
        self.tree.nodes[n].name.clone()
    }

    fn ott_id(&self, n: usize) -> Option<OttId> {
        self.tree.nodes[n].ott_id
    }
}

#[derive(Debug)]
struct InducedNode {
    label: String,
    ott_id: Option<OttId>,
    source: usize,
    parent: Option<usize>,
    children: Vec<usize>,
    depth: u32,
}

/// A contracted tree: the member nodes plus the MRCAs needed to connect
/// them, degree-2 interior nodes suppressed.
struct InducedTree {
    nodes: Vec<InducedNode>,
    root: usize,
}

impl InducedTree {
    fn build<S: InducedSource>(source: &S, members: &[usize]) -> InducedTree {
        // member set plus consecutive-pair MRCAs, in traversal order
        let mut handles: Vec<usize> = members.to_vec();
        handles.sort_by_key(|&h| source.trav_enter(h));
        handles.dedup();
        let mut with_mrcas = handles.clone();
        for pair in handles.windows(2) {
            with_mrcas.push(source.mrca(pair[0], pair[1]));
        }
        with_mrcas.sort_by_key(|&h| source.trav_enter(h));
        with_mrcas.dedup();

        // ancestors precede descendants in traversal order, so a stack
        // walk links each node under its nearest included ancestor
        let mut nodes: Vec<InducedNode> = Vec::with_capacity(with_mrcas.len());
        let mut handle_to_ix: HashMap<usize, usize> = HashMap::new();
        let mut stack: Vec<usize> = Vec::new();
        for handle in with_mrcas {
            while let Some(&top) = stack.last() {
                if source.is_ancestor(nodes[handle_to_ix[&top]].source, handle) {
                    break;
                }
                stack.pop();
            }
            let parent = stack.last().map(|&h| handle_to_ix[&h]);
            let ix = nodes.len();
            nodes.push(InducedNode {
                label: source.label(handle),
                ott_id: source.ott_id(handle),
                source: handle,
                parent,
                children: Vec::new(),
                depth: 0,
            });
            if let Some(p) = parent {
                nodes[p].children.push(ix);
            }
            handle_to_ix.insert(handle, ix);
            stack.push(handle);
        }
        let mut tree = InducedTree { nodes, root: 0 };
        tree.suppress_degree_two();
        tree.compute_depths();
        tree
    }

    fn suppress_degree_two(&mut self) {
        for ix in (0..self.nodes.len()).rev() {
            if ix == self.root || self.nodes[ix].children.len() != 1 {
                continue;
            }
            let child = self.nodes[ix].children[0];
            let parent = self.nodes[ix].parent.expect("non-root nodes have parents");
            self.nodes[child].parent = Some(parent);
            let slot = self.nodes[parent]
                .children
                .iter()
                .position(|&c| c == ix)
                .expect("child lists stay consistent");
            self.nodes[parent].children[slot] = child;
            self.nodes[ix].children.clear();
            self.nodes[ix].parent = None;
        }
    }

    fn compute_depths(&mut self) {
        let mut stack = vec![self.root];
        while let Some(ix) = stack.pop() {
            for &c in &self.nodes[ix].children {
                stack.push(c);
            }
            if let Some(p) = self.nodes[ix].parent {
                self.nodes[ix].depth = self.nodes[p].depth + 1;
            }
        }
    }

    fn live_preorder(&self) -> Vec<usize> {
        let mut order = Vec::new();
        let mut stack = vec![self.root];
        while let Some(ix) = stack.pop() {
            order.push(ix);
            stack.extend(self.nodes[ix].children.iter().copied());
        }
        order
    }

    fn is_leaf(&self, ix: usize) -> bool {
        self.nodes[ix].children.is_empty()
    }

    /// Descendant tip-id set per node, bottom-up.
    fn leaf_sets(&self) -> Vec<HashSet<OttId>> {
        let mut sets: Vec<HashSet<OttId>> = vec![HashSet::new(); self.nodes.len()];
        let mut order = self.live_preorder();
        order.reverse();
        for ix in order {
            if self.is_leaf(ix) {
                if let Some(id) = self.nodes[ix].ott_id {
                    sets[ix].insert(id);
                }
            } else {
                let mut merged = HashSet::new();
                for &c in &self.nodes[ix].children {
                    merged.extend(sets[c].iter().copied());
                }
                sets[ix] = merged;
            }
        }
        sets
    }
}

/// Drop tips with no OTT id or an id the taxonomy does not know, failing
/// if fewer than three mapped tips remain.
fn prune_unmapped_leaves(tree: &mut QueryTree, taxonomy: &Taxonomy) -> Result<()> {
    let mut mapped = 0usize;
    for leaf in tree.leaves() {
        let known = tree.nodes[leaf]
            .ott_id
            .and_then(|id| taxonomy.unforward_id(id));
        match known {
            Some(id) => {
                tree.nodes[leaf].ott_id = Some(id);
                mapped += 1;
            }
            None => tree.prune_tip_and_bare_ancestors(leaf),
        }
    }
    if mapped < 3 {
        return Err(Error::bad_request(format!(
            "query tree has only {} leaves with an ott id",
            mapped
        )));
    }
    Ok(())
}

fn check_all_nodes_named(tree: &QueryTree) -> Result<()> {
    for ix in tree.preorder() {
        if tree.nodes[ix].name.is_empty() {
            let mut msg = String::from("query tree has an unnamed node");
            if let Some(id) = tree.nodes[ix].ott_id {
                msg = format!("{} with ott id {}", msg, id);
            }
            return Err(Error::bad_request(msg));
        }
    }
    Ok(())
}

fn prune_duplicate_ott_ids(tree: &mut QueryTree) {
    let mut seen = HashSet::new();
    for leaf in tree.leaves() {
        let id = tree.nodes[leaf].ott_id.expect("unmapped leaves are gone");
        if !seen.insert(id) {
            tree.prune_tip_and_bare_ancestors(leaf);
        }
    }
}

/// Drop tips whose taxon is an ancestor of another tip's taxon. Sorted by
/// traversal entry, an ancestral tip is immediately followed by one of
/// its descendants.
fn prune_ancestral_leaves(tree: &mut QueryTree, taxonomy: &Taxonomy) {
    let leaves = tree.leaves();
    let mut placed: Vec<(u32, u32, usize)> = leaves
        .iter()
        .filter_map(|&l| {
            let id = tree.nodes[l].ott_id?;
            let taxon = taxonomy.taxon_from_id(id)?;
            Some((taxon.trav_enter, taxon.trav_exit, l))
        })
        .collect();
    placed.sort_unstable();
    for pair in placed.windows(2) {
        let (enter, exit, leaf) = pair[0];
        let (next_enter, _, _) = pair[1];
        if enter < next_enter && next_enter <= exit {
            tree.prune_tip_and_bare_ancestors(leaf);
        }
    }
}

/// For a higher-taxon tip missing from the summary tree, the smallest set
/// of descendant taxa that are present and jointly cover it.
fn extra_children_for_node(
    id: OttId,
    summary: &SummaryTree,
    taxonomy: &Taxonomy,
) -> Vec<OttId> {
    if summary.node_by_ott_id(id).is_some() {
        return Vec::new();
    }
    let start = match taxonomy.taxon_ix_from_id(id) {
        Some(ix) => ix,
        None => return Vec::new(),
    };
    let mut children = Vec::new();
    let mut frontier = vec![start];
    let mut fi = 0;
    while fi < frontier.len() {
        let parent = frontier[fi];
        fi += 1;
        for &c in taxonomy.children(parent) {
            let child_id = taxonomy.taxon(c).id;
            if summary.node_by_ott_id(child_id).is_some() {
                children.push(child_id);
            } else {
                frontier.push(c);
            }
        }
    }
    children
}

fn expand_higher_taxon_tips(tree: &mut QueryTree, summary: &SummaryTree, taxonomy: &Taxonomy) {
    let mut jobs: Vec<(usize, Vec<OttId>)> = Vec::new();
    for leaf in tree.leaves() {
        if let Some(id) = tree.nodes[leaf].ott_id {
            let extra = extra_children_for_node(id, summary, taxonomy);
            if !extra.is_empty() {
                jobs.push((leaf, extra));
            }
        }
    }
    for (leaf, child_ids) in jobs {
        for id in child_ids {
            // expansion children are unnamed; their parent reads as a
            // terminal tip of the original tree
            tree.add_child(leaf, String::new(), Some(id));
        }
    }
}

/// Run the full preprocessing pipeline on a parsed query tree. Pass the
/// summary tree when the reference is a synthesis so absent higher taxa
/// are expanded to their nearest present descendants.
pub fn prepare_query_tree(
    tree: &mut QueryTree,
    taxonomy: &Taxonomy,
    expand_against: Option<&SummaryTree>,
) -> Result<()> {
    prune_unmapped_leaves(tree, taxonomy)?;
    check_all_nodes_named(tree)?;
    prune_duplicate_ott_ids(tree);
    prune_ancestral_leaves(tree, taxonomy);
    if let Some(summary) = expand_against {
        expand_higher_taxon_tips(tree, summary, taxonomy);
    }
    Ok(())
}

/// One classified query node: the status plus its witnesses, each a
/// reference node id string with an optional taxon name.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeStatus {
    pub status: &'static str,
    pub witnesses: Vec<(String, Option<String>)>,
}

fn witness_entry(label: &str, taxonomy: &Taxonomy) -> (String, Option<String>) {
    let name = crate::formats::newick::ott_id_from_label(label)
        .and_then(|id| taxonomy.taxon_from_id(id))
        .map(|t| t.name.clone());
    (source_node_name(label).to_string(), name)
}

/// Classify every internal node of the induced query tree against the
/// reference. Keys are the query's node names (source-node names when the
/// labels embed them).
pub fn conflict_analysis(
    query: &QueryTree,
    reference: &RefTree<'_>,
    taxonomy: &Taxonomy,
) -> Result<BTreeMap<String, NodeStatus>> {
    // 1. image of the query tips in the reference
    let query_index = QueryIndex::compute(query);
    let indexed = IndexedQuery {
        tree: query,
        index: &query_index,
    };
    let mut image: Vec<usize> = Vec::new();
    for leaf in query.leaves() {
        let id = query.nodes[leaf].ott_id.expect("prepared trees map all tips");
        if let Some(h) = reference.node_by_ott_id(id) {
            image.push(h);
        }
    }
    if image.len() < 3 {
        return Err(Error::bad_request(format!(
            "only {} query tips are present in the reference tree",
            image.len()
        )));
    }

    // 2. induced reference tree; a query tip whose image is internal
    //    there is an ancestor of other tips and drops out
    let induced_ref = InducedTree::build(reference, &image);
    let mut ref_tip_by_id: HashMap<OttId, usize> = HashMap::new();
    for ix in induced_ref.live_preorder() {
        if induced_ref.is_leaf(ix) {
            if let Some(id) = induced_ref.nodes[ix].ott_id {
                ref_tip_by_id.insert(id, ix);
            }
        }
    }
    let surviving: Vec<usize> = query
        .leaves()
        .into_iter()
        .filter(|&l| {
            query.nodes[l]
                .ott_id
                .map(|id| ref_tip_by_id.contains_key(&id))
                .unwrap_or(false)
        })
        .collect();
    if surviving.len() < 3 {
        return Err(Error::bad_request(
            "fewer than three query tips survive the pairing with the reference",
        ));
    }

    // 3. induced query tree over the surviving tips
    let induced_query = InducedTree::build(&indexed, &surviving);

    // 4. classification
    let ref_sets = induced_ref.leaf_sets();
    let query_sets = induced_query.leaf_sets();
    let ref_order = induced_ref.live_preorder();
    let mut statuses: BTreeMap<String, NodeStatus> = BTreeMap::new();

    for v in induced_query.live_preorder() {
        if induced_query.is_leaf(v) {
            continue;
        }
        let c_set = &query_sets[v];
        // deepest reference node whose tips cover the query node's tips
        let some_id = c_set.iter().next().expect("internal nodes cover tips");
        let mut w = ref_tip_by_id[some_id];
        while !c_set.is_subset(&ref_sets[w]) {
            w = induced_ref.nodes[w]
                .parent
                .expect("the reference root covers every tip set");
        }

        let fake_tip = induced_query.nodes[v]
            .children
            .iter()
            .all(|&c| induced_query.nodes[c].label.is_empty());

        let status = if c_set.len() == ref_sets[w].len() {
            // identical tip sets: supported, unless the reference breaks
            // a polytomy into finer groups
            let child_sets: Vec<&HashSet<OttId>> = induced_query.nodes[v]
                .children
                .iter()
                .map(|&c| &query_sets[c])
                .collect();
            let mut resolver: Option<usize> = None;
            if child_sets.len() > 2 {
                let mut best_size = 0usize;
                for &u in &ref_order {
                    if u == w || induced_ref.is_leaf(u) {
                        continue;
                    }
                    if !is_strictly_below(&induced_ref, w, u) {
                        continue;
                    }
                    let d = &ref_sets[u];
                    if d.len() >= c_set.len() || !d.is_subset(c_set) {
                        continue;
                    }
                    let mut whole = 0usize;
                    let mut compatible = true;
                    for cs in &child_sets {
                        if cs.is_subset(d) {
                            whole += 1;
                        } else if cs.iter().any(|id| d.contains(id)) {
                            compatible = false;
                            break;
                        }
                    }
                    if compatible && whole >= 2 && d.len() > best_size {
                        best_size = d.len();
                        resolver = Some(u);
                    }
                }
            }
            match resolver {
                Some(u) => NodeStatus {
                    status: "resolved_by",
                    witnesses: vec![witness_entry(&induced_ref.nodes[u].label, taxonomy)],
                },
                None if fake_tip => NodeStatus {
                    status: "terminal",
                    witnesses: vec![witness_entry(&induced_ref.nodes[w].label, taxonomy)],
                },
                None => NodeStatus {
                    status: "supported_by",
                    witnesses: vec![witness_entry(&induced_ref.nodes[w].label, taxonomy)],
                },
            }
        } else {
            // strict superset: either some reference group cuts across
            // this node, or the reference simply has not resolved it
            let mut conflicting: Vec<usize> = Vec::new();
            let mut min_depth = u32::MAX;
            for &u in &ref_order {
                if u == w || induced_ref.is_leaf(u) {
                    continue;
                }
                if !is_strictly_below(&induced_ref, w, u) {
                    continue;
                }
                let d = &ref_sets[u];
                let overlaps = d.iter().any(|id| c_set.contains(id));
                if !overlaps || c_set.is_subset(d) || d.is_subset(c_set) {
                    continue;
                }
                // keep only the rootward-most conflicting witnesses
                let depth = induced_ref.nodes[u].depth;
                if depth < min_depth {
                    conflicting.clear();
                    min_depth = depth;
                }
                if depth == min_depth {
                    conflicting.push(u);
                }
            }
            if conflicting.is_empty() {
                NodeStatus {
                    status: if fake_tip { "terminal" } else { "partial_path_of" },
                    witnesses: vec![witness_entry(&induced_ref.nodes[w].label, taxonomy)],
                }
            } else {
                NodeStatus {
                    status: "conflicts_with",
                    witnesses: conflicting
                        .into_iter()
                        .map(|u| witness_entry(&induced_ref.nodes[u].label, taxonomy))
                        .collect(),
                }
            }
        };
        statuses.insert(
            source_node_name(&induced_query.nodes[v].label).to_string(),
            status,
        );
    }

    // 5. monotypic query nodes copy their child's annotation
    for ix in query.postorder() {
        if query.nodes[ix].children.len() == 1 {
            let child = query.nodes[ix].children[0];
            let child_key = source_node_name(&query.nodes[child].name).to_string();
            if let Some(s) = statuses.get(&child_key).cloned() {
                statuses.insert(source_node_name(&query.nodes[ix].name).to_string(), s);
            }
        }
    }

    Ok(statuses)
}

fn is_strictly_below(tree: &InducedTree, anc: usize, node: usize) -> bool {
    let mut cur = tree.nodes[node].parent;
    while let Some(p) = cur {
        if p == anc {
            return true;
        }
        cur = tree.nodes[p].parent;
    }
    false
}

/// Parse, preprocess and classify a newick query tree against the chosen
/// reference in one step.
pub fn conflict_with_reference(
    query_newick: &str,
    reference: &RefTree<'_>,
    taxonomy: &Taxonomy,
) -> Result<BTreeMap<String, NodeStatus>> {
    let mut query = QueryTree::from_newick(query_newick)?;
    let expand = match reference {
        RefTree::Summary(s) => Some(*s),
        RefTree::Taxonomy(_) => None,
    };
    prepare_query_tree(&mut query, taxonomy, expand)?;
    conflict_analysis(&query, reference, taxonomy)
}
