//! The arena-backed taxonomy store.
//!
//! The tree is a flat `Vec` of [`Taxon`] records plus lookup tables; every
//! cross-reference is an arena index, so the pointer-rich graph of the data
//! set collapses into a single owner. Ancestor tests and MRCA run in O(1)
//! on the traversal intervals assigned by one depth-first walk.

use std::collections::HashMap;

use smallvec::SmallVec;
use tracing::warn;

use crate::flags::{self, FlagSet, TaxonFlag};
use crate::rank::TaxRank;
use crate::{Error, Result};

/// A stable taxon identifier. The data set's ids fit in 32 bits; digit
/// strings that overflow this width are rejected as syntactically bad.
pub type OttId = u32;

/// Position of a taxon record in the arena.
pub type TaxonIx = usize;

/// Source databases a taxon can be cross-referenced to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SourceDb {
    Ncbi,
    Gbif,
    Worms,
    IndexFungorum,
    Irmng,
}

impl SourceDb {
    pub fn prefix(self) -> &'static str {
        match self {
            SourceDb::Ncbi => "ncbi",
            SourceDb::Gbif => "gbif",
            SourceDb::Worms => "worms",
            SourceDb::IndexFungorum => "if",
            SourceDb::Irmng => "irmng",
        }
    }

    pub fn from_prefix(s: &str) -> Option<SourceDb> {
        match s {
            "ncbi" => Some(SourceDb::Ncbi),
            "gbif" => Some(SourceDb::Gbif),
            "worms" => Some(SourceDb::Worms),
            "if" => Some(SourceDb::IndexFungorum),
            "irmng" => Some(SourceDb::Irmng),
            _ => None,
        }
    }
}

/// A junior synonym, owned by its accepted taxon's synonym list.
#[derive(Clone, Debug)]
pub struct Synonym {
    pub name: String,
    pub source_info: String,
    pub taxon: TaxonIx,
}

#[derive(Clone, Debug)]
pub struct Taxon {
    pub id: OttId,
    /// Canonical name; not necessarily unique across the taxonomy.
    pub name: String,
    /// Canonical name plus a disambiguating suffix when homonyms exist.
    pub unique_name: String,
    pub rank: TaxRank,
    pub flags: FlagSet,
    pub sources: Vec<(SourceDb, String)>,
    pub parent: Option<TaxonIx>,
    pub(crate) children: Vec<TaxonIx>,
    pub(crate) synonyms: Vec<usize>,
    pub trav_enter: u32,
    pub trav_exit: u32,
    pub depth: u32,
}

impl Taxon {
    pub fn is_extinct(&self) -> bool {
        self.flags
            .intersects(TaxonFlag::Extinct | TaxonFlag::ExtinctInherited | TaxonFlag::ExtinctDirect)
    }
}

/// Input record for [`TaxonomyBuilder`].
#[derive(Clone, Debug, Default)]
pub struct TaxonRecord {
    pub id: OttId,
    /// `None` marks the root.
    pub parent_id: Option<OttId>,
    pub name: String,
    /// Display name; synthesized from rank and parent when absent and the
    /// canonical name collides with another taxon.
    pub unique_name: Option<String>,
    pub rank: TaxRank,
    pub flags: FlagSet,
    pub sources: Vec<(SourceDb, String)>,
    /// (name, source-info) pairs.
    pub synonyms: Vec<(String, String)>,
}

pub struct TaxonomyBuilder {
    records: Vec<TaxonRecord>,
    forwards: Vec<(OttId, OttId)>,
    version: String,
    tnrs_suppression: FlagSet,
    synth_suppression: FlagSet,
}

impl TaxonomyBuilder {
    pub fn new() -> Self {
        TaxonomyBuilder {
            records: Vec::new(),
            forwards: Vec::new(),
            version: "0.0".to_string(),
            tnrs_suppression: flags::default_tnrs_suppression(),
            synth_suppression: flags::default_synth_suppression(),
        }
    }

    pub fn version<S: Into<String>>(mut self, version: S) -> Self {
        self.version = version.into();
        self
    }

    pub fn suppression_masks(mut self, tnrs: FlagSet, synth: FlagSet) -> Self {
        self.tnrs_suppression = tnrs;
        self.synth_suppression = synth;
        self
    }

    pub fn taxon(mut self, record: TaxonRecord) -> Self {
        self.records.push(record);
        self
    }

    pub fn forward(mut self, old: OttId, new: OttId) -> Self {
        self.forwards.push((old, new));
        self
    }

    pub fn build(self) -> Result<Taxonomy> {
        Taxonomy::from_records(
            self.records,
            self.forwards,
            self.version,
            self.tnrs_suppression,
            self.synth_suppression,
        )
    }
}

impl Default for TaxonomyBuilder {
    fn default() -> Self {
        TaxonomyBuilder::new()
    }
}

pub struct Taxonomy {
    taxa: Vec<Taxon>,
    synonyms: Vec<Synonym>,
    root: TaxonIx,
    id_lookup: HashMap<OttId, TaxonIx>,
    // folded canonical name -> every taxon carrying it
    name_lookup: HashMap<String, SmallVec<[TaxonIx; 1]>>,
    source_lookup: HashMap<(SourceDb, String), TaxonIx>,
    // append-only: retired id -> its replacement
    forwards: HashMap<OttId, OttId>,
    version: String,
    tnrs_suppression: FlagSet,
    synth_suppression: FlagSet,
    generation: u64,
}

// direct flag -> the inherited flag it propagates to descendants
const INHERITED_PAIRS: [(TaxonFlag, TaxonFlag); 8] = [
    (TaxonFlag::Environmental, TaxonFlag::EnvironmentalInherited),
    (TaxonFlag::Hidden, TaxonFlag::HiddenInherited),
    (TaxonFlag::Extinct, TaxonFlag::ExtinctInherited),
    (TaxonFlag::IncertaeSedis, TaxonFlag::IncertaeSedisInherited),
    (TaxonFlag::Unplaced, TaxonFlag::UnplacedInherited),
    (TaxonFlag::MajorRankConflict, TaxonFlag::MajorRankConflictInherited),
    (TaxonFlag::Unclassified, TaxonFlag::UnclassifiedInherited),
    (TaxonFlag::Tattered, TaxonFlag::TatteredInherited),
];

impl Taxonomy {
    fn from_records(
        records: Vec<TaxonRecord>,
        forwards: Vec<(OttId, OttId)>,
        version: String,
        tnrs_suppression: FlagSet,
        synth_suppression: FlagSet,
    ) -> Result<Taxonomy> {
        if records.is_empty() {
            return Err(Error::bad_request("taxonomy has no taxa"));
        }
        let mut id_lookup = HashMap::with_capacity(records.len());
        for (ix, rec) in records.iter().enumerate() {
            if id_lookup.insert(rec.id, ix).is_some() {
                return Err(Error::bad_request(format!(
                    "duplicate taxon id {} in taxonomy input",
                    rec.id
                )));
            }
        }

        let mut taxa = Vec::with_capacity(records.len());
        let mut synonyms = Vec::new();
        let mut root = None;
        for (ix, rec) in records.iter().enumerate() {
            let parent = match rec.parent_id {
                None => {
                    if root.replace(ix).is_some() {
                        return Err(Error::bad_request("taxonomy input has two roots"));
                    }
                    None
                }
                Some(pid) => Some(*id_lookup.get(&pid).ok_or_else(|| {
                    Error::bad_request(format!(
                        "taxon {} names parent {} which does not exist",
                        rec.id, pid
                    ))
                })?),
            };
            let mut syn_ixs = Vec::with_capacity(rec.synonyms.len());
            for (name, source_info) in &rec.synonyms {
                syn_ixs.push(synonyms.len());
                synonyms.push(Synonym {
                    name: name.clone(),
                    source_info: source_info.clone(),
                    taxon: ix,
                });
            }
            taxa.push(Taxon {
                id: rec.id,
                name: rec.name.clone(),
                unique_name: rec.unique_name.clone().unwrap_or_default(),
                rank: rec.rank,
                flags: rec.flags,
                sources: rec.sources.clone(),
                parent,
                children: Vec::new(),
                synonyms: syn_ixs,
                trav_enter: 0,
                trav_exit: 0,
                depth: 0,
            });
        }
        let root = root.ok_or_else(|| Error::bad_request("taxonomy input has no root"))?;
        for ix in 0..taxa.len() {
            if let Some(p) = taxa[ix].parent {
                taxa[p].children.push(ix);
            }
        }

        let mut forward_map = HashMap::with_capacity(forwards.len());
        for (old, new) in forwards {
            if id_lookup.contains_key(&old) {
                return Err(Error::bad_request(format!(
                    "forward table maps live id {}",
                    old
                )));
            }
            forward_map.insert(old, new);
        }

        let mut tax = Taxonomy {
            taxa,
            synonyms,
            root,
            id_lookup,
            name_lookup: HashMap::new(),
            source_lookup: HashMap::new(),
            forwards: forward_map,
            version,
            tnrs_suppression,
            synth_suppression,
            generation: 0,
        };
        tax.assign_traversal_indices()?;
        tax.propagate_inherited_flags();
        tax.index_names();
        Ok(tax)
    }

    /// Renumber trav_enter/trav_exit and depth with one pre-order walk.
    /// A is an ancestor of B iff A's interval contains B's trav_enter.
    fn assign_traversal_indices(&mut self) -> Result<()> {
        let mut counter: u32 = 0;
        let mut visited = 0usize;
        // (node, next child position)
        let mut stack: Vec<(TaxonIx, usize)> = vec![(self.root, 0)];
        self.taxa[self.root].depth = 0;
        self.taxa[self.root].trav_enter = counter;
        visited += 1;
        while let Some((ix, child_pos)) = stack.pop() {
            if child_pos < self.taxa[ix].children.len() {
                let child = self.taxa[ix].children[child_pos];
                stack.push((ix, child_pos + 1));
                counter += 1;
                self.taxa[child].trav_enter = counter;
                self.taxa[child].depth = self.taxa[ix].depth + 1;
                visited += 1;
                stack.push((child, 0));
            } else {
                self.taxa[ix].trav_exit = counter;
            }
        }
        if visited != self.taxa.len() {
            return Err(Error::internal(format!(
                "{} of {} taxa are unreachable from the root",
                self.taxa.len() - visited,
                self.taxa.len()
            )));
        }
        Ok(())
    }

    /// Push `*_inherited` flags down from every node carrying a direct
    /// flag, so each bitset is a superset of its inherited obligations.
    fn propagate_inherited_flags(&mut self) {
        let mut stack: Vec<(TaxonIx, FlagSet)> = vec![(self.root, FlagSet::empty())];
        while let Some((ix, inherited)) = stack.pop() {
            self.taxa[ix].flags |= inherited;
            let mut pass_down = inherited;
            for (direct, indirect) in INHERITED_PAIRS {
                if self.taxa[ix].flags.contains(direct) {
                    pass_down |= indirect;
                }
            }
            for c in self.taxa[ix].children.clone() {
                stack.push((c, pass_down));
            }
        }
    }

    fn index_names(&mut self) {
        self.name_lookup.clear();
        self.source_lookup.clear();
        for ix in 0..self.taxa.len() {
            let key = crate::strutils::fold_case(&self.taxa[ix].name);
            self.name_lookup.entry(key).or_default().push(ix);
            for (db, fid) in self.taxa[ix].sources.clone() {
                self.source_lookup.insert((db, fid), ix);
            }
        }
        // a homonym gets a synthesized display name unless one was supplied
        for ix in 0..self.taxa.len() {
            if !self.taxa[ix].unique_name.is_empty() {
                continue;
            }
            let key = crate::strutils::fold_case(&self.taxa[ix].name);
            let unique = if self.name_lookup[&key].len() == 1 {
                self.taxa[ix].name.clone()
            } else {
                let context = self.taxa[ix]
                    .parent
                    .map(|p| self.taxa[p].name.clone())
                    .unwrap_or_default();
                format!(
                    "{} ({} in {})",
                    self.taxa[ix].name,
                    self.taxa[ix].rank.as_str(),
                    context
                )
            };
            self.taxa[ix].unique_name = unique;
        }
    }

    pub fn len(&self) -> usize {
        self.taxa.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taxa.is_empty()
    }

    pub fn root(&self) -> TaxonIx {
        self.root
    }

    pub fn taxon(&self, ix: TaxonIx) -> &Taxon {
        &self.taxa[ix]
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// The numeric prefix of the version string ("3.3draft1" -> "3.3").
    pub fn version_number(&self) -> &str {
        let end = self
            .version
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(self.version.len());
        &self.version[..end]
    }

    /// Bumped by every successful patch; dependent indices compare this to
    /// know when they are stale.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn taxon_ix_from_id(&self, id: OttId) -> Option<TaxonIx> {
        self.id_lookup.get(&id).copied()
    }

    pub fn taxon_from_id(&self, id: OttId) -> Option<&Taxon> {
        self.taxon_ix_from_id(id).map(|ix| &self.taxa[ix])
    }

    /// Canonical-name lookup, case-insensitive. Fails (returns `None`) when
    /// the name is carried by more than one taxon; use
    /// [`Taxonomy::lookup_homonyms`] then.
    pub fn lookup_by_name(&self, name: &str) -> Option<&Taxon> {
        let hits = self.name_lookup.get(&crate::strutils::fold_case(name))?;
        if hits.len() == 1 {
            Some(&self.taxa[hits[0]])
        } else {
            None
        }
    }

    /// Every taxon whose canonical name case-folds to `name`.
    pub fn lookup_homonyms(&self, name: &str) -> &[TaxonIx] {
        self.name_lookup
            .get(&crate::strutils::fold_case(name))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Apply the id-forwarding table: the current id for a historically
    /// valid id, or `None` when the id was never minted.
    pub fn unforward_id(&self, id: OttId) -> Option<OttId> {
        if self.id_lookup.contains_key(&id) {
            return Some(id);
        }
        let mut cur = id;
        // the forward table can chain, but never cycles back to a dead id
        for _ in 0..self.forwards.len() {
            match self.forwards.get(&cur) {
                Some(&next) => {
                    if self.id_lookup.contains_key(&next) {
                        return Some(next);
                    }
                    cur = next;
                }
                None => return None,
            }
        }
        None
    }

    pub fn source_lookup(&self, prefix: &str, foreign_id: &str) -> Result<&Taxon> {
        let db = SourceDb::from_prefix(prefix).ok_or_else(|| {
            Error::bad_request(format!("source prefix '{}' is not recognized", prefix))
        })?;
        self.source_lookup
            .get(&(db, foreign_id.to_string()))
            .map(|&ix| &self.taxa[ix])
            .ok_or_else(|| Error::NotFound {
                id: format!("{}:{}", prefix, foreign_id),
            })
    }

    pub fn parent(&self, ix: TaxonIx) -> Option<TaxonIx> {
        self.taxa[ix].parent
    }

    pub fn children(&self, ix: TaxonIx) -> &[TaxonIx] {
        &self.taxa[ix].children
    }

    /// Walk from `ix` back to the root, excluding `ix` itself.
    pub fn ancestors(&self, ix: TaxonIx) -> Ancestors<'_> {
        Ancestors {
            tax: self,
            cur: self.taxa[ix].parent,
        }
    }

    /// Pre-order walk over the subtree rooted at `ix`, including `ix`.
    pub fn descendants(&self, ix: TaxonIx) -> Descendants<'_> {
        Descendants {
            tax: self,
            stack: vec![ix],
        }
    }

    pub fn is_ancestor_of(&self, anc: TaxonIx, des: TaxonIx) -> bool {
        let a = &self.taxa[anc];
        let q = self.taxa[des].trav_enter;
        a.trav_enter <= q && q <= a.trav_exit
    }

    /// O(1)-amortized MRCA on the traversal intervals: hoist the deeper
    /// node until its interval contains the other's entry index.
    pub fn mrca(&self, a: TaxonIx, b: TaxonIx) -> TaxonIx {
        let (mut anc, des) = if self.taxa[a].depth <= self.taxa[b].depth {
            (a, b)
        } else {
            (b, a)
        };
        while !self.is_ancestor_of(anc, des) {
            anc = self.taxa[anc]
                .parent
                .expect("walk reached the root without finding an interval that covers the query");
        }
        anc
    }

    pub fn mrca_of_set(&self, ixs: &[TaxonIx]) -> Option<TaxonIx> {
        let mut it = ixs.iter();
        let mut focal = *it.next()?;
        for &ix in it {
            focal = self.mrca(focal, ix);
        }
        Some(focal)
    }

    pub fn synonym(&self, ix: usize) -> &Synonym {
        &self.synonyms[ix]
    }

    pub fn synonyms_of(&self, ix: TaxonIx) -> impl Iterator<Item = &Synonym> {
        self.taxa[ix].synonyms.iter().map(|&s| &self.synonyms[s])
    }

    pub fn num_synonyms(&self) -> usize {
        self.synonyms.len()
    }

    pub fn is_suppressed_from_tnrs(&self, ix: TaxonIx) -> bool {
        self.taxa[ix].flags.intersects(self.tnrs_suppression)
    }

    pub fn is_suppressed_from_synth(&self, ix: TaxonIx) -> bool {
        self.taxa[ix].flags.intersects(self.synth_suppression)
    }

    /// Per-flag usage counts across the whole taxonomy.
    pub fn flag_counts(&self) -> Vec<(TaxonFlag, usize)> {
        let mut counts: HashMap<TaxonFlag, usize> = HashMap::new();
        for t in &self.taxa {
            for f in t.flags.iter() {
                *counts.entry(f).or_default() += 1;
            }
        }
        let mut out: Vec<_> = counts.into_iter().collect();
        out.sort_by_key(|(f, _)| f.as_str());
        out
    }

    /// Patch operation: graft a new taxon under `parent_id`.
    ///
    /// The arena, both lookup maps and the traversal indices are updated
    /// before this returns; the caller must hold the write gate and rebuild
    /// any name index that outlived the patch (the bumped generation makes
    /// stale indices detectable).
    pub fn add_taxon(
        &mut self,
        id: OttId,
        parent_id: OttId,
        name: &str,
        rank: TaxRank,
        sources: Vec<(SourceDb, String)>,
        flags: FlagSet,
    ) -> Result<()> {
        if self.id_lookup.contains_key(&id) {
            return Err(Error::bad_request(format!("ott id {} already exists", id)));
        }
        if self.forwards.contains_key(&id) {
            return Err(Error::bad_request(format!(
                "ott id {} is a forwarded (retired) id",
                id
            )));
        }
        let parent = self.taxon_ix_from_id(parent_id).ok_or_else(|| {
            Error::bad_request(format!("parent ott id {} is not known", parent_id))
        })?;

        let mut full_flags = flags;
        for (direct, indirect) in INHERITED_PAIRS {
            if self.taxa[parent].flags.contains(direct)
                || self.taxa[parent].flags.contains(indirect)
            {
                full_flags |= indirect;
            }
        }

        let ix = self.taxa.len();
        self.taxa.push(Taxon {
            id,
            name: name.to_string(),
            unique_name: String::new(),
            rank,
            flags: full_flags,
            sources: sources.clone(),
            parent: Some(parent),
            children: Vec::new(),
            synonyms: Vec::new(),
            trav_enter: 0,
            trav_exit: 0,
            depth: 0,
        });
        self.taxa[parent].children.push(ix);
        self.id_lookup.insert(id, ix);
        for (db, fid) in sources {
            self.source_lookup.insert((db, fid), ix);
        }

        // Inserting shifts the entry index of everything visited after the
        // new node, so renumber with a fresh walk rather than patching.
        if let Err(e) = self.assign_traversal_indices() {
            warn!("traversal renumbering failed after adding taxon {}: {}", id, e);
            return Err(e);
        }

        let key = crate::strutils::fold_case(name);
        self.name_lookup.entry(key.clone()).or_default().push(ix);
        let unique = if self.name_lookup[&key].len() == 1 {
            name.to_string()
        } else {
            format!(
                "{} ({} in {})",
                name,
                rank.as_str(),
                self.taxa[parent].name
            )
        };
        self.taxa[ix].unique_name = unique;

        self.generation += 1;
        Ok(())
    }
}

pub struct Ancestors<'t> {
    tax: &'t Taxonomy,
    cur: Option<TaxonIx>,
}

impl<'t> Iterator for Ancestors<'t> {
    type Item = TaxonIx;

    fn next(&mut self) -> Option<TaxonIx> {
        let ix = self.cur?;
        self.cur = self.tax.taxa[ix].parent;
        Some(ix)
    }
}

pub struct Descendants<'t> {
    tax: &'t Taxonomy,
    stack: Vec<TaxonIx>,
}

impl<'t> Iterator for Descendants<'t> {
    type Item = TaxonIx;

    fn next(&mut self) -> Option<TaxonIx> {
        let ix = self.stack.pop()?;
        // reversed so the walk visits children in their stored order
        for &c in self.tax.taxa[ix].children.iter().rev() {
            self.stack.push(c);
        }
        Some(ix)
    }
}
