//! The static catalog of named taxonomic scopes ("contexts") and the
//! nomenclatural-code lookup.
//!
//! The catalog is a small fixed tree rooted at "All life"; each context is
//! anchored to one taxon by OTT id and carries the nomenclatural code that
//! governs names inside it. The code for an arbitrary taxon is resolved by
//! checking its traversal index against the intervals of a handful of
//! barrier taxa, filled in at startup.

use std::collections::HashMap;

use tracing::warn;

use crate::taxonomy::{OttId, TaxonIx, Taxonomy};
use crate::{Error, Result};

pub const LIFE_CONTEXT_NAME: &str = "All life";
const LIFE_ROOT_OTT_ID: OttId = 805_080;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NomCode {
    Iczn,
    Icn,
    Icnp,
    Undefined,
}

impl NomCode {
    pub fn name(self) -> &'static str {
        match self {
            NomCode::Iczn => "ICZN",
            NomCode::Icn => "ICN",
            NomCode::Icnp => "ICNP",
            NomCode::Undefined => "undefined",
        }
    }
}

#[derive(Debug)]
pub struct Context {
    pub name: &'static str,
    pub group: &'static str,
    pub ott_id: OttId,
    pub code: NomCode,
    pub children: Vec<usize>,
}

// The context descriptions mirror the curation-side list; ids anchor each
// scope to its taxon.
#[rustfmt::skip]
const CONTEXT_TABLE: &[(&str, &str, OttId, NomCode)] = &[
    ("All life",         "LIFE",     805_080,   NomCode::Undefined),
    // microbes
    ("Bacteria",         "MICROBES", 844_192,   NomCode::Icnp),
    ("SAR group",        "MICROBES", 5_246_039, NomCode::Undefined),
    ("Archaea",          "MICROBES", 996_421,   NomCode::Icnp),
    ("Excavata",         "MICROBES", 2_927_065, NomCode::Undefined),
    ("Amoebozoa",        "MICROBES", 1_064_655, NomCode::Iczn),
    ("Centrohelida",     "MICROBES", 755_852,   NomCode::Iczn),
    ("Haptophyta",       "MICROBES", 151_014,   NomCode::Undefined),
    ("Apusozoa",         "MICROBES", 671_092,   NomCode::Iczn),
    ("Diatoms",          "MICROBES", 5_342_311, NomCode::Icn),
    ("Ciliates",         "MICROBES", 302_424,   NomCode::Undefined),
    ("Forams",           "MICROBES", 936_399,   NomCode::Iczn),
    // animals
    ("Animals",          "ANIMALS",  691_846,   NomCode::Iczn),
    ("Birds",            "ANIMALS",  81_461,    NomCode::Iczn),
    ("Tetrapods",        "ANIMALS",  229_562,   NomCode::Iczn),
    ("Mammals",          "ANIMALS",  244_265,   NomCode::Iczn),
    ("Amphibians",       "ANIMALS",  544_595,   NomCode::Iczn),
    ("Vertebrates",      "ANIMALS",  801_601,   NomCode::Iczn),
    ("Arthropods",       "ANIMALS",  632_179,   NomCode::Iczn),
    ("Molluscs",         "ANIMALS",  802_117,   NomCode::Iczn),
    ("Nematodes",        "ANIMALS",  395_057,   NomCode::Iczn),
    ("Platyhelminthes",  "ANIMALS",  555_379,   NomCode::Iczn),
    ("Annelids",         "ANIMALS",  941_620,   NomCode::Iczn),
    ("Cnidarians",       "ANIMALS",  641_033,   NomCode::Iczn),
    ("Arachnids",        "ANIMALS",  511_967,   NomCode::Iczn),
    ("Insects",          "ANIMALS",  1_062_253, NomCode::Iczn),
    // fungi
    ("Fungi",            "FUNGI",    352_914,   NomCode::Icn),
    ("Basidiomycetes",   "FUNGI",    634_628,   NomCode::Icn),
    ("Ascomycetes",      "FUNGI",    439_373,   NomCode::Icn),
    // plants
    ("Land plants",      "PLANTS",   5_342_313, NomCode::Icn),
    ("Hornworts",        "PLANTS",   738_980,   NomCode::Icn),
    ("Mosses",           "PLANTS",   246_594,   NomCode::Icn),
    ("Liverworts",       "PLANTS",   56_601,    NomCode::Icn),
    ("Vascular plants",  "PLANTS",   10_210,    NomCode::Icn),
    ("Club mosses",      "PLANTS",   144_803,   NomCode::Icn),
    ("Ferns",            "PLANTS",   166_292,   NomCode::Icn),
    ("Seed plants",      "PLANTS",   10_218,    NomCode::Icn),
    ("Flowering plants", "PLANTS",   99_252,    NomCode::Icn),
    ("Monocots",         "PLANTS",   1_058_517, NomCode::Icn),
    ("Eudicots",         "PLANTS",   431_495,   NomCode::Icn),
    ("Rosids",           "PLANTS",   1_008_296, NomCode::Icn),
    ("Asterids",         "PLANTS",   1_008_294, NomCode::Icn),
    ("Asterales",        "PLANTS",   1_042_120, NomCode::Icn),
    ("Asteraceae",       "PLANTS",   46_248,    NomCode::Icn),
    ("Aster",            "PLANTS",   409_712,   NomCode::Icn),
    ("Symphyotrichum",   "PLANTS",   1_058_735, NomCode::Icn),
    ("Campanulaceae",    "PLANTS",   1_086_303, NomCode::Icn),
    ("Lobelia",          "PLANTS",   1_086_294, NomCode::Icn),
];

#[rustfmt::skip]
const CONTEXT_CHILDREN: &[(&str, &[&str])] = &[
    ("All life",        &["Bacteria", "Archaea", "SAR group", "Excavata", "Amoebozoa",
                          "Centrohelida", "Haptophyta", "Apusozoa", "Animals", "Fungi",
                          "Land plants"]),
    ("SAR group",       &["Diatoms", "Ciliates", "Forams"]),
    ("Animals",         &["Vertebrates", "Arthropods", "Molluscs", "Nematodes",
                          "Platyhelminthes", "Annelids", "Cnidarians"]),
    ("Vertebrates",     &["Tetrapods"]),
    ("Tetrapods",       &["Birds", "Mammals", "Amphibians"]),
    ("Arthropods",      &["Arachnids", "Insects"]),
    ("Fungi",           &["Basidiomycetes", "Ascomycetes"]),
    ("Land plants",     &["Hornworts", "Mosses", "Liverworts", "Club mosses",
                          "Vascular plants"]),
    ("Vascular plants", &["Ferns", "Seed plants"]),
    ("Seed plants",     &["Monocots", "Eudicots"]),
    ("Eudicots",        &["Rosids", "Asterids"]),
    ("Asterids",        &["Asterales"]),
    ("Asterales",       &["Asteraceae", "Campanulaceae"]),
    ("Asteraceae",      &["Aster", "Symphyotrichum"]),
    ("Campanulaceae",   &["Lobelia"]),
];

// Barrier anchors: (ott id, expected name) per code. A name mismatch means
// the taxonomy is not the one these ids were taken from, and startup fails.
const ICZN_ANCHORS: &[(OttId, &str)] = &[(691_846, "Metazoa"), (202_765, "Choanoflagellida")];
const ICNP_ANCHORS: &[(OttId, &str)] = &[
    (844_192, "Bacteria"),
    (996_421, "Archaea (domain silva:D37982/#1)"),
];
const ICN_ANCHORS: &[(OttId, &str)] = &[
    (352_914, "Fungi"),
    (361_838, "Chloroplastida"),
    (266_751, "Alveolata"),
    (878_953, "Rhodophyta"),
    (664_970, "Glaucophyta"),
    (151_014, "Haptophyta"),
];

pub struct ContextCatalog {
    contexts: Vec<Context>,
    by_name: HashMap<&'static str, usize>,
    by_id: HashMap<OttId, usize>,
    // per code, a sorted vector of (trav_enter, trav_exit) intervals
    nom_ranges: Vec<(NomCode, Vec<(u32, u32)>)>,
}

impl ContextCatalog {
    pub fn new() -> ContextCatalog {
        let mut contexts: Vec<Context> = CONTEXT_TABLE
            .iter()
            .map(|&(name, group, ott_id, code)| Context {
                name,
                group,
                ott_id,
                code,
                children: Vec::new(),
            })
            .collect();
        let by_name: HashMap<_, _> = contexts
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name, i))
            .collect();
        let by_id: HashMap<_, _> = contexts
            .iter()
            .enumerate()
            .map(|(i, c)| (c.ott_id, i))
            .collect();
        for (parent, children) in CONTEXT_CHILDREN {
            let p = by_name[parent];
            for child in *children {
                let c = by_name[child];
                contexts[p].children.push(c);
            }
        }
        ContextCatalog {
            contexts,
            by_name,
            by_id,
            nom_ranges: Vec::new(),
        }
    }

    pub fn all(&self) -> &[Context] {
        &self.contexts
    }

    pub fn root_context(&self) -> &Context {
        &self.contexts[self.by_name[LIFE_CONTEXT_NAME]]
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Context> {
        self.by_name.get(name).map(|&i| &self.contexts[i])
    }

    pub fn find_by_id(&self, id: OttId) -> Option<&Context> {
        self.by_id.get(&id).map(|&i| &self.contexts[i])
    }

    /// Walk up from the MRCA of `taxa` to the first context-anchor taxon.
    /// The empty list and a walk that exhausts the ancestors both land on
    /// "All life".
    pub fn least_inclusive(&self, tax: &Taxonomy, taxa: &[TaxonIx]) -> &Context {
        let mrca = match tax.mrca_of_set(taxa) {
            Some(m) => m,
            None => return self.root_context(),
        };
        let mut cur = Some(mrca);
        while let Some(ix) = cur {
            if let Some(c) = self.find_by_id(tax.taxon(ix).id) {
                return c;
            }
            cur = tax.parent(ix);
        }
        self.root_context()
    }

    /// Infer the narrowest context covering the resolvable input names.
    ///
    /// A name resolves iff an exact, case-insensitive canonical-name lookup
    /// yields exactly one taxon; synonyms do not count, and suppressed taxa
    /// do. Everything else is reported back as ambiguous.
    pub fn infer_context(
        &self,
        tax: &Taxonomy,
        names: &[String],
    ) -> (&Context, Vec<String>) {
        let mut resolved = Vec::new();
        let mut ambiguous = Vec::new();
        for name in names {
            let hits = tax.lookup_homonyms(name);
            if hits.len() == 1 {
                resolved.push(hits[0]);
            } else {
                ambiguous.push(name.clone());
            }
        }
        (self.least_inclusive(tax, &resolved), ambiguous)
    }

    /// Fill the code → traversal-interval table from the barrier anchors.
    ///
    /// When the taxonomy's root is not the expected one this is a test
    /// taxonomy: detection is disabled (every lookup yields `Undefined`)
    /// rather than failing. An anchor id that resolves to the wrong name is
    /// a real mismatch and fails startup.
    pub fn init_nom_code_boundaries(&mut self, tax: &Taxonomy) -> Result<()> {
        self.nom_ranges.clear();
        if tax.taxon(tax.root()).id != LIFE_ROOT_OTT_ID {
            warn!(
                "taxonomy root is not ott{}; assuming a test taxonomy, nomenclatural \
                 code detection disabled",
                LIFE_ROOT_OTT_ID
            );
            return Ok(());
        }
        for (code, anchors) in [
            (NomCode::Iczn, ICZN_ANCHORS),
            (NomCode::Icnp, ICNP_ANCHORS),
            (NomCode::Icn, ICN_ANCHORS),
        ] {
            let mut ranges = Vec::with_capacity(anchors.len());
            for &(id, expected_name) in anchors {
                let taxon = tax.taxon_from_id(id).ok_or_else(|| {
                    Error::internal(format!("barrier taxon ott{} not found", id))
                })?;
                if taxon.name != expected_name {
                    return Err(Error::internal(format!(
                        "barrier taxon ott{} is named \"{}\", expected \"{}\"",
                        id, taxon.name, expected_name
                    )));
                }
                ranges.push((taxon.trav_enter, taxon.trav_exit));
            }
            ranges.sort_unstable();
            self.nom_ranges.push((code, ranges));
        }
        Ok(())
    }

    /// The nomenclatural code governing a traversal position.
    pub fn code_for_traversal(&self, trav_enter: u32) -> NomCode {
        for (code, ranges) in &self.nom_ranges {
            // last interval starting at or before the query
            let i = ranges.partition_point(|&(lo, _)| lo <= trav_enter);
            if i > 0 && ranges[i - 1].1 >= trav_enter {
                return *code;
            }
        }
        NomCode::Undefined
    }

    pub fn code_for_taxon(&self, tax: &Taxonomy, ix: TaxonIx) -> NomCode {
        self.code_for_traversal(tax.taxon(ix).trav_enter)
    }
}

impl Default for ContextCatalog {
    fn default() -> Self {
        ContextCatalog::new()
    }
}
