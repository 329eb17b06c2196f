//! The per-taxon flag bitset and the suppression masks derived from it.
//!
//! The taxonomy files carry flags as comma-separated strings; in memory
//! each taxon stores a 32-bit set. Two configured masks decide which taxa
//! are hidden from name matching and which were excluded from synthesis.

use enumflags2::{bitflags, BitFlags};

use crate::{Error, Result};

#[bitflags]
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaxonFlag {
    NotOtu,
    Environmental,
    EnvironmentalInherited,
    Viral,
    Hidden,
    HiddenInherited,
    Extinct,
    ExtinctDirect,
    ExtinctInherited,
    IncertaeSedis,
    IncertaeSedisDirect,
    IncertaeSedisInherited,
    Unplaced,
    UnplacedInherited,
    MajorRankConflict,
    MajorRankConflictDirect,
    MajorRankConflictInherited,
    Infraspecific,
    Hybrid,
    SiblingHigher,
    SiblingLower,
    Barren,
    Merged,
    WasContainer,
    Inconsistent,
    Unclassified,
    UnclassifiedDirect,
    UnclassifiedInherited,
    ForcedVisible,
    Edited,
    Tattered,
    TatteredInherited,
}

pub type FlagSet = BitFlags<TaxonFlag>;

impl TaxonFlag {
    pub fn as_str(self) -> &'static str {
        use TaxonFlag::*;
        match self {
            NotOtu => "not_otu",
            Environmental => "environmental",
            EnvironmentalInherited => "environmental_inherited",
            Viral => "viral",
            Hidden => "hidden",
            HiddenInherited => "hidden_inherited",
            Extinct => "extinct",
            ExtinctDirect => "extinct_direct",
            ExtinctInherited => "extinct_inherited",
            IncertaeSedis => "incertae_sedis",
            IncertaeSedisDirect => "incertae_sedis_direct",
            IncertaeSedisInherited => "incertae_sedis_inherited",
            Unplaced => "unplaced",
            UnplacedInherited => "unplaced_inherited",
            MajorRankConflict => "major_rank_conflict",
            MajorRankConflictDirect => "major_rank_conflict_direct",
            MajorRankConflictInherited => "major_rank_conflict_inherited",
            Infraspecific => "infraspecific",
            Hybrid => "hybrid",
            SiblingHigher => "sibling_higher",
            SiblingLower => "sibling_lower",
            Barren => "barren",
            Merged => "merged",
            WasContainer => "was_container",
            Inconsistent => "inconsistent",
            Unclassified => "unclassified",
            UnclassifiedDirect => "unclassified_direct",
            UnclassifiedInherited => "unclassified_inherited",
            ForcedVisible => "forced_visible",
            Edited => "edited",
            Tattered => "tattered",
            TatteredInherited => "tattered_inherited",
        }
    }

    pub fn from_str_flag(s: &str) -> Result<TaxonFlag> {
        use TaxonFlag::*;
        Ok(match s {
            "not_otu" => NotOtu,
            "environmental" => Environmental,
            "environmental_inherited" => EnvironmentalInherited,
            "viral" => Viral,
            "hidden" => Hidden,
            "hidden_inherited" => HiddenInherited,
            "extinct" => Extinct,
            "extinct_direct" => ExtinctDirect,
            "extinct_inherited" => ExtinctInherited,
            "incertae_sedis" => IncertaeSedis,
            "incertae_sedis_direct" => IncertaeSedisDirect,
            "incertae_sedis_inherited" => IncertaeSedisInherited,
            "unplaced" => Unplaced,
            "unplaced_inherited" => UnplacedInherited,
            "major_rank_conflict" => MajorRankConflict,
            "major_rank_conflict_direct" => MajorRankConflictDirect,
            "major_rank_conflict_inherited" => MajorRankConflictInherited,
            "infraspecific" => Infraspecific,
            "hybrid" => Hybrid,
            "sibling_higher" => SiblingHigher,
            "sibling_lower" => SiblingLower,
            "barren" => Barren,
            "merged" => Merged,
            "was_container" => WasContainer,
            "inconsistent" => Inconsistent,
            "unclassified" => Unclassified,
            "unclassified_direct" => UnclassifiedDirect,
            "unclassified_inherited" => UnclassifiedInherited,
            "forced_visible" => ForcedVisible,
            "edited" => Edited,
            "tattered" => Tattered,
            "tattered_inherited" => TatteredInherited,
            _ => {
                return Err(Error::bad_request(format!(
                    "taxon flag '{}' is not recognized",
                    s
                )))
            }
        })
    }
}

/// Parse a comma-separated flag string from a taxonomy file.
pub fn parse_flags(s: &str) -> Result<FlagSet> {
    let mut flags = FlagSet::empty();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        flags |= TaxonFlag::from_str_flag(part)?;
    }
    Ok(flags)
}

pub fn flags_to_string_vec(flags: FlagSet) -> Vec<String> {
    flags.iter().map(|f| f.as_str().to_string()).collect()
}

/// Flags that keep a taxon out of TNRS results.
pub fn default_tnrs_suppression() -> FlagSet {
    use TaxonFlag::*;
    NotOtu | Environmental | EnvironmentalInherited | Viral | Hidden | HiddenInherited
        | WasContainer
}

/// Flags that kept a taxon out of the synthetic tree. The cleaning flags
/// used by the synthesis pipeline, on top of the TNRS set.
pub fn default_synth_suppression() -> FlagSet {
    use TaxonFlag::*;
    default_tnrs_suppression()
        | Barren
        | Inconsistent
        | Merged
        | IncertaeSedis
        | IncertaeSedisInherited
        | Unplaced
        | UnplacedInherited
        | MajorRankConflict
        | MajorRankConflictInherited
        | Tattered
        | TatteredInherited
}
