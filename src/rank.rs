//! Code related to handling of taxonomic ranks
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A taxonomic rank. For example, a species or phylum.
///
/// We use this instead of a String/&str to allow stricter type-checking.
/// The variants are declared root-most first so that the derived ordering
/// can answer "is this rank above the species level?".
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum TaxRank {
    Domain,
    Superkingdom,
    Kingdom,
    Subkingdom,
    Infrakingdom,
    Superphylum,
    Phylum,
    Subphylum,
    Infraphylum,
    Superclass,
    Class,
    Subclass,
    Infraclass,
    Superorder,
    Order,
    Suborder,
    Infraorder,
    Parvorder,
    Superfamily,
    Family,
    Subfamily,
    Supertribe,
    Tribe,
    Subtribe,
    Genus,
    Subgenus,
    Section,
    Subsection,
    SpeciesGroup,
    SpeciesSubgroup,
    Species,
    Subspecies,
    Infraspecificname,
    Varietas,
    Subvarietas,
    Forma,
    Subforma,
    // NoRank has no defined place in the ordering, so the derived Ord puts
    // it below everything; is_higher/is_specific treat it explicitly
    #[default]
    NoRank,
}

impl TaxRank {
    /// The rank string used by the taxonomy files.
    pub fn as_str(self) -> &'static str {
        match self {
            TaxRank::Domain => "domain",
            TaxRank::Superkingdom => "superkingdom",
            TaxRank::Kingdom => "kingdom",
            TaxRank::Subkingdom => "subkingdom",
            TaxRank::Infrakingdom => "infrakingdom",
            TaxRank::Superphylum => "superphylum",
            TaxRank::Phylum => "phylum",
            TaxRank::Subphylum => "subphylum",
            TaxRank::Infraphylum => "infraphylum",
            TaxRank::Superclass => "superclass",
            TaxRank::Class => "class",
            TaxRank::Subclass => "subclass",
            TaxRank::Infraclass => "infraclass",
            TaxRank::Superorder => "superorder",
            TaxRank::Order => "order",
            TaxRank::Suborder => "suborder",
            TaxRank::Infraorder => "infraorder",
            TaxRank::Parvorder => "parvorder",
            TaxRank::Superfamily => "superfamily",
            TaxRank::Family => "family",
            TaxRank::Subfamily => "subfamily",
            TaxRank::Supertribe => "supertribe",
            TaxRank::Tribe => "tribe",
            TaxRank::Subtribe => "subtribe",
            TaxRank::Genus => "genus",
            TaxRank::Subgenus => "subgenus",
            TaxRank::Section => "section",
            TaxRank::Subsection => "subsection",
            TaxRank::SpeciesGroup => "species group",
            TaxRank::SpeciesSubgroup => "species subgroup",
            TaxRank::Species => "species",
            TaxRank::Subspecies => "subspecies",
            TaxRank::Infraspecificname => "infraspecificname",
            TaxRank::Varietas => "varietas",
            TaxRank::Subvarietas => "subvarietas",
            TaxRank::Forma => "forma",
            TaxRank::Subforma => "subforma",
            TaxRank::NoRank => "no rank",
        }
    }

    /// Species level or below.
    pub fn is_specific(self) -> bool {
        self != TaxRank::NoRank && self >= TaxRank::Species
    }

    /// Strictly above the species level. `NoRank` taxa count as higher:
    /// unranked containers behave like higher taxa in name searches.
    pub fn is_higher(self) -> bool {
        self == TaxRank::NoRank || self < TaxRank::Species
    }

    pub fn is_genus(self) -> bool {
        self == TaxRank::Genus
    }
}

impl FromStr for TaxRank {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_ref() {
            "domain" => Ok(TaxRank::Domain),
            "superkingdom" => Ok(TaxRank::Superkingdom),
            "kingdom" => Ok(TaxRank::Kingdom),
            "subkingdom" => Ok(TaxRank::Subkingdom),
            "infrakingdom" => Ok(TaxRank::Infrakingdom),
            "superphylum" | "superphyla" => Ok(TaxRank::Superphylum),
            "phylum" | "phyla" => Ok(TaxRank::Phylum),
            "subphylum" | "subphyla" => Ok(TaxRank::Subphylum),
            "infraphylum" => Ok(TaxRank::Infraphylum),
            "superclass" => Ok(TaxRank::Superclass),
            "class" => Ok(TaxRank::Class),
            "subclass" => Ok(TaxRank::Subclass),
            "infraclass" => Ok(TaxRank::Infraclass),
            "superorder" => Ok(TaxRank::Superorder),
            "order" => Ok(TaxRank::Order),
            "suborder" => Ok(TaxRank::Suborder),
            "infraorder" => Ok(TaxRank::Infraorder),
            "parvorder" => Ok(TaxRank::Parvorder),
            "superfamily" => Ok(TaxRank::Superfamily),
            "family" => Ok(TaxRank::Family),
            "subfamily" => Ok(TaxRank::Subfamily),
            "supertribe" => Ok(TaxRank::Supertribe),
            "tribe" => Ok(TaxRank::Tribe),
            "subtribe" => Ok(TaxRank::Subtribe),
            "genus" => Ok(TaxRank::Genus),
            "subgenus" => Ok(TaxRank::Subgenus),
            "section" => Ok(TaxRank::Section),
            "subsection" => Ok(TaxRank::Subsection),
            "species group" => Ok(TaxRank::SpeciesGroup),
            "species subgroup" => Ok(TaxRank::SpeciesSubgroup),
            "species" => Ok(TaxRank::Species),
            "subspecies" => Ok(TaxRank::Subspecies),
            "infraspecificname" => Ok(TaxRank::Infraspecificname),
            "varietas" | "variety" => Ok(TaxRank::Varietas),
            "subvarietas" => Ok(TaxRank::Subvarietas),
            "forma" => Ok(TaxRank::Forma),
            "subforma" => Ok(TaxRank::Subforma),
            "no rank" | "no rank - terminal" | "" => Ok(TaxRank::NoRank),
            _ => Err(Error::bad_request(format!("rank '{}' is not recognized", s))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_rank_round_trip() -> Result<()> {
        for s in ["species", "genus", "family", "no rank", "species group"] {
            assert_eq!(TaxRank::from_str(s)?.as_str(), s);
        }
        assert!(TaxRank::from_str("emperor").is_err());
        Ok(())
    }

    #[test]
    fn test_rank_levels() {
        assert!(TaxRank::Species.is_specific());
        assert!(TaxRank::Subspecies.is_specific());
        assert!(!TaxRank::Genus.is_specific());
        assert!(TaxRank::Genus.is_higher());
        assert!(TaxRank::Class.is_higher());
        assert!(!TaxRank::Species.is_higher());
        assert!(TaxRank::NoRank.is_higher());
        assert!(!TaxRank::NoRank.is_specific());
    }
}
