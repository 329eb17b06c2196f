//! Taxonomic name resolution: context-aware matching of free-form name
//! strings to taxa, and the autocomplete cascade behind name fields.

use serde_json::{json, Value};

use crate::context::{Context, ContextCatalog};
use crate::ctrie::{MatchWithTaxon, NameIndex};
use crate::strutils::{fold_case, normalize_query};
use crate::taxonomy::{TaxonIx, Taxonomy};
use crate::{Error, Result};

/// Everything a TNRS query needs to see, borrowed for one request.
pub struct Searcher<'a> {
    pub taxonomy: &'a Taxonomy,
    pub index: &'a NameIndex,
    pub catalog: &'a ContextCatalog,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum MatchStatus {
    Unmatched,
    Ambiguous,
    Unambiguous,
}

type TaxonPred<'p> = &'p dyn Fn(&Taxonomy, TaxonIx) -> bool;

fn any_taxon(_: &Taxonomy, _: TaxonIx) -> bool {
    true
}

fn is_higher(tax: &Taxonomy, ix: TaxonIx) -> bool {
    tax.taxon(ix).rank.is_higher()
}

fn is_specific(tax: &Taxonomy, ix: TaxonIx) -> bool {
    tax.taxon(ix).rank.is_specific()
}

fn is_genus(tax: &Taxonomy, ix: TaxonIx) -> bool {
    tax.taxon(ix).rank.is_genus()
}

impl<'a> Searcher<'a> {
    /// The context root's arena index; a context anchored to a taxon this
    /// taxonomy does not carry falls back to the taxonomy root.
    fn context_root(&self, context: &Context) -> TaxonIx {
        self.taxonomy
            .taxon_ix_from_id(context.ott_id)
            .unwrap_or_else(|| self.taxonomy.root())
    }

    fn resolve(
        &self,
        hits: Vec<crate::ctrie::FuzzyMatch>,
        context_root: TaxonIx,
        include_suppressed: bool,
    ) -> Vec<MatchWithTaxon> {
        self.index
            .to_taxa(&hits, self.taxonomy, context_root, include_suppressed)
    }

    fn exact_names(
        &self,
        query: &str,
        root: TaxonIx,
        include_suppressed: bool,
        pred: TaxonPred<'_>,
    ) -> Vec<MatchWithTaxon> {
        self.resolve(self.index.exact_query(query), root, include_suppressed)
            .into_iter()
            .filter(|m| !m.is_synonym() && pred(self.taxonomy, m.taxon))
            .collect()
    }

    fn exact_synonyms(
        &self,
        query: &str,
        root: TaxonIx,
        include_suppressed: bool,
        pred: TaxonPred<'_>,
    ) -> Vec<MatchWithTaxon> {
        self.resolve(self.index.exact_query(query), root, include_suppressed)
            .into_iter()
            .filter(|m| m.is_synonym() && pred(self.taxonomy, m.taxon))
            .collect()
    }

    fn prefix_names(
        &self,
        query: &str,
        root: TaxonIx,
        include_suppressed: bool,
        pred: TaxonPred<'_>,
    ) -> Vec<MatchWithTaxon> {
        self.resolve(self.index.prefix_query(query), root, include_suppressed)
            .into_iter()
            .filter(|m| !m.is_synonym() && pred(self.taxonomy, m.taxon))
            .collect()
    }

    fn prefix_synonyms(
        &self,
        query: &str,
        root: TaxonIx,
        include_suppressed: bool,
    ) -> Vec<MatchWithTaxon> {
        self.resolve(self.index.prefix_query(query), root, include_suppressed)
            .into_iter()
            .filter(|m| m.is_synonym())
            .collect()
    }

    /// Species under `genus` whose epithet starts with `prefix`.
    fn species_in_genus_with_prefix(&self, genus: TaxonIx, prefix: &str) -> Vec<TaxonIx> {
        let genus_name = fold_case(&self.taxonomy.taxon(genus).name);
        let prefix = fold_case(prefix);
        let mut hits = Vec::new();
        for ix in self.taxonomy.descendants(genus) {
            if !is_specific(self.taxonomy, ix) {
                continue;
            }
            let name = fold_case(&self.taxonomy.taxon(ix).name);
            let epithet = name
                .strip_prefix(&genus_name)
                .map(|rest| rest.trim_start())
                .unwrap_or(&name);
            if epithet.starts_with(&prefix) {
                hits.push(ix);
            }
        }
        hits
    }

    fn base_match_json(&self, search_string: &str, m: &MatchWithTaxon) -> Value {
        json!({
            "taxon": crate::api::taxon_blob(self.taxonomy, m.taxon),
            "search_string": search_string,
            "nomenclature_code": self
                .catalog
                .code_for_taxon(self.taxonomy, m.taxon)
                .name(),
            "score": m.score,
            "is_approximate_match": m.distance > 0,
            "is_synonym": m.is_synonym(),
            "matched_name": m.matched_name,
        })
    }

    fn match_name(
        &self,
        raw_query: &str,
        context_root: TaxonIx,
        do_approximate_matching: bool,
        include_suppressed: bool,
    ) -> (Value, MatchStatus) {
        let query = normalize_query(raw_query);
        let mut results: Vec<Value> = Vec::new();
        let mut status = MatchStatus::Unmatched;

        // exact canonical names first
        let name_hits = self.exact_names(&query, context_root, include_suppressed, &any_taxon);
        if name_hits.len() == 1 {
            status = MatchStatus::Unambiguous;
        }
        for m in &name_hits {
            results.push(self.base_match_json(&query, m));
        }
        // then exact synonyms
        for m in self.exact_synonyms(&query, context_root, include_suppressed, &any_taxon) {
            results.push(self.base_match_json(&query, &m));
        }
        if status == MatchStatus::Unmatched && !results.is_empty() {
            status = MatchStatus::Ambiguous;
        }
        // fuzzy matching only for names nothing else matched
        if do_approximate_matching && status == MatchStatus::Unmatched {
            let fuzzy = self.index.fuzzy_query_to_taxa(
                &query,
                self.taxonomy,
                context_root,
                include_suppressed,
            );
            status = match fuzzy.len() {
                0 => MatchStatus::Unmatched,
                1 => MatchStatus::Unambiguous,
                _ => MatchStatus::Ambiguous,
            };
            for m in &fuzzy {
                results.push(self.base_match_json(&query, m));
            }
        }
        (
            json!({ "name": raw_query, "matches": results }),
            status,
        )
    }

    fn determine_context(
        &self,
        names: &[String],
        context_name: Option<&str>,
    ) -> Result<&'a Context> {
        match context_name {
            Some(name) => self.catalog.find_by_name(name).ok_or_else(|| {
                Error::bad_request(format!("context '{}' is not recognized", name))
            }),
            None => Ok(self.catalog.infer_context(self.taxonomy, names).0),
        }
    }
}

/// `tnrs/match_names`.
pub fn match_names(
    searcher: &Searcher<'_>,
    names: &[String],
    context_name: Option<&str>,
    do_approximate_matching: bool,
    include_suppressed: bool,
) -> Result<Value> {
    let context = searcher.determine_context(names, context_name)?;
    let context_root = searcher.context_root(context);
    let mut results = Vec::new();
    let mut unambiguous_names = Vec::new();
    let mut unmatched_names = Vec::new();
    let mut matched_names = Vec::new();
    for name in names {
        let (result, status) = searcher.match_name(
            name,
            context_root,
            do_approximate_matching,
            include_suppressed,
        );
        results.push(result);
        match status {
            MatchStatus::Unmatched => unmatched_names.push(name.clone()),
            MatchStatus::Ambiguous => matched_names.push(name.clone()),
            MatchStatus::Unambiguous => {
                matched_names.push(name.clone());
                unambiguous_names.push(name.clone());
            }
        }
    }
    Ok(json!({
        "governing_code": context.code.name(),
        "context": context.name,
        "includes_approximate_matches": do_approximate_matching,
        "includes_deprecated_taxa": false,
        "includes_suppressed_names": include_suppressed,
        "taxonomy": crate::api::tax_about_blob(searcher.taxonomy),
        "unambiguous_names": unambiguous_names,
        "unmatched_names": unmatched_names,
        "matched_names": matched_names,
        "results": results,
    }))
}

fn autocomplete_item(searcher: &Searcher<'_>, ix: TaxonIx) -> Value {
    let taxon = searcher.taxonomy.taxon(ix);
    json!({
        "ott_id": taxon.id,
        "unique_name": taxon.unique_name,
        "is_suppressed": searcher.taxonomy.is_suppressed_from_tnrs(ix),
        "is_higher": taxon.rank.is_higher(),
    })
}

fn push_taxa(searcher: &Searcher<'_>, out: &mut Vec<Value>, taxa: &[MatchWithTaxon]) {
    for m in taxa {
        out.push(autocomplete_item(searcher, m.taxon));
    }
}

/// `name.splitn(2, ' ')` when the string holds a space.
fn split_genus_species(name: &str) -> Option<(&str, &str)> {
    let first_space = name.find(' ')?;
    let genus = &name[..first_space];
    let species = name[first_space + 1..].trim_start();
    Some((genus, species))
}

/// `tnrs/autocomplete_name`: exact hits first, then prefix, then fuzzy.
///
/// A query with a space is treated as genus + epithet: an exact species
/// hit wins; otherwise an exact genus hit expands to the species beneath
/// it whose epithets extend the rest of the query.
pub fn autocomplete_name(
    searcher: &Searcher<'_>,
    name: &str,
    context_name: &str,
    include_suppressed: bool,
) -> Result<Value> {
    let context = searcher
        .catalog
        .find_by_name(context_name)
        .ok_or_else(|| Error::bad_request(format!("context '{}' is not recognized", context_name)))?;
    let root = searcher.context_root(context);
    let query = normalize_query(name);
    let tax = searcher.taxonomy;
    let mut out: Vec<Value> = Vec::new();

    // splitting looks at the raw name: a trailing space after a genus is
    // a deliberate "list the species" request
    if let Some((_genus, species_prefix)) = split_genus_species(name) {
        // the first word looks like a genus; try species-level exacts
        push_taxa(
            searcher,
            &mut out,
            &searcher.exact_names(&query, root, include_suppressed, &is_specific),
        );
        push_taxa(
            searcher,
            &mut out,
            &searcher.exact_synonyms(&query, root, include_suppressed, &any_taxon),
        );
        if !out.is_empty() {
            return Ok(Value::Array(out));
        }
        let genus_word = query.split(' ').next().unwrap_or(&query);
        let genus_hits = searcher.exact_names(genus_word, root, include_suppressed, &is_genus);
        for g in &genus_hits {
            for sp in searcher.species_in_genus_with_prefix(g.taxon, species_prefix) {
                if !include_suppressed && tax.is_suppressed_from_tnrs(sp) {
                    continue;
                }
                out.push(autocomplete_item(searcher, sp));
            }
        }
        if !out.is_empty() {
            return Ok(Value::Array(out));
        }
        push_taxa(
            searcher,
            &mut out,
            &searcher.exact_names(&query, root, include_suppressed, &is_higher),
        );
        if !out.is_empty() {
            return Ok(Value::Array(out));
        }
        push_taxa(
            searcher,
            &mut out,
            &searcher.prefix_names(&query, root, include_suppressed, &any_taxon),
        );
        push_taxa(
            searcher,
            &mut out,
            &searcher.prefix_synonyms(&query, root, include_suppressed),
        );
        if !out.is_empty() {
            return Ok(Value::Array(out));
        }
        let fuzzy = searcher
            .index
            .fuzzy_query_to_taxa(&query, tax, root, include_suppressed);
        push_taxa(searcher, &mut out, &fuzzy);
    } else {
        // no space: this is a higher-taxon or genus fragment
        push_taxa(
            searcher,
            &mut out,
            &searcher.exact_names(&query, root, include_suppressed, &is_higher),
        );
        push_taxa(
            searcher,
            &mut out,
            &searcher.exact_synonyms(&query, root, include_suppressed, &is_higher),
        );
        if !out.is_empty() {
            return Ok(Value::Array(out));
        }
        push_taxa(
            searcher,
            &mut out,
            &searcher.prefix_names(&query, root, include_suppressed, &is_higher),
        );
        if !out.is_empty() {
            return Ok(Value::Array(out));
        }
        push_taxa(
            searcher,
            &mut out,
            &searcher.prefix_synonyms(&query, root, include_suppressed),
        );
        if !out.is_empty() {
            return Ok(Value::Array(out));
        }
        let fuzzy = searcher
            .index
            .fuzzy_query_to_taxa(&query, tax, root, include_suppressed);
        push_taxa(searcher, &mut out, &fuzzy);
    }
    Ok(Value::Array(out))
}

/// `tnrs/contexts`: group name -> context names.
pub fn contexts(catalog: &ContextCatalog) -> Value {
    let mut groups = serde_json::Map::new();
    for context in catalog.all() {
        groups
            .entry(context.group.to_string())
            .or_insert_with(|| Value::Array(Vec::new()))
            .as_array_mut()
            .expect("group entries are arrays")
            .push(Value::String(context.name.to_string()));
    }
    Value::Object(groups)
}

/// `tnrs/infer_context`.
pub fn infer_context(searcher: &Searcher<'_>, names: &[String]) -> Value {
    let (context, ambiguous_names) = searcher.catalog.infer_context(searcher.taxonomy, names);
    json!({
        "context_name": context.name,
        "context_ott_id": context.ott_id,
        "ambiguous_names": ambiguous_names,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rank::TaxRank;
    use crate::taxonomy::{TaxonRecord, TaxonomyBuilder};

    /// Homo with two species, plus Aster material for fuzzy tests.
    fn tnrs_taxonomy() -> Taxonomy {
        TaxonomyBuilder::new()
            .taxon(TaxonRecord {
                id: 1,
                parent_id: None,
                name: "Life".into(),
                ..Default::default()
            })
            .taxon(TaxonRecord {
                id: 10,
                parent_id: Some(1),
                name: "Homo".into(),
                rank: TaxRank::Genus,
                ..Default::default()
            })
            .taxon(TaxonRecord {
                id: 11,
                parent_id: Some(10),
                name: "Homo sapiens".into(),
                rank: TaxRank::Species,
                ..Default::default()
            })
            .taxon(TaxonRecord {
                id: 12,
                parent_id: Some(10),
                name: "Homo erectus".into(),
                rank: TaxRank::Species,
                ..Default::default()
            })
            .taxon(TaxonRecord {
                id: 20,
                parent_id: Some(1),
                name: "Asteraceae".into(),
                rank: TaxRank::Family,
                synonyms: vec![("Compositae".into(), "ncbi:4210".into())],
                ..Default::default()
            })
            .build()
            .unwrap()
    }

    fn with_searcher<T>(f: impl FnOnce(&Searcher<'_>) -> T) -> T {
        let tax = tnrs_taxonomy();
        let index = NameIndex::build(&tax);
        let catalog = ContextCatalog::new();
        f(&Searcher {
            taxonomy: &tax,
            index: &index,
            catalog: &catalog,
        })
    }

    fn ids_of(v: &Value) -> Vec<u64> {
        v.as_array()
            .unwrap()
            .iter()
            .map(|m| m["ott_id"].as_u64().unwrap())
            .collect()
    }

    #[test]
    fn test_autocomplete_genus_plus_epithet() {
        with_searcher(|s| {
            // exact species match wins over everything
            let v = autocomplete_name(s, "Homo sa", "All life", false).unwrap();
            assert_eq!(ids_of(&v), vec![11]);
            // trailing space lists the whole genus
            let v = autocomplete_name(s, "Homo ", "All life", false).unwrap();
            let mut ids = ids_of(&v);
            ids.sort();
            assert_eq!(ids, vec![11, 12]);
        });
    }

    #[test]
    fn test_autocomplete_higher_taxon_fragment() {
        with_searcher(|s| {
            // "Hom" prefix-matches the genus, nothing else
            let v = autocomplete_name(s, "Hom", "All life", false).unwrap();
            assert_eq!(ids_of(&v), vec![10]);
            // an exact genus hit returns only the genus
            let v = autocomplete_name(s, "Homo", "All life", false).unwrap();
            assert_eq!(ids_of(&v), vec![10]);
            assert_eq!(v[0]["is_higher"], true);
        });
    }

    #[test]
    fn test_autocomplete_falls_back_to_fuzzy() {
        with_searcher(|s| {
            let v = autocomplete_name(s, "Asteracaee", "All life", false).unwrap();
            assert_eq!(ids_of(&v), vec![20]);
        });
    }

    #[test]
    fn test_autocomplete_unknown_context() {
        with_searcher(|s| {
            assert!(autocomplete_name(s, "Homo", "Dinosaurs", false).is_err());
        });
    }

    #[test]
    fn test_match_names_exact_and_synonym() {
        with_searcher(|s| {
            let names = vec!["Homo sapiens".to_string(), "Compositae".to_string()];
            let v = match_names(s, &names, Some("All life"), false, false).unwrap();
            assert_eq!(v["context"], "All life");
            assert_eq!(v["unambiguous_names"], json!(["Homo sapiens"]));
            assert_eq!(v["matched_names"], json!(["Homo sapiens", "Compositae"]));
            let results = v["results"].as_array().unwrap();
            let homo = &results[0]["matches"][0];
            assert_eq!(homo["is_synonym"], false);
            assert_eq!(homo["score"], 1.0);
            assert_eq!(homo["taxon"]["ott_id"], 11);
            let comp = &results[1]["matches"][0];
            assert_eq!(comp["is_synonym"], true);
            assert_eq!(comp["matched_name"], "Compositae");
            assert_eq!(comp["taxon"]["ott_id"], 20);
        });
    }

    #[test]
    fn test_match_names_fuzzy_fallback() {
        with_searcher(|s| {
            let names = vec!["Astraceae".to_string()];
            let v = match_names(s, &names, None, true, false).unwrap();
            let m = &v["results"][0]["matches"][0];
            assert_eq!(m["is_approximate_match"], true);
            assert_eq!(m["taxon"]["ott_id"], 20);
            let score = m["score"].as_f64().unwrap();
            assert!((score - 0.9).abs() < 1e-6);
            assert_eq!(v["unambiguous_names"], json!(["Astraceae"]));
            // without approximate matching the same name goes unmatched
            let v = match_names(s, &names, None, false, false).unwrap();
            assert_eq!(v["unmatched_names"], json!(["Astraceae"]));
        });
    }

    #[test]
    fn test_contexts_grouping() {
        let catalog = ContextCatalog::new();
        let v = contexts(&catalog);
        assert!(v["LIFE"].as_array().unwrap().contains(&json!("All life")));
        assert!(v["PLANTS"].as_array().unwrap().contains(&json!("Ferns")));
        assert_eq!(v["FUNGI"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_infer_context_endpoint() {
        with_searcher(|s| {
            let names = vec!["Homo".to_string(), "Wibble".to_string()];
            let v = infer_context(s, &names);
            assert_eq!(v["context_name"], "All life");
            assert_eq!(v["ambiguous_names"], json!(["Wibble"]));
        });
    }
}
