use criterion::{criterion_group, criterion_main, Criterion};

use treequery::ctrie::NameIndex;
use treequery::taxonomy::{TaxonRecord, TaxonomyBuilder};
use treequery::TaxRank;

/// A caterpillar of genera, each holding a handful of species, big enough
/// for the index and mrca timings to mean something.
fn build_taxonomy() -> treequery::Taxonomy {
    let mut b = TaxonomyBuilder::new().taxon(TaxonRecord {
        id: 1,
        parent_id: None,
        name: "Life".into(),
        ..Default::default()
    });
    let mut next_id = 2;
    for g in 0..500 {
        let genus_id = next_id;
        next_id += 1;
        b = b.taxon(TaxonRecord {
            id: genus_id,
            parent_id: Some(1),
            name: format!("Genus{:03}", g),
            rank: TaxRank::Genus,
            ..Default::default()
        });
        for s in 0..10 {
            b = b.taxon(TaxonRecord {
                id: next_id,
                parent_id: Some(genus_id),
                name: format!("Genus{:03} species{}", g, s),
                rank: TaxRank::Species,
                ..Default::default()
            });
            next_id += 1;
        }
    }
    b.build().expect("bench taxonomy builds")
}

fn fuzzy_bench(c: &mut Criterion) {
    let tax = build_taxonomy();
    let index = NameIndex::build(&tax);
    c.bench_function("fuzzy_query", |b| {
        b.iter(|| index.fuzzy_query("Genus250 specis7"));
    });
    c.bench_function("prefix_query", |b| {
        b.iter(|| index.prefix_query("Genus25"));
    });
}

fn mrca_bench(c: &mut Criterion) {
    let tax = build_taxonomy();
    let a = tax.taxon_ix_from_id(100).unwrap();
    let z = tax.taxon_ix_from_id(5000).unwrap();
    c.bench_function("mrca", |b| {
        b.iter(|| tax.mrca(a, z));
    });
}

criterion_group!(benches, fuzzy_bench, mrca_bench);
criterion_main!(benches);
