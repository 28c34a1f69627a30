use criterion::{criterion_group, criterion_main, Criterion};
use metadata_manager_core::{
    diff, EntityKind, FieldMap, FieldValue, FilterConfig, HistoryEntry, HistoryId, HistoryType,
    KeywordQuery, Record, RecordId,
};
use time::OffsetDateTime;

fn mk_library(index: usize) -> Record {
    let phenotype = if index % 3 == 0 { "tumor" } else { "normal" };
    let mut fields = FieldMap::new();
    fields.insert("library_id".to_string(), FieldValue::Text(format!("L24{index:05}")));
    fields.insert("phenotype".to_string(), FieldValue::Text(phenotype.to_string()));
    fields.insert("assay".to_string(), FieldValue::Text("TsqNano".to_string()));
    let coverage = f64::from(u32::try_from(index % 120).unwrap_or(0));
    fields.insert("coverage".to_string(), FieldValue::Number(coverage));
    Record {
        id: RecordId::new(),
        kind: EntityKind::Library,
        fields,
        created_at: OffsetDateTime::UNIX_EPOCH,
        updated_at: OffsetDateTime::UNIX_EPOCH,
    }
}

fn mk_entry(record: &Record, position: u32) -> HistoryEntry {
    HistoryEntry {
        history_id: HistoryId::new(),
        record_id: record.id,
        kind: record.kind,
        position,
        history_type: HistoryType::Updated,
        recorded_at: OffsetDateTime::UNIX_EPOCH,
        fields: record.fields.clone(),
    }
}

fn bench_diff(c: &mut Criterion) {
    let record = mk_library(7);
    let older = mk_entry(&record, 1);
    let mut newer = mk_entry(&record, 2);
    newer.fields.insert("quality".to_string(), FieldValue::Text("good".to_string()));
    newer.fields.remove("assay");

    c.bench_function("diff_library_snapshots", |b| {
        b.iter(|| {
            let delta = diff(&newer, Some(&older));
            assert!(delta.is_ok());
        });
    });
}

fn bench_filter(c: &mut Criterion) {
    let records = (0..5_000).map(mk_library).collect::<Vec<_>>();
    let config = FilterConfig::standard(EntityKind::Library);
    let query = KeywordQuery::from_pairs([("phenotype", "tumor"), ("assay", "tsqnano")]);

    c.bench_function("filter_5000_libraries", |b| {
        b.iter(|| {
            let compiled = config.compile(&query);
            let count = compiled.map(|compiled| compiled.apply(&records).count()).unwrap_or(0);
            assert!(count > 0);
        });
    });
}

criterion_group!(benches, bench_diff, bench_filter);
criterion_main!(benches);
