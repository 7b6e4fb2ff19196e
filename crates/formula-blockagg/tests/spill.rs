use formula_blockagg::{
    encode_key, encode_record, group_counters, AggDef, AggFn, Block, BlockHashAgg,
    BlockHashAggConfig, HashAggOptions, InMemorySpillLog, InputBatch, MaterializedRow, SpillBackend,
    SpillLog, SpillMergeReader, Value, VecBlockStream,
};
use pretty_assertions::assert_eq;
use std::cmp::Ordering;

fn batch(keys: &[&str], data: &[i64]) -> InputBatch {
    InputBatch::all_selected(
        keys.len(),
        vec![Block::from_values(keys.iter().map(|s| Value::string(s))).into()],
        vec![Block::from_values(data.iter().copied().map(Value::Int)).into()],
    )
}

fn abab_batches() -> Vec<InputBatch> {
    vec![
        batch(&["A", "A"], &[1, 2]),
        batch(&["B", "A"], &[3, 4]),
        batch(&["B", "B"], &[5, 6]),
    ]
}

fn config(options: HashAggOptions) -> BlockHashAggConfig {
    BlockHashAggConfig::builtin(
        vec![1],
        0,
        vec![2],
        vec![(3, AggDef::count()), (4, AggDef::sum(0)), (5, AggDef::max(0))],
        options,
    )
}

fn drain(agg: &mut BlockHashAgg) -> Vec<(MaterializedRow, MaterializedRow)> {
    let mut out = Vec::new();
    while let Some(batch) = agg.get_next().unwrap() {
        out.extend(batch.rows());
    }
    out.sort_by(|a, b| {
        a.0.iter()
            .zip(b.0.iter())
            .map(|(x, y)| x.total_cmp(y))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    });
    out
}

fn expected() -> Vec<(MaterializedRow, MaterializedRow)> {
    vec![
        (
            MaterializedRow::from(vec![Value::string("A")]),
            MaterializedRow::from(vec![Value::Int(3), Value::Int(7), Value::Int(4)]),
        ),
        (
            MaterializedRow::from(vec![Value::string("B")]),
            MaterializedRow::from(vec![Value::Int(3), Value::Int(14), Value::Int(6)]),
        ),
    ]
}

#[test]
fn spilling_after_every_batch_yields_the_same_groups() {
    let mut agg = BlockHashAgg::new(
        Box::new(VecBlockStream::new(abab_batches())),
        config(HashAggOptions {
            memory_limit_bytes: 1,
            ..HashAggOptions::default()
        }),
    );
    agg.open(false).unwrap();
    assert_eq!(drain(&mut agg), expected());

    let stats = *agg.spill_stats();
    assert_eq!(stats.spills, 3);
    // {A}, {B, A}, {B}
    assert_eq!(stats.spilled_records, 4);
    assert!(stats.spilled_bytes > 0);
    assert!(stats.spilled_data_storage_size > 0);
}

#[test]
fn forced_spilling_yields_the_same_groups() {
    let mut agg = BlockHashAgg::new(
        Box::new(VecBlockStream::new(abab_batches())),
        config(HashAggOptions {
            force_increased_spilling: true,
            ..HashAggOptions::default()
        }),
    );
    agg.open(false).unwrap();
    assert_eq!(drain(&mut agg), expected());
    assert_eq!(agg.spill_stats().spills, 3);
}

#[test]
fn spilling_in_the_middle_flushes_the_rest_at_end_of_input() {
    // Only the first batch is large enough to exceed the budget.
    let big_keys: Vec<String> = (0..40).map(|i| format!("key-{i:02}")).collect();
    let big_refs: Vec<&str> = big_keys.iter().map(String::as_str).collect();
    let batches = vec![batch(&big_refs, &[1; 40]), batch(&["key-00"], &[5])];

    let options = HashAggOptions {
        memory_limit_bytes: 2 * 1024,
        ..HashAggOptions::default()
    };
    let mut agg = BlockHashAgg::new(Box::new(VecBlockStream::new(batches)), config(options));
    agg.open(false).unwrap();
    assert_eq!(agg.spill_stats().spills, 2);

    let out = drain(&mut agg);
    assert_eq!(out.len(), 40);
    assert_eq!(
        out[0].1,
        MaterializedRow::from(vec![Value::Int(2), Value::Int(6), Value::Int(5)])
    );
}

#[cfg(feature = "sqlite")]
#[test]
fn sqlite_backend_spills_to_a_temporary_database() {
    let dir = tempfile::tempdir().unwrap();
    let mut agg = BlockHashAgg::new(
        Box::new(VecBlockStream::new(abab_batches())),
        config(HashAggOptions {
            force_increased_spilling: true,
            spill_backend: SpillBackend::Sqlite {
                dir: Some(dir.path().to_path_buf()),
            },
            ..HashAggOptions::default()
        }),
    );
    agg.open(false).unwrap();
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    assert_eq!(drain(&mut agg), expected());
    assert!(agg.spill_stats().spilled_data_storage_size > 0);

    agg.close();
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[cfg(feature = "sqlite")]
#[test]
fn reopen_while_draining_replaces_the_spill_database() {
    let dir = tempfile::tempdir().unwrap();
    let mut agg = BlockHashAgg::new(
        Box::new(VecBlockStream::new(abab_batches())),
        config(HashAggOptions {
            force_increased_spilling: true,
            block_out_size: 1,
            spill_backend: SpillBackend::Sqlite {
                dir: Some(dir.path().to_path_buf()),
            },
            ..HashAggOptions::default()
        }),
    );
    agg.open(false).unwrap();
    // Leave the merge cursor mid-log.
    assert_eq!(agg.get_next().unwrap().map(|batch| batch.len()), Some(1));

    agg.open(true).unwrap();
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    assert_eq!(drain(&mut agg), expected());

    agg.close();
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn in_memory_backend_is_an_explicit_opt_in() {
    let mut agg = BlockHashAgg::new(
        Box::new(VecBlockStream::new(abab_batches())),
        config(HashAggOptions {
            force_increased_spilling: true,
            spill_backend: SpillBackend::InMemory,
            ..HashAggOptions::default()
        }),
    );
    agg.open(false).unwrap();
    assert_eq!(drain(&mut agg), expected());
    assert!(agg.spill_stats().spilled_data_storage_size > 0);
}

#[test]
fn merge_reader_stashes_once_per_key_boundary() {
    let mut log = InMemorySpillLog::new();
    let k = [Value::string("K")];
    let l = [Value::string("L")];
    for partial in [1, 2, 3] {
        log.append(&encode_key(&k), &encode_record(&k, &[Value::Int(partial)]).unwrap()).unwrap();
    }
    for partial in [10, 20] {
        log.append(&encode_key(&l), &encode_record(&l, &[Value::Int(partial)]).unwrap()).unwrap();
    }

    let mut reader =
        SpillMergeReader::new(log.cursor().unwrap(), 1, vec![AggFn::Sum.merging_expr()]);
    let (key, accs) = reader.next_group().unwrap().unwrap();
    assert_eq!(key.as_slice(), &k);
    assert_eq!(accs.as_slice(), &[Value::Int(6)]);

    let (key, accs) = reader.next_group().unwrap().unwrap();
    assert_eq!(key.as_slice(), &l);
    assert_eq!(accs.as_slice(), &[Value::Int(30)]);

    assert!(reader.next_group().unwrap().is_none());
    assert_eq!(reader.stash_count(), 1);
    assert_eq!(reader.records_read(), 5);
}

#[test]
fn merge_reader_groups_interleaved_appends() {
    let mut log = InMemorySpillLog::new();
    // Two spill events, each dumping both keys.
    for (key, partial) in [("L", 1), ("K", 2), ("K", 3), ("L", 4)] {
        let key = [Value::string(key)];
        log.append(
            &encode_key(&key),
            &encode_record(&key, &[Value::Int(partial)]).unwrap(),
        )
        .unwrap();
    }

    let mut reader =
        SpillMergeReader::new(log.cursor().unwrap(), 1, vec![AggFn::Min.merging_expr()]);
    let mut groups = Vec::new();
    while let Some((key, accs)) = reader.next_group().unwrap() {
        groups.push((key[0].clone(), accs[0].clone()));
    }
    groups.sort_by(|a, b| a.0.total_cmp(&b.0));
    assert_eq!(
        groups,
        vec![
            (Value::string("K"), Value::Int(2)),
            (Value::string("L"), Value::Int(1)),
        ]
    );
}

#[test]
fn dropping_an_operator_publishes_group_counters() {
    let before = group_counters();
    {
        let mut agg = BlockHashAgg::new(
            Box::new(VecBlockStream::new(abab_batches())),
            config(HashAggOptions {
                force_increased_spilling: true,
                ..HashAggOptions::default()
            }),
        );
        agg.open(false).unwrap();
        drain(&mut agg);
    }
    let after = group_counters();
    assert!(after.spills >= before.spills + 3);
    assert!(after.spilled_records >= before.spilled_records + 4);
    assert!(after.spilled_data_storage_size > before.spilled_data_storage_size);
}
