// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::BufMut;

use super::*;
use crate::catalog::{CompressionMode, JobColumn};
use crate::types::{DataType, DataValue, Lbid, Oid, VolumeId};

fn test_options(dir: &tempfile::TempDir) -> BulkLoadOptions {
    BulkLoadOptions::default_for_test(dir.path().to_path_buf())
}

fn int_column(id: u32, oid: Oid, data_type: DataType) -> JobColumn {
    JobColumn::new(id, format!("c{id}"), oid, data_type)
}

fn int_batch(columns: usize, rows: std::ops::Range<i64>) -> Vec<Vec<DataValue>> {
    (0..columns)
        .map(|_| rows.clone().map(DataValue::Int).collect())
        .collect()
}

fn new_table(
    options: BulkLoadOptions,
    columns: Vec<JobColumn>,
    volumes: &[VolumeId],
    map: Arc<MemExtentMap>,
) -> TableLoader {
    TableLoader::new("t", columns, volumes, map, Arc::new(options)).unwrap()
}

fn placement(map: &MemExtentMap, oid: Oid) -> Vec<(VolumeId, u32, u16, u64)> {
    map.extents_of(oid)
        .iter()
        .map(|e| (e.volume, e.partition, e.segment, e.start_block))
        .collect()
}

#[test]
fn test_extents_rotate_across_volumes() {
    let dir = tempfile::tempdir().unwrap();
    let options = test_options(&dir);
    let map = Arc::new(MemExtentMap::new(&options));
    let table = new_table(
        options,
        vec![int_column(0, 10, DataType::Int32)],
        &[1, 2],
        map.clone(),
    );
    for start in (0..1536).step_by(128) {
        table.load_batch(int_batch(1, start..start + 128)).unwrap();
    }
    let summary = table.finish().unwrap();
    assert_eq!(summary.rows, 1536);
    assert_eq!(summary.extents_added, vec![3]);
    assert_eq!(
        placement(&map, 10),
        vec![(1, 0, 0, 0), (2, 0, 0, 0), (1, 0, 0, 32)]
    );
    assert_eq!(map.hwm(10, 1, 0, 0), Some(63));
    assert_eq!(map.hwm(10, 2, 0, 0), Some(31));
}

#[test]
fn test_sibling_columns_stay_aligned() {
    let dir = tempfile::tempdir().unwrap();
    let options = test_options(&dir);
    let map = Arc::new(MemExtentMap::new(&options));
    let table = new_table(
        options,
        vec![
            int_column(0, 10, DataType::Int32),
            int_column(1, 11, DataType::Int8),
            int_column(2, 12, DataType::Int64),
        ],
        &[1, 2, 3],
        map.clone(),
    );
    for start in (0..2600).step_by(200) {
        table.load_batch(int_batch(3, start..start + 200)).unwrap();
    }
    let summary = table.finish().unwrap();
    assert_eq!(summary.extents_added, vec![6, 6, 6]);

    let files = |oid| -> Vec<_> {
        placement(&map, oid)
            .into_iter()
            .map(|(v, p, s, _)| (v, p, s))
            .collect()
    };
    assert_eq!(files(10), files(11));
    assert_eq!(files(10), files(12));
    for column in table.columns() {
        assert_eq!(column.tracker().current_volume_idx(), 2);
    }
}

#[test]
fn test_raw_byte_accounting() {
    let dir = tempfile::tempdir().unwrap();
    let options = test_options(&dir);
    let map = Arc::new(MemExtentMap::new(&options));
    let table = new_table(
        options,
        vec![int_column(0, 10, DataType::Int16)],
        &[1],
        map,
    );
    let column = table.column(0).unwrap().clone();
    for start in (0..2000).step_by(150) {
        table.load_batch(int_batch(1, start..start + 150)).unwrap();
        let guard = column.lock();
        assert_eq!(
            guard.size_written() + guard.available_raw_bytes(),
            guard.total_raw_file_bytes()
        );
        assert!(guard.size_written() <= guard.total_raw_file_bytes());
        assert_eq!(guard.state(), LoadState::Loading);
    }
    column.intermediate_flush().unwrap();
    {
        let guard = column.lock();
        assert_eq!(guard.size_written() % 2, 0);
        assert!(guard.file_size().unwrap() >= guard.size_written());
    }
    table.finish().unwrap();
    assert_eq!(column.state(), LoadState::Closed);
}

#[test]
fn test_cp_split_across_extents() {
    let dir = tempfile::tempdir().unwrap();
    let options = test_options(&dir);
    let map = Arc::new(MemExtentMap::new(&options));
    let table = new_table(
        options,
        vec![int_column(0, 10, DataType::Int32)],
        &[1],
        map.clone(),
    );
    // 0..400 then 400..900 crosses the boundary at row 512
    table.load_batch(int_batch(1, 0..400)).unwrap();
    table.load_batch(int_batch(1, 400..900)).unwrap();
    let column = table.column(0).unwrap().clone();
    let entries = column.cp_entries();
    assert_eq!(entries.len(), 2);
    assert_eq!((entries[0].last_input_row, entries[0].min, entries[0].max), (511, 0, 511));
    assert_eq!((entries[1].last_input_row, entries[1].min, entries[1].max), (1023, 512, 899));

    let summary = table.finish().unwrap();
    let cp = &summary.report.column(0).unwrap().cp_updates;
    assert_eq!(cp.len(), 2);
    assert!(cp.iter().all(|u| u.is_new_extent));
    let extents = map.extents_of(10);
    assert_eq!(extents[0].cp, Some((0, 511)));
    assert_eq!(extents[1].cp, Some((512, 899)));
}

#[test]
fn test_abbreviated_extent_expands_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = test_options(&dir);
    options.abbreviated_extent_rows = Some(128);
    let map = Arc::new(MemExtentMap::new(&options));
    let table = new_table(
        options.clone(),
        vec![int_column(0, 10, DataType::Int32)],
        &[1],
        map,
    );
    let column = table.column(0).unwrap().clone();

    table.load_batch(int_batch(1, 0..100)).unwrap();
    assert!(column.is_abbrev_extent());
    assert_eq!(column.lock().total_raw_file_bytes(), 512);

    let mut hwms = vec![column.get_seg_file_info().hwm];
    for start in (100..500).step_by(100) {
        table.load_batch(int_batch(1, start..start + 100)).unwrap();
        hwms.push(column.get_seg_file_info().hwm);
    }
    assert!(!column.is_abbrev_extent());
    assert_eq!(column.lock().total_raw_file_bytes(), 2048);
    assert!(hwms.windows(2).all(|w| w[0] <= w[1]));

    let info = column.get_seg_file_info();
    table.finish().unwrap();
    let data = std::fs::read(info.path.unwrap()).unwrap();
    assert_eq!(data.len(), 2048);
    let mut expected = Vec::new();
    for v in 0..500i32 {
        expected.put_i32_le(v);
    }
    assert_eq!(&data[..2000], &expected[..]);
    assert_eq!(&data[2000..2004], &(i32::MIN + 1).to_le_bytes());
}

#[test]
fn test_resume_partial_extent() {
    let dir = tempfile::tempdir().unwrap();
    let options = test_options(&dir);
    let map = Arc::new(MemExtentMap::new(&options));

    let first = new_table(
        options.clone(),
        vec![int_column(0, 10, DataType::Int32)],
        &[1],
        map.clone(),
    );
    first.load_batch(int_batch(1, 0..100)).unwrap();
    first.finish().unwrap();
    assert_eq!(map.hwm(10, 1, 0, 0), Some(6));
    let first_lbid = map.extents_of(10)[0].start_lbid;
    assert_eq!(map.extents_of(10)[0].cp, Some((0, 99)));

    let second = new_table(
        options,
        vec![int_column(0, 10, DataType::Int32)],
        &[1],
        map.clone(),
    );
    let column = second.column(0).unwrap().clone();
    // block 6 is partially written, so loading resumes at block 7
    assert_eq!(column.last_input_row_in_extent(), 512 - 7 * 16 - 1);
    second.load_batch(int_batch(1, 1000..1401)).unwrap();
    let summary = second.finish().unwrap();
    assert_eq!(summary.extents_added, vec![1]);

    let update = summary.report.column(0).unwrap();
    assert_eq!(
        update.invalidate,
        Some(SavedExtentState {
            start_lbid: first_lbid,
            saved_hwm: 6
        })
    );
    let cp: Vec<_> = update
        .cp_updates
        .iter()
        .map(|u| (u.start_lbid, u.is_new_extent))
        .collect();
    assert_eq!(cp[0], (first_lbid, false));
    assert!(cp[1].1);

    let extents = map.extents_of(10);
    assert_eq!(extents.len(), 2);
    assert_eq!(extents[0].cp, None);
    assert_eq!(extents[1].cp, Some((1400, 1400)));
    assert_eq!(map.hwm(10, 1, 0, 0), Some(32));

    let path = path_of_segment_file(&test_options(&dir), 10, 1, 0, 0);
    let data = std::fs::read(path).unwrap();
    assert_eq!(&data[396..400], &99i32.to_le_bytes());
    assert_eq!(&data[400..404], &(i32::MIN + 1).to_le_bytes());
    assert_eq!(&data[448..452], &1000i32.to_le_bytes());
    assert_eq!(&data[2048..2052], &1400i32.to_le_bytes());
}

#[test]
fn test_full_extent_skips_to_new_extent() {
    let dir = tempfile::tempdir().unwrap();
    let options = test_options(&dir);
    let map = Arc::new(MemExtentMap::new(&options));
    let first = new_table(
        options.clone(),
        vec![int_column(0, 10, DataType::Int32)],
        &[1],
        map.clone(),
    );
    first.load_batch(int_batch(1, 0..512)).unwrap();
    first.finish().unwrap();
    assert_eq!(map.hwm(10, 1, 0, 0), Some(31));

    let second = new_table(
        options,
        vec![int_column(0, 10, DataType::Int32)],
        &[1],
        map.clone(),
    );
    assert_eq!(second.column(0).unwrap().last_input_row_in_extent(), 511);
    second.load_batch(int_batch(1, 0..10)).unwrap();
    let summary = second.finish().unwrap();
    assert_eq!(summary.extents_added, vec![1]);
    assert_eq!(summary.report.column(0).unwrap().invalidate, None);
    assert_eq!(placement(&map, 10), vec![(1, 0, 0, 0), (1, 0, 0, 32)]);
    assert_eq!(map.hwm(10, 1, 0, 0), Some(32));
}

#[test]
fn test_concurrent_allocation_is_exclusive() {
    let dir = tempfile::tempdir().unwrap();
    let options = test_options(&dir);
    let map = MemExtentMap::new(&options);
    let allocated: Vec<AllocatedExtent> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let map = &map;
                s.spawn(move || {
                    (0..16)
                        .map(|_| map.create_column_extent(10 + t % 2, 4, 1).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });
    assert_eq!(allocated.len(), 64);

    let mut ranges: Vec<(Lbid, Lbid)> = allocated
        .iter()
        .map(|e| (e.start_lbid, e.start_lbid + e.blocks as Lbid))
        .collect();
    ranges.sort();
    assert!(ranges.windows(2).all(|w| w[0].1 <= w[1].0));

    for oid in [10, 11] {
        let places: HashSet<_> = placement(&map, oid).into_iter().collect();
        assert_eq!(places.len(), 32);
    }
}

#[test]
fn test_sections_released_out_of_order() {
    let dir = tempfile::tempdir().unwrap();
    let options = test_options(&dir);
    let map = Arc::new(MemExtentMap::new(&options));
    let table = new_table(
        options,
        vec![int_column(0, 10, DataType::Int32)],
        &[1],
        map,
    );
    let column = table.column(0).unwrap().clone();
    let sections: Vec<_> = (0..8).map(|_| column.reserve_section(100).unwrap()).collect();
    std::thread::scope(|s| {
        for mut section in sections.into_iter().rev() {
            let column = &column;
            s.spawn(move || {
                let start = section.start_row() as i32;
                let buf = section.fixed_mut().unwrap();
                for v in start..start + 100 {
                    buf.put_i32_le(v);
                }
                column.release_section(section).unwrap();
            });
        }
    });
    column.finish_parsing().unwrap();
    assert_eq!(column.extents_added(), 2);

    let path = path_of_segment_file(&test_options(&dir), 10, 1, 0, 0);
    let data = std::fs::read(path).unwrap();
    let values: Vec<i32> = data[..3200]
        .chunks(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    assert_eq!(values, (0..800).collect::<Vec<_>>());
}

#[test]
fn test_dictionary_tokens_follow_segment_file() {
    let dir = tempfile::tempdir().unwrap();
    let options = test_options(&dir);
    let map = Arc::new(MemExtentMap::new(&options));
    let name = JobColumn::new(0, "name", 20, DataType::Varchar(10)).with_dictionary_oid(21);
    let table = new_table(options.clone(), vec![name], &[1], map.clone());
    let column = table.column(0).unwrap().clone();

    let values = |rows: std::ops::Range<u64>| -> Vec<Vec<DataValue>> {
        vec![rows
            .map(|r| match r % 6 {
                5 => DataValue::Null,
                4 => DataValue::String("truncated-value".into()),
                n => DataValue::String(format!("name{n}")),
            })
            .collect()]
    };
    table.load_batch(values(0..300)).unwrap();
    table.load_batch(values(300..600)).unwrap();
    let summary = table.finish().unwrap();
    assert_eq!(summary.extents_added, vec![2]);
    assert_eq!(summary.saturated_rows, 100);
    assert!(summary.report.column(0).unwrap().cp_updates.is_empty());

    let hwm_updates = &summary.report.column(0).unwrap().hwm_updates;
    assert!(hwm_updates.iter().any(|u| u.oid == 21));
    assert_eq!(map.hwm(20, 1, 0, 0), Some(74));
    assert_eq!(map.hwm(21, 1, 0, 0), Some(0));

    let key = DictionaryFileKey {
        oid: 21,
        volume: 1,
        partition: 0,
        segment: 0,
    };
    assert!(path_of_dictionary_file(&options, &key).exists());

    let data = std::fs::read(path_of_segment_file(&options, 20, 1, 0, 0)).unwrap();
    let token = |row: usize| u64::from_le_bytes(data[row * 8..row * 8 + 8].try_into().unwrap());
    // name0 name1 name2 name3 truncated- null
    let first: Vec<_> = (0..6).map(token).collect();
    assert_eq!(first, vec![0, 9, 18, 27, 36, crate::types::NULL_TOKEN]);
    // the second extent reopens the same store, so tokens are shared
    assert_eq!(token(516), 0);
    assert_eq!(token(517), 9);

    // only the first extent added strings to the store
    assert_eq!(
        column.get_dict_flush_blks(),
        vec![DictionaryBlocks {
            key,
            first_block: 0,
            last_block: 0
        }]
    );
}

#[test]
fn test_compressed_column() {
    let dir = tempfile::tempdir().unwrap();
    let options = test_options(&dir);
    let map = Arc::new(MemExtentMap::new(&options));
    let column = int_column(0, 10, DataType::Int16).with_compression(CompressionMode::Compressed);
    let table = new_table(options.clone(), vec![column.clone()], &[1], map.clone());
    for start in (0..1200).step_by(300) {
        table.load_batch(int_batch(1, start..start + 300)).unwrap();
    }
    let summary = table.finish().unwrap();
    assert_eq!(summary.extents_added, vec![3]);
    assert_eq!(
        placement(&map, 10),
        vec![(1, 0, 0, 0), (1, 0, 0, 16), (1, 0, 1, 0)]
    );

    let mut backend = new_segment_backend(&column, &options);
    backend
        .open(&path_of_segment_file(&options, 10, 1, 0, 0))
        .unwrap();
    assert_eq!(backend.raw_len(), 2048);
    assert_eq!(backend.read_at(0, 4).unwrap(), vec![0, 0, 1, 0]);
    assert_eq!(backend.read_at(2046, 2).unwrap(), 1023i16.to_le_bytes().to_vec());
    backend.close(false).unwrap();

    backend
        .open(&path_of_segment_file(&options, 10, 1, 0, 1))
        .unwrap();
    assert_eq!(backend.read_at(0, 2).unwrap(), 1024i16.to_le_bytes().to_vec());
    assert_eq!(backend.read_at(352, 2).unwrap(), (i16::MIN + 1).to_le_bytes().to_vec());
    backend.close(false).unwrap();
}

#[test]
fn test_auto_increment_fills_nulls() {
    let dir = tempfile::tempdir().unwrap();
    let options = test_options(&dir);
    let map = Arc::new(MemExtentMap::new(&options));
    let id = int_column(0, 10, DataType::Int64).with_auto_increment(true);
    let table = new_table(options.clone(), vec![id], &[1], map);
    assert!(table.load_batch(vec![vec![DataValue::Null]]).is_err());
    assert_eq!(table.status(), Status::Error);

    let dir = tempfile::tempdir().unwrap();
    let options = test_options(&dir);
    let map = Arc::new(MemExtentMap::new(&options));
    let id = int_column(0, 10, DataType::Int64).with_auto_increment(true);
    let table = new_table(options.clone(), vec![id], &[1], map);
    table.init_auto_inc(100).unwrap();
    let mut batch = vec![DataValue::Null; 10];
    batch[3] = DataValue::Int(7);
    table.load_batch(vec![batch]).unwrap();
    let summary = table.finish().unwrap();
    assert_eq!(summary.auto_inc_next, Some(109));
    let cp = &summary.report.column(0).unwrap().cp_updates;
    assert_eq!((cp[0].min, cp[0].max), (7, 108));
}

#[test]
fn test_abort_reports_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let options = test_options(&dir);
    let map = Arc::new(MemExtentMap::new(&options));
    let table = new_table(
        options,
        vec![int_column(0, 10, DataType::Int32)],
        &[1],
        map.clone(),
    );
    table.load_batch(int_batch(1, 0..600)).unwrap();
    table.abort();
    assert_eq!(table.status(), Status::Error);
    assert_eq!(table.column(0).unwrap().state(), LoadState::Error);
    assert!(table.load_batch(int_batch(1, 0..1)).is_err());
    assert!(table.finish().is_err());
    // extents were allocated, but no HWM moved past its starting block
    assert_eq!(map.hwm(10, 1, 0, 0), Some(0));
}

#[test]
fn test_batch_shape_is_checked() {
    let dir = tempfile::tempdir().unwrap();
    let options = test_options(&dir);
    let map = Arc::new(MemExtentMap::new(&options));
    let table = new_table(
        options,
        vec![int_column(0, 10, DataType::Int32), int_column(1, 11, DataType::Int32)],
        &[1],
        map,
    );
    assert!(table.load_batch(int_batch(1, 0..10)).is_err());
    let mut batch = int_batch(2, 0..10);
    batch[1].pop();
    assert!(table.load_batch(batch).is_err());
    assert_eq!(table.load_batch(vec![vec![], vec![]]).unwrap(), 0);
}

#[test]
fn test_no_volumes() {
    let dir = tempfile::tempdir().unwrap();
    let options = test_options(&dir);
    let map = Arc::new(MemExtentMap::new(&options));
    let result = TableLoader::new(
        "t",
        vec![int_column(0, 10, DataType::Int32)],
        &[],
        map,
        Arc::new(options),
    );
    assert!(matches!(
        result.map(|_| ()).unwrap_err().kind(),
        BulkLoadError::NoVolumes(10)
    ));
}

#[test]
fn test_guard_extends_when_extent_fills() {
    let dir = tempfile::tempdir().unwrap();
    let options = test_options(&dir);
    let map = Arc::new(MemExtentMap::new(&options));
    let table = new_table(
        options,
        vec![int_column(0, 10, DataType::Int8)],
        &[1],
        map.clone(),
    );
    let column = table.column(0).unwrap().clone();
    assert!(column.create_delayed_file_if_needed("t").unwrap());
    assert!(!column.create_delayed_file_if_needed("t").unwrap());
    {
        let mut guard = column.lock();
        guard.write_to_file(&[1; 512]).unwrap();
        assert_eq!(guard.available_raw_bytes(), 0);
        assert!(!guard.is_file_complete());
        guard.write_to_file(&[2; 512]).unwrap();
        assert!(guard.is_file_complete());
        guard.extend_column(false).unwrap();
        assert_eq!(guard.total_raw_file_bytes(), 512);
        assert!(!guard.is_file_complete());
    }
    assert_eq!(column.extents_added(), 3);
    assert_eq!(
        placement(&map, 10),
        vec![(1, 0, 0, 0), (1, 0, 0, 8), (1, 0, 1, 0)]
    );
    column.finish_parsing().unwrap();
    assert!(column.finish_parsing().is_err());
}

fn i32_values(data: &[u8]) -> Vec<i32> {
    data.chunks(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[test]
fn test_expand_abbreviated_extent_moves_cursor_to_last_row() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = test_options(&dir);
    options.abbreviated_extent_rows = Some(128);
    let map = Arc::new(MemExtentMap::new(&options));
    let table = new_table(
        options,
        vec![int_column(0, 10, DataType::Int32)],
        &[1],
        map,
    );
    let column = table.column(0).unwrap().clone();
    table.load_batch(int_batch(1, 0..100)).unwrap();
    column.intermediate_flush().unwrap();
    column.expand_abbrev_extent(false).unwrap();
    {
        let guard = column.lock();
        assert!(!guard.is_abbrev_extent());
        assert_eq!(guard.size_written(), 400);
        assert_eq!(guard.available_raw_bytes(), 2048 - 400);
    }

    table.load_batch(int_batch(1, 100..200)).unwrap();
    column.intermediate_flush().unwrap();
    assert_eq!(column.state(), LoadState::Loading);
    let info = column.get_seg_file_info();
    table.finish().unwrap();

    let data = std::fs::read(info.path.unwrap()).unwrap();
    assert_eq!(data.len(), 2048);
    assert_eq!(i32_values(&data[..800]), (0..200).collect::<Vec<_>>());
}

#[test]
fn test_resume_partial_extent_on_next_volume() {
    let dir = tempfile::tempdir().unwrap();
    let options = test_options(&dir);
    let map = Arc::new(MemExtentMap::new(&options));
    for volume in [1, 2] {
        let table = new_table(
            options.clone(),
            vec![int_column(0, 10, DataType::Int32)],
            &[volume],
            map.clone(),
        );
        table.load_batch(int_batch(1, 0..100)).unwrap();
        table.finish().unwrap();
        assert_eq!(map.hwm(10, volume, 0, 0), Some(6));
    }

    let table = new_table(
        options.clone(),
        vec![int_column(0, 10, DataType::Int32)],
        &[1, 2],
        map.clone(),
    );
    for start in (0..1000).step_by(250) {
        table.load_batch(int_batch(1, start..start + 250)).unwrap();
    }
    let column = table.column(0).unwrap().clone();
    let last_rows: Vec<_> = column.cp_entries().iter().map(|e| e.last_input_row).collect();
    assert_eq!(last_rows, vec![399, 799, 1311]);
    let summary = table.finish().unwrap();
    assert_eq!(summary.extents_added, vec![1]);

    let extents = map.extents_of(10);
    let by_place: Vec<_> = extents
        .iter()
        .map(|e| (e.volume, e.start_block, e.cp))
        .collect();
    // the starting extent is invalidated, the one resumed on volume 2 merges
    assert!(by_place.contains(&(1, 0, None)));
    assert!(by_place.contains(&(2, 0, Some((0, 799)))));
    assert!(by_place.contains(&(1, 32, Some((800, 999)))));
    assert_eq!(map.hwm(10, 1, 0, 0), Some(44));
    assert_eq!(map.hwm(10, 2, 0, 0), Some(31));

    let read = |volume| std::fs::read(path_of_segment_file(&options, 10, volume, 0, 0)).unwrap();
    let first = read(1);
    assert_eq!(i32_values(&first[448..2048]), (0..400).collect::<Vec<_>>());
    assert_eq!(i32_values(&first[2048..2848]), (800..1000).collect::<Vec<_>>());
    let second = read(2);
    assert_eq!(i32_values(&second[..400]), (0..100).collect::<Vec<_>>());
    assert_eq!(i32_values(&second[448..2048]), (400..800).collect::<Vec<_>>());
}

#[test]
fn test_mixed_width_resume_starts_new_extents() {
    let dir = tempfile::tempdir().unwrap();
    let options = test_options(&dir);
    let map = Arc::new(MemExtentMap::new(&options));
    let columns = || {
        vec![
            int_column(0, 10, DataType::Int64),
            int_column(1, 11, DataType::Int32),
        ]
    };
    let first = new_table(options.clone(), columns(), &[1], map.clone());
    first.load_batch(int_batch(2, 0..100)).unwrap();
    first.finish().unwrap();
    // 100 rows leave 408 rows of room in the Int64 extent but 400 in the Int32 one
    assert_eq!(map.hwm(10, 1, 0, 0), Some(12));
    assert_eq!(map.hwm(11, 1, 0, 0), Some(6));

    let second = new_table(options.clone(), columns(), &[1], map.clone());
    for column in second.columns() {
        assert_eq!(column.last_input_row_in_extent(), 511);
    }
    second.load_batch(int_batch(2, 0..300)).unwrap();
    second.load_batch(int_batch(2, 300..700)).unwrap();
    let summary = second.finish().unwrap();
    assert_eq!(summary.extents_added, vec![2, 2]);
    for column in 0..2 {
        assert_eq!(summary.report.column(column).unwrap().invalidate, None);
    }

    assert_eq!(
        placement(&map, 10),
        vec![(1, 0, 0, 0), (1, 0, 0, 64), (1, 0, 1, 0)]
    );
    assert_eq!(
        placement(&map, 11),
        vec![(1, 0, 0, 0), (1, 0, 0, 32), (1, 0, 1, 0)]
    );
    for oid in [10, 11] {
        let cp: Vec<_> = map.extents_of(oid).iter().map(|e| e.cp).collect();
        assert_eq!(cp, vec![Some((0, 99)), Some((0, 511)), Some((512, 699))]);
    }

    let narrow = std::fs::read(path_of_segment_file(&options, 11, 1, 0, 0)).unwrap();
    assert_eq!(i32_values(&narrow[2048..4096]), (0..512).collect::<Vec<_>>());
    let wide = std::fs::read(path_of_segment_file(&options, 10, 1, 0, 1)).unwrap();
    let wide: Vec<i64> = wide[..188 * 8]
        .chunks(8)
        .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
        .collect();
    assert_eq!(wide, (512..700).collect::<Vec<_>>());
}

#[test]
fn test_uneven_partial_extents_are_not_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let options = test_options(&dir);
    let map = Arc::new(MemExtentMap::new(&options));
    let columns = || {
        vec![
            int_column(0, 10, DataType::Int64),
            int_column(1, 11, DataType::Int32),
        ]
    };
    // both columns have room for 352 more rows on volume 1, but not the same
    // room on volume 2
    let even = new_table(options.clone(), columns(), &[1], map.clone());
    even.load_batch(int_batch(2, 0..160)).unwrap();
    even.finish().unwrap();
    let uneven = new_table(options.clone(), columns(), &[2], map.clone());
    uneven.load_batch(int_batch(2, 0..100)).unwrap();
    uneven.finish().unwrap();

    let table = new_table(options, columns(), &[1, 2], map.clone());
    for column in table.columns() {
        assert_eq!(column.last_input_row_in_extent(), 351);
        let volumes: Vec<_> = column
            .tracker()
            .volume_extent_list()
            .iter()
            .map(|e| (e.volume, e.state))
            .collect();
        assert_eq!(
            volumes,
            vec![
                (1, ExtentState::PartialExtent),
                (2, ExtentState::ExtentBoundary)
            ]
        );
    }
    table.load_batch(int_batch(2, 0..1200)).unwrap();
    for column in table.columns() {
        let last_rows: Vec<_> = column.cp_entries().iter().map(|e| e.last_input_row).collect();
        assert_eq!(last_rows, vec![351, 863, 1375]);
    }
    let summary = table.finish().unwrap();
    assert_eq!(summary.extents_added, vec![2, 2]);
    for oid in [10, 11] {
        let cp: Vec<_> = map
            .extents_of(oid)
            .iter()
            .map(|e| (e.volume, e.cp))
            .collect();
        assert_eq!(
            cp,
            vec![
                (1, None),
                (2, Some((0, 99))),
                (2, Some((352, 863))),
                (1, Some((864, 1199)))
            ]
        );
    }
}

#[test]
fn test_failed_column_reports_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let options = test_options(&dir);
    let map = Arc::new(MemExtentMap::new(&options));
    let table = new_table(
        options,
        vec![int_column(0, 10, DataType::Int32)],
        &[1],
        map,
    );
    table.load_batch(int_batch(1, 0..10)).unwrap();
    let column = table.column(0).unwrap().clone();
    column.abort();
    let mut report = ExtentMapReport::default();
    assert!(matches!(
        column.get_brm_update_info(&mut report).unwrap_err().kind(),
        BulkLoadError::InvalidState(_)
    ));
    assert!(report.columns.is_empty());
}

#[test]
fn test_abort_truncates_dictionary_store() {
    let dir = tempfile::tempdir().unwrap();
    let options = test_options(&dir);
    let map = Arc::new(MemExtentMap::new(&options));
    let name = JobColumn::new(0, "name", 20, DataType::Varchar(100)).with_dictionary_oid(21);
    let table = new_table(options.clone(), vec![name], &[1], map);
    let column = table.column(0).unwrap().clone();

    let values = (0..400)
        .map(|i| DataValue::String(format!("{i:0>100}")))
        .collect();
    table.load_batch(vec![values]).unwrap();
    column.intermediate_flush().unwrap();
    let key = DictionaryFileKey {
        oid: 21,
        volume: 1,
        partition: 0,
        segment: 0,
    };
    let path = path_of_dictionary_file(&options, &key);
    assert!(std::fs::metadata(&path).unwrap().len() > 0);

    table.abort();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    assert!(column.get_dict_flush_blks().is_empty());
}

#[test]
fn test_truncate_dictionary_store_through_guard() {
    let dir = tempfile::tempdir().unwrap();
    let options = test_options(&dir);
    let map = Arc::new(MemExtentMap::new(&options));
    let name = JobColumn::new(0, "name", 20, DataType::Varchar(20)).with_dictionary_oid(21);
    let table = new_table(options.clone(), vec![name], &[1], map);
    let column = table.column(0).unwrap().clone();
    let values = (0..50).map(|i| DataValue::String(format!("value{i}"))).collect();
    table.load_batch(vec![values]).unwrap();
    column.intermediate_flush().unwrap();

    let key = DictionaryFileKey {
        oid: 21,
        volume: 1,
        partition: 0,
        segment: 0,
    };
    let path = path_of_dictionary_file(&options, &key);
    {
        let mut guard = column.lock();
        guard.truncate_dctnry_store().unwrap();
        assert!(guard.dict_flush_blocks().is_empty());
        assert_eq!(guard.state(), LoadState::Loading);
    }
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
}
