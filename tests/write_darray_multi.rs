//! Multi-variable writes, record frames, fill coverage, and the
//! deferred-release contract of the nonblocking parallel backend.

mod common;

use common::{f64_bytes, f64_record, i32_bytes, i32_record, run_world, WorldCfg};
use pario::backend::{IoType, MemBackend, MemStore};
use pario::darray::{read_darray, write_darray, write_darray_multi};
use pario::decomp::IoDesc;
use pario::dtype::ElemType;
use pario::error::Error;
use pario::file::{File, Mode};
use std::sync::Arc;

fn mem_file(ios: &pario::iosystem::IoSystem, ncid: i32, iotype: IoType, store: &Arc<MemStore>) -> File {
    File::create(
        ios,
        ncid,
        iotype,
        Mode::Write,
        Box::new(MemBackend::new(Arc::clone(store), iotype)),
    )
}

/// Two variables in one call land in both records.
#[test]
fn test_two_vars_one_call() {
    let store = MemStore::new();
    let probe = Arc::clone(&store);
    run_world(WorldCfg::intracomm(2, 2), move |ios| {
        let c = ios.comp_rank().unwrap();
        let ioid = ios.define_decomp(IoDesc::block(40, 2, 2, Some(c), ios.io_rank(), ElemType::F64));
        let mut file = mem_file(ios, 0, IoType::ParallelV4, &store);
        let v0 = file.def_var(ElemType::F64, 1);
        let v1 = file.def_var(ElemType::F64, 1);

        let mut arrays = f64_bytes((0..20).map(|i| (c * 20 + i) as f64));
        arrays.extend(f64_bytes((0..20).map(|i| (c * 20 + i) as f64 + 0.5)));
        write_darray_multi(ios, &mut file, &[v0, v1], ioid, 20, &arrays, None, None, true).unwrap();
    });
    let r0 = f64_record(&probe.snapshot(0, -1).unwrap());
    let r1 = f64_record(&probe.snapshot(1, -1).unwrap());
    for g in 0..40 {
        assert_eq!(r0[g], g as f64);
        assert_eq!(r1[g], g as f64 + 0.5);
    }
}

/// Record variables: frames route payloads to per-record storage.
#[test]
fn test_record_frames() {
    let store = MemStore::new();
    let probe = Arc::clone(&store);
    run_world(WorldCfg::intracomm(2, 1), move |ios| {
        let c = ios.comp_rank().unwrap();
        let ioid = ios.define_decomp(IoDesc::block(20, 2, 1, Some(c), ios.io_rank(), ElemType::I32));
        let mut file = mem_file(ios, 0, IoType::SerialV3, &store);
        let v = file.def_var(ElemType::I32, 2);
        file.set_frame(v, 0).unwrap();
        let frame0 = i32_bytes((0..10).map(|i| (c * 10 + i) as i32));
        write_darray(ios, &mut file, v, ioid, 10, &frame0, None).unwrap();
        file.advance_frame(v).unwrap();
        let frame1 = i32_bytes((0..10).map(|i| (c * 10 + i) as i32 + 100));
        write_darray(ios, &mut file, v, ioid, 10, &frame1, None).unwrap();
        file.close(ios).unwrap();
    });
    let r0 = i32_record(&probe.snapshot(0, 0).unwrap());
    let r1 = i32_record(&probe.snapshot(0, 1).unwrap());
    assert_eq!(r0, (0..20).collect::<Vec<i32>>());
    assert_eq!(r1, (100..120).collect::<Vec<i32>>());
}

/// Box decomposition with fill: every on-disk element is either a
/// user-provided value or the variable's fill value.
#[test]
fn test_box_fill_coverage() {
    let store = MemStore::new();
    let probe = Arc::clone(&store);
    run_world(WorldCfg::intracomm(2, 2), move |ios| {
        let c = ios.comp_rank().unwrap();
        // The two compute tasks cover only even global indices.
        let maps: Vec<Vec<usize>> = vec![
            (0..10).map(|i| i * 2).collect(),
            (10..20).map(|i| i * 2).collect(),
        ];
        let d = IoDesc::boxed(40, 2, &maps, Some(c), ios.io_rank(), ElemType::F64);
        assert!(d.needsfill);
        assert_eq!(d.holegridsize, 0);
        let ioid = ios.define_decomp(d);
        let mut file = mem_file(ios, 0, IoType::ParallelV4, &store);
        let v = file.def_var(ElemType::F64, 1);
        let data = f64_bytes(maps[c].iter().map(|&g| g as f64));
        let fill = (-7.0f64).to_ne_bytes();
        write_darray(ios, &mut file, v, ioid, 10, &data, Some(&fill)).unwrap();
        file.close(ios).unwrap();
    });
    let rec = f64_record(&probe.snapshot(0, -1).unwrap());
    assert_eq!(rec.len(), 40);
    for (g, &val) in rec.iter().enumerate() {
        if g % 2 == 0 {
            assert_eq!(val, g as f64, "user value at {g}");
        } else {
            assert_eq!(val, -7.0, "fill value at {g}");
        }
    }
}

/// Subset decomposition with holes: the data pass covers the regions
/// and the fill pass covers the holegrid.
#[test]
fn test_subset_hole_fill_coverage() {
    for iotype in [
        IoType::SerialV3,
        IoType::ParallelV3,
        IoType::ParallelV4,
    ] {
        let store = MemStore::new();
        let probe = Arc::clone(&store);
        run_world(WorldCfg::intracomm(2, 2), move |ios| {
            let c = ios.comp_rank().unwrap();
            // 40 elements written per task; 10 holes per io task.
            let maps: Vec<Vec<usize>> =
                vec![(0..40).collect(), (50..90).collect()];
            let d = IoDesc::subset(100, 2, &maps, Some(c), ios.io_rank(), ElemType::F64);
            assert_eq!(d.holegridsize, 10);
            assert!(d.needsfill);
            let ioid = ios.define_decomp(d);
            let mut file = mem_file(ios, 0, iotype, &store);
            let v = file.def_var(ElemType::F64, 1);
            let data = f64_bytes(maps[c].iter().map(|&g| g as f64));
            let fill = (1.0e30f64).to_ne_bytes();
            write_darray(ios, &mut file, v, ioid, 40, &data, Some(&fill)).unwrap();
            file.close(ios).unwrap();

            // Read back only touches the written regions.
            let mut fileb = mem_file(ios, 1, iotype, &store);
            let vb = fileb.def_var(ElemType::F64, 1);
            assert_eq!(vb, v);
            let mut back = vec![0u8; data.len()];
            read_darray(ios, &mut fileb, vb, ioid, 40, &mut back).unwrap();
            assert_eq!(back, data);
        });
        let rec = f64_record(&probe.snapshot(0, -1).unwrap());
        for (g, &val) in rec.iter().enumerate() {
            if (0..40).contains(&g) || (50..90).contains(&g) {
                assert_eq!(val, g as f64, "{iotype:?} user value at {g}");
            } else {
                assert_eq!(val, 1.0e30, "{iotype:?} fill value at {g}");
            }
        }
    }
}

/// The nonblocking parallel backend owns the scratch buffers until its
/// flush: nothing reaches storage and the pool stays charged until the
/// explicit flush.
#[test]
fn test_parallel_v3_deferred_release() {
    let store = MemStore::new();
    let probe = Arc::clone(&store);
    run_world(WorldCfg::intracomm(1, 1), move |ios| {
        let ioid = ios.define_decomp(IoDesc::block(32, 1, 1, Some(0), ios.io_rank(), ElemType::I32));
        let mut file = mem_file(ios, 0, IoType::ParallelV3, &store);
        let v = file.def_var(ElemType::I32, 1);
        let data = i32_bytes(0..32);
        // Buffered write: not pushed to disk.
        write_darray_multi(ios, &mut file, &[v], ioid, 32, &data, None, None, false).unwrap();
        assert!(store.snapshot(v, -1).is_none(), "deferred write became visible");
        assert!(ios.pool().stats().curalloc > 0, "scratch released too early");

        file.sync(ios).unwrap();
        assert!(store.snapshot(v, -1).is_some());
        assert_eq!(ios.pool().stats().curalloc, 0, "scratch not released by flush");
        file.close(ios).unwrap();
    });
    assert_eq!(i32_record(&probe.snapshot(0, -1).unwrap()), (0..32).collect::<Vec<i32>>());
}

/// A second buffered write completes the previous one first: the
/// pre-flush keeps at most one scratch buffer outstanding per file.
#[test]
fn test_parallel_v3_preflush_on_next_write() {
    let store = MemStore::new();
    run_world(WorldCfg::intracomm(1, 1), move |ios| {
        let ioid = ios.define_decomp(IoDesc::block(16, 1, 1, Some(0), ios.io_rank(), ElemType::I32));
        let mut file = mem_file(ios, 0, IoType::ParallelV3, &store);
        let v0 = file.def_var(ElemType::I32, 1);
        let v1 = file.def_var(ElemType::I32, 1);
        let a = i32_bytes(0..16);
        let b = i32_bytes(100..116);
        write_darray_multi(ios, &mut file, &[v0], ioid, 16, &a, None, None, false).unwrap();
        assert!(store.snapshot(v0, -1).is_none());
        // The next write must first complete the buffered one.
        write_darray_multi(ios, &mut file, &[v1], ioid, 16, &b, None, None, false).unwrap();
        assert!(store.snapshot(v0, -1).is_some(), "pre-flush did not run");
        assert!(store.snapshot(v1, -1).is_none());
        file.sync(ios).unwrap();
        assert_eq!(i32_record(&store.snapshot(v1, -1).unwrap()), (100..116).collect::<Vec<i32>>());
        file.close(ios).unwrap();
    });
}

/// Argument validation of the multi-variable entry point.
#[test]
fn test_multi_validation() {
    let store = MemStore::new();
    run_world(WorldCfg::intracomm(1, 1), move |ios| {
        let ioid = ios.define_decomp(IoDesc::block(8, 1, 1, Some(0), ios.io_rank(), ElemType::I32));
        let mut file = mem_file(ios, 0, IoType::SerialV3, &store);
        let v = file.def_var(ElemType::I32, 1);
        let data = i32_bytes(0..8);

        assert!(matches!(
            write_darray_multi(ios, &mut file, &[], ioid, 8, &data, None, None, false),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            write_darray_multi(ios, &mut file, &[-1], ioid, 8, &data, None, None, false),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            write_darray_multi(ios, &mut file, &[v], 777, 8, &data, None, None, false),
            Err(Error::BadId { .. })
        ));
    });
}
