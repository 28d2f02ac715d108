// SPDX-License-Identifier: Apache-2.0

//! Cross-module boundary scenarios exercised through the public document +
//! handler surface together, rather than against either module in
//! isolation.

use lfjson::{DocConfig, GlobalDocument, Tag};

fn doc() -> GlobalDocument {
    GlobalDocument::with_global_alloc(DocConfig::default())
}

#[test]
fn short_to_long_string_transition() {
    let mut d = doc();
    d.root().set_str(b"abcdefghijkl").unwrap();
    assert_eq!(Tag::ShortString, d.croot().tag());
    assert_eq!(b"abcdefghijkl", d.croot().as_str_bytes().unwrap());

    d.root().set_str(b"abcdefghijklmn").unwrap();
    assert_eq!(Tag::LongString, d.croot().tag());
    assert_eq!(b"abcdefghijklmn", d.croot().as_str_bytes().unwrap());
}

#[test]
fn array_specialization_at_build_time_with_widening_allowed() {
    let mut d = doc();
    {
        let mut h = d.make_handler(true);
        h.start_array().unwrap();
        h.push_int64(1).unwrap();
        h.push_int64(2).unwrap();
        h.push_double(3.5).unwrap();
        h.end_array(3).unwrap();
        h.finalize(false, false).unwrap();
    }
    let root = d.croot();
    assert_eq!(Tag::DArray, root.tag());
    assert_eq!(3, root.size());
    assert_eq!(1.0, root.try_f64_at(0).unwrap());
    assert_eq!(2.0, root.try_f64_at(1).unwrap());
    assert_eq!(3.5, root.try_f64_at(2).unwrap());
}

#[test]
fn array_specialization_at_build_time_without_widening() {
    let mut d = doc();
    {
        let mut h = d.make_handler(false);
        h.start_array().unwrap();
        h.push_int64(1).unwrap();
        h.push_int64(2).unwrap();
        h.push_double(3.5).unwrap();
        h.end_array(3).unwrap();
        h.finalize(false, false).unwrap();
    }
    let root = d.croot();
    assert_eq!(Tag::Array, root.tag());
    assert_eq!(3, root.size());
    assert_eq!(Tag::Int64, root.try_at(0).unwrap().tag());
    assert_eq!(Tag::Int64, root.try_at(1).unwrap().tag());
    assert_eq!(Tag::Double, root.try_at(2).unwrap().tag());
}

#[test]
fn heterogeneous_mix_forces_generic_promotion() {
    let mut d = doc();
    {
        let mut h = d.make_handler(true);
        h.start_array().unwrap();
        h.push_bool(true).unwrap();
        h.push_int64(1).unwrap();
        h.end_array(2).unwrap();
        h.finalize(false, false).unwrap();
    }
    let root = d.croot();
    assert_eq!(Tag::Array, root.tag());
    assert_eq!(Tag::True, root.try_at(0).unwrap().tag());
    assert_eq!(1, root.try_at(1).unwrap().as_i64().unwrap());
}

#[test]
fn big_array_threshold_and_shrink() {
    const N: u32 = 70_000;
    let mut d = doc();
    {
        let mut root = d.root();
        root.to_iarray();
        for i in 0..N {
            root.iarray_push(i as i64).unwrap();
        }
    }
    assert!(d.croot().capacity() >= N);

    {
        let mut root = d.root();
        root.shrink_to_fit().unwrap();
    }
    assert_eq!(N, d.croot().capacity());
    assert_eq!(N, d.croot().size());

    {
        let mut root = d.root();
        for i in (1..N).rev() {
            root.iarray_erase(i).unwrap();
        }
        root.shrink_to_fit().unwrap();
    }
    assert_eq!(1, d.croot().size());
    assert_eq!(1, d.croot().capacity());
}

#[test]
fn string_pool_dedup_across_shared_documents() {
    let cfg = DocConfig::default();
    // `make_shared_string_pool`/`with_shared_pool` are defined on
    // `Document<SharedHeap>`; build two such documents over the one pool.
    let pool = lfjson::Document::<lfjson::SharedHeap>::make_shared_string_pool(cfg);
    let mut doc1 = lfjson::Document::<lfjson::SharedHeap>::with_shared_pool(pool.clone(), cfg);
    let mut doc2 = lfjson::Document::<lfjson::SharedHeap>::with_shared_pool(pool.clone(), cfg);

    let strings: [&[u8]; 5] = [
        b"hi",
        b"hello",
        b"world!",
        b"this is a long string for test",
        b"this is another long string for test",
    ];

    for s in strings {
        doc1.root().upsert(s).unwrap().set_i64(1);
    }
    let before = pool.borrow().len();

    for s in strings {
        doc2.root().upsert(s).unwrap().set_i64(2);
    }
    let after = pool.borrow().len();

    assert_eq!(before, after);
}

#[test]
fn find_by_interned_reference_after_key_rename() {
    let mut d = doc();
    d.root().upsert(b"def").unwrap().set_i64(10);

    let old_value = d.root().find(b"def").unwrap().as_const().as_i64().unwrap();
    d.root().object_erase(b"def").unwrap();
    d.root().upsert(b"fed").unwrap().set_i64(old_value);

    assert!(d.root().find(b"def").is_none());
    let renamed = d.root().find(b"fed").unwrap();
    assert_eq!(10, renamed.as_const().as_i64().unwrap());
}

#[test]
fn iarray_to_darray_conversion_with_reserve() {
    let mut d = doc();
    {
        let mut root = d.root();
        root.to_iarray();
        for v in [0_i64, 1_000_000_000, 2_000_000_000] {
            root.iarray_push(v).unwrap();
        }
    }
    let old_capacity = d.croot().capacity();
    {
        let mut root = d.root();
        root.convert_iarray_to_darray(3).unwrap();
    }
    let root = d.croot();
    assert_eq!(Tag::DArray, root.tag());
    assert_eq!(old_capacity + 3, root.capacity());
    assert_eq!(0.0, root.try_f64_at(0).unwrap());
    assert_eq!(1_000_000_000.0, root.try_f64_at(1).unwrap());
    assert_eq!(2_000_000_000.0, root.try_f64_at(2).unwrap());
}

#[test]
fn short_string_compact_encoding_round_trips_empty_and_max_length() {
    let mut d = doc();
    d.root().set_str(b"").unwrap();
    assert_eq!(Tag::ShortString, d.croot().tag());
    assert_eq!(b"", d.croot().as_str_bytes().unwrap());

    let max = vec![b'x'; lfjson::MAX_SHORT - 1];
    d.root().set_str(&max).unwrap();
    assert_eq!(Tag::ShortString, d.croot().tag());
    assert_eq!(max.as_slice(), d.croot().as_str_bytes().unwrap());
}
