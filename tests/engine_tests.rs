//! # Engine Surface Tests
//!
//! End-to-end coverage of the public operation surface: open-time engine
//! selection and config handling, the point-operation laws, and the
//! failure-containment guarantees.
//!
//! ## Laws exercised
//!
//! - Put-get: after `put(k, v)` succeeds, `get(k)` returns `v` bytewise
//! - Last-write-wins: `put(k, v1); put(k, v2)` leaves `v2`
//! - Idempotent remove: `remove` never fails on an absent key
//! - Crash-atomic put: a failed put leaves the pre-put state observable

use streekv::{Config, Kv, Status, ENGINE_NAME};
use tempfile::tempdir;

fn pool_config(dir: &tempfile::TempDir) -> Config {
    Config::new()
        .put_string("path", dir.path().join("kv.pool").to_str().unwrap())
        .put_uint64("size", 8 << 20)
}

fn open_fresh(dir: &tempfile::TempDir) -> Kv {
    Kv::open(ENGINE_NAME, pool_config(dir)).unwrap()
}

mod open_tests {
    use super::*;

    #[test]
    fn unknown_engine_name_is_rejected() {
        let dir = tempdir().unwrap();
        let err = Kv::open("nonsense", pool_config(&dir)).unwrap_err();
        assert_eq!(err.status(), Status::WrongEngineName);
        assert_eq!(err.status().code(), 9);
    }

    #[test]
    fn missing_path_is_invalid_argument() {
        let err = Kv::open(ENGINE_NAME, Config::new()).unwrap_err();
        assert_eq!(err.status(), Status::InvalidArgument);
    }

    #[test]
    fn unknown_config_item_is_parsing_error() {
        let dir = tempdir().unwrap();
        let config = pool_config(&dir).put_uint64("compression", 1);

        let err = Kv::open(ENGINE_NAME, config).unwrap_err();
        assert_eq!(err.status(), Status::ConfigParsingError);
        assert!(err.message().contains("compression"));
    }

    #[test]
    fn mistyped_config_item_is_type_error() {
        let dir = tempdir().unwrap();
        let config = Config::new()
            .put_string("path", dir.path().join("kv.pool").to_str().unwrap())
            .put_string("size", "lots");

        let err = Kv::open(ENGINE_NAME, config).unwrap_err();
        assert_eq!(err.status(), Status::ConfigTypeError);
    }

    #[test]
    fn undersized_pool_is_invalid_argument() {
        let dir = tempdir().unwrap();
        let config = Config::new()
            .put_string("path", dir.path().join("kv.pool").to_str().unwrap())
            .put_uint64("size", 4096);

        let err = Kv::open(ENGINE_NAME, config).unwrap_err();
        assert_eq!(err.status(), Status::InvalidArgument);
    }

    #[test]
    fn force_create_truncates_an_existing_pool() {
        let dir = tempdir().unwrap();

        {
            let mut kv = open_fresh(&dir);
            kv.put(b"survivor?", b"no").unwrap();
        }

        let config = pool_config(&dir).put_uint64("force_create", 1);
        let kv = Kv::open(ENGINE_NAME, config).unwrap();
        assert_eq!(kv.count_all().unwrap(), 0);
    }

    #[test]
    fn open_reports_engine_name() {
        let dir = tempdir().unwrap();
        let kv = open_fresh(&dir);
        assert_eq!(kv.name(), "stree");
    }

    #[test]
    fn opening_a_foreign_file_fails_cleanly() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kv.pool");
        std::fs::write(&path, vec![0u8; 8 << 20]).unwrap();

        let err = Kv::open(ENGINE_NAME, pool_config(&dir)).unwrap_err();
        assert_eq!(err.status(), Status::UnknownError);
    }
}

mod point_op_tests {
    use super::*;

    #[test]
    fn put_get_roundtrip() {
        let dir = tempdir().unwrap();
        let mut kv = open_fresh(&dir);

        kv.put(b"k", b"v").unwrap();
        assert_eq!(kv.count_all().unwrap(), 1);
        assert_eq!(kv.get(b"k").unwrap(), b"v");
        assert!(kv.exists(b"k").unwrap());
    }

    #[test]
    fn get_miss_is_not_found() {
        let dir = tempdir().unwrap();
        let kv = open_fresh(&dir);

        let err = kv.get(b"absent").unwrap_err();
        assert_eq!(err.status(), Status::NotFound);
        assert!(!kv.exists(b"absent").unwrap());
    }

    #[test]
    fn last_write_wins() {
        let dir = tempdir().unwrap();
        let mut kv = open_fresh(&dir);

        kv.put(b"k", b"v1").unwrap();
        kv.put(b"k", b"v2").unwrap();

        assert_eq!(kv.get(b"k").unwrap(), b"v2");
        assert_eq!(kv.count_all().unwrap(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut kv = open_fresh(&dir);

        kv.put(b"k", b"v").unwrap();

        kv.remove(b"k").unwrap();
        assert!(!kv.exists(b"k").unwrap());

        // Second remove of the same key, and a remove of a never-inserted
        // key, both succeed.
        kv.remove(b"k").unwrap();
        kv.remove(b"never there").unwrap();
    }

    #[test]
    fn get_with_sinks_the_value_bytes() {
        let dir = tempdir().unwrap();
        let mut kv = open_fresh(&dir);

        kv.put(b"k", b"sunk value").unwrap();

        let mut seen = Vec::new();
        kv.get_with(b"k", |value| seen.extend_from_slice(value))
            .unwrap();
        assert_eq!(seen, b"sunk value");

        let err = kv.get_with(b"gone", |_| panic!("sink must not run on a miss"));
        assert_eq!(err.unwrap_err().status(), Status::NotFound);
    }

    #[test]
    fn empty_key_and_empty_value_are_distinct_from_absence() {
        let dir = tempdir().unwrap();
        let mut kv = open_fresh(&dir);

        kv.put(b"", b"value of empty key").unwrap();
        kv.put(b"empty value", b"").unwrap();

        assert_eq!(kv.get(b"").unwrap(), b"value of empty key");
        assert_eq!(kv.get(b"empty value").unwrap(), b"");
        assert_eq!(kv.count_all().unwrap(), 2);

        kv.remove(b"").unwrap();
        assert!(!kv.exists(b"").unwrap());
        assert!(kv.exists(b"empty value").unwrap());
    }

    #[test]
    fn embedded_nul_keys_are_stored_byte_identical() {
        let dir = tempdir().unwrap();
        let mut kv = open_fresh(&dir);

        kv.put(b"a\x00b", b"one").unwrap();
        kv.put(b"a\x00c", b"two").unwrap();
        kv.put(b"a\x00", b"three").unwrap();

        assert_eq!(kv.get(b"a\x00b").unwrap(), b"one");
        assert_eq!(kv.get(b"a\x00c").unwrap(), b"two");
        assert_eq!(kv.get(b"a\x00").unwrap(), b"three");
        assert_eq!(kv.count_all().unwrap(), 3);
    }

    #[test]
    fn values_with_nuls_roundtrip() {
        let dir = tempdir().unwrap();
        let mut kv = open_fresh(&dir);

        let value = b"\x00\x01\x02\x00\xff\x00".to_vec();
        kv.put(b"binary", &value).unwrap();
        assert_eq!(kv.get(b"binary").unwrap(), value);
    }
}

mod capacity_tests {
    use super::*;

    #[test]
    fn leaf_overflow_splits_into_two_leaves() {
        let dir = tempdir().unwrap();
        let mut kv = open_fresh(&dir);

        // One leaf holds 48 records; the 49th forces exactly one split.
        for i in 0..49 {
            let key = format!("key{i:04}");
            kv.put(key.as_bytes(), b"v").unwrap();
        }

        let stats = kv.stats();
        assert_eq!(stats.leaf_count, 2);
        assert_eq!(stats.inner_count, 1);
        assert_eq!(stats.depth, 2);
        assert_eq!(kv.count_all().unwrap(), 49);
    }

    #[test]
    fn deep_ascending_insert_stays_traversable() {
        let dir = tempdir().unwrap();
        let mut kv = open_fresh(&dir);

        // LEAF_KEYS * (INNER_KEYS + 2) ascending keys force at least one
        // inner-node split.
        let n = 48 * 6;
        for i in 0..n {
            let key = format!("key{i:05}");
            let value = format!("val{i:05}");
            kv.put(key.as_bytes(), value.as_bytes()).unwrap();
        }

        assert!(kv.stats().inner_count >= 2);
        assert_eq!(kv.count_all().unwrap(), n);

        for i in 0..n {
            let key = format!("key{i:05}");
            let value = format!("val{i:05}");
            assert_eq!(kv.get(key.as_bytes()).unwrap(), value.into_bytes());
        }
    }

    #[test]
    fn pool_exhaustion_is_out_of_memory_and_atomic() {
        let dir = tempdir().unwrap();
        let config = Config::new()
            .put_string("path", dir.path().join("kv.pool").to_str().unwrap())
            .put_uint64("size", 1 << 20);
        let mut kv = Kv::open(ENGINE_NAME, config).unwrap();

        kv.put(b"present", b"before").unwrap();

        let huge = vec![0xAA; 2 << 20];
        let err = kv.put(b"too big", &huge).unwrap_err();
        assert_eq!(err.status(), Status::OutOfMemory);

        // Crash-atomic put: the failed write left no trace.
        assert!(!kv.exists(b"too big").unwrap());
        assert_eq!(kv.get(b"present").unwrap(), b"before");
        assert_eq!(kv.count_all().unwrap(), 1);

        // The engine stays usable for reasonably sized writes.
        kv.put(b"after", b"ok").unwrap();
        assert_eq!(kv.get(b"after").unwrap(), b"ok");
    }

    #[test]
    fn failed_update_keeps_prior_value() {
        let dir = tempdir().unwrap();
        let config = Config::new()
            .put_string("path", dir.path().join("kv.pool").to_str().unwrap())
            .put_uint64("size", 1 << 20);
        let mut kv = Kv::open(ENGINE_NAME, config).unwrap();

        kv.put(b"k", b"intact").unwrap();

        let huge = vec![0xBB; 2 << 20];
        let err = kv.put(b"k", &huge).unwrap_err();
        assert_eq!(err.status(), Status::OutOfMemory);

        assert_eq!(kv.get(b"k").unwrap(), b"intact");
    }
}

mod defrag_tests {
    use super::*;

    #[test]
    fn defrag_is_not_supported() {
        let dir = tempdir().unwrap();
        let mut kv = open_fresh(&dir);

        let err = kv.defrag(0, 100).unwrap_err();
        assert_eq!(err.status(), Status::NotSupported);
        assert_eq!(err.status().code(), 3);
    }

    #[test]
    fn defrag_validates_percentages_first() {
        let dir = tempdir().unwrap();
        let mut kv = open_fresh(&dir);

        assert_eq!(
            kv.defrag(101, 0).unwrap_err().status(),
            Status::InvalidArgument
        );
        assert_eq!(
            kv.defrag(0, 101).unwrap_err().status(),
            Status::InvalidArgument
        );
    }
}
