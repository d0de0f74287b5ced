#![no_main]
use libfuzzer_sys::fuzz_target;
use std::collections::HashMap;

use lfmap_core::{ConcurrentMap, MapConfig};

// Decode the fuzz input as a sequence of (op, key, value) operations
// against a real map, cross-checked against a plain HashMap oracle. Keys
// and values are folded into the map's valid range so the fuzzer spends
// its budget on protocol edge cases (collisions, repeated rehash) instead
// of rediscovering the argument-validation boundary.
fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }

    let map = ConcurrentMap::with_config(MapConfig::fixed(2));
    let mut oracle: HashMap<i32, i32> = HashMap::new();

    for chunk in data.chunks(4) {
        if chunk.len() < 4 {
            break;
        }
        let op = chunk[0] % 3;
        // Small key space so collisions (and therefore rehashes) are
        // frequent; values likewise bounded well under i32::MAX.
        let key = 1 + (i32::from(chunk[1]) % 64);
        let value = 1 + (i32::from(u16::from_le_bytes([chunk[2], chunk[3]])) % 10_000);

        match op {
            0 => {
                let previous = map.put(key, value).expect("validated key/value must not error");
                let expected = oracle.insert(key, value).unwrap_or(0);
                assert_eq!(previous, expected, "put({key}, {value}) returned unexpected previous value");
            }
            1 => {
                let previous = map.remove(key).expect("validated key must not error");
                let expected = oracle.remove(&key).unwrap_or(0);
                assert_eq!(previous, expected, "remove({key}) returned unexpected previous value");
            }
            _ => {
                let observed = map.get(key).expect("validated key must not error");
                let expected = oracle.get(&key).copied().unwrap_or(0);
                assert_eq!(observed, expected, "get({key}) diverged from the oracle");
            }
        }
    }
});
