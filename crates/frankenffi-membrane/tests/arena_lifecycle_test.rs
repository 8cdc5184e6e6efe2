use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use frankenffi_membrane::{
    Arena, ArenaConfig, ArenaKind, ErrorKind, FfiError, Primitive, ScalarValue, StructLayout,
    WriteAttempt, with_arena,
};

#[derive(Clone, Copy, Debug)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

#[test]
fn random_access_sequences_match_a_shadow_copy() {
    let mut rng = XorShift64::new(0x5EED_F00D);
    with_arena(ArenaKind::Confined, |arena| {
        let len = 257;
        let seg = arena.allocate(len).unwrap();
        let mut shadow = vec![0_u8; len];

        for _ in 0..5_000 {
            let offset = rng.gen_range(0, len + 8);
            let count = rng.gen_range(0, 16);
            let in_bounds = offset + count <= len;
            if rng.next_u64() % 2 == 0 {
                let bytes: Vec<u8> = (0..count).map(|_| rng.next_u64() as u8).collect();
                let result = seg.write(offset, &bytes);
                assert_eq!(result.is_ok(), in_bounds, "write {offset}+{count}");
                if in_bounds {
                    shadow[offset..offset + count].copy_from_slice(&bytes);
                }
            } else {
                match seg.read(offset, count) {
                    Ok(bytes) => {
                        assert!(in_bounds);
                        assert_eq!(bytes, shadow[offset..offset + count]);
                    }
                    Err(err) => {
                        assert!(!in_bounds);
                        assert_eq!(err.kind(), ErrorKind::BoundsViolation);
                    }
                }
            }
        }
        assert_eq!(seg.to_vec().unwrap(), shadow);
    });
}

#[test]
fn many_arenas_open_and_close_cleanly() {
    let mut rng = XorShift64::new(42);
    for _ in 0..200 {
        let arena = Arena::open_with(
            ArenaKind::Confined,
            ArenaConfig::default().with_chunk_size(512),
        );
        let mut segments = Vec::new();
        for _ in 0..rng.gen_range(1, 20) {
            let seg = arena.allocate(rng.gen_range(0, 1024)).unwrap();
            seg.fill(0x5A).unwrap();
            segments.push(seg);
        }
        arena.close().unwrap();
        for seg in &segments {
            assert_eq!(seg.to_vec().unwrap_err().kind(), ErrorKind::ArenaClosed);
        }
    }
}

#[test]
fn shared_arena_writes_are_never_torn() {
    let arena = Arena::open(ArenaKind::Shared);
    let seg = arena.allocate(64).unwrap();
    let writers = 8;
    let rounds = 500;

    let handles: Vec<_> = (0..writers)
        .map(|w| {
            let seg = seg.clone();
            thread::spawn(move || {
                let pattern = vec![w as u8 + 1; 64];
                for _ in 0..rounds {
                    seg.write(0, &pattern).unwrap();
                    let snapshot = seg.read(0, 64).unwrap();
                    assert!(
                        snapshot.iter().all(|b| *b == snapshot[0]),
                        "torn write observed: {snapshot:?}"
                    );
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    let last = seg.read(0, 64).unwrap();
    assert!((1..=writers as u8).contains(&last[0]));
}

#[test]
fn try_write_eventually_succeeds_under_contention() {
    let arena = Arena::open(ArenaKind::Shared);
    let seg = arena.allocate(8).unwrap();
    let contended = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..4_u64)
        .map(|w| {
            let seg = seg.clone();
            let contended = Arc::clone(&contended);
            thread::spawn(move || {
                for i in 0..200_u64 {
                    let value = (w << 32 | i).to_ne_bytes();
                    loop {
                        match seg.try_write(0, &value).unwrap() {
                            WriteAttempt::Written => break,
                            WriteAttempt::Contended => {
                                contended.fetch_add(1, Ordering::Relaxed);
                                thread::yield_now();
                            }
                        }
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    let ScalarValue::U64(last) = seg.read_scalar(0, Primitive::U64).unwrap() else {
        panic!("u64 read returned another kind");
    };
    assert_eq!(last & 0xFFFF_FFFF, 199);
}

#[test]
fn close_races_with_readers_without_use_after_release() {
    for _ in 0..50 {
        let arena = Arena::open(ArenaKind::Shared);
        let seg = arena.allocate(128).unwrap();
        seg.fill(7).unwrap();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let seg = seg.clone();
                thread::spawn(move || {
                    loop {
                        match seg.read(0, 128) {
                            Ok(bytes) => assert!(bytes.iter().all(|b| *b == 7)),
                            Err(FfiError::ArenaClosed { .. }) => break,
                            Err(other) => panic!("unexpected {other:?}"),
                        }
                    }
                })
            })
            .collect();

        thread::yield_now();
        arena.close().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}

#[test]
fn struct_layout_segment_behaves_like_a_c_struct() {
    let order = StructLayout::builder()
        .field("tag", Primitive::U8)
        .field("total", Primitive::F64)
        .field("lines", frankenffi_membrane::MemoryLayout::sequence(Primitive::U16, 4))
        .build()
        .unwrap();

    with_arena(ArenaKind::Confined, |arena| {
        let seg = arena.allocate_layout(order).unwrap();
        assert_eq!(seg.len(), 24);
        seg.set("tag", ScalarValue::U8(b'P')).unwrap();
        seg.set("total", ScalarValue::F64(99.5)).unwrap();
        seg.set("lines[3]", ScalarValue::U16(12)).unwrap();

        assert_eq!(seg.read(0, 1).unwrap(), vec![b'P']);
        assert_eq!(
            seg.read_scalar(8, Primitive::F64).unwrap(),
            ScalarValue::F64(99.5)
        );
        assert_eq!(
            seg.read_scalar(16 + 3 * 2, Primitive::U16).unwrap(),
            ScalarValue::U16(12)
        );
        assert_eq!(seg.get("lines[4]").unwrap_err().kind(), ErrorKind::UnknownField);
        assert_eq!(seg.get("lines").unwrap_err().kind(), ErrorKind::TypeMismatch);
    });
}
