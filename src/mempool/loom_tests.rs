/// Loom-based concurrency tests.
///
/// Run w/ `RUSTFLAGS="--cfg loom" cargo test --lib --release`
///
/// Exercise the per-pool mutex under every thread interleaving loom can
/// explore.
///
/// # Design notes
///
/// Loom exhaustively enumerates interleavings, so:
///   - Thread counts kept to 2 and loop bodies to a handful of
///     malloc/free pairs (state space is exponential).
///   - Every test creates and destroys its own pool inside the model so
///     no pool state crosses model iterations. The directory itself is a
///     publish-once table outside loom's view (see pool.rs); the modelled
///     synchronization is the pool state mutex.
///   - The mapping backend is the heap-backed mock under cfg(loom), so no
///     syscalls run inside the model.
#[cfg(loom)]
mod tests {
    use crate::mempool::attr::PoolAttr;
    use crate::mempool::pool::{percpu_free, Pool};
    use crate::sync::Arc;

    fn small_pool(name: &str) -> Pool {
        let mut attr = PoolAttr::new();
        // One page, 64-byte items: plenty of slots for two threads.
        attr.set_percpu(4096, 1).unwrap();
        Pool::create(Some(name), 64, &attr).unwrap()
    }

    #[test]
    fn loom_concurrent_mallocs_get_distinct_slots() {
        loom::model(|| {
            let pool = Arc::new(small_pool("loom-distinct"));

            let p1 = pool.clone();
            let t1 = loom::thread::spawn(move || p1.malloc().unwrap());
            let p2 = pool.clone();
            let t2 = loom::thread::spawn(move || p2.malloc().unwrap());

            let h1 = t1.join().unwrap();
            let h2 = t2.join().unwrap();
            assert_ne!(h1.item_offset(), h2.item_offset());

            percpu_free(h1);
            percpu_free(h2);
            Arc::try_unwrap(pool).ok().unwrap().destroy().unwrap();
        });
    }

    #[test]
    fn loom_malloc_free_against_malloc() {
        loom::model(|| {
            let pool = Arc::new(small_pool("loom-mf"));
            let seed = pool.malloc().unwrap();

            let p1 = pool.clone();
            let t1 = loom::thread::spawn(move || {
                percpu_free(seed);
                p1.malloc().unwrap()
            });
            let p2 = pool.clone();
            let t2 = loom::thread::spawn(move || p2.malloc().unwrap());

            let h1 = t1.join().unwrap();
            let h2 = t2.join().unwrap();
            // Whatever the interleaving, the two live handles are distinct
            // slots inside the slice.
            assert_ne!(h1.item_offset(), h2.item_offset());
            assert!(h1.item_offset() < 4096 && h2.item_offset() < 4096);

            percpu_free(h1);
            percpu_free(h2);
            Arc::try_unwrap(pool).ok().unwrap().destroy().unwrap();
        });
    }

    #[test]
    fn loom_robust_bitmap_stays_consistent() {
        loom::model(|| {
            let mut attr = PoolAttr::new();
            attr.set_percpu(4096, 1).unwrap();
            attr.set_robust();
            let pool = Arc::new(Pool::create(Some("loom-robust"), 64, &attr).unwrap());

            let p1 = pool.clone();
            let t1 = loom::thread::spawn(move || {
                let h = p1.malloc().unwrap();
                percpu_free(h);
            });
            let p2 = pool.clone();
            let t2 = loom::thread::spawn(move || {
                let h = p2.malloc().unwrap();
                percpu_free(h);
            });

            t1.join().unwrap();
            t2.join().unwrap();

            // Robust destroy asserts the bitmap drained to zero.
            Arc::try_unwrap(pool).ok().unwrap().destroy().unwrap();
        });
    }
}
