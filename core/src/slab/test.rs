//!
//! # Test Cases
//!

use super::*;

#[test]
fn t_acquire_release() {
    let slab = BufferSlab::new(4096, 2, 4);

    let a = slab.acquire().unwrap();
    let b = slab.acquire().unwrap();
    assert_eq!(a.len(), 4096);
    assert_eq!(slab.in_use(), 2);
    assert_eq!(slab.acquire(), Err(OpError::NoMemory));

    slab.release(a);
    assert_eq!(slab.in_use(), 1);
    let c = slab.acquire().unwrap();
    assert_eq!(c.len(), 4096);

    slab.release(b);
    slab.release(c);
    assert_eq!(slab.in_use(), 0);
}

#[test]
fn t_cross_thread_reuse() {
    let slab = Arc::new(BufferSlab::new(128, 4, 2));

    let mut handles = vec![];
    for _ in 0..4 {
        let s = Arc::clone(&slab);
        handles.push(thread::spawn(move || {
            for _ in 0..100 {
                let buf = s.acquire().unwrap();
                s.release(buf);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(slab.in_use(), 0);
}

#[test]
fn t_registry() {
    let slab = Arc::new(BufferSlab::new(64, 1, 1));

    assert!(slab_register("t_registry", Arc::clone(&slab)).is_ok());
    assert_eq!(
        slab_register("t_registry", Arc::clone(&slab)),
        Err(OpError::Exists)
    );

    let found = slab_lookup("t_registry").unwrap();
    assert_eq!(found.buf_size(), 64);

    assert!(slab_unregister("t_registry").is_some());
    assert!(slab_lookup("t_registry").is_none());
}
