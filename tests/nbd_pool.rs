use std::path::PathBuf;

use imgd::core::{Error, NbdPool};

fn pool_of(count: usize) -> NbdPool {
    NbdPool::new(
        (0..count)
            .map(|i| PathBuf::from(format!("/dev/nbd{i}")))
            .collect(),
    )
}

#[tokio::test]
async fn acquire_hands_out_every_node_exactly_once() {
    let pool = pool_of(3);
    let a = pool.acquire().unwrap();
    let b = pool.acquire().unwrap();
    let c = pool.acquire().unwrap();

    let devices = [a.device(), b.device(), c.device()];
    assert_eq!(devices.iter().collect::<std::collections::HashSet<_>>().len(), 3);

    assert!(matches!(pool.acquire(), Err(Error::PoolExhausted)));
}

#[tokio::test]
async fn empty_pool_fails_fast() {
    let pool = pool_of(0);
    assert!(matches!(pool.acquire(), Err(Error::PoolExhausted)));
}

#[tokio::test]
async fn released_nodes_are_lent_out_again() {
    let pool = pool_of(2);
    let a = pool.acquire().unwrap();
    let b = pool.acquire().unwrap();
    assert_eq!(pool.free_count(), 0);

    // release order is not significant
    pool.release(b).await;
    pool.release(a).await;
    assert_eq!(pool.free_count(), 2);

    assert!(pool.acquire().is_ok());
    assert!(pool.acquire().is_ok());
}

#[tokio::test]
async fn failed_mount_helper_flags_the_node() {
    let dir = tempfile::tempdir().unwrap();
    let image = dir.path().join("part1.img");
    std::fs::write(&image, b"not a real image").unwrap();
    let mountpoint = dir.path().join("mnt");
    std::fs::create_dir(&mountpoint).unwrap();

    let pool = pool_of(1);
    let mut node = pool.acquire().unwrap();
    node.mount(&image, "ext4", &mountpoint).await;
    assert!(node.error());

    // a failed node still resets cleanly back into the pool
    pool.release(node).await;
    assert_eq!(pool.free_count(), 1);
    let node = pool.acquire().unwrap();
    assert!(!node.error());
}
