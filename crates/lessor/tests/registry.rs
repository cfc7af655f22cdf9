//! Named pool and workshop registries

use lessor::{Pool, Pools, Resource, Worker, Workshop, WorkshopConfig, Workshops};

struct Conn;

impl Resource for Conn {}

struct Unit;

impl Worker for Unit {}

fn pool(name: &str) -> Pool<Conn> {
    Pool::new(name, || async { Ok::<_, std::io::Error>(Conn) })
}

#[tokio::test]
async fn replacing_a_pool_closes_the_old_one() {
    let pools: Pools<Conn> = Pools::new();
    let old = pool("primary");
    pools.insert("db", old.clone()).await;

    let fetched = pools.get("db").expect("registered");
    assert_eq!(fetched.name(), "primary");
    drop(fetched.get().await.unwrap());

    pools.insert("db", pool("replica")).await;
    assert!(old.is_closed());
    assert_eq!(old.stats().idle, 0);

    let current = pools.get("db").unwrap();
    assert_eq!(current.name(), "replica");
    assert!(!current.is_closed());
    assert_eq!(pools.len(), 1);
}

#[tokio::test]
async fn removing_a_workshop_closes_it() {
    let workshops: Workshops<Unit> = Workshops::new();
    let workshop = Workshop::new(WorkshopConfig::default(), || Ok::<_, std::io::Error>(Unit)).unwrap();
    workshops.insert("renderers", workshop.clone()).await;
    drop(workshop.hire().unwrap());

    assert!(workshops.remove("renderers").await);
    assert!(workshop.is_closed());
    assert!(workshops.get("renderers").is_none());
    assert!(workshops.is_empty());
}

#[tokio::test]
async fn readers_see_a_consistent_snapshot() {
    let pools: Pools<Conn> = Pools::new();
    for name in ["a", "b", "c"] {
        pools.insert(name, pool(name)).await;
    }
    let mut names = pools.names();
    names.sort();
    assert_eq!(names, ["a", "b", "c"]);

    let held = pools.get("b").unwrap();
    pools.clear().await;
    assert!(pools.is_empty());
    // A handle taken before the clear still refers to the (now closed) pool.
    assert!(held.is_closed());
}

#[tokio::test]
async fn reregistering_the_same_pool_keeps_it_open() {
    let pools: Pools<Conn> = Pools::new();
    let db = pool("primary");
    pools.insert("db", db.clone()).await;
    pools.insert("db", db.clone()).await;

    assert!(!db.is_closed());
    assert!(pools.get("db").unwrap().get().await.is_ok());
}
