use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use relcache::storage::CounterMetrics;
use relcache::{
    CacheOptions, DynamicObject, Kind, MemoryStore, ObjectId, ObjectIdSet, PopulationState,
    ReconcileRequest, Relation, RelationCache, Result, RetryPolicy, WorkQueue,
};

const POD: Kind = Kind::from_static("Pod");
const VOLUME: Kind = Kind::from_static("Volume");

fn id(raw: &str) -> ObjectId {
    raw.parse().expect("valid object id")
}

fn one(raw: &str) -> ObjectIdSet {
    std::iter::once(id(raw)).collect()
}

fn pod(name: &str, volumes: &[&str]) -> DynamicObject {
    volumes.iter().fold(DynamicObject::new(POD, "ns", name), |obj, vol| {
        obj.with_ref(Relation::USES, id(&format!("Volume/ns/{vol}")))
    })
}

fn volume_refs(obj: &DynamicObject) -> ObjectIdSet {
    obj.refs_to(&Relation::USES, &VOLUME)
}

fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {what}");
}

fn options(metrics: Arc<CounterMetrics>) -> CacheOptions {
    CacheOptions::new()
        .metrics(metrics)
        .retry(RetryPolicy {
            initial_backoff_ms: 1,
            max_backoff_ms: 10,
            multiplier: 2.0,
            max_attempts: None,
        })
        .watch_poll_interval(Duration::from_millis(5))
}

struct Fixture {
    store: Arc<MemoryStore>,
    cache: RelationCache<MemoryStore>,
    pods: Arc<WorkQueue>,
    volumes: Arc<WorkQueue>,
    metrics: Arc<CounterMetrics>,
}

fn req(name: &str) -> ReconcileRequest {
    ReconcileRequest::new("ns", name)
}

fn drain(queue: &WorkQueue) -> Vec<ReconcileRequest> {
    let mut taken = Vec::new();
    while let Some(request) = queue.try_pop() {
        queue.done(&request);
        taken.push(request);
    }
    taken.sort();
    taken
}

fn sorted_pending(queue: &WorkQueue) -> Vec<ReconcileRequest> {
    let mut pending = queue.pending();
    pending.sort();
    pending
}

fn populated(pods: &[DynamicObject]) -> Result<Fixture> {
    let store = Arc::new(MemoryStore::new());
    for p in pods {
        store.apply(p.clone())?;
    }
    let metrics = Arc::new(CounterMetrics::default());
    let cache = RelationCache::new(Arc::clone(&store), options(Arc::clone(&metrics)));
    let pods = Arc::new(WorkQueue::new());
    let volumes = Arc::new(WorkQueue::new());
    cache.register_controller_for(POD, pods.clone());
    cache.register_controller_for(VOLUME, volumes.clone());
    cache.register_extractor(POD, Relation::USES, VOLUME, volume_refs)?;
    cache.wait_ready(Duration::from_secs(5))?;
    Ok(Fixture {
        store,
        cache,
        pods,
        volumes,
        metrics,
    })
}

#[test]
fn initial_listing_indexes_and_triggers_targets() -> Result<()> {
    let fx = populated(&[pod("p1", &["a"]), pod("p2", &["a", "b"])])?;
    let index = fx.cache.index();
    assert_eq!(index.get_users_for(&id("Volume/ns/a")).len(), 2);
    assert_eq!(index.get_users_for(&id("Volume/ns/b")).len(), 1);

    assert_eq!(sorted_pending(&fx.volumes), vec![req("a"), req("b")]);
    assert!(fx.pods.is_empty());
    assert_eq!(fx.cache.population_state(&POD), Some(PopulationState::Ready));
    fx.cache.shutdown();
    Ok(())
}

#[test]
fn watch_events_update_and_delete_edges() -> Result<()> {
    let fx = populated(&[pod("p1", &["a"]), pod("p2", &["b"])])?;
    let cache = &fx.cache;
    assert_eq!(drain(&fx.volumes), vec![req("a"), req("b")]);

    // Both the dropped and the new target are woken.
    fx.store.apply(pod("p1", &["c"]))?;
    eventually("p1 to move to volume c", || {
        cache.index().get_users_for(&id("Volume/ns/c")) == one("Pod/ns/p1")
            && cache.index().get_users_for(&id("Volume/ns/a")).is_empty()
    });
    eventually("volumes a and c to be woken", || {
        sorted_pending(&fx.volumes) == vec![req("a"), req("c")]
    });

    fx.store.apply(pod("p3", &["b"]))?;
    eventually("p3 to appear", || {
        cache.index().get_users_for(&id("Volume/ns/b")).len() == 2
    });

    let removed: Option<DynamicObject> = fx.store.delete(&id("Pod/ns/p2"))?;
    assert!(removed.is_some());
    eventually("p2 to disappear", || {
        !cache.index().contains(&id("Pod/ns/p2"))
            && cache.index().get_users_for(&id("Volume/ns/b")).len() == 1
    });

    // Deleting a target wakes the objects that used it.
    fx.store.apply(DynamicObject::new(VOLUME, "ns", "c"))?;
    cache.register_extractor(VOLUME, Relation::USES, POD, |_: &DynamicObject| {
        ObjectIdSet::default()
    })?;
    eventually("volume worker to list", || {
        cache.population_state(&VOLUME) == Some(PopulationState::Ready)
    });
    drain(&fx.pods);
    let gone: Option<DynamicObject> = fx.store.delete(&id("Volume/ns/c"))?;
    assert!(gone.is_some());
    eventually("p1 to be woken by the deleted volume", || {
        sorted_pending(&fx.pods) == vec![req("p1")]
    });
    assert!(cache.index().get_used_objects_for(&id("Pod/ns/p1")).is_empty());
    assert!(cache.index().verify().is_clean());
    cache.shutdown();
    Ok(())
}

#[test]
fn resync_after_disconnect_drops_vanished_objects() -> Result<()> {
    let fx = populated(&[pod("p1", &["a"]), pod("p2", &["a"])])?;
    let cache = &fx.cache;

    fx.store.fail_next_lists(&POD, u32::MAX);
    assert_eq!(fx.store.disconnect_watchers::<DynamicObject>(&POD)?, 1);
    eventually("worker to notice the lost watch", || {
        cache.population_state(&POD) == Some(PopulationState::Listing)
    });

    // Deleted while the worker is still retrying its listing.
    let _: Option<DynamicObject> = fx.store.delete(&id("Pod/ns/p2"))?;
    fx.store.fail_next_lists(&POD, 0);

    eventually("relist to drop p2", || {
        cache.index().get_users_for(&id("Volume/ns/a")) == one("Pod/ns/p1")
    });
    eventually("worker to follow the new watch", || {
        cache.population_state(&POD) == Some(PopulationState::Ready)
    });
    assert!(fx.metrics.snapshot().population_retries > 0);

    fx.store.apply(pod("p4", &["a"]))?;
    eventually("new watch to deliver p4", || {
        cache.index().get_users_for(&id("Volume/ns/a")).len() == 2
    });
    cache.shutdown();
    Ok(())
}

#[test]
fn failed_listings_reuse_one_watch() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.apply(pod("p1", &["a"]))?;
    store.fail_next_lists(&POD, 4);
    let metrics = Arc::new(CounterMetrics::default());
    let cache = RelationCache::new(Arc::clone(&store), options(Arc::clone(&metrics)));
    cache.register_extractor(POD, Relation::USES, VOLUME, volume_refs)?;
    cache.wait_ready(Duration::from_secs(5))?;

    assert_eq!(metrics.snapshot().population_retries, 4);
    assert_eq!(store.watcher_count::<DynamicObject>(&POD)?, 1);
    assert_eq!(cache.index().get_users_for(&id("Volume/ns/a")), one("Pod/ns/p1"));
    cache.shutdown();
    Ok(())
}

#[test]
fn later_registration_for_known_kind_does_not_relist() -> Result<()> {
    let fx = populated(&[pod("p1", &["a"])])?;
    let listed = fx.metrics.snapshot().objects_replaced;

    fx.cache
        .register_extractor(POD, Relation::CLAIMS, VOLUME, |obj: &DynamicObject| {
            obj.refs_to(&Relation::CLAIMS, &VOLUME)
        })?;
    thread::sleep(Duration::from_millis(30));
    assert_eq!(fx.metrics.snapshot().objects_replaced, listed);
    assert_eq!(fx.cache.registered_shapes(&POD).len(), 2);

    let claimed = pod("p5", &[]).with_ref(Relation::CLAIMS, id("Volume/ns/z"));
    fx.store.apply(claimed)?;
    let cache = &fx.cache;
    eventually("claims edge from the late extractor", || {
        cache
            .index()
            .get_users_for_relation(&id("Volume/ns/z"), &Relation::CLAIMS)
            .len()
            == 1
    });
    cache.shutdown();
    Ok(())
}

#[test]
fn shutdown_stops_workers() -> Result<()> {
    let fx = populated(&[pod("p1", &["a"])])?;
    fx.cache.shutdown();
    assert_eq!(fx.cache.population_state(&POD), Some(PopulationState::Cancelled));

    // Changes after shutdown are not applied.
    fx.store.apply(pod("p9", &["a"]))?;
    thread::sleep(Duration::from_millis(30));
    assert_eq!(fx.cache.index().get_users_for(&id("Volume/ns/a")).len(), 1);
    Ok(())
}
