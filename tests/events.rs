//! Integration tests for derived events and subscriptions.

use catalog::{
    CatalogOp, DropReason, Event, HealthCheck, HealthStatus, Node, NodeId, RegisterRequest, Restore,
    ServiceInstance, Store, StoreError, SubscribeRequest, Subscription, SubscriptionEvent, Topic,
};

/// Everything queued so far, minus the end-of-snapshot marker.
fn drain(sub: &Subscription) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(msg) = sub.try_recv() {
        if let SubscriptionEvent::Event { event } = msg {
            events.push(event);
        }
    }
    events
}

fn summary(events: &[Event]) -> Vec<(CatalogOp, String, String)> {
    events
        .iter()
        .map(|e| {
            let node = e
                .check_service_node()
                .map(|csn| csn.node.name.clone())
                .unwrap_or_default();
            (e.op, e.key.clone(), node)
        })
        .collect()
}

fn subscribe(store: &Store, topic: Topic) -> Subscription {
    let sub = store.subscribe(SubscribeRequest::topic(topic)).unwrap();
    drain(&sub);
    sub
}

#[test]
fn test_proxy_registration_emits_two_health_events() {
    let store = Store::default();
    store.ensure_node(1, Node::new("n1", "10.0.0.1")).unwrap();
    let health = subscribe(&store, Topic::ServiceHealth);
    let connect = subscribe(&store, Topic::ServiceHealthConnect);

    store
        .ensure_service(2, "n1", ServiceInstance::connect_proxy("web-proxy", 21000, "web"))
        .unwrap();

    let health = drain(&health);
    let connect = drain(&connect);
    assert_eq!(health.len(), 1);
    assert_eq!(health[0].key, "web-proxy");
    assert_eq!(health[0].index, 2);
    assert_eq!(connect.len(), 1);
    assert_eq!(connect[0].key, "web");
    assert_eq!(connect[0].check_service_node().unwrap().service.service, "web-proxy");
}

#[test]
fn test_first_proxy_instance_also_lists_its_name() {
    let store = Store::default();
    store.ensure_node(1, Node::new("n1", "10.0.0.1")).unwrap();
    let health = subscribe(&store, Topic::ServiceHealth);
    let connect = subscribe(&store, Topic::ServiceHealthConnect);
    let list = subscribe(&store, Topic::ServiceList);

    store
        .ensure_service(2, "n1", ServiceInstance::connect_proxy("web-proxy", 21000, "web"))
        .unwrap();
    assert_eq!(drain(&health).len(), 1);
    assert_eq!(drain(&connect).len(), 1);
    let listed: Vec<_> = drain(&list).into_iter().map(|e| (e.op, e.key)).collect();
    assert_eq!(listed, vec![(CatalogOp::Register, "web-proxy".to_string())]);

    // A second instance of the same name lists nothing new.
    store
        .ensure_service(3, "n1", ServiceInstance::connect_proxy("web-proxy", 21001, "web").with_id("web-proxy-2"))
        .unwrap();
    assert_eq!(drain(&health).len(), 1);
    assert_eq!(drain(&connect).len(), 1);
    assert!(drain(&list).is_empty());
}

#[test]
fn test_node_rename_deregisters_before_registering() {
    let store = Store::default();
    let id = NodeId::random();
    let register = |node: &str| {
        let mut req = RegisterRequest::new(node, "10.0.0.1")
            .with_service(ServiceInstance::new("web", 80));
        req.id = Some(id);
        req
    };
    store.ensure_registration(1, register("a")).unwrap();
    let sub = store
        .subscribe(SubscribeRequest::new(Topic::ServiceHealth, "web"))
        .unwrap();
    assert_eq!(summary(&drain(&sub)), vec![(CatalogOp::Register, "web".into(), "a".into())]);

    store.ensure_registration(2, register("b")).unwrap();

    assert_eq!(
        summary(&drain(&sub)),
        vec![
            (CatalogOp::Deregister, "web".into(), "a".into()),
            (CatalogOp::Register, "web".into(), "b".into()),
        ]
    );
}

#[test]
fn test_node_check_change_reaches_every_instance() {
    let store = Store::default();
    store
        .ensure_registration(
            1,
            RegisterRequest::new("n1", "10.0.0.1")
                .with_service(ServiceInstance::new("web", 80))
                .with_check(HealthCheck::node_check("n1", "serfHealth", HealthStatus::Passing)),
        )
        .unwrap();
    store.ensure_service(2, "n1", ServiceInstance::new("api", 90)).unwrap();
    let sub = subscribe(&store, Topic::ServiceHealth);

    store
        .ensure_check(3, HealthCheck::node_check("n1", "serfHealth", HealthStatus::Critical))
        .unwrap();

    let events = drain(&sub);
    let mut keys: Vec<_> = events.iter().map(|e| e.key.as_str()).collect();
    keys.sort();
    assert_eq!(keys, vec!["api", "web"]);
    for event in &events {
        assert_eq!(event.op, CatalogOp::Register);
        let checks = &event.check_service_node().unwrap().checks;
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].status, HealthStatus::Critical);
    }
}

#[test]
fn test_unchanged_check_emits_nothing() {
    let store = Store::default();
    let check = HealthCheck::service_check("n1", "c1", "web", HealthStatus::Passing);
    store
        .ensure_registration(
            1,
            RegisterRequest::new("n1", "10.0.0.1")
                .with_service(ServiceInstance::new("web", 80))
                .with_check(check.clone()),
        )
        .unwrap();
    let sub = subscribe(&store, Topic::ServiceHealth);

    store.ensure_check(2, check).unwrap();
    assert!(drain(&sub).is_empty());
}

#[test]
fn test_service_rename_events() {
    let store = Store::default();
    store.ensure_node(1, Node::new("n1", "10.0.0.1")).unwrap();
    store
        .ensure_service(2, "n1", ServiceInstance::new("web", 80).with_id("svc1"))
        .unwrap();
    let health = subscribe(&store, Topic::ServiceHealth);
    let list = subscribe(&store, Topic::ServiceList);

    store
        .ensure_service(3, "n1", ServiceInstance::new("api", 80).with_id("svc1"))
        .unwrap();

    assert_eq!(
        summary(&drain(&health)),
        vec![
            (CatalogOp::Deregister, "web".into(), "n1".into()),
            (CatalogOp::Register, "api".into(), "n1".into()),
        ]
    );
    let list: Vec<_> = drain(&list).into_iter().map(|e| (e.op, e.key)).collect();
    assert_eq!(
        list,
        vec![(CatalogOp::Deregister, "web".to_string()), (CatalogOp::Register, "api".to_string())]
    );
}

#[test]
fn test_proxy_retarget_leaves_old_destination() {
    let store = Store::default();
    store.ensure_node(1, Node::new("n1", "10.0.0.1")).unwrap();
    store
        .ensure_service(2, "n1", ServiceInstance::connect_proxy("sidecar", 21000, "web"))
        .unwrap();
    let connect = subscribe(&store, Topic::ServiceHealthConnect);

    store
        .ensure_service(3, "n1", ServiceInstance::connect_proxy("sidecar", 21000, "api"))
        .unwrap();

    let events: Vec<_> = drain(&connect).into_iter().map(|e| (e.op, e.key)).collect();
    assert_eq!(
        events,
        vec![(CatalogOp::Deregister, "web".to_string()), (CatalogOp::Register, "api".to_string())]
    );
}

#[test]
fn test_delete_node_deregisters_instances() {
    let store = Store::default();
    store
        .ensure_registration(
            1,
            RegisterRequest::new("n1", "10.0.0.1").with_service(ServiceInstance::new("web", 80)),
        )
        .unwrap();
    let sub = subscribe(&store, Topic::ServiceHealth);

    store.delete_node(2, "n1").unwrap();
    assert_eq!(
        summary(&drain(&sub)),
        vec![(CatalogOp::Deregister, "web".into(), "n1".into())]
    );
}

// --- Subscriptions ---

#[test]
fn test_subscribe_replays_snapshot_then_live() {
    let store = Store::default();
    store
        .ensure_registration(
            1,
            RegisterRequest::new("n1", "10.0.0.1").with_service(ServiceInstance::new("web", 80)),
        )
        .unwrap();

    let sub = store
        .subscribe(SubscribeRequest::new(Topic::ServiceHealth, "web"))
        .unwrap();
    match sub.try_recv().unwrap() {
        SubscriptionEvent::Event { event } => {
            assert_eq!(event.op, CatalogOp::Register);
            assert_eq!(event.index, 1);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(sub.try_recv().unwrap(), SubscriptionEvent::EndOfSnapshot { index: 1 }));

    store.ensure_service(2, "n1", ServiceInstance::new("web", 81)).unwrap();
    let live = drain(&sub);
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].index, 2);
}

#[test]
fn test_service_list_snapshot() {
    let store = Store::default();
    store.ensure_node(1, Node::new("n1", "10.0.0.1")).unwrap();
    store.ensure_service(2, "n1", ServiceInstance::new("web", 80)).unwrap();
    store.ensure_service(3, "n1", ServiceInstance::new("api", 80)).unwrap();

    let sub = store.subscribe(SubscribeRequest::topic(Topic::ServiceList)).unwrap();
    let keys: Vec<_> = drain(&sub).into_iter().map(|e| e.key).collect();
    assert_eq!(keys, vec!["api".to_string(), "web".to_string()]);
}

#[test]
fn test_connect_health_snapshot() {
    let store = Store::default();
    store.ensure_node(1, Node::new("n1", "10.0.0.1")).unwrap();
    store.ensure_service(2, "n1", ServiceInstance::new("web", 80)).unwrap();
    store
        .ensure_service(3, "n1", ServiceInstance::connect_proxy("web-proxy", 21000, "web"))
        .unwrap();

    let (_, events) = store
        .service_health_snapshot(Topic::ServiceHealthConnect, "web")
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].topic, Topic::ServiceHealthConnect);
    assert_eq!(events[0].key, "web");
    assert_eq!(events[0].check_service_node().unwrap().service.service, "web-proxy");

    let err = store
        .service_health_snapshot(Topic::ServiceList, "web")
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidOperation(_)));
}

#[test]
fn test_slow_subscriber_is_dropped() {
    let store = Store::default();
    store.ensure_node(1, Node::new("n1", "10.0.0.1")).unwrap();
    let sub = store
        .subscribe(SubscribeRequest::topic(Topic::ServiceHealth).with_buffer_size(2))
        .unwrap();
    assert_eq!(store.stats().subscriber_count, 1);

    for (i, name) in ["a", "b", "c"].iter().enumerate() {
        store
            .ensure_service(2 + i as u64, "n1", ServiceInstance::new(*name, 80))
            .unwrap();
    }
    assert_eq!(store.stats().subscriber_count, 0);
    drop(sub);
}

#[test]
fn test_restore_resets_subscribers() {
    let store = Store::default();
    let sub = subscribe(&store, Topic::ServiceHealth);

    store.restore(Restore::new()).unwrap();

    assert!(matches!(
        sub.try_recv().unwrap(),
        SubscriptionEvent::Dropped {
            reason: DropReason::Reset
        }
    ));
    assert_eq!(store.stats().subscriber_count, 0);
}
