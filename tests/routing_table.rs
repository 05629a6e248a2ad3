#[path = "common/mod.rs"]
mod common;

use std::collections::HashSet;

use common::random_nodes;
use kad_sdht::bucket::Bucket;
use kad_sdht::{Contacts, Node, RoutingTable};

fn make_node(byte: u8) -> Node {
    let mut hash = vec![0u8; 32];
    hash[0] = byte;
    Node::new(vec![byte, 0x01], hash)
}

fn assert_ascending(nodes: &[Node], target: &Node) {
    for pair in nodes.windows(2) {
        assert!(
            pair[0].distance_between(target) <= pair[1].distance_between(target),
            "results must be ordered by distance to the target"
        );
    }
}

#[test]
fn full_bucket_evicts_least_recently_seen() {
    let bucket = Bucket::new(3);
    for byte in [1, 2, 3] {
        assert!(bucket.update(make_node(byte)).is_none());
    }
    assert_eq!(bucket.len(), 3);

    // Touching an existing member keeps the size and makes it most recent.
    bucket.update(make_node(1));
    assert_eq!(bucket.len(), 3);
    assert_eq!(bucket.snapshot().first(), Some(&make_node(1)));

    let evicted = bucket.update(make_node(4));
    assert_eq!(evicted, Some(make_node(2)));
    assert_eq!(bucket.len(), 3);
    assert!(!bucket.contains(&make_node(2)));
}

#[test]
fn contacts_reject_duplicate_ids() {
    let contacts = Contacts::new(make_node(0), &[]);
    assert!(contacts.append(make_node(7)));

    let mut same_id = make_node(7);
    same_id.addrs.push("elsewhere".into());
    assert!(!contacts.append(same_id));
    assert_eq!(contacts.len(), 1);
}

#[test]
fn kclosest_respects_limit_order_and_exclusions() {
    let table = RoutingTable::new(make_node(0x00), 4);
    for byte in [0x80, 0xC0, 0xA0, 0x40, 0x20, 0x10, 0x11] {
        table.update(make_node(byte));
    }

    let target = make_node(0x90);
    let excluded = make_node(0x80);
    let closest = table.kclosest(3, &target, std::slice::from_ref(&excluded));
    assert_eq!(closest.len(), 3);
    assert!(!closest.contains(&excluded));
    assert_ascending(&closest, &target);
}

#[test]
fn thousand_nodes_give_distance_dependent_neighbourhoods() {
    let nodes = random_nodes(7, 1001);
    let (me, peers) = nodes.split_first().expect("nodes");
    let table = RoutingTable::new(me.clone(), 20);
    for peer in peers {
        table.update(peer.clone());
    }
    assert_eq!(table.bucket_count(), 256);
    assert!(table.size() > 20);

    let first_target = Node::from_hash(vec![0x00; 32]);
    let second_target = Node::from_hash(vec![0xFF; 32]);
    let first = table.kclosest(20, &first_target, &[]);
    let second = table.kclosest(20, &second_target, &[]);

    assert_eq!(first.len(), 20);
    assert_eq!(second.len(), 20);
    assert_ascending(&first, &first_target);
    assert_ascending(&second, &second_target);

    let first_ids: HashSet<_> = first.iter().map(|n| n.id.clone()).collect();
    let second_ids: HashSet<_> = second.iter().map(|n| n.id.clone()).collect();
    assert_ne!(first_ids, second_ids);
}

#[test]
fn table_never_stores_itself() {
    let me = make_node(0x42);
    let table = RoutingTable::new(me.clone(), 20);
    table.update(me.clone());
    assert_eq!(table.size(), 0);
    assert!(table.kclosest(0, &me, &[]).is_empty());
}
