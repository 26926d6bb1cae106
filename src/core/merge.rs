//! Reconciliation of message lists coming from different sources.
//!
//! The cache, a fresh fetch, a push-triggered refetch and an optimistic
//! send all produce overlapping views of the same conversation. [`merge`]
//! folds them into one sorted list where each logical message appears once.
//!
//! Two records describe the same logical message when they share a server
//! id, or share a `(thread_id, client_id)` pair. Records are grouped by the
//! transitive closure of those links and each group is collapsed field by
//! field with commutative, idempotent rules, so the result does not depend
//! on which source arrived first.

use std::collections::HashMap;

use crate::core::models::Message;

/// Union `base` and `incoming`, collapse duplicates, and sort by ordering key.
pub fn merge(base: &[Message], incoming: &[Message]) -> Vec<Message> {
    let records: Vec<&Message> = base.iter().chain(incoming.iter()).collect();
    let mut groups = DisjointSet::new(records.len());

    let mut by_server: HashMap<&str, usize> = HashMap::new();
    let mut by_client: HashMap<(&str, &str), usize> = HashMap::new();
    for (i, m) in records.iter().enumerate() {
        let server_ids = m
            .server_id
            .iter()
            .chain(m.superseded_server_ids.iter())
            .map(String::as_str);
        for sid in server_ids {
            match by_server.get(sid) {
                Some(&j) => groups.union(i, j),
                None => {
                    by_server.insert(sid, i);
                }
            }
        }
        if let Some(cid) = m.client_id.as_deref() {
            let key = (m.thread_id.as_str(), cid);
            match by_client.get(&key) {
                Some(&j) => groups.union(i, j),
                None => {
                    by_client.insert(key, i);
                }
            }
        }
    }

    let mut collapsed: HashMap<usize, Message> = HashMap::new();
    for (i, m) in records.iter().enumerate() {
        let root = groups.find(i);
        match collapsed.remove(&root) {
            Some(acc) => {
                collapsed.insert(root, combine(acc, m));
            }
            None => {
                collapsed.insert(root, (*m).clone());
            }
        }
    }

    let mut merged: Vec<Message> = collapsed.into_values().collect();
    merged.sort_by(|a, b| {
        a.order_key()
            .cmp(&b.order_key())
            .then_with(|| a.list_key().cmp(b.list_key()))
    });
    merged
}

/// Collapse two records of the same logical message.
///
/// Delivery status only moves forward. Server identity comes from the most
/// recent confirmation, and content already held is never replaced by
/// `None`. Every other server id seen for the message is kept as superseded
/// so a later record still carrying one of them links back here.
fn combine(acc: Message, next: &Message) -> Message {
    let mut superseded = acc.superseded_server_ids;
    superseded.extend(next.superseded_server_ids.iter().cloned());
    superseded.extend(acc.server_id.iter().cloned());
    superseded.extend(next.server_id.iter().cloned());

    let (server_created_at, server_id) = std::cmp::max(
        (acc.server_created_at, acc.server_id),
        (next.server_created_at, next.server_id.clone()),
    );
    if let Some(winner) = &server_id {
        superseded.remove(winner);
    }

    Message {
        server_id,
        thread_id: std::cmp::max(acc.thread_id, next.thread_id.clone()),
        tenant_id: std::cmp::max(acc.tenant_id, next.tenant_id.clone()),
        sender_id: std::cmp::max(acc.sender_id, next.sender_id.clone()),
        body: std::cmp::max(acc.body, next.body.clone()),
        kind: std::cmp::max(acc.kind, next.kind),
        client_id: std::cmp::max(acc.client_id, next.client_id.clone()),
        client_created_at: acc.client_created_at.min(next.client_created_at),
        server_created_at,
        status: acc.status.max(next.status),
        attachment: std::cmp::max(acc.attachment, next.attachment.clone()),
        superseded_server_ids: superseded,
    }
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        DisjointSet {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{DeliveryStatus, MessageKind};
    use proptest::prelude::*;

    fn optimistic(client_id: &str, at: i64, body: &str) -> Message {
        Message {
            server_id: None,
            thread_id: "t1".into(),
            tenant_id: "team-1".into(),
            sender_id: "host-1".into(),
            body: Some(body.into()),
            kind: MessageKind::Text,
            client_id: Some(client_id.into()),
            client_created_at: at,
            server_created_at: None,
            status: DeliveryStatus::Sending,
            attachment: None,
            superseded_server_ids: Default::default(),
        }
    }

    fn confirmed(mut m: Message, server_id: &str, at: i64) -> Message {
        m.server_id = Some(server_id.into());
        m.server_created_at = Some(at);
        m.status = DeliveryStatus::Sent;
        m
    }

    fn fetched(server_id: &str, at: i64, body: &str) -> Message {
        Message {
            server_id: Some(server_id.into()),
            thread_id: "t1".into(),
            tenant_id: "team-1".into(),
            sender_id: "cleaner-7".into(),
            body: Some(body.into()),
            kind: MessageKind::Text,
            client_id: None,
            client_created_at: at,
            server_created_at: Some(at),
            status: DeliveryStatus::Sent,
            attachment: None,
            superseded_server_ids: Default::default(),
        }
    }

    #[test]
    fn sent_beats_optimistic_and_keeps_list_key() {
        let local = optimistic("c1", 100, "Hola");
        let server = confirmed(local.clone(), "srv-1", 105);

        let merged = merge(&[local], &[server]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].status, DeliveryStatus::Sent);
        assert_eq!(merged[0].list_key(), "c1");
        assert_eq!(merged[0].server_id.as_deref(), Some("srv-1"));
    }

    #[test]
    fn stale_pending_never_downgrades_sent() {
        let local = optimistic("c1", 100, "Hola");
        let server = confirmed(local.clone(), "srv-1", 105);

        let merged = merge(&[server], &[local]);
        assert_eq!(merged[0].status, DeliveryStatus::Sent);
    }

    #[test]
    fn failed_survives_in_flight_copies() {
        let mut failed = optimistic("c1", 100, "Hola");
        failed.status = DeliveryStatus::Failed;
        let mut pending = optimistic("c1", 100, "Hola");
        pending.status = DeliveryStatus::Pending;

        assert_eq!(merge(&[failed.clone()], &[pending])[0].status, DeliveryStatus::Failed);
        let sent = confirmed(failed.clone(), "srv-1", 101);
        assert_eq!(merge(&[failed], &[sent])[0].status, DeliveryStatus::Sent);
    }

    #[test]
    fn fetch_and_cache_interleave_by_order_key() {
        let cached = vec![fetched("s1", 10, "a"), fetched("s3", 30, "c")];
        let fresh = vec![fetched("s2", 20, "b"), fetched("s3", 30, "c")];

        let merged = merge(&cached, &fresh);
        let ids: Vec<_> = merged.iter().map(|m| m.list_key()).collect();
        assert_eq!(ids, ["s1", "s2", "s3"]);
    }

    #[test]
    fn links_server_only_and_client_only_copies_through_an_ack() {
        let local = optimistic("c1", 100, "Hola");
        let ack = confirmed(local.clone(), "srv-1", 105);
        let mut echoed = fetched("srv-1", 105, "Hola");
        echoed.sender_id = "host-1".into();

        let merged = merge(&merge(&[local], &[echoed]), &[ack]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].list_key(), "c1");
    }

    #[test]
    fn conflicting_server_ids_keep_latest_and_body() {
        let a = confirmed(optimistic("c1", 100, "Hola"), "srv-old", 101);
        let mut b = confirmed(optimistic("c1", 100, "Hola"), "srv-new", 109);
        b.body = None;

        let merged = merge(&[a], &[b]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].server_id.as_deref(), Some("srv-new"));
        assert_eq!(merged[0].body.as_deref(), Some("Hola"));
    }

    #[test]
    fn replaced_server_id_still_links_later_records() {
        let first = confirmed(optimistic("c1", 3, "Hola"), "sa", 5);
        let second = confirmed(optimistic("c1", 3, "Hola"), "sb", 9);
        let straggler = fetched("sa", 5, "Hola");

        let left = merge(&merge(&[first.clone()], &[second.clone()]), &[straggler.clone()]);
        let right = merge(&[first], &merge(&[second], &[straggler]));
        assert_eq!(left.len(), 1);
        assert_eq!(left, right);
        assert_eq!(left[0].server_id.as_deref(), Some("sb"));
        assert!(left[0].superseded_server_ids.contains("sa"));
    }

    // Logical message `i` always has client id `c{i}` and is confirmed under
    // server id `s{i}` or, after a re-confirmation, `r{i}`. A record may carry
    // a client id, a server id, or both.
    fn arb_message() -> impl Strategy<Value = Message> {
        (
            0..5usize,
            0..3u8,
            prop_oneof![
                Just(DeliveryStatus::Pending),
                Just(DeliveryStatus::Sending),
                Just(DeliveryStatus::Failed),
                Just(DeliveryStatus::Sent),
            ],
            prop::option::of(0..3i64),
            prop::option::of("[ab]{1,2}"),
            0..4i64,
            prop::bool::ANY,
        )
            .prop_map(|(i, ids, status, server_at, body, skew, reconfirmed)| Message {
                server_id: (ids != 0).then(|| {
                    if reconfirmed {
                        format!("r{i}")
                    } else {
                        format!("s{i}")
                    }
                }),
                thread_id: "t1".into(),
                tenant_id: "team-1".into(),
                sender_id: "host-1".into(),
                body,
                kind: MessageKind::Text,
                client_id: (ids != 1).then(|| format!("c{i}")),
                client_created_at: (i as i64) * 10 + skew,
                server_created_at: server_at.map(|d| (i as i64) * 10 + d),
                status,
                attachment: None,
                superseded_server_ids: Default::default(),
            })
    }

    proptest! {
        #[test]
        fn merge_is_associative(
            a in prop::collection::vec(arb_message(), 0..6),
            b in prop::collection::vec(arb_message(), 0..6),
            c in prop::collection::vec(arb_message(), 0..6),
        ) {
            prop_assert_eq!(merge(&merge(&a, &b), &c), merge(&a, &merge(&b, &c)));
        }

        #[test]
        fn merge_is_idempotent(
            a in prop::collection::vec(arb_message(), 0..8),
            b in prop::collection::vec(arb_message(), 0..8),
        ) {
            let ab = merge(&a, &b);
            prop_assert_eq!(merge(&ab, &b), ab.clone());
            prop_assert_eq!(merge(&ab, &ab), ab);
        }

        #[test]
        fn merge_never_duplicates_client_ids(
            a in prop::collection::vec(arb_message(), 0..8),
            b in prop::collection::vec(arb_message(), 0..8),
        ) {
            let merged = merge(&a, &b);
            let mut seen = std::collections::HashSet::new();
            for m in merged.iter().filter_map(|m| m.client_id.as_deref()) {
                prop_assert!(seen.insert(m));
            }
        }
    }
}
