// Local subscription index.
//
// Each filter is filed under its most selective present dimension
// (device > network > device type > name > any), so matching an event reads
// at most five buckets. A second index from device / network / device type to
// subscription ids drives cascading removal.
use courier_common::ids::SubscriptionId;
use courier_common::{DeviceRef, EventKey, EventKind, Filter, Subscriber};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use hashbrown::HashSet;
use smallvec::SmallVec;

use crate::Subscription;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum IndexKey {
    Device(EventKind, String),
    Network(EventKind, i64),
    DeviceType(EventKind, i64),
    Name(EventKind, String),
    Any(EventKind),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RefKey {
    Device(String),
    Network(i64),
    DeviceType(i64),
}

#[derive(Debug)]
struct Entry {
    subscriber: Subscriber,
    filters: Vec<Filter>,
}

fn index_keys(filter: &Filter) -> SmallVec<[IndexKey; 4]> {
    let kind = filter.kind;
    if !filter.covers_all_devices() {
        return filter
            .concrete_devices()
            .map(|device| IndexKey::Device(kind, device.to_string()))
            .collect();
    }
    if let Some(networks) = &filter.network_ids {
        return networks.iter().map(|id| IndexKey::Network(kind, *id)).collect();
    }
    if let Some(types) = &filter.device_type_ids {
        return types.iter().map(|id| IndexKey::DeviceType(kind, *id)).collect();
    }
    if let Some(names) = &filter.names {
        return names
            .iter()
            .map(|name| IndexKey::Name(kind, name.clone()))
            .collect();
    }
    SmallVec::from_iter([IndexKey::Any(kind)])
}

fn ref_keys(filter: &Filter) -> SmallVec<[RefKey; 4]> {
    let mut keys: SmallVec<[RefKey; 4]> = filter
        .concrete_devices()
        .map(|device| RefKey::Device(device.to_string()))
        .collect();
    keys.extend(filter.network_ids.iter().flatten().map(|id| RefKey::Network(*id)));
    keys.extend(
        filter
            .device_type_ids
            .iter()
            .flatten()
            .map(|id| RefKey::DeviceType(*id)),
    );
    keys
}

/// Concurrent filter -> subscriber index.
///
/// ```
/// use courier_common::ids::{CorrelationId, SubscriptionId};
/// use courier_common::{EventKey, EventKind, Filter, Subscriber};
/// use courier_eventbus::FilterRegistry;
///
/// let registry = FilterRegistry::new();
/// let subscriber = Subscriber::new(SubscriptionId::new(), "response_topic_a", CorrelationId::new());
/// let filter = Filter::new(EventKind::Notification).with_devices(["D1"]).with_names(["temp"]);
/// registry.register(filter, subscriber.clone());
///
/// let hit = registry.match_event(&EventKey::new(EventKind::Notification).device("D1").name("temp"));
/// assert_eq!(hit.len(), 1);
/// assert_eq!(hit[0].subscriber, subscriber);
/// assert!(registry
///     .match_event(&EventKey::new(EventKind::Notification).device("D1").name("humidity"))
///     .is_empty());
/// ```
#[derive(Debug, Default)]
pub struct FilterRegistry {
    entries: DashMap<SubscriptionId, Entry>,
    primary: DashMap<IndexKey, HashSet<SubscriptionId>>,
    references: DashMap<RefKey, HashSet<SubscriptionId>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `filter` to the subscription `subscriber.id`. Registering the same
    /// filter twice is a no-op; a different filter extends the subscription.
    pub fn register(&self, filter: Filter, subscriber: Subscriber) -> SubscriptionId {
        let id = subscriber.id;
        // The entry guard is held while indexing so a concurrent unregister of
        // the same id sees either nothing or the fully indexed filter.
        match self.entries.entry(id) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().filters.contains(&filter) {
                    return id;
                }
                self.index(id, &filter);
                occupied.get_mut().filters.push(filter);
            }
            MapEntry::Vacant(vacant) => {
                self.index(id, &filter);
                vacant.insert(Entry {
                    subscriber,
                    filters: vec![filter],
                });
                metrics::gauge!("courier_registry_subscriptions").increment(1.0);
            }
        }
        tracing::debug!(subscription_id = %id, "filter registered");
        id
    }

    /// Remove the subscription and every filter it carries.
    pub fn unregister(&self, id: &SubscriptionId) -> bool {
        self.remove(id).is_some()
    }

    /// Remove every subscription referencing `device`, returning the
    /// subscribers whose streams ended.
    pub fn unregister_device(&self, device: &DeviceRef) -> Vec<Subscriber> {
        self.cascade([RefKey::Device(device.id.clone())])
    }

    /// Remove every subscription referencing the network or one of `devices`.
    pub fn unregister_network(&self, network_id: i64, devices: &[DeviceRef]) -> Vec<Subscriber> {
        let keys = std::iter::once(RefKey::Network(network_id))
            .chain(devices.iter().map(|device| RefKey::Device(device.id.clone())));
        self.cascade(keys)
    }

    /// Remove every subscription referencing the device type or one of `devices`.
    pub fn unregister_device_type(
        &self,
        device_type_id: i64,
        devices: &[DeviceRef],
    ) -> Vec<Subscriber> {
        let keys = std::iter::once(RefKey::DeviceType(device_type_id))
            .chain(devices.iter().map(|device| RefKey::Device(device.id.clone())));
        self.cascade(keys)
    }

    /// Subscriptions with at least one filter matching `event`, one per id.
    pub fn match_event(&self, event: &EventKey<'_>) -> Vec<Subscription> {
        let kind = event.kind;
        let mut buckets: SmallVec<[IndexKey; 5]> = SmallVec::new();
        if let Some(device) = event.device_id {
            buckets.push(IndexKey::Device(kind, device.to_string()));
        }
        if let Some(network) = event.network_id {
            buckets.push(IndexKey::Network(kind, network));
        }
        if let Some(device_type) = event.device_type_id {
            buckets.push(IndexKey::DeviceType(kind, device_type));
        }
        if let Some(name) = event.name {
            buckets.push(IndexKey::Name(kind, name.to_string()));
        }
        buckets.push(IndexKey::Any(kind));

        let mut candidates: HashSet<SubscriptionId> = HashSet::new();
        for bucket in &buckets {
            if let Some(ids) = self.primary.get(bucket) {
                candidates.extend(ids.iter().copied());
            }
        }

        let mut matched = Vec::with_capacity(candidates.len());
        for id in candidates {
            let Some(entry) = self.entries.get(&id) else {
                continue;
            };
            if let Some(filter) = entry.filters.iter().find(|filter| filter.matches(event)) {
                matched.push(Subscription {
                    id,
                    subscriber: entry.subscriber.clone(),
                    filter: filter.clone(),
                });
            }
        }
        matched
    }

    pub fn subscriber(&self, id: &SubscriptionId) -> Option<Subscriber> {
        self.entries.get(id).map(|entry| entry.subscriber.clone())
    }

    pub fn filters(&self, id: &SubscriptionId) -> Vec<Filter> {
        self.entries
            .get(id)
            .map(|entry| entry.filters.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, id: &SubscriptionId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove(&self, id: &SubscriptionId) -> Option<Subscriber> {
        let (_, entry) = self.entries.remove(id)?;
        for filter in &entry.filters {
            self.unindex(id, filter);
        }
        metrics::gauge!("courier_registry_subscriptions").decrement(1.0);
        tracing::debug!(subscription_id = %id, "subscription removed");
        Some(entry.subscriber)
    }

    fn cascade(&self, keys: impl IntoIterator<Item = RefKey>) -> Vec<Subscriber> {
        let mut affected: HashSet<SubscriptionId> = HashSet::new();
        for key in keys {
            if let Some(ids) = self.references.get(&key) {
                affected.extend(ids.iter().copied());
            }
        }
        let removed: Vec<Subscriber> = affected
            .into_iter()
            .filter_map(|id| self.remove(&id))
            .collect();
        if !removed.is_empty() {
            metrics::counter!("courier_registry_cascade_removed_total")
                .increment(removed.len() as u64);
        }
        removed
    }

    fn index(&self, id: SubscriptionId, filter: &Filter) {
        for key in index_keys(filter) {
            self.primary.entry(key).or_default().insert(id);
        }
        for key in ref_keys(filter) {
            self.references.entry(key).or_default().insert(id);
        }
    }

    fn unindex(&self, id: &SubscriptionId, filter: &Filter) {
        for key in index_keys(filter) {
            remove_from(&self.primary, &key, id);
        }
        for key in ref_keys(filter) {
            remove_from(&self.references, &key, id);
        }
    }
}

fn remove_from<K>(index: &DashMap<K, HashSet<SubscriptionId>>, key: &K, id: &SubscriptionId)
where
    K: Eq + std::hash::Hash,
{
    if let Some(mut ids) = index.get_mut(key) {
        ids.remove(id);
    }
    index.remove_if(key, |_, ids| ids.is_empty());
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_common::ALL_DEVICES;
    use courier_common::ids::CorrelationId;
    use std::sync::Arc;

    fn subscriber() -> Subscriber {
        Subscriber::new(SubscriptionId::new(), "response_topic_test", CorrelationId::new())
    }

    fn notification(device: &str) -> EventKey<'_> {
        EventKey::new(EventKind::Notification).device(device)
    }

    #[test]
    fn device_and_name_filter_matches_exact_pair_only() {
        let registry = FilterRegistry::new();
        let sub = subscriber();
        registry.register(
            Filter::new(EventKind::Notification)
                .with_devices(["D1"])
                .with_names(["temp"]),
            sub.clone(),
        );
        assert_eq!(registry.match_event(&notification("D1").name("temp")).len(), 1);
        assert!(registry.match_event(&notification("D1").name("hum")).is_empty());
        assert!(registry.match_event(&notification("D2").name("temp")).is_empty());
        assert!(
            registry
                .match_event(&EventKey::new(EventKind::Command).device("D1").name("temp"))
                .is_empty()
        );
    }

    #[test]
    fn all_devices_subscription_matches_every_device_of_its_kind() {
        let registry = FilterRegistry::new();
        let sub = subscriber();
        registry.register(Filter::all_devices(EventKind::Command), sub.clone());
        for device in ["D1", "D2", "anything"] {
            let matched = registry.match_event(&EventKey::new(EventKind::Command).device(device));
            assert_eq!(matched.len(), 1, "device {device}");
            assert_eq!(matched[0].id, sub.id);
        }
        assert!(registry.match_event(&notification("D1")).is_empty());
    }

    #[test]
    fn network_and_type_filters_are_indexed() {
        let registry = FilterRegistry::new();
        let by_network = subscriber();
        let by_type = subscriber();
        let by_name = subscriber();
        registry.register(
            Filter::new(EventKind::Notification).with_networks([7]),
            by_network.clone(),
        );
        registry.register(
            Filter::new(EventKind::Notification).with_device_types([2]),
            by_type.clone(),
        );
        registry.register(
            Filter::new(EventKind::Notification).with_names(["temp"]),
            by_name.clone(),
        );

        let event = notification("D9").network(7).device_type(2).name("temp");
        let mut ids: Vec<_> = registry.match_event(&event).into_iter().map(|s| s.id).collect();
        ids.sort();
        let mut expected = vec![by_network.id, by_type.id, by_name.id];
        expected.sort();
        assert_eq!(ids, expected);

        let only_network = notification("D9").network(7);
        let matched = registry.match_event(&only_network);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, by_network.id);
    }

    #[test]
    fn multiple_filters_on_one_subscription_match_once() {
        let registry = FilterRegistry::new();
        let sub = subscriber();
        registry.register(Filter::new(EventKind::Notification).with_devices(["D1"]), sub.clone());
        registry.register(Filter::new(EventKind::Notification).with_networks([1]), sub.clone());
        // Identical filter is ignored.
        registry.register(Filter::new(EventKind::Notification).with_networks([1]), sub.clone());
        assert_eq!(registry.filters(&sub.id).len(), 2);
        assert_eq!(registry.len(), 1);

        let matched = registry.match_event(&notification("D1").network(1));
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn unregister_removes_every_filter() {
        let registry = FilterRegistry::new();
        let sub = subscriber();
        registry.register(Filter::new(EventKind::Notification).with_devices(["D1"]), sub.clone());
        registry.register(Filter::new(EventKind::Command).with_devices(["D1"]), sub.clone());
        assert!(registry.unregister(&sub.id));
        assert!(!registry.unregister(&sub.id));
        assert!(registry.match_event(&notification("D1")).is_empty());
        assert!(registry.primary.is_empty());
        assert!(registry.references.is_empty());
    }

    #[test]
    fn device_cascade_removes_whole_subscription() {
        let registry = FilterRegistry::new();
        let sub = subscriber();
        let untouched = subscriber();
        registry.register(
            Filter::new(EventKind::Notification).with_devices(["D1", "D2"]),
            sub.clone(),
        );
        registry.register(Filter::new(EventKind::Notification).with_names(["x"]), sub.clone());
        registry.register(
            Filter::new(EventKind::Notification).with_devices(["D3"]),
            untouched.clone(),
        );

        let removed = registry.unregister_device(&DeviceRef::new("D1"));
        assert_eq!(removed, vec![sub.clone()]);
        // Not narrowed to D2: the subscription is gone entirely.
        assert!(registry.match_event(&notification("D2")).is_empty());
        assert!(registry.match_event(&notification("D9").name("x")).is_empty());
        assert!(registry.contains(&untouched.id));
    }

    #[test]
    fn network_cascade_covers_network_and_member_devices() {
        let registry = FilterRegistry::new();
        let by_network = subscriber();
        let by_device = subscriber();
        let other = subscriber();
        registry.register(Filter::new(EventKind::Notification).with_networks([5]), by_network.clone());
        registry.register(Filter::new(EventKind::Command).with_devices(["D1"]), by_device.clone());
        registry.register(Filter::new(EventKind::Command).with_devices(["D2"]), other.clone());

        let mut removed: Vec<_> = registry
            .unregister_network(5, &[DeviceRef::new("D1")])
            .into_iter()
            .map(|subscriber| subscriber.id)
            .collect();
        removed.sort();
        let mut expected = vec![by_network.id, by_device.id];
        expected.sort();
        assert_eq!(removed, expected);
        assert!(registry.contains(&other.id));
    }

    #[test]
    fn device_type_cascade_and_wildcard_survival() {
        let registry = FilterRegistry::new();
        let by_type = subscriber();
        let wildcard = subscriber();
        registry.register(
            Filter::new(EventKind::Notification).with_device_types([4]),
            by_type.clone(),
        );
        registry.register(
            Filter::new(EventKind::Notification).with_devices([ALL_DEVICES]),
            wildcard.clone(),
        );
        let removed = registry.unregister_device_type(4, &[DeviceRef::new("D7")]);
        assert_eq!(removed, vec![by_type.clone()]);
        assert!(registry.contains(&wildcard.id));
    }

    #[test]
    fn decoded_filter_with_empty_device_list_still_matches() {
        let registry = FilterRegistry::new();
        let sub = subscriber();
        let filter: Filter = serde_json::from_str(
            r#"{"kind":"notification","deviceIds":[],"names":["temp"]}"#,
        )
        .expect("decode");
        registry.register(filter, sub.clone());

        let hits = registry.match_event(&notification("D1").name("temp"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, sub.id);
        assert!(registry.primary.contains_key(&IndexKey::Name(
            EventKind::Notification,
            "temp".to_string()
        )));
    }

    #[test]
    fn unknown_cascade_is_a_no_op() {
        let registry = FilterRegistry::new();
        assert!(registry.unregister_device(&DeviceRef::new("ghost")).is_empty());
        assert!(registry.unregister_network(99, &[]).is_empty());
    }

    #[test]
    fn concurrent_register_match_unregister_is_consistent() {
        let registry = Arc::new(FilterRegistry::new());
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let device = format!("D{t}");
                    for _ in 0..200 {
                        let sub = subscriber();
                        registry.register(
                            Filter::new(EventKind::Notification).with_devices([device.as_str()]),
                            sub.clone(),
                        );
                        let matched = registry.match_event(&notification(&device));
                        assert!(matched.iter().any(|s| s.id == sub.id));
                        assert!(registry.unregister(&sub.id));
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().expect("thread");
        }
        assert!(registry.is_empty());
        assert!(registry.primary.is_empty());
    }
}
