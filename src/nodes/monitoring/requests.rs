//! Builds the metadata requests of one epoch and tracks their responses.

use crate::{
    hash_ring::HashRings,
    messages::{
        request::{PutTuple, RequestData},
        response::ResponseType,
        Request, Tier,
    },
    metadata::MetadataKey,
    Key,
};
use rand::prelude::SliceRandom;
use std::{
    collections::{BTreeMap, HashMap},
    time::Instant,
};

/// Groups metadata requests by destination and assigns their ids.
///
/// Request ids have the form `<response topic>:<epoch>:<counter>`, so they are never reused
/// within an epoch and never collide with the ids of another epoch.
#[derive(Debug)]
pub struct RequestBuilder {
    response_topic: String,
    epoch: usize,
    next_id: usize,
    requests: BTreeMap<(String, ResponseType), Request>,
}

impl RequestBuilder {
    /// Creates a builder for the given epoch. Responses are requested on `response_topic`.
    pub fn new(response_topic: String, epoch: usize) -> Self {
        Self {
            response_topic,
            epoch,
            next_id: 0,
            requests: Default::default(),
        }
    }

    /// The epoch that this builder creates requests for.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Returns a fresh request id of this epoch.
    pub fn next_request_id(&mut self) -> String {
        request_id(&self.response_topic, self.epoch, &mut self.next_id)
    }

    /// Reads `key` from the thread listening on `destination`.
    ///
    /// Is batched with other GET requests to the same destination.
    pub fn prepare_metadata_get_request(&mut self, key: &MetadataKey, destination: String) {
        let request = self.request_entry(destination, ResponseType::Get);
        if let RequestData::Get { keys } = &mut request.request {
            keys.push(key.clone().into());
        }
    }

    /// Writes `value` under `key` on the thread listening on `destination`.
    ///
    /// Is batched with other PUT requests to the same destination.
    pub fn prepare_metadata_put_request(
        &mut self,
        key: &MetadataKey,
        value: Vec<u8>,
        destination: String,
    ) {
        let request = self.request_entry(destination, ResponseType::Put);
        if let RequestData::Put { tuples } = &mut request.request {
            tuples.push(PutTuple {
                key: key.clone().into(),
                value,
            });
        }
    }

    /// Removes all prepared requests, ordered by destination.
    pub fn take_requests(&mut self) -> Vec<(String, Request)> {
        std::mem::take(&mut self.requests)
            .into_iter()
            .map(|((destination, _), request)| (destination, request))
            .collect()
    }

    fn request_entry(&mut self, destination: String, ty: ResponseType) -> &mut Request {
        let Self {
            response_topic,
            epoch,
            next_id,
            requests,
        } = self;
        requests.entry((destination, ty)).or_insert_with(|| Request {
            request_id: Some(request_id(response_topic, *epoch, next_id)),
            response_address: Some(response_topic.clone()),
            tier: Some(Tier::Memory),
            request: match ty {
                ResponseType::Get => RequestData::Get { keys: Vec::new() },
                ResponseType::Put => RequestData::Put { tuples: Vec::new() },
            },
        })
    }
}

fn request_id(response_topic: &str, epoch: usize, next_id: &mut usize) -> String {
    let id = format!("{}:{}:{}", response_topic, epoch, next_id);
    *next_id += 1;
    id
}

/// Picks one of the threads responsible for `key` and returns its request topic.
///
/// Returns `None` if the memory tier, which stores all metadata, has no nodes.
pub fn metadata_destination(
    rings: &HashRings,
    key: &MetadataKey,
    local_replication: usize,
    prefix: &str,
) -> Option<String> {
    rings
        .metadata_threads(key, local_replication)
        .choose(&mut rand::thread_rng())
        .map(|thread| thread.request_topic(prefix))
}

/// A sent request whose response is still outstanding.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    /// The topic the request was sent on.
    pub destination: String,
    /// The keys read or written by the request.
    pub keys: Vec<Key>,
    /// When the request was sent.
    pub issued_at: Instant,
}

/// The requests of one epoch, indexed by request id.
///
/// Requests that are still pending at the deadline are returned by [`Self::into_expired`].
#[derive(Debug)]
pub struct PendingRequests {
    deadline: Instant,
    requests: HashMap<String, PendingRequest>,
}

impl PendingRequests {
    /// Creates an empty table that expires at `deadline`.
    pub fn new(deadline: Instant) -> Self {
        Self {
            deadline,
            requests: Default::default(),
        }
    }

    /// The point in time at which outstanding requests count as missing.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Remembers that `request` was sent to `destination` at `now`.
    ///
    /// Requests without id can't be matched and are not tracked.
    pub fn track(&mut self, destination: &str, request: &Request, now: Instant) {
        if let Some(id) = &request.request_id {
            self.requests.insert(
                id.clone(),
                PendingRequest {
                    destination: destination.to_owned(),
                    keys: request.request.keys().into_iter().cloned().collect(),
                    issued_at: now,
                },
            );
        }
    }

    /// Removes and returns the request with the given id.
    ///
    /// A second call with the same id returns `None`, which makes duplicate responses harmless.
    pub fn take(&mut self, request_id: &str) -> Option<PendingRequest> {
        self.requests.remove(request_id)
    }

    /// Returns true if every tracked request was answered.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// The number of outstanding requests.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Consumes the table and returns the requests that were never answered.
    pub fn into_expired(self) -> Vec<PendingRequest> {
        let mut expired: Vec<_> = self.requests.into_values().collect();
        expired.sort_by(|a, b| a.destination.cmp(&b.destination));
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metadata::KvsMetadataKind,
        topics::{KvsThread, NodeAddress},
    };
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    fn stats_key(thread_id: u32, kind: KvsMetadataKind) -> MetadataKey {
        MetadataKey::KvsThread {
            tier: Tier::Memory,
            kvs_thread: KvsThread::new(NodeAddress::new("34.0.0.1", "10.0.0.1"), thread_id),
            kind,
        }
    }

    #[test]
    fn requests_are_batched_per_destination() {
        let mut builder = RequestBuilder::new("anna/monitoring/m/response".into(), 3);
        let server_stats = stats_key(0, KvsMetadataKind::ServerStats);
        builder.prepare_metadata_get_request(&server_stats, "b".into());
        builder.prepare_metadata_get_request(&stats_key(0, KvsMetadataKind::KeySize), "a".into());
        builder.prepare_metadata_get_request(&stats_key(1, KvsMetadataKind::KeySize), "b".into());
        builder.prepare_metadata_put_request(
            &stats_key(1, KvsMetadataKind::KeyAccess),
            vec![1],
            "b".into(),
        );

        let requests = builder.take_requests();
        let destinations: Vec<_> = requests
            .iter()
            .map(|(d, r)| (d.as_str(), r.request.ty()))
            .collect();
        assert_eq!(
            destinations,
            vec![("a", ResponseType::Get), ("b", ResponseType::Get), ("b", ResponseType::Put)]
        );
        assert_eq!(requests[1].1.request.keys().len(), 2);
        assert!(builder.take_requests().is_empty());
    }

    #[test]
    fn request_ids_are_unique_within_epoch() {
        let mut builder = RequestBuilder::new("resp".into(), 7);
        for i in 0..5 {
            builder.prepare_metadata_get_request(
                &stats_key(i, KvsMetadataKind::ServerStats),
                format!("dest-{}", i),
            );
        }
        let first = builder.next_request_id();
        let ids: HashSet<_> = builder
            .take_requests()
            .into_iter()
            .filter_map(|(_, r)| r.request_id)
            .chain(std::iter::once(first.clone()))
            .collect();
        assert_eq!(ids.len(), 6);
        assert_eq!(first, "resp:7:5");
        assert_ne!(RequestBuilder::new("resp".into(), 8).next_request_id(), "resp:7:0");
    }

    #[test]
    fn duplicate_responses_match_once() {
        let now = Instant::now();
        let mut builder = RequestBuilder::new("resp".into(), 0);
        let server_stats = stats_key(0, KvsMetadataKind::ServerStats);
        builder.prepare_metadata_get_request(&server_stats, "a".into());
        builder.prepare_metadata_get_request(&stats_key(0, KvsMetadataKind::KeySize), "b".into());

        let mut pending = PendingRequests::new(now);
        for (destination, request) in builder.take_requests() {
            pending.track(&destination, &request, now);
        }
        assert_eq!(pending.len(), 2);

        assert_eq!(pending.take("resp:0:0").map(|p| p.destination), Some("a".into()));
        assert_eq!(pending.take("resp:0:0"), None);

        let expired = pending.into_expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].destination, "b");
    }
}
