//! Provides the main [`Request`] struct and related types.

use super::{
    response::{Response, ResponseType},
    Tier,
};
use crate::Key;

/// An individual GET or PUT request; each request can batch multiple keys.
///
/// The target node responds with a [`Response`][super::Response].
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Request {
    /// A client-specific ID used to match asynchronous requests with responses.
    pub request_id: Option<String>,
    /// The topic at which the client is waiting for the server's response.
    pub response_address: Option<String>,
    /// The tier whose threads should serve the request, if it matters to the sender.
    pub tier: Option<Tier>,
    /// The type and data of this request.
    pub request: RequestData,
}

impl Request {
    /// Constructs a new [`Response`] for the request.
    ///
    /// Sets [`response_id`][Response::response_id] and `ty`[Response::ty] fields accordingly.
    /// The [`error`][Response::error] field is initialized with [`Ok(())`][Result::ok] and
    /// the [`tuples`][Response::tuples] field with an empty list.
    pub fn new_response(&self) -> Response {
        Response {
            response_id: self.request_id.clone(),
            ty: self.request.ty(),
            tuples: Default::default(),
            error: Ok(()),
        }
    }
}

/// Specifies the request type and associated data.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum RequestData {
    /// Request the stored values for a set of keys.
    Get {
        /// The list of keys that we want to get the values for.
        keys: Vec<Key>,
    },
    /// Performs the given updates in the key value store.
    Put {
        /// A list of updates batched in this request.
        tuples: Vec<PutTuple>,
    },
}

impl RequestData {
    /// Returns the suitable [`ResponseType`] for this request.
    pub fn ty(&self) -> ResponseType {
        match self {
            RequestData::Get { .. } => ResponseType::Get,
            RequestData::Put { .. } => ResponseType::Put,
        }
    }

    /// Returns the keys that this request reads or writes.
    pub fn keys(&self) -> Vec<&Key> {
        match self {
            RequestData::Get { keys } => keys.iter().collect(),
            RequestData::Put { tuples } => tuples.iter().map(|t| &t.key).collect(),
        }
    }
}

/// Describes an assign operation on a specific key.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PutTuple {
    /// The key that should be updated.
    pub key: Key,
    /// The serialized value that should be stored.
    pub value: Vec<u8>,
}
