//! # statehub remote
//!
//! Remote backends for statehub.
//!
//! Everything that leaves the process funnels through one [`RequestQueue`]:
//! two FIFO lanes (priority, background) gated on the auth collaborator,
//! with completion routing for auth expiry (refresh + priority requeue) and
//! unreachable servers. The [`OfflineManager`] owns the unreachable path:
//! it persists write-class requests as durable envelopes, rejects reads,
//! pings for liveness and replays the envelopes with priority once the
//! server answers again. [`RestAdapter`] and [`GraphQlAdapter`] mount HTTP
//! APIs as asynchronous backends for the core crate's state managers, and
//! [`PersistentCache`] keeps a TTL-governed local copy of remote
//! collections.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auth;
mod cache;
mod clock;
mod error;
mod graphql;
mod offline;
mod queue;
mod rest;
mod transport;

pub use auth::{AuthProvider, ContextSupplier, StaticAuth, StaticContext};
pub use cache::{
    cache_meta_spec, CacheEntryConfig, PersistentCache, PushChange, CACHE_META_COLLECTION,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{RemoteError, RemoteResult};
pub use graphql::{GraphQlAdapter, GraphQlCollection, GraphQlOperation};
pub use offline::{
    offline_collection_spec, ConnectivityListener, OfflineConfig, OfflineManager,
    OFFLINE_COLLECTION,
};
pub use queue::{QueueCallback, QueueClass, QueueOutcome, RequestQueue, UnreachableHandler};
pub use rest::{ApiFeatures, RestAdapter, CONTEXT_HEADER, IF_MODIFIED_HEADER};
pub use transport::{HttpRequest, HttpResponse, Method, MockTransport, Transport};
