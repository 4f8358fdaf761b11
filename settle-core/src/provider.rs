//! Provider - Reading remote resources and waiting on their lifecycle
//!
//! A provider talks to the remote API; this module only needs it to read a
//! resource's current state. The waits here combine that read with the
//! poller the way create, update and delete operations use it, and
//! `enrich_all` is the fan-out step of list operations.

use std::future::Future;
use std::pin::Pin;

use crate::cancel::CancelToken;
use crate::fanout::{FanOutError, fan_out};
use crate::lifecycle::PollSpec;
use crate::poller::{FinalState, Fetched, PollError, PollOutcome, poll};
use crate::resource::ResourceId;

/// Error type for reads of a remote resource
#[derive(Debug)]
pub struct FetchError {
    pub message: String,
    pub resource_id: Option<ResourceId>,
    /// The remote API reported the resource as absent (e.g., HTTP 404)
    pub not_found: bool,
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref id) = self.resource_id {
            write!(f, "[{}] {}", id, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|e| e.as_ref() as &dyn std::error::Error)
    }
}

impl FetchError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            resource_id: None,
            not_found: false,
            cause: None,
        }
    }

    /// Error for a resource the remote API does not know
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            not_found: true,
            ..Self::new(message)
        }
    }

    pub fn for_resource(mut self, id: ResourceId) -> Self {
        self.resource_id = Some(id);
        self
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn is_not_found(&self) -> bool {
        self.not_found
    }
}

pub type ReadResult<T> = Result<T, FetchError>;

/// Return type for async operations
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Reads the current lifecycle state of resources of one provider
///
/// `S` is the provider's snapshot type (e.g., a decoded API response).
pub trait ResourceReader<S>: Send + Sync {
    /// Read a resource by its remote identifier
    ///
    /// A missing resource may be reported either as `Fetched::NotFound` or as
    /// a [`FetchError::not_found`] error.
    fn read(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, ReadResult<Fetched<S>>>;
}

/// ResourceReader implementation for Box<dyn ResourceReader>
impl<S> ResourceReader<S> for Box<dyn ResourceReader<S>> {
    fn read(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, ReadResult<Fetched<S>>> {
        (**self).read(id, identifier)
    }
}

async fn read_state<S, R>(reader: &R, id: &ResourceId, identifier: &str) -> ReadResult<Fetched<S>>
where
    R: ResourceReader<S> + ?Sized,
{
    match reader.read(id, identifier).await {
        Ok(fetched) => Ok(fetched),
        Err(e) if e.is_not_found() => Ok(Fetched::NotFound),
        Err(e) if e.resource_id.is_none() => Err(e.for_resource(id.clone())),
        Err(e) => Err(e),
    }
}

/// Wait after a create or update until the resource reaches a target state
///
/// A resource that disappears while waiting is reported as a fetch failure.
pub async fn wait_for_target<S, R>(
    reader: &R,
    id: &ResourceId,
    identifier: &str,
    spec: &PollSpec,
    cancel: &CancelToken,
) -> Result<PollOutcome<S>, PollError<S>>
where
    R: ResourceReader<S> + ?Sized,
{
    log::debug!("Waiting for {} ({}) to become available", id, identifier);

    let outcome = poll(spec, cancel, || read_state(reader, id, identifier)).await?;
    match outcome.final_state {
        FinalState::NotFound => Err(PollError::Fetch {
            source: FetchError::not_found(format!(
                "Resource {} disappeared while waiting for it",
                identifier
            ))
            .for_resource(id.clone()),
            snapshot: outcome.snapshot,
            report: outcome.report,
        }),
        _ => Ok(outcome),
    }
}

/// Wait after a delete until the resource is gone
///
/// Both a not-found read and a target state (e.g., "deleted") end the wait.
pub async fn wait_for_deleted<S, R>(
    reader: &R,
    id: &ResourceId,
    identifier: &str,
    spec: &PollSpec,
    cancel: &CancelToken,
) -> Result<PollOutcome<S>, PollError<S>>
where
    R: ResourceReader<S> + ?Sized,
{
    log::debug!("Waiting for {} ({}) to be deleted", id, identifier);

    poll(spec, cancel, || read_state(reader, id, identifier)).await
}

/// Items of a list operation after enrichment
#[derive(Debug)]
pub struct EnrichedList<T> {
    /// Enriched items in input order, failed ones left out
    pub items: Vec<T>,
    /// Input index and error of every item that failed
    pub failures: Vec<(usize, FetchError)>,
}

impl<T> EnrichedList<T> {
    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }
}

/// Enrich every listed item with a further read, `concurrency` at a time
pub async fn enrich_all<I, T, F, Fut>(
    items: Vec<I>,
    concurrency: usize,
    cancel: &CancelToken,
    enrich: F,
) -> Result<EnrichedList<T>, FanOutError>
where
    F: FnMut(I) -> Fut,
    Fut: Future<Output = ReadResult<T>>,
{
    let total = items.len();
    let (items, failures) = fan_out(items, concurrency, cancel, enrich)
        .await?
        .into_parts();

    if !failures.is_empty() {
        log::debug!("{} of {} items failed enrichment", failures.len(), total);
    }

    Ok(EnrichedList { items, failures })
}
