//! Subscription dispatch
//!
//! [`Dispatcher`] turns each wire delivery into a [`Publication`], decodes it,
//! runs the user handler and routes failures to the error hook. Publications
//! come from a [`PublicationPool`]; a pooled publication is reset only when its
//! guard is dropped, after the handler has returned.

use super::{DispatchError, ErrorHandler, Handler, Publication};
use crate::codec::Codec;
use crate::context::Context;
use crate::delivery_span;
use crate::transport::nats::MessageHandler;
use crate::transport::{DeliveryCallback, WireMessage};
use futures::FutureExt;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tracing::{error, Instrument};

/// Idle publications kept by default
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// Free-list of reusable publications
#[derive(Debug)]
pub struct PublicationPool {
    free: Mutex<Vec<Publication>>,
    capacity: usize,
}

impl Default for PublicationPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

impl PublicationPool {
    /// Pool keeping at most `capacity` idle publications
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Take a clean publication, allocating when the pool is empty
    pub fn acquire(self: &Arc<Self>) -> PooledPublication {
        let publication = self.free.lock().pop().unwrap_or_default();
        PooledPublication {
            publication,
            pool: Arc::clone(self),
        }
    }

    /// Number of idle publications
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    fn release(&self, mut publication: Publication) {
        publication.reset();
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(publication);
        }
    }
}

/// Exclusive handle to a pooled publication; returns it to the pool on drop
#[derive(Debug)]
pub struct PooledPublication {
    publication: Publication,
    pool: Arc<PublicationPool>,
}

impl Deref for PooledPublication {
    type Target = Publication;

    fn deref(&self) -> &Publication {
        &self.publication
    }
}

impl DerefMut for PooledPublication {
    fn deref_mut(&mut self) -> &mut Publication {
        &mut self.publication
    }
}

impl Drop for PooledPublication {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.publication));
    }
}

/// Per-subscription delivery logic
pub struct Dispatcher {
    handler: Arc<dyn Handler>,
    error_handler: Option<ErrorHandler>,
    codec: Arc<dyn Codec>,
    body_only: bool,
    pool: Arc<PublicationPool>,
}

impl Dispatcher {
    pub fn new(
        handler: Arc<dyn Handler>,
        error_handler: Option<ErrorHandler>,
        codec: Arc<dyn Codec>,
        body_only: bool,
        pool: Arc<PublicationPool>,
    ) -> Self {
        Self {
            handler,
            error_handler,
            codec,
            body_only,
            pool,
        }
    }

    /// Wrap into the callback the transport's delivery task invokes
    pub fn into_callback(self) -> DeliveryCallback {
        let dispatcher = Arc::new(self);
        Arc::new(move |wire: WireMessage| {
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.dispatch(wire).await }.boxed()
        })
    }

    /// Handle one delivery end to end
    pub async fn dispatch(&self, wire: WireMessage) {
        let mut publication = self.pool.acquire();
        publication.topic.push_str(&wire.subject);

        let decoded = MessageHandler::decode(
            self.codec.as_ref(),
            &wire,
            self.body_only,
            &mut publication.message,
        );
        let context = Context::for_delivery(&wire.subject, Some(&publication.message.header));
        publication.context = context;

        let span = delivery_span!(
            subject = %wire.subject,
            request_id = publication.context.request_id().unwrap_or_default()
        );

        async {
            if let Err(e) = decoded {
                publication.error = Some(DispatchError::Decode(e));
                self.report(&publication);
                return;
            }

            if let Err(e) = self.handler.handle(&publication).await {
                publication.error = Some(DispatchError::Handler(e));
                self.report(&publication);
            }
        }
        .instrument(span)
        .await;
    }

    fn report(&self, publication: &Publication) {
        match &self.error_handler {
            Some(hook) => hook(publication),
            None => {
                if let Some(err) = publication.error() {
                    error!(
                        topic = publication.topic(),
                        request_id = publication.context().request_id().unwrap_or_default(),
                        error = %err,
                        "Message dispatch failed"
                    );
                }
            }
        }
    }
}
