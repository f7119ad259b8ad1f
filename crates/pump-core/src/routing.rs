//! Cross-pipeline handoff with throttle mirroring.
//!
//! A [`Router`] delivers events into the [`InternalSource`] of another
//! pipeline. The first time an address is used the router starts listening
//! to the target pipeline's bus, and from then on keeps two throttle tokens
//! on its own pipeline in sync with the target:
//!
//! - `pipeline:<id>` while the target pipeline is not ready;
//! - `source:<address>` while the target queue is under backpressure.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::bus::{EventBus, ListenerId, Topic};
use crate::context::Context;
use crate::error::{PumpError, Result};
use crate::internal::InternalSource;
use crate::pipeline::{Pipeline, ThrottleToken};
use crate::processor::{Event, Outcome, Processor, Sink};
use crate::service::PumpService;

struct Route<E: Event> {
    source: InternalSource<E>,
    bus: EventBus,
    listener: ListenerId,
}

pub struct Router<E: Event> {
    service: Weak<PumpService<E>>,
    owner: Mutex<Weak<Pipeline<E>>>,
    routes: Mutex<HashMap<String, Route<E>>>,
}

impl<E: Event> Router<E> {
    pub fn new(service: &Arc<PumpService<E>>) -> Self {
        Self {
            service: Arc::downgrade(service),
            owner: Mutex::new(Weak::new()),
            routes: Mutex::new(HashMap::new()),
        }
    }

    /// Bind the router to the pipeline whose throttle set it mirrors into.
    pub fn attach(&self, pipeline: &Weak<Pipeline<E>>) {
        *self.owner.lock() = pipeline.clone();
    }

    /// Enqueue `event` into the internal source at `address`.
    pub fn route(&self, context: Context, event: E, address: &str) -> Result<()> {
        self.resolve(address)?.put(context, event)
    }

    /// Look up `address`, subscribing to its pipeline on first use.
    pub fn resolve(&self, address: &str) -> Result<InternalSource<E>> {
        let mut routes = self.routes.lock();
        if let Some(route) = routes.get(address) {
            return Ok(route.source.clone());
        }

        let service = self
            .service
            .upgrade()
            .ok_or(PumpError::ChannelClosed("pump service"))?;
        let source = service.locate(address).inspect_err(|e| {
            warn!(address, error = %e, "Cannot locate route target");
        })?;
        let target = source.pipeline().ok_or_else(|| {
            PumpError::NotFound(format!("pipeline of '{address}' is gone"))
        })?;
        let owner = self.owner.lock().clone();

        let mirror = Mirror {
            owner,
            target: Arc::downgrade(&target),
            source: source.clone(),
            pipeline_token: ThrottleToken::from(format!("pipeline:{}", target.id())),
            source_token: ThrottleToken::from(format!("source:{address}")),
        };
        mirror.sync();
        let bus = target.bus().clone();
        let listener = bus.listen(
            &[
                Topic::Ready,
                Topic::NotReady,
                Topic::BackpressureOn,
                Topic::BackpressureOff,
            ],
            move |_| mirror.sync(),
        );
        debug!(address, target = target.id(), "Route subscribed");

        routes.insert(
            address.to_string(),
            Route {
                source: source.clone(),
                bus,
                listener,
            },
        );
        Ok(source)
    }
}

impl<E: Event> Drop for Router<E> {
    fn drop(&mut self) {
        for route in self.routes.get_mut().values() {
            route.bus.unlisten(route.listener);
        }
    }
}

/// Copies the target's current state into the owner's throttle set.
struct Mirror<E: Event> {
    owner: Weak<Pipeline<E>>,
    target: Weak<Pipeline<E>>,
    source: InternalSource<E>,
    pipeline_token: ThrottleToken,
    source_token: ThrottleToken,
}

impl<E: Event> Mirror<E> {
    fn sync(&self) {
        let (Some(owner), Some(target)) = (self.owner.upgrade(), self.target.upgrade()) else {
            return;
        };
        owner.throttle(self.pipeline_token.clone(), !target.is_ready());
        owner.throttle(self.source_token.clone(), self.source.is_backpressured());
    }
}

/// A sink that picks the target address per event.
pub struct RouterSink<E: Event> {
    name: String,
    router: Router<E>,
    select: Box<dyn Fn(&Context, &E) -> Option<String> + Send + Sync>,
}

impl<E: Event> RouterSink<E> {
    pub fn new<F>(name: impl Into<String>, service: &Arc<PumpService<E>>, select: F) -> Self
    where
        F: Fn(&Context, &E) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            router: Router::new(service),
            select: Box::new(select),
        }
    }

    /// Route every event to `address`.
    pub fn fixed(name: impl Into<String>, service: &Arc<PumpService<E>>, address: impl Into<String>) -> Self {
        let address = address.into();
        Self::new(name, service, move |_, _| Some(address.clone()))
    }

    pub fn router(&self) -> &Router<E> {
        &self.router
    }
}

impl<E: Event> Sink<E> for RouterSink<E> {
    fn name(&self) -> &str {
        &self.name
    }

    fn consume(&self, context: &Context, event: E) -> Result<()> {
        match (self.select)(context, &event) {
            Some(address) => self.router.route(context.clone(), event, &address),
            None => {
                debug!(sink = %self.name, "No route for event, dropped");
                Ok(())
            }
        }
    }

    fn attach(&self, pipeline: &Weak<Pipeline<E>>) {
        self.router.attach(pipeline);
    }
}

/// Copies every event into another pipeline and passes it on.
pub struct TeeProcessor<E: Event> {
    name: String,
    address: String,
    router: Router<E>,
}

impl<E: Event> TeeProcessor<E> {
    pub fn new(name: impl Into<String>, service: &Arc<PumpService<E>>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            router: Router::new(service),
        }
    }
}

impl<E: Event> Processor<E> for TeeProcessor<E> {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, context: &Context, event: E) -> Result<Outcome<E>> {
        self.router
            .route(context.clone(), event.clone(), &self.address)?;
        Ok(Outcome::Next(event))
    }

    fn attach(&self, pipeline: &Weak<Pipeline<E>>) {
        self.router.attach(pipeline);
    }
}
