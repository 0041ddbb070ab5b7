//! # Kubernetes module
//!
//! This module provide kubernetes helpers, the reconciliation context and
//! the traits driving a controller for a custom resource

use std::{error::Error, fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kube::{
    runtime::{
        controller::{self, Action},
        Controller,
    },
    CustomResourceExt, Resource,
};
#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{opts, register_counter_vec, CounterVec};
use serde::de::DeserializeOwned;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace};
#[cfg(feature = "trace")]
use tracing::Instrument;

use crate::svc::{
    cfg::Configuration,
    k8s::{
        api::KubeApi,
        exec::{KubeExec, PodExec},
    },
    pki::{Authority, Pki},
};

pub mod api;
pub mod client;
pub mod exec;
#[cfg(test)]
pub mod fake;
pub mod recorder;
pub mod resource;
pub mod selector;

// -----------------------------------------------------------------------------
// constants

pub const RECONCILIATION_UPSERT_EVENT: &str = "upsert";
pub const RECONCILIATION_DELETE_EVENT: &str = "delete";

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static RECONCILIATION_SUCCESS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "pgbackrest_operator_reconciliation_success",
            "number of successful reconciliation"
        ),
        &["kind"]
    )
    .expect("metrics 'pgbackrest_operator_reconciliation_success' to not be already registered")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_FAILED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "pgbackrest_operator_reconciliation_failed",
            "number of failed reconciliation"
        ),
        &["kind"]
    )
    .expect("metrics 'pgbackrest_operator_reconciliation_failed' to not be already registered")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_EVENT: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "pgbackrest_operator_reconciliation_event",
            "number of upsert or delete event",
        ),
        &["kind", "namespace", "event"]
    )
    .expect("metrics 'pgbackrest_operator_reconciliation_event' to not be already registered")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_DURATION: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "pgbackrest_operator_reconciliation_duration",
            "duration of reconciliation",
        ),
        &["kind", "unit"]
    )
    .expect("metrics 'pgbackrest_operator_reconciliation_duration' to not be already registered")
});

// -----------------------------------------------------------------------------
// Context structure

/// contains the capabilities used to reconcile resources, the kubernetes api,
/// the remote command execution and the key material generation
pub struct Context<A = KubeApi> {
    pub api: A,
    pub exec: Arc<dyn PodExec>,
    pub pki: Arc<dyn Pki>,
    pub config: Arc<Configuration>,
}

impl Context<KubeApi> {
    pub fn new(client: kube::Client, config: Arc<Configuration>) -> Self {
        Self {
            api: KubeApi::new(client.to_owned(), config.operator.field_manager.to_owned()),
            exec: Arc::new(KubeExec::from(client)),
            pki: Arc::new(Authority::default()),
            config,
        }
    }
}

// -----------------------------------------------------------------------------
// ControllerBuilder trait

/// provides a common way to create a kubernetes
/// controller [`Controller<T>`]
pub trait ControllerBuilder<T>
where
    T: Resource<DynamicType = ()> + Clone + Debug,
{
    /// returns a new created kubernetes controller
    fn build(&self, client: kube::Client) -> Controller<T>;
}

// -----------------------------------------------------------------------------
// Reconciler trait

/// provides two method which is given to a kubenetes controller
/// [`Controller<T>`]
#[async_trait]
pub trait Reconciler<T>
where
    T: Resource<DynamicType = ()> + CustomResourceExt + Debug + Clone + Send + Sync + 'static,
{
    type Error: Error + Send + Sync + 'static;

    /// create or update the object, this is part of the the reconcile function
    async fn upsert(ctx: Arc<Context>, obj: Arc<T>) -> Result<Action, Self::Error>;

    /// delete the object from kubernetes
    async fn delete(ctx: Arc<Context>, obj: Arc<T>) -> Result<Action, Self::Error>;

    /// returns a [`Action`] to perform following the given error
    fn retry(_obj: Arc<T>, err: &Self::Error, ctx: Arc<Context>) -> Action {
        let duration = Duration::from_secs(ctx.config.operator.requeue_seconds);

        trace!(
            duration = duration.as_millis() as u64,
            error = err.to_string(),
            "Requeue failed reconciliation"
        );
        Action::requeue(duration)
    }

    /// process the object and perform actions on kubernetes, returns a
    /// [`Action`] to maybe perform another reconciliation or an error, if
    /// something gets wrong.
    async fn reconcile(obj: Arc<T>, ctx: Arc<Context>) -> Result<Action, Self::Error> {
        let (namespace, name) = resource::namespaced_name(&*obj);
        let kind = T::kind(&()).to_string();

        if resource::deleted(&*obj) {
            info!(
                kind = &kind,
                namespace = &namespace,
                name = &name,
                "Received deletion event for custom resource"
            );

            #[cfg(feature = "metrics")]
            RECONCILIATION_EVENT
                .with_label_values(&[&kind, &namespace, RECONCILIATION_DELETE_EVENT])
                .inc();

            #[cfg(not(feature = "trace"))]
            let result = Self::delete(ctx, obj.to_owned()).await;
            #[cfg(feature = "trace")]
            let result = Self::delete(ctx, obj.to_owned())
                .instrument(tracing::info_span!("Reconciler::delete"))
                .await;

            if let Err(err) = &result {
                error!(
                    kind = &kind,
                    namespace = &namespace,
                    name = &name,
                    error = err.to_string(),
                    "Failed to delete custom resource"
                );
            }

            return result;
        }

        info!(
            kind = &kind,
            namespace = &namespace,
            name = &name,
            "Received upsertion event for custom resource"
        );

        #[cfg(feature = "metrics")]
        RECONCILIATION_EVENT
            .with_label_values(&[&kind, &namespace, RECONCILIATION_UPSERT_EVENT])
            .inc();

        #[cfg(not(feature = "trace"))]
        let result = Self::upsert(ctx, obj.to_owned()).await;
        #[cfg(feature = "trace")]
        let result = Self::upsert(ctx, obj.to_owned())
            .instrument(tracing::info_span!("Reconciler::upsert"))
            .await;

        if let Err(err) = &result {
            error!(
                kind = &kind,
                namespace = &namespace,
                name = &name,
                error = err.to_string(),
                "Failed to upsert custom resource"
            );
        }

        result
    }
}

// -----------------------------------------------------------------------------
// Watcher trait

/// provides a watch method that listen to events of
/// kubernetes custom resource using a [`Controller<T>`]
#[async_trait]
pub trait Watcher<T>: ControllerBuilder<T> + Reconciler<T>
where
    T: DeserializeOwned
        + Resource<DynamicType = ()>
        + CustomResourceExt
        + Clone
        + Debug
        + Send
        + Sync
        + 'static,
    Self: Send + Sync + 'static,
{
    /// listen for events of the custom resource as generic parameter
    async fn watch(&self, client: kube::Client, ctx: Arc<Context>) {
        let kind = T::kind(&()).to_string();
        let mut stream = self
            .build(client)
            .run(Self::reconcile, Self::retry, ctx)
            .boxed();

        loop {
            let instant = Instant::now();

            match stream.try_next().await {
                Ok(None) => {
                    debug!("We have reached the end of the infinite watch stream");
                    return;
                }
                Ok(Some((obj, _action))) => {
                    info!(
                        kind = &kind,
                        namespace = obj.namespace.as_deref().unwrap_or("<none>"),
                        name = &obj.name,
                        "Successfully reconcile resource"
                    );

                    #[cfg(feature = "metrics")]
                    RECONCILIATION_SUCCESS.with_label_values(&[&kind]).inc();
                }
                Err(controller::Error::ObjectNotFound(obj)) => {
                    debug!(
                        kind = &kind,
                        namespace = obj.namespace.as_deref().unwrap_or("<none>"),
                        name = &obj.name,
                        "Received an event about an already deleted resource"
                    );

                    #[cfg(feature = "metrics")]
                    RECONCILIATION_SUCCESS.with_label_values(&[&kind]).inc();
                }
                Err(err) => {
                    error!(
                        kind = &kind,
                        error = err.to_string(),
                        "Failed to reconcile resource"
                    );

                    #[cfg(feature = "metrics")]
                    RECONCILIATION_FAILED.with_label_values(&[&kind]).inc();
                }
            }

            #[cfg(feature = "metrics")]
            RECONCILIATION_DURATION
                .with_label_values(&[&kind, "us"])
                .inc_by(Instant::now().duration_since(instant).as_micros() as f64);

            trace!(kind = &kind, "Put watch event loop to bed");
            sleep_until(instant + Duration::from_millis(100)).await;
        }
    }
}

/// Blanklet implementation for [`Watcher<T>`]
impl<T, U> Watcher<T> for U
where
    T: DeserializeOwned
        + Resource<DynamicType = ()>
        + CustomResourceExt
        + Clone
        + Debug
        + Send
        + Sync
        + 'static,
    U: Reconciler<T> + ControllerBuilder<T> + Send + Sync + 'static,
{
}
