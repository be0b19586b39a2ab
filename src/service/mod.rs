//! The monkey service: one per worker process.
//!
//! Owns the subscription to the job topic, the table of in-flight jobs and
//! every client handle. Each accepted job runs in its own task; the service
//! itself only admits jobs and shuts things down.


use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::ContextCache;
use crate::clients::{
    Beacon, DiscoveryClient, HttpDiscovery, HttpResolver, JobQueueClient, NameResolver,
    NatsJobQueue, start_beacon,
};
use crate::config::Config;
use crate::error::{Result, ServiceError};
use crate::fanout::FanOut;
use crate::maintenance::start_maintenance;
use crate::monkey::{JobMessage, JobRunner, JobTable, Monkey};
use crate::node::Node;
use crate::stream::{PeerStream, StreamState};
use crate::subscription::{MessageHandler, Subscription, SubscriptionState};
use crate::vm::{DirectorySource, RhaiVm, Vm, default_modules};

/// Pre-built collaborators. Anything left `None` is built from the config.
#[derive(Default)]
pub struct Collaborators {
    pub node: Option<Arc<Node>>,
    pub queue: Option<Arc<dyn JobQueueClient>>,
    pub resolver: Option<Arc<dyn NameResolver>>,
    pub discovery: Option<Arc<dyn DiscoveryClient>>,
    pub vm: Option<Arc<dyn Vm>>,
}

pub struct Service {
    /// Child of the root token for the service's own background tasks.
    background: CancellationToken,
    config: Config,
    domain_pattern: Option<Regex>,
    node: Arc<Node>,
    stream: PeerStream,
    subscription: Subscription,
    queue: Arc<dyn JobQueueClient>,
    resolver: Arc<dyn NameResolver>,
    jobs: JobTable,
    cache: Arc<ContextCache>,
    fanout: Arc<FanOut>,
    tasks: Vec<JoinHandle<()>>,
    closed: AtomicBool,
}

impl Service {
    /// Build the service with production collaborators.
    pub async fn new(token: CancellationToken, config: Config) -> Result<Self> {
        Self::with_collaborators(token, config, Collaborators::default()).await
    }

    pub async fn with_collaborators(
        token: CancellationToken,
        mut config: Config,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let domain_pattern = config.build()?;

        let vm = match collaborators.vm {
            Some(vm) => vm,
            None => default_vm(&config, &token)?,
        };

        let background = token.child_token();
        let cache = Arc::new(ContextCache::new(config.cache.clone()));
        let mut tasks = vec![start_maintenance(
            cache.clone(),
            config.maintenance_interval(),
            config.maintenance_max_age(),
            background.clone(),
        )];

        let node = match collaborators.node {
            Some(node) => node,
            None => match Node::bind(&config.listen).await {
                Ok(node) => node,
                Err(e) => return Err(abort(&background, None, None, e.into()).await),
            },
        };

        let queue: Arc<dyn JobQueueClient> = match collaborators.queue {
            Some(queue) => queue,
            None => match NatsJobQueue::connect(&config.nats).await {
                Ok(queue) => Arc::new(queue),
                Err(e) => return Err(abort(&background, None, None, e.into()).await),
            },
        };

        let resolver: Arc<dyn NameResolver> = match collaborators.resolver {
            Some(resolver) => resolver,
            None => match http_resolver(&config) {
                Ok(resolver) => Arc::new(resolver),
                Err(e) => return Err(abort(&background, Some(&queue), None, e).await),
            },
        };

        let discovery = match collaborators.discovery {
            Some(discovery) => Some(discovery),
            None => match http_discovery(&config) {
                Ok(discovery) => discovery,
                Err(e) => return Err(abort(&background, Some(&queue), Some(&resolver), e).await),
            },
        };

        let jobs = JobTable::new();
        let fanout = Arc::new(FanOut::new());
        let runner = Arc::new(JobRunner {
            queue: queue.clone(),
            resolver: resolver.clone(),
            vm,
            cache: cache.clone(),
            fanout: fanout.clone(),
            admission: config
                .max_concurrent_jobs
                .map(|limit| Arc::new(Semaphore::new(limit))),
        });
        let handler = Arc::new(JobHandler {
            jobs: jobs.clone(),
            runner,
            token: token.clone(),
        });

        let subscription = match Subscription::establish(
            queue.clone(),
            config.topic.clone(),
            handler,
            background.child_token(),
            config.retry.clone(),
        )
        .await
        {
            Ok(subscription) => subscription,
            Err(e) => return Err(abort(&background, Some(&queue), Some(&resolver), e.into()).await),
        };

        let stream = match PeerStream::open(
            &node,
            StreamState {
                peer_id: node.peer_id().to_string(),
                jobs: jobs.clone(),
                fanout: fanout.clone(),
                subscription: Some(subscription.watch()),
                observer_buffer: config.observer_buffer,
                shutdown: background.child_token(),
            },
        ) {
            Ok(stream) => stream,
            Err(e) => return Err(abort(&background, Some(&queue), Some(&resolver), e.into()).await),
        };

        match discovery {
            Some(discovery) => tasks.push(start_beacon(
                discovery,
                Beacon::new(node.peer_id(), stream.local_addr().to_string(), config.topic.clone()),
                config.beacon_interval(),
                background.clone(),
            )),
            None => warn!("No discovery service configured, not announcing"),
        }

        info!(
            peer_id = node.peer_id(),
            listen = %stream.local_addr(),
            topic = %config.topic,
            dev = config.dev,
            "Monkey service started"
        );

        Ok(Self {
            background,
            config,
            domain_pattern,
            node,
            stream,
            subscription,
            queue,
            resolver,
            jobs,
            cache,
            fanout,
            tasks,
            closed: AtomicBool::new(false),
        })
    }

    /// Stop the peer stream and background tasks, then close the clients.
    ///
    /// Jobs already running are left to finish; they stop when the root
    /// token is cancelled. Calling this more than once is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing monkey service");

        self.stream.stop();
        self.background.cancel();

        if let Err(e) = self.queue.close().await {
            warn!(error = %e, "Closing job queue client failed");
        }
        self.resolver.close().await;

        self.subscription.closed().await;
        info!(in_flight = self.jobs.len(), "Monkey service closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether `host` is a domain generated by this deployment. Always
    /// false in dev mode.
    pub fn is_generated_domain(&self, host: &str) -> bool {
        match &self.domain_pattern {
            Some(pattern) if !self.config.dev => pattern.is_match(host),
            _ => false,
        }
    }

    pub fn peer_id(&self) -> &str {
        self.node.peer_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.stream.local_addr()
    }

    pub fn jobs(&self) -> &JobTable {
        &self.jobs
    }

    pub fn fanout(&self) -> &Arc<FanOut> {
        &self.fanout
    }

    pub fn cache(&self) -> &Arc<ContextCache> {
        &self.cache
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        self.subscription.state()
    }

    /// Whether every background task has exited.
    pub fn background_finished(&self) -> bool {
        self.tasks.iter().all(|t| t.is_finished())
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.background.cancel();
    }
}

/// Admits decoded jobs into the table and spawns their tasks.
struct JobHandler {
    jobs: JobTable,
    runner: Arc<JobRunner>,
    token: CancellationToken,
}

#[async_trait]
impl MessageHandler for JobHandler {
    async fn handle(&self, payload: Bytes) {
        let job = match JobMessage::decode(&payload) {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, "Dropping job message");
                return;
            }
        };

        let job_token = self.token.child_token();
        let Some(entry) = self
            .jobs
            .try_insert(Monkey::new(job.id.clone(), job_token.clone()))
        else {
            debug!(job_id = %job.id, "Job already in flight, ignoring duplicate");
            return;
        };

        let runner = self.runner.clone();
        tokio::spawn(async move {
            runner.run(entry, job, job_token).await;
        });
    }
}

fn default_vm(config: &Config, token: &CancellationToken) -> Result<Arc<dyn Vm>> {
    let source = Arc::new(DirectorySource::new(config.scripts_dir.clone()));
    let mut vm = RhaiVm::new(source)
        .with_limits(config.sandbox.clone())
        .with_cancellation(token.clone());
    vm.register_all(default_modules())?;
    Ok(Arc::new(vm))
}

fn http_resolver(config: &Config) -> Result<HttpResolver> {
    Ok(HttpResolver::new(config.resolver_url()?, config.http_timeout())?)
}

fn http_discovery(config: &Config) -> Result<Option<Arc<dyn DiscoveryClient>>> {
    match config.discovery_url()? {
        Some(url) => {
            let discovery: Arc<dyn DiscoveryClient> =
                Arc::new(HttpDiscovery::new(url, config.http_timeout())?);
            Ok(Some(discovery))
        }
        None => Ok(None),
    }
}

/// Undo a partial start: stop background tasks and close what was opened.
async fn abort(
    background: &CancellationToken,
    queue: Option<&Arc<dyn JobQueueClient>>,
    resolver: Option<&Arc<dyn NameResolver>>,
    error: ServiceError,
) -> ServiceError {
    warn!(error = %error, "Monkey service failed to start");
    background.cancel();
    if let Some(queue) = queue {
        if let Err(e) = queue.close().await {
            debug!(error = %e, "Closing job queue client failed");
        }
    }
    if let Some(resolver) = resolver {
        resolver.close().await;
    }
    error
}
