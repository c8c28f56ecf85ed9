//! Export generation registry
//!
//! An [`ExportGeneration`] owns the export sources of every table-partition
//! for one catalog generation on this host. It routes engine pushes, sink
//! acknowledgements and replica `RELEASE_BUFFER` messages to the right
//! source, and keeps the replica list of each partition.
//!
//! Pushes are throttled by a semaphore: a push waits for a permit before it
//! is queued, and the permit travels with the queued work until the source
//! has buffered the block. A slow executor therefore pushes back on the
//! engine instead of accumulating closures without bound.

use crate::config::ExportConfig;
use crate::control::ControlOperation;
use crate::error::{ExportError, Result};
use crate::sink::{ExportSink, SinkDriver};
use crate::source::{PollResult, SourceDescriptor, SourceHandle, SourceStats};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use spillway_cluster::{
    AckHandler, AckTransport, CoordinationProvider, HostId, PartitionId, ReleaseBufferMessage,
};
use spillway_core::{
    BlockBuffer, ExecutorPool, ExportMetrics, FileBlockBuffer, MemoryBlockBuffer,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

type SourceKey = (PartitionId, String);

/// Export sources of one catalog generation
pub struct ExportGeneration {
    generation: u64,
    config: ExportConfig,
    pool: Arc<ExecutorPool>,
    provider: Option<Arc<dyn CoordinationProvider>>,
    transport: Option<Arc<dyn AckTransport>>,
    sources: DashMap<SourceKey, SourceHandle>,
    replicas: RwLock<HashMap<PartitionId, Vec<HostId>>>,
    push_permits: Arc<Semaphore>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ExportGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportGeneration")
            .field("generation", &self.generation)
            .field("host", &self.config.host_id)
            .field("sources", &self.sources.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl ExportGeneration {
    /// `provider` coordinates mastership of non-replicated tables and
    /// `transport` carries acknowledgements to the other replicas. Either
    /// may be absent on a single-host deployment.
    pub fn new(
        generation: u64,
        config: ExportConfig,
        pool: Arc<ExecutorPool>,
        provider: Option<Arc<dyn CoordinationProvider>>,
        transport: Option<Arc<dyn AckTransport>>,
    ) -> Result<Self> {
        config.validate()?;
        let permits = config.max_inflight_pushes;
        Ok(Self {
            generation,
            config,
            pool,
            provider,
            transport,
            sources: DashMap::new(),
            replicas: RwLock::new(HashMap::new()),
            push_permits: Arc::new(Semaphore::new(permits)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn host_id(&self) -> HostId {
        self.config.host_id
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ExportError::ShuttingDown);
        }
        Ok(())
    }

    fn open_buffer(&self, partition: PartitionId, signature: &str) -> Result<Box<dyn BlockBuffer>> {
        Ok(match &self.config.data_dir {
            Some(dir) => Box::new(FileBlockBuffer::open(
                dir.join(format!("{}-{}", signature, partition)),
                self.config.sync_writes,
            )?),
            None => Box::new(MemoryBlockBuffer::new()),
        })
    }

    /// Open the source of one table-partition, recovering its durable
    /// buffer if one exists
    pub async fn create_source(
        &self,
        partition: PartitionId,
        signature: &str,
        replicated: bool,
    ) -> Result<SourceHandle> {
        self.check_open()?;
        let key = (partition, signature.to_string());
        if self.sources.contains_key(&key) {
            return Err(ExportError::SourceExists {
                partition,
                signature: signature.to_string(),
            });
        }

        let descriptor = SourceDescriptor {
            partition,
            signature: signature.to_string(),
            generation: self.generation,
            host: self.config.host_id,
            replicated,
            replicas: self.replicas_of(partition),
            auto_release: self.config.auto_release_gaps,
        };
        let buffer = self.open_buffer(partition, signature)?;
        let handle = SourceHandle::open(
            &self.pool,
            descriptor,
            buffer,
            self.provider.clone(),
            self.transport.clone(),
        )
        .await?;

        let raced = match self.sources.entry(key) {
            Entry::Occupied(_) => true,
            Entry::Vacant(vacant) => {
                vacant.insert(handle.clone());
                false
            }
        };
        if raced {
            let _ = handle.shutdown().await;
            return Err(ExportError::SourceExists {
                partition,
                signature: signature.to_string(),
            });
        }

        info!(
            generation = self.generation,
            partition,
            signature,
            replicated,
            "Created export source"
        );
        Ok(handle)
    }

    pub fn source(&self, partition: PartitionId, signature: &str) -> Option<SourceHandle> {
        self.sources
            .get(&(partition, signature.to_string()))
            .map(|entry| entry.value().clone())
    }

    fn lookup(&self, partition: PartitionId, signature: &str) -> Result<SourceHandle> {
        self.source(partition, signature)
            .ok_or_else(|| ExportError::unknown_source(partition, signature))
    }

    fn sources_where(&self, predicate: impl Fn(&SourceKey) -> bool) -> Vec<SourceHandle> {
        self.sources
            .iter()
            .filter(|entry| predicate(entry.key()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Queue a block from the engine, waiting while too many pushes are
    /// already queued
    #[allow(clippy::too_many_arguments)]
    pub async fn push(
        &self,
        partition: PartitionId,
        signature: &str,
        start_seq: u64,
        committed_seq: u64,
        row_count: u32,
        unique_id: u64,
        data: Bytes,
    ) -> Result<()> {
        self.check_open()?;
        let handle = self.lookup(partition, signature)?;
        let permit = self
            .push_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ExportError::ShuttingDown)?;
        handle.submit(move |source| {
            let _permit = permit;
            source.push(start_seq, committed_seq, row_count, unique_id, data);
        })
    }

    /// Push permits currently free
    pub fn available_push_permits(&self) -> usize {
        self.push_permits.available_permits()
    }

    pub async fn poll(&self, partition: PartitionId, signature: &str) -> Result<PollResult> {
        self.lookup(partition, signature)?.poll().await
    }

    pub fn ack(
        &self,
        partition: PartitionId,
        signature: &str,
        committed_seq: u64,
        release_seq: u64,
    ) -> Result<()> {
        self.lookup(partition, signature)?
            .ack(committed_seq, release_seq)
    }

    /// Driver feeding `sink` from one source, retrying with the configured
    /// backoff
    pub fn sink_driver<S: ExportSink + 'static>(
        &self,
        partition: PartitionId,
        signature: &str,
        sink: S,
    ) -> Result<SinkDriver<S>> {
        let handle = self.lookup(partition, signature)?;
        Ok(SinkDriver::new(handle, sink)
            .with_retry_backoff(Duration::from_millis(self.config.sink_retry_backoff_ms)))
    }

    /// Apply a `RELEASE_BUFFER` message received from replica `from`.
    ///
    /// Messages for sources this host does not have are ignored.
    pub fn on_ack_message(&self, from: HostId, message: &[u8]) -> Result<()> {
        let message = ReleaseBufferMessage::decode(message)?;
        match self.source(message.partition, &message.signature) {
            Some(handle) => match handle.remote_ack(from, message) {
                Err(ExportError::ShuttingDown) => Ok(()),
                other => other,
            },
            None => {
                debug!(
                    from,
                    partition = message.partition,
                    signature = %message.signature,
                    "Ack for an unknown export source"
                );
                Ok(())
            }
        }
    }

    /// Handler to register with the ack transport for this host
    pub fn ack_handler(self: &Arc<Self>) -> AckHandler {
        let registry = Arc::downgrade(self);
        Arc::new(move |from, message: Bytes| {
            if let Some(registry) = registry.upgrade() {
                if let Err(e) = registry.on_ack_message(from, &message) {
                    warn!(from, error = %e, "Dropping undeliverable ack");
                }
            }
        })
    }

    fn replicas_of(&self, partition: PartitionId) -> Vec<HostId> {
        self.replicas
            .read()
            .get(&partition)
            .cloned()
            .unwrap_or_default()
    }

    /// Replace the replica list of `partition` for current and future
    /// sources
    pub async fn update_replicas(&self, partition: PartitionId, hosts: Vec<HostId>) -> Result<()> {
        self.replicas.write().insert(partition, hosts.clone());
        for handle in self.sources_where(|(p, _)| *p == partition) {
            handle.update_replicas(hosts.clone()).await?;
        }
        Ok(())
    }

    /// This host became the partition's master: every table of the
    /// partition proposes the local host as export leader.
    pub fn accept_mastership(&self, partition: PartitionId) -> Result<usize> {
        let handles = self.sources_where(|(p, _)| *p == partition);
        for handle in &handles {
            handle.become_leader()?;
        }
        info!(
            generation = self.generation,
            partition,
            sources = handles.len(),
            "Accepted export mastership"
        );
        Ok(handles.len())
    }

    /// Take a table out of the catalog. Its sources drain what they hold,
    /// then answer polls with end of stream.
    pub async fn drop_table(&self, signature: &str) -> Result<usize> {
        let handles = self.sources_where(|(_, s)| s == signature);
        for handle in &handles {
            handle.set_in_catalog(false).await?;
        }
        info!(generation = self.generation, signature, sources = handles.len(), "Dropped export table");
        Ok(handles.len())
    }

    /// Run an operator control operation. Returns whether it applied.
    pub async fn control(
        &self,
        partition: PartitionId,
        signature: &str,
        operation: ControlOperation,
    ) -> Result<bool> {
        let handle = self.lookup(partition, signature)?;
        let applied = match operation {
            ControlOperation::Release => handle.release().await?,
        };
        info!(partition, signature, %operation, applied, "Export control operation");
        Ok(applied)
    }

    /// Shut one source down and forget it
    pub async fn remove_source(&self, partition: PartitionId, signature: &str) -> Result<SourceStats> {
        let (_, handle) = self
            .sources
            .remove(&(partition, signature.to_string()))
            .ok_or_else(|| ExportError::unknown_source(partition, signature))?;
        handle.shutdown().await
    }

    pub async fn stats(&self) -> Vec<SourceStats> {
        let mut stats = Vec::with_capacity(self.sources.len());
        for handle in self.sources_where(|_| true) {
            if let Ok(s) = handle.stats().await {
                stats.push(s);
            }
        }
        stats.sort_by(|a, b| (a.partition, &a.signature).cmp(&(b.partition, &b.signature)));
        ExportMetrics::set_master_sources(stats.iter().filter(|s| s.is_master).count());
        stats
    }

    /// Stop every source. Pushes waiting for a permit fail with
    /// [`ExportError::ShuttingDown`].
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.push_permits.close();
        let handles = self.sources_where(|_| true);
        self.sources.clear();
        for handle in handles {
            if let Err(e) = handle.shutdown().await {
                debug!(partition = handle.partition(), error = %e, "Source already stopped");
            }
        }
        info!(generation = self.generation, "Export generation shut down");
    }
}
