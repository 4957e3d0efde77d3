//! Client session façade: connection wiring, file-lease bookkeeping handed
//! to the external lease renewer, and the thin pass-through operations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{info, warn};

use blockfs_net::Connector;

use crate::checksum::{self, FileChecksum};
use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::namenode::{DatanodeAdmin, FileStatus, Namenode};
use crate::queue::StreamShared;
use crate::reader::FileReader;
use crate::writer::FileWriter;

/// Shared context handed to every stream opened by one session.
pub(crate) struct SessionCtx {
    pub namenode: Arc<dyn Namenode>,
    pub datanodes: Arc<dyn DatanodeAdmin>,
    pub connector: Arc<dyn Connector>,
    pub config: ClientConfig,
    pub client_name: String,
    running: AtomicBool,
    /// Paths currently open for write by this session. One lock guards the
    /// whole map; a file can only be written by a single client.
    files_being_written: Mutex<HashMap<String, Arc<StreamShared>>>,
}

impl SessionCtx {
    pub fn check_open(&self) -> ClientResult<()> {
        if !self.is_running() {
            return Err(ClientError::NotRunning);
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn begin_file_lease(&self, path: &str, shared: Arc<StreamShared>) {
        self.files_being_written
            .lock()
            .insert(path.to_string(), shared);
    }

    pub fn end_file_lease(&self, path: &str) {
        self.files_being_written.lock().remove(path);
    }

    #[cfg(test)]
    pub fn has_file_lease(&self, path: &str) -> bool {
        self.files_being_written.lock().contains_key(path)
    }
}

/// A session against one filesystem: the entry point for opening readers
/// and writers and for the metadata pass-through operations.
pub struct Client {
    ctx: Arc<SessionCtx>,
}

impl Client {
    pub fn new(
        namenode: Arc<dyn Namenode>,
        datanodes: Arc<dyn DatanodeAdmin>,
        connector: Arc<dyn Connector>,
        config: ClientConfig,
    ) -> Self {
        let client_name = format!("blockfs-client-{:08x}", rand::thread_rng().gen::<u32>());
        info!(%client_name, "session opened");
        Self {
            ctx: Arc::new(SessionCtx {
                namenode,
                datanodes,
                connector,
                config,
                client_name,
                running: AtomicBool::new(true),
                files_being_written: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn client_name(&self) -> &str {
        &self.ctx.client_name
    }

    #[cfg(test)]
    pub(crate) fn ctx(&self) -> Arc<SessionCtx> {
        Arc::clone(&self.ctx)
    }

    /// Open `path` for reading.
    pub async fn open(&self, path: &str) -> ClientResult<FileReader> {
        FileReader::open(Arc::clone(&self.ctx), path).await
    }

    /// Create `path` and open it for writing.
    pub async fn create(&self, path: &str, overwrite: bool) -> ClientResult<FileWriter> {
        FileWriter::create(Arc::clone(&self.ctx), path, overwrite).await
    }

    /// Reopen an existing `path` for append.
    pub async fn append(&self, path: &str) -> ClientResult<FileWriter> {
        FileWriter::append(Arc::clone(&self.ctx), path).await
    }

    pub async fn rename(&self, src: &str, dst: &str) -> ClientResult<bool> {
        self.ctx.check_open()?;
        self.ctx.namenode.rename(src, dst).await
    }

    pub async fn delete(&self, path: &str, recursive: bool) -> ClientResult<bool> {
        self.ctx.check_open()?;
        self.ctx.namenode.delete(path, recursive).await
    }

    pub async fn mkdirs(&self, path: &str) -> ClientResult<bool> {
        self.ctx.check_open()?;
        self.ctx.namenode.mkdirs(path).await
    }

    pub async fn set_replication(&self, path: &str, replication: u32) -> ClientResult<bool> {
        self.ctx.check_open()?;
        self.ctx.namenode.set_replication(path, replication).await
    }

    pub async fn file_info(&self, path: &str) -> ClientResult<Option<FileStatus>> {
        self.ctx.check_open()?;
        self.ctx.namenode.file_info(path).await
    }

    pub async fn exists(&self, path: &str) -> ClientResult<bool> {
        Ok(self.file_info(path).await?.is_some())
    }

    /// Replication factor of `path` as known by the metadata service.
    pub async fn replication(&self, path: &str) -> ClientResult<u32> {
        match self.file_info(path).await? {
            Some(status) => Ok(status.replication),
            None => Err(ClientError::NotFound(path.to_string())),
        }
    }

    /// Whole-file checksum, recomputed by contacting each block's replicas.
    pub async fn file_checksum(&self, path: &str) -> ClientResult<FileChecksum> {
        self.ctx.check_open()?;
        checksum::file_checksum(&self.ctx, path).await
    }

    /// Lease-renewal hook for the external renewer. Renews only when the
    /// session is live and has files open for write at the time of the
    /// check; a racing close costs at most one spurious renewal, which the
    /// renewer tolerates.
    pub async fn renew_lease(&self) -> ClientResult<bool> {
        if self.ctx.is_running() && !self.ctx.files_being_written.lock().is_empty() {
            self.ctx
                .namenode
                .renew_lease(&self.ctx.client_name)
                .await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn shutdown_streams(&self, err: ClientError) {
        let drained: Vec<(String, Arc<StreamShared>)> =
            self.ctx.files_being_written.lock().drain().collect();
        for (path, shared) in drained {
            warn!(%path, "forcing open write stream shut");
            let err = err.clone();
            shared
                .mutate(|st| {
                    st.set_error_once(err);
                    st.closed = true;
                })
                .await;
        }
    }

    /// Close the session. Writers still open are forced shut with a stored
    /// error (close them individually first for a clean completion).
    pub async fn close(&self) -> ClientResult<()> {
        if self.ctx.running.swap(false, Ordering::AcqRel) {
            self.shutdown_streams(ClientError::NotRunning).await;
        }
        Ok(())
    }

    /// Abort the session: every open write stream observes a lease-expiry
    /// error and stops. Used by lease-timeout handling.
    pub async fn abort(&self) {
        if self.ctx.running.swap(false, Ordering::AcqRel) {
            self.shutdown_streams(ClientError::LeaseExpired(
                "client aborted, lease given up".into(),
            ))
            .await;
        }
    }
}
