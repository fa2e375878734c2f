//! Out-of-band file transfer broker.
//!
//! Each offered file gets a short-lived TCP listener on an ephemeral port.
//! The listener accepts exactly one connection, moves exactly the declared
//! number of bytes, and closes. Uploads land in a temp file and are renamed
//! into the uploads directory only once complete, so an `available` offer
//! always has exactly its declared size on disk.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chat::ChatEngine;
use crate::error::{HubError, HubResult};
use crate::journal::EventJournal;
use crate::protocol::ServerMessage;
use crate::registry::Registry;
use crate::state::TransferConfig;
use crate::utils::sanitize_filename;

/// Attempts to land an OS-assigned port at or above the floor before
/// giving up.
const PORT_BIND_ATTEMPTS: usize = 16;

/// Read/write granularity for transfer I/O.
const IO_CHUNK_BYTES: usize = 64 * 1024;

/// Lifecycle state of a file offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferState {
    /// Waiting for the offerer to connect and upload.
    PendingUpload,
    /// Upload complete; the file is on disk and downloadable.
    Available,
    /// Upload listener hit its deadline with no connection.
    Expired,
    /// Transfer started but ended short, errored, or was cancelled.
    Failed,
}

/// Direction of a transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

/// An offered file and its lifecycle state.
pub struct FileOffer {
    pub fid: Uuid,
    /// Sanitized filename (no directory components).
    pub filename: String,
    /// Declared size in bytes; enforced exactly on upload.
    pub size: u64,
    pub offerer_uid: u32,
    pub offerer_name: String,
    pub created_at: Instant,
    state: parking_lot::Mutex<OfferState>,
    /// Final on-disk path, set when the offer becomes available.
    path: parking_lot::Mutex<Option<PathBuf>>,
}

impl FileOffer {
    pub fn state(&self) -> OfferState {
        *self.state.lock()
    }

    fn set_state(&self, state: OfferState) {
        *self.state.lock() = state;
    }

    /// Marks failed unless the upload already completed.
    fn fail_if_pending(&self) -> bool {
        let mut guard = self.state.lock();
        if *guard == OfferState::PendingUpload {
            *guard = OfferState::Failed;
            true
        } else {
            false
        }
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.path.lock().clone()
    }
}

/// A live ephemeral listener moving one file in one direction.
pub struct TransferSession {
    pub fid: Uuid,
    pub direction: TransferDirection,
    pub port: u16,
    pub deadline: Instant,
    pub owner_uid: u32,
    cancel: CancellationToken,
    accepted: AtomicBool,
    bytes_transferred: AtomicU64,
}

impl TransferSession {
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }
}

/// Allocates ephemeral transfer listeners and tracks offered files.
pub struct FileBroker {
    offers: DashMap<Uuid, Arc<FileOffer>>,
    /// Live sessions indexed by port. The OS guarantees no two live
    /// listeners share a port; this map mirrors that for introspection
    /// and cancellation.
    sessions: DashMap<u16, Arc<TransferSession>>,
    upload_dir: PathBuf,
    bind_host: String,
    config: TransferConfig,
    registry: Arc<Registry>,
    chat: Arc<ChatEngine>,
    journal: Arc<dyn EventJournal>,
    cancel: CancellationToken,
}

impl FileBroker {
    /// Creates the broker and its uploads directory.
    pub async fn new(
        upload_dir: PathBuf,
        bind_host: String,
        config: TransferConfig,
        registry: Arc<Registry>,
        chat: Arc<ChatEngine>,
        journal: Arc<dyn EventJournal>,
        cancel: CancellationToken,
    ) -> HubResult<Arc<Self>> {
        tokio::fs::create_dir_all(&upload_dir).await?;
        Ok(Arc::new(Self {
            offers: DashMap::new(),
            sessions: DashMap::new(),
            upload_dir,
            bind_host,
            config,
            registry,
            chat,
            journal,
            cancel,
        }))
    }

    /// Looks up an offer by fid.
    pub fn offer(&self, fid: Uuid) -> Option<Arc<FileOffer>> {
        self.offers.get(&fid).map(|r| Arc::clone(r.value()))
    }

    /// Number of live transfer sessions.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Registers a new offer and opens its upload listener.
    ///
    /// Returns the ephemeral port the offerer must connect to. A fid may
    /// be reused only after its previous offer expired or failed.
    pub async fn offer_upload(
        self: &Arc<Self>,
        fid: Uuid,
        filename: &str,
        size: u64,
        offerer_uid: u32,
        offerer_name: &str,
    ) -> HubResult<u16> {
        let filename = sanitize_filename(filename).ok_or(HubError::InvalidFilename)?;
        if size > self.config.max_file_bytes {
            return Err(HubError::SizeExceeded(size));
        }
        if let Some(existing) = self.offer(fid) {
            match existing.state() {
                OfferState::Expired | OfferState::Failed => {}
                _ => return Err(HubError::DuplicateOffer(fid)),
            }
        }

        let listener = self.bind_ephemeral().await?;
        let port = listener.local_addr()?.port();
        let offer = Arc::new(FileOffer {
            fid,
            filename,
            size,
            offerer_uid,
            offerer_name: offerer_name.to_string(),
            created_at: Instant::now(),
            state: parking_lot::Mutex::new(OfferState::PendingUpload),
            path: parking_lot::Mutex::new(None),
        });
        self.offers.insert(fid, Arc::clone(&offer));

        let session = self.track_session(fid, TransferDirection::Upload, port, offerer_uid);
        self.journal
            .transfer(fid, &format!("upload listener opened on port {port}"));

        let broker = Arc::clone(self);
        tokio::spawn(async move {
            broker.run_upload(listener, offer, session).await;
        });
        Ok(port)
    }

    /// Opens a download listener for an available offer.
    ///
    /// Concurrent downloads of the same file each get their own listener
    /// and session.
    pub async fn request_download(
        self: &Arc<Self>,
        fid: Uuid,
        requester_uid: u32,
    ) -> HubResult<(u16, String, u64)> {
        let offer = self.offer(fid).ok_or(HubError::UnknownOffer(fid))?;
        if offer.state() != OfferState::Available {
            return Err(HubError::OfferNotAvailable(fid));
        }
        let path = offer
            .path()
            .ok_or_else(|| HubError::Transfer("offer has no stored path".into()))?;

        let listener = self.bind_ephemeral().await?;
        let port = listener.local_addr()?.port();
        let session = self.track_session(fid, TransferDirection::Download, port, requester_uid);
        self.journal
            .transfer(fid, &format!("download listener opened on port {port}"));

        let filename = offer.filename.clone();
        let size = offer.size;
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            broker.run_download(listener, offer, path, session).await;
        });
        Ok((port, filename, size))
    }

    /// Cancels upload listeners owned by a departing session and marks
    /// their offers failed. Called when a control session closes.
    pub fn fail_pending_uploads_for(&self, uid: u32) {
        for entry in self.sessions.iter() {
            let session = entry.value();
            if session.owner_uid == uid && session.direction == TransferDirection::Upload {
                session.cancel.cancel();
            }
        }
        for entry in self.offers.iter() {
            let offer = entry.value();
            if offer.offerer_uid == uid && offer.fail_if_pending() {
                self.journal
                    .transfer(offer.fid, "offer failed: offerer disconnected");
            }
        }
    }

    fn track_session(
        &self,
        fid: Uuid,
        direction: TransferDirection,
        port: u16,
        owner_uid: u32,
    ) -> Arc<TransferSession> {
        let session = Arc::new(TransferSession {
            fid,
            direction,
            port,
            deadline: Instant::now() + self.config.deadline(),
            owner_uid,
            cancel: self.cancel.child_token(),
            accepted: AtomicBool::new(false),
            bytes_transferred: AtomicU64::new(0),
        });
        self.sessions.insert(port, Arc::clone(&session));
        session
    }

    /// Binds a listener on an OS-assigned port, retrying until the port
    /// clears the configured floor.
    async fn bind_ephemeral(&self) -> HubResult<TcpListener> {
        for _ in 0..PORT_BIND_ATTEMPTS {
            let listener = TcpListener::bind((self.bind_host.as_str(), 0)).await?;
            if listener.local_addr()?.port() >= self.config.port_floor {
                return Ok(listener);
            }
        }
        Err(HubError::NoPort)
    }

    async fn run_upload(
        &self,
        listener: TcpListener,
        offer: Arc<FileOffer>,
        session: Arc<TransferSession>,
    ) {
        let temp_path = self
            .upload_dir
            .join(format!(".{}.part", offer.fid.simple()));
        let budget = session.deadline.saturating_duration_since(Instant::now());

        let outcome = tokio::select! {
            _ = session.cancel.cancelled() => Err(HubError::Transfer("cancelled".into())),
            result = timeout(budget, self.receive_upload(&listener, &offer, &session, &temp_path)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(HubError::DeadlineExpired),
                }
            }
        };
        drop(listener);
        self.sessions.remove(&session.port);

        match outcome {
            Ok(final_path) => {
                *offer.path.lock() = Some(final_path);
                offer.set_state(OfferState::Available);
                self.journal.transfer(
                    offer.fid,
                    &format!("upload complete: {} ({} bytes)", offer.filename, offer.size),
                );
                self.chat.fan_out(
                    ServerMessage::FileAvailable {
                        fid: offer.fid,
                        filename: offer.filename.clone(),
                        size: offer.size,
                        offerer_uid: offer.offerer_uid,
                        offerer_username: offer.offerer_name.clone(),
                    },
                    None,
                );
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                // A deadline with no connection is expiry; anything after
                // the peer connected is a failed transfer.
                let expired = matches!(err, HubError::DeadlineExpired)
                    && !session.accepted.load(Ordering::Relaxed);
                let state = if expired {
                    OfferState::Expired
                } else {
                    OfferState::Failed
                };
                if offer.state() == OfferState::PendingUpload {
                    offer.set_state(state);
                }
                self.journal
                    .transfer(offer.fid, &format!("upload ended: {}", err.reason()));
            }
        }
    }

    /// Accepts one connection and reads exactly the declared byte count
    /// into the temp file, then renames it into place.
    async fn receive_upload(
        &self,
        listener: &TcpListener,
        offer: &FileOffer,
        session: &TransferSession,
        temp_path: &Path,
    ) -> HubResult<PathBuf> {
        let (mut stream, peer) = listener.accept().await?;
        session.accepted.store(true, Ordering::Relaxed);
        log::debug!(
            "[Transfer] upload connection for {} from {}",
            offer.fid,
            peer
        );

        let mut file = tokio::fs::File::create(temp_path).await?;
        let mut remaining = offer.size;
        let mut buf = vec![0u8; IO_CHUNK_BYTES];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = stream.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(HubError::Transfer(format!(
                    "short upload: {} of {} bytes",
                    offer.size - remaining,
                    offer.size
                )));
            }
            file.write_all(&buf[..n]).await?;
            remaining -= n as u64;
            session
                .bytes_transferred
                .fetch_add(n as u64, Ordering::Relaxed);
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let final_path = self.resolve_final_path(offer).await;
        tokio::fs::rename(temp_path, &final_path).await?;
        Ok(final_path)
    }

    /// Picks the destination path, appending a fid prefix on collision.
    async fn resolve_final_path(&self, offer: &FileOffer) -> PathBuf {
        let candidate = self.upload_dir.join(&offer.filename);
        if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            let fid_hex = offer.fid.simple().to_string();
            let prefix = &fid_hex[..8];
            let path = std::path::Path::new(&offer.filename);
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(&offer.filename);
            let disambiguated = match path.extension().and_then(|e| e.to_str()) {
                Some(ext) => format!("{stem}-{prefix}.{ext}"),
                None => format!("{stem}-{prefix}"),
            };
            self.upload_dir.join(disambiguated)
        } else {
            candidate
        }
    }

    async fn run_download(
        &self,
        listener: TcpListener,
        offer: Arc<FileOffer>,
        path: PathBuf,
        session: Arc<TransferSession>,
    ) {
        let budget = session.deadline.saturating_duration_since(Instant::now());
        let outcome = tokio::select! {
            _ = session.cancel.cancelled() => Err(HubError::Transfer("cancelled".into())),
            result = timeout(budget, serve_download(&listener, &path, &session)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(HubError::DeadlineExpired),
                }
            }
        };
        drop(listener);
        self.sessions.remove(&session.port);

        match outcome {
            Ok(()) => self.journal.transfer(
                offer.fid,
                &format!("download complete ({} bytes)", offer.size),
            ),
            // The file stays available; only this download attempt died.
            Err(err) => self
                .journal
                .transfer(offer.fid, &format!("download ended: {}", err.reason())),
        }
    }
}

/// Accepts one connection and streams the whole file to it.
async fn serve_download(
    listener: &TcpListener,
    path: &Path,
    session: &TransferSession,
) -> HubResult<()> {
    let (mut stream, _) = listener.accept().await?;
    session.accepted.store(true, Ordering::Relaxed);
    let mut file = tokio::fs::File::open(path).await?;
    let sent = copy_counted(&mut file, &mut stream, session).await?;
    stream.shutdown().await?;
    log::debug!("[Transfer] served {} bytes from {}", sent, path.display());
    Ok(())
}

async fn copy_counted(
    file: &mut tokio::fs::File,
    stream: &mut TcpStream,
    session: &TransferSession,
) -> HubResult<u64> {
    let mut buf = vec![0u8; IO_CHUNK_BYTES];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        stream.write_all(&buf[..n]).await?;
        total += n as u64;
        session
            .bytes_transferred
            .fetch_add(n as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::NoopJournal;
    use std::time::Duration;

    async fn broker_with(deadline_secs: u64) -> (Arc<FileBroker>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::new());
        let chat = Arc::new(ChatEngine::new(Arc::clone(&registry), Arc::new(NoopJournal)));
        let config = TransferConfig {
            deadline_secs,
            ..Default::default()
        };
        let broker = FileBroker::new(
            dir.path().to_path_buf(),
            "127.0.0.1".to_string(),
            config,
            registry,
            chat,
            Arc::new(NoopJournal),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        (broker, dir)
    }

    async fn wait_for_state(offer: &FileOffer, want: OfferState) {
        for _ in 0..200 {
            if offer.state() == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("offer never reached {want:?}, stuck at {:?}", offer.state());
    }

    #[tokio::test]
    async fn upload_then_download_round_trip() {
        let (broker, _dir) = broker_with(30).await;
        let fid = Uuid::new_v4();
        let payload: Vec<u8> = (0..65_537u32).map(|i| (i % 251) as u8).collect();

        let port = broker
            .offer_upload(fid, "blob.bin", payload.len() as u64, 1, "alice")
            .await
            .unwrap();
        let mut up = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        up.write_all(&payload).await.unwrap();
        up.shutdown().await.unwrap();
        drop(up);

        let offer = broker.offer(fid).unwrap();
        wait_for_state(&offer, OfferState::Available).await;

        // Size on disk equals the declared size.
        let on_disk = tokio::fs::metadata(offer.path().unwrap()).await.unwrap();
        assert_eq!(on_disk.len(), payload.len() as u64);

        let (dl_port, filename, size) = broker.request_download(fid, 2).await.unwrap();
        assert_eq!(filename, "blob.bin");
        assert_eq!(size, payload.len() as u64);

        let mut down = TcpStream::connect(("127.0.0.1", dl_port)).await.unwrap();
        let mut received = Vec::new();
        down.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn oversize_offer_rejected_without_listener() {
        let (broker, _dir) = broker_with(30).await;
        let err = broker
            .offer_upload(Uuid::new_v4(), "big.bin", 104_857_601, 1, "alice")
            .await
            .unwrap_err();
        assert!(err.reason().contains("size"));
        assert_eq!(broker.active_sessions(), 0);
    }

    #[tokio::test]
    async fn path_traversal_filename_is_stripped() {
        let (broker, dir) = broker_with(30).await;
        let fid = Uuid::new_v4();
        let port = broker
            .offer_upload(fid, "../../escape.txt", 4, 1, "alice")
            .await
            .unwrap();
        let mut up = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        up.write_all(b"data").await.unwrap();
        drop(up);

        let offer = broker.offer(fid).unwrap();
        wait_for_state(&offer, OfferState::Available).await;
        assert_eq!(offer.filename, "escape.txt");
        assert!(offer.path().unwrap().starts_with(dir.path()));
    }

    #[tokio::test]
    async fn bare_separator_filename_rejected() {
        let (broker, _dir) = broker_with(30).await;
        let err = broker
            .offer_upload(Uuid::new_v4(), "uploads/", 4, 1, "alice")
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "invalid filename");
    }

    #[tokio::test]
    async fn duplicate_fid_rejected_while_pending() {
        let (broker, _dir) = broker_with(30).await;
        let fid = Uuid::new_v4();
        broker
            .offer_upload(fid, "a.txt", 10, 1, "alice")
            .await
            .unwrap();
        let err = broker
            .offer_upload(fid, "b.txt", 10, 1, "alice")
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "duplicate fid");
    }

    #[tokio::test]
    async fn concurrent_offers_get_distinct_ports() {
        let (broker, _dir) = broker_with(30).await;
        let p1 = broker
            .offer_upload(Uuid::new_v4(), "a.txt", 10, 1, "alice")
            .await
            .unwrap();
        let p2 = broker
            .offer_upload(Uuid::new_v4(), "b.txt", 10, 1, "alice")
            .await
            .unwrap();
        assert_ne!(p1, p2);
        assert!(p1 >= 10_000 && p2 >= 10_000);
    }

    #[tokio::test]
    async fn short_upload_marks_offer_failed_and_removes_temp() {
        let (broker, dir) = broker_with(30).await;
        let fid = Uuid::new_v4();
        let port = broker
            .offer_upload(fid, "short.bin", 10, 1, "alice")
            .await
            .unwrap();
        let mut up = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        up.write_all(b"1234").await.unwrap();
        up.shutdown().await.unwrap();
        drop(up);

        let offer = broker.offer(fid).unwrap();
        wait_for_state(&offer, OfferState::Failed).await;
        let temp = dir.path().join(format!(".{}.part", fid.simple()));
        assert!(!temp.exists());
        assert!(broker.request_download(fid, 2).await.is_err());
    }

    #[tokio::test]
    async fn unconnected_offer_expires_at_deadline() {
        let (broker, _dir) = broker_with(1).await;
        let fid = Uuid::new_v4();
        broker
            .offer_upload(fid, "never.bin", 10, 1, "alice")
            .await
            .unwrap();
        let offer = broker.offer(fid).unwrap();
        wait_for_state(&offer, OfferState::Expired).await;
        let err = broker.request_download(fid, 2).await.unwrap_err();
        assert_eq!(err.reason(), "file not available");
        assert_eq!(broker.active_sessions(), 0);
    }

    #[tokio::test]
    async fn download_of_unknown_fid_fails() {
        let (broker, _dir) = broker_with(30).await;
        let err = broker.request_download(Uuid::new_v4(), 2).await.unwrap_err();
        assert_eq!(err.reason(), "unknown fid");
    }

    #[tokio::test]
    async fn disconnecting_offerer_fails_pending_upload() {
        let (broker, _dir) = broker_with(30).await;
        let fid = Uuid::new_v4();
        broker
            .offer_upload(fid, "gone.bin", 10, 7, "ghost")
            .await
            .unwrap();
        broker.fail_pending_uploads_for(7);
        let offer = broker.offer(fid).unwrap();
        wait_for_state(&offer, OfferState::Failed).await;
    }

    #[tokio::test]
    async fn filename_collision_gets_fid_suffix() {
        let (broker, _dir) = broker_with(30).await;

        for fid in [Uuid::new_v4(), Uuid::new_v4()] {
            let port = broker
                .offer_upload(fid, "same.txt", 3, 1, "alice")
                .await
                .unwrap();
            let mut up = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            up.write_all(b"abc").await.unwrap();
            drop(up);
            wait_for_state(&broker.offer(fid).unwrap(), OfferState::Available).await;
        }

        let paths: Vec<PathBuf> = broker
            .offers
            .iter()
            .map(|r| r.value().path().unwrap())
            .collect();
        assert_ne!(paths[0], paths[1]);
        for p in &paths {
            assert!(p.exists());
        }
    }
}
