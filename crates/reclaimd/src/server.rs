//! Single-threaded upcall dispatcher and event loop.
//!
//! One task owns the framed upcall channel. Each request is decoded,
//! handled to completion, and replied to before the next one is read, so
//! replies leave the channel in arrival order without any queue. Grace-start
//! iteration (streaming the reclaim set back to the kernel) happens inline
//! for the same reason: it must finish before the next request is read.
//!
//! Shutdown is cooperative: `SIGTERM`/`SIGINT` stop the loop at the next
//! iteration, the in-flight handler (at most one) finishes first, and the
//! store closes when the server is dropped. `SIGHUP` is ignored. EOF on the
//! channel means the kernel side went away; the daemon logs it and exits
//! cleanly, leaving restart policy to the service manager.

use std::future::Future;
use std::io;
use std::path::Path;

use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use nix::errno::Errno;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::epoch::EpochManager;
use crate::protocol::messages::{errno_status, negotiate_version, STATUS_OK};
use crate::protocol::{
    ClientId, ProtocolError, RawFrame, Reply, ReplyBody, Upcall, UpcallCmd, UpcallCodec,
    UpcallOp, UPCALL_VERSION_MAX, UPCALL_VERSION_MIN,
};
use crate::store::{CheckOutcome, StoreError};

/// Transaction id used for unsolicited downcalls (startup replay).
const REPLAY_XID: u32 = 0;

/// Opens the kernel upcall channel read/write.
///
/// # Errors
///
/// Propagates the underlying `open(2)` failure.
pub fn open_upcall_pipe(path: &Path) -> io::Result<tokio::fs::File> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)?;
    Ok(tokio::fs::File::from_std(file))
}

/// Unix signal sources driving graceful shutdown.
#[derive(Debug)]
pub struct Signals {
    term: Signal,
    int: Signal,
    hup: Signal,
}

impl Signals {
    /// Installs the handlers. `SIGPIPE` needs no handler: the Rust runtime
    /// already ignores it, so channel errors surface as write results.
    ///
    /// # Errors
    ///
    /// Propagates signal registration failures.
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
            hup: signal(SignalKind::hangup())?,
        })
    }

    /// Resolves when a shutdown signal arrives. `SIGHUP` is swallowed here
    /// so it can never terminate the daemon.
    pub async fn shutdown(&mut self) {
        loop {
            tokio::select! {
                _ = self.term.recv() => {
                    info!("SIGTERM received");
                    return;
                }
                _ = self.int.recv() => {
                    info!("SIGINT received");
                    return;
                }
                _ = self.hup.recv() => debug!("ignoring SIGHUP"),
            }
        }
    }
}

/// Maps a store failure onto the wire status the kernel expects.
fn store_status(err: &StoreError) -> i16 {
    match err {
        StoreError::NotInGrace | StoreError::InvalidClient { .. } => errno_status(Errno::EINVAL),
        _ => errno_status(Errno::EIO),
    }
}

/// The upcall server: framed channel on one side, epoch manager on the
/// other. Generic over the transport so tests can drive it over an
/// in-memory duplex stream.
#[derive(Debug)]
pub struct UpcallServer<T> {
    framed: Framed<T, UpcallCodec>,
    clients: EpochManager,
    version: u8,
}

impl<T: AsyncRead + AsyncWrite + Unpin> UpcallServer<T> {
    /// Wraps a transport and an opened epoch manager.
    pub fn new(transport: T, clients: EpochManager) -> Self {
        Self {
            framed: Framed::new(transport, UpcallCodec::new()),
            clients,
            version: UPCALL_VERSION_MIN,
        }
    }

    /// Runs the event loop until shutdown is requested, the kernel closes
    /// the channel, or a fatal error occurs.
    ///
    /// # Errors
    ///
    /// Returns an error on a failed reply write or a failed version
    /// negotiation (the daemon fails closed).
    pub async fn run<S>(mut self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        // A restart while a grace period was in force: the kernel needs the
        // reclaim set again before it can answer reclaims.
        if self.clients.in_grace() {
            info!(
                recovery = self.clients.recovery_epoch(),
                "grace period was in force at startup, replaying reclaim set"
            );
            self.stream_recovery(REPLAY_XID).await?;
        }

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("shutting down");
                    break;
                }
                frame = self.framed.next() => match frame {
                    None => {
                        info!("upcall channel closed by kernel, exiting");
                        break;
                    }
                    Some(Err(err)) => {
                        // A frame with an impossible length prefix cannot be
                        // skipped on a byte stream; the channel is lost.
                        error!(%err, "upcall channel unusable");
                        break;
                    }
                    Some(Ok(frame)) => self.handle_frame(frame).await?,
                },
            }
        }
        Ok(())
    }

    async fn handle_frame(&mut self, frame: RawFrame) -> Result<()> {
        let upcall = match Upcall::parse(&frame) {
            Ok(upcall) => upcall,
            Err(err @ ProtocolError::UnknownCommand { .. }) => {
                warn!(%err, xid = frame.xid, "rejecting upcall");
                return self
                    .send_raw_status(frame.command, frame.xid, errno_status(Errno::EOPNOTSUPP))
                    .await;
            }
            Err(err) => {
                warn!(%err, xid = frame.xid, command = frame.command, "malformed upcall");
                return self
                    .send_raw_status(frame.command, frame.xid, errno_status(Errno::EINVAL))
                    .await;
            }
        };

        match upcall.op {
            UpcallOp::Init { peer_max } => self.handle_init(upcall.xid, peer_max).await,
            UpcallOp::Create { id } => {
                let status = match self.clients.insert_client(id.as_bytes()) {
                    Ok(()) => STATUS_OK,
                    Err(err) => {
                        error!(%err, "create upcall failed");
                        store_status(&err)
                    }
                };
                self.send_status(UpcallCmd::Create, upcall.xid, status).await
            }
            UpcallOp::Remove { id } => {
                let status = match self.clients.remove_client(id.as_bytes()) {
                    Ok(()) => STATUS_OK,
                    Err(err) => {
                        error!(%err, "remove upcall failed");
                        store_status(&err)
                    }
                };
                self.send_status(UpcallCmd::Remove, upcall.xid, status).await
            }
            UpcallOp::Check { id } => {
                let status = match self.clients.check_client(id.as_bytes()) {
                    Ok(CheckOutcome::Allowed) => STATUS_OK,
                    Ok(CheckOutcome::Denied) => errno_status(Errno::EACCES),
                    Err(err) => {
                        error!(%err, "check upcall failed");
                        store_status(&err)
                    }
                };
                self.send_status(UpcallCmd::Check, upcall.xid, status).await
            }
            UpcallOp::GraceStart => self.handle_grace_start(upcall.xid).await,
            UpcallOp::GraceDone => {
                let status = match self.clients.grace_done() {
                    Ok(()) => STATUS_OK,
                    Err(err) => {
                        warn!(%err, "grace-done upcall failed");
                        store_status(&err)
                    }
                };
                self.send_status(UpcallCmd::GraceDone, upcall.xid, status).await
            }
            UpcallOp::HasSession => {
                self.send_reply(Reply {
                    version: self.version,
                    cmd: UpcallCmd::HasSession,
                    xid: upcall.xid,
                    status: STATUS_OK,
                    body: ReplyBody::Flag(self.clients.has_state()),
                })
                .await
            }
        }
    }

    async fn handle_init(&mut self, xid: u32, peer_max: u8) -> Result<()> {
        match negotiate_version(peer_max) {
            Some(version) => {
                self.version = version;
                info!(kernel = peer_max, agreed = version, "upcall protocol version negotiated");
                self.send_reply(Reply {
                    version,
                    cmd: UpcallCmd::Init,
                    xid,
                    status: STATUS_OK,
                    body: ReplyBody::Version(version),
                })
                .await
            }
            None => {
                self.send_status(UpcallCmd::Init, xid, errno_status(Errno::EINVAL))
                    .await?;
                bail!(
                    "no common upcall protocol version: kernel speaks up to {peer_max}, \
                     daemon supports {UPCALL_VERSION_MIN}..={UPCALL_VERSION_MAX}"
                );
            }
        }
    }

    /// Starts the grace period and streams the reclaim set. The terminating
    /// reply carries the final status, so a failed `grace_start` produces a
    /// single error reply and no entries.
    async fn handle_grace_start(&mut self, xid: u32) -> Result<()> {
        if let Err(err) = self.clients.grace_start() {
            error!(%err, "grace-start upcall failed");
            return self
                .send_status(UpcallCmd::GraceStart, xid, store_status(&err))
                .await;
        }
        self.stream_recovery(xid).await
    }

    /// Sends one downcall per identity in the recovery bucket, then the
    /// terminator. Entries carry the in-progress status; the terminator
    /// carries the overall result.
    async fn stream_recovery(&mut self, xid: u32) -> Result<()> {
        let mut ids: Vec<Vec<u8>> = Vec::new();
        match self.clients.iterate_recovery(|id| ids.push(id.to_vec())) {
            Ok(count) => {
                debug!(count, "streaming reclaim set to kernel");
                for bytes in ids {
                    match ClientId::new(bytes) {
                        Ok(id) => {
                            self.send_reply(Reply {
                                version: self.version,
                                cmd: UpcallCmd::GraceStart,
                                xid,
                                status: errno_status(Errno::EINPROGRESS),
                                body: ReplyBody::ClientId(id),
                            })
                            .await?;
                        }
                        Err(err) => warn!(%err, "skipping unstreamable client record"),
                    }
                }
                self.send_status(UpcallCmd::GraceStart, xid, STATUS_OK).await
            }
            Err(err) => {
                error!(%err, "recovery iteration failed");
                self.send_status(UpcallCmd::GraceStart, xid, store_status(&err))
                    .await
            }
        }
    }

    async fn send_status(&mut self, cmd: UpcallCmd, xid: u32, status: i16) -> Result<()> {
        self.send_reply(Reply::status(self.version, cmd, xid, status))
            .await
    }

    /// Status reply echoing a raw command byte; used when the command did
    /// not decode to a known variant.
    async fn send_raw_status(&mut self, command: u8, xid: u32, status: i16) -> Result<()> {
        let frame = RawFrame {
            version: self.version,
            command,
            status,
            xid,
            payload: bytes::Bytes::new(),
        };
        self.framed
            .send(frame)
            .await
            .context("failed to write reply to upcall channel")
    }

    async fn send_reply(&mut self, reply: Reply) -> Result<()> {
        self.framed
            .send(reply.into_frame())
            .await
            .context("failed to write reply to upcall channel")
    }
}
