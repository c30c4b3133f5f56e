use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::Configuration;
use crate::error::{EngineError, EngineResult};
use crate::vbucket::Vbid;

use super::handlers::{HandlerOutcome, PendingHandler, ResponseHandlerList};
use super::protocol::{self, STATUS_ETMPFAIL, STATUS_SUCCESS};

/// Weak collaborator the notifier reports command outcomes to, in place of
/// a back-pointer to the whole engine.
pub trait NotifierStatsSink: Send + Sync {
    fn record(&self, opcode: u8, success: bool);
}

pub struct NoopStatsSink;
impl NotifierStatsSink for NoopStatsSink {
    fn record(&self, _opcode: u8, _success: bool) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Success,
    ETmpfail,
}

enum WaitResult {
    Resolved(HandlerOutcome),
    Reset,
}

/// True once this process has been reparented to init, the traditional
/// Unix signal that whatever spawned it is gone.
#[cfg(unix)]
fn parent_is_dead() -> bool {
    unsafe { libc::getppid() == 1 }
}

#[cfg(not(unix))]
fn parent_is_dead() -> bool {
    false
}

struct Inner {
    stream: Option<TcpStream>,
    handlers: ResponseHandlerList,
    next_seqno: u32,
    needs_select_bucket: bool,
    read_buf: Vec<u8>,
}

/// Single persistent connection to the compaction manager, carrying the
/// sequenced binary-protocol exchange described in `notifier::protocol`.
/// All socket, handler-list, and buffer state lives behind one mutex; only
/// one thread is ever inside a command at a time.
pub struct CouchNotifier {
    config: Arc<Configuration>,
    stats: Arc<dyn NotifierStatsSink>,
    inner: Mutex<Inner>,
    shutdown: AtomicBool,
}

impl CouchNotifier {
    pub fn new(config: Arc<Configuration>) -> Self {
        Self::with_stats_sink(config, Arc::new(NoopStatsSink))
    }

    pub fn with_stats_sink(config: Arc<Configuration>, stats: Arc<dyn NotifierStatsSink>) -> Self {
        Self {
            config,
            stats,
            inner: Mutex::new(Inner {
                stream: None,
                handlers: ResponseHandlerList::default(),
                next_seqno: 0,
                needs_select_bucket: true,
                read_buf: Vec::new(),
            }),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Signals the reconnect loop to stop retrying and return early instead
    /// of blocking forever on a dead peer.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn select_bucket(&self) -> EngineResult<NotifyOutcome> {
        self.execute(protocol::OPCODE_SELECT_BUCKET, 0, &[], self.config.couch_bucket.as_bytes(), &[], PendingHandler::SelectBucket)
    }

    pub fn flush(&self) -> EngineResult<NotifyOutcome> {
        self.execute(protocol::OPCODE_FLUSH, 0, &[], &[], &[], PendingHandler::Flush)
    }

    pub fn del_vbucket(&self, vbid: Vbid) -> EngineResult<NotifyOutcome> {
        self.execute(protocol::OPCODE_DEL_VBUCKET, vbid.0, &[], &[], &[], PendingHandler::DelVbucket)
    }

    pub fn notify_headerpos_update(&self, vbid: Vbid, file_version: u64, header_offset: u64) -> EngineResult<NotifyOutcome> {
        let body = protocol::NotifyVBucketUpdateBody {
            file_version,
            header_offset,
            state_updated: 0,
            state: 0,
            checkpoint: 0,
        }
        .encode();
        self.execute(protocol::OPCODE_NOTIFY_HEADERPOS_UPDATE, vbid.0, &[], &[], &body, PendingHandler::Notify)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn notify_vbucket_update(
        &self,
        vbid: Vbid,
        file_version: u64,
        header_offset: u64,
        state_changed: bool,
        state: u32,
        checkpoint: u64,
    ) -> EngineResult<NotifyOutcome> {
        let body = protocol::NotifyVBucketUpdateBody {
            file_version,
            header_offset,
            state_updated: if state_changed { 1 } else { 0 },
            state,
            checkpoint,
        }
        .encode();
        self.execute(protocol::OPCODE_NOTIFY_VBUCKET_UPDATE, vbid.0, &[], &[], &body, PendingHandler::Notify)
    }

    fn execute(
        &self,
        opcode: u8,
        vbucket_id: u16,
        extras: &[u8],
        key: &[u8],
        body: &[u8],
        kind: PendingHandler,
    ) -> EngineResult<NotifyOutcome> {
        let mut inner = self.inner.lock();
        loop {
            self.ensure_connection(&mut inner)?;

            let seqno = inner.next_seqno;
            inner.next_seqno = inner.next_seqno.wrapping_add(1);
            let frame = protocol::build_request(opcode, vbucket_id, seqno, extras, key, body);

            if inner.stream.as_mut().unwrap().write_all(&frame).is_err() {
                self.reset_connection(&mut inner);
                continue;
            }
            inner.handlers.push(seqno, kind);

            match self.wait_for(&mut inner, seqno) {
                WaitResult::Resolved(HandlerOutcome::Response(status)) => {
                    self.stats.record(opcode, status == STATUS_SUCCESS);
                    return Self::status_to_outcome(status);
                }
                WaitResult::Resolved(_) | WaitResult::Reset => {
                    // implicit response or a reset: the server never
                    // answered this exact request, so redo it with a fresh
                    // seqno on the (possibly rebuilt) connection.
                    continue;
                }
            }
        }
    }

    fn status_to_outcome(status: u16) -> EngineResult<NotifyOutcome> {
        match status {
            STATUS_SUCCESS => Ok(NotifyOutcome::Success),
            STATUS_ETMPFAIL => Ok(NotifyOutcome::ETmpfail),
            other => Err(EngineError::NotifierFatal(format!("unexpected notifier status {:#06x}", other))),
        }
    }

    /// Connects if not already connected, retrying with backoff until the
    /// connection succeeds, shutdown is signalled, or the parent process has
    /// died out from under a shutting-down instance that allows data loss.
    fn ensure_connection(&self, inner: &mut Inner) -> EngineResult<()> {
        if inner.stream.is_some() {
            return Ok(());
        }

        tracing::warn!(host = %self.config.couch_host, port = self.config.couch_port, "trying to connect to mccouch");

        let stream = loop {
            let addr = (self.config.couch_host.as_str(), self.config.couch_port);
            match TcpStream::connect(addr) {
                Ok(stream) => break stream,
                Err(e) => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        return Err(EngineError::ConfigurationError(format!(
                            "failed to connect to {}:{}: {e} (shutting down)",
                            self.config.couch_host, self.config.couch_port
                        )));
                    }

                    if self.config.allow_data_loss_during_shutdown && parent_is_dead() {
                        tracing::warn!(
                            "parent process is gone and data loss during shutdown is allowed, \
                             terminating without syncing all data"
                        );
                        std::process::exit(1);
                    }

                    tracing::warn!(host = %self.config.couch_host, port = self.config.couch_port, error = %e, "connection refused, retrying");
                    std::thread::sleep(self.config.reconnect_sleeptime());
                }
            }
        };

        stream
            .set_read_timeout(Some(self.config.response_timeout()))
            .map_err(EngineError::Io)?;
        stream.set_nodelay(true).ok();

        inner.stream = Some(stream);
        inner.read_buf.clear();
        tracing::debug!(host = %self.config.couch_host, port = self.config.couch_port, "notifier connected");

        if inner.needs_select_bucket {
            self.send_select_bucket_locked(inner)?;
        }
        Ok(())
    }

    /// Performs the select_bucket handshake directly against the freshly
    /// opened socket, without re-entering `execute` (the mutex is already
    /// held). This is the "re-enqueue select_bucket" step from the
    /// reconnect procedure, folded into connection setup.
    fn send_select_bucket_locked(&self, inner: &mut Inner) -> EngineResult<()> {
        loop {
            let seqno = inner.next_seqno;
            inner.next_seqno = inner.next_seqno.wrapping_add(1);
            let frame = protocol::build_request(
                protocol::OPCODE_SELECT_BUCKET,
                0,
                seqno,
                &[],
                self.config.couch_bucket.as_bytes(),
                &[],
            );
            if inner.stream.as_mut().unwrap().write_all(&frame).is_err() {
                self.reset_connection(inner);
                return Err(EngineError::ConfigurationError("select_bucket failed mid-handshake".to_string()));
            }
            inner.handlers.push(seqno, PendingHandler::SelectBucket);

            match self.wait_for(inner, seqno) {
                WaitResult::Resolved(HandlerOutcome::Response(STATUS_SUCCESS)) => {
                    inner.needs_select_bucket = false;
                    return Ok(());
                }
                WaitResult::Resolved(HandlerOutcome::Response(status)) => {
                    return Err(EngineError::NotifierFatal(format!("select_bucket failed with status {:#06x}", status)));
                }
                WaitResult::Resolved(_) | WaitResult::Reset => continue,
            }
        }
    }

    fn wait_for(&self, inner: &mut Inner, seqno: u32) -> WaitResult {
        let deadline = Instant::now() + self.config.response_timeout();
        loop {
            match protocol::try_parse_frame(&inner.read_buf) {
                Ok(Some((frame_len, header))) => {
                    let resolved = inner.handlers.dispatch(header.opaque, header.status);
                    let outcome_for_us =
                        resolved.into_iter().find(|(s, _, _)| *s == seqno).map(|(_, _, o)| o);
                    inner.read_buf.drain(..frame_len);
                    if let Some(outcome) = outcome_for_us {
                        return WaitResult::Resolved(outcome);
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "garbage magic byte from notifier peer, resetting connection");
                    self.reset_connection(inner);
                    return WaitResult::Reset;
                }
            }

            if Instant::now() >= deadline {
                tracing::warn!(seqno, "notifier watchdog timeout, resetting connection");
                self.reset_connection(inner);
                return WaitResult::Reset;
            }

            match self.read_more(inner) {
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "notifier read failed, resetting connection");
                    self.reset_connection(inner);
                    return WaitResult::Reset;
                }
            }
        }
    }

    /// Reads whatever is available within a short tick, appending to the
    /// input buffer. Returns `Ok(true)` if bytes were read.
    fn read_more(&self, inner: &mut Inner) -> std::io::Result<bool> {
        let stream = match inner.stream.as_mut() {
            Some(s) => s,
            None => return Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "no connection")),
        };
        stream.set_read_timeout(Some(Duration::from_secs(1)))?;
        let mut tmp = [0u8; 4096];
        match stream.read(&mut tmp) {
            Ok(0) => Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "peer closed connection")),
            Ok(n) => {
                inner.read_buf.extend_from_slice(&tmp[..n]);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Tears down the socket and synthesizes `ETMPFAIL`-equivalent resets
    /// for every outstanding handler, then arranges for `select_bucket` to
    /// be reissued on the next connection.
    fn reset_connection(&self, inner: &mut Inner) {
        inner.stream = None;
        inner.read_buf.clear();
        let drained = inner.handlers.drain_on_reset();
        if !drained.is_empty() {
            tracing::warn!(count = drained.len(), "notifier connection reset, draining outstanding requests");
        }
        inner.needs_select_bucket = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reads one request frame off the wire and returns its opcode and
    /// opaque (the fields a synthetic peer needs to answer it).
    fn read_request(stream: &mut TcpStream) -> (u8, u32) {
        let mut header_buf = [0u8; protocol::HEADER_LEN];
        stream.read_exact(&mut header_buf).unwrap();
        let opcode = header_buf[1];
        let total_body_len = u32::from_be_bytes([header_buf[8], header_buf[9], header_buf[10], header_buf[11]]);
        let opaque = u32::from_be_bytes([header_buf[12], header_buf[13], header_buf[14], header_buf[15]]);
        let mut body = vec![0u8; total_body_len as usize];
        stream.read_exact(&mut body).unwrap();
        (opcode, opaque)
    }

    fn config(port: u16) -> Arc<Configuration> {
        Arc::new(Configuration {
            dbname: "unused".to_string(),
            couch_host: "127.0.0.1".to_string(),
            couch_port: port,
            couch_bucket: "default".to_string(),
            couch_response_timeout_ms: 2000,
            couch_reconnect_sleeptime_ms: 50,
            allow_data_loss_during_shutdown: false,
        })
    }

    #[test]
    fn select_bucket_then_flush_round_trip_succeeds() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            for _ in 0..2 {
                let (opcode, opaque) = read_request(&mut stream);
                let response = protocol::build_response(opcode, opaque, STATUS_SUCCESS);
                stream.write_all(&response).unwrap();
            }
        });

        let notifier = CouchNotifier::new(config(port));
        assert_eq!(notifier.flush().unwrap(), NotifyOutcome::Success);
    }

    #[test]
    fn shutdown_terminates_the_reconnect_loop_instead_of_retrying_forever() {
        // Bind then drop, so the port is refused rather than merely unused.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let notifier = CouchNotifier::new(config(port));
        notifier.shutdown();

        match notifier.flush() {
            Err(EngineError::ConfigurationError(_)) => {}
            other => panic!("expected a shutdown-time ConfigurationError, got {other:?}"),
        }
    }

    #[test]
    fn etmpfail_is_retried_by_the_caller_until_success() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let flush_attempts = Arc::new(AtomicUsize::new(0));
        let flush_attempts_thread = flush_attempts.clone();

        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            loop {
                let (opcode, opaque) = read_request(&mut stream);
                let status = if opcode == protocol::OPCODE_SELECT_BUCKET {
                    STATUS_SUCCESS
                } else {
                    let n = flush_attempts_thread.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        STATUS_ETMPFAIL
                    } else {
                        STATUS_SUCCESS
                    }
                };
                let response = protocol::build_response(opcode, opaque, status);
                stream.write_all(&response).unwrap();
                if opcode != protocol::OPCODE_SELECT_BUCKET && status == STATUS_SUCCESS {
                    break;
                }
            }
        });

        let notifier = CouchNotifier::new(config(port));
        let mut attempts = 0;
        loop {
            attempts += 1;
            match notifier.flush().unwrap() {
                NotifyOutcome::Success => break,
                NotifyOutcome::ETmpfail => continue,
            }
        }
        assert_eq!(attempts, 3);
    }
}
