//! Byte streams flowing in and out of persistors
//!
//! Every upload and download is piped through [`MeteredStream`], which
//! forwards chunks untouched while keeping a running MD5 digest and a byte
//! count. The other helpers here fan a stream out to two consumers
//! ([`tee`]), decode gzip on the fly ([`gunzip`]) and tie a backend
//! response body to an explicit cancellation token ([`abort_on_drop`]).

use std::io::{self, Write};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use flate2::write::GzDecoder;
use futures::stream::{BoxStream, Stream, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

/// Stream of object bytes, used for both uploads and downloads.
pub type ObjectStream = BoxStream<'static, io::Result<Bytes>>;

/// Channel depth for pumped streams, in chunks.
const PUMP_CAPACITY: usize = 8;

/// Build an [`ObjectStream`] from an in-memory buffer.
pub fn from_bytes(data: impl Into<Bytes>) -> ObjectStream {
    futures::stream::once(futures::future::ready(Ok(data.into()))).boxed()
}

/// Final digest of a metered stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDigest {
    /// Lowercase hex MD5
    pub md5: String,
    pub bytes: u64,
}

/// Shared slot that receives the digest once the stream reaches its end.
#[derive(Debug, Clone, Default)]
pub struct DigestHandle(Arc<Mutex<Option<StreamDigest>>>);

impl DigestHandle {
    /// `None` until the metered stream has ended naturally.
    pub fn get(&self) -> Option<StreamDigest> {
        self.0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set(&self, digest: StreamDigest) {
        *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(digest);
    }
}

/// Pass-through stage that hashes and counts every byte.
pub struct MeteredStream {
    inner: ObjectStream,
    hasher: Option<md5::Context>,
    bytes: u64,
    label: &'static str,
    handle: DigestHandle,
}

impl MeteredStream {
    /// `label` names the direction in log events, e.g. `"s3.egress"`.
    pub fn new(inner: ObjectStream, label: &'static str) -> (Self, DigestHandle) {
        let handle = DigestHandle::default();
        let stream = Self {
            inner,
            hasher: Some(md5::Context::new()),
            bytes: 0,
            label,
            handle: handle.clone(),
        };
        (stream, handle)
    }
}

impl Stream for MeteredStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        match ready!(this.inner.poll_next_unpin(cx)) {
            Some(Ok(chunk)) => {
                if let Some(hasher) = this.hasher.as_mut() {
                    hasher.consume(&chunk);
                }
                this.bytes += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(err)) => {
                // a failed stream never publishes a digest
                this.hasher = None;
                Poll::Ready(Some(Err(err)))
            }
            None => {
                if let Some(hasher) = this.hasher.take() {
                    let md5 = format!("{:x}", hasher.compute());
                    tracing::debug!(metric = this.label, bytes = this.bytes, "stream metered");
                    this.handle.set(StreamDigest {
                        md5,
                        bytes: this.bytes,
                    });
                }
                Poll::Ready(None)
            }
        }
    }
}

/// Drain `stream` and return its hex MD5.
pub async fn calculate_stream_md5(stream: ObjectStream) -> io::Result<String> {
    let (mut metered, handle) = MeteredStream::new(stream, "md5.download");
    while let Some(chunk) = metered.next().await {
        chunk?;
    }
    handle
        .get()
        .map(|digest| digest.md5)
        .ok_or_else(|| io::Error::other("stream ended without a digest"))
}

pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// True for a bare 32-character lowercase hex MD5.
pub fn is_md5_hex(value: &str) -> bool {
    value.len() == 32 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

pub fn hex_to_base64(hex_digest: &str) -> Option<String> {
    hex::decode(hex_digest).ok().map(|raw| BASE64.encode(raw))
}

pub fn base64_to_hex(b64_digest: &str) -> Option<String> {
    BASE64.decode(b64_digest).ok().map(hex::encode)
}

fn clone_io_error(err: &io::Error) -> io::Error {
    io::Error::new(err.kind(), err.to_string())
}

fn receiver_stream<G: Send + 'static>(
    rx: mpsc::Receiver<io::Result<Bytes>>,
    guard: G,
) -> ObjectStream {
    futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        rx.recv().await.map(|item| (item, (rx, guard)))
    })
    .boxed()
}

/// Chunks the trailing branch of a [`tee`] may queue before it is failed.
pub const TEE_MAX_LAG: usize = 256;

/// Consumer half of a [`tee`] branch.
struct TeeBranch {
    rx: mpsc::UnboundedReceiver<io::Result<Bytes>>,
    queued: Arc<AtomicUsize>,
    demand: Arc<Notify>,
}

impl Stream for TeeBranch {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let item = ready!(self.rx.poll_recv(cx));
        if item.is_some() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            self.demand.notify_one();
        }
        Poll::Ready(item)
    }
}

impl Drop for TeeBranch {
    fn drop(&mut self) {
        self.rx.close();
        self.demand.notify_one();
    }
}

/// Producer half of a [`tee`] branch.
struct TeeSender {
    tx: Option<mpsc::UnboundedSender<io::Result<Bytes>>>,
    queued: Arc<AtomicUsize>,
}

impl TeeSender {
    fn is_open(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn is_hungry(&self) -> bool {
        self.queued.load(Ordering::Acquire) < PUMP_CAPACITY
    }

    fn push(&mut self, item: io::Result<Bytes>) {
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        self.queued.fetch_add(1, Ordering::AcqRel);
        if tx.send(item).is_err() {
            self.tx = None;
        }
    }

    /// Deliver an error and stop feeding this branch.
    fn fail(&mut self, err: io::Error) {
        self.push(Err(err));
        self.tx = None;
    }
}

fn tee_branch(demand: &Arc<Notify>) -> (TeeSender, TeeBranch) {
    let (tx, rx) = mpsc::unbounded_channel();
    let queued = Arc::new(AtomicUsize::new(0));
    let sender = TeeSender {
        tx: Some(tx),
        queued: queued.clone(),
    };
    let branch = TeeBranch {
        rx,
        queued,
        demand: demand.clone(),
    };
    (sender, branch)
}

/// Duplicate `source` into two consumers.
///
/// The first branch sets the pace: the source is polled whenever it has
/// room, regardless of the second. The second branch queues up to
/// [`TEE_MAX_LAG`] chunks behind it and then receives an error instead of
/// the rest of the data, so a stalled follower never holds up the leader.
/// When the first branch is dropped the second takes over the pace. Once
/// both are dropped the source is dropped too. A source error is delivered
/// to both branches.
pub fn tee(mut source: ObjectStream) -> (ObjectStream, ObjectStream) {
    let demand = Arc::new(Notify::new());
    let (mut leader, left) = tee_branch(&demand);
    let (mut follower, right) = tee_branch(&demand);

    tokio::spawn(async move {
        loop {
            loop {
                let pacer = if leader.is_open() {
                    &leader
                } else if follower.is_open() {
                    &follower
                } else {
                    return;
                };
                if pacer.is_hungry() {
                    break;
                }
                demand.notified().await;
            }

            let Some(item) = source.next().await else {
                return;
            };
            let failed = item.is_err();
            let copy = match &item {
                Ok(chunk) => Ok(chunk.clone()),
                Err(err) => Err(clone_io_error(err)),
            };

            leader.push(item);
            if follower.is_open() && follower.queued.load(Ordering::Acquire) >= TEE_MAX_LAG {
                tracing::warn!(lag = TEE_MAX_LAG, "tee branch fell behind, detaching it");
                follower.fail(io::Error::other("tee branch fell too far behind its sibling"));
            } else {
                follower.push(copy);
            }
            if failed {
                return;
            }
        }
    });

    (left.boxed(), right.boxed())
}

/// Pump a backend response body through a channel bound to `token`.
///
/// The returned stream owns a drop guard: dropping it, or a body error,
/// cancels `token`, and the pump task drops the backend body, releasing
/// the underlying request. Adapters create `token` before sending the
/// request and share it with the transport, so a request still in flight
/// is aborted too.
pub fn abort_on_drop(mut body: ObjectStream, token: CancellationToken) -> ObjectStream {
    let (tx, rx) = mpsc::channel(PUMP_CAPACITY);
    let task_token = token.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = task_token.cancelled() => {
                    tracing::debug!("aborting in-flight object request");
                    break;
                }
                item = body.next() => match item {
                    Some(Ok(chunk)) => {
                        if tx.send(Ok(chunk)).await.is_err() {
                            task_token.cancel();
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        task_token.cancel();
                        let _ = tx.send(Err(err)).await;
                        break;
                    }
                    None => break,
                },
            }
        }
    });

    receiver_stream(rx, token.drop_guard())
}

/// Decode a gzip-encoded stream chunk by chunk.
pub fn gunzip(stream: ObjectStream) -> ObjectStream {
    let state = (stream, Some(GzDecoder::new(Vec::new())));
    futures::stream::unfold(state, |(mut stream, mut decoder)| async move {
        loop {
            let active = decoder.as_mut()?;
            match stream.next().await {
                Some(Ok(chunk)) => {
                    if let Err(err) = active.write_all(&chunk) {
                        return Some((Err(err), (stream, None)));
                    }
                    let out = std::mem::take(active.get_mut());
                    if !out.is_empty() {
                        return Some((Ok(Bytes::from(out)), (stream, decoder)));
                    }
                }
                Some(Err(err)) => return Some((Err(err), (stream, None))),
                None => {
                    let finished = decoder.take()?.finish();
                    return match finished {
                        Ok(out) if out.is_empty() => None,
                        Ok(out) => Some((Ok(Bytes::from(out)), (stream, None))),
                        Err(err) => Some((Err(err), (stream, None))),
                    };
                }
            }
        }
    })
    .boxed()
}
