//! The feed: an append-only log whose every block verifies against the
//! feed key.
//!
//! A [`Feed`] handle is cheap to clone and shares one state core behind an
//! async mutex, so all state mutation happens in a single serialized
//! context. Writes (appends and puts) additionally funnel through a bounded
//! command queue with one consumer task, giving concurrent submitters FIFO
//! completion order. Reads that cannot be served locally park a waiter and
//! resolve once the block arrives through a put.

use std::{
    ops::{
        Bound,
        RangeBounds,
    },
    sync::{
        Arc,
        Weak,
    },
    time::Duration,
};

use tessera_merkle::{
    flat,
    hash_leaf,
    hash_parent,
    hash_roots,
    Generator,
    Node,
};
use tokio::sync::{
    mpsc,
    oneshot,
    watch,
    Mutex,
};
use tracing::{
    debug,
    instrument,
    trace,
    warn,
};

use crate::{
    bitfield::Bitfield,
    codec::ValueEncoding,
    crypto::{
        self,
        Signature,
        SigningKey,
        VerificationKey,
    },
    peer::{
        Have,
        Peer,
    },
    proof::Proof,
    storage::{
        Disk,
        Memory,
        RandomAccess,
        Storage,
    },
    tree_index::{
        self,
        ProofOptions,
    },
    Error,
    FeedOptions,
    Result,
};

mod batch;

use batch::WriteCommand;

/// Capacity of the write command queue feeding the single consumer task.
const WRITE_QUEUE_DEPTH: usize = 64;

/// Length and byte length of a feed, broadcast after every growth.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeedLength {
    pub length: u64,
    pub byte_length: u64,
}

/// Options for [`Feed::get_with`].
#[derive(Debug)]
pub struct GetOptions {
    /// Park a waiter when the block is missing locally instead of failing
    /// with `NotFound`.
    pub wait: bool,
    /// Give up waiting after this long with `Timeout`.
    pub timeout: Option<Duration>,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            wait: true,
            timeout: None,
        }
    }
}

/// Options for [`Feed::read_stream`].
#[derive(Debug, Default)]
pub struct ReadStreamOptions {
    /// First block to yield.
    pub start: u64,
    /// One past the last block to yield; `None` reads to the feed's length
    /// at stream creation, or follows the tail when `live` is set.
    pub end: Option<u64>,
    /// Keep the stream open past the current length, yielding blocks as
    /// they are appended.
    pub live: bool,
    /// Start at the feed's length at stream creation.
    pub tail: bool,
    /// Wait for missing blocks instead of failing the stream.
    pub wait: bool,
    /// Per-block wait deadline.
    pub timeout: Option<Duration>,
}

/// A registered download selection, as exposed to the replication layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SelectionInfo {
    pub id: u64,
    pub start: u64,
    /// `None` is an open-ended selection following the live tail.
    pub end: Option<u64>,
    /// Request hashes only, not block data.
    pub hash: bool,
    /// Request blocks strictly in order.
    pub linear: bool,
}

/// Options for [`Feed::download_with`].
#[derive(Debug, Default)]
pub struct DownloadOptions {
    pub start: u64,
    pub end: Option<u64>,
    pub hash: bool,
    pub linear: bool,
}

/// Ticket for a registered download; resolves when the range is locally
/// complete.
#[derive(Debug)]
pub struct Download {
    id: u64,
    ticket: oneshot::Receiver<Result<()>>,
}

impl Download {
    /// Identity of the underlying selection, usable with
    /// [`Feed::undownload`].
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits until every block of the selection is present locally.
    pub async fn done(self) -> Result<()> {
        self.ticket.await.map_err(|_| Error::Cancelled)?
    }
}

/// Outcome of a full-feed audit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AuditReport {
    /// Blocks whose data re-hashed to the stored leaf hash.
    pub valid: u64,
    /// Blocks that failed re-hashing; their data bits were cleared.
    pub invalid: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Ready,
    Closing,
    Closed,
}

enum WaiterKind {
    Index(u64),
    Bytes(u64),
}

struct Waiter {
    kind: WaiterKind,
    signal: oneshot::Sender<()>,
}

struct Selection {
    id: u64,
    start: u64,
    end: Option<u64>,
    hash: bool,
    linear: bool,
    ticket: Option<oneshot::Sender<Result<()>>>,
}

pub(crate) struct Core<T: RandomAccess> {
    storage: Storage<T>,
    phase: Phase,
    poisoned: bool,
    key: [u8; 32],
    discovery_key: [u8; 32],
    secret: Option<SigningKey>,
    live: bool,
    writable: bool,
    sparse: bool,
    indexing: bool,
    length: u64,
    byte_length: u64,
    bitfield: Bitfield,
    merkle: Generator,
    waiters: Vec<Waiter>,
    selections: Vec<Selection>,
    next_selection_id: u64,
    peers: Vec<Weak<dyn Peer>>,
    flushing: bool,
    last_flush_error: Option<Error>,
}

pub(crate) struct Shared<T: RandomAccess> {
    core: Mutex<Core<T>>,
    writer: mpsc::Sender<WriteCommand>,
    growth: watch::Sender<FeedLength>,
    // keeps the watch channel open with zero subscribers
    _growth_rx: watch::Receiver<FeedLength>,
    codec: ValueEncoding,
    id: [u8; 32],
}

/// A verifiable append-only log.
///
/// See the crate docs for an overview; every operation below is safe to
/// call from any number of cloned handles concurrently.
pub struct Feed<T: RandomAccess> {
    shared: Arc<Shared<T>>,
}

impl<T: RandomAccess> Clone for Feed<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl Feed<Memory> {
    /// Creates a feed over ephemeral in-memory storage.
    pub async fn in_memory(options: FeedOptions) -> Result<Self> {
        Self::with_storage(Storage::in_memory(), options).await
    }
}

impl Feed<Disk> {
    /// Opens (creating as needed) the feed persisted in `dir`.
    pub async fn open_in_dir(
        dir: impl AsRef<std::path::Path>,
        options: FeedOptions,
    ) -> Result<Self> {
        let storage = Storage::open_in_dir(dir).await?;
        Self::with_storage(storage, options).await
    }
}

impl<T: RandomAccess> Feed<T> {
    /// Opens a feed over the given storage binding.
    ///
    /// Reads the persisted key material and bitfield, recovers `length` by
    /// trimming the tree bitfield to the last boundary whose root nodes are
    /// all present, seeds the Merkle generator from those roots, and spawns
    /// the write consumer task.
    #[instrument(name = "feed_open", skip_all)]
    pub async fn with_storage(mut storage: Storage<T>, options: FeedOptions) -> Result<Self> {
        let state = storage.open_state().await?;
        let mut bitfield = Bitfield::from_pages(&state.bitfield_pages);
        let mut key = state.key;
        let mut secret = state.secret_key.as_ref().and_then(SigningKey::from_record);

        let mut overwrite = options.overwrite;
        if key.is_none() && (bitfield.len() > 0 || bitfield.tree_len() > 0) {
            // stored bits without a key can never be verified again
            warn!("storage holds blocks but no key; forcing overwrite");
            overwrite = true;
        }
        if overwrite {
            storage.erase(state.bitfield_pages.len()).await?;
            bitfield.clear();
            key = None;
            secret = None;
        }

        match (&key, &secret) {
            (Some(key), Some(stored)) if stored.verification_key().to_bytes() != *key => {
                // the secret belongs to some other feed; open read-only
                warn!("stored secret key does not match the feed key; ignoring it");
                secret = None;
            }
            (None, Some(stored)) => {
                key = Some(stored.verification_key().to_bytes());
            }
            _ => {}
        }

        if let (Some(expected), Some(stored)) = (&options.key, &key) {
            if expected != stored {
                return Err(Error::AlreadyExists);
            }
        }

        if key.is_none() {
            if let Some(expected) = options.key {
                key = Some(expected);
                if let Some(provided) = options.secret_key {
                    if provided.verification_key().to_bytes() == expected {
                        secret = Some(provided);
                    } else {
                        return Err(Error::AlreadyExists);
                    }
                }
            } else if options.create_if_missing {
                let signing = SigningKey::new(rand::rngs::OsRng);
                key = Some(signing.verification_key().to_bytes());
                secret = Some(signing);
            } else {
                return Err(Error::NotFound);
            }
            let key = key.expect("key was adopted or generated above");
            storage.put_key(&key).await?;
            if let Some(secret) = &secret {
                storage.put_secret_key(&secret.to_record()).await?;
            }
        }
        let key = key.expect("key was found, adopted, or generated above");

        // trim to the last boundary whose full roots are all loadable; a
        // crash can leave tree records beyond the durable bitfield
        let mut length = tree_index::blocks(&bitfield);
        let mut roots = Vec::new();
        while length > 0 {
            match load_roots(&mut storage, 2 * length).await {
                Ok(loaded) => {
                    roots = loaded;
                    break;
                }
                Err(Error::NotFound) => length -= 1,
                Err(e) => return Err(e),
            }
        }
        let byte_length = roots.iter().map(|root| root.size).sum();
        let merkle = Generator::from_roots(roots);

        let live = if length > 0 {
            storage.signature(length - 1).await?.is_some()
        } else {
            options.live
        };
        let writable = secret.is_some();

        debug!(
            key = %hex::encode(key),
            length,
            byte_length,
            live,
            writable,
            "feed is ready",
        );

        let mut core = Core {
            storage,
            phase: Phase::Ready,
            poisoned: false,
            key,
            discovery_key: crypto::discovery_key(&key),
            secret,
            live,
            writable,
            sparse: options.sparse,
            indexing: options.indexing,
            length,
            byte_length,
            bitfield,
            merkle,
            waiters: Vec::new(),
            selections: Vec::new(),
            next_selection_id: 0,
            peers: Vec::new(),
            flushing: false,
            last_flush_error: None,
        };
        if !core.sparse {
            core.selections.push(Selection {
                id: core.next_selection_id,
                start: 0,
                end: None,
                hash: false,
                linear: false,
                ticket: None,
            });
            core.next_selection_id += 1;
        }

        let (writer, commands) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let (growth, growth_rx) = watch::channel(FeedLength {
            length,
            byte_length,
        });
        let shared = Arc::new(Shared {
            core: Mutex::new(core),
            writer,
            growth,
            _growth_rx: growth_rx,
            codec: options.value_encoding,
            id: options.id.unwrap_or_else(rand::random),
        });
        batch::spawn_writer(Arc::downgrade(&shared), commands);
        Ok(Self {
            shared,
        })
    }

    // === cheap observers ===

    /// Number of blocks in the feed.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.shared.growth.borrow().length
    }

    /// Total byte length of all blocks.
    #[must_use]
    pub fn byte_length(&self) -> u64 {
        self.shared.growth.borrow().byte_length
    }

    /// Local identity used by replication for peer dedup.
    #[must_use]
    pub fn id(&self) -> [u8; 32] {
        self.shared.id
    }

    /// Subscribes to growth announcements; the receiver observes every
    /// `length`/`byte_length` committed after storage writes complete.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<FeedLength> {
        self.shared.growth.subscribe()
    }

    /// The feed's public key (or, for a finalized feed, its root hash
    /// anchor).
    pub async fn key(&self) -> [u8; 32] {
        self.shared.core.lock().await.key
    }

    /// Keyed hash of the feed key, safe to advertise.
    pub async fn discovery_key(&self) -> [u8; 32] {
        self.shared.core.lock().await.discovery_key
    }

    pub async fn is_writable(&self) -> bool {
        self.shared.core.lock().await.writable
    }

    pub async fn is_live(&self) -> bool {
        self.shared.core.lock().await.live
    }

    /// Whether block `index` is present locally.
    pub async fn has(&self, index: u64) -> bool {
        self.shared.core.lock().await.bitfield.get(index)
    }

    /// First block index at or after `from` that is missing locally.
    /// Replication layers use this to pick the next request.
    pub async fn next_missing(&self, from: u64) -> u64 {
        self.shared.core.lock().await.bitfield.next_missing(from)
    }

    /// First block index at or after `from` that is present locally, if
    /// any.
    pub async fn next_present(&self, from: u64) -> Option<u64> {
        self.shared.core.lock().await.bitfield.next_present(from)
    }

    /// Whether every block of `[start, end)` is present locally.
    pub async fn has_range(&self, start: u64, end: u64) -> bool {
        end <= start || self.downloaded(start, end).await == end - start
    }

    /// Number of blocks of `[start, end)` present locally.
    pub async fn downloaded(&self, start: u64, end: u64) -> u64 {
        self.shared.core.lock().await.bitfield.total(start, end)
    }

    // === writing ===

    /// Appends one value, returning its block index.
    pub async fn append(&self, value: &[u8]) -> Result<u64> {
        self.append_batch(&[value]).await
    }

    /// Appends a batch of values atomically, returning the index of the
    /// first.
    ///
    /// The batch is encoded up front, then sequenced through the write
    /// queue: concurrent callers observe FIFO ordering and at most one
    /// batch is in flight.
    #[instrument(skip_all, fields(blocks = values.len()))]
    pub async fn append_batch(&self, values: &[impl AsRef<[u8]>]) -> Result<u64> {
        let mut blocks = Vec::with_capacity(values.len());
        for value in values {
            blocks.push(self.shared.codec.encode(value.as_ref())?);
        }
        let (reply, outcome) = oneshot::channel();
        self.shared
            .writer
            .send(WriteCommand::Append {
                blocks,
                reply,
            })
            .await
            .map_err(|_| Error::Closed)?;
        outcome.await.map_err(|_| Error::Closed)?
    }

    /// Verifies and absorbs a remote block with its proof.
    ///
    /// Present blocks are accepted idempotently. On success the block's
    /// bits flip and, when the proof's signature extends the verified span,
    /// `length` and `byte_length` grow.
    #[instrument(skip(self, data, proof))]
    pub async fn put(&self, index: u64, data: Vec<u8>, proof: Proof) -> Result<()> {
        let (reply, outcome) = oneshot::channel();
        self.shared
            .writer
            .send(WriteCommand::Put {
                index,
                data,
                proof,
                reply,
            })
            .await
            .map_err(|_| Error::Closed)?;
        outcome.await.map_err(|_| Error::Closed)?
    }

    // === reading ===

    /// Reads block `index`, waiting for it to arrive if missing locally.
    pub async fn get(&self, index: u64) -> Result<Vec<u8>> {
        self.get_with(index, GetOptions::default()).await
    }

    /// Reads block `index` with explicit wait/timeout behavior.
    #[instrument(skip(self, options), fields(wait = options.wait))]
    pub async fn get_with(&self, index: u64, options: GetOptions) -> Result<Vec<u8>> {
        let deadline = options.timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let waiter = {
                let mut core = self.shared.core.lock().await;
                core.ensure_readable()?;
                if core.bitfield.get(index) {
                    let block = core.storage.data(index).await?;
                    drop(core);
                    return self.shared.codec.decode(&block);
                }
                if !options.wait {
                    return Err(Error::NotFound);
                }
                trace!(index, "parking waiter for missing block");
                let waiter = core.park(WaiterKind::Index(index));
                core.notify_peers(None, None);
                waiter
            };
            self.await_waiter(waiter, deadline).await?;
        }
    }

    /// Reads the blocks of `[start, end)` in one pass.
    ///
    /// Fails with `NotFound` on the first missing block; batch reads never
    /// wait.
    pub async fn get_batch(&self, start: u64, end: u64) -> Result<Vec<Vec<u8>>> {
        let mut core = self.shared.core.lock().await;
        core.ensure_readable()?;
        let mut blocks = Vec::with_capacity(usize::try_from(end.saturating_sub(start)).unwrap_or(0));
        for index in start..end {
            if !core.bitfield.get(index) {
                return Err(Error::NotFound);
            }
            let block = core.storage.data(index).await?;
            blocks.push(self.shared.codec.decode(&block)?);
        }
        Ok(blocks)
    }

    /// Reads the last block, or `None` on an empty feed.
    pub async fn head(&self) -> Result<Option<Vec<u8>>> {
        let length = self.length();
        if length == 0 {
            return Ok(None);
        }
        self.get_with(length - 1, GetOptions {
            wait: false,
            timeout: None,
        })
        .await
        .map(Some)
    }

    /// Translates a byte offset into `(block index, offset inside block)`.
    pub async fn seek(&self, byte_offset: u64) -> Result<(u64, u64)> {
        self.seek_with(byte_offset, GetOptions::default()).await
    }

    /// Byte seek with explicit wait/timeout behavior.
    ///
    /// Fails with `OutOfBounds` when the offset lies past the feed's bytes
    /// and waiting is disabled; otherwise parks until appends (or remotely
    /// served subtrees) cover the offset.
    #[instrument(skip(self, options), fields(wait = options.wait))]
    pub async fn seek_with(&self, byte_offset: u64, options: GetOptions) -> Result<(u64, u64)> {
        let deadline = options.timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let waiter = {
                let mut core = self.shared.core.lock().await;
                core.ensure_readable()?;
                if let Some(found) = core.try_seek(byte_offset).await? {
                    return Ok(found);
                }
                if !options.wait {
                    return Err(Error::OutOfBounds);
                }
                trace!(byte_offset, "parking byte-seek waiter");
                let waiter = core.park(WaiterKind::Bytes(byte_offset));
                core.notify_peers(None, None);
                waiter
            };
            self.await_waiter(waiter, deadline).await?;
        }
    }

    async fn await_waiter(
        &self,
        waiter: oneshot::Receiver<()>,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<()> {
        let outcome = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, waiter).await {
                Ok(outcome) => outcome,
                Err(_) => return Err(Error::Timeout),
            },
            None => waiter.await,
        };
        outcome.map_err(|_| Error::Cancelled)
    }

    // === proofs ===

    /// Builds the proof for block `index` with default options.
    pub async fn proof(&self, index: u64) -> Result<Proof> {
        self.proof_with(index, ProofOptions::default()).await
    }

    /// Builds the minimum proof for block `index` given the requester's
    /// knowledge summary.
    #[instrument(skip(self, options), fields(digest = options.digest))]
    pub async fn proof_with(&self, index: u64, options: ProofOptions) -> Result<Proof> {
        let mut core = self.shared.core.lock().await;
        core.ensure_readable()?;
        let plan =
            tree_index::proof(&core.bitfield, 2 * index, &options).ok_or(Error::NotFound)?;
        let mut nodes = Vec::with_capacity(plan.nodes.len());
        for node_index in &plan.nodes {
            nodes.push(core.storage.node(*node_index).await?);
        }
        let signature = match plan.verified_by {
            Some(boundary) if core.live => {
                let slot = boundary / 2 - 1;
                match core.storage.signature(slot).await? {
                    Some(signature) => Some(signature),
                    None => return Err(Error::MissingSignature),
                }
            }
            _ => None,
        };
        Ok(Proof {
            nodes,
            signature,
        })
    }

    /// Summarizes local knowledge around block `index` for proof dedup.
    pub async fn digest(&self, index: u64) -> u64 {
        let core = self.shared.core.lock().await;
        tree_index::digest(&core.bitfield, 2 * index)
    }

    /// Returns the first stored signature at or after block `index`.
    pub async fn signature(&self, index: u64) -> Result<Signature> {
        let mut core = self.shared.core.lock().await;
        core.ensure_readable()?;
        if index >= core.length {
            return Err(Error::OutOfBounds);
        }
        for slot in index..core.length {
            if let Some(signature) = core.storage.signature(slot).await? {
                return Ok(signature);
            }
        }
        Err(Error::MissingSignature)
    }

    /// Verifies a detached signature over the roots of the first
    /// `index + 1` blocks.
    pub async fn verify(&self, index: u64, signature: &Signature) -> Result<()> {
        let mut core = self.shared.core.lock().await;
        core.ensure_readable()?;
        if index >= core.length {
            return Err(Error::OutOfBounds);
        }
        let roots = load_roots(&mut core.storage, 2 * (index + 1)).await?;
        let checksum = hash_roots(&roots);
        let key = VerificationKey::try_from(core.key.as_slice())
            .map_err(|_| Error::InvalidProof)?;
        key.verify(signature, &checksum)
            .map_err(|_| Error::InvalidProof)
    }

    /// Loads the full-root nodes covering the first `index + 1` blocks.
    pub async fn root_hashes(&self, index: u64) -> Result<Vec<Node>> {
        let mut core = self.shared.core.lock().await;
        core.ensure_readable()?;
        if index >= core.length {
            return Err(Error::OutOfBounds);
        }
        load_roots(&mut core.storage, 2 * (index + 1)).await
    }

    // === selections ===

    /// Declares interest in a range of blocks; replication drives requests
    /// from the selection set. Resolves when the range is locally complete.
    pub async fn download(&self, range: impl RangeBounds<u64>) -> Download {
        let start = match range.start_bound() {
            Bound::Included(&s) => s,
            Bound::Excluded(&s) => s + 1,
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(&e) => Some(e + 1),
            Bound::Excluded(&e) => Some(e),
            Bound::Unbounded => None,
        };
        self.download_with(DownloadOptions {
            start,
            end,
            hash: false,
            linear: false,
        })
        .await
    }

    /// Registers a selection with explicit options.
    pub async fn download_with(&self, options: DownloadOptions) -> Download {
        let (ticket_tx, ticket) = oneshot::channel();
        let mut core = self.shared.core.lock().await;
        let id = core.next_selection_id;
        core.next_selection_id += 1;
        let complete = match options.end {
            Some(end) => {
                end <= options.start
                    || core.bitfield.total(options.start, end) == end - options.start
            }
            None => false,
        };
        if complete {
            let _ = ticket_tx.send(Ok(()));
        } else {
            core.selections.push(Selection {
                id,
                start: options.start,
                end: options.end,
                hash: options.hash,
                linear: options.linear,
                ticket: Some(ticket_tx),
            });
            core.notify_peers(None, None);
        }
        Download {
            id,
            ticket,
        }
    }

    /// Cancels the selection registered under `id`; its ticket rejects
    /// with `Cancelled`.
    pub async fn undownload(&self, id: u64) {
        let mut core = self.shared.core.lock().await;
        if let Some(position) = core.selections.iter().position(|s| s.id == id) {
            let selection = core.selections.swap_remove(position);
            if let Some(ticket) = selection.ticket {
                let _ = ticket.send(Err(Error::Cancelled));
            }
            core.notify_peers(None, None);
        }
    }

    /// Snapshot of the registered selections, insertion-ordered.
    pub async fn selections(&self) -> Vec<SelectionInfo> {
        let core = self.shared.core.lock().await;
        core.selections
            .iter()
            .map(|s| SelectionInfo {
                id: s.id,
                start: s.start,
                end: s.end,
                hash: s.hash,
                linear: s.linear,
            })
            .collect()
    }

    // === peers ===

    /// Registers a peer for notifications. The feed holds it weakly; a
    /// dropped peer falls out during the next notification pass.
    pub async fn register_peer(&self, peer: Weak<dyn Peer>) {
        let mut core = self.shared.core.lock().await;
        core.peers.push(peer);
    }

    /// Broadcasts an update notification to all registered peers.
    pub async fn update_peers(&self) {
        let mut core = self.shared.core.lock().await;
        core.notify_peers(None, None);
    }

    // === maintenance ===

    /// Seals the feed: the key becomes the hash of the current roots and
    /// no further appends are accepted.
    #[instrument(skip(self))]
    pub async fn finalize(&self) -> Result<()> {
        let mut core = self.shared.core.lock().await;
        core.ensure_mutable()?;
        let key = core.merkle.root_hash();
        core.storage.put_key(&key).await?;
        core.storage.put_secret_key(&[0; 64]).await?;
        core.key = key;
        core.discovery_key = crypto::discovery_key(&key);
        core.live = false;
        core.writable = false;
        core.secret = None;
        debug!(key = %hex::encode(key), "feed finalized");
        Ok(())
    }

    /// Re-hashes every locally present block against its stored leaf node,
    /// clearing the data bit of any mismatch.
    #[instrument(skip(self))]
    pub async fn audit(&self) -> Result<AuditReport> {
        let mut core = self.shared.core.lock().await;
        core.ensure_readable()?;
        let mut report = AuditReport::default();
        let mut cursor = 0;
        while let Some(index) = core.bitfield.next_present(cursor) {
            let block = core.storage.data(index).await?;
            let leaf = core.storage.node(2 * index).await?;
            if hash_leaf(&block) == leaf.hash {
                report.valid += 1;
            } else {
                warn!(index, "block data does not match its leaf hash");
                core.bitfield.set(index, false);
                report.invalid += 1;
            }
            cursor = index + 1;
        }
        if report.invalid > 0 {
            schedule_flush(&self.shared, &mut core);
        }
        Ok(report)
    }

    /// Writes out dirty bitfield pages and syncs all streams.
    ///
    /// Surfaces any error a background flush hit since the last call.
    pub async fn flush(&self) -> Result<()> {
        let mut core = self.shared.core.lock().await;
        core.ensure_readable()?;
        if let Some(error) = core.last_flush_error.take() {
            return Err(error);
        }
        core.drain_bitfield().await?;
        core.storage.sync_all().await
    }

    /// Quiesces the feed: rejects queued waiters and selections, persists
    /// the bitfield, and closes storage.
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<()> {
        let mut core = self.shared.core.lock().await;
        if core.phase == Phase::Closed {
            return Ok(());
        }
        core.phase = Phase::Closing;
        for waiter in core.waiters.drain(..) {
            // dropping the sender rejects the parked read with Cancelled
            drop(waiter.signal);
        }
        let selections = core.selections.drain(..).collect::<Vec<_>>();
        for selection in selections {
            if let Some(ticket) = selection.ticket {
                let _ = ticket.send(Err(Error::Cancelled));
            }
        }
        core.drain_bitfield().await?;
        core.storage.sync_all().await?;
        core.storage.close().await?;
        core.phase = Phase::Closed;
        debug!("feed closed");
        Ok(())
    }
}

impl<T: RandomAccess> Core<T> {
    fn ensure_readable(&self) -> Result<()> {
        if self.phase != Phase::Ready {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn ensure_mutable(&self) -> Result<()> {
        self.ensure_readable()?;
        if self.poisoned {
            return Err(Error::Critical);
        }
        Ok(())
    }

    fn park(&mut self, kind: WaiterKind) -> oneshot::Receiver<()> {
        let (signal, waiter) = oneshot::channel();
        self.waiters.push(Waiter {
            kind,
            signal,
        });
        waiter
    }

    /// Wakes waiters whose condition now holds and resolves completed
    /// selections, then notifies peers.
    fn settle(&mut self, have: Option<Have>, bytes_grew: bool) {
        let mut i = 0;
        while i < self.waiters.len() {
            let satisfied = match self.waiters[i].kind {
                WaiterKind::Index(index) => self.bitfield.get(index),
                WaiterKind::Bytes(offset) => self.byte_length > offset,
            };
            if satisfied || self.waiters[i].signal.is_closed() {
                let waiter = self.waiters.swap_remove(i);
                let _ = waiter.signal.send(());
            } else {
                i += 1;
            }
        }

        let mut i = 0;
        while i < self.selections.len() {
            let complete = match self.selections[i].end {
                Some(end) => {
                    let s = &self.selections[i];
                    self.bitfield.total(s.start, end) == end - s.start
                }
                None => false,
            };
            if complete {
                let selection = self.selections.swap_remove(i);
                if let Some(ticket) = selection.ticket {
                    let _ = ticket.send(Ok(()));
                }
            } else {
                i += 1;
            }
        }

        self.notify_peers(have, bytes_grew.then_some(self.byte_length));
    }

    fn notify_peers(&mut self, have: Option<Have>, byte_length: Option<u64>) {
        self.peers.retain(|peer| {
            let Some(peer) = peer.upgrade() else {
                return false;
            };
            if let Some(have) = &have {
                peer.have(have);
            }
            if let Some(byte_length) = byte_length {
                peer.have_bytes(byte_length);
            }
            peer.update();
            true
        });
    }

    async fn drain_bitfield(&mut self) -> Result<()> {
        while let Some((page_no, record)) = self.bitfield.next_update() {
            if let Err(e) = self.storage.put_bitfield_page(page_no, &record).await {
                self.bitfield.requeue(page_no);
                return Err(e);
            }
        }
        Ok(())
    }

    async fn try_seek(&mut self, byte_offset: u64) -> Result<Option<(u64, u64)>> {
        if byte_offset == 0 {
            return Ok(Some((0, 0)));
        }
        if byte_offset >= self.byte_length {
            return Ok(None);
        }
        let mut remaining = byte_offset;
        for root_index in flat::full_roots(2 * self.length) {
            let root = match self.storage.node(root_index).await {
                Ok(node) => node,
                Err(Error::NotFound) => return Ok(None),
                Err(e) => return Err(e),
            };
            if root.size <= remaining {
                remaining -= root.size;
                continue;
            }
            // descend into this subtree
            let mut current = root;
            loop {
                if current.is_leaf() {
                    return Ok(Some((current.index / 2, remaining)));
                }
                let left = match self.storage.node(flat::left_child(current.index)).await {
                    Ok(node) => node,
                    Err(Error::NotFound) => return Ok(None),
                    Err(e) => return Err(e),
                };
                if left.size > remaining {
                    current = left;
                } else {
                    remaining -= left.size;
                    current = match self.storage.node(flat::right_child(current.index)).await {
                        Ok(node) => node,
                        Err(Error::NotFound) => return Ok(None),
                        Err(e) => return Err(e),
                    };
                }
            }
        }
        Ok(None)
    }

    /// The append pipeline: encode-side work is done; this runs on the
    /// write consumer.
    async fn handle_append(&mut self, blocks: Vec<Vec<u8>>) -> Result<(u64, Option<Have>)> {
        self.ensure_mutable()?;
        if !self.writable {
            return Err(Error::NotWritable);
        }
        let start = self.length;
        let start_bytes = self.byte_length;

        // stage everything on a copy so a failed write leaves state intact
        let mut merkle = self.merkle.clone();
        let mut nodes = Vec::new();
        let mut offsets = Vec::with_capacity(blocks.len());
        let mut signatures = Vec::new();
        let mut appended_bytes = 0;
        for (k, block) in blocks.iter().enumerate() {
            let leaf = merkle.next(block, &mut nodes);
            offsets.push(start_bytes + appended_bytes);
            appended_bytes += leaf.size;
            if self.live {
                if let Some(secret) = &self.secret {
                    signatures.push((start + k as u64, secret.sign(&merkle.root_hash())));
                }
            }
        }

        for node in &nodes {
            self.storage.put_node(node).await?;
        }
        if !self.indexing {
            for (block, offset) in blocks.iter().zip(&offsets) {
                self.storage.put_data(*offset, block).await?;
            }
        }
        for (slot, signature) in &signatures {
            self.storage.put_signature(*slot, signature).await?;
        }

        self.merkle = merkle;
        self.length = start + blocks.len() as u64;
        self.byte_length = start_bytes + appended_bytes;
        for index in start..self.length {
            self.bitfield.set(index, true);
        }
        for node in &nodes {
            tree_index::set(&mut self.bitfield, node.index);
        }
        trace!(
            start,
            blocks = blocks.len(),
            length = self.length,
            "append committed",
        );
        let have = Have {
            start,
            length: blocks.len() as u64,
        };
        Ok((start, Some(have)))
    }

    /// The verify-and-absorb pipeline for one remote block.
    async fn handle_put(
        &mut self,
        index: u64,
        data: Vec<u8>,
        proof: Proof,
    ) -> Result<Option<Have>> {
        self.ensure_mutable()?;
        if self.bitfield.get(index) {
            // same block, same bytes: nothing to do
            return Ok(None);
        }

        // find the local trust frontier for this leaf
        let mut next = 2 * index;
        let mut trusted = None;
        let mut missing_indices = Vec::new();
        let mut cursor = 0;
        loop {
            if self.bitfield.tree_get(next) {
                trusted = Some(next);
                break;
            }
            let sibling = flat::sibling(next);
            if cursor < proof.nodes.len() && proof.nodes[cursor].index == sibling {
                cursor += 1;
            } else if self.bitfield.tree_get(sibling) {
                missing_indices.push(sibling);
            } else {
                break;
            }
            next = flat::parent(next);
        }
        let trusted = match trusted {
            Some(anchor) => Some(self.storage.node(anchor).await?),
            None => None,
        };
        let mut missing = Vec::with_capacity(missing_indices.len());
        for missing_index in missing_indices {
            missing.push(self.storage.node(missing_index).await?);
        }

        // fold upward from the leaf until we meet the anchor or the roots
        let mut top = Node::new(2 * index, hash_leaf(&data), data.len() as u64);
        let mut writes = vec![top.clone()];
        let mut proof_cursor = 0;
        let mut missing_cursor = 0;
        let mut signed = None;
        let mut extension: Option<(u64, Vec<Node>)> = None;
        loop {
            if let Some(anchor) = &trusted {
                if top.index == anchor.index {
                    if top.hash != anchor.hash {
                        return Err(Error::ChecksumFailed);
                    }
                    break;
                }
            }
            let sibling_index = flat::sibling(top.index);
            let sibling = if proof_cursor < proof.nodes.len()
                && proof.nodes[proof_cursor].index == sibling_index
            {
                proof_cursor += 1;
                proof.nodes[proof_cursor - 1].clone()
            } else if missing_cursor < missing.len()
                && missing[missing_cursor].index == sibling_index
            {
                missing_cursor += 1;
                missing[missing_cursor - 1].clone()
            } else {
                // no more siblings: the fold reached the root set
                let last = proof.nodes.last().map_or(top.index, |node| node.index);
                let boundary = flat::right_span(top.index).max(flat::right_span(last)) + 2;
                let mut roots = Vec::new();
                for root_index in flat::full_roots(boundary) {
                    if root_index == top.index {
                        roots.push(top.clone());
                    } else if let Some(node) =
                        proof.nodes.iter().find(|node| node.index == root_index)
                    {
                        roots.push(node.clone());
                    } else if self.bitfield.tree_get(root_index) {
                        roots.push(self.storage.node(root_index).await?);
                    } else {
                        return Err(Error::InvalidProof);
                    }
                }
                let checksum = hash_roots(&roots);
                match &proof.signature {
                    Some(signature) => {
                        let key = VerificationKey::try_from(self.key.as_slice())
                            .map_err(|_| Error::InvalidProof)?;
                        key.verify(signature, &checksum)
                            .map_err(|_| Error::InvalidProof)?;
                        signed = Some((boundary / 2 - 1, signature.clone()));
                    }
                    None => {
                        if self.live && self.length > 0 {
                            return Err(Error::MissingSignature);
                        }
                        if checksum != self.key {
                            return Err(Error::ChecksumFailed);
                        }
                    }
                }
                for root in &roots {
                    if writes.iter().all(|node| node.index != root.index) {
                        writes.push(root.clone());
                    }
                }
                extension = Some((boundary, roots));
                break;
            };
            writes.push(sibling.clone());
            let (left, right) = if sibling.index < top.index {
                (sibling, top)
            } else {
                (top, sibling)
            };
            top = Node::new(
                flat::parent(left.index),
                hash_parent(&left, &right),
                left.size + right.size,
            );
            writes.push(top.clone());
        }

        // verified data may never contradict committed nodes
        for node in &writes {
            if self.bitfield.tree_get(node.index) {
                let committed = self.storage.node(node.index).await?;
                if committed.hash != node.hash || committed.size != node.size {
                    if signed.is_some() {
                        warn!(
                            index = node.index,
                            "signed proof contradicts committed node; poisoning feed",
                        );
                        self.poisoned = true;
                        return Err(Error::Critical);
                    }
                    return Err(Error::ChecksumFailed);
                }
            }
        }

        for node in &writes {
            self.storage.put_node(node).await?;
        }
        if !self.indexing {
            let (offset, _) = self.storage.offset_and_size(index, &writes).await?;
            self.storage.put_data(offset, &data).await?;
        }
        if let Some((slot, signature)) = &signed {
            self.storage.put_signature(*slot, signature).await?;
        }

        self.bitfield.set(index, true);
        for node in &writes {
            tree_index::set(&mut self.bitfield, node.index);
        }
        if signed.is_some() {
            self.live = true;
        }
        if let Some((boundary, roots)) = extension {
            if boundary / 2 > self.length {
                self.length = boundary / 2;
                self.byte_length = roots.iter().map(|root| root.size).sum();
                self.merkle = Generator::from_roots(roots);
            }
        }
        trace!(index, length = self.length, "put committed");
        Ok(Some(Have {
            start: index,
            length: 1,
        }))
    }
}

/// Runs the post-commit steps of a successful write: growth announcement,
/// waiter/selection settlement, peer notification, and a coalesced bitfield
/// flush.
fn after_mutation<T: RandomAccess>(
    shared: &Arc<Shared<T>>,
    core: &mut Core<T>,
    have: Option<Have>,
) {
    let grown = {
        let previous = *shared.growth.borrow();
        let current = FeedLength {
            length: core.length,
            byte_length: core.byte_length,
        };
        shared.growth.send_replace(current);
        current.byte_length > previous.byte_length
    };
    core.settle(have, grown);
    schedule_flush(shared, core);
}

/// Last-one-wins flush scheduling: at most one flusher task runs; new
/// requests while it runs are absorbed because it drains the then-current
/// dirty queue before exiting.
fn schedule_flush<T: RandomAccess>(shared: &Arc<Shared<T>>, core: &mut Core<T>) {
    if core.flushing || !core.bitfield.has_updates() {
        return;
    }
    core.flushing = true;
    let shared = Arc::downgrade(shared);
    tokio::spawn(async move {
        loop {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let mut core = shared.core.lock().await;
            match core.bitfield.next_update() {
                Some((page_no, record)) => {
                    if let Err(e) = core.storage.put_bitfield_page(page_no, &record).await {
                        warn!(page = page_no, error = %e, "bitfield flush failed");
                        core.bitfield.requeue(page_no);
                        core.last_flush_error = Some(e);
                        core.flushing = false;
                        return;
                    }
                }
                None => {
                    core.flushing = false;
                    return;
                }
            }
        }
    });
}

async fn load_roots<T: RandomAccess>(
    storage: &mut Storage<T>,
    boundary: u64,
) -> Result<Vec<Node>> {
    let indices = flat::full_roots(boundary);
    let mut roots = Vec::with_capacity(indices.len());
    for index in indices {
        roots.push(storage.node(index).await?);
    }
    Ok(roots)
}
