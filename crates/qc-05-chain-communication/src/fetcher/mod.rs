//! # Block Fetcher
//!
//! Turns hash announcements into committed catch-up bundles.
//!
//! ## Pipeline
//!
//! ```text
//! notify ──► notified ──(arrive timeout)──► fetching ──do_task──► finished
//!                │                                                   │
//!                └────────────── do_filter (downloader) ─────────────┤
//!                                                                    ▼
//!                                               import queue (ascending height)
//!                                                                    │
//!                                                     save_block + observer
//! ```
//!
//! All state lives in [`FetcherState`] and is touched only by the fetcher
//! task. Callers talk to it through a cloneable [`FetcherHandle`].

pub mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use shared_types::{to_hex, CatchupBundle, Hash};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::config::FetcherConfig;
use crate::domain::CommError;
use crate::ports::{BlockImportObserver, ChainReader, CommunicationExecutable, FetchRequest};

pub use state::{Announce, FetcherState, NotifyOutcome};

const COMMAND_BUFFER: usize = 64;

enum Command {
    Notify(Announce),
    Task {
        peer_id: String,
        bundle: CatchupBundle,
        time: Instant,
    },
    Filter {
        peer_id: String,
        bundles: Vec<CatchupBundle>,
        reply: oneshot::Sender<Vec<CatchupBundle>>,
    },
}

/// Entry points into a running fetcher.
#[derive(Clone)]
pub struct FetcherHandle {
    tx: mpsc::Sender<Command>,
    running: Arc<AtomicBool>,
}

impl FetcherHandle {
    /// `peer_id` announced `hash` at `number`; `request` asks it for the bundle.
    pub async fn notify(
        &self,
        peer_id: &str,
        hash: Hash,
        number: u64,
        request: Arc<dyn FetchRequest>,
    ) {
        let announce = Announce {
            hash,
            number,
            peer_id: peer_id.to_string(),
            time: Instant::now(),
            request,
        };
        self.send(Command::Notify(announce)).await;
    }

    /// `peer_id` delivered a requested bundle.
    pub async fn do_task(&self, peer_id: &str, bundle: CatchupBundle) {
        self.send(Command::Task {
            peer_id: peer_id.to_string(),
            bundle,
            time: Instant::now(),
        })
        .await;
    }

    /// Hand downloader bundles to the fetcher. Returns the ones it did not
    /// take; everything is returned when the fetcher is not running.
    pub async fn do_filter(&self, peer_id: &str, bundles: Vec<CatchupBundle>) -> Vec<CatchupBundle> {
        if !self.is_running() {
            return bundles;
        }
        let (reply, rx) = oneshot::channel();
        let command = Command::Filter {
            peer_id: peer_id.to_string(),
            bundles,
            reply,
        };
        match self.tx.send(command).await {
            Ok(()) => rx.await.unwrap_or_default(),
            Err(mpsc::error::SendError(Command::Filter { bundles, .. })) => bundles,
            Err(_) => Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn send(&self, command: Command) {
        if !self.is_running() {
            debug!("block fetcher not running, command dropped");
            return;
        }
        if self.tx.send(command).await.is_err() {
            debug!("block fetcher terminated");
        }
    }
}

pub struct BlockFetcher {
    config: FetcherConfig,
    chain: Arc<dyn ChainReader>,
    handle: FetcherHandle,
    commands: Mutex<Option<mpsc::Receiver<Command>>>,
    observer: RwLock<Option<Arc<dyn BlockImportObserver>>>,
    quit_tx: watch::Sender<bool>,
}

impl BlockFetcher {
    pub fn new(config: FetcherConfig, chain: Arc<dyn ChainReader>) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let (quit_tx, _) = watch::channel(false);
        Self {
            config,
            chain,
            handle: FetcherHandle {
                tx,
                running: Arc::new(AtomicBool::new(false)),
            },
            commands: Mutex::new(Some(rx)),
            observer: RwLock::new(None),
            quit_tx,
        }
    }

    pub fn handle(&self) -> FetcherHandle {
        self.handle.clone()
    }

    /// Called with every imported bundle. Must be set before `start`.
    pub fn set_import_observer(&self, observer: Arc<dyn BlockImportObserver>) {
        *self.observer.write() = Some(observer);
    }
}

impl CommunicationExecutable for BlockFetcher {
    fn start(&self) -> Result<(), CommError> {
        let commands = self.commands.lock().take().ok_or(CommError::AlreadyStarted)?;
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let task = FetcherTask {
            state: FetcherState::new(self.config.clone()),
            chain: self.chain.clone(),
            observer: self.observer.read().clone(),
            commands,
            done_tx,
            done_rx,
            quit: self.quit_tx.subscribe(),
        };
        self.handle.running.store(true, Ordering::SeqCst);
        tokio::spawn(task.run());
        info!("block fetcher started");
        Ok(())
    }

    fn stop(&self) {
        self.handle.running.store(false, Ordering::SeqCst);
        let _ = self.quit_tx.send(true);
    }
}

struct FetcherTask {
    state: FetcherState,
    chain: Arc<dyn ChainReader>,
    observer: Option<Arc<dyn BlockImportObserver>>,
    commands: mpsc::Receiver<Command>,
    done_tx: mpsc::UnboundedSender<Hash>,
    done_rx: mpsc::UnboundedReceiver<Hash>,
    quit: watch::Receiver<bool>,
}

impl FetcherTask {
    async fn run(mut self) {
        loop {
            self.state.expire(Instant::now());
            self.import_ready();

            let deadline = self.state.next_fetch_deadline();
            let fetch_timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = async { let _ = self.quit.wait_for(|quit| *quit).await; } => break,
                Some(command) = self.commands.recv() => self.handle_command(command),
                _ = fetch_timer => self.fetch_due(),
                Some(hash) = self.done_rx.recv() => self.state.done(&hash),
            }
        }
        debug!("block fetcher stopped");
    }

    fn chain_height(&self) -> u64 {
        self.chain.current_block().number()
    }

    fn handle_command(&mut self, command: Command) {
        let height = self.chain_height();
        let chain = self.chain.clone();
        let has_block = move |hash: &Hash| chain.get_block_by_hash(hash).is_some();

        match command {
            Command::Notify(announce) => {
                let outcome = self.state.notify(announce, height);
                if outcome != NotifyOutcome::Accepted {
                    debug!(?outcome, "announcement ignored");
                }
            }
            Command::Task {
                peer_id,
                bundle,
                time,
            } => {
                self.state.deliver(&peer_id, bundle, time, height, has_block);
            }
            Command::Filter {
                peer_id,
                bundles,
                reply,
            } => {
                let remaining = self.state.filter(&peer_id, bundles, height, has_block);
                let _ = reply.send(remaining);
            }
        }
    }

    fn fetch_due(&mut self) {
        let chain = self.chain.clone();
        let requests = self
            .state
            .schedule_fetches(Instant::now(), move |hash| chain.get_block_by_hash(hash).is_some());
        for (hash, request) in requests {
            tokio::spawn(async move {
                debug!(hash = %to_hex(&hash), "fetching announced block");
                if let Err(e) = request.request().await {
                    debug!(hash = %to_hex(&hash), error = %e, "fetch request failed");
                }
            });
        }
    }

    fn import_ready(&mut self) {
        let chain = self.chain.clone();
        let ready = self
            .state
            .pop_importable(self.chain_height(), move |hash| {
                chain.get_block_by_hash(hash).is_some()
            });

        for (peer_id, bundle) in ready {
            let chain = self.chain.clone();
            let observer = self.observer.clone();
            let done_tx = self.done_tx.clone();
            tokio::spawn(async move {
                let hash = bundle.hash();
                import_bundle(chain.as_ref(), observer.as_deref(), &peer_id, bundle);
                let _ = done_tx.send(hash);
            });
        }
    }
}

fn import_bundle(
    chain: &dyn ChainReader,
    observer: Option<&dyn BlockImportObserver>,
    peer_id: &str,
    bundle: CatchupBundle,
) {
    let block = &bundle.block;
    if chain.get_block_by_hash(&block.parent_hash()).is_none() {
        error!(
            peer = %peer_id,
            number = block.number(),
            parent = %to_hex(&block.parent_hash()),
            "unknown parent of propagated block"
        );
        return;
    }
    if let Err(e) = chain.save_block(block, &bundle.seen_commits) {
        error!(peer = %peer_id, number = block.number(), error = %e, "propagated block import failed");
        return;
    }
    info!(number = block.number(), hash = %to_hex(&block.hash()), "fetcher saved block");

    if let Some(observer) = observer {
        observer.on_block_imported(bundle);
    }
}
