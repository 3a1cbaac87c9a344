//! The single connection to the store and the serial worker every operation funnels through.
//!
//! A [`Channel`] owns one dedicated OS thread running a current-thread tokio runtime. The thread
//! holds the only `SqliteConnection`; callers hand it work as closures that borrow the
//! connection for the duration of one operation. Operations run one at a time in submission
//! order. Reads and writes share that single queue, so there is no real read concurrency.

use std::{
    fmt::{self, Display, Formatter},
    fs,
    future::Future,
    path::PathBuf,
    pin::Pin,
    str::FromStr,
    sync::Arc,
    task::{Context, Poll},
    thread::{self, ThreadId},
};

use common::config::{FileExpectation, StoreConfig, MEMORY_LOCATION};
use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection};
use tokio::runtime::{Builder, Handle};
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::error::{Result, StoreError};

const WORKER_THREAD_NAME: &str = "ig-cache-channel";

/// Where the store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Memory,
    File {
        path: PathBuf,
        expectation: FileExpectation,
    },
}

impl Location {
    /// Builds a file location from a `file://` URL.
    pub fn file(url: &str, expectation: FileExpectation) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|error| {
            StoreError::invalid_request(format!("invalid store URL {url:?}: {error}"))
        })?;

        if parsed.scheme() != "file" {
            return Err(StoreError::invalid_request(format!(
                "store URL {url:?} must use the file:// scheme"
            )));
        }

        let path = parsed.to_file_path().map_err(|()| {
            StoreError::invalid_request(format!("store URL {url:?} does not name a local file"))
        })?;

        Ok(Self::File { path, expectation })
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        if config.location == MEMORY_LOCATION {
            Ok(Self::Memory)
        } else {
            Self::file(&config.location, config.expectation)
        }
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str(MEMORY_LOCATION),
            Self::File { path, .. } => write!(f, "{}", path.display()),
        }
    }
}

/// Work handed to the worker. It always resolves; results travel through a oneshot.
type Job = Box<dyn for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, ()> + Send>;

enum Command {
    Run(Job),
    Close(oneshot::Sender<()>),
}

#[derive(Clone, Copy, Debug)]
enum Access {
    Shared,
    Exclusive,
}

impl Access {
    fn begin_statement(self) -> &'static str {
        match self {
            Self::Shared => "BEGIN DEFERRED",
            Self::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

/// Handle to an open store. Cloning is cheap; every clone feeds the same worker.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

struct Inner {
    sender: mpsc::UnboundedSender<Command>,
    worker: ThreadId,
}

impl Channel {
    /// Opens the store and waits until foreign keys are enforced on the new connection.
    pub async fn open(location: Location) -> Result<Self> {
        let (channel, ready) = Self::spawn(location)?;
        ready.await.unwrap_or(Err(StoreError::SessionExpired))?;
        Ok(channel)
    }

    /// Blocking flavour of [`Channel::open`]. Must not be called from inside an async runtime.
    pub fn open_blocking(location: Location) -> Result<Self> {
        let (channel, ready) = Self::spawn(location)?;
        ready
            .blocking_recv()
            .unwrap_or(Err(StoreError::SessionExpired))?;
        Ok(channel)
    }

    fn spawn(location: Location) -> Result<(Self, oneshot::Receiver<Result<()>>)> {
        let (sender, commands) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_owned())
            .spawn(move || run_worker(location, commands, ready_tx))
            .map_err(|error| StoreError::Storage {
                message: "failed to spawn the store worker thread".into(),
                source: Some(sqlx::Error::Io(error)),
            })?;

        let inner = Inner {
            sender,
            worker: handle.thread().id(),
        };

        Ok((
            Self {
                inner: Arc::new(inner),
            },
            ready_rx,
        ))
    }

    /// Runs `body` inside a deferred transaction.
    ///
    /// Reads are queued behind the same lock as writes; there is no read parallelism.
    pub fn read<T, F>(&self, body: F) -> Pending<T>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>> + Send + 'static,
    {
        self.schedule(Some(Access::Shared), body)
    }

    /// Runs `body` inside an exclusive transaction.
    pub fn write<T, F>(&self, body: F) -> Pending<T>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>> + Send + 'static,
    {
        self.schedule(Some(Access::Exclusive), body)
    }

    /// Runs `body` directly on the connection, outside any transaction. Meant for statements
    /// that refuse to run inside one, such as `VACUUM`.
    pub fn unrestricted<T, F>(&self, body: F) -> Pending<T>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>> + Send + 'static,
    {
        self.schedule(None, body)
    }

    fn schedule<T, F>(&self, access: Option<Access>, body: F) -> Pending<T>
    where
        T: Send + 'static,
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>> + Send + 'static,
    {
        if self.on_worker() {
            return Pending::failed(StoreError::invalid_request(
                "reentrant access: a store operation cannot schedule another one on its own channel",
            ));
        }

        let (tx, rx) = oneshot::channel();
        let job = job(move |connection| {
            Box::pin(async move {
                let outcome = match access {
                    Some(access) => transact(connection, access, body).await,
                    None => body(connection).await,
                };

                if tx.send(outcome).is_err() {
                    debug!("Store operation completed after its caller went away");
                }
            })
        });

        match self.inner.sender.send(Command::Run(job)) {
            Ok(()) => Pending::scheduled(rx),
            Err(_) => Pending::failed(StoreError::SessionExpired),
        }
    }

    fn on_worker(&self) -> bool {
        thread::current().id() == self.inner.worker
    }

    pub fn is_closed(&self) -> bool {
        self.inner.sender.is_closed()
    }

    /// Rebuilds the store file, reclaiming free pages.
    pub fn vacuum(&self) -> Pending<()> {
        self.unrestricted(|connection| {
            Box::pin(async move {
                sqlx::query("VACUUM")
                    .persistent(false)
                    .execute(connection)
                    .await
                    .map_err(StoreError::storage("VACUUM failed"))?;
                Ok(())
            })
        })
    }

    /// Lets SQLite refresh the statistics its query planner relies on.
    pub fn optimize(&self) -> Pending<()> {
        self.unrestricted(|connection| {
            Box::pin(async move {
                sqlx::query("PRAGMA optimize")
                    .persistent(false)
                    .execute(connection)
                    .await
                    .map_err(StoreError::storage("PRAGMA optimize failed"))?;
                Ok(())
            })
        })
    }

    /// Names of every table in the store, sorted.
    pub fn tables(&self) -> Pending<Vec<String>> {
        self.unrestricted(|connection| {
            Box::pin(async move {
                sqlx::query_scalar::<_, String>(
                    "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
                )
                .fetch_all(connection)
                .await
                .map_err(StoreError::query("failed to list the store tables"))
            })
        })
    }

    /// Closes the connection once every operation queued before this call has finished.
    /// Operations queued afterwards, on any clone, fail with [`StoreError::SessionExpired`].
    pub async fn close(self) {
        if let Some(done) = self.request_close() {
            let _ = done.await;
        }
    }

    /// Blocking flavour of [`Channel::close`]. Must not be called from inside an async runtime.
    pub fn close_blocking(self) {
        if let Some(done) = self.request_close() {
            let _ = done.blocking_recv();
        }
    }

    fn request_close(&self) -> Option<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        if self.inner.sender.send(Command::Close(tx)).is_err() {
            return None;
        }

        // The worker can't wait for itself
        if self.on_worker() {
            None
        } else {
            Some(rx)
        }
    }
}

/// Pins down the higher-ranked signature of a job closure.
fn job<F>(f: F) -> Job
where
    F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, ()> + Send + 'static,
{
    Box::new(f)
}

async fn transact<T, F>(connection: &mut SqliteConnection, access: Access, body: F) -> Result<T>
where
    F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>>,
{
    sqlx::query(access.begin_statement())
        .execute(&mut *connection)
        .await
        .map_err(StoreError::storage("failed to begin a transaction"))?;

    match body(&mut *connection).await {
        Ok(value) => {
            if let Err(error) = sqlx::query("COMMIT").execute(&mut *connection).await {
                fatal(&format!("Failed to commit a store transaction: {error}"));
            }
            Ok(value)
        }
        Err(error) => {
            if let Err(rollback_error) = sqlx::query("ROLLBACK").execute(&mut *connection).await {
                fatal(&format!(
                    "Failed to roll back a store transaction after `{error}`: {rollback_error}"
                ));
            }
            Err(error)
        }
    }
}

/// The store may be in an indeterminate state. Nothing else may touch it.
fn fatal(message: &str) -> ! {
    error!("{message}");
    log::logger().flush();
    std::process::abort()
}

fn run_worker(
    location: Location,
    mut commands: mpsc::UnboundedReceiver<Command>,
    ready: oneshot::Sender<Result<()>>,
) {
    let runtime = match Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            let _ = ready.send(Err(StoreError::Storage {
                message: "failed to start the store worker runtime".into(),
                source: Some(sqlx::Error::Io(error)),
            }));
            return;
        }
    };

    runtime.block_on(async move {
        let mut connection = match connect(&location).await {
            Ok(connection) => connection,
            Err(error) => {
                let _ = ready.send(Err(error));
                return;
            }
        };

        info!("Opened store at {location}");
        if ready.send(Ok(())).is_err() {
            debug!("Store opener went away before the connection was ready");
        }

        while let Some(command) = commands.recv().await {
            match command {
                Command::Run(job) => job(&mut connection).await,
                Command::Close(done) => {
                    commands.close();
                    close_connection(connection).await;
                    let _ = done.send(());
                    return;
                }
            }
        }

        // Every channel handle was dropped
        close_connection(connection).await;
    });
}

async fn connect(location: &Location) -> Result<SqliteConnection> {
    let options = match location {
        Location::Memory => SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(StoreError::storage("invalid in-memory store options"))?,
        Location::File { path, expectation } => {
            let exists = path.exists();
            match expectation {
                FileExpectation::MustExist if !exists => {
                    return Err(StoreError::invalid_request(format!(
                        "store file {} was expected to exist",
                        path.display()
                    )))
                }
                FileExpectation::MustNotExist if exists => {
                    return Err(StoreError::invalid_request(format!(
                        "store file {} was expected not to exist",
                        path.display()
                    )))
                }
                _ => (),
            }

            if !exists {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(|error| StoreError::Storage {
                        message: format!("failed to create directory {}", parent.display())
                            .into(),
                        source: Some(sqlx::Error::Io(error)),
                    })?;
                }
            }

            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(*expectation != FileExpectation::MustExist)
        }
    }
    .foreign_keys(true);

    // sqlx switches extended result codes on while establishing the connection and fails the
    // connect if it can't
    let mut connection = options
        .connect()
        .await
        .map_err(StoreError::storage(format!("failed to open the store at {location}")))?;

    let foreign_keys = sqlx::query_scalar::<_, i64>("PRAGMA foreign_keys")
        .fetch_one(&mut connection)
        .await;

    match foreign_keys {
        Ok(1) => Ok(connection),
        Ok(value) => {
            close_connection(connection).await;
            Err(StoreError::invalid_response(format!(
                "foreign key enforcement could not be enabled (PRAGMA foreign_keys = {value})"
            )))
        }
        Err(error) => {
            close_connection(connection).await;
            Err(StoreError::Query {
                message: "failed to verify foreign key enforcement".into(),
                source: Some(error),
            })
        }
    }
}

async fn close_connection(mut connection: SqliteConnection) {
    // The hard close is only reachable before `close`, which consumes the connection. A failed
    // `close` leaves nothing to retry, so it goes straight to abort.
    let outcome = match connection.clear_cached_statements().await {
        Ok(()) => connection.close().await,
        Err(error) => {
            warn!("Failed to finalize cached statements ({error}), forcing the store closed");
            connection.close_hard().await
        }
    };

    match outcome {
        Ok(()) => info!("Closed store"),
        Err(error) => fatal(&format!("Store connection refused to close: {error}")),
    }
}

enum PendingState<T> {
    Scheduled(oneshot::Receiver<Result<T>>),
    Failed(Option<StoreError>),
}

/// An operation already queued on a [`Channel`].
///
/// The work runs whether or not this handle is polled; dropping it only discards the result.
/// Await it, block on it with [`Pending::wait`], or route the result to a callback with
/// [`Pending::deliver`]. A channel torn down before the work finishes resolves to
/// [`StoreError::SessionExpired`].
#[must_use = "the operation runs regardless, but its result is lost unless awaited"]
pub struct Pending<T> {
    state: PendingState<T>,
}

impl<T> Pending<T> {
    fn scheduled(rx: oneshot::Receiver<Result<T>>) -> Self {
        Self {
            state: PendingState::Scheduled(rx),
        }
    }

    fn failed(error: StoreError) -> Self {
        Self {
            state: PendingState::Failed(Some(error)),
        }
    }

    /// Blocks the current thread until the operation finishes. Must not be called from inside
    /// an async runtime.
    pub fn wait(self) -> Result<T> {
        match self.state {
            PendingState::Scheduled(rx) => rx
                .blocking_recv()
                .unwrap_or(Err(StoreError::SessionExpired)),
            PendingState::Failed(error) => Err(error.unwrap_or(StoreError::SessionExpired)),
        }
    }

    /// Invokes `callback` exactly once, on `handle`, with the outcome of the operation.
    pub fn deliver<C>(self, handle: &Handle, callback: C)
    where
        T: Send + 'static,
        C: FnOnce(Result<T>) + Send + 'static,
    {
        handle.spawn(async move { callback(self.await) });
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            PendingState::Scheduled(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(StoreError::SessionExpired))),
            PendingState::Failed(error) => {
                Poll::Ready(Err(error.take().unwrap_or(StoreError::SessionExpired)))
            }
        }
    }
}
