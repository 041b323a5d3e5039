//! Daemon service: accept loop, request routing, and handlers.
//!
//! Every request runs on its own thread and operates directly on the
//! file-backed transaction store; the advisory lock is the only
//! serialization point, and no handler holds it across network I/O.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::Config;
use crate::pkg::{Dpkg, PackageManager};
use crate::txn::{ConsumerStore, StoreError, TxnState};

use super::http::{self, HttpError, Request, Response};
use super::ops::{self, OpError};

/// Upper bound on concurrently served connections.
const MAX_CONNECTIONS: usize = 64;
/// How long shutdown waits for in-flight handlers.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct Server {
    cfg: Config,
    ctx: Arc<Ctx>,
}

struct Ctx {
    cfg: Config,
    consumer: ConsumerStore,
    manager: Box<dyn PackageManager>,
}

pub struct ServerHandle {
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.join.join();
    }
}

impl Server {
    pub fn new(cfg: Config) -> Result<Self, StoreError> {
        let manager = Box::new(Dpkg::from_config(&cfg));
        Self::with_manager(cfg, manager)
    }

    pub fn with_manager(
        cfg: Config,
        manager: Box<dyn PackageManager>,
    ) -> Result<Self, StoreError> {
        let consumer = ConsumerStore::open(&cfg.state_dir)?;
        let ctx = Arc::new(Ctx {
            cfg: cfg.clone(),
            consumer,
            manager,
        });
        Ok(Self { cfg, ctx })
    }

    /// Bind the listen address and start the accept loop on its own
    /// thread.
    pub fn start(self) -> crate::Result<ServerHandle> {
        std::fs::create_dir_all(&self.cfg.pool_dir).map_err(StoreError::from)?;
        std::fs::create_dir_all(&self.cfg.installed_dir).map_err(StoreError::from)?;

        let listener = TcpListener::bind(self.cfg.bind_addr()).map_err(StoreError::from)?;
        let local_addr = listener.local_addr().map_err(StoreError::from)?;
        tracing::info!(%local_addr, "groom agent listening");

        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_shutdown = Arc::clone(&shutdown);
        let ctx = self.ctx;
        let join = thread::spawn(move || run_accept_loop(listener, ctx, accept_shutdown));

        Ok(ServerHandle {
            shutdown,
            join,
            local_addr,
        })
    }
}

/// Run the daemon until SIGTERM/SIGINT.
pub fn run(cfg: Config) -> crate::Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown));
    let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown));

    let handle = Server::new(cfg)?.start()?;
    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
    }
    tracing::info!("shutdown signal received");
    handle.shutdown();
    tracing::info!("groom agent stopped");
    Ok(())
}

struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn try_acquire(active: &Arc<AtomicUsize>) -> Option<Self> {
        let mut current = active.load(Ordering::Acquire);
        loop {
            if current >= MAX_CONNECTIONS {
                return None;
            }
            match active.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(Self {
                        active: Arc::clone(active),
                    });
                }
                Err(next) => current = next,
            }
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

fn run_accept_loop(listener: TcpListener, ctx: Arc<Ctx>, shutdown: Arc<AtomicBool>) {
    if let Err(err) = listener.set_nonblocking(true) {
        tracing::error!("failed to set listener nonblocking: {err}");
        return;
    }
    let active = Arc::new(AtomicUsize::new(0));

    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Some(guard) = ConnectionGuard::try_acquire(&active) {
                    let ctx = Arc::clone(&ctx);
                    thread::spawn(move || {
                        let _guard = guard;
                        handle_connection(stream, &ctx);
                    });
                } else {
                    let mut stream = stream;
                    let _ = Response::text(503, "connection limit reached").write_to(&mut stream);
                }
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(25));
            }
            Err(err) => {
                tracing::warn!("accept error: {err}");
                thread::sleep(Duration::from_millis(25));
            }
        }
    }

    // Stop accepting, then give in-flight handlers a bounded grace.
    let deadline = Instant::now() + SHUTDOWN_GRACE;
    while active.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(25));
    }
}

fn handle_connection(mut stream: TcpStream, ctx: &Ctx) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(30)));
    let _ = stream.set_nodelay(true);

    let response = match http::read_request(&mut stream, ctx.cfg.max_upload_bytes) {
        Ok(request) => {
            let response = route(ctx, &request);
            tracing::debug!(
                method = %request.method,
                path = %request.path,
                status = response.status(),
                "request"
            );
            response
        }
        Err(HttpError::BodyTooLarge { limit }) => {
            Response::text(413, format!("request body exceeds {limit} bytes"))
        }
        Err(HttpError::Malformed(reason)) => Response::text(400, reason),
        Err(HttpError::Io(err)) => {
            tracing::debug!("dropping connection: {err}");
            return;
        }
    };
    if let Err(err) = response.write_to(&mut stream) {
        tracing::debug!("failed to write response: {err}");
    }
}

fn route(ctx: &Ctx, req: &Request) -> Response {
    let method = req.method.as_str();
    let path = req.path.as_str();

    if path == "/health" {
        return match method {
            "GET" => Response::json(200, &serde_json::json!({"status": "healthy"})),
            _ => Response::text(405, "method not allowed"),
        };
    }
    if let Some(name) = strip_route(path, "/pool") {
        return match method {
            "GET" => handle_list_pool(ctx),
            "POST" => handle_upload_pool(ctx, name, &req.body),
            "DELETE" if name.is_empty() => handle_clear_pool(ctx),
            "DELETE" => handle_delete_pool_file(ctx, name),
            _ => Response::text(405, "method not allowed"),
        };
    }
    if let Some(name) = strip_route(path, "/installed") {
        return match method {
            "GET" if name.is_empty() => handle_list_installed(ctx),
            "GET" => Response::text(501, "not implemented"),
            "POST" => handle_stage_install(ctx, name),
            "DELETE" if name.is_empty() => handle_stage_purge(ctx),
            "DELETE" => handle_stage_remove(ctx, name),
            _ => Response::text(405, "method not allowed"),
        };
    }
    if path == "/transaction" {
        return match method {
            "GET" => handle_get_transaction(ctx),
            "POST" => handle_commit_transaction(ctx),
            "DELETE" => handle_clear_transaction(ctx),
            _ => Response::text(405, "method not allowed"),
        };
    }
    if path == "/transaction/reset" {
        return match method {
            "POST" => handle_reset_transaction(ctx),
            _ => Response::text(405, "method not allowed"),
        };
    }
    Response::text(404, "not found")
}

/// `/pool` and `/pool/` address the collection; `/pool/{name}` one member.
fn strip_route<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if path == prefix {
        return Some("");
    }
    path.strip_prefix(prefix)?.strip_prefix('/')
}

// =============================================================================
// Pool handlers
// =============================================================================

fn handle_list_pool(ctx: &Ctx) -> Response {
    match ops::list_pool(&ctx.cfg.pool_dir) {
        Ok(names) => Response::json(200, &names),
        Err(err) => fail("failed to list pool", &err),
    }
}

fn handle_upload_pool(ctx: &Ctx, name: &str, body: &[u8]) -> Response {
    if name.is_empty() {
        return Response::text(400, "filename required");
    }
    if let Err(err) = ops::validate_filename(name) {
        return op_error(err);
    }
    match ops::upload_pool_file(&ctx.cfg.pool_dir, name, body) {
        Ok(()) => Response::empty(201),
        Err(err) => fail("failed to store pool upload", &err),
    }
}

fn handle_delete_pool_file(ctx: &Ctx, name: &str) -> Response {
    if let Err(err) = ops::validate_filename(name) {
        return op_error(err);
    }
    // Best-effort guard: refuse deleting a file the staged plan still
    // references.
    let path = ops::pool_path(&ctx.cfg.pool_dir, name);
    match ctx.consumer.operations() {
        Ok(ops) if ops.references_pool_file(&path) => {
            return op_error(OpError::PoolFileStaged(name.to_string()));
        }
        Ok(_) => {}
        Err(err) if err.is_not_found() => {}
        Err(err) => return fail("failed to read transaction state", &err),
    }
    match ops::delete_pool_file(&ctx.cfg.pool_dir, name) {
        Ok(()) => Response::empty(200),
        Err(err) => fail("failed to delete pool file", &err),
    }
}

fn handle_clear_pool(ctx: &Ctx) -> Response {
    match ops::clear_pool(&ctx.cfg.pool_dir) {
        Ok(()) => Response::empty(200),
        Err(err) => fail("failed to clear pool", &err),
    }
}

// =============================================================================
// Installed handlers
// =============================================================================

fn handle_list_installed(ctx: &Ctx) -> Response {
    match ops::list_installed(&ctx.cfg.installed_dir) {
        Ok(names) => Response::json(200, &names),
        Err(err) => fail("failed to list installed packages", &err),
    }
}

fn handle_stage_install(ctx: &Ctx, name: &str) -> Response {
    if name.is_empty() {
        return Response::text(400, "filename required");
    }
    if let Err(err) = ops::validate_filename(name) {
        return op_error(err);
    }
    let source = ops::pool_path(&ctx.cfg.pool_dir, name);
    if !source.is_file() {
        return op_error(OpError::PoolFileNotFound(name.to_string()));
    }

    let staged = source.clone();
    match ctx.consumer.update(move |ops| ops.stage_install(staged)) {
        Ok(_) => {
            tracing::info!(file = name, "staged install");
            Response::empty(202)
        }
        Err(err) => store_error("failed to stage install", err),
    }
}

fn handle_stage_remove(ctx: &Ctx, name: &str) -> Response {
    if let Err(err) = ops::validate_filename(name) {
        return op_error(err);
    }
    let installed = ctx.cfg.installed_dir.join(name);
    if !installed.is_file() {
        return op_error(OpError::InstalledFileNotFound(name.to_string()));
    }

    let package = match ctx.manager.package_name(&installed) {
        Ok(package) => package,
        Err(err) => return fail("failed to read package info", &err),
    };
    if package == ctx.cfg.self_package {
        return op_error(OpError::SelfProtected);
    }

    match ctx.consumer.update(move |ops| ops.stage_remove(package)) {
        Ok(_) => {
            tracing::info!(file = name, "staged removal");
            Response::empty(202)
        }
        Err(err) => store_error("failed to stage removal", err),
    }
}

fn handle_stage_purge(ctx: &Ctx) -> Response {
    let packages = match ops::purge_candidates(
        &ctx.cfg.installed_dir,
        ctx.manager.as_ref(),
        &ctx.cfg.self_package,
    ) {
        Ok(packages) => packages,
        Err(err) => return fail("failed to scan installed packages", &err),
    };
    if packages.is_empty() {
        return Response::text(200, "no packages to purge");
    }

    let count = packages.len();
    let result = ctx.consumer.update(move |ops| {
        for package in packages {
            ops.stage_remove(package);
        }
    });
    match result {
        Ok(_) => {
            tracing::info!(count, "staged purge");
            Response::text(202, format!("staged removal of {count} packages"))
        }
        Err(err) => store_error("failed to stage purge", err),
    }
}

// =============================================================================
// Transaction handlers
// =============================================================================

#[derive(Serialize)]
struct TransactionStatus {
    state: TxnState,
    packages_to_install: Vec<String>,
    packages_to_remove: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn handle_get_transaction(ctx: &Ctx) -> Response {
    let status = match ctx.consumer.operations() {
        Ok(ops) => TransactionStatus {
            state: ops.state(),
            packages_to_install: ops
                .packages_to_install()
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
            packages_to_remove: ops.packages_to_remove().to_vec(),
            error: ops.error().map(str::to_string),
        },
        Err(err) if err.is_not_found() => TransactionStatus {
            state: TxnState::Prepare,
            packages_to_install: Vec::new(),
            packages_to_remove: Vec::new(),
            error: None,
        },
        Err(err) => return fail("failed to read transaction state", &err),
    };
    Response::json(200, &status)
}

fn handle_commit_transaction(ctx: &Ctx) -> Response {
    let ops = match ctx.consumer.operations() {
        Ok(ops) => ops,
        Err(err) if err.is_not_found() => {
            return Response::text(400, "cannot commit an empty transaction plan");
        }
        Err(err) => return fail("failed to read transaction state", &err),
    };

    if ops.state() != TxnState::Prepare {
        return Response::text(
            409,
            format!("transaction not in Prepare state (current state: {})", ops.state()),
        );
    }
    if ops.is_empty() {
        return Response::text(200, "transaction plan is empty, nothing to commit");
    }

    tracing::info!("committing transaction, launching executor");
    match spawn_executor(&ctx.cfg) {
        Ok(()) => Response::text(202, "executor launched to apply the transaction"),
        Err(err) => fail("failed to launch executor", &err),
    }
}

fn handle_clear_transaction(ctx: &Ctx) -> Response {
    match ctx.consumer.clear() {
        Ok(_) => Response::empty(200),
        Err(StoreError::ExecutionInProgress) => {
            Response::text(409, "cannot clear a transaction that is in progress")
        }
        Err(StoreError::StateConflict { state }) => Response::text(
            409,
            format!(
                "transaction is {state}; acknowledge via POST /transaction/reset"
            ),
        ),
        Err(err) => fail("failed to clear transaction", &err),
    }
}

fn handle_reset_transaction(ctx: &Ctx) -> Response {
    match ctx.consumer.force_reset() {
        Ok(_) => {
            tracing::warn!("transaction forcibly reset to empty Prepare");
            Response::text(200, "transaction reset to empty Prepare")
        }
        Err(StoreError::ExecutionInProgress) => {
            Response::text(409, "executor holds the transaction lock, refusing reset")
        }
        Err(err) => fail("failed to reset transaction", &err),
    }
}

/// Ask the service supervisor for a detached one-shot unit running this
/// binary in executor mode. The unit outlives the daemon so the agent can
/// be replaced while the executor is still applying.
fn spawn_executor(cfg: &Config) -> Result<(), OpError> {
    let exe = match &cfg.executor_exe {
        Some(exe) => exe.clone(),
        None => std::env::current_exe().unwrap_or_else(|_| PathBuf::from("/usr/local/bin/groom")),
    };

    let output = Command::new(&cfg.tools.systemd_run)
        .arg("--unit=groom-executor")
        .arg("--description=Groom transaction executor")
        .arg("--service-type=oneshot")
        .arg("--collect")
        .arg(&exe)
        .arg("--execute")
        .output()
        .map_err(OpError::Io)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(OpError::Pkg(crate::pkg::PkgError::CommandFailed {
            program: cfg.tools.systemd_run.clone(),
            status: output.status.to_string(),
            stderr: stderr.trim().to_string(),
        }));
    }
    Ok(())
}

// =============================================================================
// Error mapping
// =============================================================================

fn op_error(err: OpError) -> Response {
    match &err {
        OpError::InvalidFilename(_) => Response::text(400, err.to_string()),
        OpError::SelfProtected => Response::text(403, err.to_string()),
        OpError::PoolFileNotFound(_) | OpError::InstalledFileNotFound(_) => {
            Response::text(404, err.to_string())
        }
        OpError::PoolFileStaged(_) => Response::text(409, err.to_string()),
        _ => fail("operation failed", &err),
    }
}

fn store_error(context: &str, err: StoreError) -> Response {
    match err {
        StoreError::ExecutionInProgress => Response::text(
            409,
            "transaction in progress, cannot stage new operations",
        ),
        err => fail(context, &err),
    }
}

fn fail(context: &str, err: &dyn std::error::Error) -> Response {
    tracing::error!("{context}: {err}");
    Response::text(500, context)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_prefix_stripping() {
        assert_eq!(strip_route("/pool", "/pool"), Some(""));
        assert_eq!(strip_route("/pool/", "/pool"), Some(""));
        assert_eq!(strip_route("/pool/a.deb", "/pool"), Some("a.deb"));
        assert_eq!(strip_route("/poolish", "/pool"), None);
        assert_eq!(strip_route("/installed/x", "/pool"), None);
    }
}
