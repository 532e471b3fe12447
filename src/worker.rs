//! Worker state machine — one control connection driving one FTP server
//! through connect -> login-script -> work-loop, dispatching queue items
//! to the transport, parser, cache, and explored-path set.
//!
//! Grounded on `sorng-ftp::ftp::client::connect`'s login
//! sequence (validate host -> TCP connect -> optional `AUTH TLS` -> `USER`/
//! `PASS` -> `probe_features` -> `OPTS UTF8` -> `SYST`/`PWD` -> `TYPE`) and
//! on `queue::process_next`'s retry/backoff shape, generalized from a
//! single stateless "pop one transfer" function into a persistent
//! cooperative state machine with its own inbox, per the design notes'
//! "coroutine / message-pump -> per-worker inbox channel" mapping.
//!
//! All cross-worker state (the queue, the listing cache, the disk-work
//! channel, the explored-path set, pause/resume, the global speed meter)
//! lives on the shared [`crate::coordinator::OperationCoordinator`] — this
//! struct owns only what a worker exclusively owns: its control socket,
//! its current item binding, and its local file handles.

use crate::cache::{CacheKey, CachePolicy};
use crate::compress::{ZlibReceiver, ZlibSender};
use crate::config::TlsPolicy;
use crate::connection;
use crate::coordinator::{OperationCoordinator, SpeedMeter};
use crate::error::{EngineError, EngineErrorKind, EngineResult};
use crate::parser::{self, types::ServerType};
use crate::path::ServerPathSyntax;
use crate::protocol::FtpCodec;
use crate::config::OverwritePolicy;
use crate::queue::{ForceAction, Item, ItemKind, ItemState, ProblemCode};
use crate::tls;
use crate::transfer::{self, DataConnection};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

/// Top-level worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    LookingForWork,
    Preparing,
    Connecting,
    Working,
    WaitingForReconnect,
    ConnectionError,
    Sleeping,
    Stopped,
}

/// Events a worker's inbox can receive. Delivered by the coordinator
/// (`post_new_work_available`, `give_work_to_sleeping_con_worker`) or by
/// the worker's own timers.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    WorkAvailable,
    ReconnectTimerFired,
    SleepTimerFired,
    ShouldStop,
}

/// The worker's persistent state. One per control connection; the queue,
/// cache, disk channel, and explored set are reached through `coordinator`,
/// shared with every sibling worker on the same operation.
pub struct Worker {
    pub id: u32,
    coordinator: Arc<OperationCoordinator>,
    inbox: mpsc::Receiver<WorkerEvent>,
    self_tx: mpsc::Sender<WorkerEvent>,
    codec: Option<FtpCodec>,
    /// Cached server-type detection result, set once per connection so
    /// repeated listings on the same server don't re-run autodetection.
    server_type: Option<&'static ServerType>,
    state: WorkerState,
    should_stop: Arc<AtomicBool>,
    consecutive_connect_failures: u32,
    /// Item `find_work` handed to this worker and marked `Processing`,
    /// carried from `LookingForWork` through to `Working`.
    current_item: Option<u32>,
}

pub struct WorkerHandle {
    pub tx: mpsc::Sender<WorkerEvent>,
    pub should_stop: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(id: u32, coordinator: Arc<OperationCoordinator>) -> (Self, WorkerHandle) {
        let (tx, inbox) = mpsc::channel(32);
        let should_stop = Arc::new(AtomicBool::new(false));
        let worker = Self {
            id,
            coordinator,
            inbox,
            self_tx: tx.clone(),
            codec: None,
            server_type: None,
            state: WorkerState::LookingForWork,
            should_stop: should_stop.clone(),
            consecutive_connect_failures: 0,
            current_item: None,
        };
        (worker, WorkerHandle { tx, should_stop })
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// The cooperative event loop: `while let Some(event) = rx.recv().await`
    /// over the worker's own inbox, exactly the "coroutine / message-pump"
    /// mapping the design notes call for.
    pub async fn run(&mut self) {
        loop {
            if self.should_stop.load(Ordering::SeqCst) {
                self.quit_once().await;
                self.coordinator.clear_sleeping(self.id).await;
                self.state = WorkerState::Stopped;
                return;
            }
            match self.state {
                WorkerState::LookingForWork => self.step_looking_for_work().await,
                WorkerState::Preparing => self.step_preparing(),
                WorkerState::Connecting => self.step_connecting().await,
                WorkerState::Working => self.step_working().await,
                WorkerState::WaitingForReconnect => self.step_waiting_for_reconnect().await,
                WorkerState::ConnectionError => self.step_connection_error(),
                WorkerState::Sleeping => self.step_sleeping().await,
                WorkerState::Stopped => {
                    self.coordinator.clear_sleeping(self.id).await;
                    return;
                }
            }
        }
    }

    /// `should-stop` sends `QUIT` exactly once and ignores the reply — the
    /// socket is force-closed either way.
    async fn quit_once(&mut self) {
        if let Some(codec) = self.codec.as_mut() {
            let _ = codec.send_command("QUIT").await;
        }
        self.codec = None;
    }

    async fn step_looking_for_work(&mut self) {
        if self.coordinator.is_paused() {
            self.state = WorkerState::Sleeping;
            return;
        }
        let found = {
            let mut q = self.coordinator.queue.lock().await;
            q.find_work()
        };
        if let Some(id) = found {
            self.current_item = Some(id);
            self.state = WorkerState::Preparing;
        } else {
            self.state = WorkerState::Sleeping;
        }
    }

    fn step_preparing(&mut self) {
        if self.codec.is_some() {
            self.state = WorkerState::Working;
        } else {
            self.state = WorkerState::Connecting;
        }
    }

    async fn step_connecting(&mut self) {
        match self.connect_and_login().await {
            Ok(()) => {
                self.consecutive_connect_failures = 0;
                self.state = WorkerState::Working;
            }
            Err(e) => {
                log::trace!(
                    "[{}] worker {} connect failed: {}",
                    self.coordinator.operation_id,
                    self.id,
                    e
                );
                self.consecutive_connect_failures += 1;
                self.codec = None;
                self.state = WorkerState::ConnectionError;
            }
        }
    }

    fn step_connection_error(&mut self) {
        // Fatal auth failures don't get retried forever; everything else
        // is a transient condition worth a reconnect backoff.
        self.state = WorkerState::WaitingForReconnect;
    }

    async fn step_waiting_for_reconnect(&mut self) {
        tokio::time::sleep(self.coordinator.config.retry_backoff()).await;
        if self.consecutive_connect_failures >= self.coordinator.config.max_attempts {
            // Give up on this connection's slot, but hand any stranded
            // item back to the queue so a sibling worker can retry it.
            if let Some(id) = self.current_item.take() {
                let mut q = self.coordinator.queue.lock().await;
                if q.get(id).map(|i| i.state != ItemState::Done).unwrap_or(false) {
                    q.update_state(id, ItemState::Waiting);
                }
            }
            self.state = WorkerState::Stopped;
        } else {
            self.state = WorkerState::Connecting;
        }
    }

    async fn step_sleeping(&mut self) {
        if self.codec.is_some() {
            // Register as a reusable live connection only while actually
            // idle with an open socket — the handoff target for
            // `give_work_to_sleeping_con_worker`.
            self.coordinator.mark_sleeping(self.id, self.self_tx.clone()).await;
        }
        let event = self.inbox.recv().await;
        self.coordinator.clear_sleeping(self.id).await;
        match event {
            Some(WorkerEvent::WorkAvailable) => self.state = WorkerState::LookingForWork,
            Some(WorkerEvent::ShouldStop) | None => self.state = WorkerState::Stopped,
            Some(WorkerEvent::ReconnectTimerFired) | Some(WorkerEvent::SleepTimerFired) => {
                self.state = WorkerState::LookingForWork;
            }
        }
    }

    async fn step_working(&mut self) {
        let Some(id) = self.current_item.take() else {
            self.state = WorkerState::LookingForWork;
            return;
        };

        let result = self.execute_item(id).await;
        self.coordinator.touch_activity().await;
        if let Err(e) = result {
            log::trace!("worker {} item {} failed: {}", self.id, id, e);
            if e.is_cheap_retryable() {
                let mut q = self.coordinator.queue.lock().await;
                q.update_state(id, ItemState::Waiting);
            } else {
                let problem = classify_problem(&e);
                let mut q = self.coordinator.queue.lock().await;
                q.update_state(id, ItemState::Error(problem));
            }
            if matches!(e.kind, EngineErrorKind::Disconnected | EngineErrorKind::ConnectionFailed) {
                self.codec = None;
            }
        } else {
            self.coordinator.post_new_work_available().await;
        }
        self.state = WorkerState::LookingForWork;
    }

    async fn connect_and_login(&mut self) -> EngineResult<()> {
        let cfg = self.coordinator.config.clone();

        let proxy_script = if cfg.proxy_type != crate::proxy::ProxyServerType::NotUsed {
            let vars = crate::proxy::ProxyVars {
                host: cfg.host.clone(),
                port: cfg.port,
                user: cfg.username.clone(),
                password: cfg.password.clone(),
                account: cfg.account.clone(),
                proxy_host: cfg.proxy_host.clone().unwrap_or_default(),
                proxy_port: cfg.proxy_port.unwrap_or(cfg.port),
                proxy_user: cfg.proxy_user.clone(),
                proxy_password: cfg.proxy_password.clone(),
            };
            Some(crate::proxy::compile(cfg.proxy_type, &vars)?)
        } else {
            None
        };

        let (dial_host, dial_port) = match &proxy_script {
            Some(script) => (script.connect_host.clone(), script.connect_port),
            None => (cfg.host.clone(), cfg.port),
        };

        let (mut codec, welcome) = connection::connect(
            &dial_host,
            dial_port,
            cfg.connect_timeout(),
            cfg.tls_policy,
            cfg.accept_invalid_certs,
        )
        .await?;

        self.coordinator.set_server_first_reply(welcome.text()).await;

        if cfg.tls_policy == TlsPolicy::Explicit {
            codec.expect_ok("AUTH TLS").await?;
            codec = tls::upgrade_to_tls(codec, &cfg.host, cfg.accept_invalid_certs).await?;
            codec.expect_ok("PBSZ 0").await?;
            codec.expect_ok("PROT P").await?;
        }

        // A proxy script's steps already carry their own `USER`/`PASS`
        // sequence (first against the proxy, then against the real target
        // for the `FtpSite*`/`FtpOpen*`/`FtpUser*` dialects) — running the
        // plain `login` on top would double-send `USER`/`PASS`.
        match &proxy_script {
            Some(script) => crate::proxy::run(&mut codec, script).await?,
            None => self.login(&mut codec, &cfg).await?,
        }

        for cmd in &cfg.login_script {
            codec.expect_ok(cmd).await?;
        }

        if let Some(dir) = &cfg.initial_directory {
            codec.expect_ok(&format!("CWD {}", dir)).await?;
        }

        let type_cmd = match cfg.transfer_mode {
            crate::config::TransferMode::Ascii => "TYPE A",
            crate::config::TransferMode::Binary => "TYPE I",
        };
        codec.expect_ok(type_cmd).await?;

        if cfg.use_mode_z {
            codec.expect_ok("MODE Z").await?;
        }

        let syst = codec.execute("SYST").await?;
        self.coordinator.set_server_system(syst.text()).await;

        self.codec = Some(codec);
        Ok(())
    }

    async fn login(&self, codec: &mut FtpCodec, cfg: &crate::config::OperationConfig) -> EngineResult<()> {
        let user_resp = codec.execute(&format!("USER {}", cfg.username)).await?;
        if user_resp.is_completion() {
            return Ok(());
        }
        if user_resp.significance() != 3 {
            return Err(EngineError::from_reply(user_resp.code, &user_resp.text()));
        }
        let pass_resp = codec.execute(&format!("PASS {}", cfg.password)).await?;
        if pass_resp.is_completion() {
            return Ok(());
        }
        if pass_resp.significance() == 3 {
            if let Some(account) = &cfg.account {
                codec.expect_ok(&format!("ACCT {}", account)).await?;
                return Ok(());
            }
        }
        Err(EngineError::from_reply(pass_resp.code, &pass_resp.text()))
    }

    /// Dispatch one queue item according to its kind. `ExploreDir`/
    /// `ResolveLink` variants fetch a listing and call `replace_with_list`;
    /// concrete file/dir variants perform the actual FTP operation.
    async fn execute_item(&mut self, id: u32) -> EngineResult<()> {
        let item = {
            let q = self.coordinator.queue.lock().await;
            q.get(id).cloned().ok_or_else(|| EngineError::protocol_error("item vanished"))?
        };

        if item.kind.is_explore() {
            self.explore_directory(id, &item).await
        } else if item.kind.is_resolve_link() {
            self.resolve_link(id, &item).await
        } else {
            match item.kind {
                ItemKind::DeleteFile | ItemKind::DeleteLink => self.delete_file(id, &item).await,
                ItemKind::DeleteDir | ItemKind::MoveDeleteDir | ItemKind::MoveDeleteDirLink | ItemKind::UploadMoveDeleteDir => {
                    self.delete_dir(id, &item).await
                }
                ItemKind::CopyFileOrFileLink | ItemKind::MoveFileOrFileLink => self.copy_or_move_file(id, &item).await,
                ItemKind::UploadCopyFile | ItemKind::UploadMoveFile => self.upload_file(id, &item).await,
                ItemKind::ChAttrsFile | ItemKind::ChAttrsDir => self.change_attrs(id, &item).await,
                _ => Err(EngineError::protocol_error("unhandled item kind reached execute_item")),
            }
        }
    }

    async fn current_server_type(&mut self, sample: &str) -> EngineResult<&'static ServerType> {
        if let Some(st) = self.server_type {
            return Ok(st);
        }
        let st = parser::autodetect(sample).ok_or_else(|| EngineError::protocol_error("unrecognised listing format"))?;
        self.server_type = Some(st);
        Ok(st)
    }

    fn path_syntax(&self) -> ServerPathSyntax {
        self.server_type.map(|s| s.path_syntax).unwrap_or(ServerPathSyntax::Unix)
    }

    /// Fetch a directory listing, consulting the cache first and otherwise
    /// running the full `cwd -> pwd -> cycle-check -> LIST` sequence for
    /// every `*ExploreDir*` variant. On a cache hit the CWD/PWD/cycle-check
    /// round trip is skipped entirely —
    /// this path was already fully explored once, so there is nothing new
    /// to detect a cycle against. Returns `Err` mapped to `DirEndlessLoop`
    /// by the caller when the PWD round trip itself reveals a cycle.
    ///
    /// `policy` is `CachePolicy::Bypass` for Delete/ChangeAttrs/Upload
    /// explores — their listings are volatile by construction (spec.md
    /// §4.3), so they're never read from or written into the shared cache.
    async fn fetch_listing(
        &mut self,
        path: &str,
        policy: CachePolicy,
    ) -> EngineResult<Vec<crate::parser::types::FileData>> {
        let cfg = self.coordinator.config.clone();
        let key = CacheKey {
            user: cfg.username.clone(),
            host: cfg.host.clone(),
            port: cfg.port,
            path: path.to_string(),
            list_command: cfg.list_command.clone(),
            tls: cfg.tls_policy != TlsPolicy::None,
        };
        if policy == CachePolicy::UseCache {
            if let Some(cached) = self.coordinator.cache.lookup(&key) {
                return Ok(cached);
            }
        }

        let codec = self.codec.as_mut().ok_or_else(|| EngineError::disconnected("no control connection"))?;
        codec.expect_ok(&format!("CWD {}", path)).await.map_err(|_| {
            EngineError::new(EngineErrorKind::CommandRejected, format!("cannot CWD into {}", path))
        })?;
        let pwd_resp = codec.execute("PWD").await?;
        let resolved = crate::protocol::parse_pwd_reply(&pwd_resp.text()).unwrap_or_else(|| path.to_string());

        if let Some(cycle) = self.coordinator.check_explore_cycle(path, &resolved).await {
            return Err(EngineError::endless_loop(cycle));
        }
        self.coordinator.add_to_explored_paths(&resolved).await;

        let data_conn = transfer::open_data_channel(
            codec,
            cfg.data_channel_mode,
            cfg.tls_policy,
            &cfg.host,
            cfg.accept_invalid_certs,
            cfg.connect_timeout(),
            cfg.active_bind_address.as_deref(),
            cfg.use_mode_z,
        )
        .await?;

        let speed_meter = self.coordinator.global_transfer_speed_meter();
        let raw = read_listing_stream(&cfg, codec, data_conn, &speed_meter).await?;
        let now = chrono::Utc::now();
        let st = self.current_server_type(&raw).await?;
        let entries = parser::parse_listing(&raw, st, now).map_err(|_| EngineError::protocol_error("listing parse error"))?;
        if policy == CachePolicy::UseCache {
            self.coordinator.cache.insert_or_update(key, entries.clone());
        }
        Ok(entries)
    }

    async fn explore_directory(&mut self, id: u32, item: &Item) -> EngineResult<()> {
        let policy = cache_policy_for(item.kind);
        let entries = match self.fetch_listing(&item.source_path, policy).await {
            Ok(entries) => entries,
            Err(e) if e.kind == EngineErrorKind::DirEndlessLoop => {
                let mut q = self.coordinator.queue.lock().await;
                q.update_state(id, ItemState::Error(ProblemCode::DirEndlessLoop));
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let child_kind = child_kind_for_explore(item.kind);
        // Change-attributes items carry a chmod mode string in `target_path`'s
        // role, never a filesystem path — it must pass through to children
        // unchanged rather than get a child name appended to it the way a
        // copy/move/upload target path does.
        let is_chattrs = matches!(item.kind, ItemKind::ChAttrsExploreDir | ItemKind::ChAttrsExploreDirLink);

        let children: Vec<(ItemKind, String, Option<String>, String)> = entries
            .iter()
            .map(|e| {
                let src = format!("{}/{}", item.source_path.trim_end_matches('/'), e.name);
                let tgt = if is_chattrs {
                    None
                } else {
                    item.target_path
                        .as_ref()
                        .map(|t| format!("{}/{}", t.trim_end_matches('/'), e.name))
                };
                let kind = if e.is_link() {
                    link_child_kind(item.kind)
                } else if e.is_dir() {
                    item.kind
                } else {
                    child_kind
                };
                (kind, src, tgt, e.name.clone())
            })
            .collect();
        let is_hidden_flags: Vec<bool> = entries.iter().map(|e| e.name.starts_with('.')).collect();
        let original_rights: Vec<Option<String>> = entries.iter().map(|e| e.permissions.clone()).collect();

        let mut q = self.coordinator.queue.lock().await;
        let child_ids = q.replace_with_list(id, children);
        for ((child_id, hidden), rights) in child_ids.into_iter().zip(is_hidden_flags).zip(original_rights) {
            if let Some(child) = q.get_mut(child_id) {
                child.is_hidden = hidden;
                if is_chattrs {
                    child.original_rights = rights;
                    child.new_mode = item.new_mode.clone();
                }
            }
        }
        Ok(())
    }

    async fn resolve_link(&mut self, id: u32, item: &Item) -> EngineResult<()> {
        let codec = self.codec.as_mut().ok_or_else(|| EngineError::disconnected("no control connection"))?;
        // MLST gives us the symlink's facts, including whether its target
        // is itself a directory.
        let resp = codec.execute(&format!("MLST {}", item.source_path)).await?;
        let is_dir = resp.text().contains("type=dir") || resp.text().contains("type=cdir");
        let mut q = self.coordinator.queue.lock().await;
        let resolved_kind = if is_dir {
            match item.kind {
                ItemKind::CopyResolveLink => ItemKind::CopyExploreDir,
                ItemKind::MoveResolveLink => ItemKind::MoveExploreDirLink,
                ItemKind::ChAttrsResolveLink => ItemKind::ChAttrsExploreDirLink,
                other => other,
            }
        } else {
            match item.kind {
                ItemKind::CopyResolveLink => ItemKind::CopyFileOrFileLink,
                ItemKind::MoveResolveLink => ItemKind::MoveFileOrFileLink,
                ItemKind::ChAttrsResolveLink => ItemKind::ChAttrsFile,
                other => other,
            }
        };
        if let Some(entry) = q.get_mut(id) {
            entry.kind = resolved_kind;
            entry.state = ItemState::Waiting;
        }
        Ok(())
    }

    async fn delete_file(&mut self, id: u32, item: &Item) -> EngineResult<()> {
        if item.is_hidden && item.force_action != Some(ForceAction::Overwrite) {
            if let Some(outcome) = self.resolve_hidden_policy(id, ProblemCode::FileHidden).await {
                return outcome;
            }
        }
        let codec = self.codec.as_mut().ok_or_else(|| EngineError::disconnected("no control connection"))?;
        codec.expect_ok(&format!("DELE {}", item.source_path)).await?;
        self.invalidate_parent_of(&item.source_path);
        let mut q = self.coordinator.queue.lock().await;
        q.update_state(id, ItemState::Done);
        Ok(())
    }

    /// Consult `hidden_item_policy` for a hidden file/dir about to be
    /// deleted. Returns `Some(outcome)` if the delete should not proceed
    /// (skipped or parked on the user), `None` if the caller should go
    /// ahead and issue `DELE`/`RMD` — either the item isn't actually hidden,
    /// or an earlier `ForceAction::Overwrite` resolution already cleared it
    /// to delete anyway.
    async fn resolve_hidden_policy(&self, id: u32, problem: ProblemCode) -> Option<EngineResult<()>> {
        use crate::config::HiddenItemPolicy;
        match self.coordinator.config.hidden_item_policy {
            HiddenItemPolicy::Delete => None,
            HiddenItemPolicy::Skip => {
                let mut q = self.coordinator.queue.lock().await;
                q.update_state(id, ItemState::Skipped);
                Some(Ok(()))
            }
            HiddenItemPolicy::AskUser => {
                let mut q = self.coordinator.queue.lock().await;
                q.update_state(id, ItemState::UserInputNeeded(problem));
                Some(Ok(()))
            }
        }
    }

    async fn delete_dir(&mut self, id: u32, item: &Item) -> EngineResult<()> {
        if item.is_hidden && item.force_action != Some(ForceAction::Overwrite) {
            if let Some(outcome) = self.resolve_hidden_policy(id, ProblemCode::DirHidden).await {
                return outcome;
            }
        }

        // `UploadMoveDeleteDir` is the one variant of this finaliser that
        // cleans up the *local* source tree after an upload-move, not a
        // remote directory — everything else issues `RMD` against the
        // server.
        if item.kind == ItemKind::UploadMoveDeleteDir {
            self.coordinator.disk.delete_dir(item.source_path.clone()).await?;
            let mut q = self.coordinator.queue.lock().await;
            q.update_state(id, ItemState::Done);
            return Ok(());
        }

        let codec = self.codec.as_mut().ok_or_else(|| EngineError::disconnected("no control connection"))?;
        let resp = codec.execute(&format!("RMD {}", item.source_path)).await?;
        if !resp.is_success() {
            // A directory reported non-empty by the server races badly
            // with the queue's own child-counter bookkeeping; surface it
            // as a policy error rather than a structural one so the caller
            // can retry once children are confirmed gone.
            let mut q = self.coordinator.queue.lock().await;
            q.update_state(id, ItemState::Error(ProblemCode::DirNotEmpty));
            return Ok(());
        }
        self.invalidate_parent_of(&item.source_path);
        let mut q = self.coordinator.queue.lock().await;
        q.update_state(id, ItemState::Done);
        Ok(())
    }

    async fn copy_or_move_file(&mut self, id: u32, item: &Item) -> EngineResult<()> {
        let target = item
            .target_path
            .clone()
            .ok_or_else(|| EngineError::invalid_config("copy/move item missing target path"))?;
        let cfg = self.coordinator.config.clone();
        let speed_meter = self.coordinator.global_transfer_speed_meter();

        let target_path = std::path::Path::new(&target);
        let dir = target_path.parent().map(|p| p.to_path_buf()).unwrap_or_else(|| std::path::PathBuf::from("."));
        let name = target_path.file_name().and_then(|n| n.to_str()).unwrap_or(&target).to_string();
        let policy = resolve_overwrite_policy(item.force_action, cfg.overwrite_policy);

        let verdict = self.coordinator.disk.create_file(dir.clone(), name.clone(), policy).await?;
        let (mut file, final_name, resume_offset) = match verdict {
            crate::disk::CreateFileVerdict::Skip => {
                let mut q = self.coordinator.queue.lock().await;
                q.update_state(id, ItemState::Skipped);
                return Ok(());
            }
            crate::disk::CreateFileVerdict::Ready { file, final_name, resume_offset } => (file, final_name, resume_offset),
        };

        {
            let codec = self.codec.as_mut().ok_or_else(|| EngineError::disconnected("no control connection"))?;
            let data_conn = transfer::open_data_channel(
                codec,
                cfg.data_channel_mode,
                cfg.tls_policy,
                &cfg.host,
                cfg.accept_invalid_certs,
                cfg.connect_timeout(),
                cfg.active_bind_address.as_deref(),
                cfg.use_mode_z,
            )
            .await?;
            if resume_offset > 0 {
                codec.expect(&format!("REST {}", resume_offset), 3).await?;
            }
            codec.send_command(&format!("RETR {}", item.source_path)).await?;
            let resp = codec.read_response().await?;
            if !resp.is_preliminary() {
                return Err(EngineError::from_reply(resp.code, &resp.text()));
            }

            let mut data_conn = data_conn;
            let mut buf = [0u8; 16384];

            if cfg.use_mode_z {
                // Mirrors `read_listing_stream`: the deflate stream must be
                // fully received before `ZlibDecoder` can be driven to EOF,
                // so the raw bytes are buffered whole, then inflated.
                let mut raw = Vec::new();
                loop {
                    let n = data_conn.read(&mut buf, cfg.data_timeout()).await.map_err(EngineError::from)?;
                    if n == 0 {
                        break;
                    }
                    raw.extend_from_slice(&buf[..n]);
                    speed_meter.throttle(n as u64).await;
                }
                let mut receiver = crate::compress::ZlibReceiver::new(&raw[..]);
                let mut chunk = [0u8; 16384];
                loop {
                    let n = receiver.read_chunk(&mut chunk)?;
                    if n == 0 {
                        break;
                    }
                    file.write_all(&chunk[..n]).await?;
                }
            } else {
                loop {
                    let n = data_conn.read(&mut buf, cfg.data_timeout()).await.map_err(EngineError::from)?;
                    if n == 0 {
                        break;
                    }
                    file.write_all(&buf[..n]).await?;
                    speed_meter.throttle(n as u64).await;
                }
            }
            file.flush().await?;
            data_conn.shutdown().await.ok();
            let final_resp = codec.read_response().await?;
            if !final_resp.is_success() {
                return Err(EngineError::from_reply(final_resp.code, &final_resp.text()));
            }
        }

        if let Some(parent) = parent_of(&target) {
            self.coordinator
                .cache
                .invalidate_path(&cfg.username, &cfg.host, cfg.port, &parent, self.path_syntax());
        }

        let mut q = self.coordinator.queue.lock().await;
        if final_name != name {
            if let Some(entry) = q.get_mut(id) {
                entry.target_path = Some(dir.join(&final_name).to_string_lossy().into_owned());
                entry.name = final_name;
            }
        }
        q.update_state(id, ItemState::Done);
        Ok(())
    }

    async fn upload_file(&mut self, id: u32, item: &Item) -> EngineResult<()> {
        let target = item
            .target_path
            .clone()
            .ok_or_else(|| EngineError::invalid_config("upload item missing target path"))?;
        let cfg = self.coordinator.config.clone();
        let speed_meter = self.coordinator.global_transfer_speed_meter();

        {
            let mut local = self.coordinator.disk.open_for_reading(item.source_path.clone()).await?;
            let codec = self.codec.as_mut().ok_or_else(|| EngineError::disconnected("no control connection"))?;
            let data_conn = transfer::open_data_channel(
                codec,
                cfg.data_channel_mode,
                cfg.tls_policy,
                &cfg.host,
                cfg.accept_invalid_certs,
                cfg.connect_timeout(),
                cfg.active_bind_address.as_deref(),
                cfg.use_mode_z,
            )
            .await?;
            codec.send_command(&format!("STOR {}", target)).await?;
            let resp = codec.read_response().await?;
            if !resp.is_preliminary() {
                return Err(EngineError::from_reply(resp.code, &resp.text()));
            }

            let mut data_conn = data_conn;
            let mut buf = [0u8; 16384];

            if cfg.use_mode_z {
                let mut sender = ZlibSender::new(Vec::new(), cfg.mode_z_level.unwrap_or(6));
                loop {
                    let n = local.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    sender.write_chunk(&buf[..n])?;
                }
                let compressed = sender.finish()?;
                let len = compressed.len() as u64;
                data_conn
                    .write_all(&compressed, cfg.data_timeout())
                    .await
                    .map_err(EngineError::from)?;
                speed_meter.throttle(len).await;
            } else {
                loop {
                    let n = local.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    data_conn.write_all(&buf[..n], cfg.data_timeout()).await.map_err(EngineError::from)?;
                    speed_meter.throttle(n as u64).await;
                }
            }

            data_conn.shutdown().await.ok();
            let final_resp = codec.read_response().await?;
            if !final_resp.is_success() {
                return Err(EngineError::from_reply(final_resp.code, &final_resp.text()));
            }
        }

        if let Some(parent) = parent_of(&target) {
            self.coordinator
                .cache
                .invalidate_path(&cfg.username, &cfg.host, cfg.port, &parent, self.path_syntax());
        }

        let mut q = self.coordinator.queue.lock().await;
        q.update_state(id, ItemState::Done);
        Ok(())
    }

    async fn change_attrs(&mut self, id: u32, item: &Item) -> EngineResult<()> {
        let mode = item
            .new_mode
            .clone()
            .ok_or_else(|| EngineError::invalid_config("chattrs item missing a mode string"))?;

        if item.force_action != Some(ForceAction::Overwrite) {
            let cfg = self.coordinator.config.clone();
            if let Some(rights) = &item.original_rights {
                if rights_have_unrepresentable_bits(rights, cfg.chattrs_and_mask) {
                    use crate::config::UnknownAttrsPolicy;
                    let mut q = self.coordinator.queue.lock().await;
                    match cfg.unknown_attrs_policy {
                        UnknownAttrsPolicy::Ignore => {}
                        UnknownAttrsPolicy::Skip => {
                            if let Some(entry) = q.get_mut(id) {
                                entry.attr_error = true;
                            }
                            q.update_state(id, ItemState::Skipped);
                            return Ok(());
                        }
                        UnknownAttrsPolicy::AskUser => {
                            if let Some(entry) = q.get_mut(id) {
                                entry.attr_error = true;
                            }
                            q.update_state(id, ItemState::UserInputNeeded(ProblemCode::UnknownAttrs));
                            return Ok(());
                        }
                    }
                }
            }
        }

        let codec = self.codec.as_mut().ok_or_else(|| EngineError::disconnected("no control connection"))?;
        let resp = codec.execute(&format!("SITE CHMOD {} {}", mode, item.source_path)).await?;
        let mut q = self.coordinator.queue.lock().await;
        if resp.is_success() {
            q.update_state(id, ItemState::Done);
        } else if resp.code == 500 || resp.code == 502 {
            // Server doesn't implement SITE CHMOD at all — not worth
            // retrying, and not worth failing the whole operation over.
            q.update_state(id, ItemState::Skipped);
        } else {
            q.update_state(id, ItemState::Error(ProblemCode::Other));
        }
        Ok(())
    }

    fn invalidate_parent_of(&self, path: &str) {
        if let Some(parent) = parent_of(path) {
            let cfg = &self.coordinator.config;
            self.coordinator
                .cache
                .invalidate_path(&cfg.username, &cfg.host, cfg.port, &parent, self.path_syntax());
        }
    }
}

/// Drain a listing's data connection to completion, inflating it first if
/// MODE Z is active. Free function (not a `Worker` method) so it can be
/// called while a caller already holds `&mut self.codec` reborrowed locally
/// — a method taking `&self`/`&mut self` here would conflict with that
/// existing field borrow.
async fn read_listing_stream(
    config: &crate::config::OperationConfig,
    codec: &mut FtpCodec,
    mut data_conn: DataConnection,
    speed_meter: &SpeedMeter,
) -> EngineResult<String> {
    let mut buf = [0u8; 8192];
    let mut raw_bytes = Vec::new();
    loop {
        let n = data_conn.read(&mut buf, config.data_timeout()).await.map_err(EngineError::from)?;
        if n == 0 {
            break;
        }
        raw_bytes.extend_from_slice(&buf[..n]);
        speed_meter.throttle(n as u64).await;
    }
    data_conn.shutdown().await.ok();
    codec.read_response().await?;

    if config.use_mode_z {
        let mut receiver = ZlibReceiver::new(&raw_bytes[..]);
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = receiver.read_chunk(&mut chunk)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    } else {
        Ok(String::from_utf8_lossy(&raw_bytes).into_owned())
    }
}

fn parent_of(path: &str) -> Option<String> {
    path.rfind('/').map(|idx| {
        if idx == 0 {
            "/".to_string()
        } else {
            path[..idx].to_string()
        }
    })
}

/// A per-item `force_action` (set by the user resolving an earlier prompt)
/// overrides the operation's default overwrite policy for this one retry.
fn resolve_overwrite_policy(force_action: Option<ForceAction>, default: OverwritePolicy) -> OverwritePolicy {
    match force_action {
        Some(ForceAction::Overwrite) => OverwritePolicy::Overwrite,
        Some(ForceAction::Skip) => OverwritePolicy::Skip,
        Some(ForceAction::Resume) => OverwritePolicy::Resume,
        Some(ForceAction::Autorename) => OverwritePolicy::Autorename,
        Some(ForceAction::Retry) | None => default,
    }
}

/// Delete/ChangeAttrs/Upload explores read listings that are volatile by
/// construction (spec.md §4.3) — their directories are about to be
/// mutated or were only probed to decide an upload target's existing
/// contents, so the result must neither be served from nor written into
/// the shared listing cache.
fn cache_policy_for(explore_kind: ItemKind) -> CachePolicy {
    match explore_kind {
        ItemKind::DeleteExploreDir
        | ItemKind::ChAttrsExploreDir
        | ItemKind::ChAttrsExploreDirLink
        | ItemKind::UploadCopyExploreDir
        | ItemKind::UploadMoveExploreDir => CachePolicy::Bypass,
        _ => CachePolicy::UseCache,
    }
}

fn child_kind_for_explore(explore_kind: ItemKind) -> ItemKind {
    match explore_kind {
        ItemKind::CopyExploreDir => ItemKind::CopyFileOrFileLink,
        ItemKind::MoveExploreDir | ItemKind::MoveExploreDirLink => ItemKind::MoveFileOrFileLink,
        ItemKind::UploadCopyExploreDir => ItemKind::UploadCopyFile,
        ItemKind::UploadMoveExploreDir => ItemKind::UploadMoveFile,
        ItemKind::DeleteExploreDir => ItemKind::DeleteFile,
        ItemKind::ChAttrsExploreDir | ItemKind::ChAttrsExploreDirLink => ItemKind::ChAttrsFile,
        other => other,
    }
}

fn link_child_kind(explore_kind: ItemKind) -> ItemKind {
    match explore_kind {
        ItemKind::CopyExploreDir => ItemKind::CopyResolveLink,
        ItemKind::MoveExploreDir | ItemKind::MoveExploreDirLink => ItemKind::MoveResolveLink,
        ItemKind::DeleteExploreDir => ItemKind::DeleteLink,
        ItemKind::ChAttrsExploreDir | ItemKind::ChAttrsExploreDirLink => ItemKind::ChAttrsResolveLink,
        other => other,
    }
}

/// Spec scenario: `rwsr-xr-x` (setuid) against `and_mask = 0o777` — a plain
/// `rwx` mask that clears the whole top octal digit, setuid included, with
/// nothing in `or_mask` to set it back. Detected structurally rather than
/// by computing the resulting numeric mode: a special bit (`s`/`S`/`t`/`T`)
/// is present in the listing's permission string, and the configured
/// and-mask doesn't explicitly retain the special-bits octal digit
/// (`0o7000`) that would be needed to preserve it.
fn rights_have_unrepresentable_bits(rights: &str, and_mask: Option<u32>) -> bool {
    let has_special_bit = rights.chars().any(|c| matches!(c, 's' | 'S' | 't' | 'T'));
    if !has_special_bit {
        return false;
    }
    match and_mask {
        Some(mask) => mask & 0o7000 == 0,
        None => true,
    }
}

fn classify_problem(e: &EngineError) -> ProblemCode {
    match e.kind {
        EngineErrorKind::InvalidConfig => ProblemCode::InvalidPath,
        EngineErrorKind::CommandRejected => ProblemCode::CannotCwd,
        EngineErrorKind::DataChannelFailed | EngineErrorKind::NoDataTimeout => ProblemCode::NetworkError,
        EngineErrorKind::IoError => ProblemCode::CannotCreateFile,
        EngineErrorKind::LowMemory => ProblemCode::LowMemory,
        EngineErrorKind::DirEndlessLoop => ProblemCode::DirEndlessLoop,
        _ => ProblemCode::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ListingCache;
    use crate::config::OperationConfig;
    use crate::queue::ItemState;

    fn config() -> OperationConfig {
        serde_json::from_str(r#"{"host":"ftp.example.com","username":"anon","password":"x"}"#).unwrap()
    }

    fn coordinator() -> Arc<OperationCoordinator> {
        OperationCoordinator::new(config(), Arc::new(ListingCache::default()))
    }

    #[test]
    fn parent_of_root_child_is_root() {
        assert_eq!(parent_of("/readme.txt").as_deref(), Some("/"));
    }

    #[test]
    fn parent_of_nested_path_strips_last_segment() {
        assert_eq!(parent_of("/pub/incoming/file").as_deref(), Some("/pub/incoming"));
    }

    #[test]
    fn parent_of_bare_name_has_no_parent() {
        assert_eq!(parent_of("file"), None);
    }

    #[test]
    fn explore_dir_children_map_to_concrete_file_kinds() {
        assert_eq!(child_kind_for_explore(ItemKind::CopyExploreDir), ItemKind::CopyFileOrFileLink);
        assert_eq!(child_kind_for_explore(ItemKind::UploadCopyExploreDir), ItemKind::UploadCopyFile);
        assert_eq!(child_kind_for_explore(ItemKind::DeleteExploreDir), ItemKind::DeleteFile);
    }

    #[test]
    fn delete_chattrs_and_upload_explores_bypass_the_listing_cache() {
        assert_eq!(cache_policy_for(ItemKind::DeleteExploreDir), CachePolicy::Bypass);
        assert_eq!(cache_policy_for(ItemKind::ChAttrsExploreDir), CachePolicy::Bypass);
        assert_eq!(cache_policy_for(ItemKind::ChAttrsExploreDirLink), CachePolicy::Bypass);
        assert_eq!(cache_policy_for(ItemKind::UploadCopyExploreDir), CachePolicy::Bypass);
        assert_eq!(cache_policy_for(ItemKind::UploadMoveExploreDir), CachePolicy::Bypass);
    }

    #[test]
    fn copy_and_move_explores_use_the_listing_cache() {
        assert_eq!(cache_policy_for(ItemKind::CopyExploreDir), CachePolicy::UseCache);
        assert_eq!(cache_policy_for(ItemKind::MoveExploreDir), CachePolicy::UseCache);
        assert_eq!(cache_policy_for(ItemKind::MoveExploreDirLink), CachePolicy::UseCache);
    }

    #[test]
    fn explore_dir_links_map_to_resolve_link_kinds() {
        assert_eq!(link_child_kind(ItemKind::CopyExploreDir), ItemKind::CopyResolveLink);
        assert_eq!(link_child_kind(ItemKind::MoveExploreDir), ItemKind::MoveResolveLink);
        assert_eq!(link_child_kind(ItemKind::DeleteExploreDir), ItemKind::DeleteLink);
    }

    #[test]
    fn resolve_overwrite_policy_prefers_item_force_action_over_default() {
        assert_eq!(
            resolve_overwrite_policy(Some(ForceAction::Skip), OverwritePolicy::Overwrite),
            OverwritePolicy::Skip
        );
        assert_eq!(
            resolve_overwrite_policy(Some(ForceAction::Retry), OverwritePolicy::Autorename),
            OverwritePolicy::Autorename
        );
        assert_eq!(resolve_overwrite_policy(None, OverwritePolicy::Resume), OverwritePolicy::Resume);
    }

    #[test]
    fn setuid_bit_is_unrepresentable_under_a_plain_rwx_and_mask() {
        assert!(rights_have_unrepresentable_bits("rwsr-xr-x", Some(0o777)));
    }

    #[test]
    fn setuid_bit_is_representable_when_the_and_mask_keeps_the_special_digit() {
        assert!(!rights_have_unrepresentable_bits("rwsr-xr-x", Some(0o7777)));
    }

    #[test]
    fn plain_permissions_have_nothing_to_lose() {
        assert!(!rights_have_unrepresentable_bits("rwxr-xr-x", Some(0o777)));
    }

    #[test]
    fn no_configured_mask_is_treated_as_unsafe_for_special_bits() {
        assert!(rights_have_unrepresentable_bits("rwsr-xr-x", None));
    }

    #[test]
    fn classify_problem_maps_io_and_data_channel_errors() {
        assert_eq!(classify_problem(&EngineError::invalid_config("x")), ProblemCode::InvalidPath);
        assert_eq!(
            classify_problem(&EngineError::new(EngineErrorKind::CommandRejected, "x")),
            ProblemCode::CannotCwd
        );
        assert_eq!(
            classify_problem(&EngineError::new(EngineErrorKind::NoDataTimeout, "x")),
            ProblemCode::NetworkError
        );
    }

    #[tokio::test]
    async fn new_worker_starts_looking_for_work_with_no_codec() {
        let (worker, handle) = Worker::new(1, coordinator());
        assert_eq!(worker.state(), WorkerState::LookingForWork);
        assert!(!handle.should_stop.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn should_stop_flag_drives_run_to_stopped_without_a_connection() {
        let (mut worker, handle) = Worker::new(2, coordinator());
        handle.should_stop.store(true, Ordering::SeqCst);
        worker.run().await;
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn looking_for_work_goes_to_sleeping_when_operation_is_paused() {
        let coord = coordinator();
        coord.pause();
        let (mut worker, _handle) = Worker::new(3, coord);
        worker.step_looking_for_work().await;
        assert_eq!(worker.state(), WorkerState::Sleeping);
    }

    #[tokio::test]
    async fn looking_for_work_claims_queued_item_and_moves_to_preparing() {
        let coord = coordinator();
        {
            let mut q = coord.queue.lock().await;
            q.add_top_level(ItemKind::DeleteFile, "/pub/a".to_string(), None, "a".to_string());
        }
        let (mut worker, _handle) = Worker::new(4, coord);
        worker.step_looking_for_work().await;
        assert_eq!(worker.state(), WorkerState::Preparing);
        assert!(worker.current_item.is_some());
    }

    #[tokio::test]
    async fn waiting_for_reconnect_releases_stranded_item_back_to_waiting_on_giveup() {
        let fast_retry: OperationConfig = serde_json::from_str(
            r#"{"host":"ftp.example.com","username":"anon","password":"x","retry_backoff_sec":0}"#,
        )
        .unwrap();
        let coord = OperationCoordinator::new(fast_retry, Arc::new(ListingCache::default()));
        let id = {
            let mut q = coord.queue.lock().await;
            q.add_top_level(ItemKind::DeleteFile, "/pub/a".to_string(), None, "a".to_string())
        };
        let (mut worker, _handle) = Worker::new(5, coord.clone());
        worker.current_item = Some(id);
        worker.consecutive_connect_failures = coord.config.max_attempts;
        worker.step_waiting_for_reconnect().await;
        assert_eq!(worker.state(), WorkerState::Stopped);
        let q = coord.queue.lock().await;
        assert_eq!(q.get(id).unwrap().state, ItemState::Waiting);
    }
}
