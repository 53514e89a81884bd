//! Process-wide facade over the translator, container, linker, engine, and
//! takeover crates: the process-singleton init state machine and the
//! exported C ABI a patched host library's stub symbols call into.
//!
//! The companion image's embedded bundle is decoded once, its functions are
//! cached in the [`vmforge_engine::Engine`], its `.dynsym` is scanned to
//! recover the takeover slot table, and every `vm_takeover_slot_NNNN`
//! trampoline forwards to [`vm_takeover_dispatch_by_id`] from then on.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::{Mutex, RwLock};

use vmforge_container::{BundleReader, FooterStatus};
use vmforge_engine::Engine;
use vmforge_function::{EncodedFunction, RuntimeFunction};
use vmforge_linker::{Linker, LinkerConfig};
use vmforge_takeover::Takeover;

/// Name the loaded companion image is cached and dispatched under. A single
/// process protects a single companion library, so this name is an internal
/// constant rather than something callers choose.
const COMPANION_SO_NAME: &str = "vmforge-companion";

const STATE_UNINITIALIZED: u8 = 0;
const STATE_INITIALIZING: u8 = 1;
const STATE_READY: u8 = 2;
const STATE_FAILED: u8 = 3;

static STATE: AtomicU8 = AtomicU8::new(STATE_UNINITIALIZED);
static INIT_LOCK: Mutex<()> = Mutex::new(());
static LOGGER: OnceCell<()> = OnceCell::new();

struct Runtime {
    #[allow(dead_code)] // kept alive for its mmap reservations; never queried directly
    linker: Linker,
    engine: Engine,
    takeover: Takeover,
}

static RUNTIME: Lazy<RwLock<Option<Runtime>>> = Lazy::new(|| RwLock::new(None));

fn ensure_logger() {
    LOGGER.get_or_init(|| {
        let _ = env_logger::try_init();
    });
}

/// Where to find the patched library's own file. Overridable for tests and
/// alternate packaging layouts; production defaults to `current_exe()`
/// since the usual layout appends the companion image directly to the
/// library whose constructor calls [`vm_init`].
fn companion_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("VMFORGE_COMPANION_PATH") {
        return Ok(PathBuf::from(path));
    }
    Ok(std::env::current_exe()?)
}

/// Two packaging layouts are supported: the loaded file already *is* the
/// companion image with a bundle tail-appended directly, or it is a host
/// library with a companion image embedded via the `VME4` footer. Either
/// way, `.dynsym` recovery and engine symbol resolution run against
/// whichever image the bundle was read out of.
fn load_companion(path: &Path) -> anyhow::Result<Runtime> {
    let host_bytes = std::fs::read(path)?;

    let companion_bytes = match vmforge_container::parse_embedded_payload_tail(&host_bytes) {
        FooterStatus::Found { payload, .. } => payload,
        FooterStatus::Invalid(msg) => anyhow::bail!("embedded payload footer invalid: {msg}"),
        FooterStatus::NotFound => host_bytes,
    };

    let bundle = BundleReader::read(&companion_bytes)?;

    let linker = Linker::new(LinkerConfig::default());
    let so = linker.load(COMPANION_SO_NAME, &companion_bytes)?;

    let engine = Engine::new();
    for entry in &bundle.entries {
        let encoded = EncodedFunction::deserialize_encoded(&entry.encoded_data)?;
        let rf = RuntimeFunction::from_encoded(&encoded)?;
        log::trace!(
            "cached function {:#x} ({} inst words) from {}",
            entry.fun_addr,
            rf.inst_words.len(),
            COMPANION_SO_NAME
        );
        engine.cache_function(COMPANION_SO_NAME, Arc::new(rf));
    }
    engine.set_shared_branch_addrs(COMPANION_SO_NAME, bundle.shared_branch_addrs.clone());

    let takeover = Takeover::new();
    let recovered = vmforge_takeover::recover_slot_mapping(&so)?;
    log::debug!("recovered {} takeover slot(s) from .dynsym", recovered.len());
    takeover.init(COMPANION_SO_NAME, &recovered)?;

    Ok(Runtime {
        linker,
        engine,
        takeover,
    })
}

/// Runs the full init sequence exactly once, serialized by `INIT_LOCK`.
/// Returns `true` on `Ready`, `false` on `Failed`; both are terminal until
/// [`vm_clear_all`] resets the singleton (test builds only).
fn init_once() -> bool {
    let fast = STATE.load(Ordering::Acquire);
    if fast == STATE_READY {
        return true;
    }
    if fast == STATE_FAILED {
        return false;
    }

    let _guard = INIT_LOCK.lock();
    // Re-check: another thread may have finished the sequence while we
    // waited for the lock.
    match STATE.load(Ordering::Acquire) {
        STATE_READY => return true,
        STATE_FAILED => return false,
        _ => {}
    }

    ensure_logger();
    STATE.store(STATE_INITIALIZING, Ordering::Release);

    let outcome = companion_path().and_then(|path| load_companion(&path));
    match outcome {
        Ok(runtime) => {
            *RUNTIME.write() = Some(runtime);
            STATE.store(STATE_READY, Ordering::Release);
            true
        }
        Err(e) => {
            log::error!("vmforge init failed: {e:#}");
            STATE.store(STATE_FAILED, Ordering::Release);
            false
        }
    }
}

/// Returns 1 on `Ready`, 0 on `Failed`. Idempotent: repeated calls after the
/// first terminal state just report it.
#[no_mangle]
pub extern "C" fn vm_init() -> i32 {
    if init_once() {
        1
    } else {
        0
    }
}

/// Returns the current state: 0 `Uninitialized`, 1 `Initializing`,
/// 2 `Ready`, 3 `Failed`.
#[no_mangle]
pub extern "C" fn vm_get_init_state() -> i32 {
    STATE.load(Ordering::Acquire) as i32
}

/// Entry point every `vm_takeover_slot_NNNN` trampoline calls. Attempts
/// lazy init if not yet ready; returns 0 (logged, never panics) on any
/// failure or unknown `slot_id`.
#[no_mangle]
pub extern "C" fn vm_takeover_dispatch_by_id(a: i32, b: i32, slot_id: u32) -> i32 {
    if STATE.load(Ordering::Acquire) != STATE_READY && !init_once() {
        return 0;
    }
    let guard = RUNTIME.read();
    match guard.as_ref() {
        Some(rt) => rt.takeover.dispatch_by_id(&rt.engine, a, b, slot_id),
        None => 0,
    }
}

/// Re-enters the `Uninitialized` state, dropping the loaded companion
/// image and clearing all caches. Test-only: a running process never tears
/// down its own protection this way.
#[cfg(any(test, feature = "test-utils"))]
#[no_mangle]
pub extern "C" fn vm_clear_all() {
    let _guard = INIT_LOCK.lock();
    *RUNTIME.write() = None;
    STATE.store(STATE_UNINITIALIZED, Ordering::Release);
}
