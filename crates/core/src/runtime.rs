//! Finds the ONNX Runtime shared library for ort's `load-dynamic` mode and
//! preloads the GPU libraries its execution providers link against.

use std::collections::{BTreeMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

pub const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";
/// Extra directory searched before the built-in locations.
pub const LIB_DIR_ENV: &str = "TILESR_LIB_DIR";

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

/// GPU runtime libraries grouped by the order they must be loaded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum LibTier {
    CudaRuntime,
    Cudnn,
    TensorRt,
}

#[cfg(unix)]
const TIER_PREFIXES: &[(&str, LibTier)] = &[
    ("libcudart", LibTier::CudaRuntime),
    ("libcublas", LibTier::CudaRuntime),
    ("libcufft", LibTier::CudaRuntime),
    ("libcurand", LibTier::CudaRuntime),
    ("libcudnn", LibTier::Cudnn),
    ("libnvinfer", LibTier::TensorRt),
    ("libnvonnxparser", LibTier::TensorRt),
];

#[cfg(windows)]
const TIER_PREFIXES: &[(&str, LibTier)] = &[
    ("cudart64_", LibTier::CudaRuntime),
    ("cublas64_", LibTier::CudaRuntime),
    ("cublaslt64_", LibTier::CudaRuntime),
    ("cudnn64_", LibTier::Cudnn),
    ("nvinfer", LibTier::TensorRt),
    ("nvonnxparser", LibTier::TensorRt),
];

/// Tier of a GPU runtime library, `None` for files that are not preloaded.
///
/// ORT's own provider libraries need symbols from `libonnxruntime`, so they
/// never match.
fn lib_tier(file_name: &str) -> Option<LibTier> {
    let lower = file_name.to_ascii_lowercase();
    TIER_PREFIXES
        .iter()
        .find(|(prefix, _)| lower.starts_with(prefix))
        .map(|&(_, tier)| tier)
}

#[cfg(unix)]
fn is_shared_lib(path: &Path) -> bool {
    // Versioned sonames are symlinks to the real file, which is listed too.
    !path.is_symlink()
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.contains(".so"))
}

#[cfg(windows)]
fn is_shared_lib(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

/// Directories searched for runtime libraries, most specific first:
/// `$TILESR_LIB_DIR`, then `lib/` next to and above the executable, then
/// `./lib`, then the system library directories.
fn search_dirs(lib_dir_override: Option<PathBuf>) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = lib_dir_override.into_iter().collect();

    let exe_dir = env::current_exe()
        .and_then(|p| p.canonicalize())
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    if let Some(exe_dir) = exe_dir {
        if cfg!(windows) {
            dirs.push(exe_dir.clone());
        }
        dirs.push(exe_dir.join("lib"));
        if let Some(prefix) = exe_dir.parent() {
            dirs.push(prefix.join("lib"));
        }
    }
    if let Ok(cwd) = env::current_dir() {
        dirs.push(cwd.join("lib"));
    }
    if cfg!(unix) {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }

    let mut unique = Vec::with_capacity(dirs.len());
    for dir in dirs {
        if !unique.contains(&dir) {
            unique.push(dir);
        }
    }
    unique
}

fn locate_ort_dylib(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// GPU libraries to preload, ordered by tier then file name. A file name
/// seen in an earlier directory shadows later copies.
fn preload_plan(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut plan: BTreeMap<(LibTier, String), PathBuf> = BTreeMap::new();
    let mut seen = HashSet::new();

    for dir in dirs {
        let Ok(read_dir) = std::fs::read_dir(dir) else {
            continue;
        };
        for path in read_dir.flatten().map(|entry| entry.path()) {
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !is_shared_lib(&path) || !seen.insert(file_name.to_string()) {
                continue;
            }
            if let Some(tier) = lib_tier(file_name) {
                plan.insert((tier, file_name.to_string()), path);
            }
        }
    }

    plan.into_values().collect()
}

/// Opens `path` with global symbol visibility and keeps it loaded for the
/// life of the process.
#[cfg(unix)]
unsafe fn preload(path: &Path) -> bool {
    use libloading::os::unix::{Library, RTLD_GLOBAL, RTLD_LAZY};
    Library::open(Some(path), RTLD_LAZY | RTLD_GLOBAL)
        .map(std::mem::forget)
        .is_ok()
}

#[cfg(windows)]
unsafe fn preload(path: &Path) -> bool {
    libloading::Library::new(path).map(std::mem::forget).is_ok()
}

/// Sets `ORT_DYLIB_PATH` when a bundled ONNX Runtime is found and preloads
/// the CUDA, cuDNN and TensorRT libraries in dependency order.
///
/// Runs before logging is set up, so it only reports the preload count;
/// pass it to [`log_runtime_lib_status`] once tracing is live.
pub fn setup_runtime_libs() -> usize {
    let dirs = search_dirs(env::var_os(LIB_DIR_ENV).map(PathBuf::from));

    if env::var_os(ORT_DYLIB_ENV).is_none() {
        if let Some(path) = locate_ort_dylib(&dirs) {
            env::set_var(ORT_DYLIB_ENV, &path);
        }
    }

    preload_plan(&dirs)
        .iter()
        .filter(|path| unsafe { preload(path) })
        .count()
}

pub fn log_runtime_lib_status(preloaded: usize) {
    match env::var(ORT_DYLIB_ENV) {
        Ok(ort) if Path::new(&ort).is_file() => info!("ONNX Runtime library: {ort}"),
        Ok(ort) => warn!("{ORT_DYLIB_ENV} points to {ort}, which does not exist"),
        Err(_) => warn!("No bundled ONNX Runtime found, relying on the system loader"),
    }
    debug!(preloaded, "GPU runtime libraries preloaded");
}
