//! Native plugin loader
//!
//! Loads reporter plugins from dynamic libraries over a small C ABI:
//!
//! ```c
//! int initialize(char *cfg_path);
//! int report_fronts(char **addrs, int len);
//! int destroy(void);
//! int join(void);
//! ```
//!
//! Every function returns zero on success. The library handle stays alive
//! for as long as the plugin container holds references into it.

use std::ffi::{c_char, c_int, CString};
use std::path::{Path, PathBuf};

use libloading::Library;
use tracing::{error, info};

use crate::error::{Error, Result};
use crate::FrontPlugin;

type InitFn = unsafe extern "C" fn(*const c_char) -> c_int;
type ReportFn = unsafe extern "C" fn(*const *const c_char, c_int) -> c_int;
type PlainFn = unsafe extern "C" fn() -> c_int;

const INIT_SYMBOL: &[u8] = b"initialize\0";
const REPORT_SYMBOL: &[u8] = b"report_fronts\0";
const DESTROY_SYMBOL: &[u8] = b"destroy\0";
const JOIN_SYMBOL: &[u8] = b"join\0";

/// Resolve the platform file name of a plugin library under `dir`.
pub fn native_lib_path(dir: &Path, name: &str) -> PathBuf {
    let file = if cfg!(target_os = "windows") {
        format!("{name}.dll")
    } else if cfg!(target_os = "macos") {
        format!("lib{name}.dylib")
    } else {
        format!("lib{name}.so")
    };

    dir.join(file)
}

#[derive(Debug)]
pub(crate) struct NativePlugin {
    path: PathBuf,
    init_fn: InitFn,
    report_fn: ReportFn,
    destroy_fn: PlainFn,
    join_fn: PlainFn,
    _lib: Library,
}

impl NativePlugin {
    pub(crate) fn load(dir: &Path, name: &str) -> Result<Self> {
        let path = native_lib_path(dir, name);

        let lib = unsafe { Library::new(&path) }
            .map_err(|e| Error::OpenLib(format!("{}: {e}", path.display())))?;

        let symbol = |raw: &[u8]| {
            String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned()
        };

        // copy the raw fn pointers out; `_lib` keeps them valid
        let init_fn = unsafe {
            *lib.get::<InitFn>(INIT_SYMBOL)
                .map_err(|_| Error::SymbolNotFound(symbol(INIT_SYMBOL)))?
        };
        let report_fn = unsafe {
            *lib.get::<ReportFn>(REPORT_SYMBOL)
                .map_err(|_| Error::SymbolNotFound(symbol(REPORT_SYMBOL)))?
        };
        let destroy_fn = unsafe {
            *lib.get::<PlainFn>(DESTROY_SYMBOL)
                .map_err(|_| Error::SymbolNotFound(symbol(DESTROY_SYMBOL)))?
        };
        let join_fn = unsafe {
            *lib.get::<PlainFn>(JOIN_SYMBOL)
                .map_err(|_| Error::SymbolNotFound(symbol(JOIN_SYMBOL)))?
        };

        info!(path = %path.display(), "native plugin loaded");

        Ok(Self {
            path,
            init_fn,
            report_fn,
            destroy_fn,
            join_fn,
            _lib: lib,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl FrontPlugin for NativePlugin {
    fn init(&self, cfg_path: &str) -> Result<()> {
        let cfg = CString::new(cfg_path)
            .map_err(|e| Error::OpenLib(format!("config path: {e}")))?;

        let rtn = unsafe { (self.init_fn)(cfg.as_ptr()) };
        if rtn != 0 {
            return Err(Error::InitFailed(rtn));
        }

        Ok(())
    }

    fn report_fronts(&self, fronts: &[String]) -> Result<()> {
        let owned: Vec<CString> = fronts
            .iter()
            .map(|addr| CString::new(addr.as_str()))
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| Error::ReportFailed(-1))?;

        let ptrs: Vec<*const c_char> = owned.iter().map(|s| s.as_ptr()).collect();

        let rtn = unsafe { (self.report_fn)(ptrs.as_ptr(), ptrs.len() as c_int) };
        if rtn != 0 {
            return Err(Error::ReportFailed(rtn));
        }

        Ok(())
    }

    fn stop(&self) {
        let rtn = unsafe { (self.destroy_fn)() };
        if rtn != 0 {
            error!(rtn, path = %self.path.display(), "plugin destroy failed");
        }
    }

    fn join(&self) -> Result<()> {
        let rtn = unsafe { (self.join_fn)() };
        if rtn != 0 {
            return Err(Error::JoinFailed(rtn));
        }

        Ok(())
    }
}
