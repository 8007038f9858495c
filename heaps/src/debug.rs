//! Call-site capture and leak-report diagnostics.
//!
//! Call-site capture (spec §6.2) is gated behind the `debug-tracking`
//! feature and grounded in the source's `__DEBUG`-only `fn`/`line` fields
//! on `xlh_node_t`/`xss_node_t`
//! (`examples/original_source/heaps/xlclhp/src/xtc_lclhp.h`,
//! `.../xsyshp/src/xtc_syshp.h`) and its `xlh_alloc_dbg`/`xss_alloc_dbg`
//! entry points, which capture `__FILE__`/`__LINE__` at the call site.
//! `#[track_caller]` plus `core::panic::Location::caller()` is the
//! idiomatic Rust equivalent of that same capability — the original's
//! preprocessor trick replaced with the language's own mechanism.
//!
//! Leak reporting (spec §7's `Leak` taxonomy entry, the only diagnostic
//! output the allocator is allowed to produce) is routed through the `log`
//! facade when the `logging` feature is enabled, matching the optional
//! `log`-behind-a-feature pattern used by several kernel/allocator crates
//! in the wider corpus (e.g. `gitrustux-kernel`'s `logging = ["log"]`).

use core::fmt;

/// Where an allocation was made from, captured only when `debug-tracking`
/// is enabled.
#[derive(Debug, Clone, Copy)]
pub struct CallSite {
    file: &'static str,
    line: u32,
}

impl CallSite {
    #[inline]
    #[track_caller]
    pub(crate) fn here() -> CallSite {
        let loc = core::panic::Location::caller();
        CallSite {
            file: loc.file(),
            line: loc.line(),
        }
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Emit the one permitted diagnostic: a leak warning when `end()` finds
/// live blocks remaining. `kind` names the backend (e.g. `"TrackingHeap"`).
pub(crate) fn report_leak(kind: &str, count: usize) {
    #[cfg(feature = "logging")]
    {
        log::warn!("{}: {} block(s) leaked at end()", kind, count);
        return;
    }

    #[cfg(all(not(feature = "logging"), feature = "std"))]
    {
        std::eprintln!("{}: {} block(s) leaked at end()", kind, count);
        return;
    }

    #[cfg(not(any(feature = "logging", feature = "std")))]
    {
        let _ = (kind, count);
    }
}

/// Emit one line of a live-block dump (spec §6.2's `dump` operation).
pub(crate) fn report_block(payload: *const u8, requested: usize, effective: usize, site: Option<CallSite>) {
    #[cfg(feature = "logging")]
    {
        match site {
            Some(site) => log::warn!(
                "  {:p}: requested {} byte(s), {} effective, allocated at {}",
                payload,
                requested,
                effective,
                site
            ),
            None => log::warn!(
                "  {:p}: requested {} byte(s), {} effective",
                payload,
                requested,
                effective
            ),
        }
        return;
    }

    #[cfg(all(not(feature = "logging"), feature = "std"))]
    {
        match site {
            Some(site) => std::eprintln!(
                "  {:p}: requested {} byte(s), {} effective, allocated at {}",
                payload,
                requested,
                effective,
                site
            ),
            None => std::eprintln!(
                "  {:p}: requested {} byte(s), {} effective",
                payload,
                requested,
                effective
            ),
        }
        return;
    }

    #[cfg(not(any(feature = "logging", feature = "std")))]
    {
        let _ = (payload, requested, effective, site);
    }
}
