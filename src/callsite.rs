//! Attributing statements to the application code that issued them.

use std::backtrace::Backtrace;

use once_cell::sync::Lazy;
use regex::Regex;

// "      at /home/app/src/handlers.rs:42:17" in a `{:#}`-formatted backtrace
static FRAME_LOCATION_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*at\s+(.+?):(\d+)(?::\d+)?\s*$").unwrap());

/// Frames from this crate's own sources are plumbing, never the call site.
const OWN_SOURCES: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/src/");

/// Produces the call site of the statement being recorded.
pub trait CallSiteResolver: Send + Sync {
    /// `"<file>:<line>"` frames, innermost first. Empty when unavailable.
    fn resolve(&self) -> Vec<String>;
}

/// Never attributes anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopResolver;

impl CallSiteResolver for NoopResolver {
    fn resolve(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Walks the current stack with [`std::backtrace`].
///
/// Needs debug info to report file and line; without it every capture
/// resolves to an empty list.
#[derive(Debug, Clone)]
pub struct BacktraceResolver {
    excluded: Vec<String>,
    limit: Option<usize>,
}

impl BacktraceResolver {
    pub fn new(excluded: Vec<String>, limit: Option<usize>) -> Self {
        let mut excluded: Vec<String> = excluded.into_iter().map(|p| normalize(&p)).collect();
        excluded.push(normalize(OWN_SOURCES));
        Self { excluded, limit }
    }

    fn is_excluded(&self, file: &str) -> bool {
        self.excluded.iter().any(|marker| file.contains(marker.as_str()))
    }

    /// Filter an already formatted backtrace.
    pub fn filter_frames(&self, rendered: &str) -> Vec<String> {
        let frames = rendered
            .lines()
            .filter_map(|line| FRAME_LOCATION_REGEX.captures(line))
            .filter_map(|caps| {
                let file = normalize(caps.get(1)?.as_str());
                let line = caps.get(2)?.as_str();
                (!self.is_excluded(&file)).then(|| format!("{file}:{line}"))
            });

        match self.limit {
            Some(limit) => frames.take(limit).collect(),
            None => frames.collect(),
        }
    }
}

impl Default for BacktraceResolver {
    fn default() -> Self {
        Self::new(
            crate::config::DEFAULT_EXCLUDED_PATHS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            None,
        )
    }
}

impl CallSiteResolver for BacktraceResolver {
    fn resolve(&self) -> Vec<String> {
        let backtrace = Backtrace::force_capture();
        self.filter_frames(&format!("{backtrace:#}"))
    }
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    const RENDERED: &str = r"   0: std::backtrace::Backtrace::force_capture
             at /rustc/90b35a6239c3d8bdabc530a6a0816f7ff89a0aaf/library/std/src/backtrace.rs:312:13
   1: sea_orm_debugger::callsite::BacktraceResolver::resolve
             at /home/dev/.cargo/registry/src/index.crates.io-6f17d22bba15001f/sea-orm-debugger-0.1.0/src/callsite.rs:80:25
   2: shop::orders::list::{{closure}}
             at /srv/shop/src/orders.rs:57:22
   3: shop::orders::load_items
             at C:\srv\shop\src\items.rs:12
   4: axum::handler::Handler::call::{{closure}}
             at /home/dev/.cargo/registry/src/index.crates.io-6f17d22bba15001f/axum-0.8.1/src/handler/mod.rs:221:52
   5: shop::main::{{closure}}
             at /srv/shop/src/main.rs:20:5
   6: tokio::runtime::park::CachedParkThread::block_on
             at /home/dev/.cargo/git/checkouts/tokio-1a2b/src/runtime/park.rs:281:63
   7: __libc_start_main
   8: _start";

    #[test]
    fn test_filters_dependency_frames() {
        let resolver = BacktraceResolver::default();
        assert_eq!(
            resolver.filter_frames(RENDERED),
            vec![
                "/srv/shop/src/orders.rs:57",
                "C:/srv/shop/src/items.rs:12",
                "/srv/shop/src/main.rs:20",
            ]
        );
    }

    #[test]
    fn test_limit_keeps_innermost() {
        let resolver = BacktraceResolver::new(Vec::new(), Some(1));
        let frames = resolver.filter_frames(RENDERED);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].ends_with("/library/std/src/backtrace.rs:312"));
    }

    #[test]
    fn test_custom_marker() {
        let resolver = BacktraceResolver::new(vec!["/srv/shop/src/main.rs".into()], None);
        let frames = resolver.filter_frames(RENDERED);
        assert!(!frames.iter().any(|f| f.contains("main.rs")));
        assert!(frames.iter().any(|f| f.contains("orders.rs")));
    }

    #[test]
    fn test_no_qualifying_frames() {
        let resolver = BacktraceResolver::default();
        assert!(resolver.filter_frames("   0: __libc_start_main\n   1: _start").is_empty());
        assert!(NoopResolver.resolve().is_empty());
    }

    #[test]
    fn test_live_capture_skips_std_and_own_sources() {
        let frames = BacktraceResolver::default().resolve();
        assert!(frames.iter().all(|f| !f.contains("/rustc/")));
        assert!(frames.iter().all(|f| !f.contains("/src/callsite.rs")));
    }
}
