//! Construction-time configuration of a [`crate::MethodRewriter`].

use std::ffi::OsString;

/// Environment variable which, if set to any value, disables the process-wide method info
/// cache for every rewriter configured through [`RewriterConfig::from_env`]
pub const DISABLE_METHOD_CACHE_ENV: &str = "ILWEAVE_DISABLE_METHOD_CACHE";

/// The runtime helper the cached method lookup calls.
///
/// Takes the cache key, the assembly path, the class name, the method name and an optional
/// array of parameter types, and returns the resolved `MethodInfo` or throws.
pub const DEFAULT_CACHE_HELPER: &str = "class [mscorlib]System.Reflection.MethodInfo [ilweave.Runtime]ilweave.Runtime.MethodInfoCache::GetOrResolve(string, string, string, string, class [mscorlib]System.Type[])";

/// Options a rewriter is created with.
///
/// The rewriter never reads ambient process state itself; everything that influences the
/// emitted code is in here.
///
/// # Examples
///
/// ```rust
/// use ilweave::RewriterConfig;
///
/// let config = RewriterConfig {
///     disable_method_cache: true,
///     ..RewriterConfig::default()
/// };
/// assert!(config.disable_method_cache);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriterConfig {
    /// Route every method lookup through full reflection, ignoring the cache flag of the caller
    pub disable_method_cache: bool,
    /// Emit null checks printing a diagnostic after reflective lookups
    pub diagnostics: bool,
    /// Member signature of the runtime helper used by cached method lookups
    pub cache_helper: String,
}

impl RewriterConfig {
    /// The default configuration, with the cache toggle taken from
    /// [`DISABLE_METHOD_CACHE_ENV`].
    #[must_use]
    pub fn from_env() -> Self {
        Self::with_cache_toggle(std::env::var_os(DISABLE_METHOD_CACHE_ENV))
    }

    fn with_cache_toggle(value: Option<OsString>) -> Self {
        RewriterConfig {
            disable_method_cache: value.is_some(),
            ..Self::default()
        }
    }
}

impl Default for RewriterConfig {
    fn default() -> Self {
        RewriterConfig {
            disable_method_cache: false,
            diagnostics: cfg!(debug_assertions),
            cache_helper: DEFAULT_CACHE_HELPER.to_string(),
        }
    }
}
